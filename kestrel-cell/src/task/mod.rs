//! Request executors.
//!
//! One executor per request kind; the create-instance executor carries
//! the staged pipeline, everything else is parse, one or two module
//! calls, reply.

use std::sync::Arc;
use std::time::Duration;

use kestrel_hypervisor::{CellError, Result};
use tracing::warn;
use uuid::Uuid;

use crate::instance::InstanceHandle;
use crate::network::NetworkHandle;
use crate::protocol::{Message, MessageKind, MessageSender, ParamKey};
use crate::storage::StorageHandle;
use crate::transaction::TransactionEngine;

pub mod address_pool;
pub mod cell_info;
pub mod create_instance;
pub mod delete_instance;
pub mod get_instance;
pub mod media;
pub mod modify_instance;
pub mod power;
pub mod snapshot;
pub mod volume;

/// Everything an executor may need, wired once at startup.
#[derive(Clone)]
pub struct CellModules {
    pub sender: Arc<dyn MessageSender>,
    pub instance: InstanceHandle,
    pub storage: StorageHandle,
    pub network: NetworkHandle,
    pub operate_timeout: Duration,
}

/// Mark a reply failed and send it.
pub(crate) fn respond_fail(
    sender: &dyn MessageSender,
    mut response: Message,
    error: &CellError,
    target: &str,
) -> Result<()> {
    response.mark_failed(error.to_string());
    sender.send(response, target)
}

/// The guest UUID carried in the `Instance` parameter.
pub(crate) fn instance_param(request: &Message) -> Result<Uuid> {
    let raw = request.get_string(ParamKey::Instance)?;
    raw.parse()
        .map_err(|_| CellError::InvalidInput(format!("invalid instance id '{raw}'")))
}

/// Release a guest's instance, storage and network legs in order; each
/// leg logs and swallows its own error.
pub(crate) async fn release_resource(
    modules: &CellModules,
    session: crate::protocol::SessionId,
    guest: Uuid,
    clear_network: bool,
    clear_volumes: bool,
    clear_instance: bool,
) {
    if clear_instance {
        if let Err(err) = modules.instance.delete_instance(guest).await {
            warn!(session = format_args!("{session:08X}"), guest = %guest, error = %err, "release instance failed");
        }
    }
    if clear_volumes {
        if let Err(err) = modules.storage.delete_volumes(guest).await {
            warn!(session = format_args!("{session:08X}"), guest = %guest, error = %err, "release volumes failed");
        }
    }
    if clear_network {
        if let Err(err) = modules.network.deallocate_all_resource(guest).await {
            warn!(session = format_args!("{session:08X}"), guest = %guest, error = %err, "release network failed");
        }
    }
}

/// Register every executor with the engine.
pub fn register_executors(engine: &mut TransactionEngine, modules: CellModules) -> Result<()> {
    use MessageKind::*;

    engine.register(
        GetComputePoolCellRequest,
        Arc::new(cell_info::GetCellInfoExecutor::new(modules.clone())),
    )?;
    engine.register(
        CreateGuestRequest,
        Arc::new(create_instance::CreateInstanceExecutor::new(modules.clone())),
    )?;
    engine.register(
        DeleteGuestRequest,
        Arc::new(delete_instance::DeleteInstanceExecutor::new(modules.clone())),
    )?;
    engine.register(
        GetGuestRequest,
        Arc::new(get_instance::GetInstanceConfigExecutor::new(modules.clone())),
    )?;
    engine.register(
        GetInstanceStatusRequest,
        Arc::new(get_instance::GetInstanceStatusExecutor::new(modules.clone())),
    )?;
    engine.register(
        StartInstanceRequest,
        Arc::new(power::StartInstanceExecutor::new(modules.clone())),
    )?;
    engine.register(
        StopInstanceRequest,
        Arc::new(power::StopInstanceExecutor::new(modules.clone())),
    )?;
    engine.register(
        AttachInstanceRequest,
        Arc::new(volume::AttachInstanceExecutor::new(modules.clone())),
    )?;
    engine.register(
        DetachInstanceRequest,
        Arc::new(volume::DetachInstanceExecutor::new(modules.clone())),
    )?;
    engine.register(
        ModifyGuestNameRequest,
        Arc::new(modify_instance::ModifyGuestNameExecutor::new(modules.clone())),
    )?;
    engine.register(
        ModifyCoreRequest,
        Arc::new(modify_instance::ModifyGuestCoreExecutor::new(modules.clone())),
    )?;
    engine.register(
        ModifyMemoryRequest,
        Arc::new(modify_instance::ModifyGuestMemoryExecutor::new(modules.clone())),
    )?;
    engine.register(
        ModifyPriorityRequest,
        Arc::new(modify_instance::ModifyCpuPriorityExecutor::new(modules.clone())),
    )?;
    engine.register(
        ModifyDiskThresholdRequest,
        Arc::new(modify_instance::ModifyDiskThresholdExecutor::new(modules.clone())),
    )?;
    engine.register(
        ModifyNetworkThresholdRequest,
        Arc::new(modify_instance::ModifyNetworkThresholdExecutor::new(modules.clone())),
    )?;
    engine.register(
        ModifyAuthRequest,
        Arc::new(modify_instance::ModifyGuestPasswordExecutor::new(modules.clone())),
    )?;
    engine.register(
        GetAuthRequest,
        Arc::new(get_instance::GetGuestPasswordExecutor::new(modules.clone())),
    )?;
    engine.register(
        ResetSystemRequest,
        Arc::new(volume::ResetGuestSystemExecutor::new(modules.clone())),
    )?;
    engine.register(
        InsertMediaRequest,
        Arc::new(media::InsertMediaExecutor::new(modules.clone())),
    )?;
    engine.register(
        EjectMediaRequest,
        Arc::new(media::EjectMediaExecutor::new(modules.clone())),
    )?;
    engine.register(
        CreateDiskImageRequest,
        Arc::new(volume::CreateDiskImageExecutor::new(modules.clone())),
    )?;
    engine.register(
        ResizeDiskRequest,
        Arc::new(volume::ResizeGuestVolumeExecutor::new(modules.clone())),
    )?;
    engine.register(
        ShrinkDiskRequest,
        Arc::new(volume::ShrinkGuestVolumeExecutor::new(modules.clone())),
    )?;
    engine.register(
        QuerySnapshotRequest,
        Arc::new(snapshot::QuerySnapshotExecutor::new(modules.clone())),
    )?;
    engine.register(
        GetSnapshotRequest,
        Arc::new(snapshot::GetSnapshotExecutor::new(modules.clone())),
    )?;
    engine.register(
        CreateSnapshotRequest,
        Arc::new(snapshot::CreateSnapshotExecutor::new(modules.clone())),
    )?;
    engine.register(
        DeleteSnapshotRequest,
        Arc::new(snapshot::DeleteSnapshotExecutor::new(modules.clone())),
    )?;
    engine.register(
        RestoreSnapshotRequest,
        Arc::new(snapshot::RestoreSnapshotExecutor::new(modules.clone())),
    )?;
    engine.register(
        ResetSecretRequest,
        Arc::new(modify_instance::ResetMonitorSecretExecutor::new(modules.clone())),
    )?;
    engine.register(
        QueryCellStorageRequest,
        Arc::new(cell_info::QueryStoragePathsExecutor::new(modules.clone())),
    )?;
    engine.register(
        ModifyCellStorageRequest,
        Arc::new(cell_info::ChangeStoragePathsExecutor::new(modules.clone())),
    )?;
    engine.register(
        ComputePoolReadyEvent,
        Arc::new(cell_info::HandleComputePoolReadyExecutor::new(modules.clone())),
    )?;
    engine.register(
        ComputeCellRemovedEvent,
        Arc::new(cell_info::HandleComputeCellRemovedExecutor::new(modules.clone())),
    )?;
    engine.register(
        AddressPoolChangedEvent,
        Arc::new(address_pool::HandleAddressPoolChangedExecutor::new(modules)),
    )?;
    Ok(())
}
