//! Cell-level executors: the cell report, storage paths and cluster
//! lifecycle events.

use async_trait::async_trait;
use kestrel_hypervisor::{CellError, Result};
use tracing::{info, warn};

use crate::protocol::{Message, MessageKind, ParamKey, SessionId};
use crate::task::{respond_fail, CellModules};
use crate::transaction::Executor;

pub struct GetCellInfoExecutor {
    modules: CellModules,
}

impl GetCellInfoExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for GetCellInfoExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response =
            Message::response_to(&request, MessageKind::GetComputePoolCellResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let network = self.modules.network.get_current_config().await?;
            let pools = self.modules.storage.list_pools().await?;
            let instances = self.modules.instance.list_instances().await?;
            Ok::<_, CellError>((network, pools, instances))
        }
        .await;

        match outcome {
            Ok((network, pools, instances)) => {
                response.set_string(ParamKey::Host, network.bridge);
                response.set_string_array(
                    ParamKey::Pool,
                    pools.iter().map(|pool| pool.name.clone()).collect(),
                );
                response.set_string_array(
                    ParamKey::Path,
                    pools
                        .iter()
                        .map(|pool| pool.path.to_string_lossy().to_string())
                        .collect(),
                );
                response.set_string_array(
                    ParamKey::Instance,
                    instances
                        .iter()
                        .map(|instance| instance.id.to_string())
                        .collect(),
                );
                response.success = true;
                self.modules.sender.send(response, &target)
            }
            Err(err) => respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        }
    }
}

pub struct QueryStoragePathsExecutor {
    modules: CellModules,
}

impl QueryStoragePathsExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for QueryStoragePathsExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response =
            Message::response_to(&request, MessageKind::QueryCellStorageResponse, session);
        let target = request.sender.clone();

        match self.modules.storage.query_paths().await {
            Ok(paths) => {
                response.set_string_array(
                    ParamKey::Pool,
                    paths.iter().map(|(name, _)| name.clone()).collect(),
                );
                response.set_string_array(
                    ParamKey::Path,
                    paths
                        .iter()
                        .map(|(_, path)| path.to_string_lossy().to_string())
                        .collect(),
                );
                response.success = true;
                self.modules.sender.send(response, &target)
            }
            Err(err) => respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        }
    }
}

pub struct ChangeStoragePathsExecutor {
    modules: CellModules,
}

impl ChangeStoragePathsExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for ChangeStoragePathsExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response =
            Message::response_to(&request, MessageKind::ModifyCellStorageResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let pool = request.get_string(ParamKey::Pool)?;
            let path = request.get_string(ParamKey::Path)?;
            self.modules.storage.change_paths(pool.clone(), path.into()).await?;
            info!(session = format_args!("{session:08X}"), pool = %pool, "storage path changed");
            Ok::<_, CellError>(())
        }
        .await;

        match outcome {
            Ok(()) => {
                response.success = true;
                self.modules.sender.send(response, &target)
            }
            Err(err) => respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        }
    }
}

/// The owning compute pool came online; nothing to allocate, but worth a
/// line in the journal.
pub struct HandleComputePoolReadyExecutor {
    modules: CellModules,
}

impl HandleComputePoolReadyExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for HandleComputePoolReadyExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let pool = request.get_string(ParamKey::Pool).unwrap_or_default();
        let pools = self.modules.storage.list_pools().await?;
        info!(
            session = format_args!("{session:08X}"),
            pool = %pool,
            local_pools = pools.len(),
            "compute pool ready"
        );
        Ok(())
    }
}

/// This cell was removed from its pool: every guest and its resources go
/// away, best effort.
pub struct HandleComputeCellRemovedExecutor {
    modules: CellModules,
}

impl HandleComputeCellRemovedExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for HandleComputeCellRemovedExecutor {
    async fn execute(&self, session: SessionId, _request: Message) -> Result<()> {
        let instances = self.modules.instance.list_instances().await?;
        info!(
            session = format_args!("{session:08X}"),
            count = instances.len(),
            "cell removed from pool, releasing guests"
        );
        for config in instances {
            let id = config.id;
            if let Ok(status) = self.modules.instance.get_status(id).await {
                if status.running {
                    if let Err(err) = self.modules.instance.stop_instance(id, false, true).await {
                        warn!(session = format_args!("{session:08X}"), guest = %id, error = %err, "force stop failed");
                    }
                }
            }
            if let Err(err) = self.modules.instance.delete_instance(id).await {
                warn!(session = format_args!("{session:08X}"), guest = %id, error = %err, "delete instance failed");
            }
            if let Err(err) = self.modules.storage.delete_volumes(id).await {
                warn!(session = format_args!("{session:08X}"), guest = %id, error = %err, "delete volumes failed");
            }
            if let Err(err) = self.modules.network.deallocate_all_resource(id).await {
                warn!(session = format_args!("{session:08X}"), guest = %id, error = %err, "release network failed");
            }
        }
        Ok(())
    }
}
