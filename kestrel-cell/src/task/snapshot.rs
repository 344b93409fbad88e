//! Snapshot executors.

use async_trait::async_trait;
use kestrel_hypervisor::{CellError, Result};
use tracing::info;
use uuid::Uuid;

use crate::protocol::{Message, MessageKind, ParamKey, SessionId};
use crate::task::{instance_param, respond_fail, CellModules};
use crate::transaction::Executor;

/// Snapshot file work rewrites the backing chain; a running guest would
/// race the live image.
async fn require_stopped(modules: &CellModules, id: Uuid) -> Result<()> {
    let status = modules.instance.get_status(id).await?;
    if status.running {
        return Err(CellError::Busy(format!("guest '{id}' is running")));
    }
    Ok(())
}

pub struct QuerySnapshotExecutor {
    modules: CellModules,
}

impl QuerySnapshotExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for QuerySnapshotExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response = Message::response_to(&request, MessageKind::QuerySnapshotResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let id = instance_param(&request)?;
            self.modules.storage.query_snapshots(id).await
        }
        .await;

        match outcome {
            Ok(records) => {
                let mut names = Vec::with_capacity(records.len());
                let mut parents = Vec::with_capacity(records.len());
                let mut current = String::new();
                for record in records {
                    if record.is_current {
                        current = record.name.clone();
                    }
                    names.push(record.name);
                    parents.push(record.parent.unwrap_or_default());
                }
                response.set_string_array(ParamKey::Snapshot, names);
                response.set_string_array(ParamKey::Backing, parents);
                response.set_string(ParamKey::Current, current);
                response.success = true;
                self.modules.sender.send(response, &target)
            }
            Err(err) => respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        }
    }
}

pub struct GetSnapshotExecutor {
    modules: CellModules,
}

impl GetSnapshotExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for GetSnapshotExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response = Message::response_to(&request, MessageKind::GetSnapshotResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let id = instance_param(&request)?;
            let name = request.get_string(ParamKey::Snapshot)?;
            self.modules.storage.get_snapshot(id, name).await
        }
        .await;

        match outcome {
            Ok(record) => {
                response.set_string(ParamKey::Name, record.name);
                response.set_string(ParamKey::Backing, record.parent.unwrap_or_default());
                response.set_string(ParamKey::Created, record.created_at.to_rfc3339());
                response.set_bool(ParamKey::Current, record.is_current);
                response.success = true;
                self.modules.sender.send(response, &target)
            }
            Err(err) => respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        }
    }
}

macro_rules! snapshot_mutation_executor {
    ($name:ident, $response:ident, $call:ident, $log:literal) => {
        pub struct $name {
            modules: CellModules,
        }

        impl $name {
            pub fn new(modules: CellModules) -> Self {
                Self { modules }
            }
        }

        #[async_trait]
        impl Executor for $name {
            async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
                let mut response = Message::response_to(&request, MessageKind::$response, session);
                let target = request.sender.clone();

                let outcome = async {
                    let id = instance_param(&request)?;
                    let name = request.get_string(ParamKey::Snapshot)?;
                    require_stopped(&self.modules, id).await?;
                    self.modules.storage.$call(id, name.clone()).await?;
                    info!(session = format_args!("{session:08X}"), guest = %id, snapshot = %name, $log);
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
    };
}

snapshot_mutation_executor!(
    CreateSnapshotExecutor,
    CreateSnapshotResponse,
    create_snapshot,
    "snapshot created"
);
snapshot_mutation_executor!(
    RestoreSnapshotExecutor,
    RestoreSnapshotResponse,
    restore_snapshot,
    "snapshot restored"
);
snapshot_mutation_executor!(
    DeleteSnapshotExecutor,
    DeleteSnapshotResponse,
    delete_snapshot,
    "snapshot deleted"
);
