//! Storage pool module.
//!
//! Owns named pools, their volume groups and the per-group snapshot
//! chain. A single worker task consumes commands, so pool state never
//! needs a lock; long file work runs on the per-pool scheduler, whose
//! completion events flow back into the same loop to update the indices.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kestrel_hypervisor::{BootIsoConfig, CellError, CloudInitGenerator, ImageTool, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::SessionId;
use crate::scheduler::{
    ImageServiceClient, IoScheduler, SchedulerEvent, SchedulerEventKind, SchedulerHandle,
    SchedulerTask, SnapshotTarget,
};

const COMMAND_QUEUE_DEPTH: usize = 64;

/// Configuration of the storage module.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Name of the default pool.
    pub pool_name: String,
    /// Filesystem path of the default pool.
    pub pool_path: PathBuf,
    /// Directory for persisted pool indices.
    pub data_path: PathBuf,
}

/// One provisioned volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub size: u64,
}

/// A snapshot in a group's chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub name: String,
    pub parent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The acyclic backing chain of one volume group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotChain {
    pub nodes: HashMap<String, SnapshotNode>,
    /// Snapshot the live files are currently backed by.
    pub head: Option<String>,
}

impl SnapshotChain {
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// The snapshot whose file is backed by `name`'s file, if any.
    pub fn child_of(&self, name: &str) -> Option<&SnapshotNode> {
        self.nodes
            .values()
            .find(|node| node.parent.as_deref() == Some(name))
    }

    fn record_create(&mut self, name: &str) {
        self.nodes.insert(
            name.to_string(),
            SnapshotNode {
                name: name.to_string(),
                parent: self.head.clone(),
                created_at: Utc::now(),
            },
        );
        self.head = Some(name.to_string());
    }

    fn record_restore(&mut self, name: &str) {
        self.head = Some(name.to_string());
    }

    fn record_delete(&mut self, name: &str) {
        let parent = match self.nodes.get(name) {
            Some(node) => node.parent.clone(),
            None => return,
        };
        let child = self.child_of(name).map(|node| node.name.clone());
        if let Some(child) = child {
            if let Some(node) = self.nodes.get_mut(&child) {
                node.parent = parent.clone();
            }
        }
        if self.head.as_deref() == Some(name) {
            self.head = parent;
        }
        self.nodes.remove(name);
    }
}

/// Snapshot description returned to executors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub name: String,
    pub parent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_root: bool,
    pub is_current: bool,
}

/// One guest's volumes plus its chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeGroup {
    pub id: Uuid,
    pub volumes: Vec<Volume>,
    pub boot_image: Option<PathBuf>,
    #[serde(default)]
    pub snapshots: SnapshotChain,
}

/// Result of a volume allocation.
#[derive(Debug, Clone)]
pub struct StorageResult {
    pub pool: String,
    pub volumes: Vec<String>,
    pub image: Option<PathBuf>,
}

/// Group description used by executors and invariant checks.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub pool: String,
    pub volumes: Vec<Volume>,
    pub boot_image: Option<PathBuf>,
}

/// Pool description for the cell report.
#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub name: String,
    pub path: PathBuf,
    pub groups: Vec<Uuid>,
}

/// Channels of a long-running transfer task.
pub struct TransferChannels {
    /// Resolves once the task is scheduled (or rejected).
    pub start: oneshot::Receiver<Result<()>>,
    /// 0..=100, roughly once per second.
    pub progress: mpsc::UnboundedReceiver<u32>,
    /// Terminal outcome with the transferred byte count.
    pub result: oneshot::Receiver<Result<u64>>,
}

enum StorageCommand {
    CreateVolumes {
        group: Uuid,
        system_size: u64,
        data_sizes: Vec<u64>,
        boot: Option<BootIsoConfig>,
        reply: oneshot::Sender<Result<StorageResult>>,
    },
    DeleteVolumes {
        group: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    ReadDiskImage {
        session: SessionId,
        group: Uuid,
        volume: String,
        image: String,
        target_size: u64,
        image_size: u64,
        host: String,
        port: u16,
        start: oneshot::Sender<Result<()>>,
        progress: mpsc::UnboundedSender<u32>,
        result: oneshot::Sender<Result<u64>>,
    },
    WriteDiskImage {
        session: SessionId,
        group: Uuid,
        volume: String,
        image: String,
        host: String,
        port: u16,
        start: oneshot::Sender<Result<()>>,
        progress: mpsc::UnboundedSender<u32>,
        result: oneshot::Sender<Result<u64>>,
    },
    ResizeVolume {
        session: SessionId,
        group: Uuid,
        volume: String,
        size: u64,
        result: oneshot::Sender<Result<u64>>,
    },
    ShrinkVolume {
        session: SessionId,
        group: Uuid,
        volume: String,
        result: oneshot::Sender<Result<u64>>,
    },
    QuerySnapshots {
        group: Uuid,
        reply: oneshot::Sender<Result<Vec<SnapshotRecord>>>,
    },
    GetSnapshot {
        group: Uuid,
        snapshot: String,
        reply: oneshot::Sender<Result<SnapshotRecord>>,
    },
    CreateSnapshot {
        group: Uuid,
        snapshot: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RestoreSnapshot {
        group: Uuid,
        snapshot: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteSnapshot {
        group: Uuid,
        snapshot: String,
        reply: oneshot::Sender<Result<()>>,
    },
    QueryPaths {
        reply: oneshot::Sender<Result<Vec<(String, PathBuf)>>>,
    },
    ChangePaths {
        pool: String,
        path: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
    ResetSystemVolume {
        group: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    ExtendGroup {
        group: Uuid,
        size: u64,
        reply: oneshot::Sender<Result<String>>,
    },
    RemoveVolume {
        group: Uuid,
        volume: String,
        reply: oneshot::Sender<Result<()>>,
    },
    FindGroup {
        group: Uuid,
        reply: oneshot::Sender<Option<GroupInfo>>,
    },
    ListPools {
        reply: oneshot::Sender<Vec<PoolInfo>>,
    },
}

/// Cheap-to-clone handle onto the storage worker.
#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::Sender<StorageCommand>,
}

macro_rules! storage_call {
    ($self:ident, $reply:ident, $command:expr) => {{
        let (tx, $reply) = oneshot::channel();
        $self
            .tx
            .send($command(tx))
            .await
            .map_err(|_| CellError::Internal("storage module stopped".to_string()))?;
        $reply
            .await
            .map_err(|_| CellError::Internal("storage reply dropped".to_string()))
    }};
}

impl StorageHandle {
    pub async fn create_volumes(
        &self,
        group: Uuid,
        system_size: u64,
        data_sizes: Vec<u64>,
        boot: Option<BootIsoConfig>,
    ) -> Result<StorageResult> {
        storage_call!(self, reply, |tx| StorageCommand::CreateVolumes {
            group,
            system_size,
            data_sizes,
            boot,
            reply: tx,
        })?
    }

    pub async fn delete_volumes(&self, group: Uuid) -> Result<()> {
        storage_call!(self, reply, |tx| StorageCommand::DeleteVolumes { group, reply: tx })?
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn read_disk_image(
        &self,
        session: SessionId,
        group: Uuid,
        volume: String,
        image: String,
        target_size: u64,
        image_size: u64,
        host: String,
        port: u16,
    ) -> Result<TransferChannels> {
        let (start_tx, start_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        self.tx
            .send(StorageCommand::ReadDiskImage {
                session,
                group,
                volume,
                image,
                target_size,
                image_size,
                host,
                port,
                start: start_tx,
                progress: progress_tx,
                result: result_tx,
            })
            .await
            .map_err(|_| CellError::Internal("storage module stopped".to_string()))?;
        Ok(TransferChannels {
            start: start_rx,
            progress: progress_rx,
            result: result_rx,
        })
    }

    pub async fn write_disk_image(
        &self,
        session: SessionId,
        group: Uuid,
        volume: String,
        image: String,
        host: String,
        port: u16,
    ) -> Result<TransferChannels> {
        let (start_tx, start_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        self.tx
            .send(StorageCommand::WriteDiskImage {
                session,
                group,
                volume,
                image,
                host,
                port,
                start: start_tx,
                progress: progress_tx,
                result: result_tx,
            })
            .await
            .map_err(|_| CellError::Internal("storage module stopped".to_string()))?;
        Ok(TransferChannels {
            start: start_rx,
            progress: progress_rx,
            result: result_rx,
        })
    }

    /// Enqueue a resize; the receiver resolves at task termination.
    pub async fn resize_volume(
        &self,
        session: SessionId,
        group: Uuid,
        volume: String,
        size: u64,
    ) -> Result<oneshot::Receiver<Result<u64>>> {
        let (result_tx, result_rx) = oneshot::channel();
        self.tx
            .send(StorageCommand::ResizeVolume {
                session,
                group,
                volume,
                size,
                result: result_tx,
            })
            .await
            .map_err(|_| CellError::Internal("storage module stopped".to_string()))?;
        Ok(result_rx)
    }

    pub async fn shrink_volume(
        &self,
        session: SessionId,
        group: Uuid,
        volume: String,
    ) -> Result<oneshot::Receiver<Result<u64>>> {
        let (result_tx, result_rx) = oneshot::channel();
        self.tx
            .send(StorageCommand::ShrinkVolume {
                session,
                group,
                volume,
                result: result_tx,
            })
            .await
            .map_err(|_| CellError::Internal("storage module stopped".to_string()))?;
        Ok(result_rx)
    }

    pub async fn query_snapshots(&self, group: Uuid) -> Result<Vec<SnapshotRecord>> {
        storage_call!(self, reply, |tx| StorageCommand::QuerySnapshots { group, reply: tx })?
    }

    pub async fn get_snapshot(&self, group: Uuid, snapshot: String) -> Result<SnapshotRecord> {
        storage_call!(self, reply, |tx| StorageCommand::GetSnapshot {
            group,
            snapshot,
            reply: tx,
        })?
    }

    pub async fn create_snapshot(&self, group: Uuid, snapshot: String) -> Result<()> {
        storage_call!(self, reply, |tx| StorageCommand::CreateSnapshot {
            group,
            snapshot,
            reply: tx,
        })?
    }

    pub async fn restore_snapshot(&self, group: Uuid, snapshot: String) -> Result<()> {
        storage_call!(self, reply, |tx| StorageCommand::RestoreSnapshot {
            group,
            snapshot,
            reply: tx,
        })?
    }

    pub async fn delete_snapshot(&self, group: Uuid, snapshot: String) -> Result<()> {
        storage_call!(self, reply, |tx| StorageCommand::DeleteSnapshot {
            group,
            snapshot,
            reply: tx,
        })?
    }

    pub async fn query_paths(&self) -> Result<Vec<(String, PathBuf)>> {
        storage_call!(self, reply, |tx| StorageCommand::QueryPaths { reply: tx })?
    }

    pub async fn change_paths(&self, pool: String, path: PathBuf) -> Result<()> {
        storage_call!(self, reply, |tx| StorageCommand::ChangePaths {
            pool,
            path,
            reply: tx,
        })?
    }

    pub async fn reset_system_volume(&self, group: Uuid) -> Result<()> {
        storage_call!(self, reply, |tx| StorageCommand::ResetSystemVolume { group, reply: tx })?
    }

    /// Allocate one additional data volume; returns its name.
    pub async fn extend_group(&self, group: Uuid, size: u64) -> Result<String> {
        storage_call!(self, reply, |tx| StorageCommand::ExtendGroup {
            group,
            size,
            reply: tx,
        })?
    }

    /// Remove a data volume from a group.
    pub async fn remove_volume(&self, group: Uuid, volume: String) -> Result<()> {
        storage_call!(self, reply, |tx| StorageCommand::RemoveVolume {
            group,
            volume,
            reply: tx,
        })?
    }

    pub async fn find_group(&self, group: Uuid) -> Result<Option<GroupInfo>> {
        storage_call!(self, reply, |tx| StorageCommand::FindGroup { group, reply: tx })
    }

    pub async fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        storage_call!(self, reply, |tx| StorageCommand::ListPools { reply: tx })
    }
}

// =============================================================================
// WORKER
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct PoolRecord {
    name: String,
    path: PathBuf,
    groups: Vec<VolumeGroup>,
}

struct Pool {
    name: String,
    path: PathBuf,
    groups: HashMap<Uuid, VolumeGroup>,
}

impl Pool {
    fn volume_path(&self, volume: &str) -> PathBuf {
        self.path.join(format!("{volume}.qcow2"))
    }

    fn snapshot_path(&self, volume: &str, snapshot: &str) -> PathBuf {
        self.path.join(format!("{volume}.{snapshot}.qcow2"))
    }

    fn iso_path(&self, group: Uuid) -> PathBuf {
        self.path.join(format!("{group}_ci.iso"))
    }
}

/// The storage module: spawns the worker plus one scheduler per pool.
pub struct StorageModule;

impl StorageModule {
    pub fn start(
        config: StorageConfig,
        imgtool: Arc<dyn ImageTool>,
        client: ImageServiceClient,
    ) -> Result<StorageHandle> {
        std::fs::create_dir_all(&config.pool_path)?;
        std::fs::create_dir_all(&config.data_path)?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut pools = HashMap::new();
        let mut schedulers = HashMap::new();

        let pool = load_pool(&config.data_path, &config.pool_name).unwrap_or_else(|| Pool {
            name: config.pool_name.clone(),
            path: config.pool_path.clone(),
            groups: HashMap::new(),
        });
        schedulers.insert(
            pool.name.clone(),
            IoScheduler::start(&pool.name, imgtool.clone(), client, event_tx),
        );
        pools.insert(pool.name.clone(), pool);

        let worker = StorageWorker {
            pools,
            schedulers,
            default_pool: config.pool_name,
            data_path: config.data_path,
            pending_snapshots: HashSet::new(),
            imgtool,
            iso_generator: CloudInitGenerator::new(),
        };
        tokio::spawn(worker.run(command_rx, event_rx));
        Ok(StorageHandle { tx: command_tx })
    }
}

fn load_pool(data_path: &Path, name: &str) -> Option<Pool> {
    let path = data_path.join(format!("pool_{name}.json"));
    let data = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<PoolRecord>(&data) {
        Ok(record) => {
            info!(pool = %record.name, groups = record.groups.len(), "pool index loaded");
            Some(Pool {
                name: record.name,
                path: record.path,
                groups: record
                    .groups
                    .into_iter()
                    .map(|group| (group.id, group))
                    .collect(),
            })
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "discarding unreadable pool index");
            None
        }
    }
}

struct StorageWorker {
    pools: HashMap<String, Pool>,
    schedulers: HashMap<String, SchedulerHandle>,
    default_pool: String,
    data_path: PathBuf,
    pending_snapshots: HashSet<Uuid>,
    imgtool: Arc<dyn ImageTool>,
    iso_generator: CloudInitGenerator,
}

impl StorageWorker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<StorageCommand>,
        mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
    ) {
        info!("storage module started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = events.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }
            }
        }
        info!("storage module stopped");
    }

    fn persist(&self, pool_name: &str) {
        let Some(pool) = self.pools.get(pool_name) else {
            return;
        };
        let record = PoolRecord {
            name: pool.name.clone(),
            path: pool.path.clone(),
            groups: pool.groups.values().cloned().collect(),
        };
        let path = self.data_path.join(format!("pool_{pool_name}.json"));
        match serde_json::to_string_pretty(&record) {
            Ok(data) => {
                if let Err(err) = std::fs::write(&path, data) {
                    warn!(path = %path.display(), error = %err, "persist pool index failed");
                }
            }
            Err(err) => warn!(error = %err, "encode pool index failed"),
        }
    }

    fn pool_of_group(&self, group: Uuid) -> Option<&str> {
        self.pools
            .values()
            .find(|pool| pool.groups.contains_key(&group))
            .map(|pool| pool.name.as_str())
    }

    async fn handle_command(&mut self, command: StorageCommand) {
        match command {
            StorageCommand::CreateVolumes {
                group,
                system_size,
                data_sizes,
                boot,
                reply,
            } => {
                let outcome = self.create_volumes(group, system_size, &data_sizes, boot).await;
                let _ = reply.send(outcome);
            }
            StorageCommand::DeleteVolumes { group, reply } => {
                let _ = reply.send(self.delete_volumes(group).await);
            }
            StorageCommand::ReadDiskImage {
                session,
                group,
                volume,
                image,
                target_size,
                image_size,
                host,
                port,
                start,
                progress,
                result,
            } => {
                let located = self.locate_volume(group, &volume);
                let (scheduler, path) = match located {
                    Ok(parts) => parts,
                    Err(err) => {
                        let _ = start.send(Err(err));
                        return;
                    }
                };
                let task = SchedulerTask::ReadDiskImage {
                    session,
                    group,
                    volume,
                    path,
                    image,
                    image_size,
                    target_size,
                    host,
                    port,
                    progress,
                    result,
                };
                match scheduler.submit(task) {
                    Ok(()) => {
                        let _ = start.send(Ok(()));
                    }
                    Err(_) => {
                        let _ = start.send(Err(scheduler.busy()));
                    }
                }
            }
            StorageCommand::WriteDiskImage {
                session,
                group,
                volume,
                image,
                host,
                port,
                start,
                progress,
                result,
            } => {
                let located = self.locate_volume(group, &volume);
                let (scheduler, path) = match located {
                    Ok(parts) => parts,
                    Err(err) => {
                        let _ = start.send(Err(err));
                        return;
                    }
                };
                let task = SchedulerTask::WriteDiskImage {
                    session,
                    group,
                    volume,
                    path,
                    image,
                    host,
                    port,
                    progress,
                    result,
                };
                match scheduler.submit(task) {
                    Ok(()) => {
                        let _ = start.send(Ok(()));
                    }
                    Err(_) => {
                        let _ = start.send(Err(scheduler.busy()));
                    }
                }
            }
            StorageCommand::ResizeVolume {
                session,
                group,
                volume,
                size,
                result,
            } => {
                match self.locate_volume(group, &volume) {
                    Ok((scheduler, path)) => {
                        let task = SchedulerTask::Resize {
                            session,
                            group,
                            volume: volume.clone(),
                            path,
                            size,
                            result,
                        };
                        match scheduler.submit(task) {
                            Ok(()) => {
                                if let Some(record) = self.volume_record_mut(group, &volume) {
                                    record.size = size;
                                }
                                if let Some(pool) = self.pool_of_group(group).map(str::to_string) {
                                    self.persist(&pool);
                                }
                            }
                            Err(SchedulerTask::Resize { result, .. }) => {
                                let _ = result.send(Err(scheduler.busy()));
                            }
                            Err(_) => {}
                        }
                    }
                    Err(err) => {
                        let _ = result.send(Err(err));
                    }
                }
            }
            StorageCommand::ShrinkVolume {
                session,
                group,
                volume,
                result,
            } => match self.locate_volume(group, &volume) {
                Ok((scheduler, path)) => {
                    let task = SchedulerTask::Shrink {
                        session,
                        group,
                        volume,
                        path,
                        result,
                    };
                    match scheduler.submit(task) {
                        Ok(()) => {}
                        Err(SchedulerTask::Shrink { result, .. }) => {
                            let _ = result.send(Err(scheduler.busy()));
                        }
                        Err(_) => {}
                    }
                }
                Err(err) => {
                    let _ = result.send(Err(err));
                }
            },
            StorageCommand::QuerySnapshots { group, reply } => {
                let _ = reply.send(self.query_snapshots(group));
            }
            StorageCommand::GetSnapshot {
                group,
                snapshot,
                reply,
            } => {
                let outcome = self.query_snapshots(group).and_then(|records| {
                    records
                        .into_iter()
                        .find(|record| record.name == snapshot)
                        .ok_or_else(|| CellError::NotFound(format!("snapshot '{snapshot}'")))
                });
                let _ = reply.send(outcome);
            }
            StorageCommand::CreateSnapshot {
                group,
                snapshot,
                reply,
            } => self.submit_snapshot_task(group, snapshot, SnapshotOp::Create, reply),
            StorageCommand::RestoreSnapshot {
                group,
                snapshot,
                reply,
            } => self.submit_snapshot_task(group, snapshot, SnapshotOp::Restore, reply),
            StorageCommand::DeleteSnapshot {
                group,
                snapshot,
                reply,
            } => self.submit_snapshot_task(group, snapshot, SnapshotOp::Delete, reply),
            StorageCommand::QueryPaths { reply } => {
                let paths = self
                    .pools
                    .values()
                    .map(|pool| (pool.name.clone(), pool.path.clone()))
                    .collect();
                let _ = reply.send(Ok(paths));
            }
            StorageCommand::ChangePaths { pool, path, reply } => {
                let outcome = match self.pools.get_mut(&pool) {
                    Some(entry) => {
                        if !entry.groups.is_empty() {
                            warn!(pool = %pool, "pool path changed with live groups, existing volumes stay behind");
                        }
                        match std::fs::create_dir_all(&path) {
                            Ok(()) => {
                                entry.path = path;
                                self.persist(&pool);
                                Ok(())
                            }
                            Err(err) => Err(CellError::Internal(format!(
                                "prepare pool path: {err}"
                            ))),
                        }
                    }
                    None => Err(CellError::NotFound(format!("pool '{pool}'"))),
                };
                let _ = reply.send(outcome);
            }
            StorageCommand::ResetSystemVolume { group, reply } => {
                let _ = reply.send(self.reset_system_volume(group).await);
            }
            StorageCommand::ExtendGroup { group, size, reply } => {
                let _ = reply.send(self.extend_group(group, size).await);
            }
            StorageCommand::RemoveVolume {
                group,
                volume,
                reply,
            } => {
                let _ = reply.send(self.remove_volume(group, &volume).await);
            }
            StorageCommand::FindGroup { group, reply } => {
                let info = self.pool_of_group(group).and_then(|name| {
                    let pool = self.pools.get(name)?;
                    let entry = pool.groups.get(&group)?;
                    Some(GroupInfo {
                        pool: pool.name.clone(),
                        volumes: entry.volumes.clone(),
                        boot_image: entry.boot_image.clone(),
                    })
                });
                let _ = reply.send(info);
            }
            StorageCommand::ListPools { reply } => {
                let pools = self
                    .pools
                    .values()
                    .map(|pool| PoolInfo {
                        name: pool.name.clone(),
                        path: pool.path.clone(),
                        groups: pool.groups.keys().copied().collect(),
                    })
                    .collect();
                let _ = reply.send(pools);
            }
        }
    }

    fn volume_record_mut(&mut self, group: Uuid, volume: &str) -> Option<&mut Volume> {
        let pool_name = self.pool_of_group(group)?.to_string();
        self.pools
            .get_mut(&pool_name)?
            .groups
            .get_mut(&group)?
            .volumes
            .iter_mut()
            .find(|record| record.name == volume)
    }

    fn locate_volume(&self, group: Uuid, volume: &str) -> Result<(SchedulerHandle, PathBuf)> {
        let pool_name = self
            .pool_of_group(group)
            .ok_or_else(|| CellError::NotFound(format!("group '{group}'")))?;
        let pool = &self.pools[pool_name];
        let entry = &pool.groups[&group];
        if !entry.volumes.iter().any(|record| record.name == volume) {
            return Err(CellError::NotFound(format!(
                "volume '{volume}' in group '{group}'"
            )));
        }
        let scheduler = self
            .schedulers
            .get(pool_name)
            .cloned()
            .ok_or_else(|| CellError::Internal(format!("no scheduler for pool '{pool_name}'")))?;
        Ok((scheduler, pool.volume_path(volume)))
    }

    async fn create_volumes(
        &mut self,
        group: Uuid,
        system_size: u64,
        data_sizes: &[u64],
        boot: Option<BootIsoConfig>,
    ) -> Result<StorageResult> {
        if self.pool_of_group(group).is_some() {
            return Err(CellError::Conflict(format!(
                "group '{group}' already allocated"
            )));
        }
        let pool = self
            .pools
            .get(&self.default_pool)
            .ok_or_else(|| CellError::Internal("default pool missing".to_string()))?;
        let pool_name = pool.name.clone();
        let pool_path = pool.path.clone();

        // System volume first, data volumes in request order.
        let mut volumes = vec![Volume {
            name: format!("{group}_sys"),
            size: system_size,
        }];
        for (index, size) in data_sizes.iter().enumerate() {
            volumes.push(Volume {
                name: format!("{group}_data{index}"),
                size: *size,
            });
        }

        let mut created: Vec<PathBuf> = Vec::new();
        for volume in &volumes {
            let path = pool_path.join(format!("{}.qcow2", volume.name));
            if let Err(err) = self.imgtool.create(&path, volume.size).await {
                warn!(group = %group, volume = %volume.name, error = %err, "volume allocation failed, rolling back");
                for leftover in &created {
                    if let Err(remove_err) = tokio::fs::remove_file(leftover).await {
                        warn!(path = %leftover.display(), error = %remove_err, "rollback removal failed");
                    }
                }
                return Err(err);
            }
            created.push(path);
        }

        let mut image = None;
        if let Some(iso) = boot {
            let iso_path = pool_path.join(format!("{group}_ci.iso"));
            match self.iso_generator.generate(&iso, &iso_path) {
                Ok(path) => image = Some(path),
                Err(err) => {
                    warn!(group = %group, error = %err, "boot ISO generation failed, rolling back");
                    for leftover in &created {
                        let _ = tokio::fs::remove_file(leftover).await;
                    }
                    return Err(err);
                }
            }
        }

        let names: Vec<String> = volumes.iter().map(|volume| volume.name.clone()).collect();
        let entry = VolumeGroup {
            id: group,
            volumes,
            boot_image: image.clone(),
            snapshots: SnapshotChain::default(),
        };
        if let Some(pool) = self.pools.get_mut(&pool_name) {
            pool.groups.insert(group, entry);
        }
        self.persist(&pool_name);
        info!(group = %group, pool = %pool_name, volumes = names.len(), "volume group allocated");
        Ok(StorageResult {
            pool: pool_name,
            volumes: names,
            image,
        })
    }

    async fn delete_volumes(&mut self, group: Uuid) -> Result<()> {
        let Some(pool_name) = self.pool_of_group(group).map(str::to_string) else {
            // Idempotent: a missing group is a successful delete.
            return Ok(());
        };
        let Some(pool) = self.pools.get_mut(&pool_name) else {
            return Ok(());
        };
        let Some(entry) = pool.groups.remove(&group) else {
            return Ok(());
        };

        for volume in &entry.volumes {
            let path = pool.volume_path(&volume.name);
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %err, "volume removal failed");
            }
            for snapshot in entry.snapshots.nodes.keys() {
                let path = pool.snapshot_path(&volume.name, snapshot);
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
        if let Some(iso) = &entry.boot_image {
            let _ = tokio::fs::remove_file(iso).await;
        }
        self.pending_snapshots.remove(&group);
        self.persist(&pool_name);
        info!(group = %group, pool = %pool_name, "volume group released");
        Ok(())
    }

    async fn extend_group(&mut self, group: Uuid, size: u64) -> Result<String> {
        let pool_name = self
            .pool_of_group(group)
            .ok_or_else(|| CellError::NotFound(format!("group '{group}'")))?
            .to_string();
        let pool = &self.pools[&pool_name];
        let entry = &pool.groups[&group];

        // First unused data index keeps names stable across detaches.
        let mut index = 0;
        let name = loop {
            let candidate = format!("{group}_data{index}");
            if !entry.volumes.iter().any(|volume| volume.name == candidate) {
                break candidate;
            }
            index += 1;
        };
        let path = pool.volume_path(&name);
        self.imgtool.create(&path, size).await?;

        if let Some(entry) = self
            .pools
            .get_mut(&pool_name)
            .and_then(|pool| pool.groups.get_mut(&group))
        {
            entry.volumes.push(Volume {
                name: name.clone(),
                size,
            });
        }
        self.persist(&pool_name);
        info!(group = %group, volume = %name, "data volume attached");
        Ok(name)
    }

    async fn remove_volume(&mut self, group: Uuid, volume: &str) -> Result<()> {
        let pool_name = self
            .pool_of_group(group)
            .ok_or_else(|| CellError::NotFound(format!("group '{group}'")))?
            .to_string();
        let pool = &self.pools[&pool_name];
        let entry = &pool.groups[&group];
        if !entry.snapshots.nodes.is_empty() {
            return Err(CellError::Busy(format!(
                "group '{group}' carries snapshots"
            )));
        }
        let position = entry
            .volumes
            .iter()
            .position(|record| record.name == volume)
            .ok_or_else(|| CellError::NotFound(format!("volume '{volume}'")))?;
        if position == 0 {
            return Err(CellError::InvalidInput(
                "the system volume cannot be detached".to_string(),
            ));
        }
        let path = pool.volume_path(volume);
        if let Err(err) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %err, "volume removal failed");
        }
        if let Some(entry) = self
            .pools
            .get_mut(&pool_name)
            .and_then(|pool| pool.groups.get_mut(&group))
        {
            entry.volumes.remove(position);
        }
        self.persist(&pool_name);
        info!(group = %group, volume = %volume, "data volume detached");
        Ok(())
    }

    async fn reset_system_volume(&mut self, group: Uuid) -> Result<()> {
        let pool_name = self
            .pool_of_group(group)
            .ok_or_else(|| CellError::NotFound(format!("group '{group}'")))?
            .to_string();
        let pool = &self.pools[&pool_name];
        let entry = &pool.groups[&group];
        let system = entry
            .volumes
            .first()
            .ok_or_else(|| CellError::Internal(format!("group '{group}' has no system volume")))?
            .clone();
        let path = pool.volume_path(&system.name);

        if let Err(err) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %err, "previous system volume removal failed");
        }
        self.imgtool.create(&path, system.size).await?;
        info!(group = %group, volume = %system.name, "system volume re-provisioned");
        Ok(())
    }

    fn query_snapshots(&self, group: Uuid) -> Result<Vec<SnapshotRecord>> {
        let pool_name = self
            .pool_of_group(group)
            .ok_or_else(|| CellError::NotFound(format!("group '{group}'")))?;
        let chain = &self.pools[pool_name].groups[&group].snapshots;
        let mut records: Vec<SnapshotRecord> = chain
            .nodes
            .values()
            .map(|node| SnapshotRecord {
                name: node.name.clone(),
                parent: node.parent.clone(),
                created_at: node.created_at,
                is_root: node.parent.is_none(),
                is_current: chain.head.as_deref() == Some(node.name.as_str()),
            })
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    fn submit_snapshot_task(
        &mut self,
        group: Uuid,
        snapshot: String,
        op: SnapshotOp,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let prepared = self.prepare_snapshot_task(group, &snapshot, op);
        let (pool_name, targets) = match prepared {
            Ok(parts) => parts,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let Some(scheduler) = self.schedulers.get(&pool_name).cloned() else {
            let _ = reply.send(Err(CellError::Internal(format!(
                "no scheduler for pool '{pool_name}'"
            ))));
            return;
        };
        let task = match op {
            SnapshotOp::Create => SchedulerTask::SnapshotCreate {
                group,
                snapshot,
                targets,
                reply,
            },
            SnapshotOp::Restore => SchedulerTask::SnapshotRestore {
                group,
                snapshot,
                targets,
                reply,
            },
            SnapshotOp::Delete => SchedulerTask::SnapshotDelete {
                group,
                snapshot,
                targets,
                reply,
            },
        };
        match scheduler.submit(task) {
            Ok(()) => {
                self.pending_snapshots.insert(group);
            }
            Err(task) => {
                let busy = scheduler.busy();
                let reply = match task {
                    SchedulerTask::SnapshotCreate { reply, .. }
                    | SchedulerTask::SnapshotRestore { reply, .. }
                    | SchedulerTask::SnapshotDelete { reply, .. } => reply,
                    _ => return,
                };
                let _ = reply.send(Err(busy));
            }
        }
    }

    fn prepare_snapshot_task(
        &self,
        group: Uuid,
        snapshot: &str,
        op: SnapshotOp,
    ) -> Result<(String, Vec<SnapshotTarget>)> {
        if self.pending_snapshots.contains(&group) {
            return Err(CellError::Busy(format!(
                "snapshot operation already running for group '{group}'"
            )));
        }
        let pool_name = self
            .pool_of_group(group)
            .ok_or_else(|| CellError::NotFound(format!("group '{group}'")))?
            .to_string();
        let pool = &self.pools[&pool_name];
        let entry = &pool.groups[&group];
        let chain = &entry.snapshots;

        match op {
            SnapshotOp::Create if chain.contains(snapshot) => {
                return Err(CellError::Conflict(format!(
                    "snapshot '{snapshot}' already exists"
                )));
            }
            SnapshotOp::Restore | SnapshotOp::Delete if !chain.contains(snapshot) => {
                return Err(CellError::NotFound(format!("snapshot '{snapshot}'")));
            }
            _ => {}
        }

        // Order matters: a later target may depend on an earlier one.
        let targets = entry
            .volumes
            .iter()
            .map(|volume| match op {
                SnapshotOp::Create | SnapshotOp::Restore => SnapshotTarget {
                    current: pool.volume_path(&volume.name),
                    backing: Some(pool.snapshot_path(&volume.name, snapshot)),
                    backed: None,
                },
                SnapshotOp::Delete => {
                    let backed = if chain.head.as_deref() == Some(snapshot) {
                        Some(pool.volume_path(&volume.name))
                    } else {
                        chain
                            .child_of(snapshot)
                            .map(|child| pool.snapshot_path(&volume.name, &child.name))
                    };
                    SnapshotTarget {
                        current: pool.snapshot_path(&volume.name, snapshot),
                        backing: None,
                        backed,
                    }
                }
            })
            .collect();
        Ok((pool_name, targets))
    }

    fn handle_event(&mut self, event: SchedulerEvent) {
        match event.kind {
            SchedulerEventKind::SnapshotCreateCompleted
            | SchedulerEventKind::SnapshotRestoreCompleted
            | SchedulerEventKind::SnapshotDeleteCompleted => {
                self.pending_snapshots.remove(&event.group);
                let snapshot = event.snapshot.unwrap_or_default();
                let outcome = match event.error {
                    Some(err) => Err(err),
                    None => {
                        if let Some(pool_name) = self.pool_of_group(event.group).map(str::to_string)
                        {
                            if let Some(entry) = self
                                .pools
                                .get_mut(&pool_name)
                                .and_then(|pool| pool.groups.get_mut(&event.group))
                            {
                                match event.kind {
                                    SchedulerEventKind::SnapshotCreateCompleted => {
                                        entry.snapshots.record_create(&snapshot)
                                    }
                                    SchedulerEventKind::SnapshotRestoreCompleted => {
                                        entry.snapshots.record_restore(&snapshot)
                                    }
                                    SchedulerEventKind::SnapshotDeleteCompleted => {
                                        entry.snapshots.record_delete(&snapshot)
                                    }
                                    _ => {}
                                }
                            }
                            self.persist(&pool_name);
                        }
                        Ok(())
                    }
                };
                if let Some(reply) = event.reply {
                    let _ = reply.send(outcome);
                }
            }
            kind => {
                debug!(
                    group = %event.group,
                    volume = event.volume.as_deref().unwrap_or(""),
                    failed = event.error.is_some(),
                    ?kind,
                    "scheduler task completed"
                );
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapshotOp {
    Create,
    Restore,
    Delete,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_hypervisor::FileImageTool;

    fn test_module(dir: &Path) -> StorageHandle {
        let config = StorageConfig {
            pool_name: "local".to_string(),
            pool_path: dir.join("volumes"),
            data_path: dir.join("data"),
        };
        StorageModule::start(
            config,
            Arc::new(FileImageTool::new()),
            ImageServiceClient::new().unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_volumes_puts_system_first() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_module(dir.path());
        let group = Uuid::new_v4();

        let result = storage
            .create_volumes(group, 20 << 30, vec![10 << 30, 5 << 30], None)
            .await
            .unwrap();
        assert_eq!(result.pool, "local");
        assert_eq!(result.volumes.len(), 3);
        assert!(result.volumes[0].ends_with("_sys"));
        assert!(result.volumes[1].ends_with("_data0"));

        for volume in &result.volumes {
            assert!(dir.path().join("volumes").join(format!("{volume}.qcow2")).exists());
        }

        // Same group twice collides.
        assert!(matches!(
            storage.create_volumes(group, 1 << 30, vec![], None).await,
            Err(CellError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn delete_volumes_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_module(dir.path());
        let group = Uuid::new_v4();

        let result = storage
            .create_volumes(group, 1 << 30, vec![], None)
            .await
            .unwrap();
        let system = dir
            .path()
            .join("volumes")
            .join(format!("{}.qcow2", result.volumes[0]));
        assert!(system.exists());

        storage.delete_volumes(group).await.unwrap();
        assert!(!system.exists());
        assert!(storage.find_group(group).await.unwrap().is_none());

        // Second delete observes nothing and still succeeds.
        storage.delete_volumes(group).await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_chain_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_module(dir.path());
        let group = Uuid::new_v4();

        let result = storage
            .create_volumes(group, 1 << 20, vec![], None)
            .await
            .unwrap();
        let volume = result.volumes[0].clone();
        let volume_path = dir.path().join("volumes").join(format!("{volume}.qcow2"));

        tokio::fs::write(&volume_path, b"state-1").await.unwrap();
        storage.create_snapshot(group, "s1".to_string()).await.unwrap();

        tokio::fs::write(&volume_path, b"state-2").await.unwrap();
        storage.create_snapshot(group, "s2".to_string()).await.unwrap();

        let records = storage.query_snapshots(group).await.unwrap();
        assert_eq!(records.len(), 2);
        let s2 = records.iter().find(|r| r.name == "s2").unwrap();
        assert_eq!(s2.parent.as_deref(), Some("s1"));
        assert!(s2.is_current);

        // Creating the same name again is a conflict.
        assert!(matches!(
            storage.create_snapshot(group, "s1".to_string()).await,
            Err(CellError::Conflict(_))
        ));

        // Delete s1: its file merges away, the chain no longer lists it.
        tokio::fs::write(&volume_path, b"state-3").await.unwrap();
        storage.delete_snapshot(group, "s1".to_string()).await.unwrap();
        let records = storage.query_snapshots(group).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "s2");
        assert!(records[0].is_root);
        assert!(!dir
            .path()
            .join("volumes")
            .join(format!("{volume}.s1.qcow2"))
            .exists());
        // The live file keeps the latest state.
        assert_eq!(tokio::fs::read(&volume_path).await.unwrap(), b"state-3");

        // Restore s2: the live file is rebuilt from the snapshot.
        storage.restore_snapshot(group, "s2".to_string()).await.unwrap();
        assert_eq!(tokio::fs::read(&volume_path).await.unwrap(), b"state-2");
        let records = storage.query_snapshots(group).await.unwrap();
        assert!(records[0].is_current);

        // Unknown snapshots are rejected up front.
        assert!(matches!(
            storage.restore_snapshot(group, "missing".to_string()).await,
            Err(CellError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reset_system_volume_recreates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_module(dir.path());
        let group = Uuid::new_v4();

        let result = storage
            .create_volumes(group, 1 << 20, vec![], None)
            .await
            .unwrap();
        let path = dir
            .path()
            .join("volumes")
            .join(format!("{}.qcow2", result.volumes[0]));
        tokio::fs::write(&path, b"dirty").await.unwrap();

        storage.reset_system_volume(group).await.unwrap();
        let metadata = tokio::fs::metadata(&path).await.unwrap();
        assert_eq!(metadata.len(), 1 << 20);
    }

    #[tokio::test]
    async fn paths_query_and_change() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_module(dir.path());

        let paths = storage.query_paths().await.unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].0, "local");

        let moved = dir.path().join("elsewhere");
        storage
            .change_paths("local".to_string(), moved.clone())
            .await
            .unwrap();
        let paths = storage.query_paths().await.unwrap();
        assert_eq!(paths[0].1, moved);

        assert!(matches!(
            storage.change_paths("absent".to_string(), moved).await,
            Err(CellError::NotFound(_))
        ));
    }
}
