//! Instance module.
//!
//! Owns the set of known guests and their last-known configuration, and
//! serializes every hypervisor-touching operation through one worker
//! task. A ticker polls runtime status and publishes changes as events.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kestrel_hypervisor::{
    build_domain, device_name, disk_tune, volume_disk, CellError, CpuPriority, DiskBus,
    GuestConfig, Hypervisor, InstanceStatus, Result, IDE_OFFSET_DISK,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credentials::{generate_password, MONITOR_SECRET_LENGTH, PASSWORD_LENGTH};

const COMMAND_QUEUE_DEPTH: usize = 64;
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Events published by the instance module.
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    /// The running flag flipped since the previous poll.
    StatusChanged { guest: Uuid, running: bool },
    /// Periodic status sample of a running guest.
    StatusReport {
        guest: Uuid,
        status: InstanceStatus,
    },
}

enum InstanceCommand {
    Create {
        config: Box<GuestConfig>,
        reply: oneshot::Sender<Result<()>>,
    },
    Delete {
        id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    Start {
        id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    StartWithMedia {
        id: Uuid,
        host: String,
        url: String,
        port: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        id: Uuid,
        reboot: bool,
        force: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Rename {
        id: Uuid,
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ModifyCores {
        id: Uuid,
        cores: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    ModifyMemory {
        id: Uuid,
        memory: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    ModifyPriority {
        id: Uuid,
        priority: CpuPriority,
        reply: oneshot::Sender<Result<()>>,
    },
    ModifyDiskThreshold {
        id: Uuid,
        read_speed: u64,
        write_speed: u64,
        read_iops: u64,
        write_iops: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    ModifyNetworkThreshold {
        id: Uuid,
        receive_speed: u64,
        send_speed: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    ModifyAuth {
        id: Uuid,
        user: Option<String>,
        secret: Option<String>,
        reply: oneshot::Sender<Result<String>>,
    },
    GetAuth {
        id: Uuid,
        reply: oneshot::Sender<Result<(String, String)>>,
    },
    ResetMonitorSecret {
        id: Uuid,
        reply: oneshot::Sender<Result<String>>,
    },
    GetConfig {
        id: Uuid,
        reply: oneshot::Sender<Result<GuestConfig>>,
    },
    GetStatus {
        id: Uuid,
        reply: oneshot::Sender<Result<InstanceStatus>>,
    },
    AttachVolume {
        id: Uuid,
        volume: String,
        size: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    DetachVolume {
        id: Uuid,
        volume: String,
        reply: oneshot::Sender<Result<()>>,
    },
    InsertMedia {
        id: Uuid,
        host: String,
        url: String,
        port: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    EjectMedia {
        id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    UpdateDiskSize {
        id: Uuid,
        index: usize,
        size: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    Redefine {
        id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    List {
        reply: oneshot::Sender<Vec<GuestConfig>>,
    },
}

/// Cheap-to-clone handle onto the instance worker.
#[derive(Clone)]
pub struct InstanceHandle {
    tx: mpsc::Sender<InstanceCommand>,
}

impl InstanceHandle {
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> InstanceCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(command(tx))
            .await
            .map_err(|_| CellError::Internal("instance module stopped".to_string()))?;
        rx.await
            .map_err(|_| CellError::Internal("instance reply dropped".to_string()))
    }

    pub async fn create_instance(&self, config: GuestConfig) -> Result<()> {
        self.call(|tx| InstanceCommand::Create {
            config: Box::new(config),
            reply: tx,
        })
        .await?
    }

    pub async fn delete_instance(&self, id: Uuid) -> Result<()> {
        self.call(|tx| InstanceCommand::Delete { id, reply: tx }).await?
    }

    pub async fn start_instance(&self, id: Uuid) -> Result<()> {
        self.call(|tx| InstanceCommand::Start { id, reply: tx }).await?
    }

    pub async fn start_with_media(&self, id: Uuid, host: String, url: String, port: u16) -> Result<()> {
        self.call(|tx| InstanceCommand::StartWithMedia {
            id,
            host,
            url,
            port,
            reply: tx,
        })
        .await?
    }

    pub async fn stop_instance(&self, id: Uuid, reboot: bool, force: bool) -> Result<()> {
        self.call(|tx| InstanceCommand::Stop {
            id,
            reboot,
            force,
            reply: tx,
        })
        .await?
    }

    pub async fn rename(&self, id: Uuid, name: String) -> Result<()> {
        self.call(|tx| InstanceCommand::Rename { id, name, reply: tx })
            .await?
    }

    pub async fn modify_cores(&self, id: Uuid, cores: u32) -> Result<()> {
        self.call(|tx| InstanceCommand::ModifyCores { id, cores, reply: tx })
            .await?
    }

    pub async fn modify_memory(&self, id: Uuid, memory: u64) -> Result<()> {
        self.call(|tx| InstanceCommand::ModifyMemory { id, memory, reply: tx })
            .await?
    }

    pub async fn modify_priority(&self, id: Uuid, priority: CpuPriority) -> Result<()> {
        self.call(|tx| InstanceCommand::ModifyPriority {
            id,
            priority,
            reply: tx,
        })
        .await?
    }

    pub async fn modify_disk_threshold(
        &self,
        id: Uuid,
        read_speed: u64,
        write_speed: u64,
        read_iops: u64,
        write_iops: u64,
    ) -> Result<()> {
        self.call(|tx| InstanceCommand::ModifyDiskThreshold {
            id,
            read_speed,
            write_speed,
            read_iops,
            write_iops,
            reply: tx,
        })
        .await?
    }

    pub async fn modify_network_threshold(
        &self,
        id: Uuid,
        receive_speed: u64,
        send_speed: u64,
    ) -> Result<()> {
        self.call(|tx| InstanceCommand::ModifyNetworkThreshold {
            id,
            receive_speed,
            send_speed,
            reply: tx,
        })
        .await?
    }

    /// Set the admin password; a missing secret is generated. Returns the
    /// effective secret.
    pub async fn modify_auth(
        &self,
        id: Uuid,
        user: Option<String>,
        secret: Option<String>,
    ) -> Result<String> {
        self.call(|tx| InstanceCommand::ModifyAuth {
            id,
            user,
            secret,
            reply: tx,
        })
        .await?
    }

    pub async fn get_auth(&self, id: Uuid) -> Result<(String, String)> {
        self.call(|tx| InstanceCommand::GetAuth { id, reply: tx }).await?
    }

    /// Replace the monitor secret with a fresh one and return it.
    pub async fn reset_monitor_secret(&self, id: Uuid) -> Result<String> {
        self.call(|tx| InstanceCommand::ResetMonitorSecret { id, reply: tx })
            .await?
    }

    pub async fn get_config(&self, id: Uuid) -> Result<GuestConfig> {
        self.call(|tx| InstanceCommand::GetConfig { id, reply: tx }).await?
    }

    pub async fn get_status(&self, id: Uuid) -> Result<InstanceStatus> {
        self.call(|tx| InstanceCommand::GetStatus { id, reply: tx }).await?
    }

    pub async fn attach_volume(&self, id: Uuid, volume: String, size: u64) -> Result<()> {
        self.call(|tx| InstanceCommand::AttachVolume {
            id,
            volume,
            size,
            reply: tx,
        })
        .await?
    }

    pub async fn detach_volume(&self, id: Uuid, volume: String) -> Result<()> {
        self.call(|tx| InstanceCommand::DetachVolume { id, volume, reply: tx })
            .await?
    }

    pub async fn insert_media(&self, id: Uuid, host: String, url: String, port: u16) -> Result<()> {
        self.call(|tx| InstanceCommand::InsertMedia {
            id,
            host,
            url,
            port,
            reply: tx,
        })
        .await?
    }

    pub async fn eject_media(&self, id: Uuid) -> Result<()> {
        self.call(|tx| InstanceCommand::EjectMedia { id, reply: tx }).await?
    }

    pub async fn update_disk_size(&self, id: Uuid, index: usize, size: u64) -> Result<()> {
        self.call(|tx| InstanceCommand::UpdateDiskSize {
            id,
            index,
            size,
            reply: tx,
        })
        .await?
    }

    /// Rebuild and re-define the domain from the stored configuration.
    pub async fn redefine(&self, id: Uuid) -> Result<()> {
        self.call(|tx| InstanceCommand::Redefine { id, reply: tx }).await?
    }

    pub async fn list_instances(&self) -> Result<Vec<GuestConfig>> {
        self.call(|tx| InstanceCommand::List { reply: tx }).await
    }
}

/// The instance module.
pub struct InstanceModule;

impl InstanceModule {
    pub fn start(
        hypervisor: Arc<dyn Hypervisor>,
        data_path: PathBuf,
    ) -> Result<(InstanceHandle, mpsc::UnboundedReceiver<InstanceEvent>)> {
        std::fs::create_dir_all(&data_path)?;
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let state_path = data_path.join("instances.json");
        let guests = match std::fs::read_to_string(&state_path) {
            Ok(data) => match serde_json::from_str::<Vec<GuestConfig>>(&data) {
                Ok(list) => {
                    info!(count = list.len(), "instance index loaded");
                    list.into_iter().map(|config| (config.id, config)).collect()
                }
                Err(err) => {
                    warn!(path = %state_path.display(), error = %err, "discarding unreadable instance index");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        let worker = InstanceWorker {
            hypervisor,
            guests,
            running: HashMap::new(),
            state_path,
            events: event_tx,
        };
        tokio::spawn(worker.run(rx));
        Ok((InstanceHandle { tx }, event_rx))
    }
}

struct InstanceWorker {
    hypervisor: Arc<dyn Hypervisor>,
    guests: HashMap<Uuid, GuestConfig>,
    running: HashMap<Uuid, bool>,
    state_path: PathBuf,
    events: mpsc::UnboundedSender<InstanceEvent>,
}

impl InstanceWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<InstanceCommand>) {
        info!("instance module started");
        let mut ticker = tokio::time::interval(STATUS_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = ticker.tick() => self.poll_status().await,
            }
        }
        info!("instance module stopped");
    }

    fn persist(&self) {
        let list: Vec<&GuestConfig> = self.guests.values().collect();
        match serde_json::to_string_pretty(&list) {
            Ok(data) => {
                if let Err(err) = std::fs::write(&self.state_path, data) {
                    warn!(path = %self.state_path.display(), error = %err, "persist instance index failed");
                }
            }
            Err(err) => warn!(error = %err, "encode instance index failed"),
        }
    }

    async fn poll_status(&mut self) {
        let ids: Vec<Uuid> = self.guests.keys().copied().collect();
        for id in ids {
            let running = match self.hypervisor.is_active(id).await {
                Ok(running) => running,
                Err(_) => false,
            };
            let previous = self.running.insert(id, running);
            if previous.is_some_and(|previous| previous != running) || previous.is_none() {
                let _ = self.events.send(InstanceEvent::StatusChanged { guest: id, running });
            }
            if running {
                if let Ok(status) = self.hypervisor.get_status(id).await {
                    let _ = self
                        .events
                        .send(InstanceEvent::StatusReport { guest: id, status });
                }
            }
        }
    }

    fn guest(&self, id: Uuid) -> Result<&GuestConfig> {
        self.guests
            .get(&id)
            .ok_or_else(|| CellError::NotFound(format!("guest '{id}'")))
    }

    fn guest_mut(&mut self, id: Uuid) -> Result<&mut GuestConfig> {
        self.guests
            .get_mut(&id)
            .ok_or_else(|| CellError::NotFound(format!("guest '{id}'")))
    }

    async fn handle_command(&mut self, command: InstanceCommand) {
        match command {
            InstanceCommand::Create { config, reply } => {
                let _ = reply.send(self.create(*config).await);
            }
            InstanceCommand::Delete { id, reply } => {
                let _ = reply.send(self.delete(id).await);
            }
            InstanceCommand::Start { id, reply } => {
                let outcome = match self.guest(id) {
                    Ok(_) => self.hypervisor.start(id).await,
                    Err(err) => Err(err),
                };
                let _ = reply.send(outcome);
            }
            InstanceCommand::StartWithMedia {
                id,
                host,
                url,
                port,
                reply,
            } => {
                let outcome = match self.guest(id) {
                    Ok(_) => self.hypervisor.start_with_media(id, &host, &url, port).await,
                    Err(err) => Err(err),
                };
                let _ = reply.send(outcome);
            }
            InstanceCommand::Stop {
                id,
                reboot,
                force,
                reply,
            } => {
                let outcome = match self.guest(id) {
                    Ok(_) => self.hypervisor.stop(id, reboot, force).await,
                    Err(err) => Err(err),
                };
                let _ = reply.send(outcome);
            }
            InstanceCommand::Rename { id, name, reply } => {
                let outcome = self.rename(id, name).await;
                let _ = reply.send(outcome);
            }
            InstanceCommand::ModifyCores { id, cores, reply } => {
                let outcome = match self.guest(id) {
                    Ok(_) => match self.hypervisor.modify_cores(id, cores).await {
                        Ok(()) => {
                            if let Ok(config) = self.guest_mut(id) {
                                config.cores = cores;
                            }
                            self.persist();
                            Ok(())
                        }
                        Err(err) => Err(err),
                    },
                    Err(err) => Err(err),
                };
                let _ = reply.send(outcome);
            }
            InstanceCommand::ModifyMemory { id, memory, reply } => {
                let outcome = match self.guest(id) {
                    Ok(_) => match self.hypervisor.modify_memory(id, memory).await {
                        Ok(()) => {
                            if let Ok(config) = self.guest_mut(id) {
                                config.memory = memory;
                            }
                            self.persist();
                            Ok(())
                        }
                        Err(err) => Err(err),
                    },
                    Err(err) => Err(err),
                };
                let _ = reply.send(outcome);
            }
            InstanceCommand::ModifyPriority { id, priority, reply } => {
                let outcome = match self.guest(id) {
                    Ok(_) => match self.hypervisor.set_cpu_threshold(id, priority).await {
                        Ok(()) => {
                            if let Ok(config) = self.guest_mut(id) {
                                config.cpu_priority = priority;
                            }
                            self.persist();
                            Ok(())
                        }
                        Err(err) => Err(err),
                    },
                    Err(err) => Err(err),
                };
                let _ = reply.send(outcome);
            }
            InstanceCommand::ModifyDiskThreshold {
                id,
                read_speed,
                write_speed,
                read_iops,
                write_iops,
                reply,
            } => {
                let outcome = match self.guest(id) {
                    Ok(_) => {
                        match self
                            .hypervisor
                            .set_disk_threshold(id, read_speed, write_speed, read_iops, write_iops)
                            .await
                        {
                            Ok(()) => {
                                if let Ok(config) = self.guest_mut(id) {
                                    config.read_speed = read_speed;
                                    config.write_speed = write_speed;
                                    config.read_iops = read_iops;
                                    config.write_iops = write_iops;
                                }
                                self.persist();
                                Ok(())
                            }
                            Err(err) => Err(err),
                        }
                    }
                    Err(err) => Err(err),
                };
                let _ = reply.send(outcome);
            }
            InstanceCommand::ModifyNetworkThreshold {
                id,
                receive_speed,
                send_speed,
                reply,
            } => {
                let outcome = match self.guest(id) {
                    Ok(_) => {
                        match self
                            .hypervisor
                            .set_network_threshold(id, receive_speed, send_speed)
                            .await
                        {
                            Ok(()) => {
                                if let Ok(config) = self.guest_mut(id) {
                                    config.receive_speed = receive_speed;
                                    config.send_speed = send_speed;
                                }
                                self.persist();
                                Ok(())
                            }
                            Err(err) => Err(err),
                        }
                    }
                    Err(err) => Err(err),
                };
                let _ = reply.send(outcome);
            }
            InstanceCommand::ModifyAuth {
                id,
                user,
                secret,
                reply,
            } => {
                let _ = reply.send(self.modify_auth(id, user, secret).await);
            }
            InstanceCommand::GetAuth { id, reply } => {
                let outcome = self
                    .guest(id)
                    .map(|config| (config.auth_user.clone(), config.auth_secret.clone()));
                let _ = reply.send(outcome);
            }
            InstanceCommand::ResetMonitorSecret { id, reply } => {
                let outcome = match self.guest(id) {
                    Ok(_) => {
                        let secret = generate_password(MONITOR_SECRET_LENGTH);
                        match self.hypervisor.set_monitor_secret(id, &secret).await {
                            Ok(()) => {
                                if let Ok(config) = self.guest_mut(id) {
                                    config.monitor_secret = secret.clone();
                                }
                                self.persist();
                                Ok(secret)
                            }
                            Err(err) => Err(err),
                        }
                    }
                    Err(err) => Err(err),
                };
                let _ = reply.send(outcome);
            }
            InstanceCommand::GetConfig { id, reply } => {
                let _ = reply.send(self.guest(id).cloned());
            }
            InstanceCommand::GetStatus { id, reply } => {
                let outcome = match self.guest(id) {
                    Ok(_) => self.hypervisor.get_status(id).await,
                    Err(err) => Err(err),
                };
                let _ = reply.send(outcome);
            }
            InstanceCommand::AttachVolume {
                id,
                volume,
                size,
                reply,
            } => {
                let _ = reply.send(self.attach_volume(id, volume, size).await);
            }
            InstanceCommand::DetachVolume { id, volume, reply } => {
                let _ = reply.send(self.detach_volume(id, volume).await);
            }
            InstanceCommand::InsertMedia {
                id,
                host,
                url,
                port,
                reply,
            } => {
                let outcome = match self.guest(id) {
                    Ok(_) => self.hypervisor.insert_media(id, &host, &url, port).await,
                    Err(err) => Err(err),
                };
                let _ = reply.send(outcome);
            }
            InstanceCommand::EjectMedia { id, reply } => {
                let outcome = match self.guest(id) {
                    Ok(_) => self.hypervisor.eject_media(id).await,
                    Err(err) => Err(err),
                };
                let _ = reply.send(outcome);
            }
            InstanceCommand::UpdateDiskSize {
                id,
                index,
                size,
                reply,
            } => {
                let outcome = match self.guest_mut(id) {
                    Ok(config) => {
                        if index < config.disks.len() {
                            config.disks[index] = size;
                            self.persist();
                            Ok(())
                        } else {
                            Err(CellError::InvalidInput(format!(
                                "disk index {index} out of range"
                            )))
                        }
                    }
                    Err(err) => Err(err),
                };
                let _ = reply.send(outcome);
            }
            InstanceCommand::Redefine { id, reply } => {
                let outcome = match self.guest(id) {
                    Ok(config) => match build_domain(config) {
                        Ok(definition) => self.hypervisor.redefine_domain(&definition).await,
                        Err(err) => Err(err),
                    },
                    Err(err) => Err(err),
                };
                let _ = reply.send(outcome);
            }
            InstanceCommand::List { reply } => {
                let _ = reply.send(self.guests.values().cloned().collect());
            }
        }
    }

    async fn create(&mut self, mut config: GuestConfig) -> Result<()> {
        if self.guests.contains_key(&config.id) {
            return Err(CellError::Conflict(format!(
                "guest '{}' already exists",
                config.id
            )));
        }
        if self.guests.values().any(|existing| existing.name == config.name) {
            return Err(CellError::Conflict(format!(
                "guest name '{}' already taken",
                config.name
            )));
        }
        if config.monitor_secret.is_empty() {
            config.monitor_secret = generate_password(MONITOR_SECRET_LENGTH);
        }
        let definition = build_domain(&config)?;
        self.hypervisor.define_domain(&definition).await?;
        if config.auto_start {
            if let Err(err) = self.hypervisor.set_auto_start(config.id, true).await {
                warn!(guest = %config.id, error = %err, "set auto start failed");
            }
        }
        config.created = true;
        info!(guest = %config.id, name = %config.name, "guest defined");
        self.guests.insert(config.id, config);
        self.persist();
        Ok(())
    }

    async fn delete(&mut self, id: Uuid) -> Result<()> {
        self.guest(id)?;
        if self.hypervisor.exists(id).await {
            // Fails with Busy while the guest is running.
            self.hypervisor.undefine(id).await?;
        }
        self.guests.remove(&id);
        self.running.remove(&id);
        self.persist();
        info!(guest = %id, "guest removed");
        Ok(())
    }

    async fn rename(&mut self, id: Uuid, name: String) -> Result<()> {
        self.guest(id)?;
        if self.guests.values().any(|existing| existing.id != id && existing.name == name) {
            return Err(CellError::Conflict(format!("guest name '{name}' already taken")));
        }
        self.hypervisor.rename(id, &name).await?;
        if let Ok(config) = self.guest_mut(id) {
            config.name = name;
        }
        self.persist();
        Ok(())
    }

    async fn modify_auth(
        &mut self,
        id: Uuid,
        user: Option<String>,
        secret: Option<String>,
    ) -> Result<String> {
        let config = self.guest(id)?;
        let user = user.unwrap_or_else(|| config.auth_user.clone());
        let secret = match secret {
            Some(secret) if !secret.is_empty() => secret,
            _ => generate_password(PASSWORD_LENGTH),
        };
        self.hypervisor.modify_password(id, &user, &secret).await?;
        if let Ok(config) = self.guest_mut(id) {
            config.auth_user = user;
            config.auth_secret = secret.clone();
        }
        self.persist();
        Ok(secret)
    }

    async fn attach_volume(&mut self, id: Uuid, volume: String, size: u64) -> Result<()> {
        let config = self.guest(id)?;
        let bus = config.template.disk;
        let tune = disk_tune(
            config.read_speed,
            config.write_speed,
            config.read_iops,
            config.write_iops,
        );
        let pool = config.storage_pool.clone();

        // Pick the first unused slot on the data-disk bus.
        let definition = self.hypervisor.get_definition(id).await?;
        let start = match bus {
            DiskBus::Ide => IDE_OFFSET_DISK,
            DiskBus::Scsi | DiskBus::Sata => 0,
        };
        let mut offset = start;
        let device = loop {
            let candidate = device_name(bus.device_prefix(), offset);
            if !definition
                .devices
                .disks
                .iter()
                .any(|disk| disk.target.device == candidate)
            {
                break candidate;
            }
            offset += 1;
        };

        let disk = volume_disk(&pool, &volume, bus, device, tune);
        self.hypervisor.attach_volume(id, &disk).await?;
        if let Ok(config) = self.guest_mut(id) {
            config.storage_volumes.push(volume);
            config.disks.push(size);
        }
        self.persist();
        Ok(())
    }

    async fn detach_volume(&mut self, id: Uuid, volume: String) -> Result<()> {
        let config = self.guest(id)?;
        let position = config
            .storage_volumes
            .iter()
            .position(|name| name == &volume)
            .ok_or_else(|| CellError::NotFound(format!("volume '{volume}'")))?;
        if position == 0 {
            return Err(CellError::InvalidInput(
                "the system volume cannot be detached".to_string(),
            ));
        }
        let definition = self.hypervisor.get_definition(id).await?;
        let device = definition
            .devices
            .disks
            .iter()
            .find(|disk| {
                disk.source
                    .as_ref()
                    .and_then(|source| source.volume.as_deref())
                    == Some(volume.as_str())
            })
            .map(|disk| disk.target.device.clone())
            .ok_or_else(|| CellError::NotFound(format!("no device carries volume '{volume}'")))?;
        self.hypervisor.detach_volume(id, &device).await?;
        if let Ok(config) = self.guest_mut(id) {
            config.storage_volumes.remove(position);
            if position < config.disks.len() {
                config.disks.remove(position);
            }
        }
        self.persist();
        debug!(guest = %id, volume = %volume, "volume detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_hypervisor::{HardwareTemplate, MockHypervisor};

    fn sample_config(id: Uuid, name: &str) -> GuestConfig {
        let mut config = GuestConfig::new(id, name);
        config.cores = 2;
        config.memory = 1 << 30;
        config.disks = vec![20 << 30];
        config.monitor_port = 5901;
        config.hardware_address = "00:16:3e:aa:bb:01".to_string();
        config.network_source = "br0".to_string();
        config.storage_pool = "local".to_string();
        config.storage_volumes = vec![format!("{id}_sys")];
        config.template = HardwareTemplate::default();
        config.auth_user = "root".to_string();
        config.auth_secret = "initial".to_string();
        config
    }

    fn start_module(dir: &std::path::Path) -> (InstanceHandle, Arc<MockHypervisor>) {
        let mock = Arc::new(MockHypervisor::new());
        let (handle, _events) =
            InstanceModule::start(mock.clone(), dir.to_path_buf()).unwrap();
        (handle, mock)
    }

    #[tokio::test]
    async fn create_marks_guest_created_and_rejects_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let (instances, _mock) = start_module(dir.path());
        let id = Uuid::new_v4();

        instances
            .create_instance(sample_config(id, "dev.alpha"))
            .await
            .unwrap();
        let stored = instances.get_config(id).await.unwrap();
        assert!(stored.created);
        assert!(!stored.monitor_secret.is_empty());

        // Same id again.
        assert!(matches!(
            instances.create_instance(sample_config(id, "dev.beta")).await,
            Err(CellError::Conflict(_))
        ));
        // Same name under a new id.
        assert!(matches!(
            instances
                .create_instance(sample_config(Uuid::new_v4(), "dev.alpha"))
                .await,
            Err(CellError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn delete_requires_stopped_guest() {
        let dir = tempfile::tempdir().unwrap();
        let (instances, _mock) = start_module(dir.path());
        let id = Uuid::new_v4();

        instances
            .create_instance(sample_config(id, "dev.alpha"))
            .await
            .unwrap();
        instances.start_instance(id).await.unwrap();
        assert!(matches!(
            instances.delete_instance(id).await,
            Err(CellError::Busy(_))
        ));

        instances.stop_instance(id, false, false).await.unwrap();
        instances.delete_instance(id).await.unwrap();
        assert!(matches!(
            instances.get_config(id).await,
            Err(CellError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn attach_and_detach_update_config_and_domain() {
        let dir = tempfile::tempdir().unwrap();
        let (instances, mock) = start_module(dir.path());
        let id = Uuid::new_v4();

        instances
            .create_instance(sample_config(id, "dev.alpha"))
            .await
            .unwrap();
        instances
            .attach_volume(id, format!("{id}_data0"), 10 << 30)
            .await
            .unwrap();

        let config = instances.get_config(id).await.unwrap();
        assert_eq!(config.storage_volumes.len(), 2);
        assert_eq!(config.disks, vec![20 << 30, 10 << 30]);
        let definition = mock.get_definition(id).await.unwrap();
        // CD-ROM slot + system volume + attached data volume.
        assert_eq!(definition.devices.disks.len(), 3);

        // The system volume cannot go away.
        assert!(matches!(
            instances.detach_volume(id, format!("{id}_sys")).await,
            Err(CellError::InvalidInput(_))
        ));

        instances
            .detach_volume(id, format!("{id}_data0"))
            .await
            .unwrap();
        let config = instances.get_config(id).await.unwrap();
        assert_eq!(config.storage_volumes.len(), 1);
        let definition = mock.get_definition(id).await.unwrap();
        assert_eq!(definition.devices.disks.len(), 2);
    }

    #[tokio::test]
    async fn modify_auth_generates_missing_secret() {
        let dir = tempfile::tempdir().unwrap();
        let (instances, _mock) = start_module(dir.path());
        let id = Uuid::new_v4();

        instances
            .create_instance(sample_config(id, "dev.alpha"))
            .await
            .unwrap();
        // Password changes go through the guest agent and need a running
        // guest.
        instances.start_instance(id).await.unwrap();

        let secret = instances.modify_auth(id, None, None).await.unwrap();
        assert_eq!(secret.len(), PASSWORD_LENGTH);
        let (user, stored) = instances.get_auth(id).await.unwrap();
        assert_eq!(user, "root");
        assert_eq!(stored, secret);
    }

    #[tokio::test]
    async fn reset_monitor_secret_rotates_the_password() {
        let dir = tempfile::tempdir().unwrap();
        let (instances, mock) = start_module(dir.path());
        let id = Uuid::new_v4();

        instances
            .create_instance(sample_config(id, "dev.alpha"))
            .await
            .unwrap();
        let before = instances.get_config(id).await.unwrap().monitor_secret;
        let secret = instances.reset_monitor_secret(id).await.unwrap();
        assert_ne!(secret, before);
        let definition = mock.get_definition(id).await.unwrap();
        assert_eq!(definition.devices.graphics.password, secret);
    }
}
