//! Volume executors: attach/detach, resize, shrink, system reset and
//! disk-image upload.

use async_trait::async_trait;
use kestrel_hypervisor::{CellError, GuestConfig, Result};
use tokio::time::{interval, timeout, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::protocol::{Message, MessageKind, ParamKey, SessionId};
use crate::task::{instance_param, respond_fail, CellModules};
use crate::transaction::Executor;

const UPLOAD_CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

async fn require_stopped(modules: &CellModules, id: Uuid) -> Result<()> {
    let status = modules.instance.get_status(id).await?;
    if status.running {
        return Err(CellError::Busy(format!("guest '{id}' is running")));
    }
    Ok(())
}

/// Resolve a disk index from the request into the volume name.
fn volume_by_index(config: &GuestConfig, index: u64) -> Result<String> {
    config
        .storage_volumes
        .get(index as usize)
        .cloned()
        .ok_or_else(|| CellError::InvalidInput(format!("disk index {index} out of range")))
}

pub struct AttachInstanceExecutor {
    modules: CellModules,
}

impl AttachInstanceExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for AttachInstanceExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response = Message::response_to(&request, MessageKind::AttachInstanceResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let id = instance_param(&request)?;
            let size = request.get_uint(ParamKey::Size)?;
            if size == 0 {
                return Err(CellError::InvalidInput("zero volume size".to_string()));
            }
            let volume = self.modules.storage.extend_group(id, size).await?;
            if let Err(err) = self
                .modules
                .instance
                .attach_volume(id, volume.clone(), size)
                .await
            {
                // The freshly allocated volume must not leak.
                if let Err(release_err) =
                    self.modules.storage.remove_volume(id, volume.clone()).await
                {
                    warn!(session = format_args!("{session:08X}"), error = %release_err, "release orphaned volume failed");
                }
                return Err(err);
            }
            info!(session = format_args!("{session:08X}"), guest = %id, volume = %volume, "volume attached");
            Ok::<_, CellError>(volume)
        }
        .await;

        match outcome {
            Ok(volume) => {
                response.set_string(ParamKey::Volume, volume);
                response.success = true;
                self.modules.sender.send(response, &target)
            }
            Err(err) => respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        }
    }
}

pub struct DetachInstanceExecutor {
    modules: CellModules,
}

impl DetachInstanceExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for DetachInstanceExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response = Message::response_to(&request, MessageKind::DetachInstanceResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let id = instance_param(&request)?;
            let volume = request.get_string(ParamKey::Volume)?;
            self.modules.instance.detach_volume(id, volume.clone()).await?;
            self.modules.storage.remove_volume(id, volume.clone()).await?;
            info!(session = format_args!("{session:08X}"), guest = %id, volume = %volume, "volume detached");
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

pub struct ResizeGuestVolumeExecutor {
    modules: CellModules,
}

impl ResizeGuestVolumeExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for ResizeGuestVolumeExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response = Message::response_to(&request, MessageKind::ResizeDiskResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let id = instance_param(&request)?;
            let index = request.get_uint(ParamKey::Disk)?;
            let size = request.get_uint(ParamKey::Size)?;
            require_stopped(&self.modules, id).await?;
            let config = self.modules.instance.get_config(id).await?;
            let volume = volume_by_index(&config, index)?;

            let result = self
                .modules
                .storage
                .resize_volume(session, id, volume, size)
                .await?;
            result
                .await
                .map_err(|_| CellError::Internal("resize result channel closed".to_string()))??;
            self.modules
                .instance
                .update_disk_size(id, index as usize, size)
                .await?;
            info!(session = format_args!("{session:08X}"), guest = %id, index, size, "volume resized");
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

pub struct ShrinkGuestVolumeExecutor {
    modules: CellModules,
}

impl ShrinkGuestVolumeExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for ShrinkGuestVolumeExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response = Message::response_to(&request, MessageKind::ShrinkDiskResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let id = instance_param(&request)?;
            let index = request.get_uint(ParamKey::Disk)?;
            require_stopped(&self.modules, id).await?;
            let config = self.modules.instance.get_config(id).await?;
            let volume = volume_by_index(&config, index)?;

            let result = self.modules.storage.shrink_volume(session, id, volume).await?;
            result
                .await
                .map_err(|_| CellError::Internal("shrink result channel closed".to_string()))??;
            info!(session = format_args!("{session:08X}"), guest = %id, index, "volume shrunk");
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

pub struct ResetGuestSystemExecutor {
    modules: CellModules,
}

impl ResetGuestSystemExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for ResetGuestSystemExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response = Message::response_to(&request, MessageKind::ResetSystemResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let id = instance_param(&request)?;
            require_stopped(&self.modules, id).await?;
            // Fresh system volume, then the domain is defined again so
            // the disk set matches.
            self.modules.storage.reset_system_volume(id).await?;
            self.modules.instance.redefine(id).await?;
            info!(session = format_args!("{session:08X}"), guest = %id, "system reset");
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

pub struct CreateDiskImageExecutor {
    modules: CellModules,
}

impl CreateDiskImageExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for CreateDiskImageExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response =
            Message::response_to(&request, MessageKind::CreateDiskImageResponse, session);
        let target = request.sender.clone();

        let prepared = async {
            let id = instance_param(&request)?;
            let image = request.get_string(ParamKey::Image)?;
            let host = request.get_string(ParamKey::Host)?;
            let port = u16::try_from(request.get_uint(ParamKey::Port)?)
                .map_err(|_| CellError::InvalidInput("image port out of range".to_string()))?;
            require_stopped(&self.modules, id).await?;
            let config = self.modules.instance.get_config(id).await?;
            let system = config
                .storage_volumes
                .first()
                .cloned()
                .ok_or_else(|| CellError::NotFound("no system volume".to_string()))?;
            Ok::<_, CellError>((id, image, host, port, system))
        }
        .await;

        let (id, image, host, port, system) = match prepared {
            Ok(parts) => parts,
            Err(err) => return respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        };

        let mut channels = match self
            .modules
            .storage
            .write_disk_image(session, id, system, image, host, port)
            .await
        {
            Ok(channels) => channels,
            Err(err) => return respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        };

        match timeout(self.modules.operate_timeout, channels.start).await {
            Ok(Ok(Ok(()))) => {
                info!(session = format_args!("{session:08X}"), guest = %id, "disk image upload started");
            }
            Ok(Ok(Err(err))) => {
                return respond_fail(self.modules.sender.as_ref(), response, &err, &target)
            }
            Ok(Err(_)) | Err(_) => {
                let err = CellError::Timeout("start disk image upload timeout".to_string());
                return respond_fail(self.modules.sender.as_ref(), response, &err, &target);
            }
        }

        let mut update = Message::event(MessageKind::GuestUpdatedEvent, session);
        update.set_string(ParamKey::Instance, id.to_string());

        let mut latest_update = Instant::now();
        let mut ticker = interval(UPLOAD_CHECK_INTERVAL);
        let mut progress_open = true;
        let outcome: Result<u64> = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if latest_update.elapsed() > self.modules.operate_timeout {
                        break Err(CellError::Timeout("disk image upload timeout".to_string()));
                    }
                }
                progress = channels.progress.recv(), if progress_open => {
                    match progress {
                        Some(progress) => {
                            latest_update = Instant::now();
                            update.set_uint(ParamKey::Progress, u64::from(progress));
                            if let Err(err) = self.modules.sender.send(update.clone(), &target) {
                                warn!(session = format_args!("{session:08X}"), error = %err, "notify upload progress failed");
                            }
                        }
                        None => progress_open = false,
                    }
                }
                result = &mut channels.result => {
                    break match result {
                        Ok(outcome) => outcome,
                        Err(_) => Err(CellError::Internal("upload result channel closed".to_string())),
                    };
                }
            }
        };

        match outcome {
            Ok(size) => {
                info!(session = format_args!("{session:08X}"), guest = %id, size, "disk image uploaded");
                response.set_uint(ParamKey::Size, size);
                response.success = true;
                self.modules.sender.send(response, &target)
            }
            Err(err) => {
                warn!(session = format_args!("{session:08X}"), error = %err, "disk image upload failed");
                respond_fail(self.modules.sender.as_ref(), response, &err, &target)
            }
        }
    }
}
