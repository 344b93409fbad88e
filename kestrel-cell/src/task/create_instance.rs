//! Create-guest executor: the staged pipeline of the cell.
//!
//! Network and storage resources are allocated in order, the domain is
//! defined, and an optional clone from a remote disk image streams into
//! the system volume. Any stage failure releases everything allocated so
//! far before the failure reply goes out.

use std::time::Duration;

use async_trait::async_trait;
use kestrel_hypervisor::{
    generate_mac_address, BootIsoConfig, CellError, CpuPriority, GuestConfig, HardwareTemplate,
    NetworkMode, PolicyProtocol, Result, SecurityPolicy, SecurityRule, StorageMode, u32_to_ipv4,
};
use rand::thread_rng;
use tokio::time::{interval, timeout, Instant};
use tracing::{info, warn};

use crate::credentials::{generate_password, MONITOR_SECRET_LENGTH, PASSWORD_LENGTH};
use crate::protocol::{Message, MessageKind, ParamKey, SessionId};
use crate::task::{instance_param, release_resource, respond_fail, CellModules};
use crate::transaction::Executor;

/// Poll interval of the clone loop.
const CLONE_CHECK_INTERVAL: Duration = Duration::from_secs(2);
/// Default data-disk mount path when the request leaves it empty.
const DEFAULT_DATA_PATH: &str = "/opt/data";

const MODULE_QEMU: &str = "qemu";
const MODULE_CLOUD_INIT: &str = "cloud-init";

/// Source of a clone-from-image create.
struct CloneSource {
    image: String,
    host: String,
    port: u16,
    size: u64,
}

struct ParsedRequest {
    config: GuestConfig,
    system_size: u64,
    data_sizes: Vec<u64>,
    clone: Option<CloneSource>,
}

pub struct CreateInstanceExecutor {
    modules: CellModules,
}

impl CreateInstanceExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }

    /// Extract and range-check every parameter; nothing is allocated when
    /// any of this fails.
    fn parse_request(request: &Message) -> Result<ParsedRequest> {
        let id = instance_param(request)?;
        let mut config = GuestConfig::new(id, request.get_string(ParamKey::Name)?);
        config.user = request.get_string(ParamKey::User)?;
        config.group = request.get_string(ParamKey::Group)?;
        config.cores = u32::try_from(request.get_uint(ParamKey::Core)?)
            .map_err(|_| CellError::InvalidInput("core count out of range".to_string()))?;
        config.memory = request.get_uint(ParamKey::Memory)?;
        config.auto_start = request.get_bool(ParamKey::Option)?;
        config.auth_user = request.get_string(ParamKey::Admin)?;

        let disks = request.get_uint_array(ParamKey::Disk)?;
        if disks.is_empty() {
            return Err(CellError::InvalidInput("must specify disk size".to_string()));
        }
        let system_size = disks[0];
        let data_sizes = disks[1..].to_vec();
        config.disks = disks;

        config.template = HardwareTemplate::from_options(&request.get_uint_array(ParamKey::Template)?)?;

        let modes = request.get_uint_array(ParamKey::Mode)?;
        if modes.len() != 2 {
            return Err(CellError::InvalidInput(format!(
                "unexpected mode params count {}",
                modes.len()
            )));
        }
        config.network_mode = NetworkMode::try_from(modes[0])?;
        config.storage_mode = StorageMode::try_from(modes[1])?;

        let clone = if request.has(ParamKey::Image) {
            Some(CloneSource {
                image: request.get_string(ParamKey::Image)?,
                host: request.get_string(ParamKey::Host)?,
                port: u16::try_from(request.get_uint(ParamKey::Port)?)
                    .map_err(|_| CellError::InvalidInput("media port out of range".to_string()))?,
                size: request.get_uint(ParamKey::Size)?,
            })
        } else {
            None
        };

        if request.has(ParamKey::Address) {
            let assigned = request.get_string_array(ParamKey::Address)?;
            if assigned.len() != 2 {
                return Err(CellError::InvalidInput(format!(
                    "unexpected assigned addresses count {}",
                    assigned.len()
                )));
            }
            config.internal_address = Some(assigned[0].clone()).filter(|s| !s.is_empty());
            config.external_address = Some(assigned[1].clone()).filter(|s| !s.is_empty());
        }

        if request.has(ParamKey::Priority) {
            config.cpu_priority = CpuPriority::try_from(request.get_uint(ParamKey::Priority)?)?;
        }
        if request.has(ParamKey::Limit) {
            let limits = request.get_uint_array(ParamKey::Limit)?;
            if limits.len() != 6 {
                return Err(CellError::InvalidInput(format!(
                    "invalid QoS parameters count {}",
                    limits.len()
                )));
            }
            config.read_speed = limits[0];
            config.write_speed = limits[1];
            config.read_iops = limits[2];
            config.write_iops = limits[3];
            config.receive_speed = limits[4];
            config.send_speed = limits[5];
        }

        if request.has(ParamKey::Policy) {
            config.security = Some(Self::parse_security_policy(request)?);
        }

        if request.has(ParamKey::Module) {
            for module in request.get_string_array(ParamKey::Module)? {
                match module.as_str() {
                    MODULE_QEMU => config.qemu_available = true,
                    MODULE_CLOUD_INIT => config.cloud_init = true,
                    other => {
                        return Err(CellError::InvalidInput(format!("invalid module '{other}'")))
                    }
                }
            }
        }

        let flags = request.get_uint_array(ParamKey::Flag)?;
        if flags.len() != 1 {
            return Err(CellError::InvalidInput(format!(
                "invalid flags count {}",
                flags.len()
            )));
        }
        config.root_login_enabled = flags[0] & 1 == 1;

        if config.cloud_init {
            let secret = request.get_string(ParamKey::Secret)?;
            config.auth_secret = if secret.is_empty() {
                generate_password(PASSWORD_LENGTH)
            } else {
                secret
            };
            let data_path = request.get_string(ParamKey::Path)?;
            config.data_path = if data_path.is_empty() {
                DEFAULT_DATA_PATH.to_string()
            } else {
                data_path
            };
        }

        Ok(ParsedRequest {
            config,
            system_size,
            data_sizes,
            clone,
        })
    }

    fn parse_security_policy(request: &Message) -> Result<SecurityPolicy> {
        const ELEMENTS_PER_RULE: usize = 5;
        let parameters = request.get_uint_array(ParamKey::Policy)?;
        if parameters.len() % ELEMENTS_PER_RULE != 0 {
            return Err(CellError::InvalidInput(format!(
                "invalid policy parameters count {}",
                parameters.len()
            )));
        }
        let accept = request.get_bool(ParamKey::Action)?;
        let mut rules = Vec::with_capacity(parameters.len() / ELEMENTS_PER_RULE);
        for rule in parameters.chunks_exact(ELEMENTS_PER_RULE) {
            rules.push(SecurityRule {
                accept: rule[0] == 1,
                protocol: PolicyProtocol::try_from(rule[1])?,
                source_address: u32_to_ipv4(
                    u32::try_from(rule[2]).map_err(|_| {
                        CellError::InvalidInput("source address out of range".to_string())
                    })?,
                ),
                target_address: u32_to_ipv4(
                    u32::try_from(rule[3]).map_err(|_| {
                        CellError::InvalidInput("target address out of range".to_string())
                    })?,
                ),
                target_port: u16::try_from(rule[4]).map_err(|_| {
                    CellError::InvalidInput("target port out of range".to_string())
                })?,
            });
        }
        Ok(SecurityPolicy { accept, rules })
    }

    /// Notify the controller of the finished guest, then auto-start it
    /// when requested.
    async fn finish_creation(
        &self,
        session: SessionId,
        config: &GuestConfig,
        target: &str,
    ) -> Result<()> {
        let mut created = Message::event(MessageKind::GuestCreatedEvent, session);
        created.set_string(ParamKey::Instance, config.id.to_string());
        created.set_uint(ParamKey::Monitor, u64::from(config.monitor_port));
        created.set_string(ParamKey::Secret, config.monitor_secret.clone());
        created.set_string(ParamKey::Hardware, config.hardware_address.clone());
        if let Err(err) = self.modules.sender.send(created, target) {
            warn!(session = format_args!("{session:08X}"), error = %err, "notify guest created failed");
        }
        if config.auto_start {
            self.start_auto_start_instance(session, config, target).await;
        }
        Ok(())
    }

    async fn start_auto_start_instance(&self, session: SessionId, config: &GuestConfig, target: &str) {
        if let Err(err) = self.modules.instance.start_instance(config.id).await {
            warn!(session = format_args!("{session:08X}"), guest = %config.id, error = %err, "auto start failed");
            return;
        }
        info!(session = format_args!("{session:08X}"), guest = %config.id, "auto start instance started");
        let mut started = Message::event(MessageKind::GuestStartedEvent, session);
        started.set_string(ParamKey::Instance, config.id.to_string());
        if let Err(err) = self.modules.sender.send(started, target) {
            warn!(session = format_args!("{session:08X}"), error = %err, "notify guest started failed");
        }
    }

    /// Drive the clone: wait for the scheduled signal, then multiplex
    /// progress and result against the inactivity window.
    async fn clone_from_image(
        &self,
        session: SessionId,
        config: &GuestConfig,
        clone: CloneSource,
        system_size: u64,
        target: &str,
    ) -> Result<()> {
        let mut update = Message::event(MessageKind::GuestUpdatedEvent, session);
        update.set_string(ParamKey::Instance, config.id.to_string());

        let system_volume = config.storage_volumes[0].clone();
        let mut channels = match self
            .modules
            .storage
            .read_disk_image(
                session,
                config.id,
                system_volume,
                clone.image,
                system_size,
                clone.size,
                clone.host,
                clone.port,
            )
            .await
        {
            Ok(channels) => channels,
            Err(err) => {
                release_resource(&self.modules, session, config.id, true, true, true).await;
                return respond_fail(self.modules.sender.as_ref(), update, &err, target);
            }
        };

        // The start signal is bounded by the operate timeout.
        match timeout(self.modules.operate_timeout, channels.start).await {
            Ok(Ok(Ok(()))) => {
                info!(session = format_args!("{session:08X}"), "disk image cloning started");
            }
            Ok(Ok(Err(err))) => {
                warn!(session = format_args!("{session:08X}"), error = %err, "start disk image cloning failed");
                release_resource(&self.modules, session, config.id, true, true, true).await;
                return respond_fail(self.modules.sender.as_ref(), update, &err, target);
            }
            Ok(Err(_)) | Err(_) => {
                let err = CellError::Timeout("start clone disk image timeout".to_string());
                release_resource(&self.modules, session, config.id, true, true, true).await;
                return respond_fail(self.modules.sender.as_ref(), update, &err, target);
            }
        }

        let mut latest_update = Instant::now();
        let mut ticker = interval(CLONE_CHECK_INTERVAL);
        let mut progress_open = true;
        let outcome: Result<u64> = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if latest_update.elapsed() > self.modules.operate_timeout {
                        warn!(session = format_args!("{session:08X}"), "clone disk image stalled");
                        break Err(CellError::Timeout("clone disk image timeout".to_string()));
                    }
                }
                progress = channels.progress.recv(), if progress_open => {
                    match progress {
                        Some(progress) => {
                            latest_update = Instant::now();
                            update.set_uint(ParamKey::Progress, u64::from(progress));
                            info!(session = format_args!("{session:08X}"), progress, "clone progress");
                            if let Err(err) = self.modules.sender.send(update.clone(), target) {
                                warn!(session = format_args!("{session:08X}"), error = %err, "notify progress failed");
                            }
                        }
                        None => progress_open = false,
                    }
                }
                result = &mut channels.result => {
                    break match result {
                        Ok(outcome) => outcome,
                        Err(_) => Err(CellError::Internal("clone result channel closed".to_string())),
                    };
                }
            }
        };
        match outcome {
            Ok(size) => {
                info!(session = format_args!("{session:08X}"), size, "clone disk image finished");
                self.finish_creation(session, config, target).await
            }
            Err(err) => {
                warn!(session = format_args!("{session:08X}"), error = %err, "clone disk image failed");
                release_resource(&self.modules, session, config.id, true, true, true).await;
                respond_fail(self.modules.sender.as_ref(), update, &err, target)
            }
        }
    }
}

#[async_trait]
impl Executor for CreateInstanceExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response = Message::response_to(&request, MessageKind::CreateGuestResponse, session);
        let target = request.sender.clone();

        let parsed = match Self::parse_request(&request) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(session = format_args!("{session:08X}"), error = %err, "create guest rejected");
                return respond_fail(self.modules.sender.as_ref(), response, &err, &target);
            }
        };
        let ParsedRequest {
            mut config,
            system_size,
            data_sizes,
            clone,
        } = parsed;

        info!(
            session = format_args!("{session:08X}"),
            guest = %config.id,
            name = %config.name,
            cores = config.cores,
            memory_mb = config.memory >> 20,
            "create instance requested"
        );

        // Network allocation: bridge lookup, then the atomic reservation.
        if config.hardware_address.is_empty() {
            config.hardware_address = generate_mac_address(&mut thread_rng());
        }
        match self.modules.network.get_current_config().await {
            Ok(status) => {
                config.network_source = status.bridge;
                config.address_allocation = status.allocation_mode;
            }
            Err(err) => {
                warn!(session = format_args!("{session:08X}"), error = %err, "get default bridge failed");
                return respond_fail(self.modules.sender.as_ref(), response, &err, &target);
            }
        }
        match self
            .modules
            .network
            .allocate_instance_resource(
                config.id,
                config.hardware_address.clone(),
                config.internal_address.clone(),
                config.external_address.clone(),
            )
            .await
        {
            Ok(allocation) => {
                config.monitor_port = allocation.monitor_port;
                info!(session = format_args!("{session:08X}"), port = allocation.monitor_port, "monitor port allocated");
            }
            Err(err) => {
                warn!(session = format_args!("{session:08X}"), error = %err, "allocate network resources failed");
                return respond_fail(self.modules.sender.as_ref(), response, &err, &target);
            }
        }

        // Storage allocation, rolled back together with the network on
        // any later failure.
        let boot = config.cloud_init.then(|| BootIsoConfig {
            instance_id: config.id.to_string(),
            hostname: config.name.replace('.', "-"),
            admin_name: config.auth_user.clone(),
            admin_secret: config.auth_secret.clone(),
            data_path: config.data_path.clone(),
            root_login_enabled: config.root_login_enabled,
        });
        match self
            .modules
            .storage
            .create_volumes(config.id, system_size, data_sizes, boot)
            .await
        {
            Ok(result) => {
                config.storage_pool = result.pool;
                config.storage_volumes = result.volumes;
                config.boot_image = result.image;
                info!(
                    session = format_args!("{session:08X}"),
                    pool = %config.storage_pool,
                    volumes = config.storage_volumes.len(),
                    "volumes allocated"
                );
            }
            Err(err) => {
                warn!(session = format_args!("{session:08X}"), error = %err, "create volumes failed");
                release_resource(&self.modules, session, config.id, true, false, false).await;
                return respond_fail(self.modules.sender.as_ref(), response, &err, &target);
            }
        }

        // Define the domain.
        config.monitor_secret = generate_password(MONITOR_SECRET_LENGTH);
        if let Err(err) = self.modules.instance.create_instance(config.clone()).await {
            warn!(session = format_args!("{session:08X}"), error = %err, "create instance failed");
            release_resource(&self.modules, session, config.id, true, true, false).await;
            return respond_fail(self.modules.sender.as_ref(), response, &err, &target);
        }
        config.created = true;

        // Initial success reply; clone progress follows as events.
        response.set_string(ParamKey::Instance, config.id.to_string());
        response.set_bool(ParamKey::Enable, config.created);
        response.success = true;
        if let Err(err) = self.modules.sender.send(response, &target) {
            warn!(session = format_args!("{session:08X}"), error = %err, "send create response failed");
            return Err(err);
        }

        match clone {
            None => self.finish_creation(session, &config, &target).await,
            Some(clone) => {
                self.clone_from_image(session, &config, clone, system_size, &target)
                    .await
            }
        }
    }
}
