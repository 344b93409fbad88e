//! In-memory hypervisor backend.
//!
//! The mock enforces the same preconditions as the real backend and
//! records which power verb each call would issue, which is what the
//! lifecycle tests assert against. It is also the development-mode
//! backend of the cell daemon.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    disk_tune, CpuTopology, CpuTune, DiskDevice, DomainDefinition, InterfaceBandwidth,
};
use crate::error::{CellError, Result};
use crate::traits::Hypervisor;
use crate::types::{CpuPriority, InstanceStatus};

/// The power verb a stop/start call resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerVerb {
    Start,
    Shutdown,
    Destroy,
    Reboot,
    Reset,
}

#[derive(Debug, Clone)]
struct MockDomain {
    definition: DomainDefinition,
    active: bool,
    auto_start: bool,
    /// Media currently in the CD-ROM slot of the live configuration.
    live_media: Option<String>,
}

#[derive(Default)]
struct MockState {
    domains: HashMap<Uuid, MockDomain>,
    verbs: Vec<(Uuid, PowerVerb)>,
}

/// In-memory [`Hypervisor`] implementation.
#[derive(Clone, Default)]
pub struct MockHypervisor {
    state: Arc<RwLock<MockState>>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Power verbs observed so far, in call order.
    pub async fn recorded_verbs(&self) -> Vec<(Uuid, PowerVerb)> {
        self.state.read().await.verbs.clone()
    }

    /// Media URL currently mounted in the live CD-ROM slot.
    pub async fn live_media(&self, id: Uuid) -> Option<String> {
        self.state
            .read()
            .await
            .domains
            .get(&id)
            .and_then(|domain| domain.live_media.clone())
    }

    pub async fn domain_count(&self) -> usize {
        self.state.read().await.domains.len()
    }

    fn lookup<'a>(state: &'a MockState, id: Uuid) -> Result<&'a MockDomain> {
        state
            .domains
            .get(&id)
            .ok_or_else(|| CellError::NotFound(format!("domain '{id}'")))
    }

    fn lookup_mut<'a>(state: &'a mut MockState, id: Uuid) -> Result<&'a mut MockDomain> {
        state
            .domains
            .get_mut(&id)
            .ok_or_else(|| CellError::NotFound(format!("domain '{id}'")))
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn define_domain(&self, definition: &DomainDefinition) -> Result<()> {
        let id: Uuid = definition
            .uuid
            .parse()
            .map_err(|_| CellError::InvalidInput(format!("invalid uuid '{}'", definition.uuid)))?;
        let mut state = self.state.write().await;
        if state.domains.contains_key(&id) {
            return Err(CellError::Conflict(format!("domain '{id}' already defined")));
        }
        debug!(domain = %id, name = %definition.name, "domain defined");
        state.domains.insert(
            id,
            MockDomain {
                definition: definition.clone(),
                active: false,
                auto_start: false,
                live_media: None,
            },
        );
        Ok(())
    }

    async fn undefine(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let domain = Self::lookup(&state, id)?;
        if domain.active {
            return Err(CellError::Busy(format!("domain '{id}' is running")));
        }
        state.domains.remove(&id);
        Ok(())
    }

    async fn exists(&self, id: Uuid) -> bool {
        self.state.read().await.domains.contains_key(&id)
    }

    async fn is_active(&self, id: Uuid) -> Result<bool> {
        let state = self.state.read().await;
        Ok(Self::lookup(&state, id)?.active)
    }

    async fn start(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let domain = Self::lookup_mut(&mut state, id)?;
        if domain.active {
            return Err(CellError::AlreadyRunning(format!("domain '{id}'")));
        }
        domain.active = true;
        state.verbs.push((id, PowerVerb::Start));
        Ok(())
    }

    async fn start_with_media(&self, id: Uuid, host: &str, url: &str, port: u16) -> Result<()> {
        let mut state = self.state.write().await;
        let domain = Self::lookup_mut(&mut state, id)?;
        if domain.active {
            return Err(CellError::AlreadyRunning(format!("domain '{id}'")));
        }
        // Persistent CD-ROM update, start, then live slot emptied.
        let media = DiskDevice::media_cdrom(host, url, port);
        domain.definition.devices.disks[0] = media;
        domain.active = true;
        domain.definition.devices.disks[0] = DiskDevice::empty_cdrom();
        domain.live_media = None;
        state.verbs.push((id, PowerVerb::Start));
        Ok(())
    }

    async fn stop(&self, id: Uuid, reboot: bool, force: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let domain = Self::lookup_mut(&mut state, id)?;
        if !domain.active {
            return Err(CellError::NotRunning(format!("domain '{id}'")));
        }
        let verb = match (reboot, force) {
            (false, false) => {
                domain.active = false;
                PowerVerb::Shutdown
            }
            (false, true) => {
                domain.active = false;
                PowerVerb::Destroy
            }
            (true, false) => PowerVerb::Reboot,
            (true, true) => PowerVerb::Reset,
        };
        state.verbs.push((id, verb));
        Ok(())
    }

    async fn insert_media(&self, id: Uuid, host: &str, url: &str, port: u16) -> Result<()> {
        let mut state = self.state.write().await;
        let domain = Self::lookup_mut(&mut state, id)?;
        if !domain.active {
            return Err(CellError::NotRunning(format!("domain '{id}'")));
        }
        domain.live_media = Some(format!("https://{host}:{port}/{url}"));
        Ok(())
    }

    async fn eject_media(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let domain = Self::lookup_mut(&mut state, id)?;
        if !domain.active {
            return Err(CellError::NotRunning(format!("domain '{id}'")));
        }
        domain.live_media = None;
        Ok(())
    }

    async fn modify_cores(&self, id: Uuid, cores: u32) -> Result<()> {
        let topology = CpuTopology::for_cores(cores)?;
        let mut state = self.state.write().await;
        let domain = Self::lookup_mut(&mut state, id)?;
        domain.definition.cpu.topology = topology;
        domain.definition.vcpu = cores;
        Ok(())
    }

    async fn modify_memory(&self, id: Uuid, memory: u64) -> Result<()> {
        let mut state = self.state.write().await;
        let domain = Self::lookup_mut(&mut state, id)?;
        domain.definition.memory = memory >> 10;
        Ok(())
    }

    async fn modify_password(&self, id: Uuid, _user: &str, _password: &str) -> Result<()> {
        let state = self.state.read().await;
        let domain = Self::lookup(&state, id)?;
        if !domain.active {
            return Err(CellError::NotRunning(format!("domain '{id}'")));
        }
        Ok(())
    }

    async fn set_monitor_secret(&self, id: Uuid, secret: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let domain = Self::lookup_mut(&mut state, id)?;
        domain.definition.devices.graphics.password = secret.to_string();
        Ok(())
    }

    async fn set_cpu_threshold(&self, id: Uuid, priority: CpuPriority) -> Result<()> {
        let mut state = self.state.write().await;
        let domain = Self::lookup_mut(&mut state, id)?;
        domain.definition.cputune = CpuTune::for_priority(priority);
        Ok(())
    }

    async fn set_disk_threshold(
        &self,
        id: Uuid,
        read_speed: u64,
        write_speed: u64,
        read_iops: u64,
        write_iops: u64,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let domain = Self::lookup_mut(&mut state, id)?;
        if domain.active {
            return Err(CellError::Busy(format!("domain '{id}' is still running")));
        }
        let tune = disk_tune(read_speed, write_speed, read_iops, write_iops);
        for disk in domain.definition.writable_disks_mut() {
            disk.iotune = tune.clone();
        }
        Ok(())
    }

    async fn set_network_threshold(&self, id: Uuid, receive_speed: u64, send_speed: u64) -> Result<()> {
        let mut state = self.state.write().await;
        let domain = Self::lookup_mut(&mut state, id)?;
        let bandwidth = InterfaceBandwidth::from_speeds(receive_speed, send_speed);
        for interface in &mut domain.definition.devices.interfaces {
            interface.bandwidth = bandwidth.clone();
        }
        Ok(())
    }

    async fn rename(&self, id: Uuid, new_name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let domain = Self::lookup_mut(&mut state, id)?;
        if domain.active {
            return Err(CellError::Busy(format!("domain '{id}' is still running")));
        }
        if domain.definition.name == new_name {
            return Err(CellError::NoChange("name unchanged".to_string()));
        }
        domain.definition.name = new_name.to_string();
        Ok(())
    }

    async fn attach_volume(&self, id: Uuid, disk: &DiskDevice) -> Result<()> {
        let mut state = self.state.write().await;
        let domain = Self::lookup_mut(&mut state, id)?;
        if domain
            .definition
            .devices
            .disks
            .iter()
            .any(|existing| existing.target.device == disk.target.device)
        {
            return Err(CellError::Conflict(format!(
                "device '{}' already attached",
                disk.target.device
            )));
        }
        domain.definition.devices.disks.push(disk.clone());
        Ok(())
    }

    async fn detach_volume(&self, id: Uuid, device: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let domain = Self::lookup_mut(&mut state, id)?;
        let before = domain.definition.devices.disks.len();
        domain
            .definition
            .devices
            .disks
            .retain(|disk| disk.target.device != device);
        if domain.definition.devices.disks.len() == before {
            return Err(CellError::NotFound(format!("device '{device}'")));
        }
        Ok(())
    }

    async fn get_status(&self, id: Uuid) -> Result<InstanceStatus> {
        let state = self.state.read().await;
        let domain = Self::lookup(&state, id)?;
        if !domain.active {
            return Ok(InstanceStatus::default());
        }
        Ok(InstanceStatus {
            running: true,
            available_memory: domain.definition.memory << 10,
            bytes_read: 0,
            bytes_written: 0,
            bytes_received: 0,
            bytes_sent: 0,
            cpu_time_ns: 0,
            cores: domain.definition.vcpu,
        })
    }

    async fn get_ipv4(&self, id: Uuid, _mac: &str) -> Result<String> {
        let state = self.state.read().await;
        let domain = Self::lookup(&state, id)?;
        if !domain.active {
            return Err(CellError::NotRunning(format!("domain '{id}'")));
        }
        Ok(String::new())
    }

    async fn set_auto_start(&self, id: Uuid, enabled: bool) -> Result<()> {
        let mut state = self.state.write().await;
        Self::lookup_mut(&mut state, id)?.auto_start = enabled;
        Ok(())
    }

    async fn get_definition(&self, id: Uuid) -> Result<DomainDefinition> {
        let state = self.state.read().await;
        Ok(Self::lookup(&state, id)?.definition.clone())
    }

    async fn redefine_domain(&self, definition: &DomainDefinition) -> Result<()> {
        let id: Uuid = definition
            .uuid
            .parse()
            .map_err(|_| CellError::InvalidInput(format!("invalid uuid '{}'", definition.uuid)))?;
        let mut state = self.state.write().await;
        let domain = Self::lookup_mut(&mut state, id)?;
        if domain.active {
            return Err(CellError::Busy(format!("domain '{id}' is running")));
        }
        domain.definition = definition.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::build_domain;
    use crate::types::GuestConfig;

    async fn defined_guest() -> (MockHypervisor, Uuid) {
        let id = Uuid::new_v4();
        let mut config = GuestConfig::new(id, "dev.mock");
        config.cores = 2;
        config.memory = 1 << 30;
        config.monitor_port = 5901;
        config.hardware_address = "00:16:3e:00:00:01".to_string();
        config.network_source = "br0".to_string();
        config.storage_pool = "local".to_string();
        config.storage_volumes = vec!["g_sys".to_string()];
        let definition = build_domain(&config).unwrap();

        let mock = MockHypervisor::new();
        mock.define_domain(&definition).await.unwrap();
        (mock, id)
    }

    #[tokio::test]
    async fn stop_matrix_resolves_verbs() {
        let (mock, id) = defined_guest().await;

        mock.start(id).await.unwrap();
        mock.stop(id, true, false).await.unwrap();
        mock.stop(id, true, true).await.unwrap();
        mock.stop(id, false, true).await.unwrap();

        let verbs: Vec<PowerVerb> = mock
            .recorded_verbs()
            .await
            .into_iter()
            .map(|(_, verb)| verb)
            .collect();
        assert_eq!(
            verbs,
            vec![
                PowerVerb::Start,
                PowerVerb::Reboot,
                PowerVerb::Reset,
                PowerVerb::Destroy
            ]
        );
    }

    #[tokio::test]
    async fn stop_on_stopped_guest_is_not_running() {
        let (mock, id) = defined_guest().await;
        assert!(matches!(
            mock.stop(id, false, false).await,
            Err(CellError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn start_twice_is_already_running() {
        let (mock, id) = defined_guest().await;
        mock.start(id).await.unwrap();
        assert!(matches!(
            mock.start(id).await,
            Err(CellError::AlreadyRunning(_))
        ));
    }

    #[tokio::test]
    async fn undefine_running_guest_is_busy() {
        let (mock, id) = defined_guest().await;
        mock.start(id).await.unwrap();
        assert!(matches!(mock.undefine(id).await, Err(CellError::Busy(_))));
        mock.stop(id, false, false).await.unwrap();
        mock.undefine(id).await.unwrap();
        assert!(!mock.exists(id).await);
    }

    #[tokio::test]
    async fn disk_threshold_refused_while_active() {
        let (mock, id) = defined_guest().await;
        mock.start(id).await.unwrap();
        assert!(matches!(
            mock.set_disk_threshold(id, 1, 2, 3, 4).await,
            Err(CellError::Busy(_))
        ));
        // Unchanged after the refusal.
        let definition = mock.get_definition(id).await.unwrap();
        assert!(definition.devices.disks[1].iotune.is_none());

        mock.stop(id, false, false).await.unwrap();
        mock.set_disk_threshold(id, 1 << 20, 0, 500, 0).await.unwrap();
        let definition = mock.get_definition(id).await.unwrap();
        let tune = definition.devices.disks[1].iotune.as_ref().unwrap();
        assert_eq!(tune.read_bytes_sec, Some(1 << 20));
        assert_eq!(tune.read_iops_sec, Some(500));
    }

    #[tokio::test]
    async fn rename_preconditions() {
        let (mock, id) = defined_guest().await;
        mock.start(id).await.unwrap();
        assert!(matches!(
            mock.rename(id, "dev.other").await,
            Err(CellError::Busy(_))
        ));
        mock.stop(id, false, false).await.unwrap();
        assert!(matches!(
            mock.rename(id, "dev.mock").await,
            Err(CellError::NoChange(_))
        ));
        mock.rename(id, "dev.other").await.unwrap();
        assert_eq!(mock.get_definition(id).await.unwrap().name, "dev.other");
    }

    #[tokio::test]
    async fn media_requires_running_guest() {
        let (mock, id) = defined_guest().await;
        assert!(matches!(
            mock.insert_media(id, "h", "disk_images/x", 443).await,
            Err(CellError::NotRunning(_))
        ));
        mock.start(id).await.unwrap();
        mock.insert_media(id, "h", "disk_images/x", 443).await.unwrap();
        assert!(mock.live_media(id).await.is_some());
        mock.eject_media(id).await.unwrap();
        assert!(mock.live_media(id).await.is_none());
    }

    #[tokio::test]
    async fn attach_detach_volume() {
        let (mock, id) = defined_guest().await;
        let disk = crate::domain::volume_disk(
            "local",
            "g_data0",
            crate::types::DiskBus::Scsi,
            "sdb".to_string(),
            None,
        );
        mock.attach_volume(id, &disk).await.unwrap();
        assert!(matches!(
            mock.attach_volume(id, &disk).await,
            Err(CellError::Conflict(_))
        ));
        mock.detach_volume(id, "sdb").await.unwrap();
        assert!(matches!(
            mock.detach_volume(id, "sdb").await,
            Err(CellError::NotFound(_))
        ));
    }
}
