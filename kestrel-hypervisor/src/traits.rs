//! Hypervisor abstraction trait.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{DiskDevice, DomainDefinition};
use crate::error::Result;
use crate::types::{CpuPriority, InstanceStatus};

/// Whether a device update targets the running guest, the persistent
/// definition, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAffect {
    Live,
    Config,
    Both,
}

/// The host virtualization library, behind one seam.
///
/// All hypervisor access in the cell funnels through this trait; the
/// implementation is stateless beyond its connection handle. The in-memory
/// [`crate::MockHypervisor`] is the default backend, the libvirt backend is
/// feature-gated.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Define a new persistent domain from its document.
    async fn define_domain(&self, definition: &DomainDefinition) -> Result<()>;

    /// Remove the persistent definition. Fails with `Busy` while running.
    async fn undefine(&self, id: Uuid) -> Result<()>;

    async fn exists(&self, id: Uuid) -> bool;

    async fn is_active(&self, id: Uuid) -> Result<bool>;

    /// Start a defined domain. Fails with `AlreadyRunning` when active.
    async fn start(&self, id: Uuid) -> Result<()>;

    /// Update the CD-ROM slot in the persistent configuration, start the
    /// domain, then empty the live CD-ROM slot; the domain is destroyed
    /// when the last step fails.
    async fn start_with_media(&self, id: Uuid, host: &str, url: &str, port: u16) -> Result<()>;

    /// Stop matrix: `(reboot, force)` selects shutdown / destroy / reboot /
    /// reset. Fails with `NotRunning` when the domain is stopped.
    async fn stop(&self, id: Uuid, reboot: bool, force: bool) -> Result<()>;

    /// Put media into the CD-ROM slot of a running guest (live update).
    async fn insert_media(&self, id: Uuid, host: &str, url: &str, port: u16) -> Result<()>;

    /// Empty the CD-ROM slot of a running guest (live update).
    async fn eject_media(&self, id: Uuid) -> Result<()>;

    /// Persist a new CPU topology for the requested core count.
    async fn modify_cores(&self, id: Uuid, cores: u32) -> Result<()>;

    /// Persist a new memory size in bytes.
    async fn modify_memory(&self, id: Uuid, memory: u64) -> Result<()>;

    /// Set a guest account password through the guest agent.
    async fn modify_password(&self, id: Uuid, user: &str, password: &str) -> Result<()>;

    /// Replace the monitor (VNC) secret in the persistent definition.
    async fn set_monitor_secret(&self, id: Uuid, secret: &str) -> Result<()>;

    /// Rewrite the cputune block for a CPU priority.
    async fn set_cpu_threshold(&self, id: Uuid, priority: CpuPriority) -> Result<()>;

    /// Rewrite the iotune of every writable disk in the persistent
    /// configuration. Refused with `Busy` while the domain is active.
    async fn set_disk_threshold(
        &self,
        id: Uuid,
        read_speed: u64,
        write_speed: u64,
        read_iops: u64,
        write_iops: u64,
    ) -> Result<()>;

    /// Apply interface bandwidth: live parameters when active, persistent
    /// configuration always.
    async fn set_network_threshold(&self, id: Uuid, receive_speed: u64, send_speed: u64) -> Result<()>;

    /// Rename a stopped domain. `Busy` while running, `NoChange` when the
    /// name is unchanged.
    async fn rename(&self, id: Uuid, new_name: &str) -> Result<()>;

    /// Add a volume disk to the persistent configuration and, when the
    /// guest runs, the live configuration.
    async fn attach_volume(&self, id: Uuid, disk: &DiskDevice) -> Result<()>;

    /// Remove the disk with the given target device, persistent + live.
    async fn detach_volume(&self, id: Uuid, device: &str) -> Result<()>;

    async fn get_status(&self, id: Uuid) -> Result<InstanceStatus>;

    /// IPv4 address of the interface with the given MAC, via the guest
    /// agent; empty when the agent has not reported one.
    async fn get_ipv4(&self, id: Uuid, mac: &str) -> Result<String>;

    async fn set_auto_start(&self, id: Uuid, enabled: bool) -> Result<()>;

    /// Current persistent definition of a domain.
    async fn get_definition(&self, id: Uuid) -> Result<DomainDefinition>;

    /// Replace the persistent definition of an existing stopped domain.
    async fn redefine_domain(&self, definition: &DomainDefinition) -> Result<()>;
}
