//! Libvirt backend.
//!
//! Maps the [`Hypervisor`] trait onto the `virt` crate. Library errors are
//! surfaced verbatim as `HypervisorFailed`. The connection handle is
//! shared; the backend keeps no other state.

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use crate::domain::{
    disk_tune, CpuTopology, CpuTune, DiskDevice, DomainDefinition, InterfaceBandwidth,
    DISK_TYPE_VOLUME,
};
use crate::error::{CellError, Result};
use crate::traits::Hypervisor;
use crate::types::{CpuPriority, InstanceStatus};

/// Hypervisor backend over a libvirt connection.
pub struct LibvirtHypervisor {
    connection: Connect,
}

impl LibvirtHypervisor {
    /// Connect to the given libvirt URI (`qemu:///system` in production).
    pub fn connect(uri: &str) -> Result<Self> {
        info!(uri = %uri, "connecting to hypervisor");
        let connection =
            Connect::open(Some(uri)).map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        Ok(Self { connection })
    }

    fn domain(&self, id: Uuid) -> Result<Domain> {
        Domain::lookup_by_uuid_string(&self.connection, &id.to_string())
            .map_err(|e| CellError::NotFound(format!("domain '{id}': {e}")))
    }

    fn domain_active(domain: &Domain) -> Result<bool> {
        domain
            .is_active()
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))
    }

    fn current_definition(domain: &Domain) -> Result<DomainDefinition> {
        let xml = domain
            .get_xml_desc(0)
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        DomainDefinition::from_xml(&xml)
    }

    fn update_device(domain: &Domain, device_xml: &str, flags: u32) -> Result<()> {
        domain
            .update_device_flags(device_xml, flags)
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))
    }

    fn cdrom_device_xml(device: &DiskDevice) -> Result<String> {
        quick_xml::se::to_string(device)
            .map_err(|e| CellError::Internal(format!("serialize device: {e}")))
    }
}

#[async_trait]
impl Hypervisor for LibvirtHypervisor {
    async fn define_domain(&self, definition: &DomainDefinition) -> Result<()> {
        let xml = definition.to_xml()?;
        debug!(name = %definition.name, "defining domain");
        Domain::define_xml(&self.connection, &xml)
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        Ok(())
    }

    async fn undefine(&self, id: Uuid) -> Result<()> {
        let domain = self.domain(id)?;
        if Self::domain_active(&domain)? {
            return Err(CellError::Busy(format!("domain '{id}' is running")));
        }
        domain
            .undefine()
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))
    }

    async fn exists(&self, id: Uuid) -> bool {
        self.domain(id).is_ok()
    }

    async fn is_active(&self, id: Uuid) -> Result<bool> {
        Self::domain_active(&self.domain(id)?)
    }

    async fn start(&self, id: Uuid) -> Result<()> {
        let domain = self.domain(id)?;
        if Self::domain_active(&domain)? {
            return Err(CellError::AlreadyRunning(format!("domain '{id}'")));
        }
        domain
            .create()
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        Ok(())
    }

    async fn start_with_media(&self, id: Uuid, host: &str, url: &str, port: u16) -> Result<()> {
        let domain = self.domain(id)?;
        if Self::domain_active(&domain)? {
            return Err(CellError::AlreadyRunning(format!("domain '{id}'")));
        }
        let with_media = Self::cdrom_device_xml(&DiskDevice::media_cdrom(host, url, port))?;
        let without_media = Self::cdrom_device_xml(&DiskDevice::empty_cdrom())?;

        Self::update_device(&domain, &with_media, sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG)?;
        domain
            .create()
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        if let Err(err) =
            Self::update_device(&domain, &without_media, sys::VIR_DOMAIN_DEVICE_MODIFY_LIVE)
        {
            if let Err(destroy_err) = domain.destroy() {
                warn!(domain = %id, error = %destroy_err, "destroy after failed media detach");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn stop(&self, id: Uuid, reboot: bool, force: bool) -> Result<()> {
        let domain = self.domain(id)?;
        if !Self::domain_active(&domain)? {
            return Err(CellError::NotRunning(format!("domain '{id}'")));
        }
        let outcome = match (reboot, force) {
            (false, false) => domain.shutdown(),
            (false, true) => domain.destroy(),
            (true, false) => domain.reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT).map(|_| ()),
            (true, true) => domain.reset().map(|_| ()),
        };
        outcome.map_err(|e| CellError::HypervisorFailed(e.to_string()))
    }

    async fn insert_media(&self, id: Uuid, host: &str, url: &str, port: u16) -> Result<()> {
        let domain = self.domain(id)?;
        if !Self::domain_active(&domain)? {
            return Err(CellError::NotRunning(format!("domain '{id}'")));
        }
        let with_media = Self::cdrom_device_xml(&DiskDevice::media_cdrom(host, url, port))?;
        Self::update_device(&domain, &with_media, sys::VIR_DOMAIN_DEVICE_MODIFY_LIVE)
    }

    async fn eject_media(&self, id: Uuid) -> Result<()> {
        let domain = self.domain(id)?;
        if !Self::domain_active(&domain)? {
            return Err(CellError::NotRunning(format!("domain '{id}'")));
        }
        let without_media = Self::cdrom_device_xml(&DiskDevice::empty_cdrom())?;
        Self::update_device(&domain, &without_media, sys::VIR_DOMAIN_DEVICE_MODIFY_LIVE)
    }

    async fn modify_cores(&self, id: Uuid, cores: u32) -> Result<()> {
        let domain = self.domain(id)?;
        let current = Self::current_definition(&domain)?;
        let topology = CpuTopology::for_cores(cores)?;

        // The hypervisor offers no typed topology update; replace the
        // single element in place and redefine.
        let xml = domain
            .get_xml_desc(0)
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        let replaced = xml.replacen(
            &current.cpu.topology.to_inline_xml(),
            &topology.to_inline_xml(),
            1,
        );
        let domain = Domain::define_xml(&self.connection, &replaced)
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        domain
            .set_vcpus_flags(
                cores,
                sys::VIR_DOMAIN_VCPU_CONFIG | sys::VIR_DOMAIN_VCPU_MAXIMUM,
            )
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        Ok(())
    }

    async fn modify_memory(&self, id: Uuid, memory: u64) -> Result<()> {
        let domain = self.domain(id)?;
        let memory_kib = memory >> 10;
        let max_memory = domain
            .get_max_memory()
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        if memory_kib > max_memory {
            domain
                .set_memory_flags(
                    memory_kib,
                    sys::VIR_DOMAIN_MEM_CONFIG | sys::VIR_DOMAIN_MEM_MAXIMUM,
                )
                .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        }
        domain
            .set_memory_flags(memory_kib, sys::VIR_DOMAIN_MEM_CONFIG)
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))
    }

    async fn modify_password(&self, id: Uuid, user: &str, password: &str) -> Result<()> {
        let domain = self.domain(id)?;
        domain
            .set_user_password(user, password, 0)
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))
    }

    async fn set_monitor_secret(&self, id: Uuid, secret: &str) -> Result<()> {
        let domain = self.domain(id)?;
        let mut definition = Self::current_definition(&domain)?;
        definition.devices.graphics.password = secret.to_string();
        self.redefine_domain(&definition).await
    }

    async fn set_cpu_threshold(&self, id: Uuid, priority: CpuPriority) -> Result<()> {
        let domain = self.domain(id)?;
        let mut definition = Self::current_definition(&domain)?;
        definition.cputune = CpuTune::for_priority(priority);
        let xml = definition.to_xml()?;
        Domain::define_xml(&self.connection, &xml)
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
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
        let domain = self.domain(id)?;
        if Self::domain_active(&domain)? {
            return Err(CellError::Busy(format!("domain '{id}' is still running")));
        }
        let mut definition = Self::current_definition(&domain)?;
        let tune = disk_tune(read_speed, write_speed, read_iops, write_iops);
        for disk in definition.writable_disks_mut() {
            disk.iotune = tune.clone();
            let device_xml = Self::cdrom_device_xml(disk)?;
            Self::update_device(&domain, &device_xml, sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG)?;
        }
        Ok(())
    }

    async fn set_network_threshold(&self, id: Uuid, receive_speed: u64, send_speed: u64) -> Result<()> {
        let domain = self.domain(id)?;
        let active = Self::domain_active(&domain)?;
        let mut definition = Self::current_definition(&domain)?;
        let bandwidth = InterfaceBandwidth::from_speeds(receive_speed, send_speed);
        for interface in &mut definition.devices.interfaces {
            interface.bandwidth = bandwidth.clone();
            let device_xml = quick_xml::se::to_string(interface)
                .map_err(|e| CellError::Internal(format!("serialize device: {e}")))?;
            if active {
                Self::update_device(&domain, &device_xml, sys::VIR_DOMAIN_DEVICE_MODIFY_LIVE)?;
            }
            Self::update_device(&domain, &device_xml, sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG)?;
        }
        Ok(())
    }

    async fn rename(&self, id: Uuid, new_name: &str) -> Result<()> {
        let domain = self.domain(id)?;
        if Self::domain_active(&domain)? {
            return Err(CellError::Busy(format!("domain '{id}' is still running")));
        }
        let current = domain
            .get_name()
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        if current == new_name {
            return Err(CellError::NoChange("name unchanged".to_string()));
        }
        domain
            .rename(new_name, 0)
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        Ok(())
    }

    async fn attach_volume(&self, id: Uuid, disk: &DiskDevice) -> Result<()> {
        let domain = self.domain(id)?;
        let device_xml = Self::cdrom_device_xml(disk)?;
        Self::update_device(&domain, &device_xml, sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG)?;
        if Self::domain_active(&domain)? {
            Self::update_device(&domain, &device_xml, sys::VIR_DOMAIN_DEVICE_MODIFY_LIVE)?;
        }
        Ok(())
    }

    async fn detach_volume(&self, id: Uuid, device: &str) -> Result<()> {
        let domain = self.domain(id)?;
        let definition = Self::current_definition(&domain)?;
        let disk = definition
            .devices
            .disks
            .iter()
            .find(|disk| disk.target.device == device)
            .ok_or_else(|| CellError::NotFound(format!("device '{device}'")))?;
        let device_xml = Self::cdrom_device_xml(disk)?;
        domain
            .detach_device_flags(&device_xml, sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG)
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        if Self::domain_active(&domain)? {
            domain
                .detach_device_flags(&device_xml, sys::VIR_DOMAIN_DEVICE_MODIFY_LIVE)
                .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn get_status(&self, id: Uuid) -> Result<InstanceStatus> {
        let domain = self.domain(id)?;
        let mut status = InstanceStatus::default();
        status.running = Self::domain_active(&domain)?;
        if !status.running {
            return Ok(status);
        }
        let info = domain
            .get_info()
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        status.cpu_time_ns = info.cpu_time;
        status.cores = info.nr_virt_cpu;
        status.available_memory = info.memory << 10;

        let definition = Self::current_definition(&domain)?;
        for disk in &definition.devices.disks {
            if disk.disk_type != DISK_TYPE_VOLUME {
                continue;
            }
            if let Ok(stats) = domain.block_stats(&disk.target.device) {
                status.bytes_read += stats.rd_bytes.max(0) as u64;
                status.bytes_written += stats.wr_bytes.max(0) as u64;
            }
        }
        for interface in &definition.devices.interfaces {
            if let Some(target) = &interface.target {
                if let Ok(stats) = domain.interface_stats(&target.device) {
                    status.bytes_received += stats.rx_bytes.max(0) as u64;
                    status.bytes_sent += stats.tx_bytes.max(0) as u64;
                }
            }
        }
        Ok(status)
    }

    async fn get_ipv4(&self, id: Uuid, mac: &str) -> Result<String> {
        let domain = self.domain(id)?;
        if !Self::domain_active(&domain)? {
            return Err(CellError::NotRunning(format!("domain '{id}'")));
        }
        let interfaces = domain
            .interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_AGENT, 0)
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        for interface in interfaces {
            if interface.hwaddr != mac {
                continue;
            }
            for address in interface.addrs {
                if address.addr_type == sys::VIR_IP_ADDR_TYPE_IPV4 as i32 {
                    return Ok(address.addr);
                }
            }
        }
        Ok(String::new())
    }

    async fn set_auto_start(&self, id: Uuid, enabled: bool) -> Result<()> {
        let domain = self.domain(id)?;
        domain
            .set_autostart(enabled)
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        Ok(())
    }

    async fn get_definition(&self, id: Uuid) -> Result<DomainDefinition> {
        Self::current_definition(&self.domain(id)?)
    }

    async fn redefine_domain(&self, definition: &DomainDefinition) -> Result<()> {
        let xml = definition.to_xml()?;
        Domain::define_xml(&self.connection, &xml)
            .map_err(|e| CellError::HypervisorFailed(e.to_string()))?;
        Ok(())
    }
}
