//! Declarative domain document and the builder that composes it.
//!
//! The domain document is a typed record serialized to libvirt domain XML
//! with quick-xml. [`build_domain`] turns a [`GuestConfig`] plus its
//! hardware template into a complete definition; it performs no I/O.

use rand::thread_rng;
use serde::{Deserialize, Serialize};

use crate::error::{CellError, Result};
use crate::types::{
    generate_mac_address, CpuPriority, DiskBus, GuestConfig, StorageMode, TabletBus, UsbModel,
};

const DOMAIN_TYPE_KVM: &str = "kvm";
const OS_NAME_HVM: &str = "hvm";
const OS_ARCH: &str = "x86_64";
const OS_MACHINE: &str = "pc";
const EMULATOR_PATH: &str = "/usr/bin/qemu-system-x86_64";
const LIFECYCLE_DESTROY: &str = "destroy";
const LIFECYCLE_RESTART: &str = "restart";
const PM_DISABLED: &str = "no";
const CLOCK_OFFSET_UTC: &str = "utc";

const BOOT_DEVICE_CDROM: &str = "cdrom";
const BOOT_DEVICE_HARD_DISK: &str = "hd";

pub const DISK_TYPE_BLOCK: &str = "block";
pub const DISK_TYPE_FILE: &str = "file";
pub const DISK_TYPE_NETWORK: &str = "network";
pub const DISK_TYPE_VOLUME: &str = "volume";
pub const DEVICE_CDROM: &str = "cdrom";
pub const DEVICE_DISK: &str = "disk";
pub const DRIVER_NAME_QEMU: &str = "qemu";
pub const DRIVER_TYPE_RAW: &str = "raw";
pub const DRIVER_TYPE_QCOW2: &str = "qcow2";
pub const PROTOCOL_HTTPS: &str = "https";

const INTERFACE_TYPE_BRIDGE: &str = "bridge";
const GRAPHICS_VNC: &str = "vnc";
const LISTEN_TYPE_ADDRESS: &str = "address";
const LISTEN_ALL_ADDRESSES: &str = "0.0.0.0";

const CONTROLLER_PCI: &str = "pci";
const CONTROLLER_SCSI: &str = "scsi";
const CONTROLLER_USB: &str = "usb";
const CONTROLLER_MODEL_PCI_ROOT: &str = "pci-root";
const CONTROLLER_MODEL_VIRTIO_SCSI: &str = "virtio-scsi";
const INPUT_TABLET: &str = "tablet";

const BALLOON_MODEL_VIRTIO: &str = "virtio";
const BALLOON_STATS_PERIOD: u32 = 2;
const CHANNEL_TYPE_UNIX: &str = "unix";
const CHANNEL_TARGET_VIRTIO: &str = "virtio";
const GUEST_AGENT_CHANNEL: &str = "org.qemu.guest_agent.0";

/// Slot offsets on the IDE bus: the always-present empty CD-ROM, the
/// optional cloud-init data CD-ROM, then data disks when the bus is IDE.
pub const IDE_OFFSET_CDROM: u8 = 0;
pub const IDE_OFFSET_CIDATA: u8 = 1;
pub const IDE_OFFSET_DISK: u8 = 2;

const START_DEVICE_CHARACTER: u8 = b'a';

/// Target device name for a prefix and slot index (`hd` + 0 → `hda`).
pub fn device_name(prefix: &str, offset: u8) -> String {
    format!("{}{}", prefix, (START_DEVICE_CHARACTER + offset) as char)
}

// =============================================================================
// DOCUMENT RECORD
// =============================================================================

/// Marker for presence-only XML elements such as `<acpi/>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsType {
    #[serde(rename = "@arch")]
    pub arch: String,
    #[serde(rename = "@machine")]
    pub machine: String,
    #[serde(rename = "$text")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootDevice {
    #[serde(rename = "@dev")]
    pub device: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsElement {
    #[serde(rename = "type")]
    pub os_type: OsType,
    #[serde(rename = "boot", default)]
    pub boot_order: Vec<BootDevice>,
}

/// CPU topology; the product of the three factors is the guest vcpu count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopology {
    #[serde(rename = "@sockets")]
    pub sockets: u32,
    #[serde(rename = "@cores")]
    pub cores: u32,
    #[serde(rename = "@threads")]
    pub threads: u32,
}

impl CpuTopology {
    /// Compute the topology for a requested core count.
    ///
    /// Odd counts above one are rejected. Counts below two run on a single
    /// socket without SMT. Larger counts use two threads per core and
    /// double the socket count (up to eight) until at most 32 cores land
    /// on each socket; counts that still exceed that fail with `NoFit`.
    pub fn for_cores(total: u32) -> Result<Self> {
        const THREADS_PER_CORE: u32 = 2;
        const MAX_CORES: u32 = 1 << 5;
        const MAX_SOCKETS: u32 = 1 << 3;

        if total == 0 {
            return Err(CellError::InvalidInput("zero cores requested".to_string()));
        }
        if total > 1 && total % 2 != 0 {
            return Err(CellError::InvalidInput(format!(
                "even core number required, got {total}"
            )));
        }
        if total < THREADS_PER_CORE {
            return Ok(Self {
                sockets: 1,
                cores: total,
                threads: 1,
            });
        }
        let mut sockets = 1;
        while total / sockets > MAX_CORES {
            sockets <<= 1;
            if sockets > MAX_SOCKETS {
                return Err(CellError::NoFit(format!(
                    "no topology fits {total} cores"
                )));
            }
        }
        Ok(Self {
            sockets,
            cores: total / (THREADS_PER_CORE * sockets),
            threads: THREADS_PER_CORE,
        })
    }

    /// The single-element XML form used for in-place topology replacement,
    /// the one spot where the hypervisor forces raw text substitution.
    pub fn to_inline_xml(&self) -> String {
        format!(
            "<topology sockets='{}' cores='{}' threads='{}'/>",
            self.sockets, self.cores, self.threads
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuElement {
    pub topology: CpuTopology,
}

/// cgroup knobs derived from the CPU priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTune {
    pub shares: u64,
    pub period: u64,
    pub quota: u64,
}

impl CpuTune {
    pub fn for_priority(priority: CpuPriority) -> Self {
        const PERIOD_PER_SECOND: u64 = 1_000_000;
        const QUOTA_PER_SECOND: u64 = 1_000_000;
        const HIGH_SHARES: u64 = 2000;
        const MEDIUM_SHARES: u64 = 1000;
        const LOW_SHARES: u64 = 500;

        let (shares, quota) = match priority {
            CpuPriority::High => (HIGH_SHARES, QUOTA_PER_SECOND),
            CpuPriority::Medium => (MEDIUM_SHARES, QUOTA_PER_SECOND / 2),
            CpuPriority::Low => (LOW_SHARES, QUOTA_PER_SECOND / 4),
        };
        Self {
            shares,
            period: PERIOD_PER_SECOND,
            quota,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendOption {
    #[serde(rename = "@enabled")]
    pub enabled: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerManagement {
    #[serde(rename = "suspend-to-disk")]
    pub suspend_to_disk: SuspendOption,
    #[serde(rename = "suspend-to-mem")]
    pub suspend_to_mem: SuspendOption,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pae: Option<Empty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acpi: Option<Empty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apic: Option<Empty>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clock {
    #[serde(rename = "@offset")]
    pub offset: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskDriver {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@type")]
    pub driver_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSourceHost {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskSource {
    #[serde(rename = "@file", default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(rename = "@protocol", default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(rename = "@name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "@pool", default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(rename = "@volume", default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<DiskSourceHost>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskTarget {
    #[serde(rename = "@dev")]
    pub device: String,
    #[serde(rename = "@bus")]
    pub bus: String,
}

/// Per-disk I/O thresholds; absent fields are unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskTune {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_bytes_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_bytes_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_iops_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_iops_sec: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "disk")]
pub struct DiskDevice {
    #[serde(rename = "@type")]
    pub disk_type: String,
    #[serde(rename = "@device")]
    pub device: String,
    pub driver: DiskDriver,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DiskSource>,
    pub target: DiskTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<Empty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iotune: Option<DiskTune>,
}

impl DiskDevice {
    /// The always-present empty CD-ROM on the first IDE slot.
    pub fn empty_cdrom() -> Self {
        Self {
            disk_type: DISK_TYPE_BLOCK.to_string(),
            device: DEVICE_CDROM.to_string(),
            driver: DiskDriver {
                name: DRIVER_NAME_QEMU.to_string(),
                driver_type: DRIVER_TYPE_RAW.to_string(),
            },
            source: None,
            target: DiskTarget {
                device: device_name(DiskBus::Ide.device_prefix(), IDE_OFFSET_CDROM),
                bus: DiskBus::Ide.as_str().to_string(),
            },
            readonly: Some(Empty {}),
            iotune: None,
        }
    }

    /// A CD-ROM on the first IDE slot backed by a remote HTTPS image.
    pub fn media_cdrom(host: &str, url: &str, port: u16) -> Self {
        Self {
            disk_type: DISK_TYPE_NETWORK.to_string(),
            device: DEVICE_CDROM.to_string(),
            driver: DiskDriver {
                name: DRIVER_NAME_QEMU.to_string(),
                driver_type: DRIVER_TYPE_RAW.to_string(),
            },
            source: Some(DiskSource {
                protocol: Some(PROTOCOL_HTTPS.to_string()),
                name: Some(url.to_string()),
                host: Some(DiskSourceHost {
                    name: host.to_string(),
                    port,
                }),
                ..Default::default()
            }),
            target: DiskTarget {
                device: device_name(DiskBus::Ide.device_prefix(), IDE_OFFSET_CDROM),
                bus: DiskBus::Ide.as_str().to_string(),
            },
            readonly: Some(Empty {}),
            iotune: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceMac {
    #[serde(rename = "@address")]
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSource {
    #[serde(rename = "@bridge", default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    #[serde(rename = "@network", default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceModel {
    #[serde(rename = "@type")]
    pub model_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceTarget {
    #[serde(rename = "@dev")]
    pub device: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthLimit {
    #[serde(rename = "@average")]
    pub average: u64,
    #[serde(rename = "@peak")]
    pub peak: u64,
    #[serde(rename = "@burst")]
    pub burst: u64,
}

impl BandwidthLimit {
    /// Derive the libvirt KiB/s triple from a bytes-per-second threshold.
    pub fn from_bytes_per_second(speed: u64) -> Self {
        Self {
            average: speed >> 10,
            peak: speed >> 9,
            burst: speed >> 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceBandwidth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound: Option<BandwidthLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound: Option<BandwidthLimit>,
}

impl InterfaceBandwidth {
    /// Bandwidth element for the given receive/send thresholds; `None`
    /// when both are unlimited.
    pub fn from_speeds(receive_speed: u64, send_speed: u64) -> Option<Self> {
        if receive_speed == 0 && send_speed == 0 {
            return None;
        }
        Some(Self {
            inbound: (receive_speed != 0).then(|| BandwidthLimit::from_bytes_per_second(receive_speed)),
            outbound: (send_speed != 0).then(|| BandwidthLimit::from_bytes_per_second(send_speed)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "interface")]
pub struct InterfaceDevice {
    #[serde(rename = "@type")]
    pub interface_type: String,
    pub mac: InterfaceMac,
    pub source: InterfaceSource,
    pub model: InterfaceModel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<InterfaceTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<InterfaceBandwidth>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphicsListen {
    #[serde(rename = "@type")]
    pub listen_type: String,
    #[serde(rename = "@address")]
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graphics {
    #[serde(rename = "@type")]
    pub graphics_type: String,
    #[serde(rename = "@port")]
    pub port: u16,
    #[serde(rename = "@passwd")]
    pub password: String,
    pub listen: GraphicsListen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    #[serde(rename = "@type")]
    pub controller_type: String,
    #[serde(rename = "@index")]
    pub index: u32,
    #[serde(rename = "@model", default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDevice {
    #[serde(rename = "@type")]
    pub input_type: String,
    #[serde(rename = "@bus")]
    pub bus: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalloonStats {
    #[serde(rename = "@period")]
    pub period: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBalloon {
    #[serde(rename = "@model")]
    pub model: String,
    pub stats: BalloonStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelTarget {
    #[serde(rename = "@type")]
    pub target_type: String,
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    #[serde(rename = "@type")]
    pub channel_type: String,
    pub target: ChannelTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Devices {
    pub emulator: String,
    #[serde(rename = "disk", default)]
    pub disks: Vec<DiskDevice>,
    #[serde(rename = "interface", default)]
    pub interfaces: Vec<InterfaceDevice>,
    pub graphics: Graphics,
    #[serde(rename = "controller", default)]
    pub controllers: Vec<Controller>,
    #[serde(rename = "input", default)]
    pub inputs: Vec<InputDevice>,
    pub memballoon: MemoryBalloon,
    pub channel: Channel,
}

/// The complete declarative domain document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "domain")]
pub struct DomainDefinition {
    #[serde(rename = "@type")]
    pub domain_type: String,
    pub name: String,
    pub uuid: String,
    /// Memory in KiB.
    pub memory: u64,
    pub vcpu: u32,
    pub os: OsElement,
    pub cpu: CpuElement,
    pub cputune: CpuTune,
    pub on_poweroff: String,
    pub on_reboot: String,
    pub on_crash: String,
    pub pm: PowerManagement,
    pub features: Features,
    pub clock: Clock,
    pub devices: Devices,
}

impl DomainDefinition {
    /// Serialize to libvirt domain XML.
    pub fn to_xml(&self) -> Result<String> {
        quick_xml::se::to_string(self)
            .map_err(|e| CellError::Internal(format!("serialize domain: {e}")))
    }

    /// Parse a libvirt domain XML document.
    pub fn from_xml(xml: &str) -> Result<Self> {
        quick_xml::de::from_str(xml)
            .map_err(|e| CellError::Internal(format!("parse domain: {e}")))
    }

    /// Disks that may receive I/O thresholds (everything not readonly).
    pub fn writable_disks_mut(&mut self) -> impl Iterator<Item = &mut DiskDevice> {
        self.devices
            .disks
            .iter_mut()
            .filter(|disk| disk.readonly.is_none())
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Compose the declarative domain document for a guest.
///
/// Pure with respect to the host: no I/O is performed. A missing hardware
/// address is the one generated input (fresh MAC with the cell OUI).
pub fn build_domain(config: &GuestConfig) -> Result<DomainDefinition> {
    let topology = CpuTopology::for_cores(config.cores)?;
    let cputune = CpuTune::for_priority(config.cpu_priority);

    let disks = match config.storage_mode {
        StorageMode::Local => build_local_volumes(config)?,
    };
    let interfaces = vec![build_plain_interface(config)];

    let mut controllers = vec![
        Controller {
            controller_type: CONTROLLER_PCI.to_string(),
            index: 0,
            model: Some(CONTROLLER_MODEL_PCI_ROOT.to_string()),
        },
        Controller {
            controller_type: CONTROLLER_SCSI.to_string(),
            index: 0,
            model: Some(CONTROLLER_MODEL_VIRTIO_SCSI.to_string()),
        },
    ];
    if config.template.usb != UsbModel::None {
        controllers.push(Controller {
            controller_type: CONTROLLER_USB.to_string(),
            index: 0,
            model: Some(config.template.usb.as_str().to_string()),
        });
    }

    let mut inputs = Vec::new();
    if config.template.tablet != TabletBus::None {
        inputs.push(InputDevice {
            input_type: INPUT_TABLET.to_string(),
            bus: config.template.tablet.as_str().to_string(),
        });
    }

    Ok(DomainDefinition {
        domain_type: DOMAIN_TYPE_KVM.to_string(),
        name: config.name.clone(),
        uuid: config.id.to_string(),
        memory: config.memory >> 10,
        vcpu: config.cores,
        os: OsElement {
            os_type: OsType {
                arch: OS_ARCH.to_string(),
                machine: OS_MACHINE.to_string(),
                name: OS_NAME_HVM.to_string(),
            },
            boot_order: vec![
                BootDevice {
                    device: BOOT_DEVICE_CDROM.to_string(),
                },
                BootDevice {
                    device: BOOT_DEVICE_HARD_DISK.to_string(),
                },
            ],
        },
        cpu: CpuElement { topology },
        cputune,
        on_poweroff: LIFECYCLE_DESTROY.to_string(),
        on_reboot: LIFECYCLE_RESTART.to_string(),
        on_crash: LIFECYCLE_RESTART.to_string(),
        pm: PowerManagement {
            suspend_to_disk: SuspendOption {
                enabled: PM_DISABLED.to_string(),
            },
            suspend_to_mem: SuspendOption {
                enabled: PM_DISABLED.to_string(),
            },
        },
        features: Features {
            pae: Some(Empty {}),
            acpi: Some(Empty {}),
            apic: Some(Empty {}),
        },
        clock: Clock {
            offset: CLOCK_OFFSET_UTC.to_string(),
        },
        devices: Devices {
            emulator: EMULATOR_PATH.to_string(),
            disks,
            interfaces,
            graphics: Graphics {
                graphics_type: GRAPHICS_VNC.to_string(),
                port: config.monitor_port,
                password: config.monitor_secret.clone(),
                listen: GraphicsListen {
                    listen_type: LISTEN_TYPE_ADDRESS.to_string(),
                    address: LISTEN_ALL_ADDRESSES.to_string(),
                },
            },
            controllers,
            inputs,
            memballoon: MemoryBalloon {
                model: BALLOON_MODEL_VIRTIO.to_string(),
                stats: BalloonStats {
                    period: BALLOON_STATS_PERIOD,
                },
            },
            channel: Channel {
                channel_type: CHANNEL_TYPE_UNIX.to_string(),
                target: ChannelTarget {
                    target_type: CHANNEL_TARGET_VIRTIO.to_string(),
                    name: GUEST_AGENT_CHANNEL.to_string(),
                },
            },
        },
    })
}

/// Per-volume I/O thresholds when any of the four QoS values is set.
pub fn disk_tune(read_speed: u64, write_speed: u64, read_iops: u64, write_iops: u64) -> Option<DiskTune> {
    if read_speed == 0 && write_speed == 0 && read_iops == 0 && write_iops == 0 {
        return None;
    }
    Some(DiskTune {
        read_bytes_sec: (read_speed != 0).then_some(read_speed),
        write_bytes_sec: (write_speed != 0).then_some(write_speed),
        read_iops_sec: (read_iops != 0).then_some(read_iops),
        write_iops_sec: (write_iops != 0).then_some(write_iops),
    })
}

/// A data-volume disk element on the given bus and slot.
pub fn volume_disk(
    pool: &str,
    volume: &str,
    bus: DiskBus,
    device: String,
    tune: Option<DiskTune>,
) -> DiskDevice {
    DiskDevice {
        disk_type: DISK_TYPE_VOLUME.to_string(),
        device: DEVICE_DISK.to_string(),
        driver: DiskDriver {
            name: DRIVER_NAME_QEMU.to_string(),
            driver_type: DRIVER_TYPE_QCOW2.to_string(),
        },
        source: Some(DiskSource {
            pool: Some(pool.to_string()),
            volume: Some(volume.to_string()),
            ..Default::default()
        }),
        target: DiskTarget {
            device,
            bus: bus.as_str().to_string(),
        },
        readonly: None,
        iotune: tune,
    }
}

fn build_local_volumes(config: &GuestConfig) -> Result<Vec<DiskDevice>> {
    if config.storage_volumes.is_empty() {
        return Err(CellError::InvalidInput(
            "no storage volumes allocated".to_string(),
        ));
    }

    let mut disks = vec![DiskDevice::empty_cdrom()];

    if let Some(boot_image) = &config.boot_image {
        disks.push(DiskDevice {
            disk_type: DISK_TYPE_FILE.to_string(),
            device: DEVICE_CDROM.to_string(),
            driver: DiskDriver {
                name: DRIVER_NAME_QEMU.to_string(),
                driver_type: DRIVER_TYPE_RAW.to_string(),
            },
            source: Some(DiskSource {
                file: Some(boot_image.to_string_lossy().to_string()),
                ..Default::default()
            }),
            target: DiskTarget {
                device: device_name(DiskBus::Ide.device_prefix(), IDE_OFFSET_CIDATA),
                bus: DiskBus::Ide.as_str().to_string(),
            },
            readonly: Some(Empty {}),
            iotune: None,
        });
    }

    let bus = config.template.disk;
    let (prefix, mut offset) = match bus {
        DiskBus::Ide => (bus.device_prefix(), IDE_OFFSET_DISK),
        DiskBus::Scsi | DiskBus::Sata => (bus.device_prefix(), 0),
    };
    let tune = disk_tune(
        config.read_speed,
        config.write_speed,
        config.read_iops,
        config.write_iops,
    );

    for volume in &config.storage_volumes {
        disks.push(volume_disk(
            &config.storage_pool,
            volume,
            bus,
            device_name(prefix, offset),
            tune.clone(),
        ));
        offset += 1;
    }
    Ok(disks)
}

fn build_plain_interface(config: &GuestConfig) -> InterfaceDevice {
    let mac = if config.hardware_address.is_empty() {
        generate_mac_address(&mut thread_rng())
    } else {
        config.hardware_address.clone()
    };
    InterfaceDevice {
        interface_type: INTERFACE_TYPE_BRIDGE.to_string(),
        mac: InterfaceMac { address: mac },
        source: InterfaceSource {
            bridge: Some(config.network_source.clone()),
            network: None,
        },
        model: InterfaceModel {
            model_type: config.template.network.as_str().to_string(),
        },
        target: None,
        bandwidth: InterfaceBandwidth::from_speeds(config.receive_speed, config.send_speed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HardwareTemplate, MAC_OUI};
    use uuid::Uuid;

    fn sample_config() -> GuestConfig {
        let mut config = GuestConfig::new(Uuid::new_v4(), "dev.sample");
        config.cores = 2;
        config.memory = 2 << 30;
        config.monitor_port = 5901;
        config.monitor_secret = "secret".to_string();
        config.hardware_address = "00:16:3e:12:34:56".to_string();
        config.network_source = "br0".to_string();
        config.storage_pool = "local".to_string();
        config.storage_volumes = vec!["g_sys".to_string(), "g_data0".to_string()];
        config.template = HardwareTemplate::default();
        config
    }

    #[test]
    fn topology_small_counts() {
        let one = CpuTopology::for_cores(1).unwrap();
        assert_eq!((one.sockets, one.cores, one.threads), (1, 1, 1));

        let two = CpuTopology::for_cores(2).unwrap();
        assert_eq!((two.sockets, two.cores, two.threads), (1, 1, 2));

        let four = CpuTopology::for_cores(4).unwrap();
        assert_eq!((four.sockets, four.cores, four.threads), (1, 2, 2));
    }

    #[test]
    fn topology_rejects_odd_counts() {
        assert!(matches!(
            CpuTopology::for_cores(3),
            Err(CellError::InvalidInput(_))
        ));
        assert!(matches!(
            CpuTopology::for_cores(0),
            Err(CellError::InvalidInput(_))
        ));
    }

    #[test]
    fn topology_doubles_sockets_above_32() {
        let topo = CpuTopology::for_cores(64).unwrap();
        assert_eq!((topo.sockets, topo.cores, topo.threads), (2, 16, 2));

        let wide = CpuTopology::for_cores(256).unwrap();
        assert_eq!((wide.sockets, wide.cores, wide.threads), (8, 16, 2));
    }

    #[test]
    fn topology_no_fit_past_eight_sockets() {
        assert!(matches!(CpuTopology::for_cores(512), Err(CellError::NoFit(_))));
    }

    #[test]
    fn topology_product_invariant() {
        for n in (2..=256u32).step_by(2).chain(std::iter::once(1)) {
            match CpuTopology::for_cores(n) {
                Ok(t) => {
                    assert_eq!(t.sockets * t.cores * t.threads, n, "count {n}");
                    assert!(t.threads == 1 || t.threads == 2);
                    assert!(t.cores <= 32);
                    assert!(t.sockets <= 8);
                }
                Err(err) => panic!("count {n} failed: {err}"),
            }
        }
    }

    #[test]
    fn priority_maps_to_cgroup_knobs() {
        let high = CpuTune::for_priority(CpuPriority::High);
        assert_eq!((high.shares, high.period, high.quota), (2000, 1_000_000, 1_000_000));

        let medium = CpuTune::for_priority(CpuPriority::Medium);
        assert_eq!((medium.shares, medium.quota), (1000, 500_000));

        let low = CpuTune::for_priority(CpuPriority::Low);
        assert_eq!((low.shares, low.quota), (500, 250_000));
    }

    #[test]
    fn builder_lays_out_scsi_volumes() {
        let config = sample_config();
        let domain = build_domain(&config).unwrap();

        assert_eq!(domain.memory, config.memory >> 10);
        assert_eq!(domain.vcpu, 2);
        assert_eq!(domain.os.boot_order[0].device, "cdrom");

        let disks = &domain.devices.disks;
        assert_eq!(disks.len(), 3);
        assert_eq!(disks[0].target.device, "hda");
        assert_eq!(disks[0].device, "cdrom");
        assert!(disks[0].readonly.is_some());
        assert_eq!(disks[1].target.device, "sda");
        assert_eq!(disks[1].disk_type, "volume");
        assert_eq!(disks[1].source.as_ref().unwrap().volume.as_deref(), Some("g_sys"));
        assert_eq!(disks[2].target.device, "sdb");
    }

    #[test]
    fn builder_places_cloud_init_iso_on_second_ide_slot() {
        let mut config = sample_config();
        config.boot_image = Some("/var/lib/kestrel/local/g_ci.iso".into());
        let domain = build_domain(&config).unwrap();

        let disks = &domain.devices.disks;
        assert_eq!(disks[1].target.device, "hdb");
        assert_eq!(disks[1].disk_type, "file");
        assert!(disks[1].readonly.is_some());
        assert_eq!(disks[2].target.device, "sda");
    }

    #[test]
    fn builder_starts_ide_data_disks_after_cdrom_slots() {
        let mut config = sample_config();
        config.template.disk = DiskBus::Ide;
        let domain = build_domain(&config).unwrap();

        let disks = &domain.devices.disks;
        assert_eq!(disks[1].target.device, "hdc");
        assert_eq!(disks[2].target.device, "hdd");
        assert_eq!(disks[1].target.bus, "ide");
    }

    #[test]
    fn builder_requires_allocated_volumes() {
        let mut config = sample_config();
        config.storage_volumes.clear();
        assert!(matches!(
            build_domain(&config),
            Err(CellError::InvalidInput(_))
        ));
    }

    #[test]
    fn iotune_only_with_nonzero_thresholds() {
        let config = sample_config();
        let domain = build_domain(&config).unwrap();
        assert!(domain.devices.disks[1].iotune.is_none());

        let mut limited = sample_config();
        limited.read_iops = 600;
        let domain = build_domain(&limited).unwrap();
        let tune = domain.devices.disks[1].iotune.as_ref().unwrap();
        assert_eq!(tune.read_iops_sec, Some(600));
        assert_eq!(tune.write_iops_sec, None);
        // CD-ROM slot never carries thresholds.
        assert!(domain.devices.disks[0].iotune.is_none());
    }

    #[test]
    fn interface_bandwidth_shifts_to_kib() {
        let mut config = sample_config();
        config.receive_speed = 1 << 20;
        let domain = build_domain(&config).unwrap();

        let bandwidth = domain.devices.interfaces[0].bandwidth.as_ref().unwrap();
        let inbound = bandwidth.inbound.as_ref().unwrap();
        assert_eq!(inbound.average, 1024);
        assert_eq!(inbound.peak, 2048);
        assert_eq!(inbound.burst, 1024);
        assert!(bandwidth.outbound.is_none());
    }

    #[test]
    fn builder_generates_mac_when_absent() {
        let mut config = sample_config();
        config.hardware_address.clear();
        let domain = build_domain(&config).unwrap();
        assert!(domain.devices.interfaces[0].mac.address.starts_with(MAC_OUI));
    }

    #[test]
    fn graphics_and_channels() {
        let config = sample_config();
        let domain = build_domain(&config).unwrap();

        assert_eq!(domain.devices.graphics.graphics_type, "vnc");
        assert_eq!(domain.devices.graphics.port, 5901);
        assert_eq!(domain.devices.graphics.listen.address, "0.0.0.0");
        assert_eq!(domain.devices.channel.target.name, "org.qemu.guest_agent.0");
        assert_eq!(domain.devices.memballoon.stats.period, 2);
        // pci-root and virtio-scsi always, USB controller from the template.
        assert_eq!(domain.devices.controllers.len(), 3);
        assert_eq!(domain.devices.inputs[0].input_type, "tablet");
    }

    #[test]
    fn domain_round_trips_through_xml() {
        let mut config = sample_config();
        config.boot_image = Some("/var/lib/kestrel/local/g_ci.iso".into());
        config.read_speed = 10 << 20;
        config.receive_speed = 1 << 20;
        config.send_speed = 2 << 20;
        let domain = build_domain(&config).unwrap();

        let xml = domain.to_xml().unwrap();
        let decoded = DomainDefinition::from_xml(&xml).unwrap();
        assert_eq!(domain, decoded);
    }
}
