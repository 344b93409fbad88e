//! Typed guest configuration, hardware templates and status records.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CellError, Result};

/// OUI prefix for generated guest MAC addresses.
pub const MAC_OUI: &str = "00:16:3e";

// =============================================================================
// HARDWARE TEMPLATE
// =============================================================================

/// Operating-system family of a hardware template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Linux,
    Windows,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Linux => "linux",
            OsFamily::Windows => "windows",
        }
    }
}

impl TryFrom<u64> for OsFamily {
    type Error = CellError;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(OsFamily::Linux),
            1 => Ok(OsFamily::Windows),
            other => Err(CellError::InvalidInput(format!(
                "invalid operating system index {other}"
            ))),
        }
    }
}

/// Disk bus of a hardware template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    Ide,
    Scsi,
    Sata,
}

impl DiskBus {
    /// Libvirt bus token.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskBus::Ide => "ide",
            DiskBus::Scsi => "scsi",
            DiskBus::Sata => "sata",
        }
    }

    /// Target device prefix for data volumes on this bus.
    pub fn device_prefix(&self) -> &'static str {
        match self {
            DiskBus::Ide => "hd",
            DiskBus::Scsi | DiskBus::Sata => "sd",
        }
    }
}

impl TryFrom<u64> for DiskBus {
    type Error = CellError;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(DiskBus::Ide),
            1 => Ok(DiskBus::Scsi),
            2 => Ok(DiskBus::Sata),
            other => Err(CellError::InvalidInput(format!(
                "invalid disk bus index {other}"
            ))),
        }
    }
}

/// Network interface model of a hardware template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkModel {
    Rtl8139,
    E1000,
    Virtio,
}

impl NetworkModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkModel::Rtl8139 => "rtl8139",
            NetworkModel::E1000 => "e1000",
            NetworkModel::Virtio => "virtio",
        }
    }
}

impl TryFrom<u64> for NetworkModel {
    type Error = CellError;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(NetworkModel::Rtl8139),
            1 => Ok(NetworkModel::E1000),
            2 => Ok(NetworkModel::Virtio),
            other => Err(CellError::InvalidInput(format!(
                "invalid network model index {other}"
            ))),
        }
    }
}

/// Display driver of a hardware template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayDriver {
    Vga,
    Cirrus,
    Qxl,
}

impl DisplayDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayDriver::Vga => "vga",
            DisplayDriver::Cirrus => "cirrus",
            DisplayDriver::Qxl => "qxl",
        }
    }
}

impl TryFrom<u64> for DisplayDriver {
    type Error = CellError;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(DisplayDriver::Vga),
            1 => Ok(DisplayDriver::Cirrus),
            2 => Ok(DisplayDriver::Qxl),
            other => Err(CellError::InvalidInput(format!(
                "invalid display driver index {other}"
            ))),
        }
    }
}

/// Remote-control protocol of a hardware template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteControl {
    Vnc,
    Spice,
}

impl RemoteControl {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteControl::Vnc => "vnc",
            RemoteControl::Spice => "spice",
        }
    }
}

impl TryFrom<u64> for RemoteControl {
    type Error = CellError;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(RemoteControl::Vnc),
            1 => Ok(RemoteControl::Spice),
            other => Err(CellError::InvalidInput(format!(
                "invalid remote control index {other}"
            ))),
        }
    }
}

/// USB controller model of a hardware template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsbModel {
    /// No dedicated USB controller.
    None,
    NecXhci,
}

impl UsbModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsbModel::None => "",
            UsbModel::NecXhci => "nec-xhci",
        }
    }
}

impl TryFrom<u64> for UsbModel {
    type Error = CellError;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(UsbModel::None),
            1 => Ok(UsbModel::NecXhci),
            other => Err(CellError::InvalidInput(format!(
                "invalid USB model index {other}"
            ))),
        }
    }
}

/// Tablet input bus of a hardware template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabletBus {
    /// No tablet input device.
    None,
    Usb,
    Virtio,
}

impl TabletBus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TabletBus::None => "",
            TabletBus::Usb => "usb",
            TabletBus::Virtio => "virtio",
        }
    }
}

impl TryFrom<u64> for TabletBus {
    type Error = CellError;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(TabletBus::None),
            1 => Ok(TabletBus::Usb),
            2 => Ok(TabletBus::Virtio),
            other => Err(CellError::InvalidInput(format!(
                "invalid tablet bus index {other}"
            ))),
        }
    }
}

/// Hardware template: the seven enumerated choices selecting the virtual
/// hardware presented to a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareTemplate {
    pub operating_system: OsFamily,
    pub disk: DiskBus,
    pub network: NetworkModel,
    pub display: DisplayDriver,
    pub control: RemoteControl,
    pub usb: UsbModel,
    pub tablet: TabletBus,
}

impl HardwareTemplate {
    /// Decode a template from its wire representation: seven unsigned
    /// integers in the order OS, Disk, Network, Display, Control, USB,
    /// Tablet.
    pub fn from_options(options: &[u64]) -> Result<Self> {
        const VALID_OPTION_COUNT: usize = 7;
        if options.len() != VALID_OPTION_COUNT {
            return Err(CellError::InvalidInput(format!(
                "template options count mismatch {} / {}",
                options.len(),
                VALID_OPTION_COUNT
            )));
        }
        Ok(Self {
            operating_system: OsFamily::try_from(options[0])?,
            disk: DiskBus::try_from(options[1])?,
            network: NetworkModel::try_from(options[2])?,
            display: DisplayDriver::try_from(options[3])?,
            control: RemoteControl::try_from(options[4])?,
            usb: UsbModel::try_from(options[5])?,
            tablet: TabletBus::try_from(options[6])?,
        })
    }

    /// Default template for an OS-version tag.
    ///
    /// Unknown tags fail; the controller is expected to send tags from the
    /// published set.
    pub fn for_system_version(version: &str) -> Result<Self> {
        let template = match version {
            "centos7" => Self {
                operating_system: OsFamily::Linux,
                disk: DiskBus::Scsi,
                network: NetworkModel::Virtio,
                display: DisplayDriver::Vga,
                control: RemoteControl::Vnc,
                usb: UsbModel::NecXhci,
                tablet: TabletBus::Usb,
            },
            "centos6" => Self {
                operating_system: OsFamily::Linux,
                disk: DiskBus::Sata,
                network: NetworkModel::Virtio,
                display: DisplayDriver::Vga,
                control: RemoteControl::Vnc,
                usb: UsbModel::NecXhci,
                tablet: TabletBus::Usb,
            },
            "win2012" => Self {
                operating_system: OsFamily::Windows,
                disk: DiskBus::Sata,
                network: NetworkModel::E1000,
                display: DisplayDriver::Vga,
                control: RemoteControl::Vnc,
                usb: UsbModel::NecXhci,
                tablet: TabletBus::Usb,
            },
            "general" => Self {
                operating_system: OsFamily::Linux,
                disk: DiskBus::Sata,
                network: NetworkModel::Rtl8139,
                display: DisplayDriver::Vga,
                control: RemoteControl::Vnc,
                usb: UsbModel::None,
                tablet: TabletBus::Usb,
            },
            "legacy" => Self {
                operating_system: OsFamily::Linux,
                disk: DiskBus::Ide,
                network: NetworkModel::Rtl8139,
                display: DisplayDriver::Vga,
                control: RemoteControl::Vnc,
                usb: UsbModel::None,
                tablet: TabletBus::Usb,
            },
            other => {
                return Err(CellError::InvalidInput(format!(
                    "unsupported system version '{other}'"
                )))
            }
        };
        Ok(template)
    }
}

impl Default for HardwareTemplate {
    fn default() -> Self {
        Self {
            operating_system: OsFamily::Linux,
            disk: DiskBus::Scsi,
            network: NetworkModel::Virtio,
            display: DisplayDriver::Vga,
            control: RemoteControl::Vnc,
            usb: UsbModel::NecXhci,
            tablet: TabletBus::Usb,
        }
    }
}

// =============================================================================
// SECURITY POLICY
// =============================================================================

/// Protocol selector of a security-policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl TryFrom<u64> for PolicyProtocol {
    type Error = CellError;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(PolicyProtocol::Tcp),
            1 => Ok(PolicyProtocol::Udp),
            2 => Ok(PolicyProtocol::Icmp),
            other => Err(CellError::InvalidInput(format!(
                "invalid security protocol index {other}"
            ))),
        }
    }
}

/// One security-policy rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    pub accept: bool,
    pub protocol: PolicyProtocol,
    pub source_address: Ipv4Addr,
    pub target_address: Ipv4Addr,
    pub target_port: u16,
}

/// A default accept/deny plus an ordered rule list, evaluated first-match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub accept: bool,
    pub rules: Vec<SecurityRule>,
}

impl SecurityPolicy {
    /// First-match evaluation; the default applies when no rule matches.
    pub fn evaluate(
        &self,
        protocol: PolicyProtocol,
        source: Ipv4Addr,
        target: Ipv4Addr,
        port: u16,
    ) -> bool {
        for rule in &self.rules {
            if rule.protocol == protocol
                && rule.source_address == source
                && rule.target_address == target
                && rule.target_port == port
            {
                return rule.accept;
            }
        }
        self.accept
    }
}

/// Decode a packed IPv4 address from its wire u32.
pub fn u32_to_ipv4(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value)
}

// =============================================================================
// GUEST CONFIGURATION
// =============================================================================

/// CPU priority mapped onto cgroup shares/quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CpuPriority {
    High,
    #[default]
    Medium,
    Low,
}

impl TryFrom<u64> for CpuPriority {
    type Error = CellError;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(CpuPriority::High),
            1 => Ok(CpuPriority::Medium),
            2 => Ok(CpuPriority::Low),
            other => Err(CellError::InvalidInput(format!(
                "invalid CPU priority {other}"
            ))),
        }
    }
}

/// Network attachment mode of a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Single interface on the host bridge.
    #[default]
    Plain,
}

impl TryFrom<u64> for NetworkMode {
    type Error = CellError;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(NetworkMode::Plain),
            other => Err(CellError::InvalidInput(format!(
                "unsupported network mode {other}"
            ))),
        }
    }
}

/// Storage attachment mode of a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Volumes live in a local pool on this host.
    #[default]
    Local,
}

impl TryFrom<u64> for StorageMode {
    type Error = CellError;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(StorageMode::Local),
            other => Err(CellError::InvalidInput(format!(
                "unsupported storage mode {other}"
            ))),
        }
    }
}

/// Boot provisioning flavor of a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BootType {
    #[default]
    None,
    CloudInit,
}

/// The full specification of one virtual machine.
///
/// Born in the create executor, mutated as stages allocate resources,
/// owned by the instance module once `created` is true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestConfig {
    /// Stable identifier.
    pub id: Uuid,
    /// Group-qualified human name (`group.instance`).
    pub name: String,
    /// Owning group.
    pub group: String,
    /// Owning user.
    pub user: String,
    /// Admin account created in the guest.
    pub auth_user: String,
    /// Admin account secret.
    pub auth_secret: String,
    pub cores: u32,
    /// Memory in bytes.
    pub memory: u64,
    /// Ordered disk sizes in bytes; index 0 is the system disk.
    pub disks: Vec<u64>,
    pub network_mode: NetworkMode,
    pub storage_mode: StorageMode,
    pub template: HardwareTemplate,
    pub security: Option<SecurityPolicy>,
    /// VNC monitor port once allocated.
    pub monitor_port: u16,
    /// VNC monitor password.
    pub monitor_secret: String,
    /// Guest MAC address.
    pub hardware_address: String,
    pub internal_address: Option<String>,
    pub external_address: Option<String>,
    pub auto_start: bool,
    pub qemu_available: bool,
    pub cloud_init: bool,
    pub root_login_enabled: bool,
    /// Mount path of the first data volume inside the guest.
    pub data_path: String,
    // QoS thresholds; zero means unlimited.
    pub read_speed: u64,
    pub write_speed: u64,
    pub read_iops: u64,
    pub write_iops: u64,
    pub receive_speed: u64,
    pub send_speed: u64,
    pub cpu_priority: CpuPriority,
    /// Pool name once volumes are allocated.
    pub storage_pool: String,
    /// Volume names once allocated; index 0 is the system volume.
    pub storage_volumes: Vec<String>,
    /// Cloud-init boot ISO path, when provisioned.
    pub boot_image: Option<PathBuf>,
    /// Bridge the interface attaches to.
    pub network_source: String,
    /// Address allocation mode of the attached network.
    pub address_allocation: String,
    /// Domain defined in the hypervisor.
    pub created: bool,
    /// Fully ready.
    pub initialized: bool,
}

impl GuestConfig {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            group: String::new(),
            user: String::new(),
            auth_user: String::new(),
            auth_secret: String::new(),
            cores: 1,
            memory: 0,
            disks: Vec::new(),
            network_mode: NetworkMode::default(),
            storage_mode: StorageMode::default(),
            template: HardwareTemplate::default(),
            security: None,
            monitor_port: 0,
            monitor_secret: String::new(),
            hardware_address: String::new(),
            internal_address: None,
            external_address: None,
            auto_start: false,
            qemu_available: false,
            cloud_init: false,
            root_login_enabled: false,
            data_path: String::new(),
            read_speed: 0,
            write_speed: 0,
            read_iops: 0,
            write_iops: 0,
            receive_speed: 0,
            send_speed: 0,
            cpu_priority: CpuPriority::default(),
            storage_pool: String::new(),
            storage_volumes: Vec::new(),
            boot_image: None,
            network_source: String::new(),
            address_allocation: String::new(),
            created: false,
            initialized: false,
        }
    }

    /// Whether any disk QoS threshold is set.
    pub fn has_disk_limit(&self) -> bool {
        self.read_speed != 0 || self.write_speed != 0 || self.read_iops != 0 || self.write_iops != 0
    }
}

/// Generate a MAC address with the cell OUI.
pub fn generate_mac_address<R: Rng>(rng: &mut R) -> String {
    let suffix: [u8; 3] = rng.gen();
    format!(
        "{}:{:02x}:{:02x}:{:02x}",
        MAC_OUI, suffix[0], suffix[1], suffix[2]
    )
}

// =============================================================================
// STATUS
// =============================================================================

/// Last-observed runtime status of a guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub running: bool,
    /// Available guest memory in bytes; meaningful only when running.
    pub available_memory: u64,
    /// Bytes read across all volume-type disks.
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Cumulative CPU time in nanoseconds.
    pub cpu_time_ns: u64,
    pub cores: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_decodes_from_wire_options() {
        let template = HardwareTemplate::from_options(&[0, 1, 2, 0, 0, 1, 1]).unwrap();
        assert_eq!(template.operating_system, OsFamily::Linux);
        assert_eq!(template.disk, DiskBus::Scsi);
        assert_eq!(template.network, NetworkModel::Virtio);
        assert_eq!(template.usb, UsbModel::NecXhci);
        assert_eq!(template.tablet, TabletBus::Usb);
    }

    #[test]
    fn template_rejects_wrong_option_count() {
        assert!(matches!(
            HardwareTemplate::from_options(&[0, 1, 2]),
            Err(CellError::InvalidInput(_))
        ));
    }

    #[test]
    fn template_rejects_out_of_range_enumerator() {
        assert!(matches!(
            HardwareTemplate::from_options(&[0, 9, 2, 0, 0, 1, 1]),
            Err(CellError::InvalidInput(_))
        ));
    }

    #[test]
    fn system_version_defaults() {
        let template = HardwareTemplate::for_system_version("centos7").unwrap();
        assert_eq!(template.disk, DiskBus::Scsi);
        assert_eq!(template.network, NetworkModel::Virtio);

        let legacy = HardwareTemplate::for_system_version("legacy").unwrap();
        assert_eq!(legacy.disk, DiskBus::Ide);
        assert!(HardwareTemplate::for_system_version("plan9").is_err());
    }

    #[test]
    fn policy_first_match_wins() {
        let source = Ipv4Addr::new(10, 0, 0, 1);
        let target = Ipv4Addr::new(10, 0, 0, 2);
        let policy = SecurityPolicy {
            accept: false,
            rules: vec![
                SecurityRule {
                    accept: true,
                    protocol: PolicyProtocol::Tcp,
                    source_address: source,
                    target_address: target,
                    target_port: 22,
                },
                SecurityRule {
                    accept: false,
                    protocol: PolicyProtocol::Tcp,
                    source_address: source,
                    target_address: target,
                    target_port: 22,
                },
            ],
        };
        assert!(policy.evaluate(PolicyProtocol::Tcp, source, target, 22));
        // No rule matches, default deny applies.
        assert!(!policy.evaluate(PolicyProtocol::Udp, source, target, 53));
    }

    #[test]
    fn generated_mac_carries_cell_oui() {
        let mut rng = rand::thread_rng();
        let mac = generate_mac_address(&mut rng);
        assert!(mac.starts_with(MAC_OUI));
        assert_eq!(mac.split(':').count(), 6);
    }

    #[test]
    fn packed_ipv4_decodes_big_endian() {
        assert_eq!(u32_to_ipv4(0x0A000001), Ipv4Addr::new(10, 0, 0, 1));
    }
}
