//! Network resource module.
//!
//! Tracks the default bridge, the monitor-port pool and the optional
//! address pool, plus one reservation per guest. A single worker task
//! consumes commands; allocation is atomic per guest and release is
//! idempotent.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use kestrel_hypervisor::{CellError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

const COMMAND_QUEUE_DEPTH: usize = 64;

/// Default monitor-port range (inclusive).
pub const DEFAULT_MONITOR_PORT_RANGE: (u16, u16) = (5901, 6000);

/// Configuration of the network module.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Host bridge guests attach to.
    pub bridge: String,
    /// Inclusive monitor-port range.
    pub monitor_ports: (u16, u16),
    /// Directory for persisted allocation state.
    pub data_path: PathBuf,
}

impl NetworkConfig {
    pub fn new(bridge: impl Into<String>, data_path: impl Into<PathBuf>) -> Self {
        Self {
            bridge: bridge.into(),
            monitor_ports: DEFAULT_MONITOR_PORT_RANGE,
            data_path: data_path.into(),
        }
    }
}

/// One contiguous IPv4 range of the address pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl AddressRange {
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        let value = u32::from(address);
        value >= u32::from(self.start) && value <= u32::from(self.end)
    }
}

/// Optional address pool attached by the cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressPool {
    pub ranges: Vec<AddressRange>,
    /// Allocation mode advertised to guests (e.g. `dhcp`).
    pub mode: String,
}

impl AddressPool {
    fn contains(&self, address: Ipv4Addr) -> bool {
        self.ranges.iter().any(|range| range.contains(address))
    }
}

/// Current network configuration, as the create pipeline consumes it.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    pub bridge: String,
    pub allocation_mode: String,
}

/// Complete reservation of one guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceResource {
    pub hardware_address: String,
    pub monitor_port: u16,
    pub internal_address: Option<String>,
    pub external_address: Option<String>,
}

enum NetworkCommand {
    GetCurrentConfig {
        reply: oneshot::Sender<Result<NetworkStatus>>,
    },
    Allocate {
        guest: Uuid,
        hardware_address: String,
        internal_address: Option<String>,
        external_address: Option<String>,
        reply: oneshot::Sender<Result<InstanceResource>>,
    },
    DeallocateAll {
        guest: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    ChangeAddressPool {
        pool: AddressPool,
        reply: oneshot::Sender<Result<Vec<Uuid>>>,
    },
    GetAllocation {
        guest: Uuid,
        reply: oneshot::Sender<Option<InstanceResource>>,
    },
    CountAllocations {
        reply: oneshot::Sender<usize>,
    },
}

/// Cheap-to-clone handle onto the network worker.
#[derive(Clone)]
pub struct NetworkHandle {
    tx: mpsc::Sender<NetworkCommand>,
}

impl NetworkHandle {
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> NetworkCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(command(tx))
            .await
            .map_err(|_| CellError::Internal("network module stopped".to_string()))?;
        rx.await
            .map_err(|_| CellError::Internal("network reply dropped".to_string()))
    }

    pub async fn get_current_config(&self) -> Result<NetworkStatus> {
        self.call(|tx| NetworkCommand::GetCurrentConfig { reply: tx })
            .await?
    }

    /// Reserve everything a guest needs; all or nothing.
    pub async fn allocate_instance_resource(
        &self,
        guest: Uuid,
        hardware_address: String,
        internal_address: Option<String>,
        external_address: Option<String>,
    ) -> Result<InstanceResource> {
        self.call(|tx| NetworkCommand::Allocate {
            guest,
            hardware_address,
            internal_address,
            external_address,
            reply: tx,
        })
        .await?
    }

    /// Release every resource keyed by the guest; idempotent.
    pub async fn deallocate_all_resource(&self, guest: Uuid) -> Result<()> {
        self.call(|tx| NetworkCommand::DeallocateAll { guest, reply: tx })
            .await?
    }

    /// Replace the address pool; returns the guests whose reservation no
    /// longer fits the new ranges.
    pub async fn change_address_pool(&self, pool: AddressPool) -> Result<Vec<Uuid>> {
        self.call(|tx| NetworkCommand::ChangeAddressPool { pool, reply: tx })
            .await?
    }

    pub async fn get_allocation(&self, guest: Uuid) -> Result<Option<InstanceResource>> {
        self.call(|tx| NetworkCommand::GetAllocation { guest, reply: tx })
            .await
    }

    pub async fn count_allocations(&self) -> Result<usize> {
        self.call(|tx| NetworkCommand::CountAllocations { reply: tx })
            .await
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct NetworkRecord {
    bridge: String,
    #[serde(default)]
    address_pool: Option<AddressPool>,
    allocations: HashMap<Uuid, InstanceResource>,
}

/// The network module.
pub struct NetworkModule;

impl NetworkModule {
    pub fn start(config: NetworkConfig) -> Result<NetworkHandle> {
        std::fs::create_dir_all(&config.data_path)?;
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let state_path = config
            .data_path
            .join(format!("network_{}.json", config.bridge));
        let (address_pool, allocations) = match std::fs::read_to_string(&state_path) {
            Ok(data) => match serde_json::from_str::<NetworkRecord>(&data) {
                Ok(record) => {
                    info!(bridge = %record.bridge, allocations = record.allocations.len(), "network state loaded");
                    (record.address_pool, record.allocations)
                }
                Err(err) => {
                    warn!(path = %state_path.display(), error = %err, "discarding unreadable network state");
                    (None, HashMap::new())
                }
            },
            Err(_) => (None, HashMap::new()),
        };

        let mut free_ports: BTreeSet<u16> =
            (config.monitor_ports.0..=config.monitor_ports.1).collect();
        for allocation in allocations.values() {
            free_ports.remove(&allocation.monitor_port);
        }

        let worker = NetworkWorker {
            bridge: config.bridge,
            free_ports,
            address_pool,
            allocations,
            state_path,
        };
        tokio::spawn(worker.run(rx));
        Ok(NetworkHandle { tx })
    }
}

struct NetworkWorker {
    bridge: String,
    free_ports: BTreeSet<u16>,
    address_pool: Option<AddressPool>,
    allocations: HashMap<Uuid, InstanceResource>,
    state_path: PathBuf,
}

impl NetworkWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<NetworkCommand>) {
        info!(bridge = %self.bridge, "network module started");
        while let Some(command) = commands.recv().await {
            self.handle_command(command);
        }
        info!(bridge = %self.bridge, "network module stopped");
    }

    fn persist(&self) {
        let record = NetworkRecord {
            bridge: self.bridge.clone(),
            address_pool: self.address_pool.clone(),
            allocations: self.allocations.clone(),
        };
        match serde_json::to_string_pretty(&record) {
            Ok(data) => {
                if let Err(err) = std::fs::write(&self.state_path, data) {
                    warn!(path = %self.state_path.display(), error = %err, "persist network state failed");
                }
            }
            Err(err) => warn!(error = %err, "encode network state failed"),
        }
    }

    fn handle_command(&mut self, command: NetworkCommand) {
        match command {
            NetworkCommand::GetCurrentConfig { reply } => {
                let mode = self
                    .address_pool
                    .as_ref()
                    .map(|pool| pool.mode.clone())
                    .unwrap_or_default();
                let _ = reply.send(Ok(NetworkStatus {
                    bridge: self.bridge.clone(),
                    allocation_mode: mode,
                }));
            }
            NetworkCommand::Allocate {
                guest,
                hardware_address,
                internal_address,
                external_address,
                reply,
            } => {
                let _ = reply.send(self.allocate(
                    guest,
                    hardware_address,
                    internal_address,
                    external_address,
                ));
            }
            NetworkCommand::DeallocateAll { guest, reply } => {
                if let Some(allocation) = self.allocations.remove(&guest) {
                    self.free_ports.insert(allocation.monitor_port);
                    self.persist();
                    info!(guest = %guest, port = allocation.monitor_port, "network resources released");
                }
                // Releasing an unknown guest is indistinguishable from a
                // repeated release.
                let _ = reply.send(Ok(()));
            }
            NetworkCommand::ChangeAddressPool { pool, reply } => {
                let invalidated = self.revalidate(&pool);
                self.address_pool = Some(pool);
                self.persist();
                let _ = reply.send(Ok(invalidated));
            }
            NetworkCommand::GetAllocation { guest, reply } => {
                let _ = reply.send(self.allocations.get(&guest).cloned());
            }
            NetworkCommand::CountAllocations { reply } => {
                let _ = reply.send(self.allocations.len());
            }
        }
    }

    fn allocate(
        &mut self,
        guest: Uuid,
        hardware_address: String,
        internal_address: Option<String>,
        external_address: Option<String>,
    ) -> Result<InstanceResource> {
        if self.allocations.contains_key(&guest) {
            return Err(CellError::Conflict(format!(
                "guest '{guest}' already holds network resources"
            )));
        }
        // Validate every piece before reserving anything, so a failure
        // leaves nothing behind.
        if let (Some(pool), Some(address)) = (&self.address_pool, internal_address.as_deref()) {
            let parsed: Ipv4Addr = address
                .parse()
                .map_err(|_| CellError::InvalidInput(format!("invalid internal address '{address}'")))?;
            if !pool.contains(parsed) {
                return Err(CellError::InvalidInput(format!(
                    "internal address '{address}' outside the address pool"
                )));
            }
        }
        let monitor_port = *self
            .free_ports
            .iter()
            .next()
            .ok_or_else(|| CellError::Busy("monitor port pool exhausted".to_string()))?;

        self.free_ports.remove(&monitor_port);
        let allocation = InstanceResource {
            hardware_address,
            monitor_port,
            internal_address,
            external_address,
        };
        self.allocations.insert(guest, allocation.clone());
        self.persist();
        info!(guest = %guest, port = monitor_port, "network resources allocated");
        Ok(allocation)
    }

    fn revalidate(&self, pool: &AddressPool) -> Vec<Uuid> {
        let mut invalidated = Vec::new();
        for (guest, allocation) in &self.allocations {
            let mut fits = true;
            for address in [&allocation.internal_address, &allocation.external_address]
                .into_iter()
                .flatten()
            {
                match address.parse::<Ipv4Addr>() {
                    Ok(parsed) if pool.contains(parsed) => {}
                    _ => fits = false,
                }
            }
            if !fits {
                warn!(guest = %guest, "reservation no longer fits the address pool");
                invalidated.push(*guest);
            }
        }
        invalidated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_module(dir: &std::path::Path) -> NetworkHandle {
        NetworkModule::start(NetworkConfig::new("br0", dir)).unwrap()
    }

    #[tokio::test]
    async fn allocates_ports_from_the_monitor_range() {
        let dir = tempfile::tempdir().unwrap();
        let network = test_module(dir.path());

        let first = network
            .allocate_instance_resource(Uuid::new_v4(), "00:16:3e:00:00:01".into(), None, None)
            .await
            .unwrap();
        assert_eq!(first.monitor_port, 5901);

        let second = network
            .allocate_instance_resource(Uuid::new_v4(), "00:16:3e:00:00:02".into(), None, None)
            .await
            .unwrap();
        assert_eq!(second.monitor_port, 5902);
    }

    #[tokio::test]
    async fn double_allocation_for_one_guest_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let network = test_module(dir.path());
        let guest = Uuid::new_v4();

        network
            .allocate_instance_resource(guest, "00:16:3e:00:00:01".into(), None, None)
            .await
            .unwrap();
        assert!(matches!(
            network
                .allocate_instance_resource(guest, "00:16:3e:00:00:01".into(), None, None)
                .await,
            Err(CellError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn release_is_idempotent_and_returns_the_port() {
        let dir = tempfile::tempdir().unwrap();
        let network = test_module(dir.path());
        let guest = Uuid::new_v4();

        let allocation = network
            .allocate_instance_resource(guest, "00:16:3e:00:00:01".into(), None, None)
            .await
            .unwrap();
        network.deallocate_all_resource(guest).await.unwrap();
        network.deallocate_all_resource(guest).await.unwrap();
        assert_eq!(network.count_allocations().await.unwrap(), 0);

        // The released port is handed out again.
        let next = network
            .allocate_instance_resource(Uuid::new_v4(), "00:16:3e:00:00:02".into(), None, None)
            .await
            .unwrap();
        assert_eq!(next.monitor_port, allocation.monitor_port);
    }

    #[tokio::test]
    async fn allocation_is_atomic_when_address_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let network = test_module(dir.path());
        network
            .change_address_pool(AddressPool {
                ranges: vec![AddressRange {
                    start: Ipv4Addr::new(10, 0, 0, 10),
                    end: Ipv4Addr::new(10, 0, 0, 20),
                }],
                mode: "dhcp".to_string(),
            })
            .await
            .unwrap();

        let guest = Uuid::new_v4();
        let err = network
            .allocate_instance_resource(
                guest,
                "00:16:3e:00:00:01".into(),
                Some("192.168.1.5".to_string()),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CellError::InvalidInput(_)));
        // Nothing was reserved: the first port is still free.
        assert!(network.get_allocation(guest).await.unwrap().is_none());
        let next = network
            .allocate_instance_resource(
                Uuid::new_v4(),
                "00:16:3e:00:00:02".into(),
                Some("10.0.0.11".to_string()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(next.monitor_port, 5901);
    }

    #[tokio::test]
    async fn pool_change_reports_no_longer_fitting_guests() {
        let dir = tempfile::tempdir().unwrap();
        let network = test_module(dir.path());
        let guest = Uuid::new_v4();

        network
            .allocate_instance_resource(
                guest,
                "00:16:3e:00:00:01".into(),
                Some("10.0.0.11".to_string()),
                None,
            )
            .await
            .unwrap();

        let invalidated = network
            .change_address_pool(AddressPool {
                ranges: vec![AddressRange {
                    start: Ipv4Addr::new(172, 16, 0, 1),
                    end: Ipv4Addr::new(172, 16, 0, 100),
                }],
                mode: "dhcp".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(invalidated, vec![guest]);
        // The reservation itself stays; the controller decides what to do.
        assert!(network.get_allocation(guest).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn current_config_reports_bridge_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let network = test_module(dir.path());

        let status = network.get_current_config().await.unwrap();
        assert_eq!(status.bridge, "br0");
        assert!(status.allocation_mode.is_empty());

        network
            .change_address_pool(AddressPool {
                ranges: vec![],
                mode: "dhcp".to_string(),
            })
            .await
            .unwrap();
        let status = network.get_current_config().await.unwrap();
        assert_eq!(status.allocation_mode, "dhcp");
    }
}
