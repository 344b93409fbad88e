//! kestrel cell daemon.
//!
//! Wires the modules together, registers the executors and waits for
//! shutdown. The cluster transport that feeds the transaction engine is
//! attached by the deployment; development mode runs against the
//! in-memory hypervisor and drains outbound messages to the log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use kestrel_cell::cli::Args;
use kestrel_cell::config::DomainConfig;
use kestrel_cell::instance::InstanceModule;
use kestrel_cell::network::{NetworkConfig, NetworkModule};
use kestrel_cell::protocol::ChannelSender;
use kestrel_cell::scheduler::ImageServiceClient;
use kestrel_cell::storage::{StorageConfig, StorageModule};
use kestrel_cell::task::{register_executors, CellModules};
use kestrel_cell::transaction::TransactionEngine;
use kestrel_hypervisor::{FileImageTool, Hypervisor, ImageTool, MockHypervisor, QemuImg};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    kestrel_common::init_logging(&args.log_level)
        .context("initialize logging")?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting kestrel cell");

    let config = DomainConfig::load_or_generate(Path::new(&args.config))
        .context("load domain configuration")?;
    info!(
        domain = %config.domain,
        group = %config.group_address,
        port = config.group_port,
        "domain configuration loaded"
    );

    let data_path = PathBuf::from(&args.data_path);
    let (hypervisor, imgtool): (Arc<dyn Hypervisor>, Arc<dyn ImageTool>) = if args.dev {
        info!("development mode: in-memory hypervisor backend");
        (Arc::new(MockHypervisor::new()), Arc::new(FileImageTool::new()))
    } else {
        #[cfg(feature = "libvirt")]
        {
            let backend = kestrel_hypervisor::LibvirtHypervisor::connect("qemu:///system")
                .context("connect to libvirt")?;
            (Arc::new(backend), Arc::new(QemuImg::new()))
        }
        #[cfg(not(feature = "libvirt"))]
        {
            info!("built without the libvirt feature, using the in-memory backend");
            (Arc::new(MockHypervisor::new()), Arc::new(QemuImg::new()))
        }
    };

    let storage = StorageModule::start(
        StorageConfig {
            pool_name: "local".to_string(),
            pool_path: PathBuf::from(&args.pool_path),
            data_path: data_path.clone(),
        },
        imgtool,
        ImageServiceClient::new().context("build image channel client")?,
    )
    .context("start storage module")?;

    let network = NetworkModule::start(NetworkConfig::new(&args.bridge, &data_path))
        .context("start network module")?;

    let (instance, mut instance_events) =
        InstanceModule::start(hypervisor, data_path).context("start instance module")?;

    let (sender, mut outbound) = ChannelSender::new();
    let mut engine = TransactionEngine::new();
    register_executors(
        &mut engine,
        CellModules {
            sender: Arc::new(sender),
            instance,
            storage,
            network,
            operate_timeout: config.operate_timeout(),
        },
    )
    .context("register executors")?;

    // Status changes and outbound messages go to the journal until the
    // cluster transport is attached.
    tokio::spawn(async move {
        while let Some(event) = instance_events.recv().await {
            debug!(?event, "instance event");
        }
    });
    tokio::spawn(async move {
        while let Some((target, message)) = outbound.recv().await {
            debug!(target = %target, kind = ?message.kind, success = message.success, "outbound message");
        }
    });

    info!(bridge = %args.bridge, "cell ready");
    tokio::signal::ctrl_c().await.context("wait for shutdown")?;
    info!("shutting down");
    Ok(())
}
