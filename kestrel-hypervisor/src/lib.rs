//! # kestrel Hypervisor
//!
//! Hypervisor abstraction layer for the kestrel cell agent.
//!
//! This crate provides everything a cell needs to turn a typed
//! [`GuestConfig`] into a running KVM guest:
//!
//! - the declarative domain document ([`domain::DomainDefinition`]) and the
//!   pure builder that composes it from a guest configuration and its
//!   hardware template,
//! - the [`Hypervisor`] trait with an in-memory [`MockHypervisor`] backend
//!   (default) and a libvirt backend behind the `libvirt` feature,
//! - the [`ImageTool`] adapter around the external image binary,
//! - the cloud-init boot ISO generator.

pub mod cloudinit;
pub mod domain;
pub mod error;
pub mod imgtool;
pub mod mock;
pub mod traits;
pub mod types;

#[cfg(feature = "libvirt")]
pub mod libvirt;

pub use cloudinit::{BootIsoConfig, CloudInitGenerator};
pub use domain::{
    build_domain, device_name, disk_tune, volume_disk, CpuTopology, CpuTune, DiskDevice,
    DomainDefinition, IDE_OFFSET_DISK,
};
pub use error::{CellError, Result};
pub use imgtool::{FileImageTool, ImageTool, QemuImg};
pub use mock::MockHypervisor;
pub use traits::{DeviceAffect, Hypervisor};
pub use types::*;

#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtHypervisor;
