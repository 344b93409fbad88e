//! # kestrel cell
//!
//! The per-host agent of a kestrel virtualization cluster. The cell
//! receives typed requests from the cluster controller and manipulates
//! local KVM guests, their storage volumes and their network
//! attachments, reporting progress and status back asynchronously.
//!
//! The crate is organized around single-consumer modules (instance,
//! storage, network), a per-pool I/O scheduler for long file jobs, and a
//! transaction engine that dispatches each request into its executor.

pub mod cli;
pub mod config;
pub mod credentials;
pub mod instance;
pub mod network;
pub mod protocol;
pub mod scheduler;
pub mod storage;
pub mod task;
pub mod transaction;

pub use config::DomainConfig;
pub use instance::{InstanceEvent, InstanceHandle, InstanceModule};
pub use network::{NetworkConfig, NetworkHandle, NetworkModule};
pub use protocol::{ChannelSender, Message, MessageKind, MessageSender, ParamKey, SessionId};
pub use scheduler::{ImageServiceClient, IoScheduler, SchedulerHandle};
pub use storage::{StorageConfig, StorageHandle, StorageModule};
pub use task::{register_executors, CellModules};
pub use transaction::{Executor, TransactionEngine};
