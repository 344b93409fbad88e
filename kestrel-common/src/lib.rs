//! Shared utilities for the kestrel cell agent.

pub mod logging;

pub use logging::init_logging;
