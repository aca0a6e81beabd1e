//! Per-monitor state containers.

pub mod seen;

pub use seen::{ConnKey, SeenConnections};
