//! Polling monitors. Each runs on its own task and emits alerts through the
//! shared channel.

pub mod file_integrity;
pub mod network;
pub mod process;

pub use file_integrity::FileIntegrityMonitor;
pub use network::NetworkMonitor;
pub use process::ProcessMonitor;
