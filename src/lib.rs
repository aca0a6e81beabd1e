//! secmon - lightweight host-based security monitor.
//!
//! Polls filesystem, process, and network state and raises alerts when it
//! matches suspicious patterns. The binary in main.rs wires the monitors to
//! the alert dispatcher.

pub mod alert;
pub mod config;
pub mod hashdb;
pub mod monitors;
pub mod rules;
pub mod state;

// Re-export commonly used types
pub use alert::{Alert, AlertSender, Alerter, Severity};
pub use config::*;
