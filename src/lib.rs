//! Per-process network rate limiting.
//!
//! Packets are attributed to processes through the OS connection table,
//! metered per process, and shaped in userspace by token buckets while a
//! throttle is active.

pub mod backends;
pub mod budget;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod flow;
pub mod meter;
pub mod process;
pub mod rate;
pub mod registry;

pub use config::Config;
pub use controller::BandwidthController;
pub use error::{ThrottleError, ThrottleResult};
pub use process::{ProcessRecord, ThrottleLimits};
