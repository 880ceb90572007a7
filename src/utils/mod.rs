//! Utility modules shared by the relay loops.

pub mod health;

pub use health::{HealthChecker, HealthStatus};
