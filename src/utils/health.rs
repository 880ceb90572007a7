//! Health tracking for the relay loops.

use std::time::{Duration, Instant};

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Recent failures, still operational
    Degraded,
    /// Failure threshold reached
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value: 1 healthy, 0.5 degraded, 0 unhealthy
    pub fn gauge_value(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Unhealthy => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Health checker with consecutive failure tracking
#[derive(Debug)]
pub struct HealthChecker {
    status: HealthStatus,
    consecutive_failures: usize,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    failure_threshold: usize,
}

impl HealthChecker {
    /// A threshold of 0 is treated as 1
    pub fn new(failure_threshold: usize) -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_success: Some(Instant::now()),
            last_failure: None,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Record a success; returns the new status
    pub fn record_success(&mut self) -> HealthStatus {
        self.consecutive_failures = 0;
        self.last_success = Some(Instant::now());
        self.status = HealthStatus::Healthy;
        self.status
    }

    /// Record a failure; returns the new status
    pub fn record_failure(&mut self) -> HealthStatus {
        self.consecutive_failures += 1;
        self.last_failure = Some(Instant::now());

        self.status = if self.consecutive_failures >= self.failure_threshold {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    pub fn time_since_last_success(&self) -> Option<Duration> {
        self.last_success.map(|t| t.elapsed())
    }

    pub fn time_since_last_failure(&self) -> Option<Duration> {
        self.last_failure.map(|t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_checker_success() {
        let mut checker = HealthChecker::new(3);

        assert_eq!(checker.status(), HealthStatus::Healthy);
        assert!(checker.is_healthy());
        assert!(checker.time_since_last_failure().is_none());

        assert_eq!(checker.record_success(), HealthStatus::Healthy);
    }

    #[test]
    fn test_health_checker_degraded() {
        let mut checker = HealthChecker::new(3);

        assert_eq!(checker.record_failure(), HealthStatus::Degraded);
        assert_eq!(checker.consecutive_failures(), 1);

        assert_eq!(checker.record_failure(), HealthStatus::Degraded);
        assert_eq!(checker.consecutive_failures(), 2);
        assert!(checker.time_since_last_failure().is_some());
    }

    #[test]
    fn test_health_checker_unhealthy() {
        let mut checker = HealthChecker::new(3);

        checker.record_failure();
        checker.record_failure();
        checker.record_failure();

        assert_eq!(checker.status(), HealthStatus::Unhealthy);
        assert!(!checker.is_healthy());
        assert_eq!(checker.status().gauge_value(), 0.0);
    }

    #[test]
    fn test_health_checker_recovery() {
        let mut checker = HealthChecker::new(3);

        checker.record_failure();
        checker.record_failure();
        assert_eq!(checker.status().as_str(), "degraded");

        checker.record_success();
        assert_eq!(checker.status(), HealthStatus::Healthy);
        assert_eq!(checker.consecutive_failures(), 0);
    }

    #[test]
    fn test_zero_threshold() {
        let mut checker = HealthChecker::new(0);
        assert_eq!(checker.record_failure(), HealthStatus::Unhealthy);
    }
}
