//! Health reporting.
//!
//! The router reports one check for itself and one per subscription. A
//! subscription whose dead-letter count passes the alert threshold is
//! `Degraded`: it keeps processing, but an operator should look at its queue.

use chrono::{DateTime, Utc};
use std::fmt;

/// Severity of a check. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Working normally
    Healthy,
    /// Working, but dead letters are accumulating
    Degraded,
    /// Not accepting work
    Unhealthy,
}

impl HealthStatus {
    /// Stable label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// The more severe of two statuses.
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one component.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// `router` or `subscription:<name>`
    pub component: String,
    /// Severity
    pub status: HealthStatus,
    /// Why the component is not healthy
    pub message: Option<String>,
    /// Gauges captured with the check, such as queue depth
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    fn new(component: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            component: component.into(),
            status,
            message,
            metadata: Vec::new(),
        }
    }

    /// A healthy component.
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Healthy, None)
    }

    /// A degraded component.
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Degraded, Some(message.into()))
    }

    /// A component that is not accepting work.
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Attach a gauge.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    /// Look up a gauge.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Checks taken at one instant; overall status is the worst of them.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Worst status of all checks
    pub status: HealthStatus,
    /// Individual checks
    pub checks: Vec<HealthCheck>,
    /// When the checks were taken
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Aggregate checks.
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);
        Self {
            status,
            checks,
            timestamp: Utc::now(),
        }
    }

    /// Every check is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Some check is degraded and none is unhealthy.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.status == HealthStatus::Degraded
    }

    /// One component's check.
    #[must_use]
    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.component == component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_takes_worst_status() {
        let report = HealthReport::new(vec![
            HealthCheck::healthy("router"),
            HealthCheck::degraded("subscription:load", "3 dead letters exceed threshold 0")
                .with_metadata("dead_lettered", "3"),
        ]);

        assert!(report.is_degraded());
        let load = report.check("subscription:load");
        assert_eq!(load.map(|c| c.status), Some(HealthStatus::Degraded));
        assert_eq!(load.and_then(|c| c.metadata("dead_lettered")), Some("3"));
    }

    #[test]
    fn unhealthy_outranks_degraded() {
        let report = HealthReport::new(vec![
            HealthCheck::degraded("subscription:transform", "1 dead letter"),
            HealthCheck::unhealthy("router", "router is shut down"),
        ]);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.status.to_string(), "unhealthy");
    }

    #[test]
    fn empty_report_is_healthy() {
        assert!(HealthReport::new(Vec::new()).is_healthy());
    }
}
