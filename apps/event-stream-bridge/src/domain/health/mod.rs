//! Component Health Types
//!
//! Shared health report returned by every component's `health_check()`.

use serde::Serialize;

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Some systems degraded but functional.
    Degraded,
    /// Critical systems unavailable.
    Unhealthy,
}

/// Health report of a single component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// Component name.
    pub component: &'static str,
    /// Current status.
    pub status: HealthStatus,
    /// Human-readable reasons for a non-healthy status.
    pub issues: Vec<String>,
}

impl ComponentHealth {
    /// Start a healthy report.
    #[must_use]
    pub const fn healthy(component: &'static str) -> Self {
        Self {
            component,
            status: HealthStatus::Healthy,
            issues: Vec::new(),
        }
    }

    /// Record an issue that degrades the component.
    pub fn degrade(&mut self, issue: impl Into<String>) {
        self.status = self.status.max(HealthStatus::Degraded);
        self.issues.push(issue.into());
    }

    /// Record an issue that makes the component unhealthy.
    pub fn fail(&mut self, issue: impl Into<String>) {
        self.status = HealthStatus::Unhealthy;
        self.issues.push(issue.into());
    }

    /// Whether the component can still serve traffic.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}

/// Combine component reports into one overall status.
#[must_use]
pub fn overall_status(reports: &[ComponentHealth]) -> HealthStatus {
    reports
        .iter()
        .map(|r| r.status)
        .max()
        .unwrap_or(HealthStatus::Healthy)
}
