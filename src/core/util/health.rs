// SPDX-License-Identifier: MIT OR Apache-2.0

//! Health checks for embedding applications

use serde::{Deserialize, Serialize};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub component: String,
    pub status: HealthStatus,
    pub message: String,
    pub timestamp: i64,
}

impl HealthCheck {
    pub fn new(component: &str, status: HealthStatus, message: &str) -> Self {
        Self {
            component: component.to_string(),
            status,
            message: message.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Health checker trait
pub trait HealthChecker: Send + Sync {
    fn check(&self) -> HealthCheck;
}

/// Composite health checker
#[derive(Default)]
pub struct HealthAggregator {
    checkers: Vec<Box<dyn HealthChecker>>,
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self {
            checkers: Vec::new(),
        }
    }

    pub fn add_checker(&mut self, checker: Box<dyn HealthChecker>) {
        self.checkers.push(checker);
    }

    pub fn overall_health(&self) -> HealthStatus {
        let mut has_degraded = false;
        for checker in &self.checkers {
            match checker.check().status {
                HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
                HealthStatus::Degraded => has_degraded = true,
                HealthStatus::Healthy => {}
            }
        }
        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn all_checks(&self) -> Vec<HealthCheck> {
        self.checkers.iter().map(|c| c.check()).collect()
    }
}
