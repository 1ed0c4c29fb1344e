use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub state: HealthState,
    pub issues: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self {
            state: HealthState::Healthy,
            issues: Vec::new(),
            checked_at: Utc::now(),
        }
    }

    pub fn degraded(issues: Vec<String>) -> Self {
        Self {
            state: HealthState::Degraded,
            issues,
            checked_at: Utc::now(),
        }
    }
}
