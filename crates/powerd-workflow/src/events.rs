//! Append-only workflow event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowEventKind {
    Created,
    Started,
    PhaseStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    PhaseCompleted,
    PhaseFailed,
    Completed,
    Failed,
    Cancelled,
    Paused,
    Resumed,
    RollbackStarted,
    RollbackCompleted,
    RollbackFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Monotonic position within the workflow's log, assigned by the store.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: WorkflowEventKind,
    pub message: String,
    pub phase_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub data: HashMap<String, serde_json::Value>,
}

impl WorkflowEvent {
    pub fn new(workflow_id: Uuid, kind: WorkflowEventKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            seq: 0,
            timestamp: Utc::now(),
            kind,
            message: message.into(),
            phase_id: None,
            step_id: None,
            user_id: None,
            data: HashMap::new(),
        }
    }

    pub fn with_phase(mut self, phase_id: Uuid) -> Self {
        self.phase_id = Some(phase_id);
        self
    }

    pub fn with_step(mut self, step_id: Uuid) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_data(mut self, key: &str, value: serde_json::Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}
