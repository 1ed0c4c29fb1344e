//! Deployment orchestration engine for PowerDaemon.
//!
//! Workflows move through a strict state machine: a strategy planner turns a
//! deployment request into an ordered phase list, the executor drives phases
//! and steps over the message bus with retries and pause/cancel support, and
//! the rollback engine restores the fleet when a deployment goes bad. The
//! orchestrator façade ties it together behind permission checks and cache
//! leases.

pub mod events;
pub mod executor;
pub mod lb;
pub mod model;
pub mod orchestrator;
pub mod postgres;
pub mod repository;
pub mod rollback;
pub mod strategy;
pub mod worker;

pub use events::{WorkflowEvent, WorkflowEventKind};
pub use executor::{ExecutorContext, WorkflowExecutor};
pub use lb::{HttpLoadBalancer, LoadBalancer, NoopLoadBalancer};
pub use model::{
    Phase, PhaseStatus, RollbackConfiguration, Step, StepStatus, StepType, StrategyKind, Workflow,
    WorkflowRequest, WorkflowStatus,
};
pub use orchestrator::{Orchestrator, WorkflowStatistics};
pub use repository::{InMemoryWorkflowStore, WorkflowFilter, WorkflowRepository, WorkflowStore};
pub use rollback::RollbackEngine;
pub use strategy::{StrategyPlanner, StrategyRegistry};
pub use worker::{NoopStepWorker, StepWorker};
