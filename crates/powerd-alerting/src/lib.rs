//! Alert engine for PowerDaemon.
//!
//! Rules are evaluated on a timer against aggregated fleet telemetry;
//! firing conditions create or extend alerts deduplicated by fingerprint,
//! and lifecycle transitions (acknowledge, resolve, escalate, suppress)
//! publish to the message bus and fan out to notification channels.

pub mod channels;
pub mod evaluator;
pub mod model;
pub mod notify;
pub mod rules;
pub mod store;

pub use evaluator::{AlertEvaluator, CycleMetrics};
pub use model::{
    Alert, AlertAction, AlertCondition, AlertDataPoint, AlertRule, AlertSeverity, AlertStatus,
    ComparisonOperator, NotificationRecord, SuppressionRule,
};
pub use notify::{ChannelType, NotificationChannel, NotificationDispatcher, NotificationHandler};
pub use rules::AlertRuleStore;
pub use store::{AlertStatsSummary, AlertStore, CreateAlertRequest};
