//! Core ports and coordination substrate for PowerDaemon.
//!
//! Everything the deployment and alerting engines share lives here: the
//! engine-wide error taxonomy, typed configuration, the cache store the
//! engines coordinate through, the message bus, leases, and the ports
//! consumed from external collaborators (health probes, metrics
//! aggregation, identity).

pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod lease;
pub mod metrics;
pub mod probe;
pub mod redis_cache;
pub mod supervisor;

pub use bus::{BusMessage, DeploymentCommand, InMemoryBus, MessageBus};
pub use cache::{CacheStore, CacheStoreExt, MemoryCache};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use health::{ComponentHealth, HealthState};
pub use identity::{AuthOutcome, IdentityProvider, TokenPair, UserSummary};
pub use lease::{Lease, LeaseGuard};
pub use metrics::{aggregate, AggregationKind, MetricSample, MetricsProvider};
pub use probe::{wait_until_healthy, HealthProbe};
pub use supervisor::Supervisor;
