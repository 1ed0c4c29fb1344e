//! Cache store port and the in-memory implementation.
//!
//! The cache is the coordination substrate for both engines: workflow
//! mirrors, pause markers, single-writer leases, alert fingerprint indexes
//! and suppression timers all live behind this interface. Any replacement
//! backend must offer set-if-absent with TTL plus set and list primitives.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Cache key builders for the coordination contract.
pub mod keys {
    use uuid::Uuid;

    pub fn workflow(id: Uuid) -> String {
        format!("workflow:{id}")
    }

    pub fn workflow_lock(id: Uuid) -> String {
        format!("workflow-lock:{id}")
    }

    pub fn workflow_pause(id: Uuid) -> String {
        format!("workflow-pause:{id}")
    }

    pub fn alert_rule(id: &str) -> String {
        format!("alert_rule:{id}")
    }

    pub const ALERT_RULES: &str = "alert_rules";

    pub fn alert(id: Uuid) -> String {
        format!("alert:{id}")
    }

    pub const ACTIVE_ALERTS: &str = "active_alerts";

    pub fn alert_fingerprint(fingerprint: &str) -> String {
        format!("alert_fingerprint:{fingerprint}")
    }

    pub fn alert_suppression(id: Uuid) -> String {
        format!("alert_suppression:{id}")
    }

    pub fn active_alert(fingerprint: &str) -> String {
        format!("active_alert:{fingerprint}")
    }

    pub fn alert_rule_last_eval(rule_id: &str) -> String {
        format!("alert_rule_last_eval:{rule_id}")
    }

    pub fn alert_evaluation_history(hour_bucket: &str) -> String {
        format!("alert_evaluation_history:{hour_bucket}")
    }

    pub const ORCHESTRATOR_HEALTH: &str = "orchestrator:health";
}

/// TTLs fixed by the coordination contract.
pub mod ttl {
    use std::time::Duration;

    pub const WORKFLOW_MIRROR: Duration = Duration::from_secs(24 * 3600);
    pub const WORKFLOW_LOCK: Duration = Duration::from_secs(5 * 60);
    pub const WORKFLOW_PAUSE: Duration = Duration::from_secs(24 * 3600);
    pub const ALERT_RULE: Duration = Duration::from_secs(30 * 24 * 3600);
    pub const ACTIVE_ALERT_LOOKUP: Duration = Duration::from_secs(5 * 60);
    pub const RULE_LAST_EVAL: Duration = Duration::from_secs(3600);
    pub const EVALUATION_HISTORY: Duration = Duration::from_secs(7 * 24 * 3600);
    pub const ORCHESTRATOR_HEALTH: Duration = Duration::from_secs(5 * 60);
}

/// TTL-aware key/value store with set and list primitives.
///
/// String values keep the trait object-safe; JSON helpers live on
/// [`CacheStoreExt`].
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>>;

    async fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Single-writer primitive: store the value only if the key is absent
    /// (or expired). Returns whether the write won.
    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool>;

    async fn remove(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn set_add(&self, set: &str, member: &str) -> Result<()>;

    async fn set_remove(&self, set: &str, member: &str) -> Result<()>;

    async fn set_members(&self, set: &str) -> Result<Vec<String>>;

    /// Push to the head of a list, refreshing the list TTL.
    async fn list_push(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>>;
}

/// JSON convenience layer over [`CacheStore`].
#[async_trait]
pub trait CacheStoreExt: CacheStore {
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.get_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.set_raw(key, raw, ttl).await
    }
}

impl<C: CacheStore + ?Sized> CacheStoreExt for C {}

enum Slot {
    Value(String),
    Set(HashSet<String>),
    List(VecDeque<String>),
}

struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

/// In-process cache store backed by a guarded map with expiry stamps.
///
/// Used by tests and single-node deployments; multi-node fleets point the
/// same port at redis.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn expiry(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|d| Instant::now() + d)
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.live() => match &entry.slot {
                Slot::Value(v) => Ok(Some(v.clone())),
                _ => Err(Error::internal(format!("{key} holds a non-scalar value"))),
            },
            _ => Ok(None),
        }
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(value),
                expires_at: Self::expiry(ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(key) {
            if existing.live() {
                return Ok(false);
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(value),
                expires_at: Self::expiry(Some(ttl)),
            },
        );
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).map(Entry::live).unwrap_or(false))
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(set.to_string()).or_insert_with(|| Entry {
            slot: Slot::Set(HashSet::new()),
            expires_at: None,
        });
        if !entry.live() {
            entry.slot = Slot::Set(HashSet::new());
            entry.expires_at = None;
        }
        match &mut entry.slot {
            Slot::Set(members) => {
                members.insert(member.to_string());
                Ok(())
            }
            _ => Err(Error::internal(format!("{set} is not a set"))),
        }
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(set) {
            if let Slot::Set(members) = &mut entry.slot {
                members.remove(member);
            }
        }
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        match entries.get(set) {
            Some(entry) if entry.live() => match &entry.slot {
                Slot::Set(members) => Ok(members.iter().cloned().collect()),
                _ => Err(Error::internal(format!("{set} is not a set"))),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn list_push(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::List(VecDeque::new()),
            expires_at: None,
        });
        if !entry.live() {
            entry.slot = Slot::List(VecDeque::new());
        }
        entry.expires_at = Self::expiry(ttl);
        match &mut entry.slot {
            Slot::List(items) => {
                items.push_front(value);
                Ok(())
            }
            _ => Err(Error::internal(format!("{key} is not a list"))),
        }
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.live() => match &entry.slot {
                Slot::List(items) => Ok(items.iter().take(limit).cloned().collect()),
                _ => Err(Error::internal(format!("{key} is not a list"))),
            },
            _ => Ok(Vec::new()),
        }
    }
}
