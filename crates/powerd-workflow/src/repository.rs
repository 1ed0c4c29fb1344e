//! Workflow persistence: store port, in-memory store, and the write-through
//! repository the engine talks to.
//!
//! The repository owns persisted workflow state. Updates go to the store
//! first and the cache mirror second; reads prefer the mirror.

use crate::events::{WorkflowEvent, WorkflowEventKind};
use crate::model::{StrategyKind, Workflow, WorkflowStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use powerd_core::cache::{keys, ttl};
use powerd_core::{CacheStore, CacheStoreExt, Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub service_name: Option<String>,
    pub strategy: Option<StrategyKind>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn insert(&self, workflow: &Workflow) -> Result<()>;

    /// Persist an updated record. The caller bumps `revision` before the
    /// write; a stale revision is rejected.
    async fn update(&self, workflow: &Workflow) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Workflow>>;

    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>>;

    /// Append an event, assigning the next monotonic sequence number.
    async fn append_event(&self, event: WorkflowEvent) -> Result<WorkflowEvent>;

    async fn events(&self, workflow_id: Uuid) -> Result<Vec<WorkflowEvent>>;

    /// Remove terminal workflows (and their events) completed before the
    /// cutoff. Returns the removed ids.
    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>>;
}

#[derive(Default)]
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    events: RwLock<HashMap<Uuid, Vec<WorkflowEvent>>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert(&self, workflow: &Workflow) -> Result<()> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            return Err(Error::invalid_state(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn update(&self, workflow: &Workflow) -> Result<()> {
        let mut workflows = self.workflows.write().await;
        match workflows.get(&workflow.id) {
            Some(stored) if stored.revision >= workflow.revision => Err(Error::internal(format!(
                "stale write for workflow {} (stored revision {}, write revision {})",
                workflow.id, stored.revision, workflow.revision
            ))),
            Some(_) => {
                workflows.insert(workflow.id, workflow.clone());
                Ok(())
            }
            None => Err(Error::not_found(format!("workflow {}", workflow.id))),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Workflow>> {
        Ok(self.workflows.read().await.get(&id).cloned())
    }

    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>> {
        let workflows = self.workflows.read().await;
        let mut matched: Vec<Workflow> = workflows
            .values()
            .filter(|w| filter.status.map_or(true, |s| w.status == s))
            .filter(|w| {
                filter
                    .service_name
                    .as_ref()
                    .map_or(true, |s| &w.service_name == s)
            })
            .filter(|w| filter.strategy.map_or(true, |s| w.strategy == s))
            .filter(|w| filter.created_after.map_or(true, |t| w.created_at >= t))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn append_event(&self, mut event: WorkflowEvent) -> Result<WorkflowEvent> {
        let mut events = self.events.write().await;
        let log = events.entry(event.workflow_id).or_default();
        event.seq = log.len() as u64;
        log.push(event.clone());
        Ok(event)
    }

    async fn events(&self, workflow_id: Uuid) -> Result<Vec<WorkflowEvent>> {
        Ok(self
            .events
            .read()
            .await
            .get(&workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut workflows = self.workflows.write().await;
        let doomed: Vec<Uuid> = workflows
            .values()
            .filter(|w| {
                w.status.is_terminal() && w.completed_at.map_or(false, |done| done < cutoff)
            })
            .map(|w| w.id)
            .collect();
        let mut events = self.events.write().await;
        for id in &doomed {
            workflows.remove(id);
            events.remove(id);
        }
        Ok(doomed)
    }
}

/// Write-through repository pairing the authoritative store with the
/// `workflow:{id}` cache mirror.
pub struct WorkflowRepository {
    store: Arc<dyn WorkflowStore>,
    cache: Arc<dyn CacheStore>,
}

impl WorkflowRepository {
    pub fn new(store: Arc<dyn WorkflowStore>, cache: Arc<dyn CacheStore>) -> Self {
        Self { store, cache }
    }

    pub async fn create(&self, workflow: &Workflow) -> Result<()> {
        self.store.insert(workflow).await?;
        self.mirror(workflow).await;
        Ok(())
    }

    /// Bump the revision and persist; the mirror is refreshed after the
    /// store accepts the write.
    pub async fn save(&self, workflow: &mut Workflow) -> Result<()> {
        workflow.revision += 1;
        self.store.update(workflow).await?;
        self.mirror(workflow).await;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Workflow> {
        if let Some(workflow) = self.cache.get_json::<Workflow>(&keys::workflow(id)).await? {
            return Ok(workflow);
        }
        match self.store.get(id).await? {
            Some(workflow) => {
                self.mirror(&workflow).await;
                Ok(workflow)
            }
            None => Err(Error::not_found(format!("workflow {id}"))),
        }
    }

    pub async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>> {
        self.store.list(filter).await
    }

    pub async fn record_event(&self, event: WorkflowEvent) -> Result<WorkflowEvent> {
        tracing::debug!(
            workflow_id = %event.workflow_id,
            kind = ?event.kind,
            "{}",
            event.message
        );
        self.store.append_event(event).await
    }

    pub async fn record(
        &self,
        workflow_id: Uuid,
        kind: WorkflowEventKind,
        message: impl Into<String>,
    ) -> Result<WorkflowEvent> {
        self.record_event(WorkflowEvent::new(workflow_id, kind, message))
            .await
    }

    pub async fn events(&self, workflow_id: Uuid) -> Result<Vec<WorkflowEvent>> {
        self.store.events(workflow_id).await
    }

    pub async fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let removed = self.store.delete_completed_before(cutoff).await?;
        for id in &removed {
            self.cache.remove(&keys::workflow(*id)).await?;
        }
        Ok(removed.len() as u64)
    }

    async fn mirror(&self, workflow: &Workflow) {
        let key = keys::workflow(workflow.id);
        if let Err(e) = self
            .cache
            .set_json(&key, workflow, Some(ttl::WORKFLOW_MIRROR))
            .await
        {
            // The store already accepted the write; a stale mirror only
            // costs a read-through on the next get.
            tracing::warn!("workflow mirror write failed for {key}: {e}");
        }
    }
}
