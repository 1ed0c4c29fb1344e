//! Application state wiring.

use crate::metrics::{HttpMetricsProvider, NullMetricsProvider};
use crate::probe::HttpHealthProbe;
use powerd_alerting::channels::{
    EmailNotificationHandler, SlackNotificationHandler, WebhookNotificationHandler,
};
use powerd_alerting::{AlertEvaluator, AlertRuleStore, AlertStore, NotificationDispatcher};
use powerd_auth::AuthService;
use powerd_core::redis_cache::RedisCache;
use powerd_core::{
    CacheStore, EngineConfig, HealthProbe, InMemoryBus, MemoryCache, MessageBus, MetricsProvider,
    Result,
};
use powerd_workflow::executor::ExecutorContext;
use powerd_workflow::postgres::PostgresWorkflowStore;
use powerd_workflow::worker::MetricsGuardWorker;
use powerd_workflow::{
    HttpLoadBalancer, InMemoryWorkflowStore, LoadBalancer, NoopLoadBalancer, Orchestrator,
    RollbackEngine, StrategyRegistry, WorkflowExecutor, WorkflowRepository, WorkflowStore,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: EngineConfig,
    pub orchestrator: Arc<Orchestrator>,
    pub alerts: Arc<AlertStore>,
    pub rules: Arc<AlertRuleStore>,
    pub evaluator: Arc<AlertEvaluator>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub metrics: Arc<dyn MetricsProvider>,
    pub auth: Arc<AuthService>,
}

impl AppState {
    pub async fn build(config: EngineConfig) -> Result<Self> {
        let cache: Arc<dyn CacheStore> = match &config.redis.url {
            Some(url) => {
                tracing::info!("using redis cache at {url}");
                Arc::new(RedisCache::connect(url).await?)
            }
            None => {
                tracing::info!("no redis configured, using in-process cache");
                Arc::new(MemoryCache::new())
            }
        };

        let store: Arc<dyn WorkflowStore> = match &config.database.url {
            Some(url) => {
                tracing::info!("using postgres workflow store");
                let store = PostgresWorkflowStore::connect(url).await?;
                store.migrate().await?;
                Arc::new(store)
            }
            None => {
                tracing::info!("no database configured, using in-memory workflow store");
                Arc::new(InMemoryWorkflowStore::new())
            }
        };

        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::default());
        let repository = Arc::new(WorkflowRepository::new(store, cache.clone()));
        let probe: Arc<dyn HealthProbe> =
            Arc::new(HttpHealthProbe::new(config.agents.health_port));

        let metrics: Arc<dyn MetricsProvider> = match &config.metrics.url {
            Some(url) => Arc::new(HttpMetricsProvider::new(url.clone())),
            None => {
                tracing::warn!("no metrics endpoint configured, alert rules will not fire");
                Arc::new(NullMetricsProvider)
            }
        };

        let load_balancer: Arc<dyn LoadBalancer> = match (
            &config.load_balancer.endpoint,
            &config.load_balancer.api_key,
        ) {
            (Some(endpoint), Some(api_key)) => {
                Arc::new(HttpLoadBalancer::new(endpoint.clone(), api_key.clone()))
            }
            _ => Arc::new(NoopLoadBalancer),
        };

        let rollback = Arc::new(RollbackEngine::new(
            repository.clone(),
            bus.clone(),
            probe.clone(),
        ));
        let executor = Arc::new(WorkflowExecutor::new(ExecutorContext {
            repository: repository.clone(),
            bus: bus.clone(),
            cache: cache.clone(),
            probe,
            load_balancer,
            step_worker: Arc::new(MetricsGuardWorker::new(metrics.clone())),
            rollback: rollback.clone(),
            config: config.orchestrator.clone(),
        }));

        let auth = Arc::new(AuthService::new(&config.auth));
        let orchestrator = Arc::new(Orchestrator::new(
            repository,
            Arc::new(StrategyRegistry::with_defaults()),
            executor,
            rollback,
            cache.clone(),
            auth.clone(),
            config.orchestrator.clone(),
        ));

        let alerts = Arc::new(AlertStore::new(cache.clone(), bus));
        let rules = Arc::new(AlertRuleStore::new(cache.clone()));
        rules.load().await?;
        rules.seed_builtin_rules(&config.alerting).await?;

        let dispatcher = Arc::new(NotificationDispatcher::new(alerts.clone()));
        dispatcher
            .register_handler(Arc::new(EmailNotificationHandler))
            .await;
        dispatcher
            .register_handler(Arc::new(WebhookNotificationHandler::new()))
            .await;
        dispatcher
            .register_handler(Arc::new(SlackNotificationHandler::new()))
            .await;

        let evaluator = Arc::new(AlertEvaluator::new(
            rules.clone(),
            alerts.clone(),
            metrics.clone(),
            cache,
            dispatcher.clone(),
            config.alerting.clone(),
        ));

        Ok(Self {
            config,
            orchestrator,
            alerts,
            rules,
            evaluator,
            dispatcher,
            metrics,
            auth,
        })
    }
}
