//! `CoreContext` — the wiring point that owns every component and hands out
//! shared handles to callers, mirroring the teacher's `AppContext` (the
//! struct that bundles the account pool, scheduler, and event broadcaster
//! behind one construction path for `main.rs` and tests alike).

use crate::config::CoreConfig;
use crate::dag::DagEngine;
use crate::events::EventSink;
use crate::queue::PriorityQueue;
use crate::ratelimit::{BucketConfig, RateLimiterManager};
use crate::scheduler::quota::QuotaManager;
use crate::scheduler::Scheduler;
use crate::store::Store;
use std::path::Path;
use std::sync::Arc;

/// Bundles the coordination core's components, built from a `CoreConfig`.
/// Cloning is cheap — every field is an `Arc` or already `Clone` internally.
#[derive(Clone)]
pub struct CoreContext {
    pub store: Store,
    pub dag: Arc<DagEngine>,
    pub rate_limiter: Arc<RateLimiterManager>,
    pub quota: Arc<QuotaManager>,
    pub queue: Arc<PriorityQueue>,
    pub scheduler: Arc<Scheduler>,
}

impl CoreContext {
    /// Boots every component against a SQLite database under `data_dir`,
    /// running migrations, and layers `config`'s rate limiter overrides on
    /// top of the manager's default bucket.
    pub async fn boot(
        data_dir: &Path,
        config: &CoreConfig,
        sink: Option<Arc<dyn EventSink>>,
    ) -> anyhow::Result<Self> {
        let store = Store::new(data_dir).await?;
        Self::from_store(store, config, sink)
    }

    /// Same as `boot`, but against an in-memory database (tests, the demo
    /// binary's `--ephemeral` mode).
    pub async fn boot_in_memory(
        config: &CoreConfig,
        sink: Option<Arc<dyn EventSink>>,
    ) -> anyhow::Result<Self> {
        let store = Store::new_in_memory().await?;
        Self::from_store(store, config, sink)
    }

    fn from_store(
        store: Store,
        config: &CoreConfig,
        sink: Option<Arc<dyn EventSink>>,
    ) -> anyhow::Result<Self> {
        let dag = Arc::new(DagEngine::new());

        let rate_limiter = Arc::new(RateLimiterManager::new(BucketConfig::default()));
        for (provider, bucket) in &config.rate_limits {
            rate_limiter.configure(provider, *bucket);
        }

        let quota = Arc::new(QuotaManager::new());

        let queue = Arc::new(PriorityQueue::new(
            config.queue_caps,
            config.enable_prioritization,
            sink.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            Arc::clone(&dag),
            sink,
            config.scheduler,
        )?);

        Ok(Self {
            store,
            dag,
            rate_limiter,
            quota,
            queue,
            scheduler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn boots_in_memory_with_configured_rate_limits() {
        let mut config = CoreConfig::load(std::env::temp_dir().join("nonexistent-beadbroker"));
        config
            .rate_limits
            .insert("anthropic".to_string(), BucketConfig { capacity: 10.0, refill_rate: 1.0 });

        let ctx = CoreContext::boot_in_memory(&config, None).await.unwrap();
        let status = ctx.rate_limiter.status("anthropic");
        assert_eq!(status.remaining, 10.0);
    }
}
