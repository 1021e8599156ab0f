//! C3 — three-tier priority queue with backpressure.
//!
//! Generalizes the teacher's `scheduler::queue::SchedulerQueue` (a single
//! `Mutex<BinaryHeap>` with custom `Ord` for priority+FIFO) into the fixed
//! `{high, medium, low}` class structure with per-class depth caps and
//! optional eviction this system requires.

use crate::events::{Event, EventKind, EventSink, Severity};
use crate::ratelimit::RateLimiterManager;
use crate::store::model::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    High,
    Medium,
    Low,
}

impl PriorityClass {
    fn index(self) -> usize {
        match self {
            PriorityClass::High => 0,
            PriorityClass::Medium => 1,
            PriorityClass::Low => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedItem {
    pub id: String,
    pub task_id: String,
    pub enqueued_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Queued {
        position: usize,
        estimated_wait_ms: i64,
    },
    Dropped {
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct QueueCaps {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl Default for QueueCaps {
    fn default() -> Self {
        Self {
            high: 256,
            medium: 512,
            low: 1024,
        }
    }
}

struct ClassState {
    items: VecDeque<QueuedItem>,
    cap: usize,
    /// Exponentially weighted moving average of service time, seeded at
    /// 1000ms and updated by `record_service`.
    ewma_service_ms: f64,
}

impl ClassState {
    fn new(cap: usize) -> Self {
        Self {
            items: VecDeque::new(),
            cap,
            ewma_service_ms: 1000.0,
        }
    }

    fn estimated_wait_ms(&self, position: usize) -> i64 {
        (position as f64 * self.ewma_service_ms) as i64
    }
}

const EWMA_ALPHA: f64 = 0.2;

/// Fraction of the high class's cap at which `should_route` starts deferring
/// instead of routing, giving callers a warning band before `Drop` at 100%.
const DEFER_DEPTH_FRACTION: f64 = 0.75;

pub struct PriorityQueue {
    classes: Mutex<[ClassState; 3]>,
    prioritization_enabled: bool,
    sink: Option<Arc<dyn EventSink>>,
}

impl PriorityQueue {
    pub fn new(caps: QueueCaps, prioritization_enabled: bool, sink: Option<Arc<dyn EventSink>>) -> Self {
        Self {
            classes: Mutex::new([
                ClassState::new(caps.high),
                ClassState::new(caps.medium),
                ClassState::new(caps.low),
            ]),
            prioritization_enabled,
            sink,
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(sink) = &self.sink {
            sink.emit(event).await;
        }
    }

    pub async fn enqueue(&self, task_id: &str, class: PriorityClass) -> EnqueueOutcome {
        let item = QueuedItem {
            id: crate::events::new_correlation_id(),
            task_id: task_id.to_string(),
            enqueued_at: now_ms(),
        };

        let (outcome, evicted) = {
            let mut classes = self.classes.lock().unwrap();
            let idx = class.index();
            if classes[idx].items.len() < classes[idx].cap {
                classes[idx].items.push_back(item.clone());
                let position = classes[idx].items.len();
                let wait = classes[idx].estimated_wait_ms(position);
                (
                    EnqueueOutcome::Queued {
                        position,
                        estimated_wait_ms: wait,
                    },
                    None,
                )
            } else if class == PriorityClass::High
                && self.prioritization_enabled
                && !classes[PriorityClass::Low.index()].items.is_empty()
            {
                let evicted = classes[PriorityClass::Low.index()].items.pop_front();
                classes[idx].items.push_back(item.clone());
                let position = classes[idx].items.len();
                let wait = classes[idx].estimated_wait_ms(position);
                (
                    EnqueueOutcome::Queued {
                        position,
                        estimated_wait_ms: wait,
                    },
                    evicted,
                )
            } else {
                (EnqueueOutcome::Dropped { reason: "QUEUE_FULL" }, None)
            }
        };

        if let Some(evicted) = evicted {
            self.emit(
                Event::new(EventKind::PriorityDropped, Severity::Warning)
                    .with_task(evicted.task_id)
                    .with_data(serde_json::json!({ "evicted_item_id": evicted.id })),
            )
            .await;
        }

        match &outcome {
            EnqueueOutcome::Queued { .. } => {
                self.emit(Event::new(EventKind::Queued, Severity::Info).with_task(task_id))
                    .await;
            }
            EnqueueOutcome::Dropped { .. } => {
                self.emit(Event::new(EventKind::QueueFull, Severity::Error).with_task(task_id))
                    .await;
            }
        }

        outcome
    }

    pub fn dequeue(&self, class: PriorityClass) -> Option<QueuedItem> {
        self.classes.lock().unwrap()[class.index()].items.pop_front()
    }

    pub fn len(&self, class: PriorityClass) -> usize {
        self.classes.lock().unwrap()[class.index()].items.len()
    }

    pub fn is_empty(&self, class: PriorityClass) -> bool {
        self.len(class) == 0
    }

    /// Records an item's actual service time, updating that class's EWMA
    /// used for future `estimated_wait_ms` calculations.
    pub fn record_service(&self, class: PriorityClass, duration_ms: i64) {
        let mut classes = self.classes.lock().unwrap();
        let state = &mut classes[class.index()];
        state.ewma_service_ms =
            EWMA_ALPHA * duration_ms as f64 + (1.0 - EWMA_ALPHA) * state.ewma_service_ms;
    }

    pub fn depth(&self) -> usize {
        let classes = self.classes.lock().unwrap();
        classes.iter().map(|c| c.items.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteAction {
    Route,
    Throttle,
    Defer,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderHealth {
    Healthy,
    Warning,
    Critical,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDecision {
    pub action: RouteAction,
    pub wait_ms: i64,
    pub health: ProviderHealth,
}

/// Quota view supplied by the caller for providers that advertise quota
/// limits (§4.3: "authoritative when present"). `None` means the provider
/// has no quota ceiling to check.
#[derive(Debug, Clone, Copy)]
pub struct QuotaStatus {
    pub within_limit: bool,
    pub retry_after_ms: i64,
}

impl PriorityQueue {
    /// Consults the rate limiter, this queue's own depth, and an optional
    /// quota status to decide how a request to `provider` should be routed.
    pub fn should_route(
        &self,
        provider: &str,
        limiter: &RateLimiterManager,
        quota: Option<QuotaStatus>,
    ) -> RouteDecision {
        if let Some(q) = quota {
            if !q.within_limit {
                return RouteDecision {
                    action: RouteAction::Defer,
                    wait_ms: q.retry_after_ms,
                    health: ProviderHealth::Critical,
                };
            }
        }

        let status = limiter.status(provider);
        let depth = self.depth();
        let high_cap = self.classes.lock().unwrap()[PriorityClass::High.index()].cap;

        if !status.allowed {
            return RouteDecision {
                action: RouteAction::Throttle,
                wait_ms: status.next_refill_at - now_ms(),
                health: ProviderHealth::Warning,
            };
        }

        if depth >= high_cap {
            return RouteDecision {
                action: RouteAction::Drop,
                wait_ms: 0,
                health: ProviderHealth::Unavailable,
            };
        }

        if depth as f64 >= high_cap as f64 * DEFER_DEPTH_FRACTION {
            return RouteDecision {
                action: RouteAction::Defer,
                wait_ms: status.next_refill_at - now_ms(),
                health: ProviderHealth::Critical,
            };
        }

        RouteDecision {
            action: RouteAction::Route,
            wait_ms: 0,
            health: ProviderHealth::Healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::BucketConfig;

    #[tokio::test]
    async fn enqueue_reports_position_and_wait() {
        let q = PriorityQueue::new(QueueCaps::default(), false, None);
        let r1 = q.enqueue("t1", PriorityClass::Medium).await;
        assert!(matches!(r1, EnqueueOutcome::Queued { position: 1, .. }));
        let r2 = q.enqueue("t2", PriorityClass::Medium).await;
        assert!(matches!(r2, EnqueueOutcome::Queued { position: 2, .. }));
    }

    #[tokio::test]
    async fn full_class_drops_without_prioritization() {
        let caps = QueueCaps {
            high: 1,
            medium: 1,
            low: 1,
        };
        let q = PriorityQueue::new(caps, false, None);
        q.enqueue("t1", PriorityClass::High).await;
        let second = q.enqueue("t2", PriorityClass::High).await;
        assert!(matches!(second, EnqueueOutcome::Dropped { reason: "QUEUE_FULL" }));
    }

    #[tokio::test]
    async fn full_high_evicts_oldest_low_when_prioritization_enabled() {
        let caps = QueueCaps {
            high: 1,
            medium: 1,
            low: 1,
        };
        let q = PriorityQueue::new(caps, true, None);
        q.enqueue("low-item", PriorityClass::Low).await;
        q.enqueue("high-item-1", PriorityClass::High).await;
        let outcome = q.enqueue("high-item-2", PriorityClass::High).await;
        assert!(matches!(outcome, EnqueueOutcome::Queued { .. }));
        assert!(q.is_empty(PriorityClass::Low));
    }

    #[tokio::test]
    async fn medium_never_evicts() {
        let caps = QueueCaps {
            high: 1,
            medium: 1,
            low: 1,
        };
        let q = PriorityQueue::new(caps, true, None);
        q.enqueue("low-item", PriorityClass::Low).await;
        q.enqueue("medium-item-1", PriorityClass::Medium).await;
        let outcome = q.enqueue("medium-item-2", PriorityClass::Medium).await;
        assert!(matches!(outcome, EnqueueOutcome::Dropped { .. }));
        assert!(!q.is_empty(PriorityClass::Low));
    }

    #[test]
    fn should_route_throttles_when_rate_limiter_denies() {
        let limiter = RateLimiterManager::new(BucketConfig {
            capacity: 1.0,
            refill_rate: 1.0,
        });
        limiter.try_consume("p"); // drain the only token
        let q = PriorityQueue::new(QueueCaps::default(), false, None);
        let decision = q.should_route("p", &limiter, None);
        assert_eq!(decision.action, RouteAction::Throttle);
    }

    #[tokio::test]
    async fn should_route_defers_when_queue_depth_crosses_warning_band() {
        let limiter = RateLimiterManager::new(BucketConfig::default());
        let caps = QueueCaps {
            high: 4,
            medium: 256,
            low: 1024,
        };
        let q = PriorityQueue::new(caps, false, None);
        // 3 of 4 high-class slots filled crosses the 75% warning band without
        // reaching the hard cap, so this must defer rather than drop.
        for i in 0..3 {
            q.enqueue(&format!("t{i}"), PriorityClass::High).await;
        }
        let decision = q.should_route("p", &limiter, None);
        assert_eq!(decision.action, RouteAction::Defer);
    }

    #[test]
    fn should_route_defers_when_quota_exhausted() {
        let limiter = RateLimiterManager::new(BucketConfig::default());
        let q = PriorityQueue::new(QueueCaps::default(), false, None);
        let decision = q.should_route(
            "p",
            &limiter,
            Some(QuotaStatus {
                within_limit: false,
                retry_after_ms: 5000,
            }),
        );
        assert_eq!(decision.action, RouteAction::Defer);
        assert_eq!(decision.wait_ms, 5000);
    }
}
