//! At-least-once delivery on top of [`Router::emit`].
//!
//! Every emission gets an [`AckId`] embedded in its payload and a pending
//! record. A timer re-checks the record at the deadline: still pending means
//! the identical payload is emitted again to the same group (whoever is live
//! *now*), with the delay growing by the backoff multiplier. Once the retry
//! budget is spent the record is dropped and handed to the
//! [`DeliveryFailureSink`].
//!
//! `acknowledge` and the re-check race on the same map entry. Whichever
//! removes the record first wins; the loser sees it absent and does nothing.

use crate::config::AckConfig;
use crate::metrics::RelayMetrics;
use crate::router::Router;
use crate::storage::{unix_millis, DeliveryFailure, DeliveryFailureSink};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tether_types::{AckId, Frame, Group, Identity};

/// Payload key carrying the emission id.
pub const ACK_ID_FIELD: &str = "ackId";

/// Retry budget and backoff shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
    /// Factor applied to the delay after each re-emission.
    pub backoff_multiplier: u32,
    /// Re-emissions before giving up.
    pub max_retries: u32,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
}

impl From<&AckConfig> for AckPolicy {
    fn from(config: &AckConfig) -> Self {
        Self {
            backoff_multiplier: config.backoff_multiplier.max(1),
            max_retries: config.max_retries,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self::from(&AckConfig::default())
    }
}

impl AckPolicy {
    fn next_delay(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.backoff_multiplier)
            .min(self.max_delay)
    }
}

/// One outstanding emission.
#[derive(Debug)]
struct PendingAck {
    event: String,
    group: Group,
    payload: Map<String, Value>,
    created_at_ms: u64,
    retries: u32,
    delay: Duration,
}

impl PendingAck {
    fn frame(&self) -> Frame {
        Frame::new(self.event.clone(), Value::Object(self.payload.clone()))
    }
}

enum Recheck {
    Retry {
        frame: Frame,
        group: Group,
        delay: Duration,
        attempt: u32,
    },
    Exhausted,
}

struct AckInner {
    router: Arc<Router>,
    pending: DashMap<AckId, PendingAck>,
    policy: AckPolicy,
    sink: Arc<dyn DeliveryFailureSink>,
    metrics: Arc<RelayMetrics>,
}

/// Tracks at-least-once emissions. Cheap to clone.
#[derive(Clone)]
pub struct AckEngine {
    inner: Arc<AckInner>,
}

impl std::fmt::Debug for AckEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckEngine")
            .field("policy", &self.inner.policy)
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl AckEngine {
    /// Create an engine emitting through `router`.
    pub fn new(
        router: Arc<Router>,
        policy: AckPolicy,
        sink: Arc<dyn DeliveryFailureSink>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(AckInner {
                router,
                pending: DashMap::new(),
                policy,
                sink,
                metrics,
            }),
        }
    }

    /// Emit `payload` to `group` with an embedded `ackId` and track it until
    /// acknowledged or out of retries.
    ///
    /// Must be called from within a Tokio runtime; the re-check is a spawned
    /// timer and the caller never waits on it.
    pub fn emit_with_ack(
        &self,
        group: Group,
        event: &str,
        mut payload: Map<String, Value>,
        timeout: Duration,
    ) -> AckId {
        let ack_id = AckId::new();
        payload.insert(ACK_ID_FIELD.to_string(), Value::String(ack_id.to_string()));

        let pending = PendingAck {
            event: event.to_string(),
            group: group.clone(),
            payload,
            created_at_ms: unix_millis(),
            retries: 0,
            delay: timeout,
        };
        let frame = pending.frame();

        // Record before emitting so an immediate receipt finds the entry.
        self.inner.pending.insert(ack_id, pending);
        RelayMetrics::incr(&self.inner.metrics.acks_emitted_total);

        let sent = self.inner.router.emit(&group, frame);
        tracing::debug!(
            ack_id = %ack_id,
            event,
            group = %group,
            sent,
            timeout_ms = timeout.as_millis() as u64,
            "Emitted with ack"
        );

        self.schedule(ack_id, timeout);
        ack_id
    }

    /// Clear a pending emission.
    ///
    /// Returns `false` when `ack_id` was already acknowledged, unknown, or
    /// exhausted. That is a normal race, not an error.
    pub fn acknowledge(&self, ack_id: &AckId) -> bool {
        let removed = self.inner.pending.remove(ack_id).is_some();
        self.record_ack(ack_id, removed);
        removed
    }

    /// Clear a pending emission on behalf of `identity`.
    ///
    /// Only a member of the emission's target group may acknowledge it; any
    /// other sender is treated like an unknown id.
    pub fn acknowledge_from(&self, ack_id: &AckId, identity: &Identity) -> bool {
        let groups = identity.groups();
        let removed = self
            .inner
            .pending
            .remove_if(ack_id, |_, pending| groups.contains(&pending.group))
            .is_some();
        self.record_ack(ack_id, removed);
        removed
    }

    fn record_ack(&self, ack_id: &AckId, removed: bool) {
        if removed {
            RelayMetrics::incr(&self.inner.metrics.acks_acknowledged_total);
            tracing::debug!(ack_id = %ack_id, "Acknowledged");
        } else {
            tracing::debug!(ack_id = %ack_id, "Ack for unknown or settled emission");
        }
    }

    /// Number of emissions awaiting a receipt.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether `ack_id` is still awaiting a receipt.
    pub fn is_pending(&self, ack_id: &AckId) -> bool {
        self.inner.pending.contains_key(ack_id)
    }

    fn schedule(&self, ack_id: AckId, delay: Duration) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.recheck(ack_id).await;
        });
    }

    async fn recheck(&self, ack_id: AckId) {
        let policy = self.inner.policy;
        let step = match self.inner.pending.get_mut(&ack_id) {
            None => return,
            Some(mut pending) if pending.retries < policy.max_retries => {
                pending.retries += 1;
                pending.delay = policy.next_delay(pending.delay);
                Recheck::Retry {
                    frame: pending.frame(),
                    group: pending.group.clone(),
                    delay: pending.delay,
                    attempt: pending.retries,
                }
            }
            Some(_) => Recheck::Exhausted,
        };

        match step {
            Recheck::Retry {
                frame,
                group,
                delay,
                attempt,
            } => {
                RelayMetrics::incr(&self.inner.metrics.acks_retried_total);
                let sent = self.inner.router.emit(&group, frame);
                tracing::debug!(
                    ack_id = %ack_id,
                    group = %group,
                    attempt,
                    sent,
                    next_check_ms = delay.as_millis() as u64,
                    "Re-emitted unacknowledged event"
                );
                self.schedule(ack_id, delay);
            }
            Recheck::Exhausted => {
                let Some((_, pending)) = self.inner.pending.remove(&ack_id) else {
                    return;
                };
                RelayMetrics::incr(&self.inner.metrics.acks_exhausted_total);
                tracing::warn!(
                    ack_id = %ack_id,
                    event = %pending.event,
                    group = %pending.group,
                    retries = pending.retries,
                    "Delivery exhausted, handing to failure sink"
                );

                let failure = DeliveryFailure {
                    ack_id,
                    event_name: pending.event,
                    target_group: pending.group,
                    attempts: pending.retries + 1,
                    payload: Value::Object(pending.payload),
                    created_at_ms: pending.created_at_ms,
                };
                if let Err(e) = self.inner.sink.report(failure).await {
                    tracing::error!(ack_id = %ack_id, "Failed to record undelivered event: {}", e);
                }
            }
        }
    }
}
