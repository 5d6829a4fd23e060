//! Persistence seams for tether-relay.
//!
//! The relay never waits on storage before relaying. Call history and
//! delivery failures are handed to these sinks after the fact.

mod sqlite;

pub use sqlite::{SqliteStore, UndeliveredEvent};

use crate::error::StorageError;
use async_trait::async_trait;
use serde_json::Value;
use tether_types::{AckId, CallDirection, CallId, CallOutcome, DeviceId, Group, UserId};

/// A finished call, as handed to call history.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    /// Call identifier.
    pub call_id: CallId,
    /// Owning user.
    pub owner_user_id: UserId,
    /// Owning primary device.
    pub owner_device_id: DeviceId,
    /// Direction relative to the primary.
    pub direction: CallDirection,
    /// Remote party address.
    pub address: String,
    /// Line used.
    pub line_id: Option<String>,
    /// How the call ended.
    pub outcome: CallOutcome,
    /// Unix milliseconds at creation.
    pub started_at_ms: u64,
    /// Seconds from creation to end.
    pub duration_secs: u64,
}

/// An at-least-once emission that was never acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryFailure {
    /// Emission id.
    pub ack_id: AckId,
    /// Event name.
    pub event_name: String,
    /// Group the emission targeted.
    pub target_group: Group,
    /// Total emissions made (initial + re-emissions).
    pub attempts: u32,
    /// Payload as emitted, including `ackId`.
    pub payload: Value,
    /// Unix milliseconds of the first emission.
    pub created_at_ms: u64,
}

/// Receives finished calls.
#[async_trait]
pub trait CallHistorySink: Send + Sync {
    /// Persist a finished call.
    async fn record_call(&self, record: CallRecord) -> Result<(), StorageError>;
}

/// Receives emissions whose retry budget ran out, for offline redelivery.
#[async_trait]
pub trait DeliveryFailureSink: Send + Sync {
    /// Persist an undelivered emission.
    async fn report(&self, failure: DeliveryFailure) -> Result<(), StorageError>;
}

/// Sink that only logs. Used when no store is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl CallHistorySink for LogSink {
    async fn record_call(&self, record: CallRecord) -> Result<(), StorageError> {
        tracing::info!(
            call_id = %record.call_id,
            outcome = %record.outcome,
            duration_secs = record.duration_secs,
            "Call finished"
        );
        Ok(())
    }
}

#[async_trait]
impl DeliveryFailureSink for LogSink {
    async fn report(&self, failure: DeliveryFailure) -> Result<(), StorageError> {
        tracing::warn!(
            ack_id = %failure.ack_id,
            event = %failure.event_name,
            group = %failure.target_group,
            attempts = failure.attempts,
            "Delivery exhausted with no store configured"
        );
        Ok(())
    }
}

/// Current wall-clock time in Unix milliseconds.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
