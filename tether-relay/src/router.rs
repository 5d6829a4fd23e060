//! Fan-out of events to logical groups.
//!
//! The router is the only component that touches connection handles. Feature
//! code (calls, acks, sessions) addresses groups and never sees the transport.

use crate::metrics::RelayMetrics;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use std::sync::Arc;
use tether_types::{ConnectionId, Frame, Group, ServerEvent};

/// Delivers frames to every live member of a group.
#[derive(Debug)]
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<RelayMetrics>,
}

impl Router {
    /// Create a router over a registry.
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<RelayMetrics>) -> Self {
        Self { registry, metrics }
    }

    /// Deliver `frame` to every connection currently in `group`.
    ///
    /// Returns how many connections accepted the frame into their queue. This
    /// is not a delivery proof; an empty group is a silent no-op.
    pub fn emit(&self, group: &Group, frame: Frame) -> usize {
        self.fan_out(group, None, frame)
    }

    /// Like [`Router::emit`] but skips one connection (usually the sender).
    pub fn emit_excluding(&self, group: &Group, exclude: ConnectionId, frame: Frame) -> usize {
        self.fan_out(group, Some(exclude), frame)
    }

    /// Serialize a typed event and emit it.
    pub fn emit_event(&self, group: &Group, event: &ServerEvent) -> usize {
        match Frame::from_event(event) {
            Ok(frame) => self.emit(group, frame),
            Err(e) => {
                tracing::error!(event = event.name(), "Failed to serialize event: {}", e);
                0
            }
        }
    }

    /// Serialize a typed event and emit it to everyone in `group` but `exclude`.
    pub fn emit_event_excluding(
        &self,
        group: &Group,
        exclude: ConnectionId,
        event: &ServerEvent,
    ) -> usize {
        match Frame::from_event(event) {
            Ok(frame) => self.emit_excluding(group, exclude, frame),
            Err(e) => {
                tracing::error!(event = event.name(), "Failed to serialize event: {}", e);
                0
            }
        }
    }

    /// Send a typed event to a single connection.
    pub fn send_to(&self, id: &ConnectionId, event: &ServerEvent) -> bool {
        let Some(handle) = self.registry.get(id) else {
            tracing::debug!(connection_id = %id, event = event.name(), "Target connection gone");
            return false;
        };
        match Frame::from_event(event) {
            Ok(frame) => self.deliver(&handle, Arc::new(frame)),
            Err(e) => {
                tracing::error!(event = event.name(), "Failed to serialize event: {}", e);
                false
            }
        }
    }

    fn fan_out(&self, group: &Group, exclude: Option<ConnectionId>, frame: Frame) -> usize {
        let members = self.registry.list_connections(group);
        if members.is_empty() {
            tracing::debug!(group = %group, event = %frame.event, "No live members, dropping");
            return 0;
        }

        let frame = Arc::new(frame);
        let sent = members
            .iter()
            .filter(|handle| Some(handle.id()) != exclude)
            .filter(|handle| self.deliver(handle, frame.clone()))
            .count();

        tracing::debug!(
            group = %group,
            event = %frame.event,
            "Emitted to {}/{} connections",
            sent,
            members.len()
        );
        sent
    }

    fn deliver(&self, handle: &ConnectionHandle, frame: Arc<Frame>) -> bool {
        match handle.deliver(frame) {
            Ok(()) => {
                RelayMetrics::incr(&self.metrics.events_out_total);
                true
            }
            Err(e) => {
                RelayMetrics::incr(&self.metrics.deliveries_dropped_total);
                tracing::debug!(connection_id = %handle.id(), "Delivery dropped: {}", e);
                false
            }
        }
    }
}
