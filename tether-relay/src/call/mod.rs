//! Call session engine.
//!
//! Drives the `ringing → active → ended` state machine for calls shared by a
//! primary (telephony) endpoint and its user's mirrors, and relays opaque
//! signaling between the two sides.
//!
//! ## Locking
//!
//! Each call lives in its own `Arc<Mutex<Option<ActiveCall>>>` slot inside a
//! `DashMap`. Operations clone the slot out of the map, lock it, and emit while
//! holding the lock, so racing operations on one call are linearized and their
//! relays leave in the same order. Ending a call takes the state out of the
//! slot before removing it from the map; a racer that already holds the slot
//! finds `None` and does nothing.

mod active;

pub use active::{other_side, ActiveCall, TransitionError};

use crate::directory::LineDirectory;
use crate::error::{ProtocolError, ProtocolResult};
use crate::metrics::RelayMetrics;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::router::Router;
use crate::storage::{CallHistorySink, CallRecord};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_types::{
    CallDirection, CallEndNotice, CallId, CallIncomingNotice, CallInitiateNotice, CallOutcome,
    CallRef, CallSignalNotice, CallStatus, CallStatusNotice, ConnectionId, ContactInfo,
    EndpointKind, Group, IncomingCall, InitiateCall, LineInfo, ServerEvent, SignalRelay,
    StateReport,
};
use tokio::sync::Mutex;

/// `call:status` reason when no primary is online for an outgoing call.
pub const REASON_DEVICE_UNAVAILABLE: &str = "device_unavailable";

/// `call:status` reason when a participant's transport closed mid-call.
pub const REASON_DISCONNECTED: &str = "disconnected";

type CallSlot = Arc<Mutex<Option<ActiveCall>>>;

/// Owns every live call.
pub struct CallEngine {
    registry: Arc<ConnectionRegistry>,
    router: Arc<Router>,
    directory: Arc<dyn LineDirectory>,
    history: Arc<dyn CallHistorySink>,
    calls: DashMap<CallId, CallSlot>,
    enrichment_timeout: Duration,
    metrics: Arc<RelayMetrics>,
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("calls", &self.calls.len())
            .field("enrichment_timeout", &self.enrichment_timeout)
            .finish_non_exhaustive()
    }
}

fn unauthorized(sender: &ConnectionHandle, action: &'static str, reason: &str) -> ProtocolError {
    ProtocolError::Unauthorized {
        kind: sender.identity().kind,
        action,
        reason: reason.to_string(),
    }
}

impl CallEngine {
    /// Create an engine. The registry and router must already be live.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        router: Arc<Router>,
        directory: Arc<dyn LineDirectory>,
        history: Arc<dyn CallHistorySink>,
        enrichment_timeout: Duration,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            registry,
            router,
            directory,
            history,
            calls: DashMap::new(),
            enrichment_timeout,
            metrics,
        }
    }

    /// Number of live calls.
    pub fn active_count(&self) -> usize {
        self.calls.len()
    }

    /// Snapshot of a live call.
    pub async fn get(&self, call_id: &CallId) -> Option<ActiveCall> {
        let slot = self.slot(call_id)?;
        let guard = slot.lock().await;
        guard.clone()
    }

    fn slot(&self, call_id: &CallId) -> Option<CallSlot> {
        self.calls.get(call_id).map(|entry| entry.value().clone())
    }

    /// Primary reports a ringing incoming call.
    ///
    /// The call exists as soon as this returns. The enriched `call:incoming`
    /// for the user's other endpoints is emitted from a spawned task so slow
    /// lookups never hold up the reporting connection. The reporter gets a
    /// `call:status` carrying the call id.
    pub async fn report_incoming(
        &self,
        sender: &ConnectionHandle,
        report: IncomingCall,
    ) -> ProtocolResult<Option<CallId>> {
        let identity = sender.identity();
        let device_id = match (&identity.kind, &identity.device_id) {
            (EndpointKind::Primary, Some(device_id)) => device_id.clone(),
            _ => return Err(unauthorized(sender, "call:incoming", "primary-only report")),
        };

        let call = ActiveCall::incoming(
            report.call_id.unwrap_or_default(),
            identity.user_id.clone(),
            device_id,
            sender.id(),
            report.from,
            report.line_id,
        );
        let call_id = call.call_id;

        let slot: CallSlot = Arc::new(Mutex::new(None));
        let mut guard = slot.lock().await;
        match self.calls.entry(call_id) {
            Entry::Occupied(_) => {
                tracing::debug!(call_id = %call_id, "Duplicate incoming report ignored");
                return Ok(None);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot.clone());
            }
        }
        RelayMetrics::incr(&self.metrics.calls_started_total);
        tracing::info!(
            call_id = %call_id,
            user_id = %call.owner_user_id,
            connection_id = %sender.id(),
            "Incoming call"
        );

        self.router
            .send_to(&sender.id(), &ServerEvent::CallStatus(call.status_notice()));

        let enrichment = IncomingEnrichment {
            router: self.router.clone(),
            directory: self.directory.clone(),
            timeout: self.enrichment_timeout,
            slot: slot.clone(),
            reporter: sender.id(),
            call: call.clone(),
        };
        *guard = Some(call);
        drop(guard);

        tokio::spawn(enrichment.run());
        Ok(Some(call_id))
    }

    /// Mirror asks the user's primary to place a call.
    ///
    /// When no primary is online the mirror gets an `ended` status with reason
    /// `device_unavailable` and no call is created.
    pub async fn request_outgoing(
        &self,
        sender: &ConnectionHandle,
        request: InitiateCall,
    ) -> ProtocolResult<Option<CallId>> {
        let identity = sender.identity();
        if identity.kind != EndpointKind::Mirror {
            return Err(unauthorized(sender, "call:initiate", "mirror-only request"));
        }

        let primary = self
            .registry
            .find_primary(&identity.user_id, request.device_id.as_ref())
            .and_then(|c| c.identity().device_id.clone());
        let Some(device_id) = primary else {
            tracing::debug!(connection_id = %sender.id(), "No primary online for outgoing call");
            let notice = CallStatusNotice {
                call_id: CallId::new(),
                status: CallStatus::Ended,
                direction: CallDirection::Outgoing,
                address: request.to,
                line_id: request.line_id,
                duration_secs: Some(0),
                reason: Some(REASON_DEVICE_UNAVAILABLE.to_string()),
            };
            self.router
                .send_to(&sender.id(), &ServerEvent::CallStatus(notice));
            return Ok(None);
        };

        let call = ActiveCall::outgoing(
            identity.user_id.clone(),
            device_id,
            sender.id(),
            request.to,
            request.line_id,
        );
        let call_id = call.call_id;

        let slot: CallSlot = Arc::new(Mutex::new(Some(call)));
        let guard = slot.lock().await;
        self.calls.insert(call_id, slot.clone());
        RelayMetrics::incr(&self.metrics.calls_started_total);

        let Some(call) = guard.as_ref() else {
            return Ok(None);
        };
        tracing::info!(
            call_id = %call_id,
            user_id = %call.owner_user_id,
            device_id = %call.owner_device_id,
            "Outgoing call requested"
        );

        let initiate = CallInitiateNotice {
            call_id,
            to: call.address.clone(),
            line_id: call.line_id.clone(),
        };
        self.router.emit_event(
            &Group::device(&call.owner_user_id, &call.owner_device_id),
            &ServerEvent::CallInitiate(initiate),
        );
        self.to_user(call, ServerEvent::CallStatus(call.status_notice()));
        Ok(Some(call_id))
    }

    /// Mirror picks up a ringing incoming call.
    pub async fn accept(&self, sender: &ConnectionHandle, call_id: CallId) -> ProtocolResult<()> {
        let Some(slot) = self.slot(&call_id) else {
            tracing::debug!(call_id = %call_id, "Accept for unknown call");
            return Ok(());
        };
        let mut guard = slot.lock().await;
        let Some(call) = guard.as_mut() else {
            tracing::debug!(call_id = %call_id, "Accept for ended call");
            return Ok(());
        };
        if call.side_of(sender.identity()) != Some(EndpointKind::Mirror) {
            return Err(unauthorized(sender, "call:accept", "not a mirror of the call owner"));
        }
        if let Err(e) = call.accept() {
            tracing::debug!(call_id = %call_id, "Ignoring accept: {}", e);
            return Ok(());
        }
        call.bind(EndpointKind::Mirror, sender.id());

        tracing::info!(call_id = %call_id, connection_id = %sender.id(), "Call accepted");
        self.router.emit_event(
            &Group::device(&call.owner_user_id, &call.owner_device_id),
            &ServerEvent::CallAccept(CallRef { call_id }),
        );
        self.to_user(call, ServerEvent::CallStatus(call.status_notice()));
        Ok(())
    }

    /// Mirror declines a ringing call. No `ended` status follows a reject.
    pub async fn reject(&self, sender: &ConnectionHandle, call_id: CallId) -> ProtocolResult<()> {
        let Some(slot) = self.slot(&call_id) else {
            tracing::debug!(call_id = %call_id, "Reject for unknown call");
            return Ok(());
        };
        let mut guard = slot.lock().await;
        let Some(call) = guard.as_ref() else {
            tracing::debug!(call_id = %call_id, "Reject for ended call");
            return Ok(());
        };
        if call.side_of(sender.identity()) != Some(EndpointKind::Mirror) {
            return Err(unauthorized(sender, "call:reject", "not a mirror of the call owner"));
        }
        if let Err(e) = call.check_reject() {
            tracing::debug!(call_id = %call_id, "Ignoring reject: {}", e);
            return Ok(());
        }

        tracing::info!(call_id = %call_id, connection_id = %sender.id(), "Call rejected");
        self.router.emit_event(
            &Group::device(&call.owner_user_id, &call.owner_device_id),
            &ServerEvent::CallReject(CallRef { call_id }),
        );
        let duration = call.duration_secs();
        self.finish(&mut guard, CallOutcome::Rejected, duration);
        Ok(())
    }

    /// Primary reports its own view of the call status.
    ///
    /// Repeats and forward moves are mirrored to the user group; a report that
    /// would move the call backward is ignored.
    pub async fn report_state(
        &self,
        sender: &ConnectionHandle,
        report: StateReport,
    ) -> ProtocolResult<()> {
        let call_id = report.call_id;
        let Some(slot) = self.slot(&call_id) else {
            tracing::debug!(call_id = %call_id, "State report for unknown call");
            return Ok(());
        };
        let mut guard = slot.lock().await;
        let Some(call) = guard.as_mut() else {
            tracing::debug!(call_id = %call_id, "State report for ended call");
            return Ok(());
        };
        if call.side_of(sender.identity()) != Some(EndpointKind::Primary) {
            return Err(unauthorized(sender, "call:state", "not the call's primary device"));
        }
        if let Err(e) = call.apply_report(report.status) {
            tracing::debug!(call_id = %call_id, reported = %report.status, "Ignoring state report: {}", e);
            return Ok(());
        }
        call.bind(EndpointKind::Primary, sender.id());

        tracing::debug!(call_id = %call_id, status = %call.status, "Primary reported state");
        self.to_user(call, ServerEvent::CallStatus(call.status_notice()));
        Ok(())
    }

    /// Relay an opaque signaling payload to the other side.
    ///
    /// The first signal from a side binds the sending connection to it.
    pub async fn relay_signal(
        &self,
        sender: &ConnectionHandle,
        relay: SignalRelay,
    ) -> ProtocolResult<()> {
        let call_id = relay.call_id;
        let Some(slot) = self.slot(&call_id) else {
            tracing::debug!(call_id = %call_id, "Signal for unknown call");
            return Ok(());
        };
        let mut guard = slot.lock().await;
        let Some(call) = guard.as_mut() else {
            tracing::debug!(call_id = %call_id, "Signal for ended call");
            return Ok(());
        };
        let Some(side) = call.side_of(sender.identity()) else {
            return Err(unauthorized(sender, "call:signal", "not a participant"));
        };
        call.bind(side, sender.id());

        let notice = CallSignalNotice {
            call_id,
            from: side,
            signal: relay.signal,
        };
        self.to_side(call, other_side(side), &ServerEvent::CallSignal(notice));
        Ok(())
    }

    /// Either side hangs up. Ending an already-ended call is a silent no-op.
    pub async fn end(&self, sender: &ConnectionHandle, call_id: CallId) -> ProtocolResult<()> {
        let Some(slot) = self.slot(&call_id) else {
            tracing::debug!(call_id = %call_id, "End for unknown call");
            return Ok(());
        };
        let mut guard = slot.lock().await;
        let Some(call) = guard.as_ref() else {
            tracing::debug!(call_id = %call_id, "End for ended call");
            return Ok(());
        };
        let Some(side) = call.side_of(sender.identity()) else {
            return Err(unauthorized(sender, "call:end", "not a participant"));
        };

        tracing::info!(call_id = %call_id, by = %side, "Call ended by participant");
        let outcome = Self::end_outcome(call);
        let duration = self.announce_end(call, side, None);
        self.finish(&mut guard, outcome, duration);
        Ok(())
    }

    /// End every call bound to a closed connection, attributed to the side
    /// that connection spoke for. Returns how many calls were ended.
    pub async fn cleanup_connection(&self, connection_id: ConnectionId) -> usize {
        let slots: Vec<CallSlot> = self
            .calls
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut ended = 0;
        for slot in slots {
            let mut guard = slot.lock().await;
            let Some(call) = guard.as_ref() else {
                continue;
            };
            let Some(side) = call.bound_side(&connection_id) else {
                continue;
            };

            tracing::info!(
                call_id = %call.call_id,
                connection_id = %connection_id,
                side = %side,
                "Ending call after disconnect"
            );
            let duration = self.announce_end(call, side, Some(REASON_DISCONNECTED));
            self.finish(&mut guard, CallOutcome::Dropped, duration);
            ended += 1;
        }
        ended
    }

    fn end_outcome(call: &ActiveCall) -> CallOutcome {
        match call.status {
            CallStatus::Active => CallOutcome::Completed,
            _ => CallOutcome::Missed,
        }
    }

    /// Send `call:end` to the side opposite `by` and the final status to the
    /// user group. Returns the call duration.
    fn announce_end(&self, call: &ActiveCall, by: EndpointKind, reason: Option<&str>) -> u64 {
        let duration_secs = call.duration_secs();
        let notice = CallEndNotice {
            call_id: call.call_id,
            by,
            duration_secs,
        };
        self.to_side(call, other_side(by), &ServerEvent::CallEnd(notice));
        self.to_user(
            call,
            ServerEvent::CallStatus(call.ended_notice(duration_secs, reason)),
        );
        duration_secs
    }

    /// Remove the call and hand it to call history without waiting.
    fn finish(&self, slot: &mut Option<ActiveCall>, outcome: CallOutcome, duration_secs: u64) {
        let Some(call) = slot.take() else {
            return;
        };
        self.calls.remove(&call.call_id);
        RelayMetrics::incr(&self.metrics.calls_ended_total);
        tracing::debug!(
            call_id = %call.call_id,
            outcome = %outcome,
            duration_secs,
            remaining = self.calls.len(),
            "Call removed"
        );

        let record = CallRecord {
            call_id: call.call_id,
            owner_user_id: call.owner_user_id,
            owner_device_id: call.owner_device_id,
            direction: call.direction,
            address: call.address,
            line_id: call.line_id,
            outcome,
            started_at_ms: call.started_at_ms,
            duration_secs,
        };
        let history = self.history.clone();
        tokio::spawn(async move {
            let call_id = record.call_id;
            if let Err(e) = history.record_call(record).await {
                tracing::error!(call_id = %call_id, "Failed to record call history: {}", e);
            }
        });
    }

    fn to_user(&self, call: &ActiveCall, event: ServerEvent) {
        self.router
            .emit_event(&Group::user(&call.owner_user_id), &event);
    }

    /// Deliver to one side: its bound connection when live, otherwise the
    /// side's group.
    fn to_side(&self, call: &ActiveCall, side: EndpointKind, event: &ServerEvent) {
        let (bound, group) = match side {
            EndpointKind::Primary => (
                call.primary_conn,
                Group::device(&call.owner_user_id, &call.owner_device_id),
            ),
            EndpointKind::Mirror => (call.mirror_conn, Group::mirrors(&call.owner_user_id)),
        };
        if let Some(conn) = bound {
            if self.router.send_to(&conn, event) {
                return;
            }
        }
        self.router.emit_event(&group, event);
    }
}

/// Deferred `call:incoming` emission for one call.
struct IncomingEnrichment {
    router: Arc<Router>,
    directory: Arc<dyn LineDirectory>,
    timeout: Duration,
    slot: CallSlot,
    reporter: ConnectionId,
    call: ActiveCall,
}

impl IncomingEnrichment {
    async fn run(self) {
        let (line, contact) = self.lookup().await;

        // An end or reject may have won the race; never announce a dead call.
        let guard = self.slot.lock().await;
        if guard.is_none() {
            tracing::debug!(call_id = %self.call.call_id, "Call ended before announcement");
            return;
        }

        let notice = CallIncomingNotice {
            call_id: self.call.call_id,
            from: self.call.address.clone(),
            line_id: self.call.line_id.clone(),
            line,
            contact,
            started_at: self.call.started_at_ms,
        };
        self.router.emit_event_excluding(
            &Group::user(&self.call.owner_user_id),
            self.reporter,
            &ServerEvent::CallIncoming(notice),
        );
    }

    async fn lookup(&self) -> (Option<LineInfo>, Option<ContactInfo>) {
        let owner = &self.call.owner_user_id;
        let line = async {
            match self.call.line_id.as_deref() {
                Some(line_id) => self.directory.lookup_line(owner, line_id).await,
                None => Ok(None),
            }
        };
        let contact = self.directory.lookup_contact(owner, &self.call.address);

        let (line, contact) = tokio::join!(
            tokio::time::timeout(self.timeout, line),
            tokio::time::timeout(self.timeout, contact),
        );
        (
            self.settle("line", line),
            self.settle("contact", contact),
        )
    }

    fn settle<T>(
        &self,
        what: &'static str,
        result: Result<Result<Option<T>, crate::directory::DirectoryError>, tokio::time::error::Elapsed>,
    ) -> Option<T> {
        match result {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                tracing::warn!(call_id = %self.call.call_id, lookup = what, "Enrichment failed: {}", e);
                None
            }
            Err(_) => {
                tracing::warn!(call_id = %self.call.call_id, lookup = what, "Enrichment timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LineEntry;
    use crate::directory::{DirectoryError, StaticLineDirectory};
    use crate::error::StorageError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tether_types::{DeviceId, Frame, Identity, UserId};
    use tokio::sync::mpsc::Receiver;

    #[derive(Default)]
    struct RecordingHistory {
        records: StdMutex<Vec<CallRecord>>,
    }

    #[async_trait]
    impl CallHistorySink for RecordingHistory {
        async fn record_call(&self, record: CallRecord) -> Result<(), StorageError> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }
    }

    struct SlowDirectory;

    #[async_trait]
    impl LineDirectory for SlowDirectory {
        async fn lookup_line(
            &self,
            _owner: &UserId,
            _line_id: &str,
        ) -> Result<Option<LineInfo>, DirectoryError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }

        async fn lookup_contact(
            &self,
            _owner: &UserId,
            _address: &str,
        ) -> Result<Option<ContactInfo>, DirectoryError> {
            Err(DirectoryError("address book offline".into()))
        }
    }

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        engine: CallEngine,
        history: Arc<RecordingHistory>,
    }

    fn alice() -> UserId {
        UserId::new("alice").unwrap()
    }

    fn pixel() -> DeviceId {
        DeviceId::new("pixel").unwrap()
    }

    fn harness_with(directory: Arc<dyn LineDirectory>) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(RelayMetrics::default());
        let router = Arc::new(Router::new(registry.clone(), metrics.clone()));
        let history = Arc::new(RecordingHistory::default());
        let engine = CallEngine::new(
            registry.clone(),
            router,
            directory,
            history.clone(),
            Duration::from_millis(500),
            metrics,
        );
        Harness {
            registry,
            engine,
            history,
        }
    }

    fn harness() -> Harness {
        let directory = StaticLineDirectory::from_config(&[LineEntry {
            user_id: alice(),
            line_id: "L1".into(),
            name: Some("Work".into()),
            color: Some("#1e88e5".into()),
            carrier: None,
        }]);
        harness_with(Arc::new(directory))
    }

    fn connect(h: &Harness, identity: Identity) -> (ConnectionHandle, Receiver<Arc<Frame>>) {
        let (handle, rx) = ConnectionHandle::new(identity, 32);
        h.registry.register(handle.clone());
        (handle, rx)
    }

    fn phone(h: &Harness) -> (ConnectionHandle, Receiver<Arc<Frame>>) {
        connect(h, Identity::primary(alice(), pixel()))
    }

    fn laptop(h: &Harness) -> (ConnectionHandle, Receiver<Arc<Frame>>) {
        connect(h, Identity::mirror(alice()))
    }

    async fn next_frame(rx: &mut Receiver<Arc<Frame>>) -> Arc<Frame> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame within timeout")
            .expect("channel open")
    }

    /// Let spawned history writes run.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(rx: &mut Receiver<Arc<Frame>>) -> Vec<Arc<Frame>> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn events(frames: &[Arc<Frame>]) -> Vec<&str> {
        frames.iter().map(|f| f.event.as_str()).collect()
    }

    fn incoming(from: &str, line: &str) -> IncomingCall {
        IncomingCall {
            call_id: None,
            from: from.into(),
            line_id: Some(line.into()),
        }
    }

    /// Incoming call announced to and accepted by `mirror`, with queues drained.
    async fn accepted_call(
        h: &Harness,
        phone: &ConnectionHandle,
        phone_rx: &mut Receiver<Arc<Frame>>,
        mirror: &ConnectionHandle,
        mirror_rx: &mut Receiver<Arc<Frame>>,
    ) -> CallId {
        let call_id = h
            .engine
            .report_incoming(phone, incoming("+1555", "L1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next_frame(mirror_rx).await.event, "call:incoming");
        h.engine.accept(mirror, call_id).await.unwrap();
        drain(phone_rx);
        drain(mirror_rx);
        call_id
    }

    #[tokio::test]
    async fn incoming_call_is_announced_then_accepted() {
        let h = harness();
        let (phone, mut phone_rx) = phone(&h);
        let (laptop, mut laptop_rx) = laptop(&h);

        let call_id = h
            .engine
            .report_incoming(&phone, incoming("+1555", "L1"))
            .await
            .unwrap()
            .unwrap();

        let status = next_frame(&mut phone_rx).await;
        assert_eq!(status.event, "call:status");
        assert_eq!(status.data["callId"], json!(call_id.to_string()));
        assert_eq!(status.data["status"], "ringing");

        let announced = next_frame(&mut laptop_rx).await;
        assert_eq!(announced.event, "call:incoming");
        assert_eq!(announced.data["from"], "+1555");
        assert_eq!(announced.data["lineId"], "L1");
        assert_eq!(announced.data["line"]["name"], "Work");
        assert_eq!(announced.data["callId"], json!(call_id.to_string()));

        h.engine.accept(&laptop, call_id).await.unwrap();

        let phone_frames = drain(&mut phone_rx);
        assert_eq!(events(&phone_frames), vec!["call:accept", "call:status"]);
        assert_eq!(phone_frames[1].data["status"], "active");

        let laptop_frames = drain(&mut laptop_rx);
        assert_eq!(events(&laptop_frames), vec!["call:status"]);
        assert_eq!(laptop_frames[0].data["status"], "active");

        let call = h.engine.get(&call_id).await.unwrap();
        assert_eq!(call.mirror_conn, Some(laptop.id()));
    }

    #[tokio::test]
    async fn shared_device_id_keeps_call_commands_with_owner() {
        let h = harness();
        let (phone, mut phone_rx) = phone(&h);
        let (laptop, mut laptop_rx) = laptop(&h);
        let (_other_phone, mut other_rx) =
            connect(&h, Identity::primary(UserId::new("bob").unwrap(), pixel()));

        let accepted = h
            .engine
            .report_incoming(&phone, incoming("+1555", "L1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next_frame(&mut laptop_rx).await.event, "call:incoming");
        h.engine.accept(&laptop, accepted).await.unwrap();

        let rejected = h
            .engine
            .report_incoming(&phone, incoming("+1666", "L1"))
            .await
            .unwrap()
            .unwrap();
        h.engine.reject(&laptop, rejected).await.unwrap();

        let request = InitiateCall {
            to: "+1777".into(),
            line_id: None,
            device_id: Some(pixel()),
        };
        let outgoing = h
            .engine
            .request_outgoing(&laptop, request)
            .await
            .unwrap()
            .unwrap();
        h.engine.end(&laptop, outgoing).await.unwrap();
        settle().await;

        let phone_events: Vec<String> = drain(&mut phone_rx)
            .iter()
            .map(|f| f.event.clone())
            .collect();
        for expected in ["call:accept", "call:reject", "call:initiate", "call:end"] {
            assert!(phone_events.iter().any(|e| e == expected), "{expected} missing");
        }
        assert!(drain(&mut other_rx).is_empty());
    }

    #[tokio::test]
    async fn outgoing_call_reaches_device_with_same_call_id() {
        let h = harness();
        let (_phone, mut phone_rx) = phone(&h);
        let (laptop, mut laptop_rx) = laptop(&h);

        let request = InitiateCall {
            to: "+1777".into(),
            line_id: Some("L2".into()),
            device_id: None,
        };
        let call_id = h
            .engine
            .request_outgoing(&laptop, request)
            .await
            .unwrap()
            .unwrap();

        let phone_frames = drain(&mut phone_rx);
        assert_eq!(phone_frames[0].event, "call:initiate");
        assert_eq!(phone_frames[0].data["to"], "+1777");
        assert_eq!(phone_frames[0].data["lineId"], "L2");
        assert_eq!(phone_frames[0].data["callId"], json!(call_id.to_string()));

        let echo = next_frame(&mut laptop_rx).await;
        assert_eq!(echo.event, "call:status");
        assert_eq!(echo.data["status"], "ringing");
        assert_eq!(echo.data["direction"], "outgoing");
        assert_eq!(echo.data["callId"], phone_frames[0].data["callId"]);
    }

    #[tokio::test]
    async fn outgoing_call_without_primary_reports_unavailable() {
        let h = harness();
        let (laptop, mut laptop_rx) = laptop(&h);

        let request = InitiateCall {
            to: "+1777".into(),
            line_id: None,
            device_id: None,
        };
        assert!(h
            .engine
            .request_outgoing(&laptop, request)
            .await
            .unwrap()
            .is_none());

        let status = next_frame(&mut laptop_rx).await;
        assert_eq!(status.data["status"], "ended");
        assert_eq!(status.data["reason"], REASON_DEVICE_UNAVAILABLE);
        assert_eq!(h.engine.active_count(), 0);
    }

    #[tokio::test]
    async fn racing_accept_and_reject_relay_only_one() {
        let h = harness();
        let (phone, mut phone_rx) = phone(&h);
        let (laptop, mut laptop_rx) = laptop(&h);
        let (tablet, _tablet_rx) = connect(&h, Identity::mirror(alice()));

        let call_id = h
            .engine
            .report_incoming(&phone, incoming("+1555", "L1"))
            .await
            .unwrap()
            .unwrap();
        next_frame(&mut laptop_rx).await;
        drain(&mut phone_rx);

        let (accepted, rejected) = tokio::join!(
            h.engine.accept(&laptop, call_id),
            h.engine.reject(&tablet, call_id)
        );
        accepted.unwrap();
        rejected.unwrap();

        let frames = drain(&mut phone_rx);
        let names = events(&frames);
        let accepts = names.iter().filter(|n| **n == "call:accept").count();
        let rejects = names.iter().filter(|n| **n == "call:reject").count();
        assert_eq!(accepts + rejects, 1, "got {names:?}");
    }

    #[tokio::test]
    async fn reject_removes_call_without_ended_status() {
        let h = harness();
        let (phone, mut phone_rx) = phone(&h);
        let (laptop, mut laptop_rx) = laptop(&h);

        let call_id = h
            .engine
            .report_incoming(&phone, incoming("+1555", "L1"))
            .await
            .unwrap()
            .unwrap();
        next_frame(&mut laptop_rx).await;
        drain(&mut phone_rx);

        h.engine.reject(&laptop, call_id).await.unwrap();
        assert_eq!(events(&drain(&mut phone_rx)), vec!["call:reject"]);
        assert!(drain(&mut laptop_rx).is_empty());
        assert_eq!(h.engine.active_count(), 0);

        settle().await;
        let records = h.history.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, CallOutcome::Rejected);
    }

    #[tokio::test]
    async fn accept_is_noop_once_active() {
        let h = harness();
        let (phone, mut phone_rx) = phone(&h);
        let (laptop, mut laptop_rx) = laptop(&h);
        let call_id = accepted_call(&h, &phone, &mut phone_rx, &laptop, &mut laptop_rx).await;

        h.engine.accept(&laptop, call_id).await.unwrap();
        assert!(drain(&mut phone_rx).is_empty());
        assert!(drain(&mut laptop_rx).is_empty());
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let h = harness();
        let (phone, mut phone_rx) = phone(&h);
        let (laptop, mut laptop_rx) = laptop(&h);
        let call_id = accepted_call(&h, &phone, &mut phone_rx, &laptop, &mut laptop_rx).await;

        h.engine.end(&phone, call_id).await.unwrap();
        h.engine.end(&phone, call_id).await.unwrap();

        let laptop_frames = drain(&mut laptop_rx);
        assert_eq!(events(&laptop_frames), vec!["call:end", "call:status"]);
        assert_eq!(laptop_frames[0].data["by"], "primary");
        assert_eq!(laptop_frames[1].data["status"], "ended");
        assert!(laptop_frames[1].data["durationSecs"].is_u64());
        assert_eq!(h.engine.active_count(), 0);

        settle().await;
        let records = h.history.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, CallOutcome::Completed);
    }

    #[tokio::test]
    async fn ending_while_ringing_is_missed() {
        let h = harness();
        let (phone, _phone_rx) = phone(&h);
        let call_id = h
            .engine
            .report_incoming(&phone, incoming("+1555", "L1"))
            .await
            .unwrap()
            .unwrap();

        h.engine.end(&phone, call_id).await.unwrap();
        settle().await;
        assert_eq!(
            h.history.records.lock().unwrap()[0].outcome,
            CallOutcome::Missed
        );
    }

    #[tokio::test]
    async fn state_report_never_moves_backward() {
        let h = harness();
        let (phone, mut phone_rx) = phone(&h);
        let (_laptop, mut laptop_rx) = laptop(&h);
        let call_id = h
            .engine
            .report_incoming(&phone, incoming("+1555", "L1"))
            .await
            .unwrap()
            .unwrap();
        next_frame(&mut laptop_rx).await;
        drain(&mut phone_rx);

        let report = |status| StateReport { call_id, status };
        h.engine
            .report_state(&phone, report(CallStatus::Active))
            .await
            .unwrap();
        h.engine
            .report_state(&phone, report(CallStatus::Ringing))
            .await
            .unwrap();

        let frames = drain(&mut laptop_rx);
        assert_eq!(events(&frames), vec!["call:status"]);
        assert_eq!(frames[0].data["status"], "active");
        assert_eq!(
            h.engine.get(&call_id).await.unwrap().status,
            CallStatus::Active
        );
    }

    #[tokio::test]
    async fn signal_binds_sender_and_reaches_other_side() {
        let h = harness();
        let (phone, mut phone_rx) = phone(&h);
        let (laptop, mut laptop_rx) = laptop(&h);
        let (_tablet, mut tablet_rx) = connect(&h, Identity::mirror(alice()));

        let call_id = h
            .engine
            .report_incoming(&phone, incoming("+1555", "L1"))
            .await
            .unwrap()
            .unwrap();
        next_frame(&mut laptop_rx).await;
        next_frame(&mut tablet_rx).await;
        drain(&mut phone_rx);

        let offer = json!({ "type": "offer", "sdp": "v=0" });
        h.engine
            .relay_signal(
                &laptop,
                SignalRelay {
                    call_id,
                    signal: offer.clone(),
                },
            )
            .await
            .unwrap();
        let relayed = drain(&mut phone_rx);
        assert_eq!(events(&relayed), vec!["call:signal"]);
        assert_eq!(relayed[0].data["from"], "mirror");
        assert_eq!(relayed[0].data["signal"], offer);

        h.engine
            .relay_signal(
                &phone,
                SignalRelay {
                    call_id,
                    signal: json!({ "type": "answer" }),
                },
            )
            .await
            .unwrap();
        assert_eq!(events(&drain(&mut laptop_rx)), vec!["call:signal"]);
        assert!(drain(&mut tablet_rx).is_empty());
    }

    #[tokio::test]
    async fn disconnect_ends_bound_calls() {
        let h = harness();
        let (phone, mut phone_rx) = phone(&h);
        let (laptop, mut laptop_rx) = laptop(&h);
        let call_id = accepted_call(&h, &phone, &mut phone_rx, &laptop, &mut laptop_rx).await;

        h.registry.unregister(&laptop.id());
        assert_eq!(h.engine.cleanup_connection(laptop.id()).await, 1);

        let frames = drain(&mut phone_rx);
        assert_eq!(events(&frames), vec!["call:end", "call:status"]);
        assert_eq!(frames[0].data["by"], "mirror");
        assert_eq!(frames[0].data["callId"], json!(call_id.to_string()));
        assert_eq!(frames[1].data["reason"], REASON_DISCONNECTED);
        assert_eq!(h.engine.active_count(), 0);

        settle().await;
        assert_eq!(
            h.history.records.lock().unwrap()[0].outcome,
            CallOutcome::Dropped
        );
    }

    #[tokio::test]
    async fn disconnect_of_unrelated_connection_keeps_calls() {
        let h = harness();
        let (phone, mut phone_rx) = phone(&h);
        let (laptop, mut laptop_rx) = laptop(&h);
        accepted_call(&h, &phone, &mut phone_rx, &laptop, &mut laptop_rx).await;

        assert_eq!(h.engine.cleanup_connection(ConnectionId::new()).await, 0);
        assert_eq!(h.engine.active_count(), 1);
    }

    #[tokio::test]
    async fn wrong_role_is_unauthorized() {
        let h = harness();
        let (phone, _phone_rx) = phone(&h);
        let (laptop, _laptop_rx) = laptop(&h);

        let err = h
            .engine
            .report_incoming(&laptop, incoming("+1555", "L1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Unauthorized { .. }));

        let call_id = h
            .engine
            .report_incoming(&phone, incoming("+1555", "L1"))
            .await
            .unwrap()
            .unwrap();
        let err = h.engine.accept(&phone, call_id).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Unauthorized { .. }));

        let (stranger, _rx) = connect(&h, Identity::mirror(UserId::new("bob").unwrap()));
        assert!(h.engine.end(&stranger, call_id).await.is_err());
        assert_eq!(h.engine.active_count(), 1);
    }

    #[tokio::test]
    async fn unknown_call_is_silently_ignored() {
        let h = harness();
        let (laptop, mut laptop_rx) = laptop(&h);
        let ghost = CallId::new();
        assert!(h.engine.accept(&laptop, ghost).await.is_ok());
        assert!(h.engine.reject(&laptop, ghost).await.is_ok());
        assert!(h.engine.end(&laptop, ghost).await.is_ok());
        assert!(drain(&mut laptop_rx).is_empty());
    }

    #[tokio::test]
    async fn duplicate_incoming_report_keeps_one_call() {
        let h = harness();
        let (phone, _phone_rx) = phone(&h);
        let call_id = CallId::new();
        let report = IncomingCall {
            call_id: Some(call_id),
            from: "+1555".into(),
            line_id: None,
        };

        assert_eq!(
            h.engine.report_incoming(&phone, report.clone()).await.unwrap(),
            Some(call_id)
        );
        assert_eq!(h.engine.report_incoming(&phone, report).await.unwrap(), None);
        assert_eq!(h.engine.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_enrichment_degrades_to_raw_metadata() {
        let h = harness_with(Arc::new(SlowDirectory));
        let (phone, _phone_rx) = phone(&h);
        let (_laptop, mut laptop_rx) = laptop(&h);

        h.engine
            .report_incoming(&phone, incoming("+1555", "L1"))
            .await
            .unwrap();

        let announced = next_frame(&mut laptop_rx).await;
        assert_eq!(announced.data["from"], "+1555");
        assert_eq!(announced.data["lineId"], "L1");
        assert!(announced.data.get("line").is_none());
        assert!(announced.data.get("contact").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn call_ended_during_enrichment_is_not_announced() {
        let h = harness_with(Arc::new(SlowDirectory));
        let (phone, _phone_rx) = phone(&h);
        let (_laptop, mut laptop_rx) = laptop(&h);

        let call_id = h
            .engine
            .report_incoming(&phone, incoming("+1555", "L1"))
            .await
            .unwrap()
            .unwrap();
        h.engine.end(&phone, call_id).await.unwrap();

        let frames = drain(&mut laptop_rx);
        assert_eq!(events(&frames), vec!["call:end", "call:status"]);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(drain(&mut laptop_rx).is_empty());
    }
}
