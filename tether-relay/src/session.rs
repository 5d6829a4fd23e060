//! Per-connection session management.
//!
//! Each registered connection gets a Session that screens inbound frames
//! (size, rate, decode) and dispatches them to the owning engine. Errors are
//! returned to the transport loop, which logs them and keeps reading; nothing
//! here ever replies with an error frame.

use crate::error::{ProtocolError, ProtocolResult};
use crate::metrics::RelayMetrics;
use crate::registry::ConnectionHandle;
use crate::server::Relay;
use serde_json::{Map, Value};
use std::sync::Arc;
use tether_types::{
    ClientEvent, ConnectionId, EndpointKind, Group, Identity, ServerEvent, SmsResult, SmsSend,
    EVENT_MESSAGE_NEW, EVENT_NOTIFICATION_NEW,
};

/// `sms:result` error when no primary can take an `sms:send`.
pub const SMS_DEVICE_UNAVAILABLE: &str = "device_unavailable";

/// A per-connection session.
#[derive(Debug)]
pub struct Session {
    relay: Arc<Relay>,
    handle: ConnectionHandle,
}

impl Session {
    /// Create a session for an already registered connection.
    pub fn new(relay: Arc<Relay>, handle: ConnectionHandle) -> Self {
        Self { relay, handle }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    /// Verified identity of the connection.
    pub fn identity(&self) -> &Identity {
        self.handle.identity()
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&self, text: &str) -> ProtocolResult<()> {
        let limit = self.relay.config().limits.max_frame_bytes;
        if text.len() > limit {
            RelayMetrics::incr(&self.relay.metrics().protocol_errors_total);
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                limit,
            });
        }

        if let Err(e) = self.relay.rate_limits().check_global() {
            RelayMetrics::incr(&self.relay.metrics().rate_limit_hits);
            return Err(ProtocolError::RateLimited {
                reason: e.to_string(),
            });
        }
        if let Err(e) = self.relay.rate_limits().check_event(&self.id()) {
            RelayMetrics::incr(&self.relay.metrics().rate_limit_hits);
            return Err(ProtocolError::RateLimited {
                reason: e.to_string(),
            });
        }

        let event = match ClientEvent::decode(text) {
            Ok(event) => event,
            Err(e) => {
                RelayMetrics::incr(&self.relay.metrics().protocol_errors_total);
                return Err(e.into());
            }
        };
        RelayMetrics::incr(&self.relay.metrics().events_in_total);

        tracing::trace!(connection_id = %self.id(), event = event.name(), "Inbound event");
        let result = self.dispatch(event).await;
        if let Err(ProtocolError::Unauthorized { .. }) = &result {
            RelayMetrics::incr(&self.relay.metrics().protocol_errors_total);
        }
        result
    }

    async fn dispatch(&self, event: ClientEvent) -> ProtocolResult<()> {
        let calls = self.relay.calls();
        match event {
            ClientEvent::CallIncoming(report) => {
                calls.report_incoming(&self.handle, report).await.map(drop)
            }
            ClientEvent::CallInitiate(request) => {
                calls.request_outgoing(&self.handle, request).await.map(drop)
            }
            ClientEvent::CallAccept(r) => calls.accept(&self.handle, r.call_id).await,
            ClientEvent::CallReject(r) => calls.reject(&self.handle, r.call_id).await,
            ClientEvent::CallState(report) => calls.report_state(&self.handle, report).await,
            ClientEvent::CallSignal(relay) => calls.relay_signal(&self.handle, relay).await,
            ClientEvent::CallEnd(r) => calls.end(&self.handle, r.call_id).await,
            ClientEvent::MessageNew(payload) => self.relay_with_ack(EVENT_MESSAGE_NEW, payload),
            ClientEvent::NotificationNew(payload) => {
                self.relay_with_ack(EVENT_NOTIFICATION_NEW, payload)
            }
            ClientEvent::SmsSend(send) => self.forward_sms(send),
            ClientEvent::SmsResult(result) => self.sms_result(result),
            ClientEvent::Ack(receipt) => {
                self.relay
                    .acks()
                    .acknowledge_from(&receipt.ack_id, self.identity());
                Ok(())
            }
            ClientEvent::Ping => {
                self.relay.router().send_to(&self.id(), &ServerEvent::Pong);
                Ok(())
            }
        }
    }

    fn require(&self, kind: EndpointKind, action: &'static str) -> ProtocolResult<()> {
        if self.identity().kind == kind {
            Ok(())
        } else {
            Err(ProtocolError::Unauthorized {
                kind: self.identity().kind,
                action,
                reason: format!("{kind}-only event"),
            })
        }
    }

    /// Primary pushes an opaque event to its user's mirrors with at-least-once
    /// delivery.
    fn relay_with_ack(&self, event: &'static str, payload: Map<String, Value>) -> ProtocolResult<()> {
        self.require(EndpointKind::Primary, event)?;
        let group = Group::mirrors(&self.identity().user_id);
        let timeout = self.relay.config().ack.timeout();
        let ack_id = self.relay.acks().emit_with_ack(group, event, payload, timeout);
        tracing::debug!(connection_id = %self.id(), ack_id = %ack_id, event, "Relayed with ack");
        Ok(())
    }

    /// Mirror asks a primary to send an SMS.
    fn forward_sms(&self, send: SmsSend) -> ProtocolResult<()> {
        self.require(EndpointKind::Mirror, "sms:send")?;
        let user_id = &self.identity().user_id;
        let Some(primary) = self
            .relay
            .registry()
            .find_primary(user_id, send.device_id.as_ref())
        else {
            tracing::info!(request_id = %send.request_id, "No primary online for sms:send");
            let result = SmsResult {
                request_id: send.request_id,
                ok: false,
                error: Some(SMS_DEVICE_UNAVAILABLE.to_string()),
            };
            self.relay
                .router()
                .send_to(&self.id(), &ServerEvent::SmsResult(result));
            return Ok(());
        };

        let Some(device_id) = primary.identity().device_id.clone() else {
            return Ok(());
        };
        self.relay
            .router()
            .emit_event(&Group::device(user_id, &device_id), &ServerEvent::SmsSend(send));
        Ok(())
    }

    /// Primary reports an SMS outcome to its user's mirrors.
    fn sms_result(&self, result: SmsResult) -> ProtocolResult<()> {
        self.require(EndpointKind::Primary, "sms:result")?;
        let group = Group::mirrors(&self.identity().user_id);
        self.relay
            .router()
            .emit_event(&group, &ServerEvent::SmsResult(result));
        Ok(())
    }

    /// Tear down after the transport closed: unregister, then end every call
    /// this connection was bound to.
    pub async fn close(self) {
        let id = self.id();
        self.relay.registry().unregister(&id);
        let ended = self.relay.calls().cleanup_connection(id).await;
        tracing::info!(connection_id = %id, calls_ended = ended, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;
    use std::time::Duration;
    use tether_types::{DeviceId, Frame, UserId};
    use tokio::sync::mpsc::Receiver;

    fn alice() -> UserId {
        UserId::new("alice").unwrap()
    }

    fn relay() -> Arc<Relay> {
        Arc::new(Relay::new(Config::default()))
    }

    /// Open a session and swallow its hello.
    fn open(relay: &Arc<Relay>, identity: Identity) -> (Session, Receiver<Arc<Frame>>) {
        let (session, mut rx) = relay.open_session(identity).unwrap();
        let hello = rx.try_recv().unwrap();
        assert_eq!(hello.event, "hello");
        (session, rx)
    }

    fn phone(relay: &Arc<Relay>) -> (Session, Receiver<Arc<Frame>>) {
        open(
            relay,
            Identity::primary(alice(), DeviceId::new("pixel").unwrap()),
        )
    }

    fn laptop(relay: &Arc<Relay>) -> (Session, Receiver<Arc<Frame>>) {
        open(relay, Identity::mirror(alice()))
    }

    async fn next_frame(rx: &mut Receiver<Arc<Frame>>) -> Arc<Frame> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame within timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn ping_is_answered_to_sender_only() {
        let relay = relay();
        let (phone, mut phone_rx) = phone(&relay);
        let (_laptop, mut laptop_rx) = laptop(&relay);

        phone.handle_text(r#"{"event":"ping"}"#).await.unwrap();
        assert_eq!(next_frame(&mut phone_rx).await.event, "pong");
        assert!(laptop_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn message_reaches_mirrors_with_ack_id() {
        let relay = relay();
        let (phone, mut phone_rx) = phone(&relay);
        let (laptop, mut laptop_rx) = laptop(&relay);

        phone
            .handle_text(r#"{"event":"message:new","data":{"from":"+1555","body":"hi"}}"#)
            .await
            .unwrap();

        let frame = next_frame(&mut laptop_rx).await;
        assert_eq!(frame.event, "message:new");
        assert_eq!(frame.data["body"], "hi");
        let ack_id = frame.data["ackId"].as_str().unwrap().to_string();
        assert!(phone_rx.try_recv().is_err());
        assert_eq!(relay.acks().pending_count(), 1);

        let ack = json!({ "event": "ack", "data": { "ackId": ack_id } }).to_string();
        laptop.handle_text(&ack).await.unwrap();
        assert_eq!(relay.acks().pending_count(), 0);
    }

    #[tokio::test]
    async fn mirror_cannot_push_messages() {
        let relay = relay();
        let (laptop, _laptop_rx) = laptop(&relay);

        let err = laptop
            .handle_text(r#"{"event":"notification:new","data":{"title":"x"}}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Unauthorized { .. }));
        assert_eq!(relay.acks().pending_count(), 0);
        assert_eq!(
            RelayMetrics::get(&relay.metrics().protocol_errors_total),
            1
        );
    }

    #[tokio::test]
    async fn sms_round_trip_between_mirror_and_primary() {
        let relay = relay();
        let (phone, mut phone_rx) = phone(&relay);
        let (laptop, mut laptop_rx) = laptop(&relay);

        laptop
            .handle_text(r#"{"event":"sms:send","data":{"requestId":"r1","to":"+1777","body":"on my way"}}"#)
            .await
            .unwrap();
        let send = next_frame(&mut phone_rx).await;
        assert_eq!(send.event, "sms:send");
        assert_eq!(send.data["body"], "on my way");

        phone
            .handle_text(r#"{"event":"sms:result","data":{"requestId":"r1","ok":true}}"#)
            .await
            .unwrap();
        let result = next_frame(&mut laptop_rx).await;
        assert_eq!(result.event, "sms:result");
        assert_eq!(result.data["ok"], true);
        assert!(phone_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shared_device_id_never_crosses_users() {
        let relay = relay();
        let bob = UserId::new("bob").unwrap();
        let pixel = DeviceId::new("pixel").unwrap();
        let (_alice_phone, mut alice_rx) = phone(&relay);
        let (_bob_phone, mut bob_rx) = open(&relay, Identity::primary(bob.clone(), pixel));
        let (bob_laptop, mut bob_laptop_rx) = open(&relay, Identity::mirror(bob));

        bob_laptop
            .handle_text(r#"{"event":"sms:send","data":{"requestId":"r1","to":"+1999","body":"bob only"}}"#)
            .await
            .unwrap();
        bob_laptop
            .handle_text(r#"{"event":"call:initiate","data":{"to":"+1777","deviceId":"pixel"}}"#)
            .await
            .unwrap();

        let send = next_frame(&mut bob_rx).await;
        assert_eq!(send.event, "sms:send");
        assert_eq!(send.data["body"], "bob only");
        let initiate = next_frame(&mut bob_rx).await;
        assert_eq!(initiate.event, "call:initiate");
        assert_eq!(initiate.data["to"], "+1777");
        assert_eq!(next_frame(&mut bob_laptop_rx).await.event, "call:status");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sms_without_primary_fails_fast() {
        let relay = relay();
        let (laptop, mut laptop_rx) = laptop(&relay);

        laptop
            .handle_text(r#"{"event":"sms:send","data":{"requestId":"r2","to":"+1777","body":"x"}}"#)
            .await
            .unwrap();
        let result = next_frame(&mut laptop_rx).await;
        assert_eq!(result.event, "sms:result");
        assert_eq!(result.data["ok"], false);
        assert_eq!(result.data["error"], SMS_DEVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn malformed_and_oversized_frames_are_rejected() {
        let mut config = Config::default();
        config.limits.max_frame_bytes = 64;
        let relay = Arc::new(Relay::new(config));
        let (laptop, _rx) = laptop(&relay);

        assert!(matches!(
            laptop.handle_text("not json").await,
            Err(ProtocolError::Decode(_))
        ));
        assert!(matches!(
            laptop.handle_text(r#"{"event":"teleport","data":{}}"#).await,
            Err(ProtocolError::Decode(_))
        ));
        let big = format!(r#"{{"event":"ping","data":"{}"}}"#, "x".repeat(100));
        assert!(matches!(
            laptop.handle_text(&big).await,
            Err(ProtocolError::FrameTooLarge { .. })
        ));
        assert_eq!(RelayMetrics::get(&relay.metrics().events_in_total), 0);
    }

    #[tokio::test]
    async fn event_rate_limit_applies_per_connection() {
        let mut config = Config::default();
        config.limits.events_per_minute = 2;
        let relay = Arc::new(Relay::new(config));
        let (laptop, _rx) = laptop(&relay);

        laptop.handle_text(r#"{"event":"ping"}"#).await.unwrap();
        laptop.handle_text(r#"{"event":"ping"}"#).await.unwrap();
        assert!(matches!(
            laptop.handle_text(r#"{"event":"ping"}"#).await,
            Err(ProtocolError::RateLimited { .. })
        ));
        assert_eq!(RelayMetrics::get(&relay.metrics().rate_limit_hits), 1);
    }

    #[tokio::test]
    async fn close_ends_bound_calls() {
        let relay = relay();
        let (phone, _phone_rx) = phone(&relay);
        let (laptop, mut laptop_rx) = laptop(&relay);

        phone
            .handle_text(r#"{"event":"call:incoming","data":{"from":"+1555"}}"#)
            .await
            .unwrap();
        assert_eq!(next_frame(&mut laptop_rx).await.event, "call:incoming");
        assert_eq!(relay.calls().active_count(), 1);

        phone.close().await;
        assert_eq!(relay.registry().len(), 1);
        assert_eq!(relay.calls().active_count(), 0);

        let hangup = next_frame(&mut laptop_rx).await;
        assert_eq!(hangup.event, "call:end");
        assert_eq!(hangup.data["by"], "primary");
        let ended = next_frame(&mut laptop_rx).await;
        assert_eq!(ended.event, "call:status");
        assert_eq!(ended.data["status"], "ended");
        assert_eq!(ended.data["reason"], "disconnected");
        drop(laptop);
    }
}
