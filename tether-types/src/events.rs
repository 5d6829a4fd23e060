//! Events exchanged between endpoints and the relay.
//!
//! Every socket frame is a JSON object `{"event": <name>, "data": <payload>}`.
//! Inbound frames decode into [`ClientEvent`] and are validated before they
//! reach any engine; outbound typed events are [`ServerEvent`]. Generic
//! at-least-once events (new message, new notification) travel as a raw
//! [`Frame`] because their payload is opaque to the relay.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    AckId, CallDirection, CallId, CallStatus, ConnectionId, DeviceId, EndpointKind, Identity,
    TypesError,
};

/// Event name for a new SMS/chat message relayed with acknowledgment.
pub const EVENT_MESSAGE_NEW: &str = "message:new";

/// Event name for a mirrored device notification relayed with acknowledgment.
pub const EVENT_NOTIFICATION_NEW: &str = "notification:new";

/// One socket frame: an event name plus its JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Event name, e.g. `call:status`.
    pub event: String,
    /// Event payload. `null` for payload-less events.
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    /// Build a frame from a name and payload.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Build a frame from a typed outbound event.
    pub fn from_event(event: &ServerEvent) -> Result<Self, TypesError> {
        let value = serde_json::to_value(event)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Parse a frame from socket text.
    pub fn from_text(text: &str) -> Result<Self, TypesError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Render the frame as socket text.
    pub fn to_text(&self) -> Result<String, TypesError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Events an endpoint may send to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Primary reports a ringing incoming call.
    #[serde(rename = "call:incoming")]
    CallIncoming(IncomingCall),
    /// Mirror asks the primary to place a call.
    #[serde(rename = "call:initiate")]
    CallInitiate(InitiateCall),
    /// Mirror picks up a ringing incoming call.
    #[serde(rename = "call:accept")]
    CallAccept(CallRef),
    /// Mirror declines a ringing call.
    #[serde(rename = "call:reject")]
    CallReject(CallRef),
    /// Primary reports its own view of the call status.
    #[serde(rename = "call:state")]
    CallState(StateReport),
    /// Opaque session negotiation payload for the other party.
    #[serde(rename = "call:signal")]
    CallSignal(SignalRelay),
    /// Either party hangs up.
    #[serde(rename = "call:end")]
    CallEnd(CallRef),
    /// Primary reports a new message (relayed with acknowledgment).
    #[serde(rename = "message:new")]
    MessageNew(Map<String, Value>),
    /// Primary reports a new notification (relayed with acknowledgment).
    #[serde(rename = "notification:new")]
    NotificationNew(Map<String, Value>),
    /// Mirror asks the primary to send an SMS.
    #[serde(rename = "sms:send")]
    SmsSend(SmsSend),
    /// Primary reports the outcome of an SMS send.
    #[serde(rename = "sms:result")]
    SmsResult(SmsResult),
    /// Receipt for an at-least-once event.
    #[serde(rename = "ack")]
    Ack(AckReceipt),
    /// Liveness check, answered to the sender only.
    #[serde(rename = "ping")]
    Ping,
}

impl ClientEvent {
    /// Decode and validate an inbound frame.
    pub fn decode(text: &str) -> Result<Self, TypesError> {
        let event: Self = serde_json::from_str(text)?;
        event.validate()?;
        Ok(event)
    }

    /// Event name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallIncoming(_) => "call:incoming",
            Self::CallInitiate(_) => "call:initiate",
            Self::CallAccept(_) => "call:accept",
            Self::CallReject(_) => "call:reject",
            Self::CallState(_) => "call:state",
            Self::CallSignal(_) => "call:signal",
            Self::CallEnd(_) => "call:end",
            Self::MessageNew(_) => EVENT_MESSAGE_NEW,
            Self::NotificationNew(_) => EVENT_NOTIFICATION_NEW,
            Self::SmsSend(_) => "sms:send",
            Self::SmsResult(_) => "sms:result",
            Self::Ack(_) => "ack",
            Self::Ping => "ping",
        }
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<(), TypesError> {
        match self {
            Self::CallIncoming(incoming) => {
                require("from", &incoming.from)?;
                require_opt("lineId", incoming.line_id.as_deref())
            }
            Self::CallInitiate(initiate) => {
                require("to", &initiate.to)?;
                require_opt("lineId", initiate.line_id.as_deref())
            }
            Self::CallState(report) if report.status.is_terminal() => Err(
                TypesError::InvalidData("call:state cannot report ended; use call:end".into()),
            ),
            Self::CallSignal(relay) if relay.signal.is_null() => {
                Err(TypesError::InvalidData("call:signal requires a payload".into()))
            }
            Self::MessageNew(payload) | Self::NotificationNew(payload) if payload.is_empty() => {
                Err(TypesError::InvalidData(format!(
                    "{} requires a non-empty payload",
                    self.name()
                )))
            }
            Self::SmsSend(send) => {
                require("requestId", &send.request_id)?;
                require("to", &send.to)?;
                require_opt("lineId", send.line_id.as_deref())
            }
            Self::SmsResult(result) => require("requestId", &result.request_id),
            _ => Ok(()),
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), TypesError> {
    if value.trim().is_empty() {
        Err(TypesError::InvalidData(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

fn require_opt(field: &str, value: Option<&str>) -> Result<(), TypesError> {
    value.map_or(Ok(()), |v| require(field, v))
}

/// `call:incoming` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    /// Id chosen by the primary. The relay assigns one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    /// Remote party address (phone number or SIP URI).
    pub from: String,
    /// Line/SIM the call arrived on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_id: Option<String>,
}

/// `call:initiate` payload from a mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCall {
    /// Address to dial.
    pub to: String,
    /// Line/SIM to dial from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_id: Option<String>,
    /// Primary device to place the call. Resolved from the online primaries when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

/// Payload naming a call only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRef {
    /// Target call.
    pub call_id: CallId,
}

/// `call:state` payload from the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateReport {
    /// Target call.
    pub call_id: CallId,
    /// Status observed by the primary's telephony stack.
    pub status: CallStatus,
}

/// `call:signal` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRelay {
    /// Target call.
    pub call_id: CallId,
    /// Offer, answer or candidate; never inspected by the relay.
    pub signal: Value,
}

/// `sms:send` payload, relayed verbatim to the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsSend {
    /// Client correlation id, echoed in the result.
    pub request_id: String,
    /// Recipient address.
    pub to: String,
    /// Message body.
    pub body: String,
    /// Line/SIM to send from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_id: Option<String>,
    /// Primary device to send from. Resolved from the online primaries when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

/// `sms:result` payload, relayed verbatim to the user's endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsResult {
    /// Correlation id from the originating `sms:send`.
    pub request_id: String,
    /// Whether the primary handed the message to the carrier.
    pub ok: bool,
    /// Failure reason when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `ack` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckReceipt {
    /// Receipt for this emission.
    pub ack_id: AckId,
}

/// Events the relay sends to endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Sent once after registration.
    #[serde(rename = "hello")]
    Hello(HelloNotice),
    /// A ringing incoming call, enriched with line metadata.
    #[serde(rename = "call:incoming")]
    CallIncoming(CallIncomingNotice),
    /// Instructs the primary to dial.
    #[serde(rename = "call:initiate")]
    CallInitiate(CallInitiateNotice),
    /// Instructs the primary to pick up.
    #[serde(rename = "call:accept")]
    CallAccept(CallRef),
    /// Instructs the primary to decline.
    #[serde(rename = "call:reject")]
    CallReject(CallRef),
    /// Signaling from the other party.
    #[serde(rename = "call:signal")]
    CallSignal(CallSignalNotice),
    /// The other party hung up.
    #[serde(rename = "call:end")]
    CallEnd(CallEndNotice),
    /// Self-describing call state.
    #[serde(rename = "call:status")]
    CallStatus(CallStatusNotice),
    /// SMS send request for the primary.
    #[serde(rename = "sms:send")]
    SmsSend(SmsSend),
    /// SMS send outcome for the user's endpoints.
    #[serde(rename = "sms:result")]
    SmsResult(SmsResult),
    /// Answer to `ping`.
    #[serde(rename = "pong")]
    Pong,
}

impl ServerEvent {
    /// Event name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::CallIncoming(_) => "call:incoming",
            Self::CallInitiate(_) => "call:initiate",
            Self::CallAccept(_) => "call:accept",
            Self::CallReject(_) => "call:reject",
            Self::CallSignal(_) => "call:signal",
            Self::CallEnd(_) => "call:end",
            Self::CallStatus(_) => "call:status",
            Self::SmsSend(_) => "sms:send",
            Self::SmsResult(_) => "sms:result",
            Self::Pong => "pong",
        }
    }
}

/// `hello` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloNotice {
    /// Id the relay assigned to this connection.
    pub connection_id: ConnectionId,
    /// Identity the credential resolved to.
    pub identity: Identity,
}

/// Display metadata for a telephony line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineInfo {
    /// Line identifier.
    pub line_id: String,
    /// User-facing line name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Display color, e.g. `#1e88e5`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Carrier name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
}

/// Display metadata for a remote party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    /// Contact display name.
    pub name: String,
    /// Address label, e.g. `mobile`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// `call:incoming` outbound payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallIncomingNotice {
    /// Relay-assigned call id.
    pub call_id: CallId,
    /// Remote party address.
    pub from: String,
    /// Line the call arrived on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_id: Option<String>,
    /// Resolved line metadata, absent when the lookup failed or timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<LineInfo>,
    /// Resolved contact metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactInfo>,
    /// Unix milliseconds when the call was created.
    pub started_at: u64,
}

/// `call:initiate` outbound payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInitiateNotice {
    /// Relay-assigned call id.
    pub call_id: CallId,
    /// Address to dial.
    pub to: String,
    /// Line to dial from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_id: Option<String>,
}

/// `call:signal` outbound payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignalNotice {
    /// Target call.
    pub call_id: CallId,
    /// Which side produced the signal.
    pub from: EndpointKind,
    /// Opaque payload.
    pub signal: Value,
}

/// `call:end` outbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEndNotice {
    /// Target call.
    pub call_id: CallId,
    /// Which side ended the call.
    pub by: EndpointKind,
    /// Seconds since the call was created.
    pub duration_secs: u64,
}

/// `call:status` outbound payload. Carries the full state, never a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatusNotice {
    /// Target call.
    pub call_id: CallId,
    /// Current status.
    pub status: CallStatus,
    /// Direction relative to the primary.
    pub direction: CallDirection,
    /// Remote party address.
    pub address: String,
    /// Line in use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_id: Option<String>,
    /// Present on `ended`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    /// Why the call ended, when not a plain hang-up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
