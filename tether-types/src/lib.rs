//! # tether-types
//!
//! Wire format types for the Tether relay.
//!
//! This crate provides the types shared by the relay and its endpoints:
//! - [`ConnectionId`], [`CallId`], [`AckId`], [`UserId`], [`DeviceId`], [`Group`] - Identity and addressing
//! - [`Identity`], [`EndpointKind`] - Who is on the other end of a connection
//! - [`CallStatus`], [`CallDirection`], [`CallOutcome`] - Call lifecycle vocabulary
//! - [`Frame`], [`ClientEvent`], [`ServerEvent`] - Events exchanged over the socket
//! - [`TypesError`] - Decode and validation errors

#![warn(missing_docs)]
#![warn(clippy::all)]

mod call;
mod error;
mod events;
mod identity;
mod ids;

pub use call::{CallDirection, CallOutcome, CallStatus};
pub use error::TypesError;
pub use events::{
    AckReceipt, CallEndNotice, CallIncomingNotice, CallInitiateNotice, CallRef, CallSignalNotice,
    CallStatusNotice, ClientEvent, ContactInfo, Frame, HelloNotice, IncomingCall, InitiateCall,
    LineInfo, ServerEvent, SignalRelay, SmsResult, SmsSend, StateReport, EVENT_MESSAGE_NEW,
    EVENT_NOTIFICATION_NEW,
};
pub use identity::{EndpointKind, Identity};
pub use ids::{AckId, CallId, ConnectionId, DeviceId, Group, UserId};
