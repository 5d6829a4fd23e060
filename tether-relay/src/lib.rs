//! # tether-relay
//!
//! Real-time relay between a telephony-owning phone and its mirrors.
//!
//! This crate implements a relay server that:
//! - Accepts authenticated WebSocket connections from primaries and mirrors
//! - Routes events to logical groups (user, device, mirrors)
//! - Redelivers selected events until the receiver acknowledges them
//! - Drives the shared `ringing → active → ended` call state machine
//!
//! ## Architecture
//!
//! ```text
//!  Phone (primary) ──┐                  ┌── Laptop (mirror)
//!                    │    WebSocket     │
//!                    ├─────────────────►│
//!                    │                  │
//!        ┌───────────┴──────────────────┴───────────┐
//!        │               tether-relay               │
//!        │  registry → router → acks → calls        │
//!        │  ┌─────────────────────────────────┐     │
//!        │  │ SQLite (history, undelivered)   │     │
//!        │  └─────────────────────────────────┘     │
//!        └──────────────────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! Every frame is `{"event": <name>, "data": <payload>}`:
//! - `call:*` → call engine (incoming, initiate, accept, reject, state, signal, end)
//! - `message:new`, `notification:new` → mirrors, with `ackId`, until `ack`
//! - `sms:send` → primary, `sms:result` → mirrors
//! - `ping` → `pong`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ack;
pub mod auth;
pub mod call;
pub mod cleanup;
pub mod config;
pub mod directory;
pub mod error;
pub mod http;
pub mod limits;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;

pub use ack::{AckEngine, AckPolicy};
pub use call::{ActiveCall, CallEngine};
pub use config::Config;
pub use error::{AuthError, ProtocolError, RelayError, StorageError};
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use router::Router;
pub use server::{Relay, RelayBuilder};
pub use session::Session;
pub use storage::SqliteStore;
