//! One live call and its transition rules.

use tether_types::{
    CallDirection, CallId, CallStatus, CallStatusNotice, ConnectionId, DeviceId, EndpointKind,
    Identity, UserId,
};
use tokio::time::Instant;

/// Why a transition was refused. Always benign: logged and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The call's status does not allow the action.
    #[error("cannot {action} a call that is {status}")]
    InvalidState {
        /// Attempted action.
        action: &'static str,
        /// Current status.
        status: CallStatus,
    },

    /// The action only applies to the other direction.
    #[error("cannot {action} an {direction} call")]
    WrongDirection {
        /// Attempted action.
        action: &'static str,
        /// Call direction.
        direction: CallDirection,
    },
}

/// In-progress call state. Owned by the call engine under a per-call lock.
#[derive(Debug, Clone)]
pub struct ActiveCall {
    /// Call identifier.
    pub call_id: CallId,
    /// User owning the telephony device.
    pub owner_user_id: UserId,
    /// Telephony device handling the call.
    pub owner_device_id: DeviceId,
    /// Connection currently speaking for the primary side.
    pub primary_conn: Option<ConnectionId>,
    /// Connection currently speaking for the mirror side.
    pub mirror_conn: Option<ConnectionId>,
    /// Current status. Never `Ended` while stored.
    pub status: CallStatus,
    /// Direction relative to the primary.
    pub direction: CallDirection,
    /// Remote party.
    pub address: String,
    /// Line in use.
    pub line_id: Option<String>,
    /// Monotonic creation time.
    pub started_at: Instant,
    /// Wall-clock creation time in Unix milliseconds.
    pub started_at_ms: u64,
}

impl ActiveCall {
    /// A ringing call reported by the primary.
    pub fn incoming(
        call_id: CallId,
        owner_user_id: UserId,
        owner_device_id: DeviceId,
        primary_conn: ConnectionId,
        address: String,
        line_id: Option<String>,
    ) -> Self {
        Self {
            call_id,
            owner_user_id,
            owner_device_id,
            primary_conn: Some(primary_conn),
            mirror_conn: None,
            status: CallStatus::Ringing,
            direction: CallDirection::Incoming,
            address,
            line_id,
            started_at: Instant::now(),
            started_at_ms: crate::storage::unix_millis(),
        }
    }

    /// A ringing call requested by a mirror.
    pub fn outgoing(
        owner_user_id: UserId,
        owner_device_id: DeviceId,
        mirror_conn: ConnectionId,
        address: String,
        line_id: Option<String>,
    ) -> Self {
        Self {
            call_id: CallId::new(),
            owner_user_id,
            owner_device_id,
            primary_conn: None,
            mirror_conn: Some(mirror_conn),
            status: CallStatus::Ringing,
            direction: CallDirection::Outgoing,
            address,
            line_id,
            started_at: Instant::now(),
            started_at_ms: crate::storage::unix_millis(),
        }
    }

    /// Which side `identity` plays in this call, if any.
    ///
    /// The primary side is the owning device only; any mirror of the owning
    /// user is the mirror side.
    pub fn side_of(&self, identity: &Identity) -> Option<EndpointKind> {
        if identity.user_id != self.owner_user_id {
            return None;
        }
        match identity.kind {
            EndpointKind::Primary
                if identity.device_id.as_ref() == Some(&self.owner_device_id) =>
            {
                Some(EndpointKind::Primary)
            }
            EndpointKind::Primary => None,
            EndpointKind::Mirror => Some(EndpointKind::Mirror),
        }
    }

    /// Bind `conn` to `side` unless that side is already bound.
    pub fn bind(&mut self, side: EndpointKind, conn: ConnectionId) {
        let slot = match side {
            EndpointKind::Primary => &mut self.primary_conn,
            EndpointKind::Mirror => &mut self.mirror_conn,
        };
        if slot.is_none() {
            *slot = Some(conn);
        }
    }

    /// Which side `conn` is bound to.
    pub fn bound_side(&self, conn: &ConnectionId) -> Option<EndpointKind> {
        if self.primary_conn.as_ref() == Some(conn) {
            Some(EndpointKind::Primary)
        } else if self.mirror_conn.as_ref() == Some(conn) {
            Some(EndpointKind::Mirror)
        } else {
            None
        }
    }

    /// Ringing incoming call picked up by the mirror.
    pub fn accept(&mut self) -> Result<(), TransitionError> {
        if self.status != CallStatus::Ringing {
            return Err(TransitionError::InvalidState {
                action: "accept",
                status: self.status,
            });
        }
        if self.direction != CallDirection::Incoming {
            return Err(TransitionError::WrongDirection {
                action: "accept",
                direction: self.direction,
            });
        }
        self.status = CallStatus::Active;
        Ok(())
    }

    /// Check that the call can still be rejected.
    pub fn check_reject(&self) -> Result<(), TransitionError> {
        if self.status == CallStatus::Ringing {
            Ok(())
        } else {
            Err(TransitionError::InvalidState {
                action: "reject",
                status: self.status,
            })
        }
    }

    /// Apply the primary's own view of the status.
    ///
    /// Forward moves and repeats are accepted; a report can never move the
    /// call backward or end it.
    pub fn apply_report(&mut self, status: CallStatus) -> Result<(), TransitionError> {
        if status.is_terminal() || !self.status.can_advance_to(status) {
            return Err(TransitionError::InvalidState {
                action: "report",
                status: self.status,
            });
        }
        self.status = status;
        Ok(())
    }

    /// Whole seconds since creation.
    pub fn duration_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Self-describing status snapshot.
    pub fn status_notice(&self) -> CallStatusNotice {
        CallStatusNotice {
            call_id: self.call_id,
            status: self.status,
            direction: self.direction,
            address: self.address.clone(),
            line_id: self.line_id.clone(),
            duration_secs: None,
            reason: None,
        }
    }

    /// Final snapshot sent when the call is removed.
    pub fn ended_notice(&self, duration_secs: u64, reason: Option<&str>) -> CallStatusNotice {
        CallStatusNotice {
            status: CallStatus::Ended,
            duration_secs: Some(duration_secs),
            reason: reason.map(str::to_string),
            ..self.status_notice()
        }
    }
}

/// The party opposite `side`.
pub fn other_side(side: EndpointKind) -> EndpointKind {
    match side {
        EndpointKind::Primary => EndpointKind::Mirror,
        EndpointKind::Mirror => EndpointKind::Primary,
    }
}
