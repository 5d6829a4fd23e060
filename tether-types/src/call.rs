//! Call lifecycle vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a call as seen by both endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Created, not yet picked up.
    Ringing,
    /// Picked up, media flowing between endpoints.
    Active,
    /// Terminal.
    Ended,
}

impl CallStatus {
    /// Whether moving from `self` to `next` respects ringing → active → ended.
    pub fn can_advance_to(self, next: CallStatus) -> bool {
        matches!(
            (self, next),
            (Self::Ringing, Self::Ringing)
                | (Self::Ringing, Self::Active)
                | (Self::Ringing, Self::Ended)
                | (Self::Active, Self::Active)
                | (Self::Active, Self::Ended)
        )
    }

    /// True once the call can no longer change.
    pub fn is_terminal(self) -> bool {
        self == Self::Ended
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ringing => f.write_str("ringing"),
            Self::Active => f.write_str("active"),
            Self::Ended => f.write_str("ended"),
        }
    }
}

/// Direction of a call relative to the primary endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// The remote party called the primary's line.
    Incoming,
    /// The primary's line called out (requested by a mirror).
    Outgoing,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incoming => f.write_str("incoming"),
            Self::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// How a call left the live set, as handed to call history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    /// Reached active, then ended.
    Completed,
    /// Rejected by the mirror while ringing.
    Rejected,
    /// Ended while still ringing.
    Missed,
    /// A participant's transport closed mid-call.
    Dropped,
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Rejected => f.write_str("rejected"),
            Self::Missed => f.write_str("missed"),
            Self::Dropped => f.write_str("dropped"),
        }
    }
}
