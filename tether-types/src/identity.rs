//! Connection identity as established at handshake.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{DeviceId, Group, TypesError, UserId};

/// Which side of the bridge an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// Telephony-capable device that owns the line.
    Primary,
    /// Remote display/control endpoint.
    Mirror,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Mirror => f.write_str("mirror"),
        }
    }
}

/// Verified identity of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Owning user.
    pub user_id: UserId,
    /// Endpoint role.
    pub kind: EndpointKind,
    /// Telephony device, present for primary endpoints only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

impl Identity {
    /// Identity of a primary endpoint.
    pub fn primary(user_id: UserId, device_id: DeviceId) -> Self {
        Self {
            user_id,
            kind: EndpointKind::Primary,
            device_id: Some(device_id),
        }
    }

    /// Identity of a mirror endpoint.
    pub fn mirror(user_id: UserId) -> Self {
        Self {
            user_id,
            kind: EndpointKind::Mirror,
            device_id: None,
        }
    }

    /// Check the kind/device pairing.
    ///
    /// Primary endpoints must name their device; mirrors must not.
    pub fn validate(&self) -> Result<(), TypesError> {
        match (self.kind, &self.device_id) {
            (EndpointKind::Primary, None) => Err(TypesError::InvalidData(
                "primary endpoint requires a device id".into(),
            )),
            (EndpointKind::Mirror, Some(_)) => Err(TypesError::InvalidData(
                "mirror endpoint must not carry a device id".into(),
            )),
            _ => Ok(()),
        }
    }

    /// True for the telephony-owning side.
    pub fn is_primary(&self) -> bool {
        self.kind == EndpointKind::Primary
    }

    /// Groups this identity belongs to: always its user group, plus its
    /// device group (primary) or the user's mirror group (mirror).
    pub fn groups(&self) -> Vec<Group> {
        let mut groups = vec![Group::user(&self.user_id)];
        match (&self.kind, &self.device_id) {
            (EndpointKind::Primary, Some(device_id)) => {
                groups.push(Group::device(&self.user_id, device_id))
            }
            (EndpointKind::Mirror, _) => groups.push(Group::mirrors(&self.user_id)),
            (EndpointKind::Primary, None) => {}
        }
        groups
    }
}
