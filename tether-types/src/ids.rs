//! Identity and addressing types for Tether.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::TypesError;

/// Maximum length of a user or device identifier.
const MAX_NAME_LEN: usize = 128;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create a new random identifier (UUID v4).
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Get the inner UUID.
            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl FromStr for $name {
            type Err = TypesError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| TypesError::InvalidData(format!("{}: {e}", stringify!($name))))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

uuid_id! {
    /// Identifies one live transport session. Never reused.
    ConnectionId
}

uuid_id! {
    /// Identifies one call from creation until it ends.
    CallId
}

uuid_id! {
    /// Identifies one at-least-once emission awaiting a receipt.
    AckId
}

macro_rules! name_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Create an identifier, rejecting empty or oversized values and the
            /// `:` and `/` separators used in group names.
            pub fn new(value: impl Into<String>) -> Result<Self, TypesError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(TypesError::InvalidData(format!(
                        "{} must not be empty",
                        stringify!($name)
                    )));
                }
                if value.len() > MAX_NAME_LEN || value.contains([':', '/']) {
                    return Err(TypesError::InvalidData(format!(
                        "malformed {}: {value:?}",
                        stringify!($name)
                    )));
                }
                Ok(Self(value))
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = TypesError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

name_id! {
    /// Owner identity of a connection, issued by the identity verifier.
    UserId
}

name_id! {
    /// Telephony-owning device identity. Only primary endpoints carry one.
    DeviceId
}

/// A logical delivery address, resolved to live connections at emission time.
///
/// Rendered as `user:{user}`, `device:{user}/{device}` or `mirror:{user}`.
/// Device groups are scoped by owner, so two users naming their phones alike
/// never share a group.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Group {
    /// Every connection owned by a user.
    User(UserId),
    /// Every connection of one telephony device, scoped by its owner.
    Device(UserId, DeviceId),
    /// Every mirror connection owned by a user.
    Mirrors(UserId),
}

impl Group {
    /// The user group for `user_id`.
    pub fn user(user_id: &UserId) -> Self {
        Self::User(user_id.clone())
    }

    /// The device group for `device_id` owned by `user_id`.
    pub fn device(user_id: &UserId, device_id: &DeviceId) -> Self {
        Self::Device(user_id.clone(), device_id.clone())
    }

    /// The mirror group for `user_id`.
    pub fn mirrors(user_id: &UserId) -> Self {
        Self::Mirrors(user_id.clone())
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Device(user, device) => write!(f, "device:{user}/{device}"),
            Self::Mirrors(id) => write!(f, "mirror:{id}"),
        }
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Group({self})")
    }
}

impl FromStr for Group {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("user", id)) => Ok(Self::User(UserId::new(id)?)),
            Some(("device", id)) => match id.split_once('/') {
                Some((user, device)) => {
                    Ok(Self::Device(UserId::new(user)?, DeviceId::new(device)?))
                }
                None => Err(TypesError::InvalidGroup(s.to_string())),
            },
            Some(("mirror", id)) => Ok(Self::Mirrors(UserId::new(id)?)),
            _ => Err(TypesError::InvalidGroup(s.to_string())),
        }
    }
}

impl TryFrom<String> for Group {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Group> for String {
    fn from(group: Group) -> Self {
        group.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn call_id_parses_from_display() {
        let id = CallId::new();
        let parsed: CallId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.as_uuid().get_version_num(), 4);
    }

    #[test]
    fn ack_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<AckId>().is_err());
    }

    #[test]
    fn user_id_rejects_empty_and_colon() {
        assert!(UserId::new("").is_err());
        assert!(UserId::new("   ").is_err());
        assert!(UserId::new("user:alice").is_err());
        assert!(UserId::new("alice/pixel").is_err());
        assert!(UserId::new("x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert_eq!(UserId::new("alice").unwrap().as_str(), "alice");
    }

    #[test]
    fn device_id_deserializes_through_validation() {
        let ok: DeviceId = serde_json::from_str("\"pixel-7\"").unwrap();
        assert_eq!(ok.as_str(), "pixel-7");
        assert!(serde_json::from_str::<DeviceId>("\"\"").is_err());
    }

    #[test]
    fn group_display_and_parse() {
        let user = Group::user(&UserId::new("alice").unwrap());
        let device = Group::device(
            &UserId::new("alice").unwrap(),
            &DeviceId::new("pixel-7").unwrap(),
        );
        assert_eq!(user.to_string(), "user:alice");
        assert_eq!(device.to_string(), "device:alice/pixel-7");
        assert_eq!("user:alice".parse::<Group>().unwrap(), user);
        assert_eq!("device:alice/pixel-7".parse::<Group>().unwrap(), device);
        assert_eq!(
            "mirror:alice".parse::<Group>().unwrap(),
            Group::mirrors(&UserId::new("alice").unwrap())
        );
    }

    #[test]
    fn group_rejects_unknown_prefix() {
        assert!(matches!(
            "room:7".parse::<Group>(),
            Err(TypesError::InvalidGroup(_))
        ));
        assert!("alice".parse::<Group>().is_err());
        assert!(matches!(
            "device:pixel-7".parse::<Group>(),
            Err(TypesError::InvalidGroup(_))
        ));
    }

    #[test]
    fn device_groups_differ_by_owner() {
        let pixel = DeviceId::new("pixel").unwrap();
        let alice = Group::device(&UserId::new("alice").unwrap(), &pixel);
        let bob = Group::device(&UserId::new("bob").unwrap(), &pixel);
        assert_ne!(alice, bob);
        assert_ne!(alice.to_string(), bob.to_string());
    }

    #[test]
    fn group_serializes_as_string() {
        let group = Group::user(&UserId::new("bob").unwrap());
        assert_eq!(serde_json::to_string(&group).unwrap(), "\"user:bob\"");
    }
}
