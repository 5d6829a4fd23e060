//! Line and contact metadata used to enrich incoming calls.

use crate::config::LineEntry;
use async_trait::async_trait;
use std::collections::HashMap;
use tether_types::{ContactInfo, LineInfo, UserId};

/// Lookup failure. Enrichment treats it like a miss.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("directory lookup failed: {0}")]
pub struct DirectoryError(pub String);

/// Source of display metadata for a user's lines and contacts.
#[async_trait]
pub trait LineDirectory: Send + Sync {
    /// Metadata for one of `owner`'s lines.
    async fn lookup_line(
        &self,
        owner: &UserId,
        line_id: &str,
    ) -> Result<Option<LineInfo>, DirectoryError>;

    /// Saved contact matching `address` in `owner`'s address book.
    async fn lookup_contact(
        &self,
        owner: &UserId,
        address: &str,
    ) -> Result<Option<ContactInfo>, DirectoryError>;
}

/// Directory backed by the `[[lines]]` config table. Knows no contacts.
#[derive(Debug, Default, Clone)]
pub struct StaticLineDirectory {
    lines: HashMap<(UserId, String), LineInfo>,
}

impl StaticLineDirectory {
    /// Build from config entries. Later entries win on duplicate keys.
    pub fn from_config(entries: &[LineEntry]) -> Self {
        let lines = entries
            .iter()
            .map(|entry| {
                let info = LineInfo {
                    line_id: entry.line_id.clone(),
                    name: entry.name.clone(),
                    color: entry.color.clone(),
                    carrier: entry.carrier.clone(),
                };
                ((entry.user_id.clone(), entry.line_id.clone()), info)
            })
            .collect();
        Self { lines }
    }

    /// Number of known lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True when no lines are configured.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[async_trait]
impl LineDirectory for StaticLineDirectory {
    async fn lookup_line(
        &self,
        owner: &UserId,
        line_id: &str,
    ) -> Result<Option<LineInfo>, DirectoryError> {
        Ok(self.lines.get(&(owner.clone(), line_id.to_string())).cloned())
    }

    async fn lookup_contact(
        &self,
        _owner: &UserId,
        _address: &str,
    ) -> Result<Option<ContactInfo>, DirectoryError> {
        Ok(None)
    }
}
