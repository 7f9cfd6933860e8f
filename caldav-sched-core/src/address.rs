//! Calendar user addresses and what kind of user they resolve to.

use serde::{Deserialize, Serialize};

use crate::services::Principal;

/// Normalize a calendar user address for comparison.
///
/// `mailto:` addresses compare case-insensitively, as do `urn:uuid:` ones.
/// Anything else is only trimmed.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("mailto:") || lower.starts_with("urn:uuid:") {
        lower
    } else {
        trimmed.to_string()
    }
}

pub fn same_address(a: &str, b: &str) -> bool {
    normalize_address(a) == normalize_address(b)
}

/// Whether an address has a usable scheme and a non-empty target.
pub fn is_valid_address(address: &str) -> bool {
    let normalized = normalize_address(address);
    for scheme in ["mailto:", "urn:uuid:", "http:", "https:", "/"] {
        if let Some(rest) = normalized.strip_prefix(scheme) {
            return !rest.is_empty() && (scheme != "mailto:" || rest.contains('@'));
        }
    }
    false
}

/// Where a principal's calendar home lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Hosting {
    #[default]
    Local,
    Partitioned,
    OtherServer,
}

/// What a calendar user address resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarUserKind {
    /// A principal hosted on this server.
    Local,
    /// A principal hosted on another partition of this service.
    Partitioned,
    /// A principal hosted on another pod reachable by cross-server scheduling.
    OtherServer,
    /// A well-formed address with no local principal (delivered via iMIP/iSchedule).
    Remote,
    /// Structurally unusable address.
    Invalid,
}

impl CalendarUserKind {
    pub fn is_local(&self) -> bool {
        matches!(self, CalendarUserKind::Local)
    }

    /// Whether the user is managed by this service, on any partition or pod.
    pub fn is_hosted(&self) -> bool {
        matches!(
            self,
            CalendarUserKind::Local | CalendarUserKind::Partitioned | CalendarUserKind::OtherServer
        )
    }

    pub fn is_partitioned_or_other_server(&self) -> bool {
        matches!(self, CalendarUserKind::Partitioned | CalendarUserKind::OtherServer)
    }
}

impl From<Hosting> for CalendarUserKind {
    fn from(hosting: Hosting) -> Self {
        match hosting {
            Hosting::Local => CalendarUserKind::Local,
            Hosting::Partitioned => CalendarUserKind::Partitioned,
            Hosting::OtherServer => CalendarUserKind::OtherServer,
        }
    }
}

/// A resolved calendar user.
#[derive(Debug, Clone)]
pub struct CalendarUser {
    pub address: String,
    pub kind: CalendarUserKind,
    pub principal: Option<Principal>,
}

impl CalendarUser {
    pub fn resolve(address: &str, principal: Option<Principal>) -> Self {
        let kind = match &principal {
            Some(p) => p.hosting.into(),
            None if is_valid_address(address) => CalendarUserKind::Remote,
            None => CalendarUserKind::Invalid,
        };
        CalendarUser {
            address: address.to_string(),
            kind,
            principal,
        }
    }

    pub fn principal_uid(&self) -> Option<&str> {
        self.principal.as_ref().map(|p| p.uid.as_str())
    }
}
