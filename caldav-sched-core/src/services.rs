//! Collaborator interfaces consumed by the scheduler.
//!
//! The scheduler never talks to storage, the directory or the network
//! directly. Each concern is a narrow trait so the engine can run against the
//! default in-crate implementations, a real server, or test fakes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::address::{CalendarUser, Hosting, same_address};
use crate::config::SchedulingConfig;
use crate::diff::IcalDiff;
use crate::ical::{Calendar, Rid};
use crate::itip::{ItipBuilder, RequestStatus};

/// Error type returned by service methods.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{message}")]
    Message { message: String },
}

impl ServiceError {
    #[must_use]
    pub fn message(message: impl std::fmt::Display) -> Self {
        Self::Message {
            message: message.to_string(),
        }
    }
}

impl From<String> for ServiceError {
    fn from(value: String) -> Self {
        Self::message(value)
    }
}

impl From<&str> for ServiceError {
    fn from(value: &str) -> Self {
        Self::message(value)
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// ── Directory ───────────────────────────────────────────────────────────────

/// A principal known to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub uid: String,
    pub canonical_address: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled_as_organizer: bool,
    #[serde(default)]
    pub hosting: Hosting,
}

fn default_true() -> bool {
    true
}

impl Principal {
    /// Whether `address` is one of this principal's calendar user addresses.
    pub fn has_address(&self, address: &str) -> bool {
        same_address(&self.canonical_address, address)
            || self.addresses.iter().any(|a| same_address(a, address))
    }
}

/// Principal lookup.
pub trait Directory: Send + Sync {
    fn principal_for_address(&self, address: &str) -> Option<Principal>;
    fn principal_for_uid(&self, uid: &str) -> Option<Principal>;

    fn canonical_address(&self, principal: &Principal) -> String {
        principal.canonical_address.clone()
    }

    /// Resolve an address to a calendar user and its kind.
    fn calendar_user(&self, address: &str) -> CalendarUser {
        CalendarUser::resolve(address, self.principal_for_address(address))
    }
}

// ── Store ───────────────────────────────────────────────────────────────────

/// Read access to calendar homes.
#[async_trait]
pub trait CalendarStore: Send + Sync {
    /// Whether another resource (not `resource_name`) in `home_uid`'s home carries `uid`.
    async fn has_uid_elsewhere(
        &self,
        home_uid: &str,
        uid: &str,
        resource_name: Option<&str>,
    ) -> ServiceResult<bool>;

    /// The organizer's own stored copy of the event `uid`.
    async fn organizer_copy(&self, organizer_uid: &str, uid: &str) -> ServiceResult<Option<Calendar>>;
}

// ── Diff ────────────────────────────────────────────────────────────────────

/// Changed property names per instance (`None` is the master).
pub type ChangedProperties = BTreeMap<Rid, BTreeSet<String>>;

/// Result of merging an attendee's write into the organizer's copy.
#[derive(Debug, Clone)]
pub struct AttendeeMerge {
    /// The attendee only changed what an attendee may change.
    pub allowed: bool,
    /// The attendee's participation changed and the organizer needs a REPLY.
    pub reply_needed: bool,
    /// Instances the attendee changed; `None` means the whole series.
    pub changed_rids: Option<BTreeSet<Rid>>,
    /// Instances the attendee removed from their copy.
    pub removed_rids: BTreeSet<Rid>,
    /// The data to store.
    pub merged: Calendar,
}

/// Per-property comparison of two versions of a calendar object.
pub trait ComponentDiff: Send + Sync {
    /// Whether an organizer's write changed anything attendees care about.
    ///
    /// With `smart_merge`, `new` may be rewritten to carry attendee state the
    /// client had not yet seen.
    fn organizer_diff(&self, old: &Calendar, new: &mut Calendar, smart_merge: bool) -> bool;

    fn what_is_different(&self, old: &Calendar, new: &Calendar) -> ChangedProperties;

    /// Check `attendee`'s write (`new`) against their current copy (`old`).
    ///
    /// With `smart_merge`, other attendees' state is carried over from `old`.
    fn attendee_merge(
        &self,
        old: &Calendar,
        new: &Calendar,
        attendee: &str,
        smart_merge: bool,
    ) -> AttendeeMerge;
}

// ── iTIP ────────────────────────────────────────────────────────────────────

/// Builds iTIP messages. `None` means there is nothing to send.
pub trait ItipGenerator: Send + Sync {
    fn generate_cancel(
        &self,
        original: &Calendar,
        attendees: &[String],
        rids: Option<&BTreeSet<Rid>>,
        full_cancel: bool,
    ) -> Option<Calendar>;

    fn generate_attendee_request(
        &self,
        original: &Calendar,
        attendees: &[String],
        rids: Option<&BTreeSet<Rid>>,
    ) -> Option<Calendar>;

    fn generate_attendee_reply(
        &self,
        original: &Calendar,
        attendee: &str,
        changed_rids: Option<&BTreeSet<Rid>>,
        force_decline: bool,
    ) -> Option<Calendar>;
}

// ── Transport ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryOptions {
    pub internal_request: bool,
    /// Recipients should not trigger refreshes of other attendees.
    pub suppress_refresh: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientStatus {
    pub recipient: String,
    /// A REQUEST-STATUS string such as `2.0;Success`.
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub responses: Vec<RecipientStatus>,
}

impl DeliveryReport {
    pub fn uniform(recipients: &[String], status: &str) -> Self {
        DeliveryReport {
            responses: recipients
                .iter()
                .map(|r| RecipientStatus {
                    recipient: r.clone(),
                    status: status.to_string(),
                })
                .collect(),
        }
    }
}

/// Delivers an iTIP message.
///
/// Delivery never fails as a whole: per-recipient problems are reported as
/// statuses in the report.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(
        &self,
        originator: &str,
        recipients: &[String],
        message: &Calendar,
        options: DeliveryOptions,
    ) -> DeliveryReport;
}

/// Transport that sends nothing and reports every recipient as pending.
pub struct NoopTransport;

#[async_trait]
impl Transport for NoopTransport {
    async fn deliver(
        &self,
        originator: &str,
        recipients: &[String],
        _message: &Calendar,
        _options: DeliveryOptions,
    ) -> DeliveryReport {
        warn!(originator, recipients = recipients.len(), "no transport configured, message not sent");
        DeliveryReport::uniform(recipients, &RequestStatus::PENDING.to_string())
    }
}

// ── Bundle ──────────────────────────────────────────────────────────────────

/// Everything a scheduler needs from the outside world.
#[derive(Clone)]
pub struct SchedulingServices {
    pub directory: Arc<dyn Directory>,
    pub store: Arc<dyn CalendarStore>,
    pub diff: Arc<dyn ComponentDiff>,
    pub itip: Arc<dyn ItipGenerator>,
    pub transport: Arc<dyn Transport>,
    pub config: SchedulingConfig,
}

impl SchedulingServices {
    /// Services using the built-in diff and iTIP generator.
    pub fn new(
        directory: Arc<dyn Directory>,
        store: Arc<dyn CalendarStore>,
        transport: Arc<dyn Transport>,
        config: SchedulingConfig,
    ) -> Self {
        SchedulingServices {
            directory,
            store,
            diff: Arc::new(IcalDiff),
            itip: Arc::new(ItipBuilder),
            transport,
            config,
        }
    }

    pub fn with_diff(mut self, diff: Arc<dyn ComponentDiff>) -> Self {
        self.diff = diff;
        self
    }

    pub fn with_itip(mut self, itip: Arc<dyn ItipGenerator>) -> Self {
        self.itip = itip;
        self
    }
}
