//! Error types for the implicit scheduling engine.

use std::fmt;

use thiserror::Error;

use crate::services::ServiceError;

/// CalDAV precondition names surfaced to the resource layer.
///
/// Callers map these onto protocol-level error responses (a 403 with the
/// matching `CALDAV:` precondition element).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    SingleOrganizer,
    ValidOrganizerChange,
    ValidAttendeeChange,
    UniqueSchedulingObjectResource,
    OrganizerAllowed,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::SingleOrganizer => "single-organizer",
            Condition::ValidOrganizerChange => "valid-organizer-change",
            Condition::ValidAttendeeChange => "valid-attendee-change",
            Condition::UniqueSchedulingObjectResource => "unique-scheduling-object-resource",
            Condition::OrganizerAllowed => "organizer-allowed",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that abort a scheduling operation.
#[derive(Error, Debug, Clone)]
pub enum SchedulingError {
    #[error("Only one organizer allowed in scheduling object resource")]
    SingleOrganizer,

    #[error("Organizer cannot be changed")]
    ValidOrganizerChange,

    #[error("{0}")]
    ValidAttendeeChange(String),

    #[error("Cannot duplicate scheduling object resource")]
    UniqueSchedulingObjectResource,

    #[error("{0}")]
    OrganizerAllowed(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid calendar data: {0}")]
    InvalidData(String),

    #[error("ICS parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SchedulingError {
    pub fn attendee_change(msg: impl Into<String>) -> Self {
        SchedulingError::ValidAttendeeChange(msg.into())
    }

    pub fn organizer_allowed(msg: impl Into<String>) -> Self {
        SchedulingError::OrganizerAllowed(msg.into())
    }

    /// The CalDAV precondition violated, if this error is a validation failure.
    pub fn condition(&self) -> Option<Condition> {
        match self {
            SchedulingError::SingleOrganizer => Some(Condition::SingleOrganizer),
            SchedulingError::ValidOrganizerChange => Some(Condition::ValidOrganizerChange),
            SchedulingError::ValidAttendeeChange(_) => Some(Condition::ValidAttendeeChange),
            SchedulingError::UniqueSchedulingObjectResource => {
                Some(Condition::UniqueSchedulingObjectResource)
            }
            SchedulingError::OrganizerAllowed(_) => Some(Condition::OrganizerAllowed),
            _ => None,
        }
    }
}

impl From<ServiceError> for SchedulingError {
    fn from(err: ServiceError) -> Self {
        SchedulingError::Store(err.to_string())
    }
}

/// Result type alias for scheduling operations.
pub type SchedulingResult<T> = Result<T, SchedulingError>;
