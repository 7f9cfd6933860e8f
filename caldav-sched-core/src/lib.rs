//! Implicit scheduling for CalDAV.
//!
//! When a calendar object resource is written or deleted, this crate works
//! out what the write means for the other participants of the meeting and
//! sends the iTIP messages (REQUEST, CANCEL, REPLY) that keep their copies in
//! sync:
//! - `scheduler` classifies the write and plans and dispatches messages
//! - `ical` is the iCalendar tree the engine reads and rewrites
//! - `services` defines the directory, store, diff, iTIP and transport seams
//!
//! `diff`, `itip`, `directory` and `store` hold the default implementations
//! of those seams.

pub mod address;
pub mod config;
pub mod diff;
pub mod directory;
pub mod error;
pub mod ical;
pub mod itip;
pub mod metrics;
pub mod scheduler;
pub mod services;
pub mod store;

pub use error::{Condition, SchedulingError, SchedulingResult};
pub use scheduler::{
    ActionKind, Classification, ImplicitScheduler, LogItems, Method, PendingMessage, ReturnStatus,
    SchedulingOutcome, SchedulingPlan, SchedulingState, StoredResource, Transaction,
};
pub use services::SchedulingServices;
