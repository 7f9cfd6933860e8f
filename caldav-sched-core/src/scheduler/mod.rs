//! Implicit scheduling for calendar object writes.
//!
//! One [`ImplicitScheduler`] handles one store operation. The resource layer
//! classifies the write first ([`ImplicitScheduler::classify_put`],
//! [`ImplicitScheduler::classify_delete`]) and then either calls
//! [`ImplicitScheduler::run`], or splits the work into
//! [`ImplicitScheduler::plan`], which sends nothing, and
//! [`ImplicitScheduler::dispatch`].

mod attendee;
mod classify;
mod coerce;
mod dispatch;
mod extract;
mod organizer;
mod reconcile;
mod response;
mod significance;
#[cfg(test)]
mod testing;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use metrics::counter;
use serde::Serialize;

use crate::error::{SchedulingError, SchedulingResult};
use crate::ical::{Calendar, Rid};
use crate::metrics::{labels, scheduling as scheduling_metrics};
use crate::services::{Principal, SchedulingServices};

use extract::Extracted;

pub use response::{StampTarget, apply_delivery_report};

/// The acting user's role in the object being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingState {
    /// The owner of the home is the ORGANIZER.
    Organizer,
    /// The owner of the home is a server-managed ATTENDEE.
    Attendee,
    /// There is an ORGANIZER, but the owner is neither it nor an attendee.
    AttendeeMissing,
    /// Not a scheduling object.
    #[default]
    None,
}

impl SchedulingState {
    /// The organizer role wins over the attendee role.
    pub fn from_roles(is_organizer: bool, is_attendee: bool, has_organizer: bool) -> Self {
        if is_organizer {
            SchedulingState::Organizer
        } else if is_attendee {
            SchedulingState::Attendee
        } else if has_organizer {
            SchedulingState::AttendeeMissing
        } else {
            SchedulingState::None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingState::Organizer => "organizer",
            SchedulingState::Attendee => "attendee",
            SchedulingState::AttendeeMissing => "attendee-missing",
            SchedulingState::None => "none",
        }
    }

    pub fn is_scheduling(&self) -> bool {
        !matches!(self, SchedulingState::None)
    }
}

impl fmt::Display for SchedulingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a resource is a plain calendar object or a scheduling object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Calendar,
    Schedule,
}

impl ResourceType {
    pub fn from_flag(is_schedule_object: bool) -> Self {
        if is_schedule_object {
            ResourceType::Schedule
        } else {
            ResourceType::Calendar
        }
    }
}

/// What a write does to a scheduling object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Create,
    Modify,
    Remove,
    #[default]
    None,
}

impl ActionKind {
    /// Transition from the stored type to the written type.
    pub fn from_types(existing: ResourceType, new: ResourceType) -> Self {
        match (existing, new) {
            (ResourceType::Calendar, ResourceType::Schedule) => ActionKind::Create,
            (ResourceType::Calendar, ResourceType::Calendar) => ActionKind::None,
            (ResourceType::Schedule, ResourceType::Schedule) => ActionKind::Modify,
            (ResourceType::Schedule, ResourceType::Calendar) => ActionKind::Remove,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Modify => "modify",
            ActionKind::Remove => "remove",
            ActionKind::None => "none",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcomes that are not errors but need the caller's attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnStatus {
    #[default]
    Ok,
    /// An attendee wrote a cancelled event whose organizer copy is gone.
    OrphanedCancelledEvent,
    /// An attendee wrote an event whose organizer copy is gone or cancelled.
    OrphanedEvent,
}

impl ReturnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnStatus::Ok => "OK",
            ReturnStatus::OrphanedCancelledEvent => "ORPHANED_CANCELLED_EVENT",
            ReturnStatus::OrphanedEvent => "ORPHANED_EVENT",
        }
    }
}

/// iTIP method of a pending message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Request,
    Cancel,
    Reply,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Request => "REQUEST",
            Method::Cancel => "CANCEL",
            Method::Reply => "REPLY",
        }
    }

    /// Organizer messages report back on ATTENDEE, attendee messages on ORGANIZER.
    pub fn stamp_target(&self) -> StampTarget {
        match self {
            Method::Request | Method::Cancel => StampTarget::Attendee,
            Method::Reply => StampTarget::Organizer,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message the scheduler decided to send.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub method: Method,
    pub recipient: String,
    /// Instances the message is about; `None` means the whole series.
    pub rids: Option<BTreeSet<Rid>>,
    pub message: Calendar,
}

/// Kind of message an attendee sent to the organizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyKind {
    Reply,
    Cancel,
}

/// Counters reported back to the resource layer for request logging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogItems {
    /// Organizer messages (CANCEL and REQUEST) sent.
    #[serde(rename = "itip.requests", skip_serializing_if = "Option::is_none")]
    pub requests: Option<usize>,
    /// REQUESTs sent while refreshing attendees.
    #[serde(rename = "itip.refreshes", skip_serializing_if = "Option::is_none")]
    pub refreshes: Option<usize>,
    #[serde(rename = "itip.reply", skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyKind>,
}

/// Transaction-scoped state shared by every scheduler working in one store transaction.
///
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    attendee_refreshes: Arc<AtomicUsize>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attendee refreshes in progress.
    pub fn attendee_refreshes(&self) -> usize {
        self.attendee_refreshes.load(Ordering::SeqCst)
    }

    /// Whether an attendee refresh is in progress; replies processed meanwhile
    /// must not trigger another one.
    pub fn is_refreshing_attendees(&self) -> bool {
        self.attendee_refreshes() > 0
    }

    fn begin_attendee_refresh(&self) -> RefreshGuard {
        self.attendee_refreshes.fetch_add(1, Ordering::SeqCst);
        RefreshGuard {
            counter: Arc::clone(&self.attendee_refreshes),
        }
    }
}

struct RefreshGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A stored calendar object resource.
#[derive(Debug, Clone)]
pub struct StoredResource {
    pub name: String,
    pub calendar: Calendar,
    /// Cached scheduling-object flag; `None` when not known.
    pub schedule_object: Option<bool>,
}

impl StoredResource {
    pub fn new(name: impl Into<String>, calendar: Calendar) -> Self {
        StoredResource {
            name: name.into(),
            calendar,
            schedule_object: None,
        }
    }

    pub fn with_schedule_object(mut self, flag: bool) -> Self {
        self.schedule_object = Some(flag);
        self
    }

    /// The cached flag, or a check of the stored data.
    pub fn is_schedule_object(&self) -> bool {
        self.schedule_object
            .unwrap_or_else(|| self.calendar.is_schedule_object())
    }
}

/// Result of classifying a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    /// Implicit scheduling has work to do for this write.
    pub scheduling: bool,
    /// The written data is a scheduling object.
    pub schedule_object: bool,
}

/// Everything classification learned about the write.
#[derive(Debug, Clone)]
struct Operation {
    action: ActionKind,
    internal_request: bool,
    resource: Option<StoredResource>,
    /// The data scheduling works on: the stored data when removing.
    calendar: Calendar,
    /// What the caller persists when removing (the written data, if any).
    return_calendar: Option<Calendar>,
    data: Extracted,
}

/// What a write will do, computed without sending anything.
#[derive(Debug, Clone)]
pub struct SchedulingPlan {
    pub state: SchedulingState,
    pub action: ActionKind,
    pub status: ReturnStatus,
    /// Data the caller should store; `None` leaves the write as it is.
    pub calendar: Option<Calendar>,
    pub messages: Vec<PendingMessage>,
    /// A send point was reached, so a pre-armed veto applies even without messages.
    pub schedules: bool,
    pub log_items: LogItems,
    originator: String,
    stamp_responses: bool,
    suppress_refresh: bool,
}

impl SchedulingPlan {
    fn for_operation(op: &Operation) -> Self {
        SchedulingPlan {
            state: op.data.state,
            action: op.action,
            status: ReturnStatus::Ok,
            calendar: None,
            messages: Vec::new(),
            schedules: false,
            log_items: LogItems::default(),
            originator: op.data.originator.clone(),
            stamp_responses: false,
            suppress_refresh: false,
        }
    }

    fn nothing() -> Self {
        SchedulingPlan {
            state: SchedulingState::None,
            action: ActionKind::None,
            status: ReturnStatus::Ok,
            calendar: None,
            messages: Vec::new(),
            schedules: false,
            log_items: LogItems::default(),
            originator: String::new(),
            stamp_responses: false,
            suppress_refresh: false,
        }
    }

    pub fn originator(&self) -> &str {
        &self.originator
    }
}

/// Result of a dispatched plan.
#[derive(Debug, Clone)]
pub struct SchedulingOutcome {
    pub status: ReturnStatus,
    /// Data to store, with delivery statuses stamped in.
    pub calendar: Option<Calendar>,
    pub log_items: LogItems,
}

/// Drives implicit scheduling for one store operation.
pub struct ImplicitScheduler {
    services: SchedulingServices,
    home: Principal,
    transaction: Transaction,
    not_allowed: Option<SchedulingError>,
    operation: Option<Operation>,
}

impl ImplicitScheduler {
    /// A scheduler acting for the owner of the calendar home `home`.
    pub fn new(services: SchedulingServices, home: Principal) -> Self {
        ImplicitScheduler {
            services,
            home,
            transaction: Transaction::new(),
            not_allowed: None,
            operation: None,
        }
    }

    pub fn with_transaction(mut self, transaction: Transaction) -> Self {
        self.transaction = transaction;
        self
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// State of the classified write.
    pub fn state(&self) -> SchedulingState {
        self.operation
            .as_ref()
            .map(|op| op.data.state)
            .unwrap_or_default()
    }

    pub fn action(&self) -> ActionKind {
        self.operation
            .as_ref()
            .map(|op| op.action)
            .unwrap_or_default()
    }

    /// Make any later attempt to send fail with `error`.
    pub fn set_scheduling_not_allowed(&mut self, error: SchedulingError) {
        self.not_allowed = Some(error);
    }

    fn test_scheduling_allowed(&self) -> SchedulingResult<()> {
        match &self.not_allowed {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Work out what the classified write requires, without sending anything.
    pub async fn plan(&self, do_smart_merge: bool) -> SchedulingResult<SchedulingPlan> {
        let Some(operation) = &self.operation else {
            return Ok(SchedulingPlan::nothing());
        };
        let op = operation.clone();

        counter!(
            scheduling_metrics::OPERATIONS_TOTAL,
            labels::STATE => op.data.state.as_str(),
            labels::ACTION => op.action.as_str()
        )
        .increment(1);

        let plan = match op.data.state {
            SchedulingState::Organizer => self.plan_organizer(op, do_smart_merge),
            SchedulingState::Attendee => self.plan_attendee(op, do_smart_merge).await,
            SchedulingState::AttendeeMissing => self.plan_missing_attendee(op),
            SchedulingState::None => Ok(SchedulingPlan::for_operation(&op)),
        };
        plan.map_err(record_rejection)
    }

    /// Plan and send.
    pub async fn run(&self, do_smart_merge: bool) -> SchedulingResult<SchedulingOutcome> {
        let plan = self.plan(do_smart_merge).await?;
        self.dispatch(plan).await
    }
}

/// Count a precondition failure before handing it back.
fn record_rejection(error: SchedulingError) -> SchedulingError {
    if let Some(condition) = error.condition() {
        counter!(
            scheduling_metrics::REJECTIONS_TOTAL,
            labels::CONDITION => condition.as_str()
        )
        .increment(1);
    }
    error
}
