//! Metric name and label definitions.
//!
//! Counters are emitted through the `metrics` facade; nothing is recorded
//! unless the embedding application installs a recorder.

/// iTIP message metrics
pub mod itip {
    /// REQUEST messages sent by organizers
    pub const REQUESTS_TOTAL: &str = "caldav_sched_itip_requests_total";
    /// REQUEST messages sent to refresh attendees after a reply
    pub const REFRESHES_TOTAL: &str = "caldav_sched_itip_refreshes_total";
    /// REPLY messages sent by attendees
    pub const REPLIES_TOTAL: &str = "caldav_sched_itip_replies_total";
    /// CANCEL messages sent by organizers
    pub const CANCELS_TOTAL: &str = "caldav_sched_itip_cancels_total";
}

/// Scheduling decision metrics
pub mod scheduling {
    /// Scheduling operations planned (labels: state, action)
    pub const OPERATIONS_TOTAL: &str = "caldav_sched_operations_total";
    /// Writes rejected by a precondition (labels: condition)
    pub const REJECTIONS_TOTAL: &str = "caldav_sched_rejections_total";
}

/// Common label keys
pub mod labels {
    pub const STATE: &str = "state";
    pub const ACTION: &str = "action";
    pub const CONDITION: &str = "condition";
}
