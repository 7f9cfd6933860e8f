//! Recording delivery outcomes on the stored data.

use crate::ical::Calendar;
use crate::itip::RequestStatus;
use crate::services::DeliveryReport;

/// The property a delivery status is recorded on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampTarget {
    /// The organizer sent the message; statuses go on each ATTENDEE.
    Attendee,
    /// An attendee sent the message; the status goes on the ORGANIZER.
    Organizer,
}

impl StampTarget {
    pub fn property_name(&self) -> &'static str {
        match self {
            StampTarget::Attendee => "ATTENDEE",
            StampTarget::Organizer => "ORGANIZER",
        }
    }
}

/// Stamp each recipient's status code as SCHEDULE-STATUS on the matching property.
pub fn apply_delivery_report(calendar: &mut Calendar, report: &DeliveryReport, target: StampTarget) {
    for response in &report.responses {
        calendar.set_parameter_for_property_with_value(
            "SCHEDULE-STATUS",
            RequestStatus::code_of(&response.status),
            target.property_name(),
            Some(&response.recipient),
        );
    }
}
