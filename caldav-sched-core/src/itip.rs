//! iTIP (RFC 5546) message construction.

use std::collections::BTreeSet;
use std::fmt;

use crate::ical::{Calendar, Component, Property, Rid, utc_now_stamp};
use crate::services::ItipGenerator;

/// REQUEST-STATUS / SCHEDULE-STATUS values used by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestStatus {
    code: &'static str,
    description: &'static str,
}

impl RequestStatus {
    pub const PENDING: RequestStatus = RequestStatus::new("1.0", "Pending");
    pub const SENT: RequestStatus = RequestStatus::new("1.1", "Sent");
    pub const DELIVERED: RequestStatus = RequestStatus::new("1.2", "Delivered");
    pub const SUCCESS: RequestStatus = RequestStatus::new("2.0", "Success");
    pub const INVALID_CALENDAR_USER: RequestStatus =
        RequestStatus::new("3.7", "Invalid Calendar User");
    pub const NO_AUTHORITY: RequestStatus = RequestStatus::new("3.8", "No authority");
    pub const BAD_REQUEST: RequestStatus = RequestStatus::new("5.0", "Service cannot handle request");
    pub const SERVICE_UNAVAILABLE: RequestStatus = RequestStatus::new("5.1", "Service unavailable");
    pub const INVALID_SERVICE: RequestStatus = RequestStatus::new("5.2", "Invalid calendar service");
    pub const NO_USER_SUPPORT: RequestStatus =
        RequestStatus::new("5.3", "No scheduling support for user");

    const fn new(code: &'static str, description: &'static str) -> Self {
        RequestStatus { code, description }
    }

    /// The numeric code stamped into SCHEDULE-STATUS.
    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    /// The code part of a `code;description` status string.
    pub fn code_of(status: &str) -> &str {
        status.split(';').next().unwrap_or(status).trim()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.code, self.description)
    }
}

/// Parameters that must never leave the server in a scheduling message.
const SCHEDULING_PARAMETERS: &[&str] = &["SCHEDULE-AGENT", "SCHEDULE-STATUS", "SCHEDULE-FORCE-SEND"];

const ATTENDEE_COMMENT: &str = "X-CALENDARSERVER-PRIVATE-COMMENT";

/// Properties copied from the cancelled component into a CANCEL.
const CANCEL_PROPERTIES: &[&str] = &["SUMMARY", "DTSTART", "DTEND", "DURATION", "DUE"];

/// Recurrence properties a whole-series CANCEL carries.
const CANCEL_MASTER_PROPERTIES: &[&str] = &["RRULE", "RDATE", "EXDATE"];

/// The only properties kept in a REPLY.
const REPLY_PROPERTIES: &[&str] = &[
    "UID",
    "RECURRENCE-ID",
    "SEQUENCE",
    "STATUS",
    "DTSTAMP",
    "DTSTART",
    "DTEND",
    "DURATION",
    "RRULE",
    "RDATE",
    "EXDATE",
    "ORGANIZER",
    "ATTENDEE",
    ATTENDEE_COMMENT,
];

/// Default [`ItipGenerator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ItipBuilder;

impl ItipBuilder {
    fn new_message(method: &str) -> Calendar {
        let mut itip = Calendar::new();
        itip.replace_property(Property::new("METHOD", method));
        itip
    }

    fn cancel_component(
        original: &Calendar,
        component: &Component,
        rid: &Rid,
        attendees: &[String],
        full_cancel: bool,
    ) -> Component {
        let mut cancel = Component::new(&component.name);
        cancel.add_property(Property::new("DTSTAMP", utc_now_stamp()));
        if let Some(uid) = component.property("UID") {
            cancel.add_property(uid.clone());
        }
        cancel.add_property(Property::new(
            "SEQUENCE",
            (component.sequence() + 1).to_string(),
        ));
        if let Some(organizer) = component.organizer_property() {
            cancel.add_property(organizer.clone());
        }
        if let Some(r) = rid {
            let recurrence_id = component
                .property("RECURRENCE-ID")
                .cloned()
                .unwrap_or_else(|| r.to_instance_time().to_property("RECURRENCE-ID"));
            cancel.add_property(recurrence_id);
        }

        let copied: Vec<&str> = match rid {
            None => CANCEL_PROPERTIES
                .iter()
                .chain(CANCEL_MASTER_PROPERTIES)
                .copied()
                .collect(),
            Some(_) => CANCEL_PROPERTIES.to_vec(),
        };
        for prop in component
            .properties
            .iter()
            .filter(|p| copied.contains(&p.name.as_str()))
        {
            cancel.add_property(prop.clone());
        }

        for attendee in attendees {
            let prop = if full_cancel {
                original.attendee_properties_for(attendee).next()
            } else {
                component.attendee(attendee)
            };
            if let Some(prop) = prop {
                cancel.add_property(prop.clone());
            }
        }

        cancel
    }

    /// Strip server-private data from an outgoing message.
    pub fn prepare_scheduling_message(itip: &mut Calendar, reply: bool) {
        itip.remove_alarms();
        let keep: &[&str] = if reply { &[ATTENDEE_COMMENT] } else { &[] };
        itip.remove_x_properties(keep, true);
        itip.remove_property_parameters("ATTENDEE", SCHEDULING_PARAMETERS);
        itip.remove_property_parameters("ORGANIZER", SCHEDULING_PARAMETERS);
    }
}

impl ItipGenerator for ItipBuilder {
    fn generate_cancel(
        &self,
        original: &Calendar,
        attendees: &[String],
        rids: Option<&BTreeSet<Rid>>,
        full_cancel: bool,
    ) -> Option<Calendar> {
        let mut itip = Self::new_message("CANCEL");
        let instances: Vec<Rid> = match rids {
            Some(rids) => rids.iter().cloned().collect(),
            None => vec![None],
        };

        for rid in &instances {
            let component = match (original.overridden(rid), rid) {
                (Some(component), _) => component.clone(),
                (None, Some(r)) => match original.derive_instance(r) {
                    Some(derived) => derived,
                    None => continue,
                },
                (None, None) => continue,
            };
            itip.add_component(Self::cancel_component(
                original,
                &component,
                rid,
                attendees,
                full_cancel,
            ));
        }

        itip.main_type()?;

        let tzids = itip.timezone_ids();
        let mut components: Vec<Component> = original.timezones_for(&tzids).cloned().collect();
        components.append(&mut itip.components);
        itip.components = components;

        Self::prepare_scheduling_message(&mut itip, false);
        Some(itip)
    }

    fn generate_attendee_request(
        &self,
        original: &Calendar,
        attendees: &[String],
        rids: Option<&BTreeSet<Rid>>,
    ) -> Option<Calendar> {
        let mut itip = original.clone();
        itip.replace_property(Property::new("METHOD", "REQUEST"));
        itip.replace_property_in_all_components(Property::new("DTSTAMP", utc_now_stamp()));

        let views: Vec<&str> = attendees.iter().map(String::as_str).collect();
        itip.attendees_view(&views, true);
        if !itip.filter_components(rids) {
            return None;
        }
        itip.main_type()?;

        Self::prepare_scheduling_message(&mut itip, false);
        Some(itip)
    }

    fn generate_attendee_reply(
        &self,
        original: &Calendar,
        attendee: &str,
        changed_rids: Option<&BTreeSet<Rid>>,
        force_decline: bool,
    ) -> Option<Calendar> {
        let mut itip = original.clone();
        itip.replace_property(Property::new("METHOD", "REPLY"));
        if !itip.filter_components(changed_rids) {
            return None;
        }

        itip.replace_property_in_all_components(Property::new("DTSTAMP", utc_now_stamp()));
        itip.remove_all_but_one_attendee(attendee);
        itip.components.retain(|c| c.name == "VTIMEZONE" || c.attendee(attendee).is_some());
        itip.main_type()?;

        itip.remove_alarms();
        itip.filter_properties(REPLY_PROPERTIES);
        if force_decline {
            itip.set_parameter_for_property_with_value("PARTSTAT", "DECLINED", "ATTENDEE", Some(attendee));
        }
        itip.add_property_to_all_components(Property::new(
            "REQUEST-STATUS",
            RequestStatus::SUCCESS.to_string(),
        ));

        Self::prepare_scheduling_message(&mut itip, true);
        Some(itip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ical::{RecurrenceId, parse_calendar};

    const EVENT: &str = r#"BEGIN:VCALENDAR
VERSION:2.0
PRODID:-//Test//Test//EN
BEGIN:VTIMEZONE
TZID:Europe/Berlin
END:VTIMEZONE
BEGIN:VEVENT
UID:itip-1
DTSTART;TZID=Europe/Berlin:20250106T100000
DTEND;TZID=Europe/Berlin:20250106T110000
RRULE:FREQ=WEEKLY;COUNT=4
SUMMARY:Standup
SEQUENCE:1
ORGANIZER;SCHEDULE-AGENT=SERVER:mailto:org@example.com
ATTENDEE:mailto:org@example.com
ATTENDEE;PARTSTAT=ACCEPTED;SCHEDULE-STATUS=2.0:mailto:a@example.com
ATTENDEE;PARTSTAT=NEEDS-ACTION:mailto:b@example.com
X-PRIVATE:secret
BEGIN:VALARM
ACTION:DISPLAY
TRIGGER:-PT5M
END:VALARM
END:VEVENT
BEGIN:VEVENT
UID:itip-1
RECURRENCE-ID;TZID=Europe/Berlin:20250113T100000
DTSTART;TZID=Europe/Berlin:20250113T120000
DTEND;TZID=Europe/Berlin:20250113T130000
SUMMARY:Standup (moved)
SEQUENCE:1
ORGANIZER:mailto:org@example.com
ATTENDEE:mailto:org@example.com
ATTENDEE;PARTSTAT=ACCEPTED:mailto:a@example.com
END:VEVENT
END:VCALENDAR"#;

    fn event() -> Calendar {
        parse_calendar(EVENT).expect("Should parse")
    }

    #[test]
    fn test_request_status_formatting() {
        assert_eq!(RequestStatus::SUCCESS.to_string(), "2.0;Success");
        assert_eq!(RequestStatus::NO_USER_SUPPORT.code(), "5.3");
        assert_eq!(RequestStatus::code_of("3.7;Invalid Calendar User"), "3.7");
        assert_eq!(RequestStatus::code_of("1.2"), "1.2");
    }

    #[test]
    fn test_whole_series_cancel() {
        let attendees = vec!["mailto:a@example.com".to_string()];
        let cancel = ItipBuilder
            .generate_cancel(&event(), &attendees, None, true)
            .expect("Should build cancel");

        assert_eq!(cancel.property_value("METHOD"), Some("CANCEL"));
        let master = cancel.master().unwrap();
        assert_eq!(master.sequence(), 2);
        assert!(master.has_property("RRULE"));
        assert!(master.attendee("mailto:a@example.com").is_some());
        assert!(master.attendee("mailto:b@example.com").is_none());
        assert!(!master.has_property("X-PRIVATE"));
        assert!(master.components.is_empty());
        assert_eq!(
            cancel.components.first().map(|c| c.name.as_str()),
            Some("VTIMEZONE")
        );
        let attendee = master.attendee("mailto:a@example.com").unwrap();
        assert!(!attendee.has_param("SCHEDULE-STATUS"));
    }

    #[test]
    fn test_instance_cancel_uses_derived_instance() {
        let rid = RecurrenceId::parse("20250120T090000Z");
        let rids = BTreeSet::from([rid.clone()]);
        let attendees = vec!["mailto:b@example.com".to_string()];

        let cancel = ItipBuilder
            .generate_cancel(&event(), &attendees, Some(&rids), false)
            .expect("Should build cancel");
        let component = cancel.overridden(&rid).expect("Should have instance");
        assert!(!component.has_property("RRULE"));
        assert!(component.attendee("mailto:b@example.com").is_some());
    }

    #[test]
    fn test_request_is_attendee_view() {
        let attendees = vec!["mailto:b@example.com".to_string()];
        let request = ItipBuilder
            .generate_attendee_request(&event(), &attendees, None)
            .expect("Should build request");

        assert_eq!(request.property_value("METHOD"), Some("REQUEST"));
        // b is not in the override, so it is excluded from b's view
        assert_eq!(request.main_components().count(), 1);
        assert_eq!(request.master().unwrap().exdates().len(), 1);
        assert!(!request.organizer_property().unwrap().has_param("SCHEDULE-AGENT"));
    }

    #[test]
    fn test_request_for_unrelated_instance_is_none() {
        let attendees = vec!["mailto:b@example.com".to_string()];
        let rids = BTreeSet::from([RecurrenceId::parse("20250113T090000Z")]);
        assert!(ItipBuilder
            .generate_attendee_request(&event(), &attendees, Some(&rids))
            .is_none());
    }

    #[test]
    fn test_reply_keeps_only_replying_attendee() {
        let reply = ItipBuilder
            .generate_attendee_reply(&event(), "mailto:a@example.com", None, true)
            .expect("Should build reply");

        assert_eq!(reply.property_value("METHOD"), Some("REPLY"));
        for component in reply.main_components() {
            assert_eq!(component.attendee_properties().count(), 1);
            assert_eq!(
                component.attendee("mailto:a@example.com").unwrap().partstat(),
                "DECLINED"
            );
            assert!(!component.has_property("SUMMARY"));
            assert_eq!(component.property_value("REQUEST-STATUS"), Some("2.0;Success"));
        }
    }
}
