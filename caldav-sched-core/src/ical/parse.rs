//! ICS parsing using the icalendar crate's parser.

use icalendar::parser::{self, read_calendar, unfold};

use crate::error::{SchedulingError, SchedulingResult};
use crate::ical::{Calendar, Component, Property};

/// Parse ICS text into a [`Calendar`], keeping every property and parameter.
///
/// Values are kept as raw (escaped) text so that data written back out is
/// byte-for-byte what the client sent for properties we never touch.
pub fn parse_calendar(content: &str) -> SchedulingResult<Calendar> {
    let unfolded = unfold(content);
    let parsed = read_calendar(&unfolded).map_err(|e| SchedulingError::Parse(e.to_string()))?;

    let calendar = Calendar {
        properties: parsed.properties.iter().map(convert_property).collect(),
        components: parsed.components.iter().map(convert_component).collect(),
    };

    if calendar.main_type().is_none() {
        return Err(SchedulingError::Parse(
            "No VEVENT or VTODO component in calendar data".to_string(),
        ));
    }

    Ok(calendar)
}

fn convert_component(component: &parser::Component<'_>) -> Component {
    Component {
        name: component.name.as_ref().to_ascii_uppercase(),
        properties: component.properties.iter().map(convert_property).collect(),
        components: component.components.iter().map(convert_component).collect(),
    }
}

fn convert_property(prop: &parser::Property<'_>) -> Property {
    let mut converted = Property::new(prop.name.as_ref(), prop.val.to_string());
    for param in &prop.params {
        let value = param
            .val
            .as_ref()
            .map(|v| v.as_ref().trim_matches('"').to_string())
            .unwrap_or_default();
        converted
            .params
            .push((param.key.as_ref().to_ascii_uppercase(), value));
    }
    converted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ical::RecurrenceId;

    #[test]
    fn test_parse_preserves_scheduling_parameters() {
        let ics = r#"BEGIN:VCALENDAR
VERSION:2.0
PRODID:-//Test//Test//EN
BEGIN:VEVENT
UID:sched-1@example.com
DTSTAMP:20250320T120000Z
DTSTART;TZID=Europe/Berlin:20250320T150000
DTEND;TZID=Europe/Berlin:20250320T160000
SUMMARY:Planning
ORGANIZER;CN=Org;SCHEDULE-AGENT=SERVER:mailto:org@example.com
ATTENDEE;CN="Doe, Jane";PARTSTAT=NEEDS-ACTION;RSVP=TRUE:mailto:jane@example.com
ATTENDEE;SCHEDULE-AGENT=CLIENT:mailto:bob@example.com
X-CUSTOM:kept
BEGIN:VALARM
ACTION:DISPLAY
TRIGGER:-PT15M
END:VALARM
END:VEVENT
END:VCALENDAR"#;

        let cal = parse_calendar(ics).expect("Should parse");
        assert_eq!(cal.property_value("VERSION"), Some("2.0"));
        assert_eq!(cal.main_type(), Some("VEVENT"));

        let master = cal.master().expect("Should have master");
        assert_eq!(master.uid(), Some("sched-1@example.com"));
        assert_eq!(master.components.len(), 1);
        assert_eq!(master.property_value("X-CUSTOM"), Some("kept"));

        let jane = master.attendee("mailto:jane@example.com").unwrap();
        assert_eq!(jane.param("CN"), Some("Doe, Jane"));
        assert_eq!(jane.param("RSVP"), Some("TRUE"));
        assert!(!master.attendee("mailto:bob@example.com").unwrap().is_schedule_agent_server());
        assert!(cal.organizer_schedule_agent_is_server());
    }

    #[test]
    fn test_parse_override_recurrence_id() {
        let ics = r#"BEGIN:VCALENDAR
VERSION:2.0
PRODID:-//Test//Test//EN
BEGIN:VEVENT
UID:weekly@example.com
DTSTART:20250101T090000Z
RRULE:FREQ=WEEKLY
END:VEVENT
BEGIN:VEVENT
UID:weekly@example.com
RECURRENCE-ID:20250108T090000Z
DTSTART:20250108T100000Z
END:VEVENT
END:VCALENDAR"#;

        let cal = parse_calendar(ics).expect("Should parse");
        let rid = RecurrenceId::parse("20250108T090000Z");
        assert!(cal.overridden(&rid).is_some());
        assert_eq!(cal.instances().len(), 2);
    }

    #[test]
    fn test_parse_rejects_calendar_without_events() {
        let ics = "BEGIN:VCALENDAR\nVERSION:2.0\nEND:VCALENDAR";
        assert!(parse_calendar(ics).is_err());
    }
}
