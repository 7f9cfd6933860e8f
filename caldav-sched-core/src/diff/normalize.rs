//! Reduce components to comparable line sets.

use std::collections::{BTreeMap, BTreeSet};

use crate::address::normalize_address;
use crate::ical::{Calendar, Component, InstanceTime, Property, Rid};

/// Which parts of a component a comparison ignores.
pub(crate) struct View {
    ignored_properties: &'static [&'static str],
    attendee_params: &'static [&'static str],
    organizer_params: &'static [&'static str],
    kept_x_properties: &'static [&'static str],
}

/// What an organizer can change without attendees caring.
pub(crate) const ORGANIZER_VIEW: View = View {
    ignored_properties: &["CREATED", "DTSTAMP", "LAST-MODIFIED"],
    attendee_params: &["RSVP", "SCHEDULE-AGENT", "SCHEDULE-STATUS", "SCHEDULE-FORCE-SEND"],
    organizer_params: &[],
    kept_x_properties: &[],
};

/// The data an attendee's write is checked against: what a REPLY could carry.
pub(crate) const ATTENDEE_VIEW: View = View {
    ignored_properties: &[],
    attendee_params: &["SCHEDULE-AGENT", "SCHEDULE-STATUS", "SCHEDULE-FORCE-SEND"],
    organizer_params: &["SCHEDULE-AGENT", "SCHEDULE-STATUS", "SCHEDULE-FORCE-SEND"],
    kept_x_properties: &["X-CALENDARSERVER-PRIVATE-COMMENT"],
};

/// One normalized content line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Line {
    pub name: String,
    pub text: String,
    /// Address and PARTSTAT for ATTENDEE lines.
    pub attendee: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Normalized {
    pub name: String,
    pub lines: BTreeSet<Line>,
    pub children: BTreeSet<String>,
}

impl View {
    pub fn component(&self, component: &Component) -> Normalized {
        Normalized {
            name: component.name.clone(),
            lines: component
                .properties
                .iter()
                .filter(|p| self.keeps(p))
                .flat_map(|p| self.lines(p))
                .collect(),
            children: component
                .components
                .iter()
                .filter(|c| c.name != "VALARM")
                .map(|c| {
                    let child = self.component(c);
                    let mut text = format!("BEGIN:{}", child.name);
                    for line in &child.lines {
                        text.push('\n');
                        text.push_str(&line.text);
                    }
                    text
                })
                .collect(),
        }
    }

    /// Every scheduling component keyed by recurrence id.
    pub fn calendar(&self, calendar: &Calendar) -> BTreeMap<Rid, Normalized> {
        calendar
            .main_components()
            .map(|c| (c.recurrence_id(), self.component(c)))
            .collect()
    }

    fn keeps(&self, prop: &Property) -> bool {
        if self.ignored_properties.contains(&prop.name.as_str()) {
            return false;
        }
        !prop.is_x_property() || self.kept_x_properties.contains(&prop.name.as_str())
    }

    fn lines(&self, prop: &Property) -> Vec<Line> {
        match prop.name.as_str() {
            "EXDATE" | "RDATE" => InstanceTime::from_property_values(prop)
                .into_iter()
                .map(|t| Line {
                    name: prop.name.clone(),
                    text: format!("{}:{}", prop.name, t.recurrence_id()),
                    attendee: None,
                })
                .collect(),
            "RRULE" => vec![Line {
                name: prop.name.clone(),
                text: format!("RRULE:{}", canonical_rrule(&prop.value, false)),
                attendee: None,
            }],
            _ => vec![self.line(prop)],
        }
    }

    fn line(&self, prop: &Property) -> Line {
        let ignored_params = match prop.name.as_str() {
            "ATTENDEE" => self.attendee_params,
            "ORGANIZER" => self.organizer_params,
            _ => &[],
        };
        let mut params: Vec<(String, String)> = prop
            .params
            .iter()
            .filter(|(k, _)| !ignored_params.contains(&k.as_str()))
            .cloned()
            .collect();
        params.sort();

        let is_address = prop.name == "ATTENDEE" || prop.name == "ORGANIZER";
        let value = if is_address {
            normalize_address(&prop.value)
        } else {
            prop.value.clone()
        };

        let mut text = prop.name.clone();
        for (k, v) in &params {
            text.push_str(&format!(";{k}={v}"));
        }
        text.push(':');
        text.push_str(&value);

        let attendee = (prop.name == "ATTENDEE").then(|| (value.clone(), prop.partstat()));
        Line {
            name: prop.name.clone(),
            text,
            attendee,
        }
    }
}

/// RRULE parts sorted by key, optionally without COUNT and UNTIL.
pub(crate) fn canonical_rrule(rrule: &str, without_bounds: bool) -> String {
    let parts: BTreeMap<String, String> = rrule
        .split(';')
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.trim().to_ascii_uppercase(), v.trim().to_ascii_uppercase()))
        .filter(|(k, _)| !without_bounds || (k != "COUNT" && k != "UNTIL"))
        .collect();
    parts
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_rrule_ignores_order_and_bounds() {
        assert_eq!(
            canonical_rrule("FREQ=WEEKLY;COUNT=10;BYDAY=MO", true),
            canonical_rrule("BYDAY=MO;FREQ=WEEKLY;UNTIL=20250101T000000Z", true)
        );
        assert_ne!(
            canonical_rrule("FREQ=WEEKLY;COUNT=10", false),
            canonical_rrule("FREQ=WEEKLY;COUNT=20", false)
        );
    }

    #[test]
    fn test_organizer_view_ignores_server_parameters() {
        let mut a = Component::new("VEVENT");
        let mut attendee = Property::new("ATTENDEE", "mailto:A@example.com");
        attendee.set_param("RSVP", "TRUE");
        a.add_property(attendee);
        a.add_property(Property::new("DTSTAMP", "20250101T000000Z"));

        let mut b = Component::new("VEVENT");
        let mut attendee = Property::new("ATTENDEE", "mailto:a@example.com");
        attendee.set_param("SCHEDULE-STATUS", "2.0");
        b.add_property(attendee);
        b.add_property(Property::new("DTSTAMP", "20250202T000000Z"));

        assert_eq!(ORGANIZER_VIEW.component(&a), ORGANIZER_VIEW.component(&b));
    }
}
