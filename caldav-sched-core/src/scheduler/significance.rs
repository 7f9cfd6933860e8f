//! Deciding whether an organizer's change is worth telling attendees about.

use std::collections::BTreeSet;

use tracing::{debug, error};

use crate::diff::canonical_rrule;
use crate::error::{SchedulingError, SchedulingResult};
use crate::ical::{Calendar, Rid};
use crate::scheduler::extract::same_organizer;
use crate::services::{ChangedProperties, ComponentDiff};

/// Properties whose change moves an instance in time.
const DATE_PROPERTIES: &[&str] = &["DTSTART", "DTEND", "DURATION", "DUE", "RECURRENCE-ID"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OrganizerChange {
    /// Nothing attendees see changed. `reinvites` are attendees flagged
    /// SCHEDULE-FORCE-SEND=REQUEST, who get a REQUEST anyway.
    Insignificant { reinvites: BTreeSet<String> },
    Significant(SignificantChange),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SignificantChange {
    pub rids: BTreeSet<Rid>,
    /// Instances that moved; their attendees must answer again.
    pub date_changed_rids: BTreeSet<Rid>,
    /// The recurrence pattern changed, so old and new instances no longer line up.
    pub recurrence_reschedule: bool,
}

/// Compare the stored and written organizer copies.
///
/// With `smart_merge`, `new` picks up attendee replies processed since the
/// client last read the data.
pub(crate) fn organizer_change(
    diff: &dyn ComponentDiff,
    old: &Calendar,
    new: &mut Calendar,
    smart_merge: bool,
) -> SchedulingResult<OrganizerChange> {
    if !diff.organizer_diff(old, new, smart_merge) {
        return Ok(OrganizerChange::Insignificant {
            reinvites: reinvites(new),
        });
    }

    let diffs = diff.what_is_different(old, new);
    if only_recurrence_bounds_changed(&diffs, old, new) {
        debug!(uid = ?new.resource_uid(), "Only COUNT/UNTIL of the RRULE changed");
        return Ok(OrganizerChange::Insignificant {
            reinvites: reinvites(new),
        });
    }

    let mut rids = BTreeSet::new();
    let mut date_changed_rids = BTreeSet::new();
    let mut recurrence_reschedule = false;
    let mut organizer_touched = false;

    for (rid, props) in &diffs {
        organizer_touched |= props.contains("ORGANIZER");
        rids.insert(rid.clone());

        if DATE_PROPERTIES.iter().any(|p| props.contains(*p)) {
            date_changed_rids.insert(rid.clone());
        }

        if rid.is_none() {
            let has_rrule = new.master().is_some_and(|m| m.has_property("RRULE"));
            if props.contains("DTSTART") && has_rrule {
                recurrence_reschedule = true;
            } else if props.contains("RRULE") {
                recurrence_reschedule = !rrules_match_ignoring_bounds(old, new);
            }
        }
    }

    if organizer_touched && !same_organizer(old.organizer().as_deref(), new.organizer().as_deref()) {
        error!(uid = ?new.resource_uid(), "Cannot change ORGANIZER");
        return Err(SchedulingError::ValidOrganizerChange);
    }

    Ok(OrganizerChange::Significant(SignificantChange {
        rids,
        date_changed_rids,
        recurrence_reschedule,
    }))
}

/// Attendees marked SCHEDULE-FORCE-SEND=REQUEST.
fn reinvites(calendar: &Calendar) -> BTreeSet<String> {
    calendar
        .all_attendee_properties()
        .filter(|a| a.param_upper("SCHEDULE-FORCE-SEND", "") == "REQUEST")
        .map(|a| a.value.clone())
        .collect()
}

/// Both masters have an RRULE and they only differ in COUNT or UNTIL.
fn rrules_match_ignoring_bounds(old: &Calendar, new: &Calendar) -> bool {
    let rrule = |calendar: &Calendar| {
        calendar
            .master()
            .and_then(|m| m.property_value("RRULE"))
            .map(|r| canonical_rrule(r, true))
    };
    match (rrule(old), rrule(new)) {
        (Some(old), Some(new)) => old == new,
        _ => false,
    }
}

/// A truncated or extended series with nothing else changed.
fn only_recurrence_bounds_changed(diffs: &ChangedProperties, old: &Calendar, new: &Calendar) -> bool {
    let master_only_rrule = diffs.len() == 1
        && diffs
            .get(&None)
            .is_some_and(|props| props.len() == 1 && props.contains("RRULE"));
    master_only_rrule && rrules_match_ignoring_bounds(old, new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::IcalDiff;
    use crate::ical::{RecurrenceId, parse_calendar};

    fn calendar(master: &str) -> Calendar {
        parse_calendar(&format!(
            "BEGIN:VCALENDAR\nVERSION:2.0\nPRODID:-//Test//Test//EN\n\
BEGIN:VEVENT\nUID:sig-1\nSUMMARY:Planning\nORGANIZER:mailto:organizer@example.com\n\
ATTENDEE;PARTSTAT=ACCEPTED:mailto:organizer@example.com\nATTENDEE:mailto:a1@example.com\n\
{master}END:VEVENT\nEND:VCALENDAR\n"
        ))
        .expect("Should parse")
    }

    const WEEKLY_10: &str = "DTSTART:20250106T100000Z\nDTEND:20250106T110000Z\nRRULE:FREQ=WEEKLY;COUNT=10\n";

    fn significant(old: &Calendar, new: &mut Calendar) -> SignificantChange {
        match organizer_change(&IcalDiff, old, new, false).unwrap() {
            OrganizerChange::Significant(change) => change,
            other => panic!("expected a significant change, got {other:?}"),
        }
    }

    #[test]
    fn test_identical_data_is_insignificant() {
        let old = calendar(WEEKLY_10);
        let mut new = old.clone();
        assert_eq!(
            organizer_change(&IcalDiff, &old, &mut new, false).unwrap(),
            OrganizerChange::Insignificant {
                reinvites: BTreeSet::new()
            }
        );
    }

    #[test]
    fn test_force_send_is_a_reinvite() {
        let old = calendar(WEEKLY_10);
        let mut new = calendar(&format!("{WEEKLY_10}ATTENDEE;SCHEDULE-FORCE-SEND=REQUEST:mailto:a2@example.com\n"));
        // adding a2 is a real change
        assert!(matches!(
            organizer_change(&IcalDiff, &old, &mut new, false).unwrap(),
            OrganizerChange::Significant(_)
        ));

        let old = calendar(&format!("{WEEKLY_10}ATTENDEE:mailto:a2@example.com\n"));
        let mut new = calendar(&format!("{WEEKLY_10}ATTENDEE;SCHEDULE-FORCE-SEND=REQUEST:mailto:a2@example.com\n"));
        assert_eq!(
            organizer_change(&IcalDiff, &old, &mut new, false).unwrap(),
            OrganizerChange::Insignificant {
                reinvites: BTreeSet::from(["mailto:a2@example.com".to_string()])
            }
        );
    }

    #[test]
    fn test_count_change_alone_is_insignificant() {
        let old = calendar(WEEKLY_10);
        let mut new = calendar(&WEEKLY_10.replace("COUNT=10", "COUNT=20"));
        assert!(matches!(
            organizer_change(&IcalDiff, &old, &mut new, false).unwrap(),
            OrganizerChange::Insignificant { .. }
        ));

        let mut new = calendar(&WEEKLY_10.replace("COUNT=10", "UNTIL=20250301T000000Z"));
        assert!(matches!(
            organizer_change(&IcalDiff, &old, &mut new, false).unwrap(),
            OrganizerChange::Insignificant { .. }
        ));
    }

    #[test]
    fn test_count_change_with_other_change_is_not_a_reschedule() {
        let old = calendar(WEEKLY_10);
        let mut new = calendar(&format!("{}LOCATION:Room 2\n", WEEKLY_10.replace("COUNT=10", "COUNT=20")));
        let change = significant(&old, &mut new);

        assert!(!change.recurrence_reschedule);
        assert_eq!(change.rids, BTreeSet::from([None]));
        assert!(change.date_changed_rids.is_empty());
    }

    #[test]
    fn test_pattern_change_is_a_reschedule() {
        let old = calendar(WEEKLY_10);
        let mut new = calendar(&WEEKLY_10.replace("FREQ=WEEKLY", "FREQ=DAILY"));
        assert!(significant(&old, &mut new).recurrence_reschedule);
    }

    #[test]
    fn test_master_start_change_is_a_reschedule() {
        let old = calendar(WEEKLY_10);
        let mut new = calendar(
            &WEEKLY_10
                .replace("DTSTART:20250106T100000Z", "DTSTART:20250106T120000Z")
                .replace("DTEND:20250106T110000Z", "DTEND:20250106T130000Z"),
        );
        let change = significant(&old, &mut new);
        assert!(change.recurrence_reschedule);
        assert_eq!(change.date_changed_rids, BTreeSet::from([None]));
    }

    #[test]
    fn test_moved_override_is_date_changed_only() {
        let old = calendar(WEEKLY_10);
        let mut new = old.clone();
        let mut moved = new.derive_instance(&RecurrenceId::parse("20250113T100000Z").unwrap()).unwrap();
        moved.replace_property(crate::ical::Property::new("DTSTART", "20250113T150000Z"));
        moved.replace_property(crate::ical::Property::new("DTEND", "20250113T160000Z"));
        new.add_component(moved);

        let change = significant(&old, &mut new);
        assert!(!change.recurrence_reschedule);
        assert_eq!(
            change.date_changed_rids,
            BTreeSet::from([RecurrenceId::parse("20250113T100000Z")])
        );
    }

    #[test]
    fn test_organizer_value_change_rejected() {
        let old = calendar(WEEKLY_10);
        let mut new = parse_calendar(
            &old.to_string()
                .replace("ORGANIZER:mailto:organizer@example.com", "ORGANIZER:urn:uuid:organizer"),
        )
        .unwrap();
        let err = organizer_change(&IcalDiff, &old, &mut new, false).unwrap_err();
        assert!(matches!(err, SchedulingError::ValidOrganizerChange));
    }
}
