//! Scheduling data pulled out of the written calendar.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error};

use crate::address::{CalendarUser, same_address};
use crate::error::SchedulingResult;
use crate::ical::{Calendar, InstanceKey, Rid};
use crate::scheduler::SchedulingState;
use crate::services::{Directory, Principal};

#[derive(Debug, Clone, Default)]
pub(crate) struct Extracted {
    /// Canonical address of the home owner.
    pub originator: String,
    pub organizer: Option<String>,
    pub organizer_user: Option<CalendarUser>,
    /// The home owner's ATTENDEE value, when acting as an attendee.
    pub attendee: Option<String>,
    pub attendee_principal: Option<Principal>,
    /// Server-managed attendees per instance.
    pub attendees_by_instance: BTreeSet<InstanceKey>,
    pub instances: BTreeSet<Rid>,
    pub attendees: BTreeSet<String>,
    pub uid: String,
    pub state: SchedulingState,
}

impl Extracted {
    pub fn organizer_principal(&self) -> Option<&Principal> {
        self.organizer_user.as_ref()?.principal.as_ref()
    }
}

/// Collect organizer, attendees and instances from `calendar`.
///
/// Repairs components missing the ORGANIZER, turns local SCHEDULE-AGENT=CLIENT
/// attendees into server-managed ones and drops duplicate attendees.
pub(crate) fn extract_calendar_data(
    directory: &dyn Directory,
    home: &Principal,
    calendar: &mut Calendar,
) -> SchedulingResult<Extracted> {
    let originator = directory.canonical_address(home);

    let organizer = calendar.valid_organizer_for_scheduling().inspect_err(|_| {
        error!(uid = ?calendar.resource_uid(), "Only one ORGANIZER is allowed in an iCalendar object");
    })?;

    coerce_attendee_schedule_agent(directory, calendar);

    calendar.remove_duplicate_attendees();
    let attendees_by_instance = calendar.attendees_by_instance(true);
    let attendees = attendees_by_instance
        .iter()
        .map(|key| key.attendee.clone())
        .collect();

    Ok(Extracted {
        originator,
        organizer,
        attendees_by_instance,
        instances: calendar.instances(),
        attendees,
        uid: calendar.resource_uid().unwrap_or_default().to_string(),
        ..Extracted::default()
    })
}

/// Extract the data and decide what role the home owner plays.
pub(crate) fn check_implicit_state(
    directory: &dyn Directory,
    home: &Principal,
    calendar: &mut Calendar,
) -> SchedulingResult<Extracted> {
    let mut data = extract_calendar_data(directory, home, calendar)?;

    let is_organizer = is_organizer_scheduling(directory, home, &mut data);
    let is_attendee = !is_organizer && is_attendee_scheduling(directory, home, &mut data);
    data.state = SchedulingState::from_roles(is_organizer, is_attendee, data.organizer.is_some());

    debug!(uid = %data.uid, state = %data.state, "Implicit scheduling state");
    Ok(data)
}

/// The ORGANIZER resolves to a principal and that principal owns the home.
fn is_organizer_scheduling(directory: &dyn Directory, home: &Principal, data: &mut Extracted) -> bool {
    let Some(organizer) = &data.organizer else {
        return false;
    };
    let user = directory.calendar_user(organizer);
    let owns_home = user.principal_uid() == Some(home.uid.as_str());
    data.organizer_user = Some(user);
    owns_home
}

/// Some server-managed attendee resolves to the home owner; the first one found is `self`.
fn is_attendee_scheduling(directory: &dyn Directory, home: &Principal, data: &mut Extracted) -> bool {
    if data.organizer.is_none() {
        return false;
    }
    for attendee in &data.attendees {
        if let Some(principal) = directory.principal_for_address(attendee) {
            if principal.uid == home.uid {
                data.attendee = Some(attendee.clone());
                data.attendee_principal = Some(principal);
                return true;
            }
        }
    }
    false
}

/// Hosted users cannot opt out of server scheduling with SCHEDULE-AGENT=CLIENT.
pub(crate) fn coerce_attendee_schedule_agent(directory: &dyn Directory, calendar: &mut Calendar) {
    let mut hosted: BTreeMap<String, bool> = BTreeMap::new();
    for attendee in calendar.all_attendee_properties_mut() {
        if attendee.param_upper("SCHEDULE-AGENT", "SERVER") != "CLIENT" {
            continue;
        }
        let is_hosted = *hosted
            .entry(attendee.value.clone())
            .or_insert_with(|| directory.calendar_user(&attendee.value).kind.is_hosted());
        if is_hosted {
            debug!(attendee = %attendee.value, "Coercing SCHEDULE-AGENT=CLIENT to SERVER");
            attendee.remove_param("SCHEDULE-AGENT");
        }
    }
}

/// Whether two ORGANIZER values name the same calendar user.
pub(crate) fn same_organizer(old: Option<&str>, new: Option<&str>) -> bool {
    match (old, new) {
        (Some(old), Some(new)) => same_address(old, new),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulingError;
    use crate::ical::parse_calendar;
    use crate::scheduler::testing::{directory, principal};

    fn calendar(body: &str) -> Calendar {
        parse_calendar(&format!(
            "BEGIN:VCALENDAR\nVERSION:2.0\nPRODID:-//Test//Test//EN\n{body}END:VCALENDAR\n"
        ))
        .expect("Should parse")
    }

    const MEETING: &str = "BEGIN:VEVENT\nUID:extract-1\nDTSTART:20250106T100000Z\n\
ORGANIZER:mailto:organizer@example.com\n\
ATTENDEE;PARTSTAT=ACCEPTED:mailto:organizer@example.com\n\
ATTENDEE;SCHEDULE-AGENT=CLIENT:mailto:a1@example.com\n\
ATTENDEE;SCHEDULE-AGENT=CLIENT:mailto:remote@elsewhere.org\n\
ATTENDEE:mailto:a2@example.com\nATTENDEE:MAILTO:A2@example.com\nEND:VEVENT\n";

    #[test]
    fn test_organizer_state_for_organizer_home() {
        let mut cal = calendar(MEETING);
        let data = check_implicit_state(&directory(), &principal("organizer"), &mut cal).unwrap();

        assert_eq!(data.state, SchedulingState::Organizer);
        assert_eq!(data.originator, "urn:uuid:organizer");
        assert_eq!(data.uid, "extract-1");
        assert!(data.organizer_principal().is_some());
    }

    #[test]
    fn test_local_client_agent_is_coerced_remote_is_not() {
        let mut cal = calendar(MEETING);
        let data = check_implicit_state(&directory(), &principal("organizer"), &mut cal).unwrap();

        assert!(data.attendees.contains("mailto:a1@example.com"));
        assert!(!data.attendees.contains("mailto:remote@elsewhere.org"));
        // duplicate a2 collapsed
        assert_eq!(cal.attendee_properties_for("mailto:a2@example.com").count(), 1);
    }

    #[test]
    fn test_attendee_and_missing_attendee_states() {
        let mut cal = calendar(MEETING);
        let data = check_implicit_state(&directory(), &principal("attendee2"), &mut cal).unwrap();
        assert_eq!(data.state, SchedulingState::Attendee);
        assert_eq!(data.attendee.as_deref(), Some("mailto:a2@example.com"));

        let mut cal = calendar(MEETING);
        let data = check_implicit_state(&directory(), &principal("bob"), &mut cal).unwrap();
        assert_eq!(data.state, SchedulingState::AttendeeMissing);
    }

    #[test]
    fn test_no_organizer_is_not_scheduling() {
        let mut cal = calendar("BEGIN:VEVENT\nUID:plain\nDTSTART:20250106T100000Z\nEND:VEVENT\n");
        let data = check_implicit_state(&directory(), &principal("organizer"), &mut cal).unwrap();
        assert_eq!(data.state, SchedulingState::None);
    }

    #[test]
    fn test_conflicting_organizers_rejected() {
        let mut cal = calendar(
            "BEGIN:VEVENT\nUID:two\nDTSTART:20250106T100000Z\nRRULE:FREQ=DAILY\n\
ORGANIZER:mailto:organizer@example.com\nEND:VEVENT\n\
BEGIN:VEVENT\nUID:two\nRECURRENCE-ID:20250107T100000Z\nDTSTART:20250107T100000Z\n\
ORGANIZER:mailto:a1@example.com\nEND:VEVENT\n",
        );
        let err = check_implicit_state(&directory(), &principal("organizer"), &mut cal).unwrap_err();
        assert!(matches!(err, SchedulingError::SingleOrganizer));
    }

    #[test]
    fn test_same_organizer() {
        assert!(same_organizer(Some("mailto:O@example.com"), Some("mailto:o@example.com")));
        assert!(same_organizer(None, None));
        assert!(!same_organizer(Some("mailto:o@example.com"), None));
    }
}
