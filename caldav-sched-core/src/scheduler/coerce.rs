//! Who may set PARTSTAT, RSVP and SCHEDULE-AGENT.

use std::collections::BTreeMap;

use tracing::debug;

use crate::address::{CalendarUser, normalize_address};
use crate::config::SchedulingConfig;
use crate::ical::{Calendar, Component, Rid};
use crate::itip::RequestStatus;
use crate::services::Principal;

const NEEDS_ACTION: &str = "NEEDS-ACTION";

/// An organizer cannot create a meeting with attendees already answered.
pub(crate) fn attendees_partstat_on_create(calendar: &mut Calendar, organizer: &Principal) {
    for attendee in calendar.all_attendee_properties_mut() {
        if organizer.has_address(&attendee.value) {
            continue;
        }
        if attendee.is_schedule_agent_server() && attendee.has_param("PARTSTAT") {
            attendee.set_param("PARTSTAT", NEEDS_ACTION);
        }
    }
}

/// Undo PARTSTAT changes an organizer made on behalf of server-managed attendees.
///
/// Instances in both versions are compared directly, added overrides against
/// the old master. A removed override that is still a valid instance is
/// compared against its derived replacement, which is added to `new` when a
/// PARTSTAT had to be restored.
pub(crate) fn attendees_partstat_on_modify(old: &Calendar, new: &mut Calendar, organizer: &Principal) {
    let new_rids = new.instances();
    let old_rids = old.instances();

    for rid in new_rids.intersection(&old_rids) {
        if let (Some(old_component), Some(new_component)) = (old.overridden(rid), new.overridden_mut(rid)) {
            compare_attendee_partstats(old_component, new_component, organizer);
        }
    }

    for rid in new_rids.difference(&old_rids) {
        if let (Some(old_master), Some(new_component)) = (old.master(), new.overridden_mut(rid)) {
            compare_attendee_partstats(old_master, new_component, organizer);
        }
    }

    let removed = old_rids.difference(&new_rids).cloned().collect();
    for rid in new.valid_instances(&removed) {
        let Some(r) = &rid else {
            continue;
        };
        let (Some(old_component), Some(mut derived)) = (old.overridden(&rid), new.derive_instance(r)) else {
            continue;
        };
        if compare_attendee_partstats(old_component, &mut derived, organizer) {
            new.add_component(derived);
        }
    }
}

/// Restore old PARTSTATs on `new`; true when something was restored.
fn compare_attendee_partstats(old: &Component, new: &mut Component, organizer: &Principal) -> bool {
    let old_partstats: BTreeMap<String, String> = old
        .attendee_properties()
        .map(|a| (normalize_address(&a.value), a.partstat()))
        .collect();

    let mut changed = false;
    for attendee in new.attendee_properties_mut() {
        if organizer.has_address(&attendee.value) {
            continue;
        }
        let new_partstat = attendee.partstat();
        if !attendee.is_schedule_agent_server() || new_partstat == NEEDS_ACTION {
            continue;
        }
        let old_partstat = old_partstats.get(&normalize_address(&attendee.value));
        let restored = old_partstat.map(String::as_str).unwrap_or(NEEDS_ACTION);
        if old_partstat.is_none() || restored != new_partstat {
            debug!(attendee = %attendee.value, from = %new_partstat, to = %restored, "Reverting organizer PARTSTAT change");
            attendee.set_param("PARTSTAT", restored);
            changed = true;
        }
    }
    changed
}

/// Attendees of a rescheduled instance have to answer again.
///
/// The instance is derived and added when it is not overridden yet.
pub(crate) fn reset_partstats(calendar: &mut Calendar, rid: &Rid, organizer: &Principal) {
    if calendar.overridden(rid).is_none() {
        let Some(derived) = rid.as_ref().and_then(|r| calendar.derive_instance(r)) else {
            return;
        };
        calendar.add_component(derived);
    }
    let Some(component) = calendar.overridden_mut(rid) else {
        return;
    };
    for attendee in component.attendee_properties_mut() {
        if attendee.has_param("PARTSTAT") && !organizer.has_address(&attendee.value) {
            attendee.set_param("PARTSTAT", NEEDS_ACTION);
        }
    }
}

/// Every attendee that still has to answer is asked to.
pub(crate) fn force_rsvp(calendar: &mut Calendar) {
    for attendee in calendar.all_attendee_properties_mut() {
        if attendee.partstat() == NEEDS_ACTION {
            attendee.set_param("RSVP", "TRUE");
        }
    }
}

pub(crate) fn clear_force_send(calendar: &mut Calendar) {
    for attendee in calendar.all_attendee_properties_mut() {
        attendee.remove_param("SCHEDULE-FORCE-SEND");
    }
}

/// Whether an attendee's write should be scheduled with the organizer.
///
/// A non-local organizer marked SCHEDULE-AGENT=SERVER cannot be reached when
/// cross-server scheduling is off; the ORGANIZER is switched to
/// SCHEDULE-AGENT=NONE and stamped as unsupported. iMIP organizers keep
/// whatever the client chose while iMIP is enabled.
pub(crate) fn check_organizer_schedule_agent(
    calendar: &mut Calendar,
    organizer: &CalendarUser,
    config: &SchedulingConfig,
) -> bool {
    let is_server = calendar.organizer_schedule_agent_is_server();

    if config.imip_enabled && organizer.address.to_ascii_lowercase().starts_with("mailto:") {
        return is_server;
    }

    if !config.ischedule_enabled && !organizer.kind.is_hosted() && is_server {
        debug!(organizer = %organizer.address, "Attendee cannot use SCHEDULE-AGENT=SERVER on a remote organizer");
        disable_organizer_scheduling(calendar);
        return false;
    }

    is_server
}

/// SCHEDULE-AGENT=NONE and SCHEDULE-STATUS=5.3 on every ORGANIZER.
pub(crate) fn disable_organizer_scheduling(calendar: &mut Calendar) {
    calendar.set_parameter_for_property_with_value("SCHEDULE-AGENT", "NONE", "ORGANIZER", None);
    calendar.set_parameter_for_property_with_value(
        "SCHEDULE-STATUS",
        RequestStatus::NO_USER_SUPPORT.code(),
        "ORGANIZER",
        None,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::CalendarUserKind;
    use crate::ical::{RecurrenceId, parse_calendar};
    use crate::scheduler::testing::{directory, principal};
    use crate::services::Directory;

    fn calendar(master_attendees: &str, overrides: &str) -> Calendar {
        parse_calendar(&format!(
            "BEGIN:VCALENDAR\nVERSION:2.0\nPRODID:-//Test//Test//EN\n\
BEGIN:VEVENT\nUID:coerce-1\nDTSTART:20250106T100000Z\nDTEND:20250106T110000Z\n\
RRULE:FREQ=WEEKLY;COUNT=10\nORGANIZER:mailto:organizer@example.com\n\
ATTENDEE;PARTSTAT=ACCEPTED:mailto:organizer@example.com\n{master_attendees}END:VEVENT\n\
{overrides}END:VCALENDAR\n"
        ))
        .expect("Should parse")
    }

    fn partstat(calendar: &Calendar, rid: &Rid, address: &str) -> String {
        calendar
            .overridden(rid)
            .and_then(|c| c.attendee(address))
            .map(|a| a.partstat())
            .unwrap_or_default()
    }

    #[test]
    fn test_create_forces_needs_action_except_organizer() {
        let mut cal = calendar(
            "ATTENDEE;PARTSTAT=ACCEPTED:mailto:a1@example.com\n\
ATTENDEE;PARTSTAT=DECLINED;SCHEDULE-AGENT=CLIENT:mailto:a2@example.com\n",
            "",
        );
        attendees_partstat_on_create(&mut cal, &principal("organizer"));

        assert_eq!(partstat(&cal, &None, "mailto:a1@example.com"), "NEEDS-ACTION");
        assert_eq!(partstat(&cal, &None, "mailto:a2@example.com"), "DECLINED");
        assert_eq!(partstat(&cal, &None, "mailto:organizer@example.com"), "ACCEPTED");
    }

    #[test]
    fn test_modify_reverts_organizer_partstat_change() {
        let old = calendar("ATTENDEE;PARTSTAT=NEEDS-ACTION:mailto:a1@example.com\n", "");
        let mut new = calendar(
            "ATTENDEE;PARTSTAT=ACCEPTED:mailto:a1@example.com\n\
ATTENDEE;PARTSTAT=TENTATIVE:mailto:a2@example.com\n",
            "",
        );
        attendees_partstat_on_modify(&old, &mut new, &principal("organizer"));

        assert_eq!(partstat(&new, &None, "mailto:a1@example.com"), "NEEDS-ACTION");
        // new attendee cannot arrive pre-answered either
        assert_eq!(partstat(&new, &None, "mailto:a2@example.com"), "NEEDS-ACTION");
    }

    #[test]
    fn test_modify_keeps_removed_override_partstat_on_derived_instance() {
        let old = calendar(
            "ATTENDEE;PARTSTAT=ACCEPTED:mailto:a1@example.com\n",
            "BEGIN:VEVENT\nUID:coerce-1\nRECURRENCE-ID:20250113T100000Z\n\
DTSTART:20250113T100000Z\nDTEND:20250113T110000Z\nORGANIZER:mailto:organizer@example.com\n\
ATTENDEE;PARTSTAT=ACCEPTED:mailto:organizer@example.com\n\
ATTENDEE;PARTSTAT=DECLINED:mailto:a1@example.com\nEND:VEVENT\n",
        );
        let mut new = calendar("ATTENDEE;PARTSTAT=ACCEPTED:mailto:a1@example.com\n", "");
        attendees_partstat_on_modify(&old, &mut new, &principal("organizer"));

        let rid = RecurrenceId::parse("20250113T100000Z");
        assert_eq!(partstat(&new, &rid, "mailto:a1@example.com"), "DECLINED");
        assert_eq!(partstat(&new, &None, "mailto:a1@example.com"), "ACCEPTED");
    }

    #[test]
    fn test_reset_partstats_derives_missing_override() {
        let mut cal = calendar("ATTENDEE;PARTSTAT=ACCEPTED:mailto:a1@example.com\n", "");
        let rid = RecurrenceId::parse("20250120T100000Z");
        reset_partstats(&mut cal, &rid, &principal("organizer"));

        assert_eq!(partstat(&cal, &rid, "mailto:a1@example.com"), "NEEDS-ACTION");
        assert_eq!(partstat(&cal, &rid, "mailto:organizer@example.com"), "ACCEPTED");
        assert_eq!(partstat(&cal, &None, "mailto:a1@example.com"), "ACCEPTED");
    }

    #[test]
    fn test_rsvp_and_force_send() {
        let mut cal = calendar(
            "ATTENDEE;SCHEDULE-FORCE-SEND=REQUEST:mailto:a1@example.com\n\
ATTENDEE;PARTSTAT=ACCEPTED:mailto:a2@example.com\n",
            "",
        );
        force_rsvp(&mut cal);
        clear_force_send(&mut cal);

        let master = cal.master().unwrap();
        let a1 = master.attendee("mailto:a1@example.com").unwrap();
        assert_eq!(a1.param("RSVP"), Some("TRUE"));
        assert!(!a1.has_param("SCHEDULE-FORCE-SEND"));
        assert!(!master.attendee("mailto:a2@example.com").unwrap().has_param("RSVP"));
    }

    #[test]
    fn test_remote_server_organizer_is_disabled_without_ischedule() {
        let mut cal = calendar("", "");
        cal.set_parameter_for_property_with_value("SCHEDULE-AGENT", "SERVER", "ORGANIZER", None);
        let remote = directory().calendar_user("mailto:someone@elsewhere.org");
        assert_eq!(remote.kind, CalendarUserKind::Remote);

        assert!(!check_organizer_schedule_agent(&mut cal, &remote, &SchedulingConfig::default()));
        let organizer = cal.organizer_property().unwrap();
        assert_eq!(organizer.param("SCHEDULE-AGENT"), Some("NONE"));
        assert_eq!(organizer.param("SCHEDULE-STATUS"), Some("5.3"));
    }

    #[test]
    fn test_imip_organizer_keeps_agent_when_enabled() {
        let mut cal = calendar("", "");
        let remote = directory().calendar_user("mailto:someone@elsewhere.org");
        let config = SchedulingConfig {
            imip_enabled: true,
            ..SchedulingConfig::default()
        };

        assert!(check_organizer_schedule_agent(&mut cal, &remote, &config));
        assert!(!cal.organizer_property().unwrap().has_param("SCHEDULE-AGENT"));
    }

    #[test]
    fn test_local_organizer_keeps_agent() {
        let mut cal = calendar("", "");
        let local = directory().calendar_user("mailto:organizer@example.com");
        assert!(check_organizer_schedule_agent(&mut cal, &local, &SchedulingConfig::default()));
    }
}
