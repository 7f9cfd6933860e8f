//! Which (attendee, instance) pairs lost the meeting and need a CANCEL.

use std::collections::BTreeSet;

use crate::ical::{Calendar, InstanceKey, Rid};

/// The stored side of an organizer modify.
pub(crate) struct OldInstances<'a> {
    pub calendar: &'a Calendar,
    pub attendees_by_instance: &'a BTreeSet<InstanceKey>,
    pub instances: &'a BTreeSet<Rid>,
}

/// Cancellations when the recurrence pattern is unchanged.
///
/// Cancels are sent for:
/// - an attendee dropped from the master or from an override still present
/// - a removed override, when the attendee is not in the new master or the
///   instance was EXDATE-d
/// - every old master attendee of a newly EXDATE-d instance
/// - old master attendees missing from a newly added override
pub(crate) fn removed_attendees(
    old: &OldInstances<'_>,
    new: &Calendar,
    new_by_instance: &BTreeSet<InstanceKey>,
    new_instances: &BTreeSet<Rid>,
) -> BTreeSet<InstanceKey> {
    let removed_instances: BTreeSet<&Rid> = old.instances.difference(new_instances).collect();
    let added_instances: BTreeSet<&Rid> = new_instances.difference(old.instances).collect();

    let exdates = |calendar: &Calendar| -> BTreeSet<Rid> {
        calendar
            .master()
            .map(|m| m.exdates().into_iter().map(Some).collect())
            .unwrap_or_default()
    };
    let old_exdates = exdates(old.calendar);
    let added_exdates: BTreeSet<Rid> = exdates(new).difference(&old_exdates).cloned().collect();

    let mut cancelled = BTreeSet::new();

    for key in old.attendees_by_instance.difference(new_by_instance) {
        let cancel = match &key.rid {
            None => true,
            rid if !removed_instances.contains(rid) => true,
            rid => {
                let in_new_master = new_by_instance.contains(&InstanceKey::new(key.attendee.clone(), None));
                !in_new_master || added_exdates.contains(rid)
            }
        };
        if cancel {
            cancelled.insert(key.clone());
        }
    }

    let old_master_attendees: BTreeSet<&str> = old
        .calendar
        .master()
        .map(|m| {
            m.attendee_properties()
                .filter(|a| a.is_schedule_agent_server())
                .map(|a| a.value.as_str())
                .collect()
        })
        .unwrap_or_default();

    for attendee in &old_master_attendees {
        // Attendees of a removed override were handled above
        for exdate in added_exdates.iter().filter(|r| !removed_instances.contains(r)) {
            cancelled.insert(InstanceKey::new(*attendee, exdate.clone()));
        }

        for rid in &added_instances {
            let key = InstanceKey::new(*attendee, (*rid).clone());
            if !new_by_instance.contains(&key) && !old_exdates.contains(*rid) {
                cancelled.insert(key);
            }
        }
    }

    cancelled
}

/// Cancellations when the recurrence pattern changed.
///
/// Old and new instances no longer correspond, so everyone missing from the
/// new master loses every instance they had; everyone else gets the full new
/// series in a REQUEST.
pub(crate) fn removed_attendees_on_recurrence_change(
    old_by_instance: &BTreeSet<InstanceKey>,
    new: &Calendar,
) -> BTreeSet<InstanceKey> {
    let new_master_attendees: BTreeSet<&str> = new
        .master()
        .map(|m| {
            m.attendee_properties()
                .filter(|a| a.is_schedule_agent_server())
                .map(|a| a.value.as_str())
                .collect()
        })
        .unwrap_or_default();

    old_by_instance
        .iter()
        .filter(|key| !new_master_attendees.contains(key.attendee.as_str()))
        .cloned()
        .collect()
}
