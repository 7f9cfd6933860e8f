//! Carrying attendee state between versions, and vetting attendee writes.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::address::same_address;
use crate::diff::normalize::{ATTENDEE_VIEW, Line, Normalized};
use crate::ical::{Calendar, Component, RecurrenceId, Rid};
use crate::services::AttendeeMerge;

/// Properties whose change means old attendee replies no longer apply.
const RESCHEDULE_PROPERTIES: &[&str] = &[
    "DTSTART",
    "DTEND",
    "DURATION",
    "RRULE",
    "RDATE",
    "EXDATE",
    "RECURRENCE-ID",
];

/// Attendee-side properties an attendee may change freely.
const ATTENDEE_FREE_PROPERTIES: &[&str] = &["TRANSP", "DTSTAMP", "CREATED", "LAST-MODIFIED", "SEQUENCE"];

/// Properties an attendee may change that the organizer hears about.
const ATTENDEE_REPLY_PROPERTIES: &[&str] = &["X-CALENDARSERVER-PRIVATE-COMMENT"];

/// Attendee parameters that carry server-side state between versions.
const TRANSFERRED_PARAMETERS: &[&str] = &["PARTSTAT", "RSVP", "SCHEDULE-STATUS"];

/// Copy attendee state from `old` into `new` so a write based on stale data
/// does not undo replies the server already processed.
///
/// Instances present on only one side are derived on the other so both
/// calendars end up with the same set of overrides for comparison.
pub(crate) fn smart_merge(
    old: &mut Calendar,
    new: &mut Calendar,
    ignore_attendee: Option<&str>,
    is_organizer: bool,
) {
    if let (Some(old_master), Some(new_master)) = (old.master().cloned(), new.master_mut()) {
        try_component_merge(&old_master, new_master, ignore_attendee, is_organizer);
    }

    let old_overrides: Vec<Component> = old
        .main_components()
        .filter(|c| c.recurrence_id().is_some())
        .cloned()
        .collect();
    for old_component in &old_overrides {
        let rid = old_component.recurrence_id();
        if let Some(new_component) = new.overridden_mut(&rid) {
            try_component_merge(old_component, new_component, ignore_attendee, is_organizer);
            continue;
        }
        if !is_organizer && old_component.is_cancelled() {
            continue;
        }
        let derived = rid.as_ref().and_then(|r| new.derive_instance(r));
        if let Some(mut derived) = derived {
            try_component_merge(old_component, &mut derived, ignore_attendee, is_organizer);
            new.add_component(derived);
        }
    }

    let new_only: Vec<RecurrenceId> = new
        .main_components()
        .filter(|c| is_organizer || !c.is_cancelled())
        .filter_map(|c| c.recurrence_id())
        .filter(|rid| old.overridden(&Some(rid.clone())).is_none())
        .collect();
    for rid in new_only {
        let Some(derived) = old.derive_instance(&rid) else {
            continue;
        };
        let rid = Some(rid);
        if let Some(new_component) = new.overridden_mut(&rid) {
            try_component_merge(&derived, new_component, ignore_attendee, is_organizer);
        }
        old.add_component(derived);
    }
}

fn try_component_merge(
    old: &Component,
    new: &mut Component,
    ignore_attendee: Option<&str>,
    is_organizer: bool,
) {
    if !is_organizer || !organizer_change_prevents_merge(old, new) {
        transfer_attendees(old, new, ignore_attendee);
    }
}

/// Whether the organizer rescheduled, making stored attendee state irrelevant.
fn organizer_change_prevents_merge(old: &Component, new: &Component) -> bool {
    RESCHEDULE_PROPERTIES.iter().any(|name| {
        old.properties_named(name)
            .any(|p| !new.properties_named(name).any(|q| q == p))
    })
}

fn transfer_attendees(old: &Component, new: &mut Component, ignore_attendee: Option<&str>) {
    for new_attendee in new.attendee_properties_mut() {
        if ignore_attendee.is_some_and(|a| same_address(a, &new_attendee.value)) {
            continue;
        }
        let Some(old_attendee) = old.attendee(&new_attendee.value) else {
            continue;
        };
        for param in TRANSFERRED_PARAMETERS {
            match old_attendee.param(param) {
                Some(value) => new_attendee.set_param(param, value),
                None => {
                    new_attendee.remove_param(param);
                }
            }
        }
    }
}

/// Instances an attendee dropped, and whether they re-added any.
fn removed_instances(old: &Calendar, new: &Calendar) -> Option<BTreeSet<Rid>> {
    let mut removed = BTreeSet::new();
    for old_component in old.main_components() {
        let rid = old_component.recurrence_id();
        if new.overridden(&rid).is_some() || old_component.is_cancelled() {
            continue;
        }
        if rid.is_none() {
            debug!("Attendee removed the master component");
            return None;
        }
        removed.insert(rid);
    }

    if let (Some(old_master), Some(new_master)) = (old.master(), new.master()) {
        let old_exdates = old_master.exdates();
        let new_exdates = new_master.exdates();
        if !old_exdates.is_subset(&new_exdates) {
            debug!("Attendee removed an EXDATE");
            return None;
        }
        for exdate in new_exdates.difference(&old_exdates) {
            if old.is_valid_instance(exdate) {
                removed.insert(Some(exdate.clone()));
            }
        }
    }
    Some(removed)
}

/// Compare one instance. `None` when the attendee changed something they may not;
/// otherwise whether they changed anything the organizer should hear about.
fn test_components(old: &Component, new: &Component, attendee: &str) -> Option<bool> {
    if old.name != new.name {
        debug!(old = %old.name, new = %new.name, "Component names are different");
        return None;
    }

    let old = without_exdates(ATTENDEE_VIEW.component(old));
    let new = without_exdates(ATTENDEE_VIEW.component(new));

    let mut reply_worthy = false;
    for line in old.lines.symmetric_difference(&new.lines) {
        if ATTENDEE_FREE_PROPERTIES.contains(&line.name.as_str()) {
            continue;
        }
        let own_attendee = line
            .attendee
            .as_ref()
            .is_some_and(|(address, _)| same_address(address, attendee));
        if own_attendee || ATTENDEE_REPLY_PROPERTIES.contains(&line.name.as_str()) {
            reply_worthy = true;
            continue;
        }
        debug!(property = %line.name, "Attendee changed a property they do not own");
        return None;
    }

    if old.children != new.children {
        debug!("Sub-components are different");
        return None;
    }

    Some(reply_worthy)
}

fn without_exdates(mut normalized: Normalized) -> Normalized {
    normalized.lines.retain(|l: &Line| l.name != "EXDATE");
    normalized
}

/// Merge an attendee's write over their previous copy.
pub(crate) fn attendee_merge(
    old: &Calendar,
    new: &Calendar,
    attendee: &str,
    smart: bool,
) -> AttendeeMerge {
    let mut merged = new.clone();
    let mut old = old.clone();
    if smart {
        smart_merge(&mut old, &mut merged, Some(attendee), false);
    }

    let disallowed = |merged: Calendar| AttendeeMerge {
        allowed: false,
        reply_needed: false,
        changed_rids: None,
        removed_rids: BTreeSet::new(),
        merged,
    };

    let Some(removed) = removed_instances(&old, &merged) else {
        return disallowed(merged);
    };

    let old_components: BTreeMap<Rid, &Component> =
        old.main_components().map(|c| (c.recurrence_id(), c)).collect();
    let old_exdates = old.master().map(Component::exdates).unwrap_or_default();

    let mut changed = BTreeSet::new();
    for new_component in merged.main_components() {
        let rid = new_component.recurrence_id();
        let derived;
        let old_component = match (old_components.get(&rid), &rid) {
            (Some(c), _) => *c,
            (None, Some(r)) => {
                if new_component.is_cancelled() && old_exdates.contains(r) {
                    continue;
                }
                match old.derive_instance(r) {
                    Some(d) => {
                        derived = d;
                        &derived
                    }
                    None => {
                        debug!(rid = %r, "Could not derive instance");
                        return disallowed(merged.clone());
                    }
                }
            }
            (None, None) => {
                debug!("Attendee added a master component");
                return disallowed(merged.clone());
            }
        };

        match test_components(old_component, new_component, attendee) {
            Some(true) => {
                changed.insert(rid);
            }
            Some(false) => {}
            None => return disallowed(merged.clone()),
        }
    }

    let reply_needed = !changed.is_empty() || !removed.is_empty();
    let changed_rids = if old.is_recurring() || merged.is_recurring() {
        Some(changed.union(&removed).cloned().collect())
    } else {
        None
    };

    AttendeeMerge {
        allowed: true,
        reply_needed,
        changed_rids,
        removed_rids: removed,
        merged,
    }
}
