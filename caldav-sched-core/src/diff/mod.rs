//! Property-level comparison of two versions of a scheduling object.

mod merge;
mod normalize;

use std::collections::BTreeSet;

use tracing::debug;

use crate::diff::normalize::{Normalized, ORGANIZER_VIEW};
use crate::ical::{Calendar, Rid};
use crate::services::{AttendeeMerge, ChangedProperties, ComponentDiff};

pub(crate) use normalize::canonical_rrule;

/// Default [`ComponentDiff`] working directly on the iCalendar tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct IcalDiff;

/// Names of the properties that differ between two instances.
///
/// ATTENDEE is reported when an attendee was added or removed; PARTSTAT when
/// an attendee present in both changed participation status.
fn changed_properties(old: &Normalized, new: &Normalized) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    if old.name != new.name {
        return changed;
    }

    let diff: Vec<_> = old.lines.symmetric_difference(&new.lines).collect();
    for line in &diff {
        let Some((address, partstat)) = &line.attendee else {
            changed.insert(line.name.clone());
            continue;
        };
        let counterpart = diff.iter().find(|other| {
            !std::ptr::eq(**other, *line)
                && other.attendee.as_ref().is_some_and(|(a, _)| a == address)
        });
        match counterpart {
            Some(other) => {
                if other.attendee.as_ref().is_some_and(|(_, p)| p != partstat) {
                    changed.insert("PARTSTAT".to_string());
                }
            }
            None => {
                changed.insert("ATTENDEE".to_string());
            }
        }
    }
    changed
}

impl ComponentDiff for IcalDiff {
    fn organizer_diff(&self, old: &Calendar, new: &mut Calendar, smart_merge: bool) -> bool {
        let changed = if smart_merge {
            debug!("Doing smart organizer diff/merge");
            let mut old = old.clone();
            let organizer = new.organizer();
            merge::smart_merge(&mut old, new, organizer.as_deref(), true);
            ORGANIZER_VIEW.calendar(&old) != ORGANIZER_VIEW.calendar(new)
        } else {
            ORGANIZER_VIEW.calendar(old) != ORGANIZER_VIEW.calendar(new)
        };
        if changed {
            debug!(uid = ?new.resource_uid(), "Organizer data changed");
        }
        changed
    }

    fn what_is_different(&self, old: &Calendar, new: &Calendar) -> ChangedProperties {
        let old_map = ORGANIZER_VIEW.calendar(old);
        let new_map = ORGANIZER_VIEW.calendar(new);
        let rids: BTreeSet<&Rid> = old_map.keys().chain(new_map.keys()).collect();

        let mut result = ChangedProperties::new();
        for rid in rids {
            let pair = match (old_map.get(rid), new_map.get(rid), rid) {
                (Some(o), Some(n), _) => Some((o.clone(), n.clone())),
                (Some(o), None, Some(r)) => new
                    .derive_instance(r)
                    .map(|d| (o.clone(), ORGANIZER_VIEW.component(&d))),
                (None, Some(n), Some(r)) => old
                    .derive_instance(r)
                    .map(|d| (ORGANIZER_VIEW.component(&d), n.clone())),
                _ => None,
            };
            let Some((o, n)) = pair else {
                continue;
            };
            let changed = changed_properties(&o, &n);
            if !changed.is_empty() {
                result.insert(rid.clone(), changed);
            }
        }
        result
    }

    fn attendee_merge(
        &self,
        old: &Calendar,
        new: &Calendar,
        attendee: &str,
        smart_merge: bool,
    ) -> AttendeeMerge {
        merge::attendee_merge(old, new, attendee, smart_merge)
    }
}
