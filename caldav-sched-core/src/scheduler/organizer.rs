//! Organizer writes: creating, changing and removing a meeting.

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::{SchedulingError, SchedulingResult};
use crate::ical::{InstanceKey, Rid};
use crate::scheduler::coerce;
use crate::scheduler::reconcile::{self, OldInstances};
use crate::scheduler::significance::{self, OrganizerChange};
use crate::scheduler::{ActionKind, ImplicitScheduler, Operation, SchedulingPlan};

impl ImplicitScheduler {
    pub(super) fn plan_organizer(&self, op: Operation, smart_merge: bool) -> SchedulingResult<SchedulingPlan> {
        let mut plan = SchedulingPlan::for_operation(&op);
        let Operation {
            action,
            resource,
            mut calendar,
            return_calendar,
            data,
            ..
        } = op;

        let organizer = data.organizer_principal().cloned().ok_or_else(|| {
            SchedulingError::InvalidData(format!("organizer of {} is not a known principal", data.uid))
        })?;

        let mut old = None;
        let mut cancelled = BTreeSet::new();
        let mut changed_rids: Option<BTreeSet<Rid>> = None;
        let mut reinvites: Option<BTreeSet<String>> = None;
        let mut needs_sequence_change = false;

        match action {
            ActionKind::Remove => {
                debug!(organizer = ?data.organizer, uid = %data.uid, "Implicit - organizer is removing UID");
                cancelled = data
                    .attendees
                    .iter()
                    .map(|attendee| InstanceKey::new(attendee.clone(), None))
                    .collect();
                // CANCEL always bumps SEQUENCE
                needs_sequence_change = true;
                old = Some(calendar.clone());
            }

            ActionKind::Modify => {
                let stored = resource.map(|r| r.calendar).ok_or_else(|| {
                    SchedulingError::InvalidData(format!("no stored data to modify for {}", data.uid))
                })?;
                let old_by_instance = stored.attendees_by_instance(true);
                let old_instances = stored.instances();

                coerce::attendees_partstat_on_modify(&stored, &mut calendar, &organizer);
                calendar.sequence_in_sync(&stored);

                let change =
                    significance::organizer_change(self.services.diff.as_ref(), &stored, &mut calendar, smart_merge)?;
                match change {
                    OrganizerChange::Insignificant { reinvites: flagged } if flagged.is_empty() => {
                        debug!(organizer = ?data.organizer, uid = %data.uid, "Implicit - organizer is modifying UID but change is not significant");
                        plan.calendar = Some(calendar);
                        return Ok(plan);
                    }
                    OrganizerChange::Insignificant { reinvites: flagged } => {
                        debug!(organizer = ?data.organizer, uid = %data.uid, attendees = ?flagged, "Implicit - organizer is re-inviting UID");
                        reinvites = Some(flagged);
                    }
                    OrganizerChange::Significant(change) => {
                        debug!(organizer = ?data.organizer, uid = %data.uid, "Implicit - organizer is modifying UID");

                        for rid in &change.date_changed_rids {
                            coerce::reset_partstats(&mut calendar, rid, &organizer);
                        }

                        cancelled = if change.recurrence_reschedule {
                            reconcile::removed_attendees_on_recurrence_change(&old_by_instance, &calendar)
                        } else {
                            let old = OldInstances {
                                calendar: &stored,
                                attendees_by_instance: &old_by_instance,
                                instances: &old_instances,
                            };
                            reconcile::removed_attendees(&old, &calendar, &data.attendees_by_instance, &data.instances)
                        };

                        changed_rids = Some(change.rids);
                        needs_sequence_change = calendar.needs_itip_sequence_change(&stored);
                    }
                }
                old = Some(stored);
            }

            ActionKind::Create => {
                debug!(organizer = ?data.organizer, uid = %data.uid, "Implicit - organizer is creating UID");
                coerce::attendees_partstat_on_create(&mut calendar, &organizer);
            }

            ActionKind::None => return Ok(plan),
        }

        coerce::force_rsvp(&mut calendar);
        if needs_sequence_change {
            calendar.bump_itip_info(old.as_ref(), true);
        }

        plan.schedules = true;
        if let Some(old) = &old {
            let full_cancel = action == ActionKind::Remove;
            plan.messages
                .extend(self.cancel_messages(old, &cancelled, &organizer, full_cancel));
        }
        if matches!(action, ActionKind::Create | ActionKind::Modify) {
            plan.messages.extend(self.request_messages(
                &calendar,
                &data.attendees,
                &organizer,
                &BTreeSet::new(),
                reinvites.as_ref(),
                changed_rids.as_ref(),
            ));
        }
        plan.log_items.requests = Some(plan.messages.len());

        coerce::clear_force_send(&mut calendar);

        if action == ActionKind::Remove {
            plan.calendar = return_calendar;
        } else {
            plan.calendar = Some(calendar);
            plan.stamp_responses = true;
        }
        Ok(plan)
    }
}
