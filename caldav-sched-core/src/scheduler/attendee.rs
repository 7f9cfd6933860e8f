//! Attendee writes: replying to, declining and removing an invitation.

use std::collections::BTreeSet;

use tracing::{debug, error};

use crate::address::{CalendarUser, CalendarUserKind};
use crate::error::{SchedulingError, SchedulingResult};
use crate::ical::{Calendar, Rid};
use crate::itip::RequestStatus;
use crate::scheduler::coerce;
use crate::scheduler::extract::{Extracted, same_organizer};
use crate::scheduler::{
    ActionKind, ImplicitScheduler, Method, Operation, PendingMessage, ReplyKind, ReturnStatus, SchedulingPlan,
};

impl ImplicitScheduler {
    pub(super) async fn plan_attendee(&self, op: Operation, smart_merge: bool) -> SchedulingResult<SchedulingPlan> {
        let mut plan = SchedulingPlan::for_operation(&op);
        let Operation {
            action,
            resource,
            mut calendar,
            return_calendar,
            data,
            ..
        } = op;

        let (Some(attendee), Some(organizer)) = (data.attendee.clone(), data.organizer.clone()) else {
            return Err(SchedulingError::InvalidData(format!(
                "{} has no ORGANIZER or no ATTENDEE for the calendar owner",
                data.uid
            )));
        };
        let organizer_user = data
            .organizer_user
            .clone()
            .unwrap_or_else(|| self.services.directory.calendar_user(&organizer));

        let do_scheduling =
            coerce::check_organizer_schedule_agent(&mut calendar, &organizer_user, &self.services.config);

        if action == ActionKind::Remove {
            plan.calendar = return_calendar;
            if calendar.is_fully_cancelled() {
                debug!(attendee = %attendee, uid = %data.uid, "Implicit - attendee is removing cancelled UID");
            } else if !do_scheduling {
                debug!(attendee = %attendee, uid = %data.uid, "Implicit - attendee is removing UID without server scheduling");
            } else if calendar
                .attendee_properties_for(&attendee)
                .all(|a| a.partstat() == "DECLINED")
            {
                debug!(attendee = %attendee, uid = %data.uid, "Implicit - attendee is removing fully declined UID");
            } else {
                debug!(attendee = %attendee, uid = %data.uid, "Implicit - attendee is cancelling UID");
                plan.schedules = true;
                plan.log_items.reply = Some(ReplyKind::Cancel);
                plan.messages.extend(
                    self.services
                        .itip
                        .generate_attendee_reply(&calendar, &attendee, None, true)
                        .map(|message| PendingMessage {
                            method: Method::Reply,
                            recipient: organizer,
                            rids: None,
                            message,
                        }),
                );
            }
            return Ok(plan);
        }

        let stored = resource.map(|r| r.calendar);
        if let Some(stored) = &stored {
            if !same_organizer(stored.organizer().as_deref(), calendar.organizer().as_deref()) {
                error!(uid = %data.uid, "Cannot change ORGANIZER");
                return Err(SchedulingError::ValidOrganizerChange);
            }
        }

        let mut reply_source = None;
        let changed_rids = match self.organizers_copy(&data, &organizer_user, stored.as_ref()).await? {
            Some(organizer_copy) => {
                if !do_scheduling {
                    error!(attendee = %attendee, uid = %data.uid, "Attendee is not allowed to change SCHEDULE-AGENT on organizer");
                    return Err(SchedulingError::attendee_change("Cannot alter organizer"));
                }

                let base = match stored {
                    Some(stored) => stored,
                    None => attendee_view(organizer_copy, &attendee).ok_or_else(|| {
                        debug!(attendee = %attendee, uid = %data.uid, "Implicit - attendee cannot use an event they are not an attendee of");
                        SchedulingError::attendee_change(
                            "Cannot use an event when not listed as an attendee in the organizer's copy",
                        )
                    })?,
                };

                let merge = self
                    .services
                    .diff
                    .attendee_merge(&base, &calendar, &attendee, smart_merge);
                if !merge.allowed {
                    if calendar.is_fully_cancelled() {
                        debug!(attendee = %attendee, uid = %data.uid, "Attendee is creating CANCELLED event for mismatched UID - removing entire event");
                        plan.status = ReturnStatus::OrphanedEvent;
                        return Ok(plan);
                    }
                    error!(attendee = %attendee, uid = %data.uid, "Attendee is not allowed to make an unauthorized change to an organized event");
                    return Err(SchedulingError::attendee_change("Attendee changes are not allowed"));
                }

                calendar = merge.merged;
                if calendar.main_type().is_none() {
                    debug!(attendee = %attendee, uid = %data.uid, "Attendee is replacing CANCELLED event - removing entire event");
                    plan.status = ReturnStatus::OrphanedEvent;
                    return Ok(plan);
                }
                if !merge.reply_needed {
                    debug!(attendee = %attendee, uid = %data.uid, "Implicit - attendee is updating UID but change is not significant");
                    plan.calendar = Some(calendar);
                    return Ok(plan);
                }
                debug!(attendee = %attendee, uid = %data.uid, organizer = %organizer, "Attendee is allowed to update UID with local organizer");

                if !merge.removed_rids.is_empty() {
                    reply_source = Some(with_declined_instances(&calendar, &base, &attendee, &merge.removed_rids));
                }
                merge.changed_rids
            }

            None if organizer_user.kind.is_local() => {
                if !do_scheduling {
                    debug!(attendee = %attendee, uid = %data.uid, "Implicit - attendee is modifying UID without server scheduling");
                    plan.calendar = Some(calendar);
                    return Ok(plan);
                }
                if calendar.is_fully_cancelled() {
                    debug!(attendee = %attendee, uid = %data.uid, "Attendee is creating CANCELLED event for missing UID - removing entire event");
                    plan.status = ReturnStatus::OrphanedCancelledEvent;
                    return Ok(plan);
                }
                if stored
                    .as_ref()
                    .is_some_and(|stored| !stored.organizer_schedule_agent_is_server())
                {
                    error!(attendee = %attendee, uid = %data.uid, "Attendee is not allowed to set SCHEDULE-AGENT=SERVER on organizer");
                    return Err(SchedulingError::attendee_change("Attendee cannot change organizer state"));
                }
                debug!(attendee = %attendee, uid = %data.uid, "Attendee is not allowed to update UID - missing organizer copy - removing entire event");
                plan.status = ReturnStatus::OrphanedEvent;
                return Ok(plan);
            }

            None if organizer_user.kind == CalendarUserKind::Invalid => {
                debug!(attendee = %attendee, uid = %data.uid, organizer = %organizer, "Attendee is allowed to update UID with invalid organizer");
                if do_scheduling {
                    calendar.set_parameter_for_property_with_value(
                        "SCHEDULE-STATUS",
                        RequestStatus::NO_USER_SUPPORT.code(),
                        "ORGANIZER",
                        Some(&organizer),
                    );
                }
                plan.calendar = Some(calendar);
                return Ok(plan);
            }

            None => {
                // Nothing to check a remote organizer's attendee against
                debug!(attendee = %attendee, uid = %data.uid, organizer = %organizer, "Attendee is allowed to update UID with remote organizer");
                None
            }
        };

        if do_scheduling {
            debug!(attendee = %attendee, uid = %data.uid, "Implicit - attendee is updating UID");
            plan.schedules = true;
            plan.stamp_responses = true;
            plan.log_items.reply = Some(ReplyKind::Reply);
            let source = reply_source.as_ref().unwrap_or(&calendar);
            plan.messages.extend(
                self.services
                    .itip
                    .generate_attendee_reply(source, &attendee, changed_rids.as_ref(), false)
                    .map(|message| PendingMessage {
                        method: Method::Reply,
                        recipient: organizer,
                        rids: changed_rids,
                        message,
                    }),
            );
        } else {
            debug!(attendee = %attendee, uid = %data.uid, "Implicit - attendee is updating UID without server scheduling");
        }

        plan.calendar = Some(calendar);
        Ok(plan)
    }

    /// The acting user has an ORGANIZER but is not one of the attendees.
    pub(super) fn plan_missing_attendee(&self, op: Operation) -> SchedulingResult<SchedulingPlan> {
        let mut plan = SchedulingPlan::for_operation(&op);
        let Operation {
            action,
            resource,
            mut calendar,
            return_calendar,
            data,
            ..
        } = op;

        if action == ActionKind::Remove {
            debug!(uid = %data.uid, "Implicit - missing attendee is removing UID without server scheduling");
            plan.calendar = return_calendar;
            return Ok(plan);
        }

        debug!(uid = %data.uid, organizer = ?data.organizer, "Missing attendee is allowed to update UID");
        if let Some(stored) = resource.map(|r| r.calendar) {
            let changed = !same_organizer(stored.organizer().as_deref(), calendar.organizer().as_deref());
            if changed && stored.organizer_schedule_agent_is_server() {
                error!(uid = %data.uid, "Cannot change ORGANIZER");
                return Err(SchedulingError::ValidOrganizerChange);
            }
        }

        if calendar.organizer_schedule_agent_is_server() {
            coerce::disable_organizer_scheduling(&mut calendar);
        }
        plan.calendar = Some(calendar);
        Ok(plan)
    }

    /// The organizer's stored copy of the event.
    ///
    /// An organizer on another partition or server has no local copy; the
    /// attendee's stored copy stands in for it.
    async fn organizers_copy(
        &self,
        data: &Extracted,
        organizer: &CalendarUser,
        stored: Option<&Calendar>,
    ) -> SchedulingResult<Option<Calendar>> {
        if let Some(principal) = &organizer.principal {
            if let Some(copy) = self.services.store.organizer_copy(&principal.uid, &data.uid).await? {
                return Ok(Some(copy));
            }
        }
        if organizer.kind.is_partitioned_or_other_server() {
            return Ok(stored.cloned());
        }
        Ok(None)
    }
}

/// The organizer's copy restricted to what `attendee` was invited to.
fn attendee_view(mut organizer_copy: Calendar, attendee: &str) -> Option<Calendar> {
    organizer_copy.attendees_view(&[attendee], true);
    organizer_copy.main_type()?;
    Some(organizer_copy)
}

/// `calendar` plus a DECLINED component for every instance the attendee removed,
/// so the REPLY tells the organizer about them.
fn with_declined_instances(calendar: &Calendar, base: &Calendar, attendee: &str, removed: &BTreeSet<Rid>) -> Calendar {
    let mut source = calendar.clone();
    for rid in removed {
        let Some(r) = rid else {
            continue;
        };
        let component = base
            .overridden(rid)
            .cloned()
            .or_else(|| base.derive_instance(r));
        if let Some(mut component) = component {
            component.set_parameter_for_property_with_value("PARTSTAT", "DECLINED", "ATTENDEE", Some(attendee));
            source.add_component(component);
        }
    }
    source
}
