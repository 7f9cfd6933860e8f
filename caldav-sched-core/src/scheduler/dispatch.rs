//! Building and sending iTIP messages.

use std::collections::{BTreeMap, BTreeSet};

use metrics::counter;
use tracing::{debug, info};

use crate::address::same_address;
use crate::error::{SchedulingError, SchedulingResult};
use crate::ical::{Calendar, InstanceKey, Rid};
use crate::metrics::itip as itip_metrics;
use crate::scheduler::extract::extract_calendar_data;
use crate::scheduler::response::apply_delivery_report;
use crate::scheduler::{
    ImplicitScheduler, LogItems, Method, PendingMessage, ReplyKind, ReturnStatus, SchedulingOutcome,
    SchedulingPlan, StoredResource,
};
use crate::services::{DeliveryOptions, Principal};

fn contains_address(addresses: &BTreeSet<String>, address: &str) -> bool {
    addresses.iter().any(|a| same_address(a, address))
}

impl ImplicitScheduler {
    /// Send what `plan` contains and stamp delivery statuses on its calendar.
    ///
    /// Fails without sending anything when scheduling was vetoed with
    /// [`ImplicitScheduler::set_scheduling_not_allowed`] and the plan reached a
    /// send point, even one with no messages.
    pub async fn dispatch(&self, plan: SchedulingPlan) -> SchedulingResult<SchedulingOutcome> {
        if plan.schedules {
            self.test_scheduling_allowed()?;
        }

        let SchedulingPlan {
            status,
            mut calendar,
            messages,
            log_items,
            originator,
            stamp_responses,
            suppress_refresh,
            ..
        } = plan;

        let options = DeliveryOptions {
            internal_request: true,
            suppress_refresh,
        };
        let target = if stamp_responses { calendar.as_mut() } else { None };
        self.deliver_all(&originator, &messages, options, target, false)
            .await;

        Ok(SchedulingOutcome {
            status,
            calendar,
            log_items,
        })
    }

    /// Deliver `messages` one at a time; returns how many went out.
    async fn deliver_all(
        &self,
        originator: &str,
        messages: &[PendingMessage],
        options: DeliveryOptions,
        mut stamp: Option<&mut Calendar>,
        refresh: bool,
    ) -> usize {
        for pending in messages {
            info!(
                method = %pending.method,
                originator,
                recipient = %pending.recipient,
                uid = ?pending.message.resource_uid(),
                rids = ?pending.rids,
                "Implicit scheduling message"
            );

            let name = match pending.method {
                Method::Request if refresh => itip_metrics::REFRESHES_TOTAL,
                Method::Request => itip_metrics::REQUESTS_TOTAL,
                Method::Cancel => itip_metrics::CANCELS_TOTAL,
                Method::Reply => itip_metrics::REPLIES_TOTAL,
            };
            counter!(name).increment(1);

            let recipients = [pending.recipient.clone()];
            let report = self
                .services
                .transport
                .deliver(originator, &recipients, &pending.message, options)
                .await;

            if let Some(calendar) = stamp.as_deref_mut() {
                apply_delivery_report(calendar, &report, pending.method.stamp_target());
            }
        }
        messages.len()
    }

    /// One CANCEL per attendee: whole-series when any of their cancelled
    /// instances is the master, otherwise for just those instances.
    pub(super) fn cancel_messages(
        &self,
        old: &Calendar,
        cancelled: &BTreeSet<InstanceKey>,
        organizer: &Principal,
        full_cancel: bool,
    ) -> Vec<PendingMessage> {
        let mut aggregated: BTreeMap<&str, BTreeSet<Rid>> = BTreeMap::new();
        for key in cancelled {
            aggregated
                .entry(key.attendee.as_str())
                .or_default()
                .insert(key.rid.clone());
        }

        let mut messages = Vec::new();
        for (attendee, rids) in aggregated {
            if organizer.has_address(attendee) {
                continue;
            }
            let recipients = [attendee.to_string()];
            let rids = (!rids.contains(&None)).then_some(rids);
            let message = match &rids {
                None => self.services.itip.generate_cancel(old, &recipients, None, full_cancel),
                Some(rids) => self.services.itip.generate_cancel(old, &recipients, Some(rids), false),
            };
            if let Some(message) = message {
                messages.push(PendingMessage {
                    method: Method::Cancel,
                    recipient: attendee.to_string(),
                    rids,
                    message,
                });
            }
        }
        messages
    }

    /// One REQUEST per attendee, skipping the organizer, anyone in `except`
    /// and, when `only` is given, anyone outside it.
    pub(super) fn request_messages(
        &self,
        calendar: &Calendar,
        attendees: &BTreeSet<String>,
        organizer: &Principal,
        except: &BTreeSet<String>,
        only: Option<&BTreeSet<String>>,
        changed_rids: Option<&BTreeSet<Rid>>,
    ) -> Vec<PendingMessage> {
        attendees
            .iter()
            .filter(|attendee| !organizer.has_address(attendee))
            .filter(|attendee| !contains_address(except, attendee))
            .filter(|attendee| only.is_none_or(|only| contains_address(only, attendee)))
            .filter_map(|attendee| {
                let recipients = [attendee.clone()];
                let message = self
                    .services
                    .itip
                    .generate_attendee_request(calendar, &recipients, changed_rids)?;
                Some(PendingMessage {
                    method: Method::Request,
                    recipient: attendee.clone(),
                    rids: changed_rids.cloned(),
                    message,
                })
            })
            .collect()
    }

    /// Send the stored organizer copy to its attendees again, e.g. after one
    /// of them replied.
    ///
    /// Attendees in `except` are skipped; with `only`, nobody outside it gets
    /// one. Nested refreshes triggered by those deliveries see
    /// [`Transaction::is_refreshing_attendees`](crate::scheduler::Transaction::is_refreshing_attendees).
    pub async fn refresh_all_attendees_except_some(
        &self,
        resource: &StoredResource,
        except: &BTreeSet<String>,
        only: Option<&BTreeSet<String>>,
    ) -> SchedulingResult<LogItems> {
        let mut calendar = resource.calendar.clone();
        let data = extract_calendar_data(self.services.directory.as_ref(), &self.home, &mut calendar)?;

        let organizer = data
            .organizer
            .clone()
            .ok_or_else(|| SchedulingError::InvalidData(format!("{} has no ORGANIZER", data.uid)))?;
        let organizer_principal = self
            .services
            .directory
            .principal_for_address(&organizer)
            .ok_or_else(|| {
                SchedulingError::InvalidData(format!("organizer {organizer} is not a known principal"))
            })?;

        // Replies from attendees that still have to answer should not cascade
        let suppress_refresh = calendar
            .all_attendee_properties()
            .any(|a| a.partstat() == "NEEDS-ACTION");

        let messages = self.request_messages(&calendar, &data.attendees, &organizer_principal, except, only, None);

        let count = {
            let _refreshing = self.transaction.begin_attendee_refresh();
            let options = DeliveryOptions {
                internal_request: true,
                suppress_refresh,
            };
            self.deliver_all(&organizer, &messages, options, None, true)
                .await
        };

        debug!(uid = %data.uid, count, "Refreshed attendees");
        Ok(LogItems {
            refreshes: (count > 0).then_some(count),
            ..LogItems::default()
        })
    }

    /// Send a REPLY for `attendee`'s copy of an event straight to the organizer.
    pub async fn send_attendee_reply(
        &self,
        calendar: &Calendar,
        attendee: &Principal,
    ) -> SchedulingResult<SchedulingOutcome> {
        self.test_scheduling_allowed()?;

        let mut calendar = calendar.clone();
        let data = extract_calendar_data(self.services.directory.as_ref(), &self.home, &mut calendar)?;
        let organizer = data
            .organizer
            .clone()
            .ok_or_else(|| SchedulingError::InvalidData(format!("{} has no ORGANIZER", data.uid)))?;

        let originator = self.services.directory.canonical_address(attendee);
        let address = data
            .attendees
            .iter()
            .find(|a| attendee.has_address(a))
            .cloned()
            .unwrap_or_else(|| originator.clone());

        let mut log_items = LogItems {
            reply: Some(ReplyKind::Reply),
            ..LogItems::default()
        };
        let messages: Vec<PendingMessage> = self
            .services
            .itip
            .generate_attendee_reply(&calendar, &address, None, false)
            .map(|message| PendingMessage {
                method: Method::Reply,
                recipient: organizer,
                rids: None,
                message,
            })
            .into_iter()
            .collect();
        if messages.is_empty() {
            log_items.reply = None;
        }

        let options = DeliveryOptions {
            internal_request: true,
            suppress_refresh: false,
        };
        self.deliver_all(&originator, &messages, options, Some(&mut calendar), false)
            .await;

        Ok(SchedulingOutcome {
            status: ReturnStatus::Ok,
            calendar: Some(calendar),
            log_items,
        })
    }
}
