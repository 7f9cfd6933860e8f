//! Deciding what a write means for scheduling.

use tracing::{debug, error};

use crate::error::{SchedulingError, SchedulingResult};
use crate::ical::Calendar;
use crate::scheduler::extract::{Extracted, check_implicit_state};
use crate::scheduler::{
    ActionKind, Classification, ImplicitScheduler, Operation, ResourceType, SchedulingState, StoredResource,
    record_rejection,
};

impl ImplicitScheduler {
    /// Classify a PUT of `calendar`, replacing `resource` when it exists.
    ///
    /// Validation failures are returned as [`SchedulingError`]s carrying the
    /// CalDAV precondition that was violated.
    pub async fn classify_put(
        &mut self,
        resource: Option<StoredResource>,
        calendar: Calendar,
        internal_request: bool,
    ) -> SchedulingResult<Classification> {
        self.classify_put_inner(resource, calendar, internal_request)
            .await
            .map_err(record_rejection)
    }

    async fn classify_put_inner(
        &mut self,
        mut resource: Option<StoredResource>,
        mut calendar: Calendar,
        internal_request: bool,
    ) -> SchedulingResult<Classification> {
        let directory = self.services.directory.clone();

        let mut existing_is_schedule = resource.as_ref().is_some_and(StoredResource::is_schedule_object);
        let mut data = check_implicit_state(directory.as_ref(), &self.home, &mut calendar)?;
        let new_is_schedule = data.state.is_scheduling();

        // The cached flag may have been computed by older rules
        if existing_is_schedule != new_is_schedule {
            if let Some(resource) = resource.as_mut() {
                resource.schedule_object = None;
                existing_is_schedule = resource.is_schedule_object();
            }
        }

        let existing_type = ResourceType::from_flag(existing_is_schedule);
        let new_type = ResourceType::from_flag(new_is_schedule);
        let action = ActionKind::from_types(existing_type, new_type);

        if resource.is_none() || action == ActionKind::Create {
            self.check_uid_elsewhere(resource.as_ref(), &data.uid, internal_request, action)
                .await?;
        }

        // Removing scheduling works on what was stored; the written data is what gets persisted
        let mut return_calendar = None;
        if action == ActionKind::Remove {
            if let Some(stored) = &resource {
                return_calendar = Some(std::mem::replace(&mut calendar, stored.calendar.clone()));
                data = check_implicit_state(directory.as_ref(), &self.home, &mut calendar)?;
            }
        }

        check_valid_organizer(action, &data)?;

        if !internal_request
            && data.state == SchedulingState::Attendee
            && existing_type != new_type
            && resource.is_some()
        {
            return Err(SchedulingError::attendee_change("Cannot change scheduling object mode"));
        }

        if data.state == SchedulingState::Organizer && calendar.master().is_none() {
            return Err(SchedulingError::organizer_allowed(
                "Organizer cannot schedule without a master component.",
            ));
        }

        debug!(uid = %data.uid, state = %data.state, action = %action, "Classified write");
        self.operation = Some(Operation {
            action,
            internal_request,
            resource,
            calendar,
            return_calendar,
            data,
        });

        Ok(Classification {
            scheduling: action != ActionKind::None,
            schedule_object: new_is_schedule,
        })
    }

    /// Classify the DELETE of `resource`.
    pub fn classify_delete(
        &mut self,
        resource: StoredResource,
        internal_request: bool,
    ) -> SchedulingResult<Classification> {
        let mut calendar = resource.calendar.clone();
        let data = check_implicit_state(self.services.directory.as_ref(), &self.home, &mut calendar)
            .map_err(record_rejection)?;

        let action = if resource.is_schedule_object() {
            ActionKind::Remove
        } else {
            ActionKind::None
        };

        self.operation = Some(Operation {
            action,
            internal_request,
            resource: Some(resource),
            calendar,
            return_calendar: None,
            data,
        });

        Ok(Classification {
            scheduling: action != ActionKind::None,
            schedule_object: false,
        })
    }

    /// Whether the owner is an attendee (listed or not) of the stored scheduling object.
    pub fn test_attendee_event(&self, resource: &StoredResource) -> SchedulingResult<bool> {
        if !resource.is_schedule_object() {
            return Ok(false);
        }
        let mut calendar = resource.calendar.clone();
        let data = check_implicit_state(self.services.directory.as_ref(), &self.home, &mut calendar)?;
        Ok(matches!(
            data.state,
            SchedulingState::Attendee | SchedulingState::AttendeeMissing
        ))
    }

    async fn check_uid_elsewhere(
        &self,
        resource: Option<&StoredResource>,
        uid: &str,
        internal_request: bool,
        action: ActionKind,
    ) -> SchedulingResult<()> {
        if internal_request || action == ActionKind::Remove {
            return Ok(());
        }

        let found = self
            .services
            .store
            .has_uid_elsewhere(&self.home.uid, uid, resource.map(|r| r.name.as_str()))
            .await?;
        if found {
            debug!(uid, resource = ?resource.map(|r| &r.name), "Implicit - found component with same UID in a different resource");
            return Err(SchedulingError::UniqueSchedulingObjectResource);
        }
        Ok(())
    }
}

/// Only principals enabled as organizers may create meetings.
fn check_valid_organizer(action: ActionKind, data: &Extracted) -> SchedulingResult<()> {
    if action != ActionKind::Create {
        return Ok(());
    }
    match data.organizer_principal() {
        Some(principal) if !principal.enabled_as_organizer => {
            error!(organizer = ?data.organizer, "ORGANIZER not allowed to be an Organizer");
            Err(SchedulingError::organizer_allowed("Organizer cannot schedule"))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use crate::error::SchedulingError;
    use crate::ical::Calendar;
    use crate::scheduler::testing::{Harness, calendar};
    use crate::scheduler::{ActionKind, SchedulingState, StoredResource};

    fn meeting(organizer: &str) -> Calendar {
        calendar(&format!(
            "BEGIN:VEVENT\nUID:classify-1\nDTSTAMP:20250101T000000Z\nDTSTART:20250106T100000Z\n\
ORGANIZER:{organizer}\nATTENDEE;PARTSTAT=ACCEPTED:{organizer}\n\
ATTENDEE:mailto:a1@example.com\nEND:VEVENT\n"
        ))
    }

    fn plain() -> Calendar {
        calendar("BEGIN:VEVENT\nUID:classify-1\nDTSTAMP:20250101T000000Z\nDTSTART:20250106T100000Z\nEND:VEVENT\n")
    }

    #[tokio::test]
    async fn test_duplicate_uid_rejected_unless_internal() {
        let harness = Harness::new();
        harness.stored("organizer", "first.ics", &meeting("mailto:organizer@example.com"));

        let mut scheduler = harness.scheduler("organizer");
        let err = scheduler
            .classify_put(None, meeting("mailto:organizer@example.com"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulingError::UniqueSchedulingObjectResource));

        let classification = scheduler
            .classify_put(None, meeting("mailto:organizer@example.com"), true)
            .await
            .unwrap();
        assert!(classification.scheduling);
    }

    #[tokio::test]
    async fn test_rewriting_same_resource_keeps_uid() {
        let harness = Harness::new();
        let stored = harness.stored("organizer", "first.ics", &plain());

        let mut scheduler = harness.scheduler("organizer");
        let classification = scheduler
            .classify_put(Some(stored), meeting("mailto:organizer@example.com"), false)
            .await
            .unwrap();
        assert_eq!(scheduler.action(), ActionKind::Create);
        assert!(classification.schedule_object);
    }

    #[tokio::test]
    async fn test_disabled_organizer_cannot_create() {
        let harness = Harness::new();
        let mut scheduler = harness.scheduler("intern");

        let err = scheduler
            .classify_put(None, meeting("mailto:intern@example.com"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulingError::OrganizerAllowed(ref m) if m == "Organizer cannot schedule"));
    }

    #[tokio::test]
    async fn test_organizer_needs_master() {
        let harness = Harness::new();
        let mut scheduler = harness.scheduler("organizer");
        let override_only = calendar(
            "BEGIN:VEVENT\nUID:classify-2\nRECURRENCE-ID:20250113T100000Z\nDTSTART:20250113T100000Z\n\
ORGANIZER:mailto:organizer@example.com\nATTENDEE:mailto:a1@example.com\nEND:VEVENT\n",
        );

        let err = scheduler.classify_put(None, override_only, false).await.unwrap_err();
        assert!(matches!(err, SchedulingError::OrganizerAllowed(_)));
    }

    #[tokio::test]
    async fn test_conflicting_organizers_rejected() {
        let harness = Harness::new();
        let mut scheduler = harness.scheduler("organizer");
        let conflicting = calendar(
            "BEGIN:VEVENT\nUID:classify-3\nDTSTART:20250106T100000Z\nRRULE:FREQ=DAILY\n\
ORGANIZER:mailto:organizer@example.com\nEND:VEVENT\n\
BEGIN:VEVENT\nUID:classify-3\nRECURRENCE-ID:20250107T100000Z\nDTSTART:20250107T100000Z\n\
ORGANIZER:mailto:a2@example.com\nEND:VEVENT\n",
        );

        let err = scheduler.classify_put(None, conflicting, false).await.unwrap_err();
        assert!(matches!(err, SchedulingError::SingleOrganizer));
    }

    #[tokio::test]
    async fn test_attendee_cannot_turn_event_into_invite() {
        let harness = Harness::new();
        let stored = harness.stored("attendee1", "invite.ics", &plain());

        let mut scheduler = harness.scheduler("attendee1");
        let err = scheduler
            .classify_put(Some(stored), meeting("mailto:organizer@example.com"), false)
            .await
            .unwrap_err();
        assert!(
            matches!(err, SchedulingError::ValidAttendeeChange(ref m) if m == "Cannot change scheduling object mode")
        );
    }

    #[tokio::test]
    async fn test_dropping_organizer_removes_scheduling() {
        let harness = Harness::new();
        let stored = harness.stored("organizer", "first.ics", &meeting("mailto:organizer@example.com"));

        let mut scheduler = harness.scheduler("organizer");
        let classification = scheduler.classify_put(Some(stored), plain(), false).await.unwrap();
        assert!(classification.scheduling);
        assert!(!classification.schedule_object);
        assert_eq!(scheduler.action(), ActionKind::Remove);
        assert_eq!(scheduler.state(), SchedulingState::Organizer);

        let outcome = scheduler.run(false).await.unwrap();
        assert_eq!(outcome.calendar.and_then(|c| c.organizer()), None);
        let deliveries = harness.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].method().as_deref(), Some("CANCEL"));
    }

    #[tokio::test]
    async fn test_plain_delete_does_not_schedule() {
        let harness = Harness::new();
        let stored = harness.stored("organizer", "first.ics", &plain());

        let mut scheduler = harness.scheduler("organizer");
        let classification = scheduler.classify_delete(stored, false).unwrap();
        assert!(!classification.scheduling);
        assert!(scheduler.run(false).await.unwrap().calendar.is_none());
    }

    #[test]
    fn test_attendee_event_detection() {
        let harness = Harness::new();
        let invite = StoredResource::new("invite.ics", meeting("mailto:organizer@example.com"));

        assert!(harness.scheduler("attendee1").test_attendee_event(&invite).unwrap());
        assert!(!harness.scheduler("organizer").test_attendee_event(&invite).unwrap());
        let plain = StoredResource::new("plain.ics", plain());
        assert!(!harness.scheduler("attendee1").test_attendee_event(&plain).unwrap());
    }
}
