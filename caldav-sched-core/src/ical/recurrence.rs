//! Recurrence checks and instance derivation.
//!
//! A recurrence-id is a valid instance of a master when it is the master's own
//! DTSTART, one of its RDATEs, or an RRULE occurrence, and is not EXDATE'd.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use rrule::RRuleSet;
use tracing::debug;

use crate::ical::{Calendar, Component, InstanceTime, RecurrenceId, Rid};

/// Properties that only make sense on a master component.
const RECURRENCE_PROPERTIES: &[&str] = &["RRULE", "RDATE", "EXRULE", "EXDATE", "RECURRENCE-ID"];

/// Build an iCalendar-format RRULE set string for the rrule crate parser.
fn build_rrule_string(start: &InstanceTime, master: &Component) -> String {
    let mut lines = Vec::new();

    // the rrule crate needs a datetime, so dates become midnight and floating becomes UTC
    let dtstart = match start {
        InstanceTime::Date(d) => format!("DTSTART:{}T000000Z", d.format("%Y%m%d")),
        InstanceTime::DateTimeUtc(dt) => format!("DTSTART:{}", dt.format("%Y%m%dT%H%M%SZ")),
        InstanceTime::DateTimeFloating(dt) => format!("DTSTART:{}Z", dt.format("%Y%m%dT%H%M%S")),
        InstanceTime::DateTimeZoned { datetime, tzid } => {
            format!("DTSTART;TZID={}:{}", tzid, datetime.format("%Y%m%dT%H%M%S"))
        }
    };
    lines.push(dtstart);

    for rrule in master.properties_named("RRULE") {
        lines.push(format!("RRULE:{}", rrule.value));
    }

    lines.join("\n")
}

/// The instant an rrule occurrence must land on for `rid` to match.
fn rid_instant(rid: &RecurrenceId) -> DateTime<Utc> {
    let time = rid.to_instance_time();
    time.to_utc().unwrap_or_else(|| time.naive_local().and_utc())
}

fn is_rrule_occurrence(master: &Component, start: &InstanceTime, rid: &RecurrenceId) -> bool {
    if !master.has_property("RRULE") {
        return false;
    }

    let rrule_str = build_rrule_string(start, master);
    let rrule_set: RRuleSet = match rrule_str.parse() {
        Ok(set) => set,
        Err(e) => {
            debug!(uid = ?master.uid(), error = %e, "Unparseable RRULE");
            return false;
        }
    };

    let tz: rrule::Tz = Utc.into();
    let target = rid_instant(rid);
    let after = (target - Duration::seconds(1)).with_timezone(&tz);
    let before = (target + Duration::seconds(1)).with_timezone(&tz);

    rrule_set
        .after(after)
        .before(before)
        .all(2)
        .dates
        .iter()
        .any(|occ| occurrence_to_instance_time(occ, start).recurrence_id() == *rid)
}

/// Convert an rrule occurrence back to an InstanceTime matching the master's form.
fn occurrence_to_instance_time(dt: &DateTime<rrule::Tz>, master_start: &InstanceTime) -> InstanceTime {
    match master_start {
        InstanceTime::Date(_) => InstanceTime::Date(dt.date_naive()),
        InstanceTime::DateTimeUtc(_) => InstanceTime::DateTimeUtc(dt.with_timezone(&Utc)),
        InstanceTime::DateTimeFloating(_) => InstanceTime::DateTimeFloating(dt.naive_utc()),
        InstanceTime::DateTimeZoned { tzid, .. } => InstanceTime::DateTimeZoned {
            datetime: dt.naive_local(),
            tzid: tzid.clone(),
        },
    }
}

impl Calendar {
    /// Whether `rid` names an instance the master generates.
    pub fn is_valid_instance(&self, rid: &RecurrenceId) -> bool {
        let Some(master) = self.master() else {
            return false;
        };
        let Some(start) = master.start() else {
            return false;
        };

        if master.exdates().contains(rid) {
            return false;
        }
        if master.rdates().contains(rid) || start.recurrence_id() == *rid {
            return true;
        }
        is_rrule_occurrence(master, &start, rid)
    }

    /// The subset of `rids` that exist: overridden, derivable, or the master itself.
    pub fn valid_instances(&self, rids: &BTreeSet<Rid>) -> BTreeSet<Rid> {
        rids.iter()
            .filter(|rid| match rid {
                None => self.master().is_some(),
                Some(r) => self.overridden(rid).is_some() || self.is_valid_instance(r),
            })
            .cloned()
            .collect()
    }

    /// Build the component for instance `rid` from the master.
    ///
    /// Returns `None` when there is no master or `rid` is not one of its instances.
    pub fn derive_instance(&self, rid: &RecurrenceId) -> Option<Component> {
        if !self.is_valid_instance(rid) {
            return None;
        }
        let master = self.master()?;
        let start = master.start()?;

        let mut instance = master.clone();
        instance
            .properties
            .retain(|p| !RECURRENCE_PROPERTIES.contains(&p.name.as_str()));

        let new_start = rid.to_instance_time().in_form_of(&start);
        for end_name in ["DTEND", "DUE"] {
            if let Some(end) = master.property(end_name).and_then(InstanceTime::from_property) {
                let new_end = new_start.shifted(start.duration_until(&end)).in_form_of(&end);
                instance.replace_property(new_end.to_property(end_name));
            }
        }
        instance.replace_property(new_start.to_property("DTSTART"));
        instance.add_property(new_start.to_property("RECURRENCE-ID"));

        Some(instance)
    }
}
