//! iCalendar object model used by the scheduler.
//!
//! The scheduler needs to read and rewrite arbitrary properties and parameters
//! (PARTSTAT, RSVP, SCHEDULE-AGENT, SCHEDULE-STATUS, ...), so calendar data is
//! kept as a lossless property tree rather than a typed event struct.

mod generate;
mod parse;
mod recurrence;
mod time;

use std::collections::BTreeSet;
use std::fmt;

use chrono::Utc;
use tracing::debug;

use crate::address::{normalize_address, same_address};
use crate::error::{SchedulingError, SchedulingResult};

pub use generate::generate_ics;
pub use parse::parse_calendar;
pub use time::{InstanceTime, RecurrenceId, Rid};

pub const PRODUCT_ID: &str = "-//caldav-sched//Implicit Scheduling//EN";

/// Sub-components of VCALENDAR that never carry scheduling data.
const IGNORED_COMPONENTS: &[&str] = &["VTIMEZONE"];

/// A single content line: `NAME;PARAM=value:VALUE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub value: String,
    pub params: Vec<(String, String)>,
}

impl Property {
    pub fn new(name: &str, value: impl Into<String>) -> Self {
        Property {
            name: name.to_ascii_uppercase(),
            value: value.into(),
            params: Vec::new(),
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Upper-cased parameter value, or `default` when absent.
    pub fn param_upper(&self, key: &str, default: &str) -> String {
        self.param(key).unwrap_or(default).to_ascii_uppercase()
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.param(key).is_some()
    }

    pub fn set_param(&mut self, key: &str, value: &str) {
        match self
            .params
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some((_, v)) => *v = value.to_string(),
            None => self
                .params
                .push((key.to_ascii_uppercase(), value.to_string())),
        }
    }

    pub fn remove_param(&mut self, key: &str) -> bool {
        let before = self.params.len();
        self.params.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        before != self.params.len()
    }

    /// Whether a SCHEDULE-AGENT parameter (absent means SERVER) selects server scheduling.
    pub fn is_schedule_agent_server(&self) -> bool {
        self.param_upper("SCHEDULE-AGENT", "SERVER") == "SERVER"
    }

    pub fn partstat(&self) -> String {
        self.param_upper("PARTSTAT", "NEEDS-ACTION")
    }

    pub fn is_x_property(&self) -> bool {
        self.name.starts_with("X-")
    }
}

/// A VEVENT, VTODO, VALARM, VTIMEZONE, ... with its properties and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub name: String,
    pub properties: Vec<Property>,
    pub components: Vec<Component>,
}

impl Component {
    pub fn new(name: &str) -> Self {
        Component {
            name: name.to_ascii_uppercase(),
            properties: Vec::new(),
            components: Vec::new(),
        }
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn properties_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Property> {
        self.properties
            .iter()
            .filter(move |p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn property_value(&self, name: &str) -> Option<&str> {
        self.property(name).map(|p| p.value.as_str())
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.property(name).is_some()
    }

    pub fn add_property(&mut self, prop: Property) {
        self.properties.push(prop);
    }

    /// Replace every property of the same name with `prop`, keeping its position.
    pub fn replace_property(&mut self, prop: Property) {
        match self.properties.iter().position(|p| p.name == prop.name) {
            Some(pos) => {
                self.properties[pos] = prop.clone();
                let name = prop.name;
                let mut seen = false;
                self.properties.retain(|p| {
                    if p.name != name {
                        return true;
                    }
                    let keep = !seen;
                    seen = true;
                    keep
                });
            }
            None => self.properties.push(prop),
        }
    }

    pub fn remove_properties(&mut self, name: &str) {
        self.properties.retain(|p| !p.name.eq_ignore_ascii_case(name));
    }

    pub fn uid(&self) -> Option<&str> {
        self.property_value("UID")
    }

    pub fn recurrence_id(&self) -> Rid {
        self.property("RECURRENCE-ID")
            .and_then(InstanceTime::from_property)
            .map(|t| t.recurrence_id())
    }

    pub fn start(&self) -> Option<InstanceTime> {
        self.property("DTSTART").and_then(InstanceTime::from_property)
    }

    pub fn organizer_property(&self) -> Option<&Property> {
        self.property("ORGANIZER")
    }

    pub fn attendee_properties(&self) -> impl Iterator<Item = &Property> {
        self.properties_named("ATTENDEE")
    }

    pub fn attendee_properties_mut(&mut self) -> impl Iterator<Item = &mut Property> {
        self.properties
            .iter_mut()
            .filter(|p| p.name == "ATTENDEE")
    }

    /// The ATTENDEE property for `address`, if present.
    pub fn attendee(&self, address: &str) -> Option<&Property> {
        self.attendee_properties()
            .find(|p| same_address(&p.value, address))
    }

    pub fn exdates(&self) -> BTreeSet<RecurrenceId> {
        self.recurrence_set("EXDATE")
    }

    pub fn rdates(&self) -> BTreeSet<RecurrenceId> {
        self.recurrence_set("RDATE")
    }

    fn recurrence_set(&self, name: &str) -> BTreeSet<RecurrenceId> {
        self.properties_named(name)
            .flat_map(InstanceTime::from_property_values)
            .map(|t| t.recurrence_id())
            .collect()
    }

    pub fn sequence(&self) -> i64 {
        self.property_value("SEQUENCE")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn is_cancelled(&self) -> bool {
        self.property_value("STATUS")
            .is_some_and(|s| s.eq_ignore_ascii_case("CANCELLED"))
    }

    pub fn remove_alarms(&mut self) {
        self.components.retain(|c| c.name != "VALARM");
    }

    /// Set a parameter on every property named `prop_name` whose value matches `prop_value`
    /// (or on all of them when `prop_value` is `None`).
    pub fn set_parameter_for_property_with_value(
        &mut self,
        param: &str,
        value: &str,
        prop_name: &str,
        prop_value: Option<&str>,
    ) {
        for prop in self
            .properties
            .iter_mut()
            .filter(|p| p.name.eq_ignore_ascii_case(prop_name))
        {
            if prop_value.is_none_or(|v| same_address(&prop.value, v)) {
                prop.set_param(param, value);
            }
        }
    }
}

/// One server-managed attendee in one instance: the unit of CANCEL/REQUEST decisions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceKey {
    pub attendee: String,
    pub rid: Rid,
}

impl InstanceKey {
    pub fn new(attendee: impl Into<String>, rid: Rid) -> Self {
        InstanceKey {
            attendee: attendee.into(),
            rid,
        }
    }
}

/// A VCALENDAR object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Calendar {
    pub properties: Vec<Property>,
    pub components: Vec<Component>,
}

impl Calendar {
    /// An empty VCALENDAR with VERSION and PRODID set.
    pub fn new() -> Self {
        Calendar {
            properties: vec![
                Property::new("VERSION", "2.0"),
                Property::new("PRODID", PRODUCT_ID),
            ],
            components: Vec::new(),
        }
    }

    pub fn property_value(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_str())
    }

    pub fn replace_property(&mut self, prop: Property) {
        self.properties.retain(|p| p.name != prop.name);
        self.properties.push(prop);
    }

    /// Scheduling components (VEVENT/VTODO), skipping VTIMEZONE.
    pub fn main_components(&self) -> impl Iterator<Item = &Component> {
        self.components
            .iter()
            .filter(|c| !IGNORED_COMPONENTS.contains(&c.name.as_str()))
    }

    pub fn main_components_mut(&mut self) -> impl Iterator<Item = &mut Component> {
        self.components
            .iter_mut()
            .filter(|c| !IGNORED_COMPONENTS.contains(&c.name.as_str()))
    }

    /// VEVENT or VTODO, or `None` if no scheduling component is left.
    pub fn main_type(&self) -> Option<&str> {
        self.main_components().next().map(|c| c.name.as_str())
    }

    pub fn master(&self) -> Option<&Component> {
        self.main_components()
            .find(|c| !c.has_property("RECURRENCE-ID"))
    }

    pub fn master_mut(&mut self) -> Option<&mut Component> {
        self.main_components_mut()
            .find(|c| !c.has_property("RECURRENCE-ID"))
    }

    /// The component for `rid`; `None` selects the master.
    pub fn overridden(&self, rid: &Rid) -> Option<&Component> {
        match rid {
            None => self.master(),
            Some(_) => self
                .main_components()
                .find(|c| c.has_property("RECURRENCE-ID") && &c.recurrence_id() == rid),
        }
    }

    pub fn overridden_mut(&mut self, rid: &Rid) -> Option<&mut Component> {
        match rid {
            None => self.master_mut(),
            Some(_) => self
                .main_components_mut()
                .find(|c| c.has_property("RECURRENCE-ID") && &c.recurrence_id() == rid),
        }
    }

    /// Recurrence ids of every component present (master included as `None`).
    pub fn instances(&self) -> BTreeSet<Rid> {
        self.main_components().map(|c| c.recurrence_id()).collect()
    }

    pub fn resource_uid(&self) -> Option<&str> {
        self.main_components().find_map(|c| c.uid())
    }

    pub fn is_recurring(&self) -> bool {
        let master_recurs = self
            .master()
            .is_some_and(|m| m.has_property("RRULE") || m.has_property("RDATE"));
        master_recurs
            || self
                .main_components()
                .any(|c| c.has_property("RECURRENCE-ID"))
    }

    pub fn add_component(&mut self, component: Component) {
        self.components.push(component);
    }

    /// Validate that every component carries the same ORGANIZER and return it.
    ///
    /// Components missing the ORGANIZER while others have it get a copy of the
    /// organizer property.
    pub fn valid_organizer_for_scheduling(&mut self) -> SchedulingResult<Option<String>> {
        let mut found: Option<Property> = None;
        let mut missing = false;
        for component in self.main_components() {
            match component.organizer_property() {
                Some(prop) => match &found {
                    Some(existing) if !same_address(&existing.value, &prop.value) => {
                        return Err(SchedulingError::SingleOrganizer);
                    }
                    Some(_) => {}
                    None => found = Some(prop.clone()),
                },
                None => missing = true,
            }
        }

        if let (Some(organizer), true) = (&found, missing) {
            debug!("Fixing missing ORGANIZER properties");
            for component in self.main_components_mut() {
                if !component.has_property("ORGANIZER") {
                    component.add_property(organizer.clone());
                }
            }
        }

        Ok(found.map(|p| p.value))
    }

    /// Whether a single, consistent ORGANIZER exists.
    pub fn is_schedule_object(&self) -> bool {
        let mut organizers = self
            .main_components()
            .filter_map(|c| c.organizer_property())
            .map(|p| normalize_address(&p.value));
        match organizers.next() {
            Some(first) => organizers.all(|o| o == first),
            None => false,
        }
    }

    /// The ORGANIZER value, when all components agree on it.
    pub fn organizer(&self) -> Option<String> {
        let mut organizers = self
            .main_components()
            .filter_map(|c| c.organizer_property())
            .map(|p| p.value.clone());
        let first = organizers.next()?;
        organizers
            .all(|o| same_address(&o, &first))
            .then_some(first)
    }

    pub fn organizer_property(&self) -> Option<&Property> {
        self.main_components().find_map(|c| c.organizer_property())
    }

    /// True when the ORGANIZER has no SCHEDULE-AGENT or SCHEDULE-AGENT=SERVER.
    pub fn organizer_schedule_agent_is_server(&self) -> bool {
        self.organizer_property()
            .is_some_and(Property::is_schedule_agent_server)
    }

    /// Remove repeated ATTENDEE properties for the same address within a component.
    pub fn remove_duplicate_attendees(&mut self) {
        for component in self.main_components_mut() {
            let mut seen = BTreeSet::new();
            component.properties.retain(|p| {
                p.name != "ATTENDEE" || seen.insert(normalize_address(&p.value))
            });
        }
    }

    /// Every (attendee, instance) pair, optionally only SCHEDULE-AGENT=SERVER attendees.
    pub fn attendees_by_instance(&self, only_server: bool) -> BTreeSet<InstanceKey> {
        self.main_components()
            .flat_map(|c| {
                let rid = c.recurrence_id();
                c.attendee_properties()
                    .filter(move |p| !only_server || p.is_schedule_agent_server())
                    .map(move |p| InstanceKey::new(p.value.clone(), rid.clone()))
            })
            .collect()
    }

    pub fn all_attendee_properties(&self) -> impl Iterator<Item = &Property> {
        self.main_components().flat_map(|c| c.attendee_properties())
    }

    pub fn all_attendee_properties_mut(&mut self) -> impl Iterator<Item = &mut Property> {
        self.main_components_mut()
            .flat_map(|c| c.attendee_properties_mut())
    }

    /// All ATTENDEE properties (across components) for `address`.
    pub fn attendee_properties_for<'a>(&'a self, address: &'a str) -> impl Iterator<Item = &'a Property> {
        self.all_attendee_properties()
            .filter(move |p| same_address(&p.value, address))
    }

    pub fn set_parameter_for_property_with_value(
        &mut self,
        param: &str,
        value: &str,
        prop_name: &str,
        prop_value: Option<&str>,
    ) {
        for component in self.main_components_mut() {
            component.set_parameter_for_property_with_value(param, value, prop_name, prop_value);
        }
    }

    /// Whether every scheduling component has `name` set to `value`.
    pub fn has_property_value_in_all_components(&self, name: &str, value: &str) -> bool {
        self.main_components().all(|c| {
            c.property_value(name)
                .is_some_and(|v| v.eq_ignore_ascii_case(value))
        })
    }

    pub fn is_fully_cancelled(&self) -> bool {
        self.has_property_value_in_all_components("STATUS", "CANCELLED")
    }

    pub fn remove_alarms(&mut self) {
        for component in self.main_components_mut() {
            component.remove_alarms();
        }
    }

    pub fn replace_property_in_all_components(&mut self, prop: Property) {
        for component in self.main_components_mut() {
            component.replace_property(prop.clone());
        }
    }

    pub fn add_property_to_all_components(&mut self, prop: Property) {
        for component in self.main_components_mut() {
            component.add_property(prop.clone());
        }
    }

    /// Keep only the properties named in `keep` on each scheduling component.
    pub fn filter_properties(&mut self, keep: &[&str]) {
        for component in self.main_components_mut() {
            component
                .properties
                .retain(|p| keep.contains(&p.name.as_str()));
        }
    }

    /// Drop properties named in `remove` from each scheduling component.
    pub fn remove_properties(&mut self, remove: &[&str]) {
        for component in self.main_components_mut() {
            component
                .properties
                .retain(|p| !remove.contains(&p.name.as_str()));
        }
    }

    /// Remove X- properties from the VCALENDAR and, when `do_components`, from each component
    /// (except those listed in `keep`).
    pub fn remove_x_properties(&mut self, keep: &[&str], do_components: bool) {
        self.properties.retain(|p| !p.is_x_property());
        if do_components {
            for component in self.main_components_mut() {
                component
                    .properties
                    .retain(|p| !p.is_x_property() || keep.contains(&p.name.as_str()));
            }
        }
    }

    pub fn remove_property_parameters(&mut self, prop_name: &str, params: &[&str]) {
        for component in self.main_components_mut() {
            for prop in component
                .properties
                .iter_mut()
                .filter(|p| p.name == prop_name)
            {
                for param in params {
                    prop.remove_param(param);
                }
            }
        }
    }

    /// Remove every ATTENDEE except `address`.
    pub fn remove_all_but_one_attendee(&mut self, address: &str) {
        for component in self.main_components_mut() {
            component
                .properties
                .retain(|p| p.name != "ATTENDEE" || same_address(&p.value, address));
        }
    }

    /// Restrict the data to the components in which every one of `attendees` appears,
    /// EXDATE-ing removed overrides on a surviving master.
    pub fn attendees_view(&mut self, attendees: &[&str], only_server: bool) {
        let mut removed_rids = Vec::new();
        let mut removed_master = false;
        let mut has_master = false;

        self.components.retain(|component| {
            if IGNORED_COMPONENTS.contains(&component.name.as_str()) {
                return true;
            }
            let found_all = attendees.iter().all(|a| {
                component
                    .attendee(a)
                    .is_some_and(|p| !only_server || p.is_schedule_agent_server())
            });
            let rid = component.recurrence_id();
            if rid.is_none() {
                has_master = true;
                removed_master = !found_all;
            }
            if !found_all {
                if let Some(rid) = rid {
                    removed_rids.push(rid);
                }
            }
            found_all
        });

        if has_master && !removed_master {
            if let Some(master) = self.master_mut() {
                for rid in removed_rids {
                    let value = rid.to_instance_time();
                    master.add_property(value.to_property("EXDATE"));
                }
            }
        }
    }

    /// Keep only the components whose rid is in `rids`.
    ///
    /// `None` (or a set containing the master) keeps everything. Returns false when
    /// nothing is left.
    pub fn filter_components(&mut self, rids: Option<&BTreeSet<Rid>>) -> bool {
        let Some(rids) = rids else {
            return true;
        };
        if rids.is_empty() || rids.contains(&None) {
            return true;
        }
        self.components.retain(|c| {
            IGNORED_COMPONENTS.contains(&c.name.as_str()) || rids.contains(&c.recurrence_id())
        });
        self.main_type().is_some()
    }

    /// TZIDs referenced by any scheduling component property.
    pub fn timezone_ids(&self) -> BTreeSet<String> {
        self.main_components()
            .flat_map(|c| c.properties.iter())
            .filter_map(|p| p.param("TZID").map(str::to_string))
            .collect()
    }

    /// VTIMEZONE components for the given TZIDs.
    pub fn timezones_for<'a>(&'a self, tzids: &'a BTreeSet<String>) -> impl Iterator<Item = &'a Component> {
        self.components.iter().filter(move |c| {
            c.name == "VTIMEZONE" && c.property_value("TZID").is_some_and(|t| tzids.contains(t))
        })
    }

    fn max_sequence(&self) -> i64 {
        self.main_components()
            .map(Component::sequence)
            .max()
            .unwrap_or(0)
    }

    fn min_sequence(&self) -> i64 {
        self.main_components()
            .map(Component::sequence)
            .min()
            .unwrap_or(0)
    }

    /// Whether some component's SEQUENCE is not greater than its stored counterpart,
    /// i.e. the client did not bump SEQUENCE itself.
    pub fn needs_itip_sequence_change(&self, old: &Calendar) -> bool {
        self.main_components().any(|component| {
            let old_component = old
                .overridden(&component.recurrence_id())
                .or_else(|| old.master());
            match old_component {
                Some(old_component) => component.sequence() <= old_component.sequence(),
                None => false,
            }
        })
    }

    /// Refresh DTSTAMP everywhere and optionally bump SEQUENCE past the stored maximum.
    pub fn bump_itip_info(&mut self, old: Option<&Calendar>, do_sequence: bool) {
        if do_sequence {
            let next = old.unwrap_or(self).max_sequence() + 1;
            self.replace_property_in_all_components(Property::new("SEQUENCE", next.to_string()));
        }
        self.replace_property_in_all_components(Property::new("DTSTAMP", utc_now_stamp()));
    }

    /// Never let SEQUENCE go below what is stored.
    pub fn sequence_in_sync(&mut self, old: &Calendar) {
        let old_seq = old.max_sequence();
        if old_seq > 0 && self.min_sequence() < old_seq {
            self.replace_property_in_all_components(Property::new(
                "SEQUENCE",
                old_seq.to_string(),
            ));
        }
    }
}

impl fmt::Display for Calendar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&generate_ics(self))
    }
}

/// Current time as an iCalendar UTC date-time.
pub fn utc_now_stamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}
