//! Date-time values as they appear in DTSTART, RECURRENCE-ID, EXDATE and RDATE.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::ical::Property;

const DATE_FORMAT: &str = "%Y%m%d";
const DATETIME_FORMAT: &str = "%Y%m%dT%H%M%S";
const UTC_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// A date or date-time value, preserving how it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceTime {
    Date(NaiveDate),
    DateTimeUtc(DateTime<Utc>),
    DateTimeFloating(NaiveDateTime),
    DateTimeZoned {
        datetime: NaiveDateTime,
        tzid: String,
    },
}

impl InstanceTime {
    /// Parse the (single) value of a DTSTART/DTEND/RECURRENCE-ID style property.
    pub fn from_property(prop: &Property) -> Option<Self> {
        Self::from_property_values(prop).into_iter().next()
    }

    /// Parse every value of a possibly comma-separated property such as EXDATE.
    ///
    /// Handles:
    /// - TZID parameter: `EXDATE;TZID=America/New_York:20240108T100000`
    /// - VALUE=DATE: `EXDATE;VALUE=DATE:20240108`
    /// - UTC: `EXDATE:20240108T100000Z`
    /// - Floating: `EXDATE:20240108T100000`
    pub fn from_property_values(prop: &Property) -> Vec<Self> {
        let tzid = prop.param("TZID");
        let is_date = prop
            .param("VALUE")
            .is_some_and(|v| v.eq_ignore_ascii_case("DATE"));

        prop.value
            .split(',')
            .filter_map(|s| parse_value(s.trim(), tzid, is_date))
            .collect()
    }

    /// Absolute instant, if the value has one.
    ///
    /// Floating values are read as UTC; an unknown TZID falls back to UTC too.
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            InstanceTime::Date(_) => None,
            InstanceTime::DateTimeUtc(dt) => Some(*dt),
            InstanceTime::DateTimeFloating(dt) => Some(dt.and_utc()),
            InstanceTime::DateTimeZoned { datetime, tzid } => match tzid.parse::<chrono_tz::Tz>()
            {
                Ok(tz) => tz
                    .from_local_datetime(datetime)
                    .earliest()
                    .map(|dt| dt.with_timezone(&Utc)),
                Err(_) => Some(datetime.and_utc()),
            },
        }
    }

    pub fn is_date(&self) -> bool {
        matches!(self, InstanceTime::Date(_))
    }

    /// The canonical key used to match overrides, EXDATEs and RDATEs.
    pub fn recurrence_id(&self) -> RecurrenceId {
        match self {
            InstanceTime::Date(d) => RecurrenceId(d.format(DATE_FORMAT).to_string()),
            InstanceTime::DateTimeFloating(dt) => {
                RecurrenceId(dt.format(DATETIME_FORMAT).to_string())
            }
            InstanceTime::DateTimeUtc(_) | InstanceTime::DateTimeZoned { .. } => {
                let utc = self.to_utc().unwrap_or_default();
                RecurrenceId(utc.format(UTC_FORMAT).to_string())
            }
        }
    }

    /// Re-express this value in the same form (date, UTC, floating or zoned) as `template`.
    pub fn in_form_of(&self, template: &InstanceTime) -> InstanceTime {
        match template {
            InstanceTime::Date(_) => InstanceTime::Date(self.naive_local().date()),
            InstanceTime::DateTimeUtc(_) => {
                InstanceTime::DateTimeUtc(self.to_utc().unwrap_or_else(|| self.naive_local().and_utc()))
            }
            InstanceTime::DateTimeFloating(_) => InstanceTime::DateTimeFloating(self.naive_local()),
            InstanceTime::DateTimeZoned { tzid, .. } => {
                let datetime = match (self.to_utc(), tzid.parse::<chrono_tz::Tz>()) {
                    (Some(utc), Ok(tz)) => utc.with_timezone(&tz).naive_local(),
                    _ => self.naive_local(),
                };
                InstanceTime::DateTimeZoned {
                    datetime,
                    tzid: tzid.clone(),
                }
            }
        }
    }

    /// Wall-clock value, ignoring any zone.
    pub fn naive_local(&self) -> NaiveDateTime {
        match self {
            InstanceTime::Date(d) => d.and_hms_opt(0, 0, 0).unwrap_or_default(),
            InstanceTime::DateTimeUtc(dt) => dt.naive_utc(),
            InstanceTime::DateTimeFloating(dt) => *dt,
            InstanceTime::DateTimeZoned { datetime, .. } => *datetime,
        }
    }

    /// Elapsed wall-clock time from `self` to `end`.
    pub fn duration_until(&self, end: &InstanceTime) -> Duration {
        end.naive_local() - self.naive_local()
    }

    /// Shift by `duration`, keeping the same form.
    pub fn shifted(&self, duration: Duration) -> InstanceTime {
        match self {
            InstanceTime::Date(d) => InstanceTime::Date(*d + Duration::days(duration.num_days())),
            InstanceTime::DateTimeUtc(dt) => InstanceTime::DateTimeUtc(*dt + duration),
            InstanceTime::DateTimeFloating(dt) => InstanceTime::DateTimeFloating(*dt + duration),
            InstanceTime::DateTimeZoned { datetime, tzid } => InstanceTime::DateTimeZoned {
                datetime: *datetime + duration,
                tzid: tzid.clone(),
            },
        }
    }

    /// The raw iCalendar text of the value (without parameters).
    pub fn to_ics_value(&self) -> String {
        match self {
            InstanceTime::Date(d) => d.format(DATE_FORMAT).to_string(),
            InstanceTime::DateTimeUtc(dt) => dt.format(UTC_FORMAT).to_string(),
            InstanceTime::DateTimeFloating(dt) => dt.format(DATETIME_FORMAT).to_string(),
            InstanceTime::DateTimeZoned { datetime, .. } => {
                datetime.format(DATETIME_FORMAT).to_string()
            }
        }
    }

    /// Build a property carrying this value with the matching VALUE/TZID parameters.
    pub fn to_property(&self, name: &str) -> Property {
        let mut prop = Property::new(name, self.to_ics_value());
        match self {
            InstanceTime::Date(_) => prop.set_param("VALUE", "DATE"),
            InstanceTime::DateTimeZoned { tzid, .. } => prop.set_param("TZID", tzid),
            _ => {}
        }
        prop
    }
}

impl fmt::Display for InstanceTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceTime::Date(d) => write!(f, "{}", d),
            InstanceTime::DateTimeUtc(dt) => write!(f, "{}", dt),
            InstanceTime::DateTimeFloating(dt) => write!(f, "{}", dt),
            InstanceTime::DateTimeZoned { datetime, tzid } => write!(f, "{} {}", datetime, tzid),
        }
    }
}

fn parse_value(s: &str, tzid: Option<&str>, is_date: bool) -> Option<InstanceTime> {
    if s.is_empty() {
        return None;
    }
    if is_date || s.len() == 8 {
        return NaiveDate::parse_from_str(s, DATE_FORMAT)
            .ok()
            .map(InstanceTime::Date);
    }
    if let Some(stripped) = s.strip_suffix('Z') {
        return NaiveDateTime::parse_from_str(stripped, DATETIME_FORMAT)
            .ok()
            .map(|dt| InstanceTime::DateTimeUtc(dt.and_utc()));
    }
    let naive = NaiveDateTime::parse_from_str(s, DATETIME_FORMAT).ok()?;
    Some(match tzid {
        Some(tz) => InstanceTime::DateTimeZoned {
            datetime: naive,
            tzid: tz.to_string(),
        },
        None => InstanceTime::DateTimeFloating(naive),
    })
}

/// Canonical RECURRENCE-ID key.
///
/// Date-times with an absolute instant are normalized to UTC
/// (`20240108T150000Z`), all-day values keep `YYYYMMDD`, floating values keep
/// their wall-clock text. Ordering is chronological within one form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecurrenceId(String);

impl RecurrenceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a canonical key (or any single iCalendar date/date-time text).
    pub fn parse(s: &str) -> Option<Self> {
        parse_value(s, None, false).map(|t| t.recurrence_id())
    }

    /// The key as a date/date-time value.
    pub fn to_instance_time(&self) -> InstanceTime {
        parse_value(&self.0, None, false)
            .unwrap_or(InstanceTime::DateTimeFloating(NaiveDateTime::default()))
    }
}

impl fmt::Display for RecurrenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A recurrence-id slot: `None` is the master (the whole series).
pub type Rid = Option<RecurrenceId>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zoned_value_normalizes_to_utc_key() {
        let mut prop = Property::new("RECURRENCE-ID", "20240108T100000");
        prop.set_param("TZID", "America/New_York");

        let time = InstanceTime::from_property(&prop).unwrap();
        assert_eq!(time.recurrence_id().as_str(), "20240108T150000Z");
    }

    #[test]
    fn test_exdate_list_with_value_date() {
        let mut prop = Property::new("EXDATE", "20240108,20240115");
        prop.set_param("VALUE", "DATE");

        let values = InstanceTime::from_property_values(&prop);
        assert_eq!(values.len(), 2);
        assert!(values.iter().all(InstanceTime::is_date));
        assert_eq!(values[1].recurrence_id().as_str(), "20240115");
    }

    #[test]
    fn test_in_form_of_zoned_template() {
        let rid = RecurrenceId::parse("20240115T150000Z").unwrap();
        let template = InstanceTime::DateTimeZoned {
            datetime: NaiveDateTime::parse_from_str("20240101T100000", DATETIME_FORMAT).unwrap(),
            tzid: "America/New_York".to_string(),
        };

        let local = rid.to_instance_time().in_form_of(&template);
        assert_eq!(local.to_ics_value(), "20240115T100000");
        assert_eq!(local.recurrence_id(), rid);
    }

    #[test]
    fn test_shifted_keeps_form() {
        let start = RecurrenceId::parse("20240101T100000Z").unwrap().to_instance_time();
        let end = start.shifted(Duration::minutes(90));
        assert_eq!(end.to_ics_value(), "20240101T113000Z");
        assert_eq!(start.duration_until(&end), Duration::minutes(90));
    }
}
