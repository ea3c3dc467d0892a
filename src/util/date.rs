//! Publication-date normalization.
//!
//! Feeds in the wild use a long tail of date spellings. [`parse_pub_date`]
//! tries a fixed list of layouts in priority order and returns the first
//! match as a UTC instant truncated to whole seconds.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, SubsecRound, TimeZone, Utc};
use thiserror::Error;

/// A date string none of the known layouts could read.
///
/// Carries the original, untrimmed input. During ingestion this only ever
/// causes the offending item to be skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unable to parse date: {input:?}")]
pub struct DateParseError {
    pub input: String,
}

/// Where the zone information lives in a layout.
#[derive(Debug, Clone, Copy)]
enum Zone {
    /// Numeric offset read by `%z` (`-0700`, `+02:00`)
    Numeric,
    /// Trailing abbreviation (`GMT`, `PST`, ...)
    Named,
    /// No zone at all; taken as UTC
    Absent,
    /// RFC 3339: `Z` or `±hh:mm`, optional fractional seconds
    Rfc3339,
}

#[derive(Debug)]
struct Layout {
    format: &'static str,
    /// Layout begins with `"<weekday>, "`
    weekday: bool,
    zone: Zone,
}

const LAYOUTS: &[Layout] = &[
    // RFC 1123, numeric offset: "Mon, 02 Jan 2006 15:04:05 -0700"
    Layout { format: "%d %b %Y %H:%M:%S %z", weekday: true, zone: Zone::Numeric },
    // RFC 1123, zone name: "Mon, 02 Jan 2006 15:04:05 MST"
    Layout { format: "%d %b %Y %H:%M:%S", weekday: true, zone: Zone::Named },
    // RFC 822, numeric offset: "02 Jan 06 15:04 -0700"
    Layout { format: "%d %b %y %H:%M %z", weekday: false, zone: Zone::Numeric },
    // RFC 822, zone name: "02 Jan 06 15:04 MST"
    Layout { format: "%d %b %y %H:%M", weekday: false, zone: Zone::Named },
    // ISO 8601 with offset: "2006-01-02T15:04:05Z", "2006-01-02T15:04:05+07:00"
    Layout { format: "", weekday: false, zone: Zone::Rfc3339 },
    // ISO 8601 without offset: "2006-01-02T15:04:05"
    Layout { format: "%Y-%m-%dT%H:%M:%S", weekday: false, zone: Zone::Absent },
    // "Mon, 02 Jan 2006 15:04:05"
    Layout { format: "%d %b %Y %H:%M:%S", weekday: true, zone: Zone::Absent },
    // "2 Jan 2006 15:04:05 MST"
    Layout { format: "%d %b %Y %H:%M:%S", weekday: false, zone: Zone::Named },
    // "2 Jan 2006 15:04:05 -0700"
    Layout { format: "%d %b %Y %H:%M:%S %z", weekday: false, zone: Zone::Numeric },
    // "2006-01-02 15:04:05"
    Layout { format: "%Y-%m-%d %H:%M:%S", weekday: false, zone: Zone::Absent },
    // "January 2, 2006 15:04:05"
    Layout { format: "%B %d, %Y %H:%M:%S", weekday: false, zone: Zone::Absent },
];

const WEEKDAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

/// Parses a feed publication date into a canonical UTC instant.
///
/// The trimmed input is tried against every known layout in priority order.
/// If none matches, commas are removed and `GMT` is rewritten to `UTC`, and
/// the list is tried once more.
///
/// Weekday names are accepted without checking them against the date, and
/// zone abbreviations outside RFC 822's set are read as UTC.
///
/// # Examples
///
/// ```
/// use feedkeep::util::parse_pub_date;
///
/// let instant = parse_pub_date("Mon, 02 Jan 2006 15:04:05 -0700").unwrap();
/// assert_eq!(instant.to_rfc3339(), "2006-01-02T22:04:05+00:00");
/// assert!(parse_pub_date("not a date").is_err());
/// ```
pub fn parse_pub_date(input: &str) -> Result<DateTime<Utc>, DateParseError> {
    let trimmed = input.trim();

    if let Some(instant) = try_layouts(trimmed) {
        return Ok(instant);
    }

    let repaired = trimmed.replace(',', "").replace("GMT", "UTC");
    if let Some(instant) = try_layouts(&repaired) {
        return Ok(instant);
    }

    Err(DateParseError {
        input: input.to_string(),
    })
}

/// Parses a `YYYY-MM-DD` calendar date, as used for search bounds.
pub fn parse_calendar_date(input: &str) -> Result<NaiveDate, DateParseError> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").map_err(|_| DateParseError {
        input: input.to_string(),
    })
}

/// First instant (00:00:00 UTC) of a calendar day.
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Last whole second (23:59:59 UTC) of a calendar day.
pub fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    start_of_day(date) + Duration::days(1) - Duration::seconds(1)
}

fn try_layouts(text: &str) -> Option<DateTime<Utc>> {
    LAYOUTS
        .iter()
        .find_map(|layout| parse_with(layout, text))
        .map(|instant| instant.trunc_subsecs(0))
}

fn parse_with(layout: &Layout, text: &str) -> Option<DateTime<Utc>> {
    let text = if layout.weekday {
        strip_weekday(text)?
    } else {
        text
    };

    match layout.zone {
        Zone::Rfc3339 => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Zone::Numeric => DateTime::parse_from_str(text, layout.format)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Zone::Absent => NaiveDateTime::parse_from_str(text, layout.format)
            .ok()
            .map(|naive| naive.and_utc()),
        Zone::Named => {
            let (body, zone) = text.rsplit_once(char::is_whitespace)?;
            let offset = zone_offset(zone)?;
            let naive = NaiveDateTime::parse_from_str(body.trim_end(), layout.format).ok()?;
            offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
        }
    }
}

/// Removes a leading `"<weekday>,"`, returning the remainder.
fn strip_weekday(text: &str) -> Option<&str> {
    let (day, rest) = text.split_once(',')?;
    let day = day.trim().to_ascii_lowercase();
    let known = day.len() >= 3 && WEEKDAYS.iter().any(|w| w.starts_with(day.as_str()));
    known.then(|| rest.trim_start())
}

/// Offset for an RFC 822 zone name.
///
/// Any other all-uppercase abbreviation of 3 to 5 letters is read as UTC,
/// since abbreviations are ambiguous across regions.
fn zone_offset(name: &str) -> Option<FixedOffset> {
    let hours = match name {
        "UT" | "UTC" | "GMT" | "Z" => 0,
        "EST" => -5,
        "EDT" => -4,
        "CST" => -6,
        "CDT" => -5,
        "MST" => -7,
        "MDT" => -6,
        "PST" => -8,
        "PDT" => -7,
        other if (3..=5).contains(&other.len()) && other.bytes().all(|b| b.is_ascii_uppercase()) => 0,
        _ => return None,
    };
    FixedOffset::east_opt(hours * 3600)
}
