//! Operating-hours domain model, availability engine, and status facade.
//!
//! All schedule times are wall-clock values in the vendor's IANA zone. This
//! crate is the only place wall-clock <-> instant conversion happens, and the
//! conversion always uses the zone's rules at the queried instant's date, so
//! DST transitions resolve correctly.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sporkd-core";

/// Days scanned past tomorrow before a vendor with no upcoming hours is
/// reported with null boundaries.
pub const LOOKAHEAD_DAYS: i64 = 14;

pub const DAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

/// Wall-clock times serialize as "HH:MM", the format the rest of the platform
/// stores and displays.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S>(value: &Option<NaiveTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(time) => serializer.serialize_some(&time.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| NaiveTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// One continuous open interval on one weekday, local wall-clock.
///
/// `end_local` numerically less than `start_local` denotes an interval that
/// crosses midnight into the following calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyRule {
    /// 0 = Monday ... 6 = Sunday.
    pub day_of_week: u8,
    /// A closed row on a day closes the whole day regardless of other rows.
    #[serde(default)]
    pub is_closed: bool,
    #[serde(with = "hhmm", default)]
    pub start_local: Option<NaiveTime>,
    #[serde(with = "hhmm", default)]
    pub end_local: Option<NaiveTime>,
    /// Display order for multiple disjoint intervals on the same day.
    #[serde(default)]
    pub interval_index: u32,
}

/// Full override for one calendar date; takes precedence over every
/// `WeeklyRule` on that date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionDate {
    pub date: NaiveDate,
    #[serde(default)]
    pub is_closed: bool,
    #[serde(with = "hhmm", default)]
    pub start_local: Option<NaiveTime>,
    #[serde(with = "hhmm", default)]
    pub end_local: Option<NaiveTime>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Per-vendor schedule aggregate. The engine never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorSchedule {
    pub timezone: Tz,
    #[serde(default)]
    pub weekly: Vec<WeeklyRule>,
    #[serde(default)]
    pub exceptions: BTreeMap<NaiveDate, ExceptionDate>,
}

impl VendorSchedule {
    pub fn new(timezone: Tz) -> Self {
        Self {
            timezone,
            weekly: Vec::new(),
            exceptions: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveSource {
    Weekly,
    Exception,
    None,
}

/// Engine output for one `(schedule, instant)` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedStatus {
    pub is_open: bool,
    /// When the current open/closed state ends. Null when the vendor has no
    /// upcoming hours inside the lookahead horizon.
    pub current_boundary: Option<DateTime<Utc>>,
    /// While open: when the vendor next reopens after closing. While closed:
    /// when the upcoming open window ends.
    pub next_boundary: Option<DateTime<Utc>>,
    pub active_source: ActiveSource,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid weekly schedule: {0}")]
    Validation(String),
    #[error("an exception already exists for {0}")]
    Conflict(NaiveDate),
    #[error("vendor {0} has no schedule")]
    VendorNotFound(Uuid),
    #[error("no exception recorded for {0}")]
    ExceptionNotFound(NaiveDate),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unknown IANA time zone: {0}")]
    UnknownTimeZone(String),
}

fn minutes_since_midnight(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

/// Structural validation applied before a weekly schedule is accepted.
///
/// Checks weekday range, presence of start/end on non-closed rows, duplicate
/// `interval_index` per day, and per-day overlap (midnight-crossing intervals
/// are expanded past 24:00 before comparison).
pub fn validate_weekly(rules: &[WeeklyRule]) -> Result<(), ScheduleError> {
    let mut seen_index: HashSet<(u8, u32)> = HashSet::new();
    let mut by_day: BTreeMap<u8, Vec<(u32, u32, u32)>> = BTreeMap::new();

    for rule in rules {
        if rule.day_of_week > 6 {
            return Err(ScheduleError::Validation(format!(
                "day_of_week {} out of range 0-6",
                rule.day_of_week
            )));
        }
        if !seen_index.insert((rule.day_of_week, rule.interval_index)) {
            return Err(ScheduleError::Validation(format!(
                "duplicate interval_index {} on day {}",
                rule.interval_index, rule.day_of_week
            )));
        }
        if rule.is_closed {
            continue;
        }
        let (start, end) = match (rule.start_local, rule.end_local) {
            (Some(start), Some(end)) => (start, end),
            _ => {
                return Err(ScheduleError::Validation(format!(
                    "day {} interval {} is missing start or end",
                    rule.day_of_week, rule.interval_index
                )))
            }
        };
        if start == end {
            return Err(ScheduleError::Validation(format!(
                "day {} interval {} has equal start and end",
                rule.day_of_week, rule.interval_index
            )));
        }
        let start_min = minutes_since_midnight(start);
        let mut end_min = minutes_since_midnight(end);
        if end_min <= start_min {
            end_min += 24 * 60;
        }
        by_day
            .entry(rule.day_of_week)
            .or_default()
            .push((start_min, end_min, rule.interval_index));
    }

    for (day, mut intervals) in by_day {
        intervals.sort_by_key(|iv| iv.0);
        for pair in intervals.windows(2) {
            if pair[1].0 < pair[0].1 {
                return Err(ScheduleError::Validation(format!(
                    "day {day} intervals {} and {} overlap",
                    pair[0].2, pair[1].2
                )));
            }
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LocalInterval {
    start: NaiveTime,
    end: NaiveTime,
    source: ActiveSource,
}

#[derive(Debug, Clone, Copy)]
struct AbsInterval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    source: ActiveSource,
}

/// Recurring intervals for one weekday, sorted by `interval_index`. Empty when
/// the day has no rules or carries a closed flag.
fn weekly_intervals_for_dow(schedule: &VendorSchedule, dow: u8) -> Vec<LocalInterval> {
    let mut rules: Vec<&WeeklyRule> = schedule
        .weekly
        .iter()
        .filter(|r| r.day_of_week == dow)
        .collect();
    if rules.is_empty() || rules.iter().any(|r| r.is_closed) {
        return Vec::new();
    }
    rules.sort_by_key(|r| r.interval_index);
    rules
        .into_iter()
        .filter_map(|r| match (r.start_local, r.end_local) {
            (Some(start), Some(end)) => Some(LocalInterval {
                start,
                end,
                source: ActiveSource::Weekly,
            }),
            _ => None,
        })
        .collect()
}

/// Candidate intervals for one local calendar date: an exception on that date
/// replaces all weekly rules, otherwise the weekday's rules apply.
fn intervals_for_date(schedule: &VendorSchedule, date: NaiveDate) -> Vec<LocalInterval> {
    if let Some(exception) = schedule.exceptions.get(&date) {
        if exception.is_closed {
            return Vec::new();
        }
        if let (Some(start), Some(end)) = (exception.start_local, exception.end_local) {
            return vec![LocalInterval {
                start,
                end,
                source: ActiveSource::Exception,
            }];
        }
        return Vec::new();
    }
    weekly_intervals_for_dow(schedule, date.weekday().num_days_from_monday() as u8)
}

/// Convert one local wall-clock point to an instant using the zone's rules at
/// that local date/time.
///
/// DST policy: a fold resolves to the earlier occurrence; a gap is clamped
/// forward to the first valid wall-clock minute. Neither is an error, both are
/// logged.
fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    match naive.and_local_timezone(tz) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earlier, _) => {
            warn!(%naive, zone = %tz, "ambiguous local time in DST fold, using earlier occurrence");
            earlier.with_timezone(&Utc)
        }
        LocalResult::None => {
            let mut probe = naive;
            for _ in 0..12 {
                probe += Duration::minutes(15);
                if let Some(dt) = probe.and_local_timezone(tz).earliest() {
                    warn!(%naive, clamped = %probe, zone = %tz, "local time in DST gap, clamped forward");
                    return dt.with_timezone(&Utc);
                }
            }
            warn!(%naive, zone = %tz, "local time unresolvable, treating as UTC");
            naive.and_utc()
        }
    }
}

/// Anchor a wall-clock interval to a local calendar date and convert both
/// endpoints to instants. A midnight-crossing interval ends on the following
/// date.
fn materialize(tz: Tz, date: NaiveDate, interval: LocalInterval) -> AbsInterval {
    let end_date = if interval.end <= interval.start {
        date + Duration::days(1)
    } else {
        date
    };
    AbsInterval {
        start: resolve_local(tz, date, interval.start),
        end: resolve_local(tz, end_date, interval.end),
        source: interval.source,
    }
}

/// First interval starting after `after`, scanning day by day past tomorrow up
/// to the lookahead horizon.
fn next_interval_after(
    schedule: &VendorSchedule,
    today: NaiveDate,
    after: DateTime<Utc>,
) -> Option<AbsInterval> {
    for offset in 2..=LOOKAHEAD_DAYS {
        let date = today + Duration::days(offset);
        for interval in intervals_for_date(schedule, date) {
            let abs = materialize(schedule.timezone, date, interval);
            if abs.start > after {
                return Some(abs);
            }
        }
    }
    None
}

/// Pure availability resolution for one instant.
///
/// Materializes candidate intervals for yesterday/today/tomorrow in the
/// vendor's local calendar (yesterday because a midnight-crossing interval on
/// day D spills into D+1), then decides state over their union. Overlapping
/// intervals are invalid data but tolerated: the query is open anywhere in the
/// union.
pub fn resolve(schedule: &VendorSchedule, at: DateTime<Utc>) -> ResolvedStatus {
    let tz = schedule.timezone;
    let today = at.with_timezone(&tz).date_naive();

    let mut intervals: Vec<AbsInterval> = Vec::new();
    for offset in -1..=1 {
        let date = today + Duration::days(offset);
        for interval in intervals_for_date(schedule, date) {
            let abs = materialize(tz, date, interval);
            if abs.end > abs.start {
                intervals.push(abs);
            }
        }
    }
    intervals.sort_by_key(|iv| iv.start);

    if let Some(active) = intervals.iter().find(|iv| iv.start <= at && at < iv.end) {
        // Extend the closing boundary through any chained overlaps; starts are
        // ascending so one pass suffices.
        let mut closes = active.end;
        for interval in &intervals {
            if interval.start <= closes && interval.end > closes {
                closes = interval.end;
            }
        }
        let reopens = intervals
            .iter()
            .map(|iv| iv.start)
            .find(|start| *start > closes)
            .or_else(|| next_interval_after(schedule, today, closes).map(|iv| iv.start));
        return ResolvedStatus {
            is_open: true,
            current_boundary: Some(closes),
            next_boundary: reopens,
            active_source: active.source,
        };
    }

    let upcoming = intervals
        .iter()
        .find(|iv| iv.start > at)
        .copied()
        .or_else(|| next_interval_after(schedule, today, at));
    match upcoming {
        Some(interval) => ResolvedStatus {
            is_open: false,
            current_boundary: Some(interval.start),
            next_boundary: Some(interval.end),
            active_source: ActiveSource::None,
        },
        None => ResolvedStatus {
            is_open: false,
            current_boundary: None,
            next_boundary: None,
            active_source: ActiveSource::None,
        },
    }
}

pub fn is_open_now(schedule: &VendorSchedule, now: DateTime<Utc>) -> bool {
    resolve(schedule, now).is_open
}

/// 24-hour "HH:MM" to a localized 12-hour label, e.g. "5:00 PM".
pub fn format_12h(time: NaiveTime) -> String {
    time.format("%-I:%M %p").to_string()
}

fn day_label(today: NaiveDate, target: NaiveDate) -> Option<String> {
    match (target - today).num_days() {
        0 => None,
        1 => Some("tomorrow".to_string()),
        _ => Some(target.format("%A").to_string()),
    }
}

/// Human status phrase for one instant, rendered in the vendor's zone
/// regardless of the caller's.
pub fn status_label(schedule: &VendorSchedule, at: DateTime<Utc>) -> String {
    let status = resolve(schedule, at);
    let tz = schedule.timezone;
    match (status.is_open, status.current_boundary) {
        (true, Some(closes)) => {
            let local = closes.with_timezone(&tz);
            format!("Open · Closes {}", format_12h(local.time()))
        }
        (true, None) => "Open".to_string(),
        (false, Some(opens)) => {
            let local = opens.with_timezone(&tz);
            match day_label(at.with_timezone(&tz).date_naive(), local.date_naive()) {
                Some(day) => format!("Closed · Opens {} {}", day, format_12h(local.time())),
                None => format!("Closed · Opens {}", format_12h(local.time())),
            }
        }
        (false, None) => "Closed".to_string(),
    }
}

/// Search-filter predicate: is the vendor open on `weekday` at `time_local`
/// per its recurring rules alone. Exceptions are date-bound and do not apply
/// to a recurring weekday query.
///
/// A midnight-crossing interval counts on its labeled day (wrapped membership)
/// and its tail counts on the following day.
pub fn is_open_at(
    schedule: &VendorSchedule,
    weekday: u8,
    time_local: NaiveTime,
) -> Result<bool, ScheduleError> {
    if weekday > 6 {
        return Err(ScheduleError::InvalidArgument(format!(
            "weekday {weekday} out of range 0-6"
        )));
    }

    let contains = |iv: &LocalInterval| {
        if iv.start < iv.end {
            iv.start <= time_local && time_local < iv.end
        } else {
            time_local >= iv.start || time_local < iv.end
        }
    };
    if weekly_intervals_for_dow(schedule, weekday).iter().any(contains) {
        return Ok(true);
    }

    let previous = (weekday + 6) % 7;
    Ok(weekly_intervals_for_dow(schedule, previous)
        .iter()
        .any(|iv| iv.end <= iv.start && time_local < iv.end))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntervalView {
    pub start: String,
    pub end: String,
    pub start_12h: String,
    pub end_12h: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayView {
    pub day: &'static str,
    pub dow: u8,
    pub is_closed: bool,
    pub intervals: Vec<IntervalView>,
}

/// Display-ready recurring week: one entry per weekday, intervals ordered by
/// `interval_index`. Reflects the recurring pattern only; dated exceptions are
/// surfaced separately via [`exception_list`].
pub fn weekly_view(schedule: &VendorSchedule) -> Vec<DayView> {
    (0u8..7)
        .map(|dow| {
            let intervals = weekly_intervals_for_dow(schedule, dow);
            DayView {
                day: DAY_NAMES[dow as usize],
                dow,
                is_closed: intervals.is_empty(),
                intervals: intervals
                    .iter()
                    .map(|iv| IntervalView {
                        start: iv.start.format("%H:%M").to_string(),
                        end: iv.end.format("%H:%M").to_string(),
                        start_12h: format_12h(iv.start),
                        end_12h: format_12h(iv.end),
                    })
                    .collect(),
            }
        })
        .collect()
}

/// Dated exception records in calendar order, for the owner-editing surface.
pub fn exception_list(schedule: &VendorSchedule) -> Vec<&ExceptionDate> {
    schedule.exceptions.values().collect()
}
