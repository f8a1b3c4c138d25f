use std::time::Duration;

use chrono::{DateTime, Datelike, Local, NaiveDateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::db::Subscription;

const TIME_FORMAT: &str = "%H:%M";

const WEEKDAYS: [Weekday; 5] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
];
const WEEKENDS: [Weekday; 2] = [Weekday::Sat, Weekday::Sun];

/// A recurring time window with its own check interval.
///
/// `start_time`/`end_time` are local `HH:MM`; the end is exclusive and a
/// start later than the end wraps past midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckWindow {
    pub days: Vec<String>,
    pub start_time: String,
    pub end_time: String,
    /// Seconds between checks inside the window.
    pub interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CheckWindow {
    /// Check that days, times and interval are well formed.
    ///
    /// # Errors
    ///
    /// Returns a human-readable message for the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.days.is_empty() {
            return Err("days cannot be empty".to_string());
        }
        for day in &self.days {
            expand_day(day).ok_or_else(|| format!("unknown day {day:?}"))?;
        }
        for time in [&self.start_time, &self.end_time] {
            parse_time(time).ok_or_else(|| format!("invalid time {time:?}, expected HH:MM"))?;
        }
        if self.interval == 0 {
            return Err("interval must be at least 1 second".to_string());
        }
        Ok(())
    }

    /// Whether the window covers the given local weekday and time.
    #[must_use]
    pub fn matches(&self, weekday: Weekday, time: NaiveTime) -> bool {
        let day_matches = self
            .days
            .iter()
            .filter_map(|d| expand_day(d))
            .any(|days| days.contains(&weekday));
        if !day_matches {
            return false;
        }

        let (Some(start), Some(end)) = (parse_time(&self.start_time), parse_time(&self.end_time))
        else {
            return false;
        };
        // Minute resolution, like the HH:MM config values
        let Some(now) = parse_time(&time.format(TIME_FORMAT).to_string()) else {
            return false;
        };

        if start <= end {
            now >= start && now < end
        } else {
            now >= start || now < end
        }
    }
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), TIME_FORMAT).ok()
}

fn expand_day(day: &str) -> Option<Vec<Weekday>> {
    match day.trim().to_lowercase().as_str() {
        "weekdays" => Some(WEEKDAYS.to_vec()),
        "weekends" => Some(WEEKENDS.to_vec()),
        other => other.parse::<Weekday>().ok().map(|d| vec![d]),
    }
}

/// Interval that applies to a subscription at local time `at`.
///
/// The first matching window wins; otherwise the subscription's own
/// interval, or `default_secs` when that is unset.
#[must_use]
pub fn effective_interval(sub: &Subscription, at: NaiveDateTime, default_secs: u64) -> Duration {
    let base = if sub.check_interval > 0 {
        sub.check_interval as u64
    } else {
        default_secs
    };

    let window = sub
        .check_windows()
        .into_iter()
        .find(|w| w.matches(at.weekday(), at.time()));

    Duration::from_secs(window.map_or(base, |w| w.interval))
}

/// Whether a subscription should be checked at `now`.
///
/// Never-checked subscriptions, and ones whose `last_checked` cannot be
/// parsed, are always due.
#[must_use]
pub fn is_due(sub: &Subscription, now: DateTime<Utc>, default_secs: u64) -> bool {
    let Some(last) = sub.last_checked_at() else {
        return true;
    };
    let local = now.with_timezone(&Local).naive_local();
    let interval = effective_interval(sub, local, default_secs);

    match (now - last).to_std() {
        Ok(elapsed) => elapsed >= interval,
        // Clock went backwards
        Err(_) => false,
    }
}
