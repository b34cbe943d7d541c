//! Quiet periods: daily wall-clock windows during which a node must not
//! process media.
//!
//! A [`QuietPeriod`] is written `HH:MM-HH:MM` (24-hour clock). The
//! [`QuietSchedule`] turns a node's periods into daily suspend/resume
//! triggers that the orchestrator evaluates on every monitor tick.

use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned for a malformed quiet period string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid quiet period '{0}', expected HH:MM-HH:MM (24-hour)")]
pub struct QuietPeriodError(pub String);

/// A same-day wall-clock range.
///
/// Overlapping, unordered or end-before-start periods are accepted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QuietPeriod {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietPeriod {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }
}

/// Parses a strict `HH:MM` value.
fn parse_clock(s: &str) -> Option<NaiveTime> {
    let bytes = s.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return None;
    }
    if !bytes[..2].iter().chain(&bytes[3..]).all(u8::is_ascii_digit) {
        return None;
    }
    let hour: u32 = s[..2].parse().ok()?;
    let minute: u32 = s[3..].parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

impl FromStr for QuietPeriod {
    type Err = QuietPeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || QuietPeriodError(s.to_string());
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start = parse_clock(start).ok_or_else(invalid)?;
        let end = parse_clock(end).ok_or_else(invalid)?;
        Ok(Self { start, end })
    }
}

impl fmt::Display for QuietPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start.hour(),
            self.start.minute(),
            self.end.hour(),
            self.end.minute()
        )
    }
}

impl TryFrom<String> for QuietPeriod {
    type Error = QuietPeriodError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<QuietPeriod> for String {
    fn from(period: QuietPeriod) -> Self {
        period.to_string()
    }
}

/// Parses every entry, failing on the first malformed one.
pub fn parse_periods<S: AsRef<str>>(values: &[S]) -> Result<Vec<QuietPeriod>, QuietPeriodError> {
    values.iter().map(|v| v.as_ref().parse()).collect()
}

/// What a schedule entry does to the active run when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuietAction {
    Suspend,
    Resume,
}

/// One daily trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledAction {
    pub at: NaiveTime,
    pub action: QuietAction,
    pub next_run: NaiveDateTime,
}

/// First occurrence of `at` strictly after `now`.
fn next_occurrence(at: NaiveTime, now: NaiveDateTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

/// Daily suspend/resume triggers derived from a node's quiet periods.
///
/// Owned by one orchestrator; nothing global.
#[derive(Debug, Default)]
pub struct QuietSchedule {
    periods: Option<Vec<QuietPeriod>>,
    entries: Vec<ScheduledAction>,
}

impl QuietSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the triggers when `periods` differs from the last call.
    ///
    /// Returns true when the schedule was rebuilt. A trigger whose time has
    /// already passed today first fires tomorrow.
    pub fn reconcile(&mut self, periods: &[QuietPeriod], now: NaiveDateTime) -> bool {
        if self.periods.as_deref() == Some(periods) {
            return false;
        }

        self.entries = periods
            .iter()
            .flat_map(|p| [(p.start, QuietAction::Suspend), (p.end, QuietAction::Resume)])
            .map(|(at, action)| ScheduledAction {
                at,
                action,
                next_run: next_occurrence(at, now),
            })
            .collect();
        self.periods = Some(periods.to_vec());
        true
    }

    /// Actions whose time has arrived, oldest first. Each fired entry moves
    /// to its next daily occurrence.
    pub fn due(&mut self, now: NaiveDateTime) -> Vec<QuietAction> {
        let mut fired: Vec<(NaiveDateTime, QuietAction)> = Vec::new();
        for entry in &mut self.entries {
            if entry.next_run <= now {
                fired.push((entry.next_run, entry.action));
                entry.next_run = next_occurrence(entry.at, now);
            }
        }
        fired.sort_by_key(|(when, _)| *when);
        fired.into_iter().map(|(_, action)| action).collect()
    }

    pub fn entries(&self) -> &[ScheduledAction] {
        &self.entries
    }

    /// Drops all triggers; the next reconcile rebuilds them.
    pub fn clear(&mut self) {
        self.periods = None;
        self.entries.clear();
    }
}
