//! Next fire-time calculation.
//!
//! Daily and weekly rules are evaluated against local wall-clock time in the
//! calculator's timezone, recomputed from the date and time fields on every
//! call so a DST transition moves the UTC instant rather than the local time.
//!
//! DST resolution:
//! - A local time inside a spring-forward gap fires at the same wall-clock
//!   time shifted forward by the gap length (02:30 in a 02:00 -> 03:00 gap
//!   fires at 03:30).
//! - A local time inside a fall-back overlap fires once, at the earlier of
//!   the two instants.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeZone, Utc,
};
use chrono_tz::Tz;
use thiserror::Error;

use super::reminder::{RecurrenceRule, ReminderDefinition};

/// How many local dates past `after` a wall-clock rule is searched.
/// A weekly rule always has a slot within the next seven days.
const WALL_CLOCK_SEARCH_DAYS: i64 = 8;

/// Errors that can occur when building schedules.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The recurrence rule can never produce an occurrence.
    #[error("invalid recurrence rule: {0}")]
    InvalidRule(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

/// Maps a reminder definition to concrete fire-times.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleCalculator {
    timezone: Tz,
}

impl ScheduleCalculator {
    /// Create a calculator for an IANA timezone name.
    pub fn new(timezone: &str) -> Result<Self, ScheduleError> {
        let timezone = timezone
            .parse::<Tz>()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;
        Ok(Self { timezone })
    }

    /// Create a calculator for an already parsed timezone.
    pub fn with_timezone(timezone: Tz) -> Self {
        Self { timezone }
    }

    /// Calculator evaluating wall-clock rules in UTC.
    pub fn utc() -> Self {
        Self { timezone: Tz::UTC }
    }

    /// Get the timezone.
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// The earliest fire-time strictly after `after`, or `None` if the rule
    /// is exhausted.
    pub fn next_fire_time(
        &self,
        definition: &ReminderDefinition,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.next_for_rule(&definition.rule, after)
    }

    /// Same as [`next_fire_time`](Self::next_fire_time) for a bare rule.
    pub fn next_for_rule(
        &self,
        rule: &RecurrenceRule,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match rule {
            RecurrenceRule::Once { at } => (*at > after).then_some(*at),
            RecurrenceRule::Interval { start, every_hours } => {
                next_interval(*start, *every_hours, after)
            }
            RecurrenceRule::Daily { time } => {
                self.next_wall_clock(after, |_| std::slice::from_ref(time).iter().copied())
            }
            RecurrenceRule::Weekly { slots } => self.next_wall_clock(after, |date| {
                slots
                    .iter()
                    .filter(move |slot| slot.weekday == date.weekday())
                    .map(|slot| slot.time)
            }),
        }
    }

    /// The next `n` fire-times after `after`. Fewer are returned if the rule
    /// runs out.
    pub fn next_n_after(
        &self,
        definition: &ReminderDefinition,
        after: DateTime<Utc>,
        n: usize,
    ) -> Vec<DateTime<Utc>> {
        let mut results = Vec::with_capacity(n);
        let mut current = after;
        while results.len() < n {
            match self.next_fire_time(definition, current) {
                Some(next) => {
                    results.push(next);
                    current = next;
                }
                None => break,
            }
        }
        results
    }

    /// Earliest resolved local time strictly after `after`, scanning a window
    /// of local dates around it. Times on one date can reorder once a gap
    /// shifts them, so every candidate in the window is compared.
    fn next_wall_clock<F, I>(&self, after: DateTime<Utc>, times_on: F) -> Option<DateTime<Utc>>
    where
        F: Fn(NaiveDate) -> I,
        I: Iterator<Item = NaiveTime>,
    {
        let local_date = after.with_timezone(&self.timezone).date_naive();
        let mut best: Option<DateTime<Utc>> = None;

        for offset in -1..=WALL_CLOCK_SEARCH_DAYS {
            let Some(date) = local_date.checked_add_signed(Duration::days(offset)) else {
                continue;
            };
            for time in times_on(date) {
                let Some(candidate) = self.resolve_local(date.and_time(time)) else {
                    continue;
                };
                if candidate > after && best.is_none_or(|b| candidate < b) {
                    best = Some(candidate);
                }
            }
        }

        best
    }

    /// Resolve a local wall-clock time to a UTC instant.
    fn resolve_local(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self.timezone.from_local_datetime(&naive) {
            LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
            LocalResult::None => {
                // Inside a gap: apply the offset in effect just before it.
                let offset = (1..=3).find_map(|hours| {
                    match self
                        .timezone
                        .from_local_datetime(&(naive - Duration::hours(hours)))
                    {
                        LocalResult::Single(dt) => Some(dt.offset().fix()),
                        LocalResult::Ambiguous(earliest, _) => Some(earliest.offset().fix()),
                        LocalResult::None => None,
                    }
                })?;
                let utc = naive - Duration::seconds(i64::from(offset.local_minus_utc()));
                Some(utc.and_utc())
            }
        }
    }
}

impl Default for ScheduleCalculator {
    fn default() -> Self {
        Self::utc()
    }
}

fn next_interval(
    start: DateTime<Utc>,
    every_hours: u32,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if every_hours == 0 {
        return None;
    }
    if after < start {
        return Some(start);
    }
    let step = i64::from(every_hours) * 3600;
    let elapsed = (after - start).num_seconds();
    let steps = elapsed.div_euclid(step) + 1;
    start.checked_add_signed(Duration::seconds(steps.checked_mul(step)?))
}
