//! Timer expression parsing and due-date arithmetic.
//!
//! Three grammars share one entry point:
//!
//! - `date` — an absolute ISO-8601 instant (`2026-03-01T09:00:00Z`)
//! - `duration` — an ISO-8601 duration offset (`PT5M`, `P1DT2H`)
//! - `cycle` — repeating: `R/PT5M` (unbounded), `R3/PT1M` (bounded), or a
//!   cron line (`0 0 9 * * *`)
//!
//! Calendar components in durations use the fixed civil approximations
//! (month = 30 days, year = 365 days); sub-second precision is not a goal.

use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use cron::Schedule;

use crate::error::EngineError;
use crate::timer::model::TimerType;

/// A parsed timer expression.
#[derive(Debug, Clone)]
pub enum TimerExpression {
    /// Fire once at an absolute instant.
    Date(DateTime<Utc>),
    /// Fire once, `duration` after creation.
    Duration(Duration),
    /// Fire repeatedly.
    Cycle(CycleSpec),
}

/// Repetition rule for a cycle expression.
#[derive(Debug, Clone)]
pub struct CycleSpec {
    /// Bounded repeat count from `R<n>/`; None means unbounded.
    pub repeat_count: Option<u32>,
    pub interval: CycleInterval,
}

/// How a cycle advances between firings.
#[derive(Debug, Clone)]
pub enum CycleInterval {
    /// Fixed interval from `R/<iso-duration>`.
    Fixed(Duration),
    /// Cron occurrence grid.
    Cron(Box<Schedule>),
}

impl TimerExpression {
    /// Parse a raw expression string.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(invalid(raw, "empty expression"));
        }

        // R/PT5M or R3/PT1M
        if let Some(rest) = text.strip_prefix('R') {
            if let Some((count, interval)) = rest.split_once('/') {
                let repeat_count = if count.is_empty() {
                    None
                } else {
                    Some(
                        count
                            .parse::<u32>()
                            .map_err(|_| invalid(raw, "repeat count must be an integer"))?,
                    )
                };
                let interval = parse_iso_duration(interval).map_err(|e| invalid(raw, &e))?;
                return Ok(Self::Cycle(CycleSpec {
                    repeat_count,
                    interval: CycleInterval::Fixed(interval),
                }));
            }
        }

        // PT5M, P1DT2H
        if text.starts_with('P') {
            let duration = parse_iso_duration(text).map_err(|e| invalid(raw, &e))?;
            return Ok(Self::Duration(duration));
        }

        // 2026-03-01T09:00:00Z (with or without offset)
        if let Some(instant) = parse_instant(text) {
            return Ok(Self::Date(instant));
        }

        // Cron line: "0 0 9 * * *"
        if let Ok(schedule) = Schedule::from_str(text) {
            return Ok(Self::Cycle(CycleSpec {
                repeat_count: None,
                interval: CycleInterval::Cron(Box::new(schedule)),
            }));
        }

        Err(invalid(raw, "not a date, duration, cycle, or cron expression"))
    }

    /// Which timer type this expression produces.
    pub fn timer_type(&self) -> TimerType {
        match self {
            Self::Date(_) => TimerType::Date,
            Self::Duration(_) => TimerType::Duration,
            Self::Cycle(_) => TimerType::Cycle,
        }
    }

    /// Whether the timer refires after the first execution.
    pub fn is_repeating(&self) -> bool {
        matches!(self, Self::Cycle(_))
    }

    /// Bounded repeat count, when the expression carries one.
    pub fn repeat_count(&self) -> Option<u32> {
        match self {
            Self::Cycle(cycle) => cycle.repeat_count,
            _ => None,
        }
    }

    /// Fixed repeat interval in milliseconds, when the cycle has one.
    pub fn fixed_interval_ms(&self) -> Option<i64> {
        match self {
            Self::Cycle(CycleSpec {
                interval: CycleInterval::Fixed(interval),
                ..
            }) => Some(interval.num_milliseconds()),
            _ => None,
        }
    }

    /// First due date for a timer created at `created_at`.
    pub fn initial_due(&self, created_at: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
        match self {
            Self::Date(instant) => Ok(*instant),
            Self::Duration(duration) => Ok(created_at + *duration),
            Self::Cycle(cycle) => match &cycle.interval {
                CycleInterval::Fixed(interval) => Ok(created_at + *interval),
                CycleInterval::Cron(schedule) => schedule
                    .after(&created_at)
                    .next()
                    .ok_or_else(|| invalid("cron", "no future occurrence")),
            },
        }
    }

    /// Next due date after a firing at `fired_at`. None for single-shot
    /// expressions.
    pub fn next_due(&self, fired_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(_) | Self::Duration(_) => None,
            Self::Cycle(cycle) => match &cycle.interval {
                CycleInterval::Fixed(interval) => Some(fired_at + *interval),
                CycleInterval::Cron(schedule) => schedule.after(&fired_at).next(),
            },
        }
    }
}

fn invalid(expression: &str, reason: &str) -> EngineError {
    EngineError::Expression {
        expression: expression.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
        return Some(instant.with_timezone(&Utc));
    }
    // Bare date-time without an offset is taken as UTC.
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn parse_iso_duration(text: &str) -> Result<Duration, String> {
    let parsed = iso8601::duration(text)?;
    Ok(match parsed {
        iso8601::Duration::YMDHMS {
            year,
            month,
            day,
            hour,
            minute,
            second,
            millisecond,
        } => {
            Duration::days(year as i64 * 365 + month as i64 * 30 + day as i64)
                + Duration::hours(hour as i64)
                + Duration::minutes(minute as i64)
                + Duration::seconds(second as i64)
                + Duration::milliseconds(millisecond as i64)
        }
        iso8601::Duration::Weeks(weeks) => Duration::weeks(weeks as i64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn parses_absolute_date() {
        let expr = TimerExpression::parse("2026-03-01T09:00:00Z").unwrap();
        assert_eq!(expr.timer_type(), TimerType::Date);
        assert!(!expr.is_repeating());

        let created = at(2026, 1, 1, 0, 0, 0);
        assert_eq!(expr.initial_due(created).unwrap(), at(2026, 3, 1, 9, 0, 0));
        assert!(expr.next_due(at(2026, 3, 1, 9, 0, 0)).is_none());
    }

    #[test]
    fn parses_naive_date_as_utc() {
        let expr = TimerExpression::parse("2026-03-01T09:00:00").unwrap();
        assert_eq!(
            expr.initial_due(at(2026, 1, 1, 0, 0, 0)).unwrap(),
            at(2026, 3, 1, 9, 0, 0)
        );
    }

    #[test]
    fn parses_simple_duration() {
        let expr = TimerExpression::parse("PT5M").unwrap();
        assert_eq!(expr.timer_type(), TimerType::Duration);

        let created = at(2026, 1, 1, 12, 0, 0);
        assert_eq!(expr.initial_due(created).unwrap(), at(2026, 1, 1, 12, 5, 0));
    }

    #[test]
    fn parses_compound_duration() {
        let expr = TimerExpression::parse("P1DT2H").unwrap();
        let created = at(2026, 1, 1, 0, 0, 0);
        assert_eq!(expr.initial_due(created).unwrap(), at(2026, 1, 2, 2, 0, 0));
    }

    #[test]
    fn parses_unbounded_cycle() {
        let expr = TimerExpression::parse("R/PT5M").unwrap();
        assert_eq!(expr.timer_type(), TimerType::Cycle);
        assert!(expr.is_repeating());
        assert_eq!(expr.repeat_count(), None);
        assert_eq!(expr.fixed_interval_ms(), Some(300_000));

        let fired = at(2026, 1, 1, 12, 0, 0);
        assert_eq!(expr.next_due(fired).unwrap(), at(2026, 1, 1, 12, 5, 0));
    }

    #[test]
    fn parses_bounded_cycle() {
        let expr = TimerExpression::parse("R3/PT1M").unwrap();
        assert_eq!(expr.repeat_count(), Some(3));
        assert_eq!(expr.fixed_interval_ms(), Some(60_000));
    }

    #[test]
    fn parses_cron_cycle() {
        // Daily at 09:00:00.
        let expr = TimerExpression::parse("0 0 9 * * *").unwrap();
        assert_eq!(expr.timer_type(), TimerType::Cycle);
        assert!(expr.fixed_interval_ms().is_none());

        let created = at(2026, 1, 1, 10, 0, 0);
        assert_eq!(expr.initial_due(created).unwrap(), at(2026, 1, 2, 9, 0, 0));
        assert_eq!(
            expr.next_due(at(2026, 1, 2, 9, 0, 0)).unwrap(),
            at(2026, 1, 3, 9, 0, 0)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(TimerExpression::parse("").is_err());
        assert!(TimerExpression::parse("whenever").is_err());
        assert!(TimerExpression::parse("R/notaduration").is_err());
        assert!(TimerExpression::parse("Rx/PT1M").is_err());
    }

    #[test]
    fn rejected_expression_names_itself() {
        let err = TimerExpression::parse("whenever").unwrap_err();
        assert!(err.to_string().contains("whenever"));
    }
}
