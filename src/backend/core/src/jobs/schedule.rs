//! Recurring triggers for scheduled job definitions.
//!
//! A schedule string resolves to a [`Trigger`]: either a cron expression
//! (5 fields, or 6/7 with seconds first) or one of a few named aliases such
//! as `every day` or `every 5 minutes`. In 5- and 6-field expressions the
//! day of week counts from 0 = Sunday; 7-field expressions use the `cron`
//! crate's own numbering. The [`Scheduler`] runs one timer
//! task per scheduled definition and enqueues the job on every fire.

use chrono::{DateTime, Utc};
use cron::Schedule;
use regex::Regex;
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dispatcher::Dispatcher;
use super::events::{JOB_SCHEDULED, SCHEDULE_FAILED};
use crate::error::{DroverError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Named Aliases
// ═══════════════════════════════════════════════════════════════════════════════

/// Human-readable schedules accepted in place of a cron expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedAlias {
    EverySecond,
    EveryMinute,
    EveryHour,
    /// Midnight UTC
    Daily,
    /// Sunday midnight UTC
    Weekly,
    /// First of the month, midnight UTC
    Monthly,
    Yearly,
    EveryNSeconds(u32),
    EveryNMinutes(u32),
    EveryNHours(u32),
}

static STEP_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

fn step_pattern() -> Option<&'static Regex> {
    STEP_PATTERN
        .get_or_init(|| Regex::new(r"^every\s+(\d+)\s+(second|minute|hour)s?$").ok())
        .as_ref()
}

impl NamedAlias {
    /// Resolve an alias; `None` when the text is not a known alias.
    pub fn parse(text: &str) -> Option<Self> {
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_lowercase();
        let alias = match normalized.as_str() {
            "every second" => Self::EverySecond,
            "every minute" => Self::EveryMinute,
            "every hour" | "hourly" => Self::EveryHour,
            "every day" | "daily" => Self::Daily,
            "every week" | "weekly" => Self::Weekly,
            "every month" | "monthly" => Self::Monthly,
            "every year" | "yearly" => Self::Yearly,
            other => {
                let captures = step_pattern()?.captures(other)?;
                let step: u32 = captures[1].parse().ok()?;
                match &captures[2] {
                    "second" if (1..=59).contains(&step) => Self::EveryNSeconds(step),
                    "minute" if (1..=59).contains(&step) => Self::EveryNMinutes(step),
                    "hour" if (1..=23).contains(&step) => Self::EveryNHours(step),
                    _ => return None,
                }
            }
        };
        Some(alias)
    }

    /// Equivalent cron expression with a leading seconds field.
    pub fn cron_expression(&self) -> String {
        match self {
            Self::EverySecond => "* * * * * *".to_string(),
            Self::EveryMinute => "0 * * * * *".to_string(),
            Self::EveryHour => "0 0 * * * *".to_string(),
            Self::Daily => "0 0 0 * * *".to_string(),
            Self::Weekly => "0 0 0 * * Sun".to_string(),
            Self::Monthly => "0 0 0 1 * *".to_string(),
            Self::Yearly => "0 0 0 1 1 *".to_string(),
            Self::EveryNSeconds(n) => format!("0/{} * * * * *", n),
            Self::EveryNMinutes(n) => format!("0 0/{} * * * *", n),
            Self::EveryNHours(n) => format!("0 0 0/{} * * *", n),
        }
    }
}

impl fmt::Display for NamedAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EverySecond => write!(f, "every second"),
            Self::EveryMinute => write!(f, "every minute"),
            Self::EveryHour => write!(f, "every hour"),
            Self::Daily => write!(f, "every day"),
            Self::Weekly => write!(f, "every week"),
            Self::Monthly => write!(f, "every month"),
            Self::Yearly => write!(f, "every year"),
            Self::EveryNSeconds(n) => write!(f, "every {} seconds", n),
            Self::EveryNMinutes(n) => write!(f, "every {} minutes", n),
            Self::EveryNHours(n) => write!(f, "every {} hours", n),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Trigger
// ═══════════════════════════════════════════════════════════════════════════════

/// A resolved schedule. Both variants carry the compiled cron schedule.
#[derive(Debug, Clone)]
pub enum Trigger {
    Cron { expression: String, schedule: Schedule },
    Alias { alias: NamedAlias, schedule: Schedule },
}

impl Trigger {
    /// Resolve a schedule string for the job `name`.
    pub fn parse(name: &str, text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(DroverError::invalid_schedule(name, text, "schedule is empty"));
        }

        if let Some(alias) = NamedAlias::parse(trimmed) {
            let schedule = Schedule::from_str(&alias.cron_expression())
                .map_err(|e| DroverError::invalid_schedule(name, text, e.to_string()))?;
            return Ok(Self::Alias { alias, schedule });
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let expression = match fields.len() {
            5 | 6 => {
                let (leading, day_of_week) = fields.split_at(fields.len() - 1);
                let day_of_week = day_of_week_names(day_of_week[0])
                    .map_err(|reason| DroverError::invalid_schedule(name, text, reason))?;
                let joined = format!("{} {}", leading.join(" "), day_of_week);
                if fields.len() == 5 {
                    format!("0 {}", joined)
                } else {
                    joined
                }
            }
            7 => trimmed.to_string(),
            n => {
                return Err(DroverError::invalid_schedule(
                    name,
                    text,
                    format!("expected 5 to 7 cron fields or a named alias, found {} fields", n),
                ))
            }
        };
        let schedule = Schedule::from_str(&expression)
            .map_err(|e| DroverError::invalid_schedule(name, text, e.to_string()))?;
        Ok(Self::Cron { expression, schedule })
    }

    /// Next fire time strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule().after(after).next()
    }

    fn schedule(&self) -> &Schedule {
        match self {
            Self::Cron { schedule, .. } | Self::Alias { schedule, .. } => schedule,
        }
    }
}

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Rewrite a numeric day-of-week field (0 or 7 = Sunday, 1 = Monday) as day
/// names, which the `cron` crate reads unambiguously. Fields that already use
/// names, or are a bare `*`/`?`, pass through.
fn day_of_week_names(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }

    let number = |text: &str| -> std::result::Result<u32, String> {
        match text.parse::<u32>() {
            Ok(day) if day <= 7 => Ok(day),
            _ => Err(format!("invalid day of week `{}` (expected 0-7)", text)),
        }
    };

    let mut days = [false; 7];
    for part in field.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => match step.parse::<u32>() {
                Ok(step) if step > 0 => (base, Some(step)),
                _ => return Err(format!("invalid step in day of week `{}`", part)),
            },
            None => (part, None),
        };
        let (start, end) = match (base, base.split_once('-')) {
            ("*", _) => (0, 6),
            (_, Some((start, end))) => (number(start)?, number(end)?),
            (single, None) if step.is_some() => (number(single)?, 6),
            (single, None) => {
                let day = number(single)?;
                (day, day)
            }
        };
        if start > end {
            return Err(format!("invalid day of week range `{}`", part));
        }
        for day in (start..=end).step_by(step.unwrap_or(1) as usize) {
            days[(day % 7) as usize] = true;
        }
    }

    if days.iter().all(|&set| set) {
        return Ok("*".to_string());
    }
    let names: Vec<&str> = DAY_NAMES
        .iter()
        .zip(days)
        .filter(|(_, set)| *set)
        .map(|(name, _)| *name)
        .collect();
    Ok(names.join(","))
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron { expression, .. } => write!(f, "{}", expression),
            Self::Alias { alias, .. } => write!(f, "{}", alias),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle over the running schedule timers.
#[derive(Debug)]
pub struct ScheduleHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ScheduleHandle {
    /// Number of timers started.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop every timer. Jobs already enqueued are left alone.
    pub async fn stop(self) {
        self.token.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Starts recurring timers for scheduled definitions.
pub struct Scheduler {
    dispatcher: Dispatcher,
}

impl Scheduler {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Spawn one timer per definition that carries a trigger.
    ///
    /// Every fire calls `add(name, None)`. Running several processes with
    /// the same definitions fires each schedule once per process.
    pub fn start(&self, parent: &CancellationToken) -> ScheduleHandle {
        let token = parent.child_token();
        let mut tasks = Vec::new();

        for definition in self.dispatcher.registry().scheduled() {
            let Some(trigger) = definition.trigger().cloned() else {
                continue;
            };
            let name = definition.name().to_string();
            let next = trigger.next_after(&Utc::now());
            self.dispatcher.logger().info(
                JOB_SCHEDULED,
                json!({"name": name, "schedule": trigger.to_string(), "next_run": next}),
            );
            tasks.push(tokio::spawn(run_timer(
                self.dispatcher.clone(),
                name,
                trigger,
                token.clone(),
            )));
        }

        ScheduleHandle { token, tasks }
    }
}

async fn run_timer(dispatcher: Dispatcher, name: String, trigger: Trigger, token: CancellationToken) {
    loop {
        let now = Utc::now();
        let Some(next) = trigger.next_after(&now) else {
            tracing::debug!(job = %name, "Schedule has no further fire times");
            return;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        if let Err(e) = dispatcher.add(&name, None).await {
            dispatcher.logger().error(
                SCHEDULE_FAILED,
                json!({"name": name, "error_message": e.to_string()}),
            );
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single().unwrap()
    }

    #[test]
    fn test_alias_parsing() {
        assert_eq!(NamedAlias::parse("every day"), Some(NamedAlias::Daily));
        assert_eq!(NamedAlias::parse("  Every   Minute "), Some(NamedAlias::EveryMinute));
        assert_eq!(NamedAlias::parse("weekly"), Some(NamedAlias::Weekly));
        assert_eq!(NamedAlias::parse("every 5 minutes"), Some(NamedAlias::EveryNMinutes(5)));
        assert_eq!(NamedAlias::parse("every 1 hour"), Some(NamedAlias::EveryNHours(1)));
        assert_eq!(NamedAlias::parse("every 60 seconds"), None);
        assert_eq!(NamedAlias::parse("every 24 hours"), None);
        assert_eq!(NamedAlias::parse("every fortnight"), None);
    }

    #[test]
    fn test_every_day_fires_at_midnight() {
        let trigger = Trigger::parse("nightly", "every day").unwrap();
        let next = trigger.next_after(&at(2024, 3, 10, 15, 30, 0)).unwrap();
        assert_eq!(next, at(2024, 3, 11, 0, 0, 0));
    }

    #[test]
    fn test_every_minute_fires_at_top_of_minute() {
        let trigger = Trigger::parse("tick", "every minute").unwrap();
        let next = trigger.next_after(&at(2024, 3, 10, 15, 30, 12)).unwrap();
        assert_eq!(next, at(2024, 3, 10, 15, 31, 0));
    }

    #[test]
    fn test_weekly_fires_on_sunday() {
        let trigger = Trigger::parse("report", "every week").unwrap();
        let next = trigger.next_after(&at(2024, 3, 13, 9, 0, 0)).unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Sun);
        assert_eq!(next.hour(), 0);
    }

    #[test]
    fn test_step_alias() {
        let trigger = Trigger::parse("poll", "every 15 minutes").unwrap();
        let next = trigger.next_after(&at(2024, 3, 10, 15, 31, 0)).unwrap();
        assert_eq!(next, at(2024, 3, 10, 15, 45, 0));
    }

    #[test]
    fn test_five_field_cron_gets_seconds() {
        let trigger = Trigger::parse("hourly", "30 * * * *").unwrap();
        assert_eq!(trigger.to_string(), "0 30 * * * *");
        let next = trigger.next_after(&at(2024, 3, 10, 15, 31, 0)).unwrap();
        assert_eq!(next, at(2024, 3, 10, 16, 30, 0));
    }

    #[test]
    fn test_six_field_cron_used_as_is() {
        let trigger = Trigger::parse("fast", "0/10 * * * * *").unwrap();
        assert!(matches!(trigger, Trigger::Cron { .. }));
        let next = trigger.next_after(&at(2024, 3, 10, 15, 31, 1)).unwrap();
        assert_eq!(next.second(), 10);
    }

    #[test]
    fn test_numeric_weekdays_follow_standard_cron() {
        // 2024-03-13 is a Wednesday.
        let monday = Trigger::parse("m", "0 0 * * 1").unwrap();
        assert_eq!(monday.next_after(&at(2024, 3, 13, 9, 0, 0)).unwrap(), at(2024, 3, 18, 0, 0, 0));

        let sunday = Trigger::parse("s", "0 0 * * 0").unwrap();
        assert_eq!(sunday.next_after(&at(2024, 3, 13, 9, 0, 0)).unwrap(), at(2024, 3, 17, 0, 0, 0));

        let also_sunday = Trigger::parse("s", "0 0 * * 7").unwrap();
        assert_eq!(also_sunday.next_after(&at(2024, 3, 13, 9, 0, 0)).unwrap(), at(2024, 3, 17, 0, 0, 0));

        let weekend = Trigger::parse("w", "0 12 * * 6-7").unwrap();
        assert_eq!(weekend.next_after(&at(2024, 3, 13, 9, 0, 0)).unwrap(), at(2024, 3, 16, 12, 0, 0));
        assert_eq!(weekend.next_after(&at(2024, 3, 16, 13, 0, 0)).unwrap(), at(2024, 3, 17, 12, 0, 0));
    }

    #[test]
    fn test_day_of_week_rewrite() {
        assert_eq!(day_of_week_names("*").unwrap(), "*");
        assert_eq!(day_of_week_names("1-5").unwrap(), "Mon,Tue,Wed,Thu,Fri");
        assert_eq!(day_of_week_names("0,3").unwrap(), "Sun,Wed");
        assert_eq!(day_of_week_names("*/2").unwrap(), "Sun,Tue,Thu,Sat");
        assert_eq!(day_of_week_names("0-7").unwrap(), "*");
        assert_eq!(day_of_week_names("Mon-Fri").unwrap(), "Mon-Fri");
        assert!(day_of_week_names("8").is_err());
        assert!(day_of_week_names("5-2").is_err());
        assert!(day_of_week_names("*/0").is_err());
    }

    #[test]
    fn test_six_field_weekday_is_standard() {
        let trigger = Trigger::parse("m", "30 0 0 * * 1").unwrap();
        let next = trigger.next_after(&at(2024, 3, 13, 9, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 3, 18, 0, 0, 30));
        assert_eq!(next.weekday(), chrono::Weekday::Mon);
    }

    #[test]
    fn test_invalid_schedules() {
        assert!(Trigger::parse("a", "").is_err());
        assert!(Trigger::parse("a", "whenever").is_err());
        assert!(Trigger::parse("a", "61 * * * *").is_err());
        let error = Trigger::parse("a", "* *").unwrap_err();
        assert_eq!(error.code(), crate::error::ErrorCode::InvalidSchedule);
    }
}
