//! Cron-driven scheduler for backup cycles
//!
//! Fires one cycle at startup and then one per schedule tick. A cycle that is
//! still running when the next tick fires causes that tick to be skipped.
//! Cycle errors are logged and never stop the scheduler.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::backup::cycle::CycleReport;
use crate::backup::{BackupError, Result};

/// A unit of work the scheduler fires
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self) -> Result<CycleReport>;
}

/// What happened to a single trigger
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Completed(CycleReport),
    Failed(String),
    /// The previous cycle was still running
    Skipped,
}

/// Parse a cron expression, accepting the five-field crontab form
///
/// Five-field expressions follow crontab day-of-week numbering (0 or 7 is
/// Sunday) and are translated to the seconds-first dialect of the cron crate,
/// which counts Sunday as 1.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let schedule_error = |message: String| BackupError::Schedule {
        expression: expression.to_string(),
        message,
    };

    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = if let [minute, hour, day, month, weekday] = fields[..] {
        let weekday = crontab_weekdays(weekday).map_err(schedule_error)?;
        format!("0 {} {} {} {} {}", minute, hour, day, month, weekday)
    } else {
        fields.join(" ")
    };

    Schedule::from_str(&normalized).map_err(|e| schedule_error(e.to_string()))
}

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite a crontab day-of-week field as an explicit list in cron crate numbering
fn crontab_weekdays(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<u8>()
                    .ok()
                    .filter(|step| *step > 0)
                    .ok_or_else(|| format!("invalid day-of-week step '{}'", step))?;
                (range, Some(step))
            }
            None => (item, None),
        };

        let (first, last) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((first, last)) => (parse_weekday(first)?, parse_weekday(last)?),
                // `n/step` runs from n to the end of the week
                None if step.is_some() => (parse_weekday(range)?, 6),
                None => {
                    let day = parse_weekday(range)?;
                    (day, day)
                }
            },
        };
        if first > last {
            return Err(format!("invalid day-of-week range '{}'", range));
        }

        for day in (first..=last).step_by(step.unwrap_or(1) as usize) {
            days[day as usize % 7] = true;
        }
    }

    if days.iter().all(|selected| *selected) {
        return Ok("*".to_string());
    }
    let listed: Vec<String> = (0..7)
        .filter(|day| days[*day])
        .map(|day| (day + 1).to_string())
        .collect();
    Ok(listed.join(","))
}

/// A crontab weekday, 0-7 or a three-letter name
fn parse_weekday(value: &str) -> std::result::Result<u8, String> {
    if let Ok(day) = value.parse::<u8>() {
        return match day {
            0..=7 => Ok(day),
            _ => Err(format!("day-of-week {} out of range 0-7", day)),
        };
    }
    WEEKDAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(value))
        .map(|day| day as u8)
        .ok_or_else(|| format!("invalid day-of-week '{}'", value))
}

/// Fires backup cycles on a cron schedule
#[derive(Clone)]
pub struct BackupScheduler {
    schedule: Schedule,
    runner: Arc<dyn CycleRunner>,
    /// Held for the duration of a cycle
    running: Arc<Mutex<()>>,
}

impl BackupScheduler {
    /// Create a scheduler, validating the cron expression
    pub fn new(expression: &str, runner: Arc<dyn CycleRunner>) -> Result<Self> {
        Ok(Self {
            schedule: parse_schedule(expression)?,
            runner,
            running: Arc::new(Mutex::new(())),
        })
    }

    /// Next fire time strictly after `after`
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Run a single cycle unless one is already in flight
    pub async fn trigger(&self) -> TriggerOutcome {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Previous backup cycle still running, skipping this trigger");
            return TriggerOutcome::Skipped;
        };

        match self.runner.run_cycle().await {
            Ok(report) => {
                info!(
                    timestamp = %report.timestamp,
                    uploaded = report.uploaded.len(),
                    pruned = report.pruned,
                    "Backup cycle finished"
                );
                TriggerOutcome::Completed(report)
            }
            Err(e) => {
                error!(error = %e, "Error while running backup");
                TriggerOutcome::Failed(e.to_string())
            }
        }
    }

    /// Fire once immediately, then on every schedule tick until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        self.spawn_trigger();
        info!("Backup cron scheduled");

        loop {
            let Some(next) = self.next_fire_after(Utc::now()) else {
                warn!("Cron schedule has no upcoming fire times, stopping scheduler");
                return;
            };
            info!(next = %next, "Next backup scheduled");

            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => self.spawn_trigger(),
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping scheduler");
                    return;
                }
            }
        }
    }

    fn spawn_trigger(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.trigger().await });
    }
}
