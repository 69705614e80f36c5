//! Next-run computation for schedules
//!
//! Cron schedules use 5-field expressions (`minute hour day-of-month month
//! day-of-week`) evaluated in the schedule's named timezone; interval
//! schedules advance by a fixed number of seconds from the previous slot.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use spine_storage::{Schedule, ScheduleKind};

/// Scheduler errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("schedule misconfigured: {0}")]
    Misconfigured(String),
}

/// Normalize a 5-field expression to the 6-field form the parser expects
/// (a seconds field of `0` is prepended).
fn normalize_expression(expression: &str) -> Result<String, SchedulerError> {
    let fields = expression.split_whitespace().count();
    match fields {
        5 => Ok(format!("0 {expression}")),
        6 | 7 => Ok(expression.to_string()),
        _ => Err(SchedulerError::InvalidCron {
            expression: expression.to_string(),
            message: format!("expected 5 fields, got {fields}"),
        }),
    }
}

fn parse_cron(expression: &str) -> Result<CronSchedule, SchedulerError> {
    let normalized = normalize_expression(expression)?;
    CronSchedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// Validate a 5-field cron expression.
pub fn validate_cron_expression(expression: &str) -> Result<(), SchedulerError> {
    parse_cron(expression).map(|_| ())
}

fn parse_timezone(name: &str) -> Result<Tz, SchedulerError> {
    name.parse()
        .map_err(|_| SchedulerError::UnknownTimezone(name.to_string()))
}

/// Compute the first run time strictly after `after`.
///
/// Returns `None` for one-shot schedules (they fire once at their
/// preconfigured `next_run_at` and never recompute).
pub fn compute_next_run(
    schedule: &Schedule,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    match schedule.kind {
        ScheduleKind::Cron => {
            let expression = schedule.cron_expression.as_deref().ok_or_else(|| {
                SchedulerError::Misconfigured(format!(
                    "cron schedule '{}' has no expression",
                    schedule.name
                ))
            })?;
            let cron = parse_cron(expression)?;
            let tz = parse_timezone(&schedule.timezone)?;

            let next = cron
                .after(&after.with_timezone(&tz))
                .next()
                .map(|t| t.with_timezone(&Utc));
            Ok(next)
        }
        ScheduleKind::Interval => {
            let seconds = schedule.interval_seconds.ok_or_else(|| {
                SchedulerError::Misconfigured(format!(
                    "interval schedule '{}' has no interval",
                    schedule.name
                ))
            })?;
            Ok(Some(after + chrono::Duration::seconds(seconds.max(1) as i64)))
        }
        ScheduleKind::OneShot => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use spine_core::OperationKind;
    use spine_storage::NewSchedule;

    fn cron_schedule(expression: &str, timezone: &str) -> Schedule {
        let new = NewSchedule::cron("test", OperationKind::Task, "ingest", expression)
            .with_timezone(timezone);
        Schedule {
            id: uuid::Uuid::now_v7(),
            name: new.name,
            target_type: new.target_type,
            target_name: new.target_name,
            kind: new.kind,
            cron_expression: new.cron_expression,
            interval_seconds: new.interval_seconds,
            timezone: new.timezone,
            enabled: true,
            last_run_at: None,
            next_run_at: None,
            params_template: new.params_template,
            max_instances: 1,
            misfire_grace_seconds: 60,
            version: 1,
        }
    }

    #[test]
    fn test_five_field_expression_accepted() {
        assert!(validate_cron_expression("*/5 * * * *").is_ok());
        assert!(validate_cron_expression("0 6 * * 1").is_ok());
    }

    #[test]
    fn test_bad_expressions_rejected() {
        assert!(validate_cron_expression("* *").is_err());
        assert!(validate_cron_expression("not a cron").is_err());
    }

    #[test]
    fn test_next_run_five_minute_boundary() {
        let schedule = cron_schedule("*/5 * * * *", "UTC");
        let after = Utc.with_ymd_and_hms(2026, 1, 2, 12, 7, 30).unwrap();

        let next = compute_next_run(&schedule, after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 2, 12, 10, 0).unwrap());
    }

    #[test]
    fn test_next_run_respects_timezone() {
        // 06:00 in New York is 11:00 UTC in January (EST)
        let schedule = cron_schedule("0 6 * * *", "America/New_York");
        let after = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();

        let next = compute_next_run(&schedule, after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 2, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_unknown_timezone() {
        let schedule = cron_schedule("0 6 * * *", "Mars/Olympus");
        let err = compute_next_run(&schedule, Utc::now()).unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownTimezone(_)));
    }

    #[test]
    fn test_interval_next_run() {
        let new = NewSchedule::interval(
            "tick",
            OperationKind::Task,
            "ingest",
            std::time::Duration::from_secs(300),
        );
        let schedule = Schedule {
            id: uuid::Uuid::now_v7(),
            name: new.name,
            target_type: new.target_type,
            target_name: new.target_name,
            kind: new.kind,
            cron_expression: None,
            interval_seconds: new.interval_seconds,
            timezone: new.timezone,
            enabled: true,
            last_run_at: None,
            next_run_at: None,
            params_template: new.params_template,
            max_instances: 1,
            misfire_grace_seconds: 60,
            version: 1,
        };

        let after = Utc.with_ymd_and_hms(2026, 1, 2, 12, 0, 0).unwrap();
        let next = compute_next_run(&schedule, after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 2, 12, 5, 0).unwrap());
    }
}
