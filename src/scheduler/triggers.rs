use crate::error::{Result, SchedulerError};
use crate::model::Schedule;
use chrono::{DateTime, Local, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

/// How far down the cron iterator to look for an instant inside the window
/// before concluding the trigger never fires.
const WINDOW_SEARCH_LIMIT: usize = 10_000;

/// Identity of an installed trigger. A share is covered by at most one
/// trigger: its own, or its device's fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKey {
    Share(Uuid),
    Device(Uuid),
}

#[derive(Debug, Clone)]
pub struct Trigger {
    pub key: TriggerKey,
    pub device_id: Uuid,
    /// Absent for device-level triggers.
    pub share_id: Option<Uuid>,
    pub schedule: Schedule,
    pub next_run: Option<DateTime<Utc>>,
}

impl Trigger {
    pub fn new(
        key: TriggerKey,
        device_id: Uuid,
        share_id: Option<Uuid>,
        schedule: Schedule,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let next_run = next_run_after(&schedule, now)?;
        debug!(?key, next_run = ?next_run, "Trigger installed");
        Ok(Self {
            key,
            device_id,
            share_id,
            schedule,
            next_run,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_run {
            Some(next_run) => next_run <= now,
            None => false,
        }
    }
}

/// Parses a cron expression with seconds resolution. Five-field
/// (minute-resolution) expressions are accepted and pinned to second zero.
pub fn parse_cron(expression: &str) -> Result<CronSchedule> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };

    CronSchedule::from_str(&normalized).map_err(|e| {
        SchedulerError::InvalidCronExpression(format!(
            "failed to parse '{}': {}",
            expression, e
        ))
        .into()
    })
}

/// Whether `instant` falls inside the schedule's local-clock window.
/// Windows wrapping midnight (start > end) are honoured.
pub fn in_window(schedule: &Schedule, instant: DateTime<Utc>) -> bool {
    let (Some(start), Some(end)) = (schedule.window_start, schedule.window_end) else {
        return true;
    };

    let local_time = instant.with_timezone(&Local).time();
    if start <= end {
        local_time >= start && local_time <= end
    } else {
        local_time >= start || local_time <= end
    }
}

/// First cron instant strictly after `after` that falls inside the window,
/// or `None` when the window never admits one within the search horizon.
pub fn next_run_after(schedule: &Schedule, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let cron = parse_cron(&schedule.cron)?;
    Ok(cron
        .after(&after)
        .take(WINDOW_SEARCH_LIMIT)
        .find(|instant| in_window(schedule, *instant)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Timelike};

    fn schedule(cron: &str) -> Schedule {
        Schedule {
            cron: cron.to_string(),
            window_start: None,
            window_end: None,
        }
    }

    #[test]
    fn test_five_field_expression_gets_seconds() {
        let cron = parse_cron("0 2 * * *").expect("Failed to parse five-field expression");
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = cron.after(&now).next().expect("Next instant expected");
        assert_eq!(next.hour(), 2);
        assert_eq!(next.minute(), 0);
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn test_six_field_expression_passes_through() {
        let cron = parse_cron("30 */5 * * * *").expect("Failed to parse six-field expression");
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = cron.after(&now).next().expect("Next instant expected");
        assert_eq!(next.second(), 30);
    }

    #[test]
    fn test_invalid_expression_rejected() {
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("* * *").is_err());
    }

    #[test]
    fn test_next_run_advances() {
        let sched = schedule("*/5 * * * *");
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 1, 0).unwrap();

        let next = next_run_after(&sched, now)
            .expect("Failed to compute next run")
            .expect("Next run expected");
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 12, 5, 0).unwrap());

        let after_next = next_run_after(&sched, next)
            .expect("Failed to compute next run")
            .expect("Next run expected");
        assert_eq!(after_next, Utc.with_ymd_and_hms(2026, 1, 1, 12, 10, 0).unwrap());
    }

    #[test]
    fn test_window_filters_instants() {
        // Hourly cron, but only a two-hour local window admits fires.
        let start = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(11, 0, 0).unwrap();
        let sched = Schedule {
            cron: "0 * * * *".to_string(),
            window_start: Some(start),
            window_end: Some(end),
        };

        let now = Utc::now();
        let next = next_run_after(&sched, now)
            .expect("Failed to compute next run")
            .expect("A windowed instant must exist within the horizon");
        assert!(in_window(&sched, next));

        let local = next.with_timezone(&Local).time();
        assert!(local >= start && local <= end);
    }

    #[test]
    fn test_window_wrapping_midnight() {
        let sched = Schedule {
            cron: "0 * * * *".to_string(),
            window_start: Some(NaiveTime::from_hms_opt(22, 0, 0).unwrap()),
            window_end: Some(NaiveTime::from_hms_opt(2, 0, 0).unwrap()),
        };

        let inside = Local
            .with_ymd_and_hms(2026, 1, 1, 23, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let also_inside = Local
            .with_ymd_and_hms(2026, 1, 2, 1, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let outside = Local
            .with_ymd_and_hms(2026, 1, 1, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);

        assert!(in_window(&sched, inside));
        assert!(in_window(&sched, also_inside));
        assert!(!in_window(&sched, outside));
    }

    #[test]
    fn test_trigger_due() {
        let now = Utc::now();
        let mut trigger = Trigger::new(
            TriggerKey::Share(Uuid::new_v4()),
            Uuid::new_v4(),
            Some(Uuid::new_v4()),
            schedule("*/5 * * * *"),
            now,
        )
        .expect("Failed to build trigger");

        assert!(!trigger.is_due(now));
        trigger.next_run = Some(now - chrono::Duration::minutes(1));
        assert!(trigger.is_due(now));
        trigger.next_run = None;
        assert!(!trigger.is_due(now));
    }
}
