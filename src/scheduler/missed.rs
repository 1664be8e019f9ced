use crate::error::Result;
use crate::model::Schedule;
use crate::scheduler::triggers::{in_window, parse_cron};
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

/// Upper bound on counted misfires; past this the exact number is noise.
const MISSED_RUN_CAP: usize = 1_000;

/// Number of cron instants in `(since, now]` that fall inside the window:
/// fires whose intended time passed while the service was down.
pub fn missed_runs(schedule: &Schedule, since: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
    let cron = parse_cron(&schedule.cron)?;

    let mut missed = 0;
    for instant in cron.after(&since) {
        if instant > now || missed >= MISSED_RUN_CAP {
            break;
        }
        if in_window(schedule, instant) {
            missed += 1;
        }
    }
    Ok(missed)
}

/// Whether a target needs a single coalesced catch-up run at startup.
/// Without any prior run there is no baseline, hence no catch-up.
pub fn needs_catch_up(
    schedule: &Schedule,
    device_id: Uuid,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(last_run) = last_run else {
        return Ok(false);
    };

    let missed = missed_runs(schedule, last_run, now)?;
    if missed > 1 {
        warn!(
            device_id = %device_id,
            missed_runs = missed,
            "Coalescing missed runs into a single catch-up"
        );
    }
    Ok(missed > 0)
}
