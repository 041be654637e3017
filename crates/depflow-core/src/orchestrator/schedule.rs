//! Cron timers evaluated in a fixed reference time zone.
//!
//! Expressions use the six-field `sec min hour day month day-of-week` form.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use flow_state::UpdateFrequency;
use tracing::{debug, info};

use crate::error::{FlowError, FlowResult};
use crate::sync::AsyncManualResetEvent;

pub const DAILY: &str = "0 0 5 * * *";
pub const TWICE_DAILY: &str = "0 0 5,19 * * *";
pub const WEEKLY: &str = "0 0 5 * * Mon";
pub const LONGEST_PATH_REPORT: &str = "0 0 0 * * *";
pub const REFERENCE_TIME_ZONE: &str = "America/Los_Angeles";

#[derive(Debug, Clone)]
pub struct CronSchedule {
    name: String,
    expression: String,
    schedule: Schedule,
    tz: Tz,
}

impl CronSchedule {
    pub fn parse(name: &str, expression: &str, time_zone: &str) -> FlowResult<Self> {
        let schedule =
            Schedule::from_str(expression).map_err(|e| FlowError::InvalidSchedule {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        let tz: Tz = time_zone.parse().map_err(|_| FlowError::InvalidSchedule {
            expression: expression.to_string(),
            reason: format!("unknown time zone: {time_zone}"),
        })?;
        Ok(Self {
            name: name.to_string(),
            expression: expression.to_string(),
            schedule,
            tz,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let now_tz = now.with_timezone(&self.tz);
        self.schedule
            .after(&now_tz)
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Wall-clock delay from `now` to the next fire time.
    pub fn delay_until_next(&self, now: DateTime<Utc>) -> Option<Duration> {
        let next = self.next_after(now)?;
        (next - now).to_std().ok()
    }
}

/// The timer for each polling frequency tier.
pub fn frequency_schedules(
    daily: &str,
    twice_daily: &str,
    weekly: &str,
    time_zone: &str,
) -> FlowResult<Vec<(UpdateFrequency, CronSchedule)>> {
    Ok(vec![
        (
            UpdateFrequency::EveryDay,
            CronSchedule::parse("every-day", daily, time_zone)?,
        ),
        (
            UpdateFrequency::TwiceDaily,
            CronSchedule::parse("twice-daily", twice_daily, time_zone)?,
        ),
        (
            UpdateFrequency::EveryWeek,
            CronSchedule::parse("every-week", weekly, time_zone)?,
        ),
    ])
}

/// Run `job` at every fire time of `schedule` until `shutdown` is set.
pub async fn run_timer<F, Fut>(schedule: CronSchedule, shutdown: Arc<AsyncManualResetEvent>, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    info!(timer = schedule.name(), cron = schedule.expression(), "timer started");
    loop {
        let Some(delay) = schedule.delay_until_next(Utc::now()) else {
            info!(timer = schedule.name(), "schedule has no further fire times");
            return;
        };
        debug!(timer = schedule.name(), delay_secs = delay.as_secs(), "timer sleeping");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait() => break,
        }
        job().await;
    }
    info!(timer = schedule.name(), "timer stopped");
}
