//! Orchestrator configuration.
//!
//! Every field has a default; `from_env` overrides individual fields from
//! `DEPFLOW_*` variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FlowResult};
use crate::orchestrator::dispatcher::PoolConfig;
use crate::orchestrator::schedule;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub workers: usize,
    pub idle_poll_ms: u64,
    pub restart_cooldown_secs: u64,
    /// Attempts before a transiently failing work item is abandoned.
    pub max_deliveries: u32,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_secs: u64,
    /// How long a finished build-event expansion is remembered.
    pub cache_ttl_secs: u64,
    /// IANA zone the cron expressions are evaluated in.
    pub time_zone: String,
    pub daily_cron: String,
    pub twice_daily_cron: String,
    pub weekly_cron: String,
    pub report_cron: String,
    /// Build-duration look-back window for flow graphs.
    pub graph_days: u32,
    /// Cap on concurrent outbound calls.
    pub max_parallelism: usize,
    pub bind_address: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            idle_poll_ms: 1_000,
            restart_cooldown_secs: 30,
            max_deliveries: 10,
            retry_backoff_ms: 1_000,
            max_retry_backoff_secs: 300,
            cache_ttl_secs: 300,
            time_zone: schedule::REFERENCE_TIME_ZONE.to_string(),
            daily_cron: schedule::DAILY.to_string(),
            twice_daily_cron: schedule::TWICE_DAILY.to_string(),
            weekly_cron: schedule::WEEKLY.to_string(),
            report_cron: schedule::LONGEST_PATH_REPORT.to_string(),
            graph_days: 30,
            max_parallelism: 8,
            bind_address: "127.0.0.1:8080".to_string(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: String) -> FlowResult<T> {
    value
        .parse()
        .map_err(|_| FlowError::Config(format!("{name}: cannot parse '{value}'")))
}

fn override_from<T: FromStr>(target: &mut T, name: &str) -> FlowResult<()> {
    if let Ok(value) = env::var(name) {
        *target = parse_var(name, value)?;
    }
    Ok(())
}

impl OrchestratorConfig {
    /// Defaults overridden by `DEPFLOW_WORKERS`, `DEPFLOW_IDLE_POLL_MS`,
    /// `DEPFLOW_RESTART_COOLDOWN_SECS`, `DEPFLOW_MAX_DELIVERIES`,
    /// `DEPFLOW_RETRY_BACKOFF_MS`, `DEPFLOW_MAX_RETRY_BACKOFF_SECS`,
    /// `DEPFLOW_CACHE_TTL_SECS`,
    /// `DEPFLOW_TIME_ZONE`, `DEPFLOW_DAILY_CRON`, `DEPFLOW_TWICE_DAILY_CRON`,
    /// `DEPFLOW_WEEKLY_CRON`, `DEPFLOW_REPORT_CRON`, `DEPFLOW_GRAPH_DAYS`,
    /// `DEPFLOW_MAX_PARALLELISM` and `DEPFLOW_BIND_ADDRESS`.
    pub fn from_env() -> FlowResult<Self> {
        let mut c = Self::default();
        override_from(&mut c.workers, "DEPFLOW_WORKERS")?;
        override_from(&mut c.idle_poll_ms, "DEPFLOW_IDLE_POLL_MS")?;
        override_from(&mut c.restart_cooldown_secs, "DEPFLOW_RESTART_COOLDOWN_SECS")?;
        override_from(&mut c.max_deliveries, "DEPFLOW_MAX_DELIVERIES")?;
        override_from(&mut c.retry_backoff_ms, "DEPFLOW_RETRY_BACKOFF_MS")?;
        override_from(&mut c.max_retry_backoff_secs, "DEPFLOW_MAX_RETRY_BACKOFF_SECS")?;
        override_from(&mut c.cache_ttl_secs, "DEPFLOW_CACHE_TTL_SECS")?;
        override_from(&mut c.time_zone, "DEPFLOW_TIME_ZONE")?;
        override_from(&mut c.daily_cron, "DEPFLOW_DAILY_CRON")?;
        override_from(&mut c.twice_daily_cron, "DEPFLOW_TWICE_DAILY_CRON")?;
        override_from(&mut c.weekly_cron, "DEPFLOW_WEEKLY_CRON")?;
        override_from(&mut c.report_cron, "DEPFLOW_REPORT_CRON")?;
        override_from(&mut c.graph_days, "DEPFLOW_GRAPH_DAYS")?;
        override_from(&mut c.max_parallelism, "DEPFLOW_MAX_PARALLELISM")?;
        override_from(&mut c.bind_address, "DEPFLOW_BIND_ADDRESS")?;
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> FlowResult<()> {
        if self.workers == 0 {
            return Err(FlowError::Config("workers must be at least 1".into()));
        }
        if self.max_deliveries == 0 {
            return Err(FlowError::Config("max_deliveries must be at least 1".into()));
        }
        if self.max_parallelism == 0 {
            return Err(FlowError::Config("max_parallelism must be at least 1".into()));
        }
        schedule::frequency_schedules(
            &self.daily_cron,
            &self.twice_daily_cron,
            &self.weekly_cron,
            &self.time_zone,
        )?;
        schedule::CronSchedule::parse("report", &self.report_cron, &self.time_zone)?;
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            idle_poll: Duration::from_millis(self.idle_poll_ms),
            restart_cooldown: Duration::from_secs(self.restart_cooldown_secs),
            max_deliveries: self.max_deliveries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_retry_backoff: Duration::from_secs(self.max_retry_backoff_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = OrchestratorConfig::default();
        c.validate().unwrap();
        assert_eq!(c.pool_config().idle_poll, Duration::from_secs(1));
        assert_eq!(c.pool_config().restart_cooldown, Duration::from_secs(30));
        assert_eq!(c.pool_config().max_deliveries, 10);
        assert_eq!(c.pool_config().retry_delay(1), Duration::from_secs(1));
        assert_eq!(c.graph_days, 30);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let c: OrchestratorConfig =
            serde_json::from_str(r#"{"workers": 16, "time_zone": "UTC"}"#).unwrap();
        assert_eq!(c.workers, 16);
        assert_eq!(c.time_zone, "UTC");
        assert_eq!(c.max_parallelism, 8);
        c.validate().unwrap();
    }

    #[test]
    fn invalid_values_are_rejected() {
        let zero = OrchestratorConfig {
            workers: 0,
            ..OrchestratorConfig::default()
        };
        assert!(matches!(zero.validate(), Err(FlowError::Config(_))));

        let no_attempts = OrchestratorConfig {
            max_deliveries: 0,
            ..OrchestratorConfig::default()
        };
        assert!(matches!(no_attempts.validate(), Err(FlowError::Config(_))));

        let bad_cron = OrchestratorConfig {
            weekly_cron: "sometimes".into(),
            ..OrchestratorConfig::default()
        };
        assert!(matches!(
            bad_cron.validate(),
            Err(FlowError::InvalidSchedule { .. })
        ));
        assert!(parse_var::<usize>("DEPFLOW_WORKERS", "many".into()).is_err());
    }
}
