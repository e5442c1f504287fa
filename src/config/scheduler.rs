use std::str::FromStr;

use cron::Schedule;
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Scheduler configuration.
///
/// Cron expressions accept standard 5-field crontab syntax
/// (`min hour day month weekday`) or the 6/7-field form with a leading
/// seconds field. Schedules are evaluated in UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Start the timers on `das serve`. Manual `das run` cycles work either way.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// When archival cycles fire.
    #[serde(default = "default_archival_cron")]
    pub archival_cron: String,

    /// When purge cycles fire.
    #[serde(default = "default_purge_cron")]
    pub purge_cron: String,

    /// Rows moved or deleted per batch, passed to every unit.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Connection timeout units use for each database.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Mark `running` executions older than this as failed at the start of
    /// each cycle. 0 disables reconciliation.
    #[serde(default)]
    pub stale_after_mins: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            archival_cron: default_archival_cron(),
            purge_cron: default_purge_cron(),
            batch_size: default_batch_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            stale_after_mins: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_cron(&self.archival_cron).map_err(|e| {
            ConfigError::Validation(format!("scheduler.archival_cron: {}", e))
        })?;
        parse_cron(&self.purge_cron)
            .map_err(|e| ConfigError::Validation(format!("scheduler.purge_cron: {}", e)))?;

        if self.batch_size == 0 {
            return Err(ConfigError::Validation(
                "scheduler.batch_size must be at least 1".into(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "scheduler.connect_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn archival_schedule(&self) -> Result<Schedule, ConfigError> {
        parse_cron(&self.archival_cron).map_err(ConfigError::Validation)
    }

    pub fn purge_schedule(&self) -> Result<Schedule, ConfigError> {
        parse_cron(&self.purge_cron).map_err(ConfigError::Validation)
    }
}

/// Parse a cron expression, accepting 5-field crontab syntax.
///
/// The `cron` crate requires a seconds field; 5-field expressions fire at
/// second 0.
pub fn parse_cron(expression: &str) -> Result<Schedule, String> {
    let trimmed = expression.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {}", trimmed),
        6 | 7 => trimmed.to_string(),
        n => {
            return Err(format!(
                "invalid cron expression '{}': expected 5, 6 or 7 fields, got {}",
                expression, n
            ));
        }
    };

    Schedule::from_str(&normalized)
        .map_err(|e| format!("invalid cron expression '{}': {}", expression, e))
}

fn default_archival_cron() -> String {
    "0 2 * * *".to_string() // 02:00 UTC daily
}

fn default_purge_cron() -> String {
    "0 3 * * *".to_string() // 03:00 UTC daily
}

fn default_batch_size() -> u32 {
    1000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}
