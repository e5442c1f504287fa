//! Launching isolated units of work.
//!
//! A dispatcher starts one unit per (policy, job type) with the parameter
//! bundle as its only input, and reports whether the launch itself worked.
//! It never observes the job's outcome: units write their own terminal status
//! into the orchestrator store.

mod docker;
pub mod params;
mod process;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use docker::DockerDispatcher;
pub use params::{ParamsError, UnitContext, WorkerParams};
pub use process::ProcessDispatcher;
use thiserror::Error;

use crate::{
    config::DispatcherConfig,
    models::{JobType, RetentionPolicy},
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to start worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Container runtime error: {0}")]
    Runtime(String),
}

/// Opaque identifier of a launched unit (process id or container id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle(String);

impl WorkerHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Start one unit for `policy`. Returns once the unit has started, not
    /// when it finishes.
    async fn launch(
        &self,
        policy: &RetentionPolicy,
        job_type: JobType,
        execution_id: i64,
    ) -> Result<WorkerHandle, DispatchError>;
}

/// Build the dispatcher selected by `[dispatcher]`.
pub fn from_config(
    config: &DispatcherConfig,
    context: UnitContext,
) -> Result<Arc<dyn WorkerDispatcher>, DispatchError> {
    let dispatcher: Arc<dyn WorkerDispatcher> = match config {
        DispatcherConfig::Process(c) => Arc::new(ProcessDispatcher::from_config(c, context)?),
        DispatcherConfig::Docker(c) => Arc::new(DockerDispatcher::new(c.clone(), context)),
    };
    tracing::debug!(dispatcher = dispatcher.name(), "Worker dispatcher configured");
    Ok(dispatcher)
}

/// `das-worker-<policy>-<job>-<YYYYmmddHHMMSS>`, the name units run under.
pub fn unit_name(policy_id: i64, job_type: JobType, at: DateTime<Utc>) -> String {
    format!(
        "das-worker-{}-{}-{}",
        policy_id,
        job_type,
        at.format("%Y%m%d%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_unit_name() {
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            unit_name(12, JobType::Purge, at),
            "das-worker-12-purge-20250102030405"
        );
    }

    #[test]
    fn test_from_config_docker() {
        let context = UnitContext {
            orchestrator: None,
            batch_size: 10,
            connect_timeout_secs: 5,
        };
        let dispatcher = from_config(
            &DispatcherConfig::Docker(Default::default()),
            context.clone(),
        )
        .unwrap();
        assert_eq!(dispatcher.name(), "docker");

        let dispatcher = from_config(&DispatcherConfig::default(), context).unwrap();
        assert_eq!(dispatcher.name(), "process");
    }
}
