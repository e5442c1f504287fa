use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;

use super::{
    DispatchError, UnitContext, WorkerDispatcher, WorkerHandle, WorkerParams, unit_name,
};
use crate::{
    config::ProcessDispatcherConfig,
    models::{JobType, RetentionPolicy},
};

/// Runs each unit as a child process, by default `das worker`.
///
/// Children inherit the scheduler's stdout/stderr so their logs land in the
/// same stream. Each child is reaped by a background task.
pub struct ProcessDispatcher {
    program: PathBuf,
    args: Vec<String>,
    context: UnitContext,
}

impl ProcessDispatcher {
    pub fn new(program: PathBuf, args: Vec<String>, context: UnitContext) -> Self {
        Self {
            program,
            args,
            context,
        }
    }

    pub fn from_config(
        config: &ProcessDispatcherConfig,
        context: UnitContext,
    ) -> Result<Self, DispatchError> {
        let program = match &config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        let args = config
            .args
            .clone()
            .unwrap_or_else(|| vec!["worker".to_string()]);
        Ok(Self::new(program, args, context))
    }

    fn command(&self, params: &WorkerParams) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        // Nothing from the scheduler's own environment may leak into the bundle.
        for key in WorkerParams::all_keys() {
            command.env_remove(key);
        }
        command.envs(params.to_env());
        command
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        command
    }
}

#[async_trait]
impl WorkerDispatcher for ProcessDispatcher {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn launch(
        &self,
        policy: &RetentionPolicy,
        job_type: JobType,
        execution_id: i64,
    ) -> Result<WorkerHandle, DispatchError> {
        let params = WorkerParams::for_policy(policy, job_type, Some(execution_id), &self.context);
        let name = unit_name(policy.id, job_type, Utc::now());

        let mut child = self.command(&params).spawn()?;
        let pid = child.id().unwrap_or_default();

        let reaped_name = name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::debug!(unit = %reaped_name, "Worker process exited");
                }
                Ok(status) => {
                    tracing::warn!(unit = %reaped_name, status = %status, "Worker process failed");
                }
                Err(e) => {
                    tracing::warn!(unit = %reaped_name, error = %e, "Failed to wait on worker process");
                }
            }
        });

        tracing::info!(
            unit = %name,
            pid,
            policy_id = policy.id,
            job_type = %job_type,
            execution_id,
            "Spawned worker process"
        );

        Ok(WorkerHandle::new(format!("{}:{}", name, pid)))
    }
}
