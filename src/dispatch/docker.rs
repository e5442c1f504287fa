use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;

use super::{
    DispatchError, UnitContext, WorkerDispatcher, WorkerHandle, WorkerParams, unit_name,
};
use crate::{
    config::DockerDispatcherConfig,
    models::{JobType, RetentionPolicy},
};

/// Runs each unit as a detached container through the container CLI.
///
/// Bundle values are passed as `-e KEY` with the value set in the CLI's own
/// environment, so credentials never appear in the process list.
pub struct DockerDispatcher {
    config: DockerDispatcherConfig,
    context: UnitContext,
}

impl DockerDispatcher {
    pub fn new(config: DockerDispatcherConfig, context: UnitContext) -> Self {
        Self { config, context }
    }

    fn command(
        &self,
        params: &WorkerParams,
        name: &str,
        policy_id: i64,
        execution_id: i64,
    ) -> Command {
        let mut command = Command::new(&self.config.docker_binary);
        command.arg("run").arg("--detach");
        if self.config.auto_remove {
            command.arg("--rm");
        }
        command.arg("--name").arg(name);
        if let Some(network) = &self.config.network {
            command.arg("--network").arg(network);
        }

        for (key, value) in [
            ("das.service", "worker".to_string()),
            ("das.config_id", policy_id.to_string()),
            ("das.job_type", params.job_type.to_string()),
            ("das.job_execution_id", execution_id.to_string()),
        ] {
            command.arg("--label").arg(format!("{key}={value}"));
        }

        for key in WorkerParams::all_keys() {
            command.env_remove(key);
        }
        for (key, value) in params.to_env() {
            command.arg("-e").arg(&key);
            command.env(key, value);
        }

        command
            .arg(&self.config.image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

#[async_trait]
impl WorkerDispatcher for DockerDispatcher {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn launch(
        &self,
        policy: &RetentionPolicy,
        job_type: JobType,
        execution_id: i64,
    ) -> Result<WorkerHandle, DispatchError> {
        let params = WorkerParams::for_policy(policy, job_type, Some(execution_id), &self.context);
        let name = unit_name(policy.id, job_type, Utc::now());

        let output = self
            .command(&params, &name, policy.id, execution_id)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DispatchError::Runtime(format!(
                "{} run exited with {}: {}",
                self.config.docker_binary,
                output.status,
                stderr.trim()
            )));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(DispatchError::Runtime(format!(
                "{} run printed no container id",
                self.config.docker_binary
            )));
        }

        tracing::info!(
            unit = %name,
            container = %container_id.chars().take(12).collect::<String>(),
            image = %self.config.image,
            policy_id = policy.id,
            job_type = %job_type,
            execution_id,
            "Spawned worker container"
        );

        Ok(WorkerHandle::new(container_id))
    }
}
