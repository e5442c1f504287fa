use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::models::ConnectionDescriptor;

/// How units are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum DispatcherConfig {
    /// Spawn `das worker` as a child process of the scheduler.
    Process(ProcessDispatcherConfig),

    /// Run each unit as a detached container.
    Docker(DockerDispatcherConfig),
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig::Process(ProcessDispatcherConfig::default())
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            DispatcherConfig::Process(c) => c.validate(),
            DispatcherConfig::Docker(c) => c.validate(),
        }
    }

    /// Orchestrator store location handed to units, if overridden.
    pub fn callback(&self) -> Option<&ConnectionDescriptor> {
        match self {
            DispatcherConfig::Process(c) => c.callback.as_ref(),
            DispatcherConfig::Docker(c) => c.callback.as_ref(),
        }
    }
}

/// Child-process dispatcher configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessDispatcherConfig {
    /// Worker executable. Defaults to the running `das` binary.
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Arguments passed to the worker executable. Defaults to `["worker"]`.
    #[serde(default)]
    pub args: Option<Vec<String>>,

    /// Orchestrator store location as seen by units.
    /// Defaults to the scheduler's own `[database]`.
    #[serde(default)]
    pub callback: Option<ConnectionDescriptor>,
}

impl ProcessDispatcherConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(program) = &self.program
            && program.as_os_str().is_empty()
        {
            return Err(ConfigError::Validation(
                "dispatcher.program cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Container dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DockerDispatcherConfig {
    /// Worker image. Its entrypoint must run `das worker`.
    #[serde(default = "default_image")]
    pub image: String,

    /// Network the container joins.
    #[serde(default = "default_network")]
    pub network: Option<String>,

    /// Container CLI to invoke (`docker`, `podman`, ...).
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,

    /// Remove the container when it exits.
    #[serde(default = "default_true")]
    pub auto_remove: bool,

    /// Orchestrator store location as seen from inside the container.
    #[serde(default)]
    pub callback: Option<ConnectionDescriptor>,
}

impl Default for DockerDispatcherConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            network: default_network(),
            docker_binary: default_docker_binary(),
            auto_remove: true,
            callback: None,
        }
    }
}

impl DockerDispatcherConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::Validation(
                "dispatcher.image cannot be empty".into(),
            ));
        }
        if self.docker_binary.trim().is_empty() {
            return Err(ConfigError::Validation(
                "dispatcher.docker_binary cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_image() -> String {
    "das-worker:latest".to_string()
}

fn default_network() -> Option<String> {
    Some("das-network".to_string())
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_true() -> bool {
    true
}
