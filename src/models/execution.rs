use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work a unit performs for a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Move aging rows from the source table into the archive table.
    Archival,
    /// Delete expired rows from the archive table.
    Purge,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::Archival, JobType::Purge];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Archival => "archival",
            JobType::Purge => "purge",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "archival" => Ok(JobType::Archival),
            "purge" => Ok(JobType::Purge),
            _ => Err(format!("Invalid job type: {}", s)),
        }
    }
}

/// Lifecycle state of a job execution record.
///
/// `Running` is the only non-terminal state; a record leaves it exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

/// Counters produced by an engine run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub records_processed: u64,
    pub records_archived: u64,
    pub records_deleted: u64,
    /// Number of non-empty batches committed.
    pub batches: u64,
}

/// Terminal result a unit reports back for its execution record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub stats: JobStats,
    pub error_message: Option<String>,
}

impl ExecutionOutcome {
    pub fn completed(stats: JobStats) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            stats,
            error_message: None,
        }
    }

    pub fn failed(stats: JobStats, message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            stats,
            error_message: Some(message.into()),
        }
    }
}

/// One dispatched unit of work as recorded in the orchestrator store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub policy_id: i64,
    pub job_type: JobType,
    pub status: ExecutionStatus,
    /// Identifier of the launched worker (process id or container id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_handle: Option<String>,
    pub records_processed: i64,
    pub records_archived: i64,
    pub records_deleted: i64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}
