//! Unit entrypoint (`das worker`).
//!
//! A unit reads its parameter bundle from the environment, runs the engine
//! named by `JOB_TYPE` and writes the terminal status of its execution record
//! into the orchestrator store. The process exit code mirrors the outcome.

use std::time::Duration;

use crate::{
    db::{DbPool, DbResult},
    dispatch::WorkerParams,
    models::{ConnectionDescriptor, ExecutionOutcome, ExecutionStatus, JobStats, JobType},
    retention::{ArchivalEngine, EngineError, JobFailure, PurgeEngine},
};

/// Timeout for reporting when the bundle was too broken to provide one.
const FALLBACK_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Run one unit with the bundle from the process environment.
pub async fn run_from_env() -> ExecutionOutcome {
    run_unit(|key| std::env::var(key).ok()).await
}

/// Run one unit with the bundle from `lookup`, report its outcome and return it.
///
/// Nothing here fails: every error becomes a `failed` outcome.
pub async fn run_unit(lookup: impl Fn(&str) -> Option<String>) -> ExecutionOutcome {
    let params = match WorkerParams::from_lookup(&lookup) {
        Ok(params) => params,
        Err(e) => {
            tracing::error!(error = %e, "Invalid worker parameters");
            let outcome = ExecutionOutcome::failed(
                JobStats::default(),
                format!("Invalid worker parameters: {e}"),
            );
            if let Some((execution_id, orchestrator)) = WorkerParams::report_target(&lookup) {
                report(&orchestrator, execution_id, &outcome, FALLBACK_CONNECT_TIMEOUT).await;
            }
            return outcome;
        }
    };

    tracing::info!(
        job_type = %params.job_type,
        config_id = params.config_id,
        execution_id = ?params.execution_id,
        table = %params.job.table_name,
        batch_size = params.job.batch_size,
        "Worker starting"
    );

    let outcome = execute(&params).await;

    match (params.execution_id, &params.orchestrator) {
        (Some(execution_id), Some(orchestrator)) => {
            report(orchestrator, execution_id, &outcome, params.connect_timeout()).await;
        }
        (Some(execution_id), None) => {
            tracing::warn!(execution_id, "No orchestrator store in parameters, status not reported");
        }
        (None, _) => {
            tracing::debug!("No execution record, status not reported");
        }
    }

    outcome
}

/// Run the engine for `params` and turn its result into an outcome.
pub async fn execute(params: &WorkerParams) -> ExecutionOutcome {
    match run_engine(params).await {
        Ok(stats) => ExecutionOutcome::completed(stats),
        Err(failure) => ExecutionOutcome::failed(failure.stats, failure.error.to_string()),
    }
}

async fn run_engine(params: &WorkerParams) -> Result<JobStats, JobFailure> {
    let timeout = params.connect_timeout();
    match params.job_type {
        JobType::Archival => {
            let source = params.source.as_ref().ok_or_else(|| {
                JobFailure::at_start(EngineError::Connection(
                    "no primary database in parameters".into(),
                ))
            })?;
            ArchivalEngine::connect(source, &params.destination, params.job.clone(), timeout)
                .await?
                .run()
                .await
        }
        JobType::Purge => {
            PurgeEngine::connect(&params.destination, params.job.clone(), timeout)
                .await?
                .run()
                .await
        }
    }
}

/// Process exit code for an outcome: 0 when completed, 1 otherwise.
pub fn exit_code(outcome: &ExecutionOutcome) -> i32 {
    match outcome.status {
        ExecutionStatus::Completed => 0,
        _ => 1,
    }
}

/// Write the terminal status. Failures are logged; the record then stays
/// `running` until reconciled.
async fn report(
    orchestrator: &ConnectionDescriptor,
    execution_id: i64,
    outcome: &ExecutionOutcome,
    timeout: Duration,
) {
    match write_outcome(orchestrator, execution_id, outcome, timeout).await {
        Ok(true) => {
            tracing::info!(execution_id, status = %outcome.status, "Execution status reported");
        }
        Ok(false) => {
            tracing::warn!(
                execution_id,
                "Execution record is not running, status left unchanged"
            );
        }
        Err(e) => {
            tracing::error!(
                execution_id,
                orchestrator = %orchestrator.location(),
                error = %e,
                "Failed to report execution status"
            );
        }
    }
}

async fn write_outcome(
    orchestrator: &ConnectionDescriptor,
    execution_id: i64,
    outcome: &ExecutionOutcome,
    timeout: Duration,
) -> DbResult<bool> {
    let db = DbPool::from_descriptor(orchestrator, timeout).await?;
    let result = db.executions().complete(execution_id, outcome).await;
    db.close().await;
    result
}
