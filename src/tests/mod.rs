//! End-to-end tests across the scheduler, dispatcher, worker and engines.

#[cfg(feature = "database-sqlite")]
mod retention_e2e;
