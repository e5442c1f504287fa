mod executions;
mod policies;

pub use executions::PostgresExecutionRepo;
pub use policies::PostgresPolicyRepo;
