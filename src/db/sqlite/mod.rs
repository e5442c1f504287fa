mod executions;
mod policies;

pub use executions::SqliteExecutionRepo;
pub use policies::SqlitePolicyRepo;
