mod executions;
mod policies;

pub use executions::ExecutionRepo;
pub use policies::PolicyRepo;
