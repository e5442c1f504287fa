//! Shared orchestrator store test infrastructure
//!
//! Each repository has a test module containing shared test functions that
//! take `&dyn XxxRepo`, run against in-memory SQLite on every `cargo test` and
//! against PostgreSQL via testcontainers (marked `#[ignore]`).
//!
//! ```bash
//! cargo test                       # Run fast SQLite tests only
//! cargo test -- --ignored          # Run PostgreSQL integration tests (requires Docker)
//! ```

pub mod harness;
mod policies;
