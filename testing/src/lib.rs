//! Shared test fixtures for the permissions sync workspace.
//!
//! Provides:
//! - A single PostgreSQL testcontainer per test process (port 5432),
//!   lazily started and `None` when Docker is unavailable
//! - A scriptable in-process authorization provider

mod fixtures;
mod provider;

pub use fixtures::*;
pub use provider::MockProvider;
