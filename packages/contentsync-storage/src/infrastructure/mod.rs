//! Infrastructure layer - storage adapters

pub mod cached;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use cached::CachedLedger;
pub use memory::{InMemoryLedger, InMemoryStatusLog};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteLedger, SqliteStatusLog};
