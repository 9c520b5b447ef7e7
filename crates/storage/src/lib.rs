pub mod cache;
pub mod error;
pub mod graph;
pub mod schema;
pub mod sqlite;
pub mod traits;
pub mod untracked;

pub use cache::{CacheTableRegistry, STATE_COLUMNS, cache_table_name, quote_literal, resolved_state_sql};
pub use error::StorageError;
pub use sqlite::SqliteStorage;
pub use traits::*;
