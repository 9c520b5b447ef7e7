pub mod change;
pub mod error;
pub mod ids;
pub mod log;
pub mod plugin;
pub mod schema;

pub use change::{Change, ChangeSetElement, Commit, EntityKey, LeafChange, Version};
pub use error::CoreError;
pub use ids::*;
pub use log::{LogEvent, LogLevel};
pub use plugin::{DetectedChange, DetectedConflict, FileChange, Plugin};
pub use schema::Schema;
