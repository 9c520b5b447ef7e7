mod repo;

pub use repo::{TestRepo, init_tracing, int, text, todo_schema};
