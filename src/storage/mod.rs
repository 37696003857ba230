//! Storage backends for persona-memory

mod namespace;
mod records;
mod sqlite;
pub mod vector;

pub use namespace::Namespace;
pub(crate) use namespace::{Decision, Step};
pub use records::RecordStore;
pub use sqlite::SqliteStorage;
pub use vector::{cosine_similarity, VectorIndex};
