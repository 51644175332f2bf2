//! SQLite-backed storage: a staging writer, snapshot readers and the
//! migrations that shape the on-disk store.

pub mod migrations;
pub mod query;
mod reader;
mod scripts;
mod writer;

pub use migrations::{CURRENT_SCHEMA, Migration, MigrationRegistry, MigrationStep};
pub use query::{Comparison, MetadataFilter, Predicate};
pub use reader::{SearchMode, SqliteReader};
pub use writer::{AnalyzedDocument, SqliteWriter};
