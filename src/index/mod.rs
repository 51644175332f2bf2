//! Directory-level index handles: a locked transactional writer and snapshot
//! readers that validate queries against the schema.

mod analyse;
mod analytics;
mod reader;
mod writer;

pub use analyse::frame_text;
pub use analytics::{case_fold_pairs, npmi};
pub use reader::IndexReader;
pub use writer::{IndexWriter, WriterState};
