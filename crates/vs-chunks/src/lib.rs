//! vs-chunks: content-defined chunking and the local indexer
//!
//! # Overview
//! - `fastcdc`: content-defined chunk boundaries, stable under inserts
//! - `indexer`: turns a filesystem entry into a signed, encrypted meta

pub mod fastcdc;
pub mod indexer;

pub use fastcdc::{chunk_data, Chunk, ChunkSizes};
pub use indexer::{collect_entries, next_revision, IndexedEntry, Indexer};
