//! vs-storage: what a folder keeps on disk
//!
//! - `index`: catalogue of accepted signed metas and per-chunk assembly state
//! - `chunk`: tiered content-addressed chunk store (memory, encrypted, open)
//! - `assembler`: materializes metas into the plaintext folder tree

pub mod assembler;
pub mod chunk;
pub mod index;

pub use assembler::FileAssembler;
pub use chunk::{ChunkEvent, ChunkStorage};
pub use index::{Index, IndexBackendKind, IndexEvent, PutMetaOutcome};
