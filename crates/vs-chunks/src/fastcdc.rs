//! FastCDC content-defined chunking
//!
//! Splits files into variable-size chunks whose boundaries are content-defined,
//! ensuring stable chunk boundaries even when data shifts (e.g. inserting bytes
//! near the start of a file doesn't invalidate all subsequent chunks). Stable
//! boundaries plus content-derived IVs are what lets peers dedup chunks.

use vs_core::config::IndexerConfig;

/// A single content-defined chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset within the source file
    pub offset: u64,
    /// Chunk length in bytes
    pub length: usize,
}

/// Chunk size configuration
#[derive(Debug, Clone, Copy)]
pub struct ChunkSizes {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl ChunkSizes {
    /// Small bounds, mostly for tests and tiny folders
    pub const SMALL: ChunkSizes = ChunkSizes {
        min_size: 2 * 1024,  // 2KB
        avg_size: 4 * 1024,  // 4KB
        max_size: 16 * 1024, // 16KB
    };
}

impl From<&IndexerConfig> for ChunkSizes {
    fn from(c: &IndexerConfig) -> Self {
        ChunkSizes {
            min_size: c.min_chunksize,
            avg_size: c.avg_chunksize,
            max_size: c.max_chunksize,
        }
    }
}

/// Split `data` into content-defined chunks using FastCDC.
///
/// Returns a list of chunks. For empty data, returns an empty list.
pub fn chunk_data(data: &[u8], sizes: ChunkSizes) -> Vec<Chunk> {
    if data.is_empty() {
        return vec![];
    }

    let chunker =
        fastcdc::v2020::FastCDC::new(data, sizes.min_size, sizes.avg_size, sizes.max_size);

    chunker
        .map(|c| Chunk {
            offset: c.offset as u64,
            length: c.length,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_data_yields_no_chunks() {
        let chunks = chunk_data(&[], ChunkSizes::SMALL);
        assert!(chunks.is_empty());
    }

    #[test]
    fn chunk_offsets_are_contiguous() {
        let data: Vec<u8> = (0u8..=255).cycle().take(128 * 1024).collect();
        let chunks = chunk_data(&data, ChunkSizes::SMALL);

        let mut expected_offset = 0u64;
        for chunk in &chunks {
            assert_eq!(chunk.offset, expected_offset, "chunks must be contiguous");
            assert!(chunk.length <= ChunkSizes::SMALL.max_size as usize);
            expected_offset += chunk.length as u64;
        }
        assert_eq!(expected_offset as usize, data.len());
    }

    #[test]
    fn sizes_from_config() {
        let sizes = ChunkSizes::from(&IndexerConfig::default());
        assert_eq!(sizes.min_size, 32 * 1024);
        assert_eq!(sizes.max_size, 1024 * 1024);
    }

    proptest! {
        /// Same input gives the same boundaries
        #[test]
        fn chunking_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..=32768)) {
            let c1 = chunk_data(&data, ChunkSizes::SMALL);
            let c2 = chunk_data(&data, ChunkSizes::SMALL);
            prop_assert_eq!(c1, c2);
        }

        /// Chunks must cover the full input without gaps or overlap
        #[test]
        fn chunks_cover_full_input(data in proptest::collection::vec(any::<u8>(), 1..=65536)) {
            let chunks = chunk_data(&data, ChunkSizes::SMALL);
            let total: usize = chunks.iter().map(|c| c.length).sum();
            prop_assert_eq!(total, data.len(), "chunks must cover full input");
        }
    }
}
