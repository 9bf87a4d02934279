//! Sliding-window chunking with overlap.
//!
//! Chunk sizes are measured in characters, not bytes, so multi-byte text
//! never splits inside a code point.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// One chunk of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Dense index starting at 0.
    pub index: u32,
    pub text: String,
    /// Character offset of the chunk start in the clean text.
    pub start_offset: usize,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkerConfigError {
    #[error("max_chunk_size must be > 0, got {0}")]
    ZeroChunkSize(usize),

    #[error("overlap_size ({overlap}) must be < max_chunk_size ({size})")]
    OverlapTooLarge { overlap: usize, size: usize },

    #[error("max_chunks must be > 0, got {0}")]
    ZeroMaxChunks(usize),
}

/// Chunking configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Maximum characters per chunk.
    pub max_chunk_size: usize,
    /// Characters shared between adjacent chunks.
    pub overlap_size: usize,
    /// Cap on chunks per document; bounds the work per page.
    pub max_chunks: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 3000,
            overlap_size: 200,
            max_chunks: 20,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<(), ChunkerConfigError> {
        if self.max_chunk_size == 0 {
            return Err(ChunkerConfigError::ZeroChunkSize(self.max_chunk_size));
        }
        if self.overlap_size >= self.max_chunk_size {
            return Err(ChunkerConfigError::OverlapTooLarge {
                overlap: self.overlap_size,
                size: self.max_chunk_size,
            });
        }
        if self.max_chunks == 0 {
            return Err(ChunkerConfigError::ZeroMaxChunks(self.max_chunks));
        }
        Ok(())
    }
}

/// Splits clean text into overlapping windows.
#[derive(Debug, Clone)]
pub struct SlidingWindowChunker {
    config: ChunkerConfig,
}

impl SlidingWindowChunker {
    pub fn new(config: ChunkerConfig) -> Result<Self, ChunkerConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split `text` into chunks.
    ///
    /// - Empty input yields an empty list.
    /// - Input not longer than `max_chunk_size` yields exactly one chunk.
    /// - Adjacent chunks share exactly `overlap_size` characters; the last
    ///   chunk may be shorter.
    /// - At most `max_chunks` chunks are produced; the tail beyond the cap
    ///   is dropped with a warning.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        if text.is_empty() {
            return vec![];
        }

        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= self.config.max_chunk_size {
            return vec![Chunk {
                index: 0,
                text: text.to_string(),
                start_offset: 0,
            }];
        }

        let step = self.config.max_chunk_size - self.config.overlap_size;
        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < chars.len() {
            if chunks.len() >= self.config.max_chunks {
                warn!(
                    max_chunks = self.config.max_chunks,
                    dropped_chars = chars.len() - start,
                    "chunk cap reached, dropping document tail"
                );
                break;
            }

            let end = (start + self.config.max_chunk_size).min(chars.len());
            chunks.push(Chunk {
                index: chunks.len() as u32,
                text: chars[start..end].iter().collect(),
                start_offset: start,
            });

            if end == chars.len() {
                break;
            }
            start += step;
        }

        chunks
    }

    /// Failure policy: when a document cannot be chunked sensibly, return
    /// the whole clean text as a single chunk rather than failing it.
    pub fn single_chunk(text: &str) -> Vec<Chunk> {
        if text.is_empty() {
            return vec![];
        }
        vec![Chunk {
            index: 0,
            text: text.to_string(),
            start_offset: 0,
        }]
    }
}
