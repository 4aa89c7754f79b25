//! Noncontiguous byte blocks.

use std::borrow::Cow;
use std::sync::Arc;

use crate::hash::{ContentHash, ContentHasher};

/// A sequence of immutable byte chunks treated as one logical buffer.
///
/// Chunks are reference counted, so splicing a block into another shares
/// its storage.
#[derive(Debug, Clone, Default)]
pub struct ByteBlock {
    chunks: Vec<Arc<[u8]>>,
    total: usize,
}

impl ByteBlock {
    /// An empty block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Empty chunks are dropped.
    pub fn push(&mut self, chunk: impl Into<Arc<[u8]>>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.total += chunk.len();
        self.chunks.push(chunk);
    }

    /// Append every chunk of `other`, sharing storage.
    pub fn append(&mut self, other: &ByteBlock) {
        for chunk in &other.chunks {
            self.total += chunk.len();
            self.chunks.push(Arc::clone(chunk));
        }
    }

    /// Logical length.
    pub fn total_byte_count(&self) -> usize {
        self.total
    }

    /// Whether the block holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// The chunks in order.
    pub fn chunks(&self) -> &[Arc<[u8]>] {
        &self.chunks
    }

    /// The bytes as one slice, copying only when there is more than one chunk.
    pub fn to_contiguous(&self) -> Cow<'_, [u8]> {
        match self.chunks.as_slice() {
            [] => Cow::Borrowed(&[]),
            [only] => Cow::Borrowed(&only[..]),
            many => {
                let mut out = Vec::with_capacity(self.total);
                for chunk in many {
                    out.extend_from_slice(chunk);
                }
                Cow::Owned(out)
            }
        }
    }

    /// Hash of the logical contents, independent of chunking.
    pub fn content_hash(&self) -> ContentHash {
        let mut hasher = ContentHasher::new();
        self.hash_into(&mut hasher);
        hasher.finalize()
    }

    pub(crate) fn hash_into(&self, hasher: &mut ContentHasher) {
        hasher.update_u64(self.total as u64);
        for chunk in &self.chunks {
            hasher.update(chunk);
        }
    }
}

impl From<Vec<u8>> for ByteBlock {
    fn from(bytes: Vec<u8>) -> Self {
        let mut block = Self::new();
        block.push(bytes);
        block
    }
}

impl PartialEq for ByteBlock {
    fn eq(&self, other: &Self) -> bool {
        self.total == other.total && self.to_contiguous() == other.to_contiguous()
    }
}

impl Eq for ByteBlock {}
