//! # Vector Storage
//!
//! Large vectors are stored as pages of pagelets:
//!
//! ```text
//! ForaValueArray ──▶ PageletBuilder ──freeze──▶ Arc<Pagelet>
//!                                                   │
//!                    VectorPageBuilder ◀────────────┘
//!                          │ freeze
//!                          ▼
//!                    Arc<VectorPage> ──serialize──▶ SerializedObject
//! ```
//!
//! Builders are the only mutable stage. Freezing consumes the builder, so a
//! frozen pagelet or page can be shared across threads without locks.
//! All vector bytes are charged to a [`VectorDataMemoryManager`].
//!
//! [`VectorDataMemoryManager`]: crate::memory::VectorDataMemoryManager

pub mod array;
pub mod page;
pub mod page_id;
pub mod pagelet;

pub use array::{ChunkInfo, ForaValueArray};
pub use page::{PageletTree, VectorPage, VectorPageBuilder};
pub use page_id::{PageId, VectorDataId};
pub use pagelet::{Pagelet, PageletBuilder};

use thiserror::Error;

use crate::memory::MemoryError;

/// Errors appending to vector storage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VectorError {
    /// The memory budget refused the allocation.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Raw bytes were requested for a type that cannot be packed.
    #[error("type {0} cannot be stored packed")]
    NotPod(String),
}
