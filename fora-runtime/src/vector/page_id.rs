//! Page identity.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;
use crate::serialize::{SerializedObject, SerializedObjectFlattener};

/// Names the serialized content of one page.
///
/// Two equal ids must name byte-identical content. An id does not own the
/// page it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId {
    guid: ContentHash,
    bytecount: u64,
}

/// Vector data is addressed by the same id as the page holding it.
pub type VectorDataId = PageId;

impl PageId {
    /// An id from its parts.
    pub fn new(guid: ContentHash, bytecount: u64) -> Self {
        Self { guid, bytecount }
    }

    /// The id of `object`: its hash and flattened size.
    pub fn for_object(object: &SerializedObject) -> Self {
        let bytecount = SerializedObjectFlattener::flatten_once(object).total_byte_count();
        Self::new(object.hash(), bytecount as u64)
    }

    /// Content hash.
    pub fn guid(&self) -> ContentHash {
        self.guid
    }

    /// Flattened size in bytes.
    pub fn bytecount(&self) -> u64 {
        self.bytecount
    }

    /// File name used by on-disk stores: `<hex guid>_<bytecount>`.
    pub fn filename(&self) -> String {
        format!("{}_{}", self.guid.to_hex(), self.bytecount)
    }

    /// Parse a name produced by [`filename`](Self::filename).
    pub fn from_filename(name: &str) -> Option<Self> {
        let (hex, count) = name.split_once('_')?;
        Some(Self::new(ContentHash::from_hex(hex)?, count.parse().ok()?))
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page{}/{}", self.guid, self.bytecount)
    }
}
