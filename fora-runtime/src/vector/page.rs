//! Vector pages: ordered collections of frozen pagelets.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::Pagelet;
use crate::hash::ContentHash;
use crate::memory::VectorDataMemoryManager;
use crate::model::Value;
use crate::serialize::{HashingSink, SerializeError, SerializedObject, Wire, WireSink, WireSource};

// ============================================================================
// Pagelet Tree
// ============================================================================

/// Pagelets in order with prefix-summed value counts.
#[derive(Clone, Default)]
pub struct PageletTree {
    pagelets: Vec<Arc<Pagelet>>,
    ends: Vec<usize>,
}

impl PageletTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pagelet.
    pub fn push(&mut self, pagelet: Arc<Pagelet>) {
        let end = self.size() + pagelet.len();
        self.pagelets.push(pagelet);
        self.ends.push(end);
    }

    /// Number of pagelets.
    pub fn count(&self) -> usize {
        self.pagelets.len()
    }

    /// Total number of values.
    pub fn size(&self) -> usize {
        self.ends.last().copied().unwrap_or(0)
    }

    /// Pagelet at `index`.
    pub fn pagelet(&self, index: usize) -> Option<&Arc<Pagelet>> {
        self.pagelets.get(index)
    }

    /// Value at `index` across all pagelets.
    pub fn value_at(&self, index: usize) -> Option<Value> {
        let p = self.ends.partition_point(|&end| end <= index);
        let start = if p == 0 { 0 } else { self.ends[p - 1] };
        self.pagelets.get(p)?.values().get(index - start)
    }

    /// Pagelets in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Pagelet>> {
        self.pagelets.iter()
    }

    /// All values in order.
    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.pagelets.iter().flat_map(|p| p.values().iter())
    }
}

impl Wire for PageletTree {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        sink.put_varint(self.pagelets.len() as u64);
        for p in &self.pagelets {
            sink.put_memo(p);
        }
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        let count = source.get_len(1)?;
        let mut tree = PageletTree::new();
        for _ in 0..count {
            tree.push(source.get_memo::<Arc<Pagelet>>()?);
        }
        Ok(tree)
    }
}

impl fmt::Debug for PageletTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageletTree")
            .field("count", &self.count())
            .field("size", &self.size())
            .finish()
    }
}

// ============================================================================
// Vector Page
// ============================================================================

/// The mutable stage of a page.
pub struct VectorPageBuilder {
    memory: Arc<VectorDataMemoryManager>,
    tree: PageletTree,
}

impl VectorPageBuilder {
    /// An empty page charged to `memory`.
    pub fn new(memory: &Arc<VectorDataMemoryManager>) -> Self {
        Self {
            memory: Arc::clone(memory),
            tree: PageletTree::new(),
        }
    }

    /// Append a frozen pagelet. A pagelet may appear in several pages.
    pub fn append_pagelet(&mut self, pagelet: Arc<Pagelet>) {
        self.tree.push(pagelet);
    }

    /// Number of values so far.
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    /// Whether the page has no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the page immutable.
    pub fn freeze(self) -> Arc<VectorPage> {
        Arc::new(VectorPage::from_tree(self.memory, self.tree))
    }
}

/// An immutable page. Safe to read from many threads.
pub struct VectorPage {
    memory: Arc<VectorDataMemoryManager>,
    tree: PageletTree,
    hash: ContentHash,
}

impl VectorPage {
    fn from_tree(memory: Arc<VectorDataMemoryManager>, tree: PageletTree) -> Self {
        let hash = HashingSink::hash_of("fora.page", &tree);
        Self { memory, tree, hash }
    }

    /// Serialize the page. Pagelets go to memo storage, so a pagelet
    /// referenced twice is stored once.
    pub fn serialize(&self) -> Arc<SerializedObject> {
        let so = SerializedObject::serialize(&self.tree);
        trace!(page = %self.hash, bytes = so.byte_count(), "serialized vector page");
        so
    }

    /// Rebuild a page, charging its vector data to `memory`.
    pub fn deserialize(
        memory: &Arc<VectorDataMemoryManager>,
        object: &SerializedObject,
    ) -> Result<Arc<VectorPage>, SerializeError> {
        let tree: PageletTree = object.deserialize(memory)?;
        Ok(Arc::new(Self::from_tree(Arc::clone(memory), tree)))
    }

    /// Hash of the pagelet hashes in order.
    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    /// The pagelets.
    pub fn pagelet_tree(&self) -> &PageletTree {
        &self.tree
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    /// Whether the page has no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at `index`.
    pub fn value_at(&self, index: usize) -> Option<Value> {
        self.tree.value_at(index)
    }

    /// Bytes held by the page's pagelets. A pagelet shared within the page
    /// counts once.
    pub fn total_bytes_allocated_from_os(&self) -> usize {
        let mut seen = HashSet::new();
        self.tree
            .iter()
            .filter(|p| seen.insert(Arc::as_ptr(p)))
            .map(|p| p.bytes_used())
            .sum()
    }

    /// The manager the page was built or rebuilt against.
    pub fn memory(&self) -> &Arc<VectorDataMemoryManager> {
        &self.memory
    }
}

impl fmt::Debug for VectorPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorPage")
            .field("hash", &self.hash)
            .field("pagelets", &self.tree.count())
            .field("values", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::PageletBuilder;

    fn pagelet(memory: &Arc<VectorDataMemoryManager>, range: std::ops::Range<i64>) -> Arc<Pagelet> {
        let mut b = PageletBuilder::new(memory);
        for i in range {
            b.append(&Value::Int64(i)).unwrap();
        }
        b.freeze()
    }

    #[test]
    fn test_tree_indexing() {
        let memory = VectorDataMemoryManager::unbounded(16);
        let mut tree = PageletTree::new();
        tree.push(pagelet(&memory, 0..3));
        tree.push(pagelet(&memory, 3..3));
        tree.push(pagelet(&memory, 3..10));

        assert_eq!(tree.count(), 3);
        assert_eq!(tree.size(), 10);
        assert_eq!(tree.value_at(0), Some(Value::Int64(0)));
        assert_eq!(tree.value_at(2), Some(Value::Int64(2)));
        assert_eq!(tree.value_at(3), Some(Value::Int64(3)));
        assert_eq!(tree.value_at(9), Some(Value::Int64(9)));
        assert_eq!(tree.value_at(10), None);
        assert_eq!(tree.values().count(), 10);
    }

    #[test]
    fn test_roundtrip_preserves_hash_and_values() {
        let memory = VectorDataMemoryManager::unbounded(16);
        let mut b = VectorPageBuilder::new(&memory);
        b.append_pagelet(pagelet(&memory, 0..100));
        b.append_pagelet(pagelet(&memory, 100..150));
        let page = b.freeze();

        let back = VectorPage::deserialize(&memory, &page.serialize()).unwrap();
        assert_eq!(back.hash(), page.hash());
        assert_eq!(back.pagelet_tree().count(), 2);
        assert!(back.pagelet_tree().values().eq(page.pagelet_tree().values()));
    }

    #[test]
    fn test_shared_pagelet_stored_once() {
        let memory = VectorDataMemoryManager::unbounded(16);
        let shared = pagelet(&memory, 0..64);

        let mut b = VectorPageBuilder::new(&memory);
        b.append_pagelet(shared.clone());
        b.append_pagelet(shared.clone());
        let page = b.freeze();
        assert_eq!(page.total_bytes_allocated_from_os(), shared.bytes_used());

        let so = page.serialize();
        assert_eq!(so.context().memo().len(), 1);

        let back = VectorPage::deserialize(&memory, &so).unwrap();
        let tree = back.pagelet_tree();
        assert!(Arc::ptr_eq(tree.pagelet(0).unwrap(), tree.pagelet(1).unwrap()));
    }
}
