//! # Reference-Counted Tagged Unions
//!
//! Every structural node in the runtime (types, judgments, expressions,
//! control-flow nodes) is a heap cell holding three things:
//!
//! - a **tag** identifying the variant,
//! - a **common** block valid for every variant (usually the content hash),
//! - a variant **body**,
//!
//! plus a reference count. The body is an ordinary Rust enum generated by
//! [`tagged_union!`], which also produces the tag enum and per-variant
//! projections so `data::<IntegerType>()` is a checked accessor.
//!
//! ## Ownership
//!
//! Two handles share one cell layout:
//!
//! - [`RawTagged`] exposes the manual protocol: `create` starts at one,
//!   `increment_refcount` and `decrement_refcount` adjust it, and the owner
//!   that observes the 1 → 0 transition must call `destroy`.
//! - [`Tagged`] is the scoped form: `Clone` increments, `Drop` decrements and
//!   destroys on the last release. All higher layers use this one.
//!
//! The counter is atomic. Frozen pages and serialized objects are shared
//! across reader threads and carry tagged nodes with them, so every count is
//! potentially touched from more than one thread.
//!
//! Decrementing a count that is already zero panics.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize, Ordering};

use thiserror::Error;

/// Error returned by checked variant accessors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaggedError {
    /// The node holds a different variant than the one requested.
    #[error("wrong variant: expected {expected}, found {found}")]
    WrongVariant {
        /// Requested variant.
        expected: String,
        /// Actual variant.
        found: String,
    },
}

/// A variant body produced by [`tagged_union!`].
pub trait TaggedBody: Send + Sync + 'static {
    /// Discriminant type.
    type Tag: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    /// The discriminant of this body.
    fn tag(&self) -> Self::Tag;
}

/// Projection from a body enum to one of its payload types.
pub trait Variant<B: TaggedBody>: Sized {
    /// The tag for this variant.
    const TAG: B::Tag;

    /// Borrow the payload if `body` holds this variant.
    fn project(body: &B) -> Option<&Self>;
}

/// Generate a tagged-union body enum, its tag enum and variant projections.
///
/// Every variant is either a unit variant or carries exactly one payload
/// type; payload types must be distinct within one union.
#[macro_export]
macro_rules! tagged_union {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $tag:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident $( ( $payload:ty ) )?
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant $( ( $payload ) )?
            ),*
        }

        #[doc = concat!("Discriminant of [`", stringify!($name), "`].")]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        $vis enum $tag {
            $(
                #[doc = concat!("Tag of `", stringify!($variant), "`.")]
                $variant
            ),*
        }

        impl $crate::tagged::TaggedBody for $name {
            type Tag = $tag;

            fn tag(&self) -> $tag {
                match self {
                    $( Self::$variant { .. } => $tag::$variant ),*
                }
            }
        }

        $($(
            impl $crate::tagged::Variant<$name> for $payload {
                const TAG: $tag = $tag::$variant;

                #[allow(unreachable_patterns)]
                fn project(body: &$name) -> Option<&Self> {
                    match body {
                        $name::$variant(p) => Some(p),
                        _ => None,
                    }
                }
            }
        )?)*
    };
}

// ============================================================================
// Cell
// ============================================================================

struct TaggedCell<C, B> {
    refcount: AtomicUsize,
    common: C,
    body: B,
}

// ============================================================================
// Manual Handle
// ============================================================================

/// A manually reference-counted pointer to a tagged cell.
///
/// `RawTagged` is `Copy`; copying does not touch the count. Every method that
/// dereferences the cell is `unsafe` because the caller must guarantee the
/// cell has not been destroyed.
pub struct RawTagged<C, B: TaggedBody> {
    ptr: NonNull<TaggedCell<C, B>>,
    _marker: PhantomData<TaggedCell<C, B>>,
}

impl<C, B: TaggedBody> Clone for RawTagged<C, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C, B: TaggedBody> Copy for RawTagged<C, B> {}

// SAFETY: the count is atomic and common/body are only read through shared
// references, so the cell may move between threads when its parts may.
unsafe impl<C: Send + Sync, B: TaggedBody> Send for RawTagged<C, B> {}
unsafe impl<C: Send + Sync, B: TaggedBody> Sync for RawTagged<C, B> {}

impl<C, B: TaggedBody> RawTagged<C, B> {
    /// Allocate a new cell with a refcount of one.
    pub fn create(common: C, body: B) -> Self {
        let cell = Box::new(TaggedCell {
            refcount: AtomicUsize::new(1),
            common,
            body,
        });
        Self {
            ptr: NonNull::from(Box::leak(cell)),
            _marker: PhantomData,
        }
    }

    /// Add one owner.
    ///
    /// # Safety
    /// The cell must not have been destroyed.
    ///
    /// # Panics
    /// Panics if the count is zero.
    pub unsafe fn increment_refcount(self) {
        let old = self.cell().refcount.fetch_add(1, Ordering::Relaxed);
        if old == 0 {
            panic!("RawTagged: increment of zero refcount");
        }
    }

    /// Remove one owner. Returns `true` when the count reached zero, in which
    /// case the caller must [`destroy`](Self::destroy) the cell.
    ///
    /// # Safety
    /// The cell must not have been destroyed.
    ///
    /// # Panics
    /// Panics if the count was already zero.
    pub unsafe fn decrement_refcount(self) -> bool {
        let old = self.cell().refcount.fetch_sub(1, Ordering::Release);
        match old {
            0 => panic!("RawTagged: decrement of zero refcount"),
            1 => {
                atomic::fence(Ordering::Acquire);
                true
            }
            _ => false,
        }
    }

    /// Free the cell, running the body's destructor.
    ///
    /// # Safety
    /// The count must have reached zero and no other copy may be used again.
    pub unsafe fn destroy(self) {
        debug_assert_eq!(self.cell().refcount.load(Ordering::Relaxed), 0);
        drop(Box::from_raw(self.ptr.as_ptr()));
    }

    /// Current count.
    ///
    /// # Safety
    /// The cell must not have been destroyed.
    pub unsafe fn refcount(self) -> usize {
        self.cell().refcount.load(Ordering::Acquire)
    }

    /// The variant discriminant.
    ///
    /// # Safety
    /// The cell must not have been destroyed.
    pub unsafe fn tag(self) -> B::Tag {
        self.cell().body.tag()
    }

    /// The block shared by all variants.
    ///
    /// # Safety
    /// The cell must outlive the returned reference.
    pub unsafe fn common<'a>(self) -> &'a C {
        &(*self.ptr.as_ptr()).common
    }

    /// The variant body.
    ///
    /// # Safety
    /// The cell must outlive the returned reference.
    pub unsafe fn body<'a>(self) -> &'a B {
        &(*self.ptr.as_ptr()).body
    }

    /// Checked access to one variant's payload.
    ///
    /// # Safety
    /// The cell must outlive the returned reference.
    pub unsafe fn data<'a, V: Variant<B>>(self) -> Result<&'a V, TaggedError> {
        let body = self.body();
        V::project(body).ok_or_else(|| TaggedError::WrongVariant {
            expected: format!("{:?}", V::TAG),
            found: format!("{:?}", body.tag()),
        })
    }

    /// Whether two handles name the same cell.
    pub fn ptr_eq(self, other: Self) -> bool {
        self.ptr == other.ptr
    }

    unsafe fn cell<'a>(self) -> &'a TaggedCell<C, B> {
        &*self.ptr.as_ptr()
    }
}

impl<C, B: TaggedBody> fmt::Debug for RawTagged<C, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawTagged({:p})", self.ptr)
    }
}

// ============================================================================
// Scoped Handle
// ============================================================================

/// An owning handle: clone adds an owner, drop releases it.
pub struct Tagged<C, B: TaggedBody> {
    raw: RawTagged<C, B>,
}

impl<C, B: TaggedBody> Tagged<C, B> {
    /// Allocate a new cell owned by the returned handle.
    pub fn new(common: C, body: B) -> Self {
        Self {
            raw: RawTagged::create(common, body),
        }
    }

    /// Adopt an owner obtained from the manual protocol.
    ///
    /// # Safety
    /// `raw` must carry one unreleased count that this handle now owns.
    pub unsafe fn from_raw(raw: RawTagged<C, B>) -> Self {
        Self { raw }
    }

    /// Give up scoped ownership; the count is left unchanged.
    pub fn into_raw(self) -> RawTagged<C, B> {
        let raw = self.raw;
        std::mem::forget(self);
        raw
    }

    /// The variant discriminant.
    pub fn tag(&self) -> B::Tag {
        self.body().tag()
    }

    /// The block shared by all variants.
    pub fn common(&self) -> &C {
        // SAFETY: self holds a count, so the cell is live for &self.
        unsafe { self.raw.common() }
    }

    /// The variant body.
    pub fn body(&self) -> &B {
        // SAFETY: as above.
        unsafe { self.raw.body() }
    }

    /// Checked access to one variant's payload.
    pub fn data<V: Variant<B>>(&self) -> Result<&V, TaggedError> {
        // SAFETY: as above.
        unsafe { self.raw.data::<V>() }
    }

    /// Current number of owners.
    pub fn refcount(&self) -> usize {
        // SAFETY: as above.
        unsafe { self.raw.refcount() }
    }

    /// Whether two handles share one cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.raw.ptr_eq(other.raw)
    }
}

impl<C, B: TaggedBody> Clone for Tagged<C, B> {
    fn clone(&self) -> Self {
        // SAFETY: self holds a count.
        unsafe { self.raw.increment_refcount() };
        Self { raw: self.raw }
    }
}

impl<C, B: TaggedBody> Drop for Tagged<C, B> {
    fn drop(&mut self) {
        // SAFETY: self holds a count and releases it exactly once here.
        unsafe {
            if self.raw.decrement_refcount() {
                self.raw.destroy();
            }
        }
    }
}

impl<C: fmt::Debug, B: TaggedBody + fmt::Debug> fmt::Debug for Tagged<C, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tagged")
            .field("common", self.common())
            .field("body", self.body())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug)]
    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug, PartialEq)]
    struct Pair(i64, i64);

    tagged_union! {
        #[derive(Debug)]
        enum Shape: ShapeTag {
            Empty,
            Point(Pair),
            Tracked(DropCounter),
        }
    }

    #[test]
    fn test_tag_and_data() {
        let t = Tagged::new("common", Shape::Point(Pair(1, 2)));
        assert_eq!(t.tag(), ShapeTag::Point);
        assert_eq!(*t.common(), "common");
        assert_eq!(t.data::<Pair>().unwrap(), &Pair(1, 2));

        let err = t.data::<DropCounter>().unwrap_err();
        assert_eq!(
            err,
            TaggedError::WrongVariant {
                expected: "Tracked".into(),
                found: "Point".into(),
            }
        );

        let e = Tagged::new((), Shape::Empty);
        assert_eq!(e.tag(), ShapeTag::Empty);
    }

    #[test]
    fn test_raw_destroyed_on_last_decrement() {
        let drops = Arc::new(AtomicUsize::new(0));
        let raw = RawTagged::create((), Shape::Tracked(DropCounter(drops.clone())));

        unsafe {
            raw.increment_refcount();
            raw.increment_refcount();
            assert_eq!(raw.refcount(), 3);

            assert!(!raw.decrement_refcount());
            assert!(!raw.decrement_refcount());
            assert_eq!(drops.load(Ordering::SeqCst), 0);

            assert!(raw.decrement_refcount());
            raw.destroy();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "decrement of zero refcount")]
    fn test_raw_decrement_at_zero_panics() {
        let raw = RawTagged::create((), Shape::Empty);
        unsafe {
            assert!(raw.decrement_refcount());
            // Count is zero but the cell has not been destroyed yet.
            raw.decrement_refcount();
        }
    }

    #[test]
    fn test_scoped_clone_and_drop() {
        let drops = Arc::new(AtomicUsize::new(0));
        let a = Tagged::new(7u32, Shape::Tracked(DropCounter(drops.clone())));
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert_eq!(a.refcount(), 2);

        drop(a);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(b.refcount(), 1);

        drop(b);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_into_raw_from_raw() {
        let drops = Arc::new(AtomicUsize::new(0));
        let t = Tagged::new((), Shape::Tracked(DropCounter(drops.clone())));
        let raw = t.into_raw();
        unsafe {
            assert_eq!(raw.refcount(), 1);
            let back = Tagged::from_raw(raw);
            assert_eq!(back.tag(), ShapeTag::Tracked);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_across_threads() {
        let drops = Arc::new(AtomicUsize::new(0));
        let t = Tagged::new((), Shape::Tracked(DropCounter(drops.clone())));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let local = t.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let c = local.clone();
                        assert_eq!(c.tag(), ShapeTag::Tracked);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(t.refcount(), 1);
        drop(t);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
