//! Virtual connection tables
//!
//! A `VcTable` maps the ranks of one group of a communicator to transport endpoints. Tables are
//! shared between communicators whose derivation turned out to be an identity: each
//! communicator referencing a table holds one counted reference obtained through `retain` and
//! gives it back through `release` (or by dropping its handle). The count is independent of how
//! many in-flight schedules are reading the table through a `VcView`.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::transport::{Endpoint, Transport};

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

struct VcTableInner {
    id: u64,
    entries: Box<[Endpoint]>,
    refs: AtomicUsize,
}

/// A counted reference to a virtual connection table.
///
/// There is no `Clone`: a new counted reference is obtained with `retain`.
pub struct VcTable {
    inner: Arc<VcTableInner>,
    counted: bool,
}

impl VcTable {
    /// A fresh table holding one reference.
    pub(crate) fn new(entries: Vec<Endpoint>) -> Self {
        let id = NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(table = id, len = entries.len(), "vc table created");
        VcTable {
            inner: Arc::new(VcTableInner {
                id,
                entries: entries.into_boxed_slice(),
                refs: AtomicUsize::new(1),
            }),
            counted: true,
        }
    }

    /// Take another counted reference to the same table.
    pub fn retain(&self) -> VcTable {
        self.inner.refs.fetch_add(1, Ordering::AcqRel);
        VcTable {
            inner: Arc::clone(&self.inner),
            counted: true,
        }
    }

    /// Give back this reference. Returns `true` if it was the last one.
    ///
    /// If `disconnect` is given and this was the last reference, every endpoint in the table is
    /// disconnected through it.
    pub fn release(mut self, disconnect: Option<&dyn Transport>) -> bool {
        self.counted = false;
        let last = self.put();
        if last {
            if let Some(transport) = disconnect {
                for &endpoint in self.inner.entries.iter() {
                    transport.disconnect(endpoint);
                }
            }
        }
        last
    }

    fn put(&self) -> bool {
        let last = self.inner.refs.fetch_sub(1, Ordering::AcqRel) == 1;
        if last {
            tracing::trace!(table = self.inner.id, "vc table freed");
        }
        last
    }

    /// Number of communicators currently referencing the table.
    pub fn ref_count(&self) -> usize {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// Process-unique identifier of the underlying table.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Number of ranks in the table.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the table has no ranks.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Endpoint of `rank`.
    pub fn get(&self, rank: usize) -> Option<Endpoint> {
        self.inner.entries.get(rank).copied()
    }

    /// All endpoints in rank order.
    pub fn entries(&self) -> &[Endpoint] {
        &self.inner.entries
    }

    /// Whether both references point at the same table.
    pub fn ptr_eq(&self, other: &VcTable) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A read-only view that does not count as a reference.
    pub(crate) fn view(&self) -> VcView {
        VcView {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn stats(&self) -> TableStats {
        TableStats {
            id: self.id(),
            len: self.len(),
            ref_count: self.ref_count(),
        }
    }
}

impl Drop for VcTable {
    fn drop(&mut self) {
        if self.counted {
            self.put();
        }
    }
}

impl fmt::Debug for VcTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VcTable")
            .field("id", &self.inner.id)
            .field("len", &self.inner.entries.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Uncounted read access to a table, held by schedules while they route messages.
#[derive(Clone)]
pub(crate) struct VcView {
    inner: Arc<VcTableInner>,
}

impl VcView {
    pub(crate) fn get(&self, rank: usize) -> Option<Endpoint> {
        self.inner.entries.get(rank).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub(crate) fn contains(&self, endpoint: &Endpoint) -> bool {
        self.inner.entries.contains(endpoint)
    }
}

/// A snapshot of a table's identity, size and reference count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TableStats {
    /// Process-unique table identifier
    pub id: u64,
    /// Number of ranks
    pub len: usize,
    /// Number of referencing communicators
    pub ref_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalFabric;

    fn table(n: u32) -> VcTable {
        VcTable::new((0..n).map(|r| Endpoint::new(0, r)).collect())
    }

    #[test]
    fn retain_and_release_count_references() {
        let t = table(4);
        assert_eq!(t.ref_count(), 1);
        let t2 = t.retain();
        assert!(t.ptr_eq(&t2));
        assert_eq!(t.ref_count(), 2);
        assert!(!t2.release(None));
        assert_eq!(t.ref_count(), 1);
        assert!(t.release(None));
    }

    #[test]
    fn views_do_not_count() {
        let t = table(3);
        let view = t.view();
        assert_eq!(t.ref_count(), 1);
        assert_eq!(view.get(2), Some(Endpoint::new(0, 2)));
        assert!(t.release(None));
        assert_eq!(view.len(), 3);
    }

    #[test]
    fn last_release_disconnects_when_asked() {
        let fabric = LocalFabric::new();
        let t = table(2);
        let t2 = t.retain();
        assert!(!t.release(Some(&fabric)));
        assert!(!fabric.is_disconnected(Endpoint::new(0, 0)));
        assert!(t2.release(Some(&fabric)));
        assert!(fabric.is_disconnected(Endpoint::new(0, 0)));
        assert!(fabric.is_disconnected(Endpoint::new(0, 1)));
    }

    #[test]
    fn drop_releases() {
        let t = table(1);
        {
            let _extra = t.retain();
            assert_eq!(t.ref_count(), 2);
        }
        assert_eq!(t.ref_count(), 1);
    }
}
