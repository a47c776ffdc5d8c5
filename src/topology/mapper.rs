//! Derivation of virtual connection tables
//!
//! A new communicator describes each of its groups as a concatenation of ranks taken from
//! existing communicators. Each `Mapper` contributes one segment: either a whole group of the
//! source communicator (`MapKind::Dup`) or an explicit list of source ranks
//! (`MapKind::Irregular`). When the first mapper of a pass turns out to reproduce a source table
//! unchanged, that table is shared instead of copied.

use std::fmt;
use std::sync::Arc;

use conv::ConvUtil;
use smallvec::SmallVec;

use crate::error::{try_reserve, Result};
use crate::topology::{sealed::AsHandle, CommKind, CommState, Communicator};
use crate::topology::vcrt::VcTable;
use crate::Rank;

/// Which group of the source is read, and which group of the new communicator is written.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MapDir {
    /// Source local group into destination local group.
    L2L,
    /// Source local group into destination remote group.
    L2R,
    /// Source remote group into destination local group.
    R2L,
    /// Source remote group into destination remote group.
    R2R,
}

impl MapDir {
    /// Whether the segment is read from the source's local group.
    pub fn from_local(self) -> bool {
        matches!(self, MapDir::L2L | MapDir::L2R)
    }

    /// Whether the segment is written to the destination's local group.
    pub fn to_local(self) -> bool {
        matches!(self, MapDir::L2L | MapDir::R2L)
    }
}

/// How ranks are taken from the source group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MapKind {
    /// Every rank of the source group, in order.
    Dup,
    /// The listed source ranks, in the listed order.
    Irregular(Vec<Rank>),
}

/// One segment of a new communicator's group.
#[derive(Clone)]
pub struct Mapper {
    pub(crate) src: Arc<CommState>,
    pub(crate) dir: MapDir,
    pub(crate) kind: MapKind,
}

impl Mapper {
    /// A segment holding the whole source group selected by `dir`.
    pub fn dup<C: Communicator + ?Sized>(src: &C, dir: MapDir) -> Self {
        Self::dup_state(&src.as_handle().state, dir)
    }

    /// A segment holding the ranks `ranks` of the source group selected by `dir`.
    ///
    /// # Panics
    ///
    /// If a listed rank is not a rank of the selected source group.
    pub fn irregular<C: Communicator + ?Sized>(src: &C, dir: MapDir, ranks: Vec<Rank>) -> Self {
        Self::irregular_state(&src.as_handle().state, dir, ranks)
    }

    pub(crate) fn dup_state(src: &Arc<CommState>, dir: MapDir) -> Self {
        Mapper {
            src: Arc::clone(src),
            dir,
            kind: MapKind::Dup,
        }
    }

    pub(crate) fn irregular_state(src: &Arc<CommState>, dir: MapDir, ranks: Vec<Rank>) -> Self {
        let mapper = Mapper {
            src: Arc::clone(src),
            dir,
            kind: MapKind::Dup,
        };
        let limit = mapper.source_size();
        for &r in &ranks {
            assert!(
                r >= 0 && r.value_as::<usize>().map_or(false, |r| r < limit),
                "rank {} is not in the source group of size {}",
                r,
                limit
            );
        }
        Mapper {
            kind: MapKind::Irregular(ranks),
            ..mapper
        }
    }

    /// Direction of this segment.
    pub fn dir(&self) -> MapDir {
        self.dir
    }

    /// Kind of this segment.
    pub fn kind(&self) -> &MapKind {
        &self.kind
    }

    fn source_size(&self) -> usize {
        if self.dir.from_local() {
            self.src.local_size
        } else {
            self.src.remote_size
        }
    }

    /// Number of ranks this segment contributes.
    pub fn size(&self) -> usize {
        match &self.kind {
            MapKind::Dup => self.source_size(),
            MapKind::Irregular(ranks) => ranks.len(),
        }
    }

    /// Check that the direction is consistent with the source and destination kinds.
    ///
    /// # Panics
    ///
    /// If an intra-communicator source is read through its remote group, or an
    /// intra-communicator destination is written through its remote group.
    pub(crate) fn check(&self, dest: CommKind) {
        if self.src.kind == CommKind::Intra {
            assert!(
                self.dir.from_local(),
                "mapper {:?} reads the remote group of intra-communicator {}",
                self.dir,
                self.src.context_id
            );
        }
        if dest == CommKind::Intra {
            assert!(
                self.dir.to_local(),
                "mapper {:?} writes the remote group of an intra-communicator",
                self.dir
            );
        }
    }

    /// A new reference to the source table if this segment reproduces it exactly.
    fn try_share(&self, source: &VcTable, total: usize) -> Option<VcTable> {
        let shareable = match &self.kind {
            MapKind::Dup => self.source_size() == total,
            MapKind::Irregular(ranks) => {
                ranks.len() == total
                    && ranks.len() == source.len()
                    && ranks
                        .iter()
                        .enumerate()
                        .all(|(i, &r)| r.value_as::<usize>().map_or(false, |r| r == i))
            }
        };
        shareable.then(|| source.retain())
    }

    fn copy_into(&self, source: &VcTable, out: &mut Vec<crate::transport::Endpoint>) {
        match &self.kind {
            MapKind::Dup => out.extend_from_slice(source.entries()),
            MapKind::Irregular(ranks) => out.extend(ranks.iter().map(|&r| {
                let index = r.value_as::<usize>().expect("mapper ranks are validated");
                source.entries()[index]
            })),
        }
    }
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapper")
            .field("src", &self.src.context_id)
            .field("dir", &self.dir)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Which group of the destination a table is built for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Pass {
    Local,
    Remote,
}

/// Build the table for one group of the destination from the mappers writing to it.
///
/// Returns `None` if no mapper writes to that group.
pub(crate) fn build_table(mappers: &[Mapper], pass: Pass) -> Result<Option<VcTable>> {
    let segments: SmallVec<[&Mapper; 4]> = mappers
        .iter()
        .filter(|m| m.dir.to_local() == (pass == Pass::Local))
        .collect();
    if segments.is_empty() {
        return Ok(None);
    }

    let total: usize = segments.iter().map(|m| m.size()).sum();
    let mut entries = Vec::new();
    for (i, mapper) in segments.iter().enumerate() {
        let shared = mapper.src.with_table(mapper.dir.from_local(), |source| {
            if i == 0 {
                if let Some(table) = mapper.try_share(source, total) {
                    return Ok(Some(table));
                }
                try_reserve(&mut entries, total, "virtual connection table")?;
            }
            mapper.copy_into(source, &mut entries);
            Ok(None)
        });
        match shared {
            Some(Ok(Some(table))) => {
                tracing::trace!(?pass, table = table.id(), refs = table.ref_count(), "sharing vc table");
                return Ok(Some(table));
            }
            Some(Ok(None)) => {}
            Some(Err(e)) => return Err(e),
            None => panic!(
                "mapper source communicator {} has no table for {:?}",
                mapper.src.context_id, mapper.dir
            ),
        }
    }

    debug_assert_eq!(entries.len(), total);
    Ok(Some(VcTable::new(entries)))
}
