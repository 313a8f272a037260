use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use itertools::Itertools;
use thiserror::Error;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::analysis::AddressSpace;
use crate::analysis::BinaryId;
use crate::analysis::UnwindTableAnalysis;
use crate::maps::SegmentSink;
use crate::segments;
use crate::segments::SegmentItem;

/// One kernel-resident address segment of a binary's unwind table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSegment {
    pub begin: u64,
    pub end: u64,
    pub generation: i64,
    pub binary_id: BinaryId,
}

impl SegmentItem for TableSegment {
    fn begin(&self) -> u64 {
        self.begin
    }
    fn end(&self) -> u64 {
        self.end
    }
    fn generation(&self) -> i64 {
        self.generation
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("binary {0} already has an unwind table")]
    AlreadyRegistered(BinaryId),
    #[error("failed to write unwind rows for binary {0}")]
    RowWrite(BinaryId, #[source] anyhow::Error),
    #[error("failed to write unwind segments for binary {0}")]
    SegmentWrite(BinaryId, #[source] anyhow::Error),
}

/// Handle for one allocated unwind table. Returned by
/// [`UnwindTableStore::add`] and consumed by [`UnwindTableStore::release`],
/// so a table cannot be released twice.
#[derive(Debug)]
pub struct UnwindTableAllocation {
    binary_id: BinaryId,
    address_space: AddressSpace,
}

impl UnwindTableAllocation {
    pub fn binary_id(&self) -> BinaryId {
        self.binary_id
    }

    pub fn address_space(&self) -> AddressSpace {
        self.address_space
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visibility {
    Active,
    Cached,
}

struct TableEntry {
    address_space: AddressSpace,
    visibility: Visibility,
}

#[derive(Default)]
struct Tables {
    // Retained records per address space, sorted by begin, pairwise
    // disjoint. Mirrors what the kernel trie routes to.
    spaces: HashMap<AddressSpace, Vec<TableSegment>>,
    entries: HashMap<BinaryId, TableEntry>,
}

/// Owns which unwind table records live in the kernel.
///
/// Distinct binaries may cover overlapping address ranges of one address
/// space when mappings are replaced underneath a running profile session.
/// The store resolves those conflicts by generation: a newer table displaces
/// the overlapped records of older ones.
pub struct UnwindTableStore {
    sink: Arc<dyn SegmentSink + Send + Sync>,
    tables: Mutex<Tables>,
}

impl UnwindTableStore {
    pub fn new(sink: Arc<dyn SegmentSink + Send + Sync>) -> Self {
        Self {
            sink,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Pushes a binary's unwind table to the kernel and records it Active.
    ///
    /// Displaced records of older generations are removed best effort,
    /// failures there are logged and do not fail the call. A failure to
    /// write the new records rolls the kernel and the retained set back to
    /// their state before the call.
    pub fn add(
        &self,
        build_id: &str,
        id: BinaryId,
        analysis: &UnwindTableAnalysis,
    ) -> Result<UnwindTableAllocation, TableError> {
        let space = analysis.address_space;
        let mut tables = self.tables.lock().expect("lock");
        if tables.entries.contains_key(&id) {
            return Err(TableError::AlreadyRegistered(id));
        }

        self.sink
            .add_table(id, &analysis.rows)
            .map_err(|e| TableError::RowWrite(id, e))?;

        let fresh: Vec<TableSegment> = analysis
            .segments
            .iter()
            .map(|span| TableSegment {
                begin: span.begin,
                end: span.end,
                generation: analysis.generation,
                binary_id: id,
            })
            .collect();

        let retained = tables.spaces.entry(space).or_default();
        let existing = std::mem::take(retained);
        let merged: Vec<TableSegment> = existing
            .into_iter()
            .merge_by(fresh, |a, b| a.begin <= b.begin)
            .collect();
        let (kept, pruned) = segments::prune(merged);

        let added: Vec<TableSegment> = kept.iter().filter(|s| s.binary_id == id).copied().collect();
        let displaced: Vec<TableSegment> =
            pruned.iter().filter(|s| s.binary_id != id).copied().collect();

        if let Err(e) = self.sink.add_segments(space, &added) {
            if let Err(cleanup) = self.sink.remove_segments(space, &added) {
                warn!(
                    "cleanup of partially written segments for binary {} failed: {:?}",
                    id, cleanup
                );
            }
            if let Err(cleanup) = self.sink.remove_table(id) {
                warn!("cleanup of unwind rows for binary {} failed: {:?}", id, cleanup);
            }
            let mut restored: Vec<TableSegment> = kept
                .into_iter()
                .chain(pruned)
                .filter(|s| s.binary_id != id)
                .collect();
            restored.sort_by_key(|s| s.begin);
            *retained = restored;
            return Err(TableError::SegmentWrite(id, e));
        }

        if !displaced.is_empty() {
            debug!(
                "{} stale unwind segments displaced by binary {} (build id {})",
                displaced.len(),
                id,
                build_id
            );
            if let Err(e) = self.sink.remove_segments(space, &displaced) {
                warn!("failed to remove displaced unwind segments: {:?}", e);
            }
        }

        *retained = kept;
        tables.entries.insert(
            id,
            TableEntry {
                address_space: space,
                visibility: Visibility::Active,
            },
        );

        debug!(
            "allocated unwind table for binary {} (build id {}), {} segments, {} rows",
            id,
            build_id,
            added.len(),
            analysis.rows.len()
        );
        Ok(UnwindTableAllocation {
            binary_id: id,
            address_space: space,
        })
    }

    /// Removes the binary's still-retained records from the kernel. Kernel
    /// failures are logged, release never fails.
    pub fn release(&self, allocation: UnwindTableAllocation) {
        let UnwindTableAllocation {
            binary_id: id,
            address_space: space,
        } = allocation;

        let mut tables = self.tables.lock().expect("lock");
        if tables.entries.remove(&id).is_none() {
            // Allocations are moved into release, getting here means the
            // store and its caller disagree about who owns this table.
            error!("released binary {} was not tracked", id);
            return;
        }

        let mut mine = Vec::new();
        let mut space_emptied = false;
        if let Some(retained) = tables.spaces.get_mut(&space) {
            mine = retained
                .iter()
                .filter(|s| s.binary_id == id)
                .copied()
                .collect();
            retained.retain(|s| s.binary_id != id);
            space_emptied = retained.is_empty();
        }
        if space_emptied {
            tables.spaces.remove(&space);
        }

        if !mine.is_empty() {
            if let Err(e) = self.sink.remove_segments(space, &mine) {
                error!("failed to remove unwind segments for binary {}: {:?}", id, e);
            }
        }
        if let Err(e) = self.sink.remove_table(id) {
            error!("failed to remove unwind rows for binary {}: {:?}", id, e);
        }
        debug!("released unwind table for binary {}", id);
    }

    /// Marks the table as kept for a process that went away but may come
    /// back. Kernel records stay in place. Returns false if the table was
    /// not Active.
    pub fn move_to_cache(&self, allocation: &UnwindTableAllocation) -> bool {
        self.flip(allocation.binary_id, Visibility::Active, Visibility::Cached)
    }

    /// Reverse of [`UnwindTableStore::move_to_cache`]. Returns false if the
    /// table was not Cached.
    pub fn move_from_cache(&self, allocation: &UnwindTableAllocation) -> bool {
        self.flip(allocation.binary_id, Visibility::Cached, Visibility::Active)
    }

    fn flip(&self, id: BinaryId, from: Visibility, to: Visibility) -> bool {
        let mut tables = self.tables.lock().expect("lock");
        match tables.entries.get_mut(&id) {
            Some(entry) if entry.visibility == from => {
                entry.visibility = to;
                true
            }
            _ => false,
        }
    }
}
