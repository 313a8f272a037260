use std::marker::PhantomData;
use std::mem::size_of;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;

use anyhow::anyhow;
use itertools::Itertools;
use libbpf_rs::MapCore;
use libbpf_rs::MapFlags;
use libbpf_rs::MapHandle;
use libbpf_rs::MapType;
use plain::Plain;

use crate::analysis::AddressSpace;
use crate::analysis::BinaryId;
use crate::bpf::unwinder_bindings::unwind_rule_t;
use crate::bpf::unwinder_bindings::unwind_segment_key;
use crate::bpf::unwinder_bindings::unwind_segment_t;
use crate::unwind_table::TableSegment;
use crate::util::summarize_address_range;

/// Destination for one kind of per-binary runtime config record.
pub trait ConfigSink {
    type Record: Plain;

    fn add(&self, id: BinaryId, record: &Self::Record) -> anyhow::Result<()>;
    /// Removing an absent record is not an error.
    fn delete(&self, id: BinaryId) -> anyhow::Result<()>;
}

/// Destination for unwind tables: per-binary rule rows plus the address
/// segments that route samples to them.
pub trait SegmentSink {
    fn add_table(&self, id: BinaryId, rows: &[unwind_rule_t]) -> anyhow::Result<()>;
    fn remove_table(&self, id: BinaryId) -> anyhow::Result<()>;
    fn add_segments(&self, space: AddressSpace, segments: &[TableSegment]) -> anyhow::Result<()>;
    fn remove_segments(&self, space: AddressSpace, segments: &[TableSegment])
        -> anyhow::Result<()>;
}

/// A binary id keyed BPF hash map holding one config record per binary.
pub struct BpfConfigMap<R> {
    map: MapHandle,
    _record: PhantomData<R>,
}

impl<R: Plain> BpfConfigMap<R> {
    pub fn create(name: &str, max_entries: u32) -> Result<Self, libbpf_rs::Error> {
        let opts = libbpf_sys::bpf_map_create_opts {
            sz: size_of::<libbpf_sys::bpf_map_create_opts>() as libbpf_sys::size_t,
            ..Default::default()
        };

        let map = MapHandle::create(
            MapType::Hash,
            Some(name),
            size_of::<BinaryId>() as u32,
            size_of::<R>() as u32,
            max_entries,
            &opts,
        )?;
        Ok(Self {
            map,
            _record: PhantomData,
        })
    }

    /// Handle for wiring the map into the unwinder object at load time.
    pub fn map(&self) -> &MapHandle {
        &self.map
    }
}

impl<R: Plain> ConfigSink for BpfConfigMap<R> {
    type Record = R;

    fn add(&self, id: BinaryId, record: &R) -> anyhow::Result<()> {
        self.map.update(
            &id.to_le_bytes(),
            unsafe { plain::as_bytes(record) },
            MapFlags::ANY,
        )?;
        Ok(())
    }

    fn delete(&self, id: BinaryId) -> anyhow::Result<()> {
        match self.map.delete(&id.to_le_bytes()) {
            Err(e) if e.kind() == libbpf_rs::ErrorKind::NotFound => Ok(()),
            res => Ok(res?),
        }
    }
}

/// The unwinder's view of unwind tables: an LPM trie routing addresses to
/// `unwind_segment_t` records and a hash-of-maps with one rule row array
/// per binary.
pub struct BpfSegmentMap {
    segments: MapHandle,
    tables: MapHandle,
    // Template for the inner arrays, the outer map keeps its layout.
    _table_shape: MapHandle,
    max_table_rows: u32,
}

impl BpfSegmentMap {
    pub fn create(
        max_binaries: u32,
        max_segment_blocks: u32,
        max_table_rows: u32,
    ) -> Result<Self, libbpf_rs::Error> {
        // LPM tries cannot be preallocated.
        let lpm_opts = libbpf_sys::bpf_map_create_opts {
            sz: size_of::<libbpf_sys::bpf_map_create_opts>() as libbpf_sys::size_t,
            map_flags: libbpf_sys::BPF_F_NO_PREALLOC,
            ..Default::default()
        };
        let segments = MapHandle::create(
            MapType::LpmTrie,
            Some("unwind_segments"),
            size_of::<unwind_segment_key>() as u32,
            size_of::<unwind_segment_t>() as u32,
            max_segment_blocks,
            &lpm_opts,
        )?;

        let table_shape = Self::create_rows_map(max_table_rows)?;
        let outer_opts = libbpf_sys::bpf_map_create_opts {
            sz: size_of::<libbpf_sys::bpf_map_create_opts>() as libbpf_sys::size_t,
            inner_map_fd: table_shape.as_fd().as_raw_fd() as u32,
            ..Default::default()
        };
        let tables = MapHandle::create(
            MapType::HashOfMaps,
            Some("unwind_tables"),
            size_of::<BinaryId>() as u32,
            size_of::<u32>() as u32,
            max_binaries,
            &outer_opts,
        )?;

        Ok(Self {
            segments,
            tables,
            _table_shape: table_shape,
            max_table_rows,
        })
    }

    fn create_rows_map(max_table_rows: u32) -> Result<MapHandle, libbpf_rs::Error> {
        let opts = libbpf_sys::bpf_map_create_opts {
            sz: size_of::<libbpf_sys::bpf_map_create_opts>() as libbpf_sys::size_t,
            ..Default::default()
        };
        MapHandle::create(
            MapType::Array,
            Some("unwind_rows"),
            size_of::<u32>() as u32,
            size_of::<unwind_rule_t>() as u32,
            max_table_rows,
            &opts,
        )
    }

    pub fn segments_map(&self) -> &MapHandle {
        &self.segments
    }

    pub fn tables_map(&self) -> &MapHandle {
        &self.tables
    }
}

impl SegmentSink for BpfSegmentMap {
    fn add_table(&self, id: BinaryId, rows: &[unwind_rule_t]) -> anyhow::Result<()> {
        if rows.len() > self.max_table_rows as usize {
            return Err(anyhow!(
                "unwind table for binary {} has {} rows, the row arrays fit {}",
                id,
                rows.len(),
                self.max_table_rows
            ));
        }

        let inner = Self::create_rows_map(self.max_table_rows)?;

        let chunk_size = 25_000;
        let mut keys: Vec<u8> = Vec::with_capacity(size_of::<u32>() * chunk_size);
        let mut values: Vec<u8> = Vec::with_capacity(size_of::<unwind_rule_t>() * chunk_size);

        for indices_and_rows in &rows.iter().enumerate().chunks(chunk_size) {
            keys.clear();
            values.clear();

            let mut chunk_len = 0;
            for (i, row) in indices_and_rows {
                keys.extend_from_slice(&(i as u32).to_le_bytes());
                values.extend_from_slice(unsafe { plain::as_bytes(row) });
                chunk_len += 1;
            }

            inner.update_batch(&keys[..], &values[..], chunk_len, MapFlags::ANY, MapFlags::ANY)?;
        }

        // The kernel pins the inner array through the outer map entry, the
        // local handle can go out of scope.
        self.tables.update(
            &id.to_le_bytes(),
            &inner.as_fd().as_raw_fd().to_le_bytes(),
            MapFlags::ANY,
        )?;
        Ok(())
    }

    fn remove_table(&self, id: BinaryId) -> anyhow::Result<()> {
        match self.tables.delete(&id.to_le_bytes()) {
            Err(e) if e.kind() == libbpf_rs::ErrorKind::NotFound => Ok(()),
            res => Ok(res?),
        }
    }

    fn add_segments(&self, space: AddressSpace, segments: &[TableSegment]) -> anyhow::Result<()> {
        for segment in segments {
            let record = unwind_segment_t {
                binary_id: segment.binary_id,
                begin: segment.begin,
                end: segment.end,
            };
            for block in summarize_address_range(segment.begin, segment.end - 1) {
                let key = unwind_segment_key::new(space, block.addr, 32 + block.prefix_len);
                self.segments.update(
                    unsafe { plain::as_bytes(&key) },
                    unsafe { plain::as_bytes(&record) },
                    MapFlags::ANY,
                )?;
            }
        }
        Ok(())
    }

    fn remove_segments(
        &self,
        space: AddressSpace,
        segments: &[TableSegment],
    ) -> anyhow::Result<()> {
        let mut first_error = None;
        for segment in segments {
            for block in summarize_address_range(segment.begin, segment.end - 1) {
                let key = unwind_segment_key::new(space, block.addr, 32 + block.prefix_len);
                match self.segments.delete(unsafe { plain::as_bytes(&key) }) {
                    Ok(()) => {}
                    Err(e) if e.kind() == libbpf_rs::ErrorKind::NotFound => {}
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
