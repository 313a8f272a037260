use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use thiserror::Error;
use tracing::span;
use tracing::warn;
use tracing::Level;

use crate::analysis::BinaryAnalysis;
use crate::analysis::BinaryId;
use crate::bpf::unwinder_bindings::pthread_config;
use crate::bpf::unwinder_bindings::python_config;
use crate::bpf::unwinder_bindings::tls_binary_config;
use crate::maps::ConfigSink;
use crate::maps::SegmentSink;
use crate::runtime::pthread::PthreadConfigStore;
use crate::runtime::python::PythonConfigStore;
use crate::runtime::tls::TlsConfigStore;
use crate::runtime::ConfigError;
use crate::unwind_table::TableError;
use crate::unwind_table::UnwindTableAllocation;
use crate::unwind_table::UnwindTableStore;

#[derive(Debug, Error)]
pub enum AddError {
    #[error("failed to add unwind table for binary {id} ({build_id})")]
    UnwindTable {
        build_id: String,
        id: BinaryId,
        #[source]
        source: TableError,
    },
    #[error("failed to add runtime config for binary {id} ({build_id})")]
    Config {
        build_id: String,
        id: BinaryId,
        #[source]
        source: ConfigError,
    },
}

/// Everything the kernel holds for one binary. Surrender it to `release`
/// to free the records; it cannot be released twice.
#[derive(Debug)]
pub struct Allocation {
    build_id: String,
    binary_id: BinaryId,
    table: UnwindTableAllocation,
    tls_names: RwLock<HashMap<u64, String>>,
}

impl Allocation {
    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn binary_id(&self) -> BinaryId {
        self.binary_id
    }

    /// Remembers the name of the thread local variable stored at `offset`
    /// so samples can be labeled. Names are attached after allocation, the
    /// map starts out empty.
    pub fn insert_tls_name(&self, offset: u64, name: String) {
        self.tls_names.write().expect("lock").insert(offset, name);
    }

    pub fn tls_name(&self, offset: u64) -> Option<String> {
        self.tls_names.read().expect("lock").get(&offset).cloned()
    }
}

enum UndoStep {
    Tls(BinaryId),
    Python(BinaryId),
    Pthread(BinaryId),
}

/// Owns every per-binary kernel resource: the unwind table plus the TLS,
/// Python, and pthread runtime configs. `add` either allocates all of them
/// or none.
pub struct BinaryManager {
    tables: UnwindTableStore,
    tls: TlsConfigStore,
    python: PythonConfigStore,
    pthread: PthreadConfigStore,
}

impl BinaryManager {
    pub fn new(
        segments: Arc<dyn SegmentSink + Send + Sync>,
        tls: Arc<dyn ConfigSink<Record = tls_binary_config> + Send + Sync>,
        python: Arc<dyn ConfigSink<Record = python_config> + Send + Sync>,
        pthread: Arc<dyn ConfigSink<Record = pthread_config> + Send + Sync>,
    ) -> Self {
        Self {
            tables: UnwindTableStore::new(segments),
            tls: TlsConfigStore::new(tls),
            python: PythonConfigStore::new(python),
            pthread: PthreadConfigStore::new(pthread),
        }
    }

    /// Allocates kernel resources for one binary, in a fixed order: unwind
    /// table, then TLS, Python, and pthread configs. The first failure
    /// undoes every step already committed, in reverse order, before
    /// returning.
    pub fn add(
        &self,
        build_id: &str,
        id: BinaryId,
        analysis: &BinaryAnalysis,
    ) -> Result<Allocation, AddError> {
        let _span = span!(Level::DEBUG, "BinaryManager.add").entered();

        let table = self
            .tables
            .add(build_id, id, &analysis.unwind_table)
            .map_err(|source| AddError::UnwindTable {
                build_id: build_id.to_string(),
                id,
                source,
            })?;

        let mut committed = Vec::new();
        if let Err(source) = self.add_runtime_configs(id, analysis, &mut committed) {
            self.rollback(committed, table);
            return Err(AddError::Config {
                build_id: build_id.to_string(),
                id,
                source,
            });
        }

        Ok(Allocation {
            build_id: build_id.to_string(),
            binary_id: id,
            table,
            tls_names: RwLock::new(HashMap::new()),
        })
    }

    fn add_runtime_configs(
        &self,
        id: BinaryId,
        analysis: &BinaryAnalysis,
        committed: &mut Vec<UndoStep>,
    ) -> Result<(), ConfigError> {
        self.tls.add(id, analysis.tls.as_ref())?;
        if analysis.tls.is_some() {
            committed.push(UndoStep::Tls(id));
        }
        self.python.add(id, analysis.python.as_ref())?;
        if analysis.python.is_some() {
            committed.push(UndoStep::Python(id));
        }
        self.pthread.add(id, analysis.pthread.as_ref())?;
        if analysis.pthread.is_some() {
            committed.push(UndoStep::Pthread(id));
        }
        Ok(())
    }

    fn rollback(&self, committed: Vec<UndoStep>, table: UnwindTableAllocation) {
        warn!(
            "rolling back {} runtime configs for binary {}",
            committed.len(),
            table.binary_id()
        );
        for step in committed.into_iter().rev() {
            match step {
                UndoStep::Pthread(id) => self.pthread.release(id),
                UndoStep::Python(id) => self.python.release(id),
                UndoStep::Tls(id) => self.tls.release(id),
            }
        }
        self.tables.release(table);
    }

    /// Frees every resource held by `allocation`. Each deletion is
    /// attempted independently; failures are logged, not raised.
    pub fn release(&self, allocation: Allocation) {
        let _span = span!(Level::DEBUG, "BinaryManager.release").entered();
        let Allocation {
            binary_id, table, ..
        } = allocation;
        self.pthread.release(binary_id);
        self.python.release(binary_id);
        self.tls.release(binary_id);
        self.tables.release(table);
    }

    pub fn move_to_cache(&self, allocation: &Allocation) -> bool {
        self.tables.move_to_cache(&allocation.table)
    }

    pub fn move_from_cache(&self, allocation: &Allocation) -> bool {
        self.tables.move_from_cache(&allocation.table)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use super::*;
    use crate::analysis::AddressSpace;
    use crate::analysis::PthreadConfig;
    use crate::analysis::PythonConfig;
    use crate::analysis::PythonVersion;
    use crate::analysis::SegmentSpan;
    use crate::analysis::TlsConfig;
    use crate::analysis::TlsVariable;
    use crate::analysis::UnwindTableAnalysis;
    use crate::bpf::unwinder_bindings::unwind_rule_t;
    use crate::runtime::testing::RecordingSink;
    use crate::runtime::ConfigKind;
    use crate::unwind_table::TableSegment;

    #[derive(Default)]
    struct KernelSegments {
        tables: Mutex<HashMap<BinaryId, usize>>,
        segments: Mutex<HashMap<(AddressSpace, u64, u64), BinaryId>>,
    }

    impl SegmentSink for KernelSegments {
        fn add_table(&self, id: BinaryId, rows: &[unwind_rule_t]) -> anyhow::Result<()> {
            self.tables.lock().unwrap().insert(id, rows.len());
            Ok(())
        }

        fn remove_table(&self, id: BinaryId) -> anyhow::Result<()> {
            self.tables.lock().unwrap().remove(&id);
            Ok(())
        }

        fn add_segments(
            &self,
            space: AddressSpace,
            segments: &[TableSegment],
        ) -> anyhow::Result<()> {
            let mut map = self.segments.lock().unwrap();
            for segment in segments {
                map.insert((space, segment.begin, segment.end), segment.binary_id);
            }
            Ok(())
        }

        fn remove_segments(
            &self,
            space: AddressSpace,
            segments: &[TableSegment],
        ) -> anyhow::Result<()> {
            let mut map = self.segments.lock().unwrap();
            for segment in segments {
                map.remove(&(space, segment.begin, segment.end));
            }
            Ok(())
        }
    }

    struct Harness {
        manager: BinaryManager,
        segments: Arc<KernelSegments>,
        tls: Arc<RecordingSink<tls_binary_config>>,
        python: Arc<RecordingSink<python_config>>,
        pthread: Arc<RecordingSink<pthread_config>>,
    }

    impl Harness {
        fn new() -> Self {
            let segments = Arc::new(KernelSegments::default());
            let tls: Arc<RecordingSink<tls_binary_config>> = Arc::new(RecordingSink::default());
            let python: Arc<RecordingSink<python_config>> = Arc::new(RecordingSink::default());
            let pthread: Arc<RecordingSink<pthread_config>> = Arc::new(RecordingSink::default());
            let manager = BinaryManager::new(
                segments.clone(),
                tls.clone(),
                python.clone(),
                pthread.clone(),
            );
            Self {
                manager,
                segments,
                tls,
                python,
                pthread,
            }
        }

        fn kernel_is_empty(&self) -> bool {
            self.segments.tables.lock().unwrap().is_empty()
                && self.segments.segments.lock().unwrap().is_empty()
                && self.tls.records.lock().unwrap().is_empty()
                && self.python.records.lock().unwrap().is_empty()
                && self.pthread.records.lock().unwrap().is_empty()
        }
    }

    fn analysis() -> BinaryAnalysis {
        BinaryAnalysis {
            unwind_table: UnwindTableAnalysis {
                address_space: 7,
                generation: 1,
                segments: vec![
                    SegmentSpan {
                        begin: 0x1000,
                        end: 0x5000,
                    },
                    SegmentSpan {
                        begin: 0x8000,
                        end: 0x9000,
                    },
                ],
                rows: vec![unwind_rule_t::default(); 3],
            },
            tls: Some(TlsConfig {
                variables: vec![TlsVariable {
                    offset: 16,
                    name: "g_state".to_string(),
                }],
            }),
            python: Some(PythonConfig {
                version: PythonVersion {
                    major: 3,
                    minor: 12,
                    micro: 1,
                },
                py_thread_state_tls_offset: -104,
                relative_py_runtime_address: 0x4a_0000,
                relative_py_interp_head_address: 0,
                relative_auto_tss_key_address: 0x4b_0000,
                unicode_type_size_log2: 1,
            }),
            pthread: Some(PthreadConfig {
                key_data_size: 16,
                key_data_value_offset: 8,
                key_data_seq_offset: 0,
                first_specific_block_offset: 0x310,
                specific_array_offset: 0x510,
                struct_pthread_pointer_offset: 0x10,
                key_second_level_size: 32,
                key_first_level_size: 32,
                keys_max: 1024,
            }),
        }
    }

    #[test]
    fn test_add_then_release_clears_kernel_state() {
        let h = Harness::new();

        let allocation = h.manager.add("abc123", 42, &analysis()).unwrap();
        assert_eq!(allocation.build_id(), "abc123");
        assert_eq!(allocation.binary_id(), 42);
        assert_eq!(h.segments.tables.lock().unwrap().get(&42), Some(&3));
        assert_eq!(h.segments.segments.lock().unwrap().len(), 2);
        assert!(h.tls.records.lock().unwrap().contains_key(&42));
        assert!(h.python.records.lock().unwrap().contains_key(&42));
        assert!(h.pthread.records.lock().unwrap().contains_key(&42));

        h.manager.release(allocation);
        assert!(h.kernel_is_empty());
    }

    #[test]
    fn test_add_without_runtime_configs() {
        let h = Harness::new();
        let bare = BinaryAnalysis {
            tls: None,
            python: None,
            pthread: None,
            ..analysis()
        };

        let allocation = h.manager.add("abc123", 42, &bare).unwrap();
        assert!(h.tls.records.lock().unwrap().is_empty());
        assert!(h.python.records.lock().unwrap().is_empty());
        assert!(h.pthread.records.lock().unwrap().is_empty());

        h.manager.release(allocation);
        assert!(h.kernel_is_empty());
    }

    #[test]
    fn test_tls_failure_rolls_back_the_table() {
        let h = Harness::new();
        h.tls.fail.store(true, Ordering::Relaxed);

        let err = h.manager.add("abc123", 42, &analysis()).unwrap_err();
        assert!(matches!(
            err,
            AddError::Config {
                source: ConfigError::Map {
                    kind: ConfigKind::Tls,
                    ..
                },
                ..
            }
        ));
        assert!(h.kernel_is_empty());
    }

    #[test]
    fn test_python_failure_rolls_back_tls_and_table() {
        let h = Harness::new();
        h.python.fail.store(true, Ordering::Relaxed);

        let err = h.manager.add("abc123", 42, &analysis()).unwrap_err();
        assert!(matches!(
            err,
            AddError::Config {
                source: ConfigError::Map {
                    kind: ConfigKind::Python,
                    ..
                },
                ..
            }
        ));
        assert!(h.kernel_is_empty());

        // The id is free again once the failure clears.
        h.python.fail.store(false, Ordering::Relaxed);
        let allocation = h.manager.add("abc123", 42, &analysis()).unwrap();
        h.manager.release(allocation);
    }

    #[test]
    fn test_pthread_failure_rolls_back_everything() {
        let h = Harness::new();
        h.pthread.fail.store(true, Ordering::Relaxed);

        let err = h.manager.add("abc123", 42, &analysis()).unwrap_err();
        assert!(matches!(
            err,
            AddError::Config {
                source: ConfigError::Map {
                    kind: ConfigKind::Pthread,
                    ..
                },
                ..
            }
        ));
        assert!(h.kernel_is_empty());
    }

    #[test]
    fn test_unsupported_python_is_rejected() {
        let h = Harness::new();
        let mut unsupported = analysis();
        unsupported.python = Some(PythonConfig {
            version: PythonVersion {
                major: 3,
                minor: 99,
                micro: 0,
            },
            ..unsupported.python.unwrap()
        });

        let err = h.manager.add("abc123", 42, &unsupported).unwrap_err();
        assert!(matches!(
            err,
            AddError::Config {
                source: ConfigError::UnsupportedPython(_),
                ..
            }
        ));
        assert!(h.kernel_is_empty());
    }

    #[test]
    fn test_duplicate_add_is_rejected() {
        let h = Harness::new();
        let allocation = h.manager.add("abc123", 42, &analysis()).unwrap();

        let err = h.manager.add("abc123", 42, &analysis()).unwrap_err();
        assert!(matches!(
            err,
            AddError::UnwindTable {
                source: TableError::AlreadyRegistered(42),
                ..
            }
        ));

        h.manager.release(allocation);
    }

    #[test]
    fn test_allocation_tracks_tls_names() {
        let h = Harness::new();
        let allocation = h.manager.add("abc123", 7, &analysis()).unwrap();

        assert_eq!(allocation.tls_name(16), None);
        allocation.insert_tls_name(16, "g_state".to_string());
        assert_eq!(allocation.tls_name(16), Some("g_state".to_string()));

        h.manager.release(allocation);
    }

    #[test]
    fn test_cache_moves_delegate_to_the_table_store() {
        let h = Harness::new();
        let allocation = h.manager.add("abc123", 1, &analysis()).unwrap();

        assert!(h.manager.move_to_cache(&allocation));
        assert!(!h.manager.move_to_cache(&allocation));
        assert!(h.manager.move_from_cache(&allocation));
        assert!(!h.manager.move_from_cache(&allocation));

        h.manager.release(allocation);
    }
}
