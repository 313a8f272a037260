use std::sync::Arc;
use std::sync::Mutex;

use tracing::error;

use crate::analysis::BinaryId;
use crate::analysis::PythonConfig;
use crate::bpf::unwinder_bindings::python_config;
use crate::maps::ConfigSink;
use crate::runtime::python_versions;
use crate::runtime::python_versions::UnsupportedVersionError;
use crate::runtime::ConfigError;
use crate::runtime::ConfigKind;

/// Publishes interpreter walking offsets for binaries embedding CPython.
pub struct PythonConfigStore {
    // Guards this kind's kernel writes only, held for the map call.
    sink: Mutex<Arc<dyn ConfigSink<Record = python_config> + Send + Sync>>,
}

impl PythonConfigStore {
    pub fn new(sink: Arc<dyn ConfigSink<Record = python_config> + Send + Sync>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// No-op when the binary carries no Python config. Fails for releases
    /// the bundled offsets table does not cover.
    pub fn add(&self, id: BinaryId, config: Option<&PythonConfig>) -> Result<(), ConfigError> {
        let Some(config) = config else {
            return Ok(());
        };
        let record = encode_python_config(config)?;
        self.sink
            .lock()
            .expect("lock")
            .add(id, &record)
            .map_err(|e| ConfigError::Map {
                kind: ConfigKind::Python,
                id,
                source: e,
            })
    }

    pub fn release(&self, id: BinaryId) {
        if let Err(e) = self.sink.lock().expect("lock").delete(id) {
            error!("failed to delete python config for binary {}: {:?}", id, e);
        }
    }
}

fn encode_python_config(config: &PythonConfig) -> Result<python_config, UnsupportedVersionError> {
    let offsets = python_versions::offsets_for_version(config.version)?;
    Ok(python_config {
        // The analyzer reports the thread state slot as a negative
        // displacement from the thread control block, the unwinder wants
        // the magnitude.
        py_thread_state_tls_offset: config.py_thread_state_tls_offset.wrapping_neg() as u64,
        py_runtime_relative_address: config.relative_py_runtime_address,
        py_interp_head_relative_address: config.relative_py_interp_head_address,
        auto_tss_key_relative_address: config.relative_auto_tss_key_address,
        version: python_versions::encode_version(config.version),
        unicode_type_size_log2: config.unicode_type_size_log2,
        offsets,
    })
}
