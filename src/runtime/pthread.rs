use std::sync::Arc;
use std::sync::Mutex;

use tracing::error;

use crate::analysis::BinaryId;
use crate::analysis::PthreadConfig;
use crate::bpf::unwinder_bindings::pthread_config;
use crate::bpf::unwinder_bindings::pthread_key_data_offsets;
use crate::maps::ConfigSink;
use crate::runtime::ConfigError;
use crate::runtime::ConfigKind;

/// Publishes libc internals the sampler needs to read pthread specific
/// data, keyed by the libc binary.
pub struct PthreadConfigStore {
    // Guards this kind's kernel writes only, held for the map call.
    sink: Mutex<Arc<dyn ConfigSink<Record = pthread_config> + Send + Sync>>,
}

impl PthreadConfigStore {
    pub fn new(sink: Arc<dyn ConfigSink<Record = pthread_config> + Send + Sync>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// No-op when the binary carries no pthread config.
    pub fn add(&self, id: BinaryId, config: Option<&PthreadConfig>) -> Result<(), ConfigError> {
        let Some(config) = config else {
            return Ok(());
        };
        let record = encode_pthread_config(config);
        self.sink
            .lock()
            .expect("lock")
            .add(id, &record)
            .map_err(|e| ConfigError::Map {
                kind: ConfigKind::Pthread,
                id,
                source: e,
            })
    }

    pub fn release(&self, id: BinaryId) {
        if let Err(e) = self.sink.lock().expect("lock").delete(id) {
            error!("failed to delete pthread config for binary {}: {:?}", id, e);
        }
    }
}

fn encode_pthread_config(config: &PthreadConfig) -> pthread_config {
    pthread_config {
        key_data: pthread_key_data_offsets {
            size: config.key_data_size,
            value_offset: config.key_data_value_offset,
            seq_offset: config.key_data_seq_offset,
        },
        first_specific_block_offset: config.first_specific_block_offset,
        specific_array_offset: config.specific_array_offset,
        struct_pthread_pointer_offset: config.struct_pthread_pointer_offset,
        key_second_level_size: config.key_second_level_size,
        key_first_level_size: config.key_first_level_size,
        keys_max: config.keys_max,
    }
}
