use std::sync::Arc;
use std::sync::Mutex;

use tracing::error;
use tracing::warn;

use crate::analysis::BinaryId;
use crate::analysis::TlsConfig;
use crate::bpf::unwinder_bindings::tls_binary_config;
use crate::bpf::unwinder_bindings::MAX_TLS_VARIABLES;
use crate::maps::ConfigSink;
use crate::runtime::ConfigError;
use crate::runtime::ConfigKind;

/// Publishes per-binary thread local variable offsets to the sampler.
pub struct TlsConfigStore {
    // Guards this kind's kernel writes only, held for the map call.
    sink: Mutex<Arc<dyn ConfigSink<Record = tls_binary_config> + Send + Sync>>,
}

impl TlsConfigStore {
    pub fn new(sink: Arc<dyn ConfigSink<Record = tls_binary_config> + Send + Sync>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// No-op when the binary carries no TLS config.
    pub fn add(&self, id: BinaryId, config: Option<&TlsConfig>) -> Result<(), ConfigError> {
        let Some(config) = config else {
            return Ok(());
        };
        let record = encode_tls_config(config);
        self.sink
            .lock()
            .expect("lock")
            .add(id, &record)
            .map_err(|e| ConfigError::Map {
                kind: ConfigKind::Tls,
                id,
                source: e,
            })
    }

    /// Kernel errors are logged and swallowed so the rest of a binary's
    /// teardown still runs.
    pub fn release(&self, id: BinaryId) {
        if let Err(e) = self.sink.lock().expect("lock").delete(id) {
            error!("failed to delete tls config for binary {}: {:?}", id, e);
        }
    }
}

fn encode_tls_config(config: &TlsConfig) -> tls_binary_config {
    if config.variables.len() > MAX_TLS_VARIABLES {
        warn!(
            "binary declares {} thread local variables, tracking the first {}",
            config.variables.len(),
            MAX_TLS_VARIABLES
        );
    }

    let mut record = tls_binary_config::default();
    for (slot, variable) in record.offsets.iter_mut().zip(&config.variables) {
        *slot = variable.offset;
    }
    record.count = config.variables.len().min(MAX_TLS_VARIABLES) as u64;
    record
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::analysis::TlsVariable;
    use crate::runtime::testing::RecordingSink;

    fn variable(offset: u64, name: &str) -> TlsVariable {
        TlsVariable {
            offset,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_encode_tls_config() {
        let config = TlsConfig {
            variables: vec![variable(0xfff8, "counter"), variable(0xffe0, "trace_id")],
        };
        let record = encode_tls_config(&config);
        assert_eq!(record.count, 2);
        assert_eq!(record.offsets[0], 0xfff8);
        assert_eq!(record.offsets[1], 0xffe0);
        assert_eq!(record.offsets[2], 0);
    }

    #[test]
    fn test_encode_truncates_excess_variables() {
        let variables = (0..MAX_TLS_VARIABLES as u64 + 3)
            .map(|i| variable(i * 8, "v"))
            .collect();
        let record = encode_tls_config(&TlsConfig { variables });
        assert_eq!(record.count, MAX_TLS_VARIABLES as u64);
        assert_eq!(
            record.offsets[MAX_TLS_VARIABLES - 1],
            (MAX_TLS_VARIABLES as u64 - 1) * 8
        );
    }

    #[test]
    fn test_store_roundtrip() {
        let sink = Arc::new(RecordingSink::<tls_binary_config>::default());
        let store = TlsConfigStore::new(sink.clone());

        store
            .add(
                5,
                Some(&TlsConfig {
                    variables: vec![variable(0x10, "v")],
                }),
            )
            .unwrap();
        assert_eq!(sink.records.lock().unwrap().get(&5).unwrap().count, 1);

        store.release(5);
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[test]
    fn test_add_without_config_is_noop() {
        let sink = Arc::new(RecordingSink::<tls_binary_config>::default());
        let store = TlsConfigStore::new(sink.clone());

        store.add(5, None).unwrap();
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[test]
    fn test_release_swallows_sink_errors() {
        let sink = Arc::new(RecordingSink::<tls_binary_config>::default());
        let store = TlsConfigStore::new(sink.clone());
        sink.fail.store(true, Ordering::Relaxed);

        // Must not propagate or panic.
        store.release(5);
    }
}
