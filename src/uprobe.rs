use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use thiserror::Error;
use tracing::debug;

use crate::symbols::symbol_file_offsets;

pub type Pid = i32;

/// Sample type reported for probe hits when the caller does not set one.
pub const DEFAULT_SAMPLE_TYPE: &str = "uprobe.count";

#[derive(Debug, Error)]
pub enum UprobeError {
    #[error("uprobe is already attached")]
    AlreadyAttached,
    #[error("failed to open {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to resolve symbols in {path:?}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("symbol {symbol} not found in {path:?}")]
    SymbolNotFound { symbol: String, path: PathBuf },
    #[error("failed to stat {path:?}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to attach uprobe for {symbol}")]
    Attach {
        symbol: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to detach uprobe")]
    Detach {
        #[source]
        source: anyhow::Error,
    },
}

/// Identifies the file a probe lives in, stable across path renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BinaryIdentity {
    pub dev_major: u32,
    pub dev_minor: u32,
    pub inode: u64,
}

impl BinaryIdentity {
    pub fn from_file(file: &File) -> io::Result<Self> {
        let metadata = file.metadata()?;
        let dev = metadata.dev();
        Ok(Self {
            dev_major: libc::major(dev),
            dev_minor: libc::minor(dev),
            inode: metadata.ino(),
        })
    }
}

/// The kernel reports probe hits as (binary, file offset) pairs. This key
/// mirrors that shape so hits can be mapped back to the probes that placed
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UprobeKey {
    pub identity: BinaryIdentity,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct UprobeConfig {
    pub path: PathBuf,
    pub symbol: String,
    /// Displacement from the start of the symbol, in bytes.
    pub local_offset: u64,
    pub sample_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UprobeOptions {
    /// Restrict the probe to one process. `None` traces every process.
    pub pid: Option<Pid>,
}

/// Metadata handed back to the event reader for an attached probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UprobeInfo {
    pub symbol: String,
    pub local_offset: u64,
    pub sample_type: String,
}

pub trait Uprobe: Send {
    fn attach(&mut self, target: &dyn AttachTarget) -> Result<(), UprobeError>;
    fn close(&mut self) -> Result<(), UprobeError>;
}

/// A loaded BPF program that user probes can be attached to.
pub trait AttachTarget {
    fn attach_uprobe_at(
        &self,
        pid: Pid,
        path: &Path,
        file_offset: u64,
    ) -> anyhow::Result<Box<dyn ProbeLink>>;
}

pub trait ProbeLink: Send {
    fn close(self: Box<Self>) -> anyhow::Result<()>;
}

impl AttachTarget for libbpf_rs::ProgramMut<'_> {
    fn attach_uprobe_at(
        &self,
        pid: Pid,
        path: &Path,
        file_offset: u64,
    ) -> anyhow::Result<Box<dyn ProbeLink>> {
        let link = self.attach_uprobe(false, pid, path, file_offset as usize)?;
        Ok(Box::new(link))
    }
}

impl ProbeLink for libbpf_rs::Link {
    fn close(self: Box<Self>) -> anyhow::Result<()> {
        (*self).detach()?;
        Ok(())
    }
}

/// Tracks every attached uprobe and resolves probe hits back to sample
/// metadata.
#[derive(Default)]
pub struct Registry {
    uprobes: RwLock<HashMap<UprobeKey, UprobeInfo>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        self: &Arc<Self>,
        config: UprobeConfig,
        options: UprobeOptions,
    ) -> Box<dyn Uprobe> {
        Box::new(FileOffsetUprobe {
            config,
            options,
            registry: Arc::clone(self),
            key: None,
            link: None,
        })
    }

    /// Sample metadata for a hit at `key`, if the probe is still attached.
    pub fn resolve(&self, key: &UprobeKey) -> Option<UprobeInfo> {
        self.uprobes.read().expect("lock").get(key).cloned()
    }

    fn add_resolve_info(&self, key: UprobeKey, info: UprobeInfo) {
        self.uprobes.write().expect("lock").insert(key, info);
    }

    fn remove_resolve_info(&self, key: &UprobeKey) {
        self.uprobes.write().expect("lock").remove(key);
    }
}

/// A uprobe placed at a file offset computed from a symbol name plus a local
/// displacement. The probe opens its target binary and attaches through the
/// open descriptor, so replacing the file on disk does not redirect the
/// probe.
pub struct FileOffsetUprobe {
    config: UprobeConfig,
    options: UprobeOptions,
    registry: Arc<Registry>,
    key: Option<UprobeKey>,
    link: Option<Box<dyn ProbeLink>>,
}

impl Uprobe for FileOffsetUprobe {
    fn attach(&mut self, target: &dyn AttachTarget) -> Result<(), UprobeError> {
        if self.link.is_some() {
            return Err(UprobeError::AlreadyAttached);
        }

        let path = &self.config.path;
        let file = File::open(path).map_err(|source| UprobeError::Open {
            path: path.clone(),
            source,
        })?;
        let offsets = symbol_file_offsets(&file, &[self.config.symbol.as_str()]).map_err(
            |source| UprobeError::Resolve {
                path: path.clone(),
                source,
            },
        )?;
        let symbol_offset =
            offsets
                .get(&self.config.symbol)
                .ok_or_else(|| UprobeError::SymbolNotFound {
                    symbol: self.config.symbol.clone(),
                    path: path.clone(),
                })?;
        let file_offset = symbol_offset + self.config.local_offset;
        let identity = BinaryIdentity::from_file(&file).map_err(|source| UprobeError::Stat {
            path: path.clone(),
            source,
        })?;

        let fd_path = format!("/proc/self/fd/{}", file.as_raw_fd());
        let pid = self.options.pid.unwrap_or(-1);
        let link = target
            .attach_uprobe_at(pid, Path::new(&fd_path), file_offset)
            .map_err(|source| UprobeError::Attach {
                symbol: self.config.symbol.clone(),
                source,
            })?;
        debug!(
            "attached uprobe for {} at file offset {:#x}",
            self.config.symbol, file_offset
        );

        // Publish resolve info only once the kernel has accepted the probe.
        let key = UprobeKey {
            identity,
            offset: file_offset,
        };
        self.registry.add_resolve_info(
            key,
            UprobeInfo {
                symbol: self.config.symbol.clone(),
                local_offset: self.config.local_offset,
                sample_type: self
                    .config
                    .sample_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SAMPLE_TYPE.to_string()),
            },
        );
        self.key = Some(key);
        self.link = Some(link);
        Ok(())
    }

    fn close(&mut self) -> Result<(), UprobeError> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        let result = link.close();
        if let Some(key) = self.key.take() {
            self.registry.remove_resolve_info(&key);
        }
        debug!("closed uprobe for {}", self.config.symbol);
        result.map_err(|source| UprobeError::Detach { source })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeTarget {
        attached: Mutex<Vec<(Pid, PathBuf, u64)>>,
        fail: bool,
        closes: Arc<AtomicUsize>,
    }

    struct FakeLink {
        closes: Arc<AtomicUsize>,
    }

    impl ProbeLink for FakeLink {
        fn close(self: Box<Self>) -> anyhow::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl AttachTarget for FakeTarget {
        fn attach_uprobe_at(
            &self,
            pid: Pid,
            path: &Path,
            file_offset: u64,
        ) -> anyhow::Result<Box<dyn ProbeLink>> {
            if self.fail {
                anyhow::bail!("injected attach failure");
            }
            self.attached
                .lock()
                .unwrap()
                .push((pid, path.to_path_buf(), file_offset));
            Ok(Box::new(FakeLink {
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    fn test_config() -> UprobeConfig {
        // The test binary itself is a perfectly good uprobe target.
        UprobeConfig {
            path: PathBuf::from("/proc/self/exe"),
            symbol: "main".to_string(),
            local_offset: 4,
            sample_type: None,
        }
    }

    #[test]
    fn test_attach_registers_and_close_unregisters() {
        let registry = Arc::new(Registry::new());
        let target = FakeTarget::default();
        let mut uprobe = registry.create(test_config(), UprobeOptions { pid: Some(1234) });

        uprobe.attach(&target).unwrap();

        let attached = target.attached.lock().unwrap().clone();
        assert_eq!(attached.len(), 1);
        let (pid, path, file_offset) = &attached[0];
        assert_eq!(*pid, 1234);
        assert!(path.starts_with("/proc/self/fd"));
        // main sits at a nonzero offset, plus our local displacement.
        assert!(*file_offset > 4);

        let identity =
            BinaryIdentity::from_file(&File::open("/proc/self/exe").unwrap()).unwrap();
        let key = UprobeKey {
            identity,
            offset: *file_offset,
        };
        assert_eq!(
            registry.resolve(&key),
            Some(UprobeInfo {
                symbol: "main".to_string(),
                local_offset: 4,
                sample_type: DEFAULT_SAMPLE_TYPE.to_string(),
            })
        );

        assert!(matches!(
            uprobe.attach(&target),
            Err(UprobeError::AlreadyAttached)
        ));

        uprobe.close().unwrap();
        assert_eq!(target.closes.load(Ordering::SeqCst), 1);
        assert_eq!(registry.resolve(&key), None);

        // Closing an already closed probe is a no-op.
        uprobe.close().unwrap();
        assert_eq!(target.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attach_defaults_to_all_processes() {
        let registry = Arc::new(Registry::new());
        let target = FakeTarget::default();
        let mut uprobe = registry.create(test_config(), UprobeOptions::default());

        uprobe.attach(&target).unwrap();

        let attached = target.attached.lock().unwrap().clone();
        assert_eq!(attached[0].0, -1);
    }

    #[test]
    fn test_attach_failure_publishes_nothing() {
        let registry = Arc::new(Registry::new());
        let target = FakeTarget {
            fail: true,
            ..Default::default()
        };
        let mut uprobe = registry.create(test_config(), UprobeOptions::default());

        assert!(matches!(
            uprobe.attach(&target),
            Err(UprobeError::Attach { .. })
        ));
        assert!(registry.uprobes.read().unwrap().is_empty());

        // And the probe can still be attached once the target recovers.
        let working = FakeTarget::default();
        uprobe.attach(&working).unwrap();
        assert_eq!(registry.uprobes.read().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_symbol_is_rejected_before_attaching() {
        let registry = Arc::new(Registry::new());
        let target = FakeTarget::default();
        let mut uprobe = registry.create(
            UprobeConfig {
                symbol: "binyard_no_such_symbol".to_string(),
                ..test_config()
            },
            UprobeOptions::default(),
        );

        assert!(matches!(
            uprobe.attach(&target),
            Err(UprobeError::SymbolNotFound { .. })
        ));
        assert!(target.attached.lock().unwrap().is_empty());
    }

    #[test]
    fn test_custom_sample_type_is_kept() {
        let registry = Arc::new(Registry::new());
        let target = FakeTarget::default();
        let mut uprobe = registry.create(
            UprobeConfig {
                sample_type: Some("malloc.bytes".to_string()),
                ..test_config()
            },
            UprobeOptions::default(),
        );

        uprobe.attach(&target).unwrap();

        let offset = target.attached.lock().unwrap()[0].2;
        let identity =
            BinaryIdentity::from_file(&File::open("/proc/self/exe").unwrap()).unwrap();
        let info = registry
            .resolve(&UprobeKey { identity, offset })
            .unwrap();
        assert_eq!(info.sample_type, "malloc.bytes");
    }
}
