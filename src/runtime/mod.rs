pub mod pthread;
pub mod python;
pub mod python_versions;
pub mod tls;

use std::fmt;

use thiserror::Error;

use crate::analysis::BinaryId;
use crate::runtime::python_versions::UnsupportedVersionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    Tls,
    Python,
    Pthread,
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigKind::Tls => "tls",
            ConfigKind::Python => "python",
            ConfigKind::Pthread => "pthread",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to update {kind} config for binary {id}")]
    Map {
        kind: ConfigKind,
        id: BinaryId,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    UnsupportedPython(#[from] UnsupportedVersionError),
}
