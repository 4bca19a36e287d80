//! Errors surfaced by argument synthesis.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SynthError>;

#[derive(Debug, Error)]
pub enum SynthError {
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// EFI was requested but no usable CODE/VARS pair was found.
    /// `package` is the suffix of the distribution package to install.
    #[error("edk2 files not found in {}. Please install edk2-{package} package.", dir.display())]
    FirmwareNotFound { package: &'static str, dir: PathBuf },

    #[error("create socket directory {}: {source}", path.display())]
    SocketDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
