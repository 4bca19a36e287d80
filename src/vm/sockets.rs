//! Unix socket locations for SPICE and QMP.
//!
//! Sockets live under `<runtime_root>/qemu/<vm name>/<purpose>.sock`. The
//! purpose is the file stem, so a VM with both SPICE-over-unix and a QMP
//! control socket gets two distinct paths in the same directory.

use std::fmt;
use std::path::{Path, PathBuf};

use super::error::{Result, SynthError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPurpose {
    Spice,
    Qmp,
}

impl fmt::Display for SocketPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SocketPurpose::Spice => "spice",
            SocketPurpose::Qmp => "qmp",
        })
    }
}

/// Directory holding every socket of one VM.
pub fn socket_dir(runtime_root: &Path, vm_name: &str) -> PathBuf {
    runtime_root.join("qemu").join(vm_name)
}

/// Resolve the socket path for `purpose`, creating its directory if needed.
///
/// Calling this repeatedly with the same arguments returns the same path and
/// never fails because the directory already exists.
pub fn socket_path(runtime_root: &Path, purpose: SocketPurpose, vm_name: &str) -> Result<PathBuf> {
    let dir = socket_dir(runtime_root, vm_name);
    std::fs::create_dir_all(&dir).map_err(|source| SynthError::SocketDir {
        path: dir.clone(),
        source,
    })?;
    Ok(dir.join(format!("{purpose}.sock")))
}
