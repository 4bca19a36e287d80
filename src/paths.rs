//! Host directory layout for vmvm.
//!
//! - Runtime: `$XDG_RUNTIME_DIR` or `/run/user/<uid>`. QEMU sockets go under
//!   `qemu/<vm name>/`, next to the swtpm state directory.
//! - Logs:    `$XDG_DATA_HOME/vmvm/logs` or `~/.local/share/vmvm/logs`.

use std::path::{Path, PathBuf};

use tracing::info;

const APP_NAME: &str = "vmvm";

/// All resolved host paths.
#[derive(Debug, Clone)]
pub struct VmvmPaths {
    /// Per-user runtime root (tmpfs, cleared at logout).
    pub runtime: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl VmvmPaths {
    /// Resolve paths from the environment.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        Self {
            runtime: resolve_runtime_dir(),
            logs: resolve_log_dir(home.as_deref()),
        }
    }

    /// Create the log directory if missing. The runtime directory is owned
    /// by the session manager and only populated lazily.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.logs)?;
        info!("ensured directory: {}", self.logs.display());
        Ok(())
    }

    /// Directory holding the sockets and swtpm state of one VM.
    pub fn vm_runtime_dir(&self, vm_name: &str) -> PathBuf {
        crate::vm::sockets::socket_dir(&self.runtime, vm_name)
    }

    /// swtpm state directory for one VM.
    pub fn tpm_dir(&self, vm_name: &str) -> PathBuf {
        self.vm_runtime_dir(vm_name).join("tpm")
    }
}

fn resolve_runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            // SAFETY: getuid() has no preconditions and cannot fail.
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/run/user/{uid}"))
        }
    }
}

fn resolve_log_dir(home: Option<&Path>) -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else if let Some(home) = home {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    } else {
        std::env::temp_dir().join(APP_NAME).join("logs")
    }
}
