//! Software TPM (swtpm) daemon for guests with `tpm = true`.
//!
//! QEMU's `tpm-emulator` backend talks to an external swtpm over a unix
//! control socket. The daemon is started before the emulator and torn down,
//! with its state directory, once the emulator exits.
//!
//! ```text
//! SwtpmDaemon::start(dir)
//!     └─► swtpm socket --tpmstate dir=<dir> --ctrl type=unixio,path=<dir>/swtpm-sock --tpm2
//!             └─► socket() → RuntimeParams::tpm_socket
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tracing::{info, warn};

const SOCKET_NAME: &str = "swtpm-sock";

/// How long to wait for swtpm to create its control socket.
const SOCKET_WAIT: Duration = Duration::from_secs(5);

pub struct SwtpmDaemon {
    dir: PathBuf,
    child: Child,
}

/// Arguments for a TPM 2.0 swtpm keeping its state in `dir`.
pub fn swtpm_args(dir: &Path) -> Vec<String> {
    vec![
        "socket".to_string(),
        "--tpmstate".to_string(),
        format!("dir={}", dir.display()),
        "--ctrl".to_string(),
        format!("type=unixio,path={}", dir.join(SOCKET_NAME).display()),
        "--tpm2".to_string(),
    ]
}

impl SwtpmDaemon {
    /// Spawn swtpm with its state in `dir` and wait for the control socket.
    pub async fn start(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create TPM state directory {}", dir.display()))?;

        let child = Command::new("swtpm")
            .args(swtpm_args(&dir))
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn swtpm (is it installed?)")?;
        info!(dir = %dir.display(), "software TPM daemon started");

        let daemon = Self { dir, child };
        daemon.wait_for_socket().await;
        Ok(daemon)
    }

    /// Control socket to hand to QEMU.
    pub fn socket(&self) -> PathBuf {
        self.dir.join(SOCKET_NAME)
    }

    async fn wait_for_socket(&self) {
        let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
        let socket = self.socket();
        while !socket.exists() {
            if tokio::time::Instant::now() >= deadline {
                warn!(socket = %socket.display(), "swtpm socket did not appear in time");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stop the daemon and delete its state directory.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down software TPM daemon");
        match self.child.try_wait() {
            Ok(Some(status)) => info!(exit_status = ?status, "swtpm already exited"),
            _ => {
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "failed to kill swtpm");
                }
            }
        }

        if self.dir.exists() {
            tokio::fs::remove_dir_all(&self.dir)
                .await
                .with_context(|| format!("remove TPM state directory {}", self.dir.display()))?;
        }
        Ok(())
    }
}
