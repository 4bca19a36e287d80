//! EDK2 firmware discovery.
//!
//! EFI guests need two files: the read-only firmware code image and a
//! writable variable store. Distributions ship both under
//! `/usr/share/edk2/<arch subdir>/` with varying prefixes (`OVMF_`, `QEMU_`)
//! and optional `secboot` variants, so the pair is picked by marker rather
//! than by exact name.
//!
//! The variable store is copied into the VM directory on first use. The copy
//! is returned as a [`PreparatoryAction`] instead of being performed here.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::{Result, SynthError};
use super::{Arch, PreparatoryAction};

/// Root of the EDK2 firmware tree on the host.
pub const EDK2_ROOT: &str = "/usr/share/edk2";

const CODE_MARKER: &str = "CODE";
const VARS_MARKER: &str = "VARS";
const SECBOOT_MARKER: &str = "secboot";

// ---------------------------------------------------------------------------
// Filesystem probe
// ---------------------------------------------------------------------------

/// Read-only view of the filesystem used during synthesis.
///
/// Relative paths are interpreted against the VM directory.
pub trait FsProbe {
    /// File names (no directory component) contained in `dir`, in the order
    /// the locator should consider them.
    fn list_dir(&self, dir: &Path) -> io::Result<Vec<String>>;

    fn exists(&self, path: &Path) -> bool;
}

/// [`FsProbe`] backed by the real filesystem.
#[derive(Debug, Clone)]
pub struct HostFs {
    vm_dir: PathBuf,
}

impl HostFs {
    pub fn new(vm_dir: impl Into<PathBuf>) -> Self {
        Self { vm_dir: vm_dir.into() }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.vm_dir.join(path)
        }
    }
}

impl FsProbe for HostFs {
    /// Entries are ordered shortest name first, then lexically, so
    /// `OVMF_CODE.fd` is seen before `OVMF_CODE.cc.fd` or `OVMF_CODE_4M.fd`.
    fn list_dir(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.resolve(dir))? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        Ok(names)
    }

    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).exists()
    }
}

// ---------------------------------------------------------------------------
// Locator
// ---------------------------------------------------------------------------

/// Resolved firmware files for one synthesis call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePair {
    /// Absolute path of the code image, mapped read-only.
    pub code: PathBuf,
    /// System copy of the variable store template.
    pub vars_source: PathBuf,
    /// Per-VM variable store, relative to the VM directory.
    pub vars_local: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareLookup {
    pub pair: FirmwarePair,
    /// `cp` of the variable store when the VM does not have its own yet.
    pub stage_vars: Option<PreparatoryAction>,
}

/// Default firmware directory for `arch`, if the architecture supports EFI.
pub fn default_firmware_dir(arch: Arch) -> Option<PathBuf> {
    arch.firmware_subdir().map(|sub| Path::new(EDK2_ROOT).join(sub))
}

/// Find the CODE/VARS pair in `firmware_dir`.
///
/// The code image must carry the `secboot` marker exactly when
/// `want_secure_boot` is set. The variable store is the first `VARS` entry
/// regardless of `secboot`: the same store works for both code variants.
pub fn locate_firmware(
    probe: &dyn FsProbe,
    arch: Arch,
    firmware_dir: &Path,
    want_secure_boot: bool,
) -> Result<FirmwareLookup> {
    let package = arch
        .firmware_package()
        .ok_or_else(|| SynthError::UnsupportedArchitecture(format!("{arch} (no EFI firmware)")))?;
    let not_found = || SynthError::FirmwareNotFound {
        package,
        dir: firmware_dir.to_path_buf(),
    };

    let listing = probe.list_dir(firmware_dir).map_err(|e| {
        debug!(dir = %firmware_dir.display(), error = %e, "firmware directory not readable");
        not_found()
    })?;

    let code = listing
        .iter()
        .find(|name| name.contains(CODE_MARKER) && name.contains(SECBOOT_MARKER) == want_secure_boot);
    let vars = listing.iter().find(|name| name.contains(VARS_MARKER));

    let (Some(code), Some(vars)) = (code, vars) else {
        return Err(not_found());
    };

    let code = firmware_dir.join(code);
    let vars_source = firmware_dir.join(vars);
    if !probe.exists(&code) || !probe.exists(&vars_source) {
        return Err(not_found());
    }

    let vars_local = PathBuf::from(vars);
    let stage_vars = if probe.exists(&vars_local) {
        None
    } else {
        debug!(vars = %vars_local.display(), "variable store missing from VM directory, staging copy");
        Some(PreparatoryAction {
            program: "cp".to_string(),
            args: vec![
                vars_source.display().to_string(),
                vars_local.display().to_string(),
            ],
        })
    };

    Ok(FirmwareLookup {
        pair: FirmwarePair {
            code,
            vars_source,
            vars_local,
        },
        stage_vars,
    })
}
