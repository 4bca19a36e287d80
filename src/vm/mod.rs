//! QEMU command-line synthesis.
//!
//! Turns a resolved [`VmConfig`] into the argument list for
//! `qemu-system-*`, together with the preparatory commands that have to run
//! before the emulator starts (e.g. staging a writable EFI variable store).
//!
//! ```text
//! VmConfig + RuntimeParams
//!     └─► ArgBuilder
//!             ├─► common_args()   → Synthesis { args, pre_commands }
//!             ├─► boot_args()     → Vec<String>
//!             └─► cdrom_args()    → Vec<String>
//! ```
//!
//! Nothing in this module spawns processes or reads the environment. The only
//! filesystem access goes through [`firmware::FsProbe`] and the socket
//! directory creation in [`sockets`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

pub mod builder;
pub mod error;
pub mod firmware;
pub mod media;
pub mod resolve;
pub mod sockets;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Fully resolved description of one virtual machine.
///
/// Produced by [`crate::config`]; every path is already absolute and every
/// default already applied. The synthesizer never re-validates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub name: String,
    pub arch: Arch,
    /// Machine type passed to `-machine` verbatim (`pc`, `q35`, `virt`, ...).
    pub machine: String,
    pub cpus: u32,
    /// Memory size with suffix, e.g. `4G`.
    pub ram: String,
    pub cpu_model: String,
    pub enable_kvm: bool,

    pub enable_efi: bool,
    pub enable_secureboot: bool,
    pub enable_boot_menu: bool,
    pub enable_tpm: bool,
    /// Overrides the EDK2 directory derived from the architecture.
    pub firmware_dir: Option<PathBuf>,

    pub disks: Vec<PathBuf>,
    pub disk_bus: DiskBusMode,
    /// Optical media, in slot-assignment order.
    pub iso_images: Vec<PathBuf>,
    /// Mount `iso_images` on every boot, not only for installs.
    pub need_cd: bool,

    pub floppy: Option<PathBuf>,
    pub share_dir_as_fat: Option<PathBuf>,
    pub share_dir_as_floppy: Option<PathBuf>,
    pub share_dir_as_fsd: Option<PathBuf>,

    pub usb_devices: Vec<UsbDevice>,

    /// `none`, `virtio`, or a QEMU network device name.
    pub nic_model: String,
    pub nic_forward_ports: Vec<PortForward>,
    pub sound_model: String,
    pub gpu_model: String,
    pub display: String,
    pub spice: SpiceMode,
    pub control_socket: bool,
}

/// Guest CPU architecture.
///
/// Parsing from a string is the only place an unknown architecture can be
/// rejected; see [`resolve`] for the lookup tables keyed by this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Arch {
    I386,
    X86_64,
    Aarch64,
}

/// Which front-end the fixed disks are attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBusMode {
    /// `virtio-blk-pci`.
    #[default]
    Blk,
    /// `scsi-hd` behind one shared `virtio-scsi-pci` controller.
    Scsi,
    /// Plain `ide-hd`. Disks then share the IDE bus with optical drives.
    None,
}

/// SPICE remote display configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "SpiceSetting")]
pub enum SpiceMode {
    None,
    /// Listen on the port allocated at launch time ([`RuntimeParams::spice_port`]).
    #[default]
    Auto,
    Port(u16),
    /// Listen on a unix socket under the per-user runtime directory.
    Unix,
}

/// Host-to-guest TCP forward for user-mode networking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortForward {
    pub host: u16,
    pub guest: u16,
}

/// USB device to pass through, identified by hex vendor and product ids.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct UsbDevice {
    pub vendor_id: String,
    pub product_id: String,
}

/// Values that only exist once a launch is under way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeParams {
    /// Port picked for SPICE when the mode is [`SpiceMode::Auto`].
    pub spice_port: u16,
    /// Control socket of the running swtpm daemon, when TPM is enabled.
    pub tpm_socket: Option<PathBuf>,
}

/// A command that must complete before the emulator is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparatoryAction {
    pub program: String,
    pub args: Vec<String>,
}

/// Output of [`builder::ArgBuilder::common_args`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Synthesis {
    pub args: Vec<String>,
    pub pre_commands: Vec<PreparatoryAction>,
}

/// Lifecycle action the boot order is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Boot from the optical drive once, then fall back to the default order.
    Install,
    /// Boot from the first hard disk.
    Run,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl FromStr for Arch {
    type Err = error::SynthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i386" => Ok(Arch::I386),
            "x86_64" => Ok(Arch::X86_64),
            "aarch64" => Ok(Arch::Aarch64),
            other => Err(error::SynthError::UnsupportedArchitecture(other.to_string())),
        }
    }
}

impl TryFrom<String> for Arch {
    type Error = error::SynthError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Arch::I386 => "i386",
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        })
    }
}

/// Raw `spice` value as written in the config file: a keyword or a port.
#[derive(Deserialize)]
#[serde(untagged)]
enum SpiceSetting {
    Port(u16),
    Keyword(String),
}

impl TryFrom<SpiceSetting> for SpiceMode {
    type Error = String;

    fn try_from(value: SpiceSetting) -> Result<Self, Self::Error> {
        match value {
            SpiceSetting::Port(port) => Ok(SpiceMode::Port(port)),
            SpiceSetting::Keyword(word) => word.parse(),
        }
    }
}

impl FromStr for SpiceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SpiceMode::None),
            "auto" => Ok(SpiceMode::Auto),
            "unix" => Ok(SpiceMode::Unix),
            other => other
                .parse::<u16>()
                .map(SpiceMode::Port)
                .map_err(|_| format!("invalid spice setting {other:?} (expected unix, auto, none or a port)")),
        }
    }
}

impl FromStr for UsbDevice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((vendor, product)) if !vendor.is_empty() && !product.is_empty() => Ok(UsbDevice {
                vendor_id: vendor.to_string(),
                product_id: product.to_string(),
            }),
            _ => Err(format!("invalid usb device {s:?} (expected vendor:product)")),
        }
    }
}

impl TryFrom<String> for UsbDevice {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use builder::ArgBuilder;
pub use error::SynthError;
pub use firmware::{FsProbe, HostFs};
