//! Fixed lookups: disk image format by file name and per-architecture
//! emulator binary / firmware locations.

use std::path::Path;

use super::Arch;

/// Container format of a disk image, as understood by `-blockdev driver=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Qcow2,
    Raw,
}

impl ImageFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Raw => "raw",
        }
    }
}

/// Guess the image format from its path. Anything without a `qcow2` marker
/// is treated as raw.
pub fn image_format(path: &Path) -> ImageFormat {
    if path.to_string_lossy().contains("qcow2") {
        ImageFormat::Qcow2
    } else {
        ImageFormat::Raw
    }
}

impl Arch {
    /// Name of the QEMU system emulator for this guest.
    ///
    /// `i386` guests run on `qemu-system-x86_64` with a 32-bit CPU model.
    pub fn emulator_binary(self) -> &'static str {
        match self {
            Arch::I386 | Arch::X86_64 => "qemu-system-x86_64",
            Arch::Aarch64 => "qemu-system-aarch64",
        }
    }

    /// Subdirectory of the EDK2 tree holding this architecture's firmware.
    /// `None` means there is no EFI support for the guest.
    pub fn firmware_subdir(self) -> Option<&'static str> {
        match self {
            Arch::I386 => None,
            Arch::X86_64 => Some("x64"),
            Arch::Aarch64 => Some("aarch64"),
        }
    }

    /// Suffix of the `edk2-*` package that ships the firmware.
    pub fn firmware_package(self) -> Option<&'static str> {
        match self {
            Arch::I386 => None,
            Arch::X86_64 => Some("ovmf"),
            Arch::Aarch64 => Some("aarch64"),
        }
    }
}
