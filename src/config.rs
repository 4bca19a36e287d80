//! `vmconfig.toml` loading.
//!
//! The config file is sparse: anything it leaves out comes from a
//! *prototype* (a named preset for a guest OS family) and then from built-in
//! defaults derived from the guest and host architectures. The result is a
//! fully resolved [`VmConfig`] with absolute paths.
//!
//! ```toml
//! name = "win11"
//! prototype = "w11"
//! disk = "system.qcow2"
//! os_install = ["~/iso/Win11.iso", "virtio-win.iso"]
//! nic_forward_ports = { host = 3389, guest = 3389 }
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::debug;

use crate::vm::{Arch, DiskBusMode, PortForward, SpiceMode, UsbDevice, VmConfig};

/// Config file name inside a VM directory.
pub const CONFIG_FILE_NAME: &str = "vmconfig.toml";

const DEFAULT_RAM: &str = "4G";
const DEFAULT_RAM_WINDOWS: &str = "8G";

// ---------------------------------------------------------------------------
// File schema
// ---------------------------------------------------------------------------

/// A scalar or a list of scalars (`disk = "a.img"` or `disk = ["a", "b"]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

/// `vmconfig.toml` as written by the user. Unknown keys are rejected.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    name: Option<String>,
    prototype: Option<String>,
    cpus: Option<u32>,
    ram: Option<String>,
    arch: Option<Arch>,
    machine: Option<String>,
    cpu_model: Option<String>,
    kvm: Option<bool>,
    efi: Option<bool>,
    secureboot: Option<bool>,
    tpm: Option<bool>,
    bootmenu: Option<bool>,
    firmware_dir: Option<PathBuf>,
    disk: Option<OneOrMany<PathBuf>>,
    disks: Option<OneOrMany<PathBuf>>,
    disk_virtio: Option<DiskBusMode>,
    os_install: Option<OneOrMany<PathBuf>>,
    need_cd: Option<bool>,
    usb: Option<OneOrMany<UsbDevice>>,
    floppy: Option<PathBuf>,
    share_dir_as_fat: Option<PathBuf>,
    share_dir_as_floppy: Option<PathBuf>,
    share_dir_as_fsd: Option<PathBuf>,
    nic: Option<String>,
    nic_forward_ports: Option<OneOrMany<PortForward>>,
    sound: Option<String>,
    gpu: Option<String>,
    display: Option<String>,
    spice: Option<SpiceMode>,
    control_socket: Option<bool>,
}

// ---------------------------------------------------------------------------
// Prototypes
// ---------------------------------------------------------------------------

/// Preset hardware for a guest family. Applied under the user's settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prototype {
    pub arch: Arch,
    pub cpus: u32,
    pub ram: &'static str,
    pub gpu: &'static str,
    pub nic: &'static str,
    pub disk_virtio: DiskBusMode,
    pub sound: &'static str,
    pub efi: bool,
    pub tpm: bool,
    pub secureboot: bool,
    pub display: Option<&'static str>,
    pub spice: Option<SpiceMode>,
}

impl Prototype {
    fn default_x86_64(cpus: u32) -> Self {
        Self {
            arch: Arch::X86_64,
            cpus,
            ram: DEFAULT_RAM,
            gpu: "qxl-vga",
            nic: "virtio",
            disk_virtio: DiskBusMode::Blk,
            sound: "hda",
            efi: false,
            tpm: false,
            secureboot: false,
            display: None,
            spice: None,
        }
    }

    fn default_aarch64(cpus: u32) -> Self {
        Self {
            arch: Arch::Aarch64,
            gpu: "virtio-gpu-pci",
            nic: "e1000",
            disk_virtio: DiskBusMode::Scsi,
            efi: true,
            ..Self::default_x86_64(cpus)
        }
    }

    /// Period Windows guests: no virtio drivers, so IDE disks and emulated
    /// NIC/sound.
    fn legacy_windows(cpus: u32, ram: &'static str, gpu: &'static str) -> Self {
        Self {
            arch: Arch::I386,
            cpus,
            ram,
            gpu,
            nic: "rtl8139",
            disk_virtio: DiskBusMode::None,
            sound: "ac97",
            ..Self::default_x86_64(cpus)
        }
    }

    /// Look up a prototype by name. `host_cpus` is the CPU count used by the
    /// modern presets (capped at 4).
    pub fn named(name: &str, host_cpus: u32) -> Option<Self> {
        let cpus = host_cpus.clamp(1, 4);
        let proto = match name {
            "default-x86_64" => Self::default_x86_64(cpus),
            "default-aarch64" | "linux-aarch64" => Self::default_aarch64(cpus),
            "linux-x86_64" => Self {
                gpu: "virtio-vga",
                ..Self::default_x86_64(cpus)
            },
            "linux-x86_64-3daccel" => Self {
                gpu: "virtio-vga-gl,hostmem=8G",
                display: Some("gtk,gl=on"),
                spice: Some(SpiceMode::None),
                ..Self::default_x86_64(cpus)
            },
            "w10" => Self {
                ram: DEFAULT_RAM_WINDOWS,
                ..Self::default_x86_64(cpus)
            },
            "w11" => Self {
                ram: DEFAULT_RAM_WINDOWS,
                efi: true,
                tpm: true,
                secureboot: true,
                ..Self::default_x86_64(cpus)
            },
            "wxp" => Self::legacy_windows(4, "512M", "qxl-vga"),
            "w2k" | "w9x" => Self::legacy_windows(1, "128M", "cirrus-vga"),
            _ => return None,
        };
        Some(proto)
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Host facts the resolver needs. Captured once so resolution itself stays
/// a pure function of its inputs.
#[derive(Debug, Clone)]
pub struct HostContext {
    /// Directory holding `vmconfig.toml`; relative paths are joined to it.
    pub vm_dir: PathBuf,
    /// Host CPU architecture in `uname -m` spelling.
    pub host_arch: String,
    pub host_cpus: u32,
    /// Used for `~` expansion.
    pub home: Option<PathBuf>,
}

impl HostContext {
    pub fn detect(vm_dir: &Path) -> Self {
        Self {
            vm_dir: vm_dir.to_path_buf(),
            host_arch: std::env::consts::ARCH.to_string(),
            host_cpus: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            home: std::env::var_os("HOME").map(PathBuf::from),
        }
    }

    /// Whether `guest` can use KVM on this host.
    fn can_accelerate(&self, guest: Arch) -> bool {
        match guest {
            Arch::I386 => self.host_arch == "x86_64",
            other => self.host_arch == other.to_string(),
        }
    }

    fn expand(&self, path: PathBuf) -> Result<PathBuf> {
        let path = match path.strip_prefix("~") {
            Ok(rest) => self
                .home
                .as_ref()
                .ok_or_else(|| anyhow!("cannot expand {}: HOME is not set", path.display()))?
                .join(rest),
            Err(_) => path,
        };
        Ok(if path.is_absolute() { path } else { self.vm_dir.join(path) })
    }

    fn expand_all(&self, paths: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
        paths.into_iter().map(|p| self.expand(p)).collect()
    }

    fn expand_opt(&self, path: Option<PathBuf>) -> Result<Option<PathBuf>> {
        path.map(|p| self.expand(p)).transpose()
    }
}

/// Read and resolve `<vm_dir>/vmconfig.toml`.
pub fn load(vm_dir: &Path) -> Result<VmConfig> {
    let path = vm_dir.join(CONFIG_FILE_NAME);
    let text = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let config = parse_config(&text, &HostContext::detect(vm_dir))
        .with_context(|| format!("invalid config {}", path.display()))?;
    debug!(?config, "resolved VM options");
    Ok(config)
}

/// Parse config text and resolve it against `host`.
pub fn parse_config(text: &str, host: &HostContext) -> Result<VmConfig> {
    let file: ConfigFile = toml::from_str(text)?;
    resolve(file, host)
}

/// The name becomes a directory under the runtime root and is embedded in
/// comma-separated QEMU options, so it must be a single plain path component.
fn validate_name(name: &str) -> Result<()> {
    if name == "." || name == ".." || name.contains(['/', ',', '\0']) {
        bail!("invalid VM name {name:?}: must not be `.`, `..` or contain `/`, `,` or NUL");
    }
    Ok(())
}

fn resolve(file: ConfigFile, host: &HostContext) -> Result<VmConfig> {
    let name = match file.name {
        Some(name) if !name.trim().is_empty() => name,
        _ => bail!("`name` is required"),
    };
    validate_name(&name)?;

    let prototype_name = match file.prototype.as_deref() {
        None => format!("default-{}", host.host_arch),
        Some("linux") => format!("linux-{}", host.host_arch),
        Some(other) => other.to_string(),
    };
    let proto = Prototype::named(&prototype_name, host.host_cpus)
        .ok_or_else(|| anyhow!("unknown prototype `{prototype_name}`"))?;

    let arch = file.arch.unwrap_or(proto.arch);
    let machine = file.machine.unwrap_or_else(|| {
        match arch {
            // late 90s - early 2000s era chipset
            Arch::I386 => "pc",
            Arch::X86_64 => "q35",
            Arch::Aarch64 => "virt",
        }
        .to_string()
    });
    let enable_kvm = file.kvm.unwrap_or_else(|| host.can_accelerate(arch));
    let cpu_model = file.cpu_model.unwrap_or_else(|| {
        match arch {
            Arch::I386 => "qemu32",
            // `host` needs KVM
            Arch::X86_64 if enable_kvm => "host",
            Arch::X86_64 | Arch::Aarch64 => "max",
        }
        .to_string()
    });

    let disks = match (file.disk, file.disks) {
        (Some(_), Some(_)) => bail!("`disk` and `disks` are aliases, set only one of them"),
        (disk, disks) => disk.or(disks).map(OneOrMany::into_vec).unwrap_or_default(),
    };

    let gpu_model = file.gpu.unwrap_or_else(|| proto.gpu.to_string());
    let display = file
        .display
        .unwrap_or_else(|| proto.display.unwrap_or("gtk").to_string());
    let spice = file.spice.or(proto.spice).unwrap_or_default();

    let gpu_is_accel = gpu_model.contains("-gl");
    if gpu_is_accel && display == "none" {
        bail!("display cannot be \"none\" if 3D acceleration is enabled");
    }
    if gpu_is_accel && spice != SpiceMode::None {
        bail!("cannot use SPICE if 3D acceleration is enabled");
    }

    let enable_efi = file.efi.unwrap_or(proto.efi);
    if enable_efi && arch.firmware_subdir().is_none() {
        bail!("EFI is not available for {arch} guests");
    }

    Ok(VmConfig {
        name,
        arch,
        machine,
        cpus: file.cpus.unwrap_or(proto.cpus),
        ram: file.ram.unwrap_or_else(|| proto.ram.to_string()),
        cpu_model,
        enable_kvm,
        enable_efi,
        enable_secureboot: file.secureboot.unwrap_or(proto.secureboot),
        enable_boot_menu: file.bootmenu.unwrap_or(false),
        enable_tpm: file.tpm.unwrap_or(proto.tpm),
        firmware_dir: host.expand_opt(file.firmware_dir)?,
        disks: host.expand_all(disks)?,
        disk_bus: file.disk_virtio.unwrap_or(proto.disk_virtio),
        iso_images: host.expand_all(file.os_install.map(OneOrMany::into_vec).unwrap_or_default())?,
        need_cd: file.need_cd.unwrap_or(false),
        floppy: host.expand_opt(file.floppy)?,
        share_dir_as_fat: host.expand_opt(file.share_dir_as_fat)?,
        share_dir_as_floppy: host.expand_opt(file.share_dir_as_floppy)?,
        share_dir_as_fsd: host.expand_opt(file.share_dir_as_fsd)?,
        usb_devices: file.usb.map(OneOrMany::into_vec).unwrap_or_default(),
        nic_model: file.nic.unwrap_or_else(|| proto.nic.to_string()),
        nic_forward_ports: file.nic_forward_ports.map(OneOrMany::into_vec).unwrap_or_default(),
        sound_model: file.sound.unwrap_or_else(|| proto.sound.to_string()),
        gpu_model,
        display,
        spice,
        control_socket: file.control_socket.unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostContext {
        HostContext {
            vm_dir: PathBuf::from("/vms/foo"),
            host_arch: "x86_64".into(),
            host_cpus: 16,
            home: Some(PathBuf::from("/home/user")),
        }
    }

    #[test]
    fn defaults_follow_host_prototype() {
        let o = parse_config(r#"name = "foo""#, &host()).unwrap();

        assert_eq!(o.name, "foo");
        assert_eq!(o.cpus, 4);
        assert_eq!(o.ram, "4G");
        assert_eq!(o.arch, Arch::X86_64);
        assert_eq!(o.machine, "q35");
        assert_eq!(o.cpu_model, "host");
        assert!(o.enable_kvm);
        assert!(!o.enable_efi);
        assert!(!o.enable_boot_menu);
        assert!(!o.enable_secureboot);
        assert!(!o.enable_tpm);
        assert_eq!(o.disk_bus, DiskBusMode::Blk);
        assert!(o.disks.is_empty());
        assert!(o.iso_images.is_empty());
        assert!(o.usb_devices.is_empty());
        assert_eq!(o.floppy, None);
        assert_eq!(o.nic_model, "virtio");
        assert_eq!(o.sound_model, "hda");
        assert_eq!(o.gpu_model, "qxl-vga");
        assert_eq!(o.display, "gtk");
        assert_eq!(o.spice, SpiceMode::Auto);
        assert!(!o.control_socket);
    }

    #[test]
    fn low_cpu_hosts_get_fewer_cpus() {
        let mut h = host();
        h.host_cpus = 2;
        let o = parse_config(r#"name = "foo""#, &h).unwrap();
        assert_eq!(o.cpus, 2);
    }

    #[test]
    fn prototype_3daccel() {
        let o = parse_config("name = 'foo'\nprototype = 'linux-x86_64-3daccel'", &host()).unwrap();

        assert!(o.gpu_model.contains("virtio-vga-gl"));
        assert!(o.display.contains("gl"));
        assert_eq!(o.spice, SpiceMode::None);
    }

    #[test]
    fn linux_prototype_follows_host_arch() {
        let mut h = host();
        h.host_arch = "aarch64".into();
        let o = parse_config("name = 'foo'\nprototype = 'linux'", &h).unwrap();

        assert_eq!(o.arch, Arch::Aarch64);
        assert_eq!(o.machine, "virt");
        assert_eq!(o.cpu_model, "max");
        assert_eq!(o.disk_bus, DiskBusMode::Scsi);
        assert!(o.enable_efi);
    }

    #[test]
    fn nokvm_uses_max_cpu() {
        let o = parse_config("name = 'foo'\nkvm = false", &host()).unwrap();

        assert!(!o.enable_kvm);
        assert_eq!(o.cpu_model, "max");
    }

    #[test]
    fn foreign_arch_is_not_accelerated() {
        let o = parse_config("name = 'foo'\narch = 'aarch64'", &host()).unwrap();
        assert!(!o.enable_kvm);

        let o = parse_config("name = 'foo'\nprototype = 'wxp'", &host()).unwrap();
        assert_eq!(o.arch, Arch::I386);
        assert!(o.enable_kvm);
        assert_eq!(o.machine, "pc");
        assert_eq!(o.cpu_model, "qemu32");
        assert_eq!(o.disk_bus, DiskBusMode::None);
    }

    #[test]
    fn w11_enables_secure_boot_stack() {
        let o = parse_config("name = 'foo'\nprototype = 'w11'", &host()).unwrap();
        assert!(o.enable_efi && o.enable_tpm && o.enable_secureboot);
        assert_eq!(o.ram, "8G");
    }

    #[test]
    fn paths_are_expanded() {
        let text = r#"
            name = "foo"
            disk = "system.qcow2"
            os_install = ["~/iso/a.iso", "/abs/b.iso"]
            floppy = "boot.img"
        "#;
        let o = parse_config(text, &host()).unwrap();

        assert_eq!(o.disks, vec![PathBuf::from("/vms/foo/system.qcow2")]);
        assert_eq!(
            o.iso_images,
            vec![PathBuf::from("/home/user/iso/a.iso"), PathBuf::from("/abs/b.iso")]
        );
        assert_eq!(o.floppy, Some(PathBuf::from("/vms/foo/boot.img")));
    }

    #[test]
    fn scalar_or_list_values() {
        let text = r#"
            name = "foo"
            disks = ["a.img", "b.img"]
            usb = "046d:c52b"
            nic_forward_ports = { host = 2222, guest = 22 }
            spice = 5930
        "#;
        let o = parse_config(text, &host()).unwrap();

        assert_eq!(o.disks.len(), 2);
        assert_eq!(o.usb_devices[0].vendor_id, "046d");
        assert_eq!(o.nic_forward_ports, vec![PortForward { host: 2222, guest: 22 }]);
        assert_eq!(o.spice, SpiceMode::Port(5930));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_config("cpus = 2", &host()).is_err());
        assert!(parse_config("name = 'foo'\nbogus = 1", &host()).is_err());
        assert!(parse_config("name = 'foo'\narch = 'riscv64'", &host()).is_err());
        assert!(parse_config("name = 'foo'\nprototype = 'beos'", &host()).is_err());
        assert!(parse_config("name = 'foo'\nusb = '046d'", &host()).is_err());
        assert!(parse_config("name = 'foo'\nspice = 'tcp'", &host()).is_err());
        assert!(parse_config("name = 'foo'\nprototype = 'wxp'\nefi = true", &host()).is_err());
    }

    #[test]
    fn accelerated_gpu_conflicts() {
        let base = "name = 'foo'\ngpu = 'virtio-vga-gl'\n";
        assert!(parse_config(&format!("{base}spice = 'none'\ndisplay = 'none'"), &host()).is_err());
        assert!(parse_config(&format!("{base}spice = 'auto'"), &host()).is_err());
        assert!(parse_config(&format!("{base}spice = 'none'"), &host()).is_ok());
    }

    #[test]
    fn name_must_be_a_single_path_component() {
        for bad in ["/tmp/elsewhere", "../escape", "a/b", ".", "..", "foo,server", "nul\\u0000"] {
            let text = format!("name = \"{bad}\"");
            assert!(parse_config(&text, &host()).is_err(), "accepted name {bad:?}");
        }
        assert!(parse_config("name = 'win-11.2_test'", &host()).is_ok());
    }

    #[test]
    fn disk_and_disks_are_exclusive() {
        let err = parse_config("name = 'foo'\ndisk = 'a.img'\ndisks = ['b.img']", &host()).unwrap_err();
        assert!(err.to_string().contains("aliases"));

        let o = parse_config("name = 'foo'\ndisk = 'a.img'", &host()).unwrap();
        assert_eq!(o.disks, vec![PathBuf::from("/vms/foo/a.img")]);
    }
}
