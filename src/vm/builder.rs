//! QEMU argument synthesis.
//!
//! [`ArgBuilder`] has three independent entry points. A launch concatenates
//! their output in this order:
//!
//! 1. [`ArgBuilder::common_args`]: machine, devices, firmware, storage,
//!    network. Also returns the preparatory commands.
//! 2. [`ArgBuilder::boot_args`]: boot order for the lifecycle action.
//! 3. [`ArgBuilder::cdrom_args`]: optical media.
//!
//! Emission order is fixed. Each section is skipped when its setting is off,
//! without affecting the sections after it.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::error::{Result, SynthError};
use super::firmware::{self, FsProbe};
use super::media::{self, MachineClass, Slot};
use super::resolve::image_format;
use super::sockets::{self, SocketPurpose};
use super::{BootMode, DiskBusMode, RuntimeParams, SpiceMode, Synthesis, VmConfig};

/// SPICE only listens on loopback; there is no ticketing.
const SPICE_LISTEN_ADDR: &str = "127.0.0.1";

/// Builds emulator arguments for one VM.
pub struct ArgBuilder<'a> {
    config: &'a VmConfig,
    probe: &'a dyn FsProbe,
    runtime_root: PathBuf,
}

impl<'a> ArgBuilder<'a> {
    /// `runtime_root` is the per-user runtime directory under which SPICE
    /// and QMP sockets are created.
    pub fn new(config: &'a VmConfig, probe: &'a dyn FsProbe, runtime_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            probe,
            runtime_root: runtime_root.into(),
        }
    }

    // -----------------------------------------------------------------------
    // Common arguments
    // -----------------------------------------------------------------------

    /// Arguments present on every launch, plus the commands to run first.
    ///
    /// # Errors
    ///
    /// - [`SynthError::FirmwareNotFound`] when EFI is enabled and no firmware
    ///   pair can be located.
    /// - [`SynthError::UnsupportedArchitecture`] when EFI is enabled for a
    ///   guest without EFI support.
    /// - [`SynthError::SocketDir`] when a socket directory cannot be created.
    pub fn common_args(&self, runtime: &RuntimeParams) -> Result<Synthesis> {
        let o = self.config;
        let mut out = Synthesis::default();
        let args = &mut out.args;

        push(args, "-name", &o.name);
        push(args, "-machine", &o.machine);
        push(args, "-smp", o.cpus.to_string());
        push(args, "-m", &o.ram);
        push(args, "-cpu", &o.cpu_model);

        if o.enable_kvm {
            args.push("-enable-kvm".to_string());
        }

        if !o.gpu_model.is_empty() && o.gpu_model != "none" {
            push(args, "-device", &o.gpu_model);
        }

        push(args, "-display", &o.display);

        self.spice_args(args, runtime)?;

        if o.control_socket {
            let qmp = sockets::socket_path(&self.runtime_root, SocketPurpose::Qmp, &o.name)?;
            push(args, "-qmp", format!("unix:{},server,nowait", qmp.display()));
            info!("control socket available on unix://{}", qmp.display());
        }

        if o.enable_efi {
            self.firmware_args(&mut out)?;
        }
        let args = &mut out.args;

        if o.enable_tpm {
            let tpm_socket = match &runtime.tpm_socket {
                Some(path) => path.display().to_string(),
                None => {
                    warn!("TPM enabled but no swtpm socket was provided");
                    String::new()
                }
            };
            push(args, "-chardev", format!("socket,id=chrtpm,path={tpm_socket}"));
            push(args, "-tpmdev", "emulator,id=tpm0,chardev=chrtpm");
            push(args, "-device", "tpm-tis,tpmdev=tpm0");
        }

        self.disk_args(args);
        self.removable_storage_args(args);
        self.usb_args(args);
        self.network_args(args);
        self.sound_args(args);

        if o.display == "none" {
            info!(
                "No GUI is configured, use SPICE{} to control",
                if o.control_socket { " or QMP socket" } else { "" }
            );
        }

        Ok(out)
    }

    fn spice_args(&self, args: &mut Vec<String>, runtime: &RuntimeParams) -> Result<()> {
        let o = self.config;
        match o.spice {
            SpiceMode::None => return Ok(()),
            SpiceMode::Unix => {
                let sock = sockets::socket_path(&self.runtime_root, SocketPurpose::Spice, &o.name)?;
                info!("SPICE server running on unix://{}", sock.display());
                push(args, "-spice", format!("unix=on,addr={},disable-ticketing=on", sock.display()));
            }
            SpiceMode::Auto | SpiceMode::Port(_) => {
                let port = match o.spice {
                    SpiceMode::Port(port) => port,
                    _ => runtime.spice_port,
                };
                info!("SPICE server running on tcp://{SPICE_LISTEN_ADDR}:{port}");
                push(
                    args,
                    "-spice",
                    format!("port={port},addr={SPICE_LISTEN_ADDR},disable-ticketing=on"),
                );
            }
        }

        // vdagent channel: clipboard sharing and display resize
        push(args, "-device", "virtio-serial-pci");
        push(args, "-device", "virtserialport,chardev=spicechannel0,name=com.redhat.spice.0");
        push(args, "-chardev", "spicevmc,id=spicechannel0,name=vdagent");
        Ok(())
    }

    fn firmware_args(&self, out: &mut Synthesis) -> Result<()> {
        let o = self.config;
        let dir = match &o.firmware_dir {
            Some(dir) => dir.clone(),
            None => firmware::default_firmware_dir(o.arch)
                .ok_or_else(|| SynthError::UnsupportedArchitecture(format!("{} (no EFI firmware)", o.arch)))?,
        };

        let found = firmware::locate_firmware(self.probe, o.arch, &dir, o.enable_secureboot)?;
        if let Some(copy) = found.stage_vars {
            info!(
                "{} does not exist in VM directory, copying from system",
                found.pair.vars_local.display()
            );
            out.pre_commands.push(copy);
        }

        push(
            &mut out.args,
            "-drive",
            format!("if=pflash,format=raw,readonly=on,file={}", found.pair.code.display()),
        );
        push(
            &mut out.args,
            "-drive",
            format!("if=pflash,format=raw,file={}", found.pair.vars_local.display()),
        );
        Ok(())
    }

    fn disk_args(&self, args: &mut Vec<String>) {
        let o = self.config;
        if o.disk_bus == DiskBusMode::Scsi {
            push(args, "-device", "virtio-scsi-pci,id=scsi0,num_queues=4");
        }

        for (idx, disk) in o.disks.iter().enumerate() {
            let node = if is_host_device(disk) {
                let node = format!("hosthd{idx}");
                push(
                    args,
                    "-blockdev",
                    format!(
                        "driver=raw,node-name={node},file.driver=host_device,file.filename={}",
                        disk.display()
                    ),
                );
                node
            } else {
                let node = format!("hd{idx}");
                push(
                    args,
                    "-blockdev",
                    format!(
                        "driver={},node-name={node},file.driver=file,file.filename={}",
                        image_format(disk).as_str(),
                        disk.display()
                    ),
                );
                node
            };

            let bootindex = idx + 1;
            let device = match o.disk_bus {
                DiskBusMode::Scsi => format!("scsi-hd,drive={node},bootindex={bootindex}"),
                DiskBusMode::Blk => {
                    format!("virtio-blk-pci,id=virtblk{idx},num-queues=4,drive={node},bootindex={bootindex}")
                }
                DiskBusMode::None => format!("ide-hd,drive={node},bootindex={bootindex}"),
            };
            push(args, "-device", device);
        }
    }

    /// Floppy image and the three host-directory sharing modes.
    fn removable_storage_args(&self, args: &mut Vec<String>) {
        let o = self.config;

        if let Some(floppy) = &o.floppy {
            push(args, "-blockdev", format!("driver=file,node-name=floppy0,filename={}", floppy.display()));
            push(args, "-device", "floppy,drive=floppy0");
        }

        if let Some(dir) = &o.share_dir_as_fat {
            push(
                args,
                "-blockdev",
                format!("driver=vvfat,node-name=fs_fat,dir={},read-only=on,rw=off", dir.display()),
            );
            push(args, "-device", "usb-storage,drive=fs_fat");
        }

        if let Some(dir) = &o.share_dir_as_floppy {
            push(
                args,
                "-blockdev",
                format!("driver=vvfat,node-name=fs_floppy,dir={},read-only=off,rw=on", dir.display()),
            );
            push(args, "-device", "floppy,drive=fs_floppy");
        }

        if let Some(dir) = &o.share_dir_as_fsd {
            push(
                args,
                "-fsdev",
                format!("local,security_model=passthrough,id=fsdev0,path={}", dir.display()),
            );
            push(args, "-device", "virtio-9p-pci,fsdev=fsdev0,mount_tag=hostshare");
        }
    }

    fn usb_args(&self, args: &mut Vec<String>) {
        let o = self.config;
        if MachineClass::classify(&o.machine) == MachineClass::Legacy {
            // UHCI (usb-bus.0) plus EHCI, tablet on the USB 2.0 bus
            args.push("-usb".to_string());
            push(args, "-device", "usb-ehci,id=ehci");
            push(args, "-device", "usb-tablet,bus=ehci.0");
        } else {
            push(args, "-device", "qemu-xhci");
            push(args, "-device", "usb-tablet");
        }

        for dev in &o.usb_devices {
            push(
                args,
                "-device",
                format!("usb-host,vendorid=0x{},productid=0x{}", dev.vendor_id, dev.product_id),
            );
        }
    }

    fn network_args(&self, args: &mut Vec<String>) {
        let o = self.config;
        if o.nic_model == "none" {
            push(args, "-nic", "none");
            return;
        }

        let hostfwd: String = o
            .nic_forward_ports
            .iter()
            .map(|fwd| format!(",hostfwd=tcp::{}-:{}", fwd.host, fwd.guest))
            .collect();
        let model = if o.nic_model == "virtio" { "virtio-net-pci" } else { &o.nic_model };

        push(args, "-netdev", format!("user,id=net0{hostfwd}"));
        push(args, "-device", format!("{model},netdev=net0"));
    }

    fn sound_args(&self, args: &mut Vec<String>) {
        let devices: &[(&str, &str)] = match self.config.sound_model.as_str() {
            "spk" => &[("-audiodev", "pa,id=spk0"), ("-machine", "pcspk-audiodev=spk0")],
            "sb16" => &[("-audiodev", "pa,id=snd0"), ("-device", "sb16,audiodev=snd0")],
            "ac97" => &[("-audiodev", "pa,id=snd0"), ("-device", "ac97,audiodev=snd0")],
            "hda" => &[
                ("-audiodev", "pa,id=snd0"),
                ("-device", "ich9-intel-hda"),
                ("-device", "hda-output,audiodev=snd0"),
            ],
            _ => &[],
        };
        for (flag, value) in devices {
            push(args, flag, *value);
        }
    }

    // -----------------------------------------------------------------------
    // Boot order
    // -----------------------------------------------------------------------

    /// `-boot` arguments. The boot menu replaces any explicit order.
    pub fn boot_args(&self, mode: BootMode) -> Vec<String> {
        let value = if self.config.enable_boot_menu {
            "menu=on"
        } else {
            match mode {
                // CD-ROM first, back to the default order after the first reboot
                BootMode::Install => "once=d",
                BootMode::Run => "order=c",
            }
        };
        vec!["-boot".to_string(), value.to_string()]
    }

    // -----------------------------------------------------------------------
    // Optical media
    // -----------------------------------------------------------------------

    /// Optical drive arguments. Images are attached when `force_mount` is set
    /// (installs) or when the config asks for them on every boot.
    pub fn cdrom_args(&self, force_mount: bool) -> Vec<String> {
        let o = self.config;
        let mut args = Vec::new();
        if o.iso_images.is_empty() || !(force_mount || o.need_cd) {
            return args;
        }

        let assignments = media::allocate_optical_slots(
            MachineClass::classify(&o.machine),
            o.disk_bus,
            o.disks.len(),
            &o.iso_images,
        );

        for (idx, assignment) in assignments.iter().enumerate() {
            push(
                &mut args,
                "-blockdev",
                format!(
                    "driver=file,read-only=on,node-name=isofile{idx},filename={}",
                    assignment.image
                ),
            );
            push(&mut args, "-blockdev", format!("driver=raw,node-name=cdrom{idx},file=isofile{idx}"));

            match assignment.slot {
                Slot::Ide { bus } => {
                    push(&mut args, "-device", format!("ide-cd,bus=ide.{bus},drive=cdrom{idx},id=cddev{idx}"));
                }
                Slot::Overflow { lun, declare_adapter } => {
                    if declare_adapter {
                        push(&mut args, "-device", "usb-bot,id=usbbot");
                    }
                    push(
                        &mut args,
                        "-device",
                        format!("scsi-cd,bus=usbbot.0,lun={lun},drive=cdrom{idx},id=cddev{idx}"),
                    );
                }
            }
        }
        args
    }
}

fn push(args: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    args.push(flag.to_string());
    args.push(value.into());
}

/// Disks under `/dev/` are passed through as raw host block devices.
fn is_host_device(path: &Path) -> bool {
    path.starts_with("/dev")
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::vm::{Arch, PortForward, UsbDevice};

    /// Probe that panics when touched; synthesis without EFI must not use it.
    struct NoFs;

    impl FsProbe for NoFs {
        fn list_dir(&self, dir: &Path) -> io::Result<Vec<String>> {
            panic!("unexpected list_dir({})", dir.display())
        }

        fn exists(&self, path: &Path) -> bool {
            panic!("unexpected exists({})", path.display())
        }
    }

    fn config() -> VmConfig {
        VmConfig {
            name: "foo".into(),
            arch: Arch::X86_64,
            machine: "q35".into(),
            cpus: 4,
            ram: "4G".into(),
            cpu_model: "host".into(),
            enable_kvm: true,
            enable_efi: false,
            enable_secureboot: false,
            enable_boot_menu: false,
            enable_tpm: false,
            firmware_dir: None,
            disks: vec![],
            disk_bus: DiskBusMode::Blk,
            iso_images: vec![],
            need_cd: false,
            floppy: None,
            share_dir_as_fat: None,
            share_dir_as_floppy: None,
            share_dir_as_fsd: None,
            usb_devices: vec![],
            nic_model: "virtio".into(),
            nic_forward_ports: vec![],
            sound_model: "hda".into(),
            gpu_model: "qxl-vga".into(),
            display: "gtk".into(),
            spice: SpiceMode::Auto,
            control_socket: false,
        }
    }

    fn common(cfg: &VmConfig) -> Vec<String> {
        let runtime = RuntimeParams {
            spice_port: 5900,
            tpm_socket: Some(PathBuf::from("/tmp/qemu-tpm-foo/swtpm-sock")),
        };
        ArgBuilder::new(cfg, &NoFs, "/nonexistent").common_args(&runtime).unwrap().args
    }

    fn window(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn boot_menu_overrides_order() {
        let mut cfg = config();
        let b = ArgBuilder::new(&cfg, &NoFs, "/nonexistent");
        assert_eq!(b.boot_args(BootMode::Install), vec!["-boot", "once=d"]);
        assert_eq!(b.boot_args(BootMode::Run), vec!["-boot", "order=c"]);

        cfg.enable_boot_menu = true;
        let b = ArgBuilder::new(&cfg, &NoFs, "/nonexistent");
        assert_eq!(b.boot_args(BootMode::Install), vec!["-boot", "menu=on"]);
        assert_eq!(b.boot_args(BootMode::Run), vec!["-boot", "menu=on"]);
    }

    #[test]
    fn fixed_spice_port_ignores_runtime_port() {
        let mut cfg = config();
        cfg.spice = SpiceMode::Port(5930);
        let args = common(&cfg);
        assert!(window(&args, "-spice", "port=5930,addr=127.0.0.1,disable-ticketing=on"));
    }

    #[test]
    fn spice_none_drops_agent_channel() {
        let mut cfg = config();
        cfg.spice = SpiceMode::None;
        let args = common(&cfg);
        assert!(!args.iter().any(|a| a == "-spice" || a == "virtio-serial-pci"));
    }

    #[test]
    fn gpu_none_is_omitted_but_display_none_is_explicit() {
        let mut cfg = config();
        cfg.gpu_model = "none".into();
        cfg.display = "none".into();
        let args = common(&cfg);
        assert!(!window(&args, "-device", "none"));
        assert!(window(&args, "-display", "none"));
    }

    #[test]
    fn tpm_devices_reference_runtime_socket() {
        let mut cfg = config();
        cfg.enable_tpm = true;
        let args = common(&cfg);
        let start = args.iter().position(|a| a == "-chardev").unwrap();
        // first -chardev is the spice agent; TPM comes after it
        let tpm = args[start + 1..].iter().position(|a| a == "-chardev").unwrap() + start + 1;
        assert_eq!(
            &args[tpm..tpm + 6],
            [
                "-chardev",
                "socket,id=chrtpm,path=/tmp/qemu-tpm-foo/swtpm-sock",
                "-tpmdev",
                "emulator,id=tpm0,chardev=chrtpm",
                "-device",
                "tpm-tis,tpmdev=tpm0",
            ]
        );
    }

    #[test]
    fn scsi_controller_declared_once_before_disks() {
        let mut cfg = config();
        cfg.disk_bus = DiskBusMode::Scsi;
        cfg.disks = vec!["/vm/a.qcow2".into(), "/dev/sdb".into()];
        let args = common(&cfg);

        let controllers = args.iter().filter(|a| a.starts_with("virtio-scsi-pci")).count();
        assert_eq!(controllers, 1);
        assert!(window(
            &args,
            "-blockdev",
            "driver=qcow2,node-name=hd0,file.driver=file,file.filename=/vm/a.qcow2"
        ));
        assert!(window(&args, "-device", "scsi-hd,drive=hd0,bootindex=1"));
        assert!(window(
            &args,
            "-blockdev",
            "driver=raw,node-name=hosthd1,file.driver=host_device,file.filename=/dev/sdb"
        ));
        assert!(window(&args, "-device", "scsi-hd,drive=hosthd1,bootindex=2"));
    }

    #[test]
    fn ide_disks_use_ide_hd() {
        let mut cfg = config();
        cfg.disk_bus = DiskBusMode::None;
        cfg.disks = vec!["/vm/a.img".into()];
        let args = common(&cfg);
        assert!(window(&args, "-blockdev", "driver=raw,node-name=hd0,file.driver=file,file.filename=/vm/a.img"));
        assert!(window(&args, "-device", "ide-hd,drive=hd0,bootindex=1"));
    }

    #[test]
    fn shares_and_floppy_each_emit_backend_and_device() {
        let mut cfg = config();
        cfg.floppy = Some("/vm/boot.img".into());
        cfg.share_dir_as_fat = Some("/srv/fat".into());
        cfg.share_dir_as_floppy = Some("/srv/flop".into());
        cfg.share_dir_as_fsd = Some("/srv/9p".into());
        let args = common(&cfg);

        assert!(window(&args, "-blockdev", "driver=file,node-name=floppy0,filename=/vm/boot.img"));
        assert!(window(&args, "-device", "floppy,drive=floppy0"));
        assert!(window(&args, "-blockdev", "driver=vvfat,node-name=fs_fat,dir=/srv/fat,read-only=on,rw=off"));
        assert!(window(&args, "-device", "usb-storage,drive=fs_fat"));
        assert!(window(&args, "-blockdev", "driver=vvfat,node-name=fs_floppy,dir=/srv/flop,read-only=off,rw=on"));
        assert!(window(&args, "-device", "floppy,drive=fs_floppy"));
        assert!(window(&args, "-fsdev", "local,security_model=passthrough,id=fsdev0,path=/srv/9p"));
        assert!(window(&args, "-device", "virtio-9p-pci,fsdev=fsdev0,mount_tag=hostshare"));
    }

    #[test]
    fn legacy_chipset_gets_uhci_ehci_chain() {
        let mut cfg = config();
        cfg.machine = "pc".into();
        cfg.usb_devices = vec![UsbDevice {
            vendor_id: "046d".into(),
            product_id: "c52b".into(),
        }];
        let args = common(&cfg);

        let usb = args.iter().position(|a| a == "-usb").unwrap();
        assert_eq!(
            &args[usb..usb + 7],
            [
                "-usb",
                "-device",
                "usb-ehci,id=ehci",
                "-device",
                "usb-tablet,bus=ehci.0",
                "-device",
                "usb-host,vendorid=0x046d,productid=0xc52b",
            ]
        );
        assert!(!args.iter().any(|a| a == "qemu-xhci"));
    }

    #[test]
    fn network_forwards_and_models() {
        let mut cfg = config();
        cfg.nic_model = "e1000".into();
        cfg.nic_forward_ports = vec![
            PortForward { host: 2222, guest: 22 },
            PortForward { host: 8080, guest: 80 },
        ];
        let args = common(&cfg);
        assert!(window(&args, "-netdev", "user,id=net0,hostfwd=tcp::2222-:22,hostfwd=tcp::8080-:80"));
        assert!(window(&args, "-device", "e1000,netdev=net0"));

        cfg.nic_model = "none".into();
        let args = common(&cfg);
        assert!(window(&args, "-nic", "none"));
        assert!(!args.iter().any(|a| a == "-netdev"));
    }

    #[test]
    fn sound_models() {
        let mut cfg = config();
        cfg.sound_model = "spk".into();
        let args = common(&cfg);
        assert!(window(&args, "-machine", "pcspk-audiodev=spk0"));

        cfg.sound_model = "ac97".into();
        let args = common(&cfg);
        assert!(window(&args, "-device", "ac97,audiodev=snd0"));

        cfg.sound_model = "gus".into();
        let args = common(&cfg);
        assert!(!args.iter().any(|a| a == "-audiodev"));
    }

    #[test]
    fn cdrom_requires_mount_or_need_cd() {
        let mut cfg = config();
        cfg.iso_images = vec!["/iso/a.iso".into()];
        let b = ArgBuilder::new(&cfg, &NoFs, "/nonexistent");
        assert!(b.cdrom_args(false).is_empty());
        assert_eq!(b.cdrom_args(true).len(), 6);

        cfg.need_cd = true;
        let b = ArgBuilder::new(&cfg, &NoFs, "/nonexistent");
        assert_eq!(b.cdrom_args(false).len(), 6);
    }

    #[test]
    fn efi_on_i386_is_unsupported() {
        let mut cfg = config();
        cfg.arch = Arch::I386;
        cfg.enable_efi = true;
        let err = ArgBuilder::new(&cfg, &NoFs, "/nonexistent")
            .common_args(&RuntimeParams::default())
            .unwrap_err();
        assert!(matches!(err, SynthError::UnsupportedArchitecture(_)));
    }
}
