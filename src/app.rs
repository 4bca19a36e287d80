//! VM lifecycle actions: `init`, `install`, `run`, and a dry-run `args`.

use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing::{error, info, warn};

use crate::config;
use crate::exec::{exec_with_trace, run_preparatory};
use crate::paths::VmvmPaths;
use crate::tpm::SwtpmDaemon;
use crate::vm::resolve::image_format;
use crate::vm::{ArgBuilder, BootMode, HostFs, PreparatoryAction, RuntimeParams, VmConfig};

/// First port tried for SPICE when the config says `spice = "auto"`.
pub const SPICE_PORT_BASE: u16 = 5900;

/// Size of the disk created by `init`.
const INIT_DISK_SIZE: &str = "100G";

/// Complete emulator invocation for one lifecycle action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: &'static str,
    pub args: Vec<String>,
    pub pre_commands: Vec<PreparatoryAction>,
}

pub struct App {
    vm_dir: PathBuf,
    config: VmConfig,
    paths: VmvmPaths,
}

impl App {
    /// Load `vmconfig.toml` from `vm_dir`.
    pub fn open(vm_dir: PathBuf, paths: VmvmPaths) -> Result<Self> {
        let vm_dir = std::fs::canonicalize(&vm_dir)
            .with_context(|| format!("VM directory {} not accessible", vm_dir.display()))?;
        let config = config::load(&vm_dir)?;
        Ok(Self { vm_dir, config, paths })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Build the full command line: common arguments, then boot order, then
    /// optical media (always attached for installs).
    pub fn synthesize(&self, mode: BootMode, runtime: &RuntimeParams) -> Result<Invocation> {
        let probe = HostFs::new(&self.vm_dir);
        let builder = ArgBuilder::new(&self.config, &probe, &self.paths.runtime);

        let common = builder.common_args(runtime)?;
        let mut args = common.args;
        args.extend(builder.boot_args(mode));
        args.extend(builder.cdrom_args(mode == BootMode::Install));

        Ok(Invocation {
            program: self.config.arch.emulator_binary(),
            args,
            pre_commands: common.pre_commands,
        })
    }

    /// Create an empty image for the first configured disk.
    pub async fn act_init(&self) -> Result<()> {
        info!("action: initializing vm");
        let Some(first_disk) = self.config.disks.first() else {
            bail!("no disks configured");
        };
        if first_disk.exists() {
            error!("disk already exists, not overwriting: {}", first_disk.display());
            return Ok(());
        }

        let format = image_format(first_disk).as_str();
        info!(
            "creating empty disk {} with size {} and format {}",
            first_disk.display(),
            INIT_DISK_SIZE,
            format.to_uppercase()
        );
        let args = vec![
            "create".to_string(),
            "-f".to_string(),
            format.to_string(),
            first_disk.display().to_string(),
            INIT_DISK_SIZE.to_string(),
        ];
        let status = exec_with_trace("qemu-img", &args, &self.vm_dir).await?;
        if !status.success() {
            bail!("qemu-img failed ({status})");
        }
        Ok(())
    }

    pub async fn act_install(&self) -> Result<()> {
        info!("action: installing operating system inside vm");
        self.launch(BootMode::Install).await
    }

    pub async fn act_run(&self) -> Result<()> {
        info!("action: running vm");
        self.launch(BootMode::Run).await
    }

    /// Print the command line `install`/`run` would execute.
    pub fn act_args(&self, mode: BootMode) -> Result<()> {
        let runtime = RuntimeParams {
            spice_port: find_free_port(SPICE_PORT_BASE)?,
            tpm_socket: self
                .config
                .enable_tpm
                .then(|| self.paths.tpm_dir(&self.config.name).join("swtpm-sock")),
        };
        let invocation = self.synthesize(mode, &runtime)?;

        for pre in &invocation.pre_commands {
            println!("{} {}", pre.program, pre.args.join(" "));
        }
        println!("{} {}", invocation.program, invocation.args.join(" "));
        Ok(())
    }

    async fn launch(&self, mode: BootMode) -> Result<()> {
        let tpm = if self.config.enable_tpm {
            info!("starting software TPM daemon");
            Some(SwtpmDaemon::start(self.paths.tpm_dir(&self.config.name)).await?)
        } else {
            None
        };

        let result = self.launch_emulator(mode, tpm.as_ref().map(SwtpmDaemon::socket)).await;

        match tpm {
            Some(tpm) => merge_teardown(result, tpm.shutdown().await),
            None => result,
        }
    }

    async fn launch_emulator(&self, mode: BootMode, tpm_socket: Option<PathBuf>) -> Result<()> {
        let runtime = RuntimeParams {
            spice_port: find_free_port(SPICE_PORT_BASE)?,
            tpm_socket,
        };
        let invocation = self.synthesize(mode, &runtime)?;

        run_preparatory(&invocation.pre_commands, &self.vm_dir).await?;

        let status = exec_with_trace(invocation.program, &invocation.args, &self.vm_dir).await?;
        if !status.success() {
            bail!("{} exited with {status}", invocation.program);
        }
        Ok(())
    }
}

/// The emulator's error wins over a teardown error; the latter is only
/// returned when the emulator itself succeeded.
fn merge_teardown(run: Result<()>, teardown: Result<()>) -> Result<()> {
    match (run, teardown) {
        (Err(run), Err(teardown)) => {
            warn!("software TPM teardown failed: {teardown:#}");
            Err(run)
        }
        (Err(run), Ok(())) => Err(run),
        (Ok(()), teardown) => teardown,
    }
}

/// First port at or above `base` that can be bound on localhost.
pub fn find_free_port(base: u16) -> Result<u16> {
    (base..=u16::MAX)
        .find(|&port| TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok())
        .with_context(|| format!("no free TCP port at or above {base}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_port_is_skipped() {
        let busy = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = busy.local_addr().unwrap().port();

        let found = find_free_port(port).unwrap();

        assert!(found > port);
    }

    #[test]
    fn emulator_failure_survives_teardown_failure() {
        let merged = merge_teardown(Err(anyhow::anyhow!("qemu exited with 1")), Err(anyhow::anyhow!("rm failed")));
        assert_eq!(merged.unwrap_err().to_string(), "qemu exited with 1");

        let merged = merge_teardown(Ok(()), Err(anyhow::anyhow!("rm failed")));
        assert_eq!(merged.unwrap_err().to_string(), "rm failed");

        assert!(merge_teardown(Ok(()), Ok(())).is_ok());
    }

    fn write_vm(dir: &std::path::Path, body: &str) {
        std::fs::write(dir.join(config::CONFIG_FILE_NAME), body).unwrap();
    }

    fn paths(root: &std::path::Path) -> VmvmPaths {
        VmvmPaths {
            runtime: root.join("run"),
            logs: root.join("logs"),
        }
    }

    #[test]
    fn synthesize_concatenates_sections() {
        let tmp = tempfile::TempDir::new().unwrap();
        let vm = tmp.path().join("vm");
        std::fs::create_dir(&vm).unwrap();
        write_vm(
            &vm,
            "name = 'foo'\nprototype = 'default-x86_64'\ndisk = 'system.qcow2'\nos_install = 'setup.iso'\n",
        );

        let app = App::open(vm.clone(), paths(tmp.path())).unwrap();
        let runtime = RuntimeParams {
            spice_port: 5901,
            tpm_socket: None,
        };

        let install = app.synthesize(BootMode::Install, &runtime).unwrap();
        assert_eq!(install.program, "qemu-system-x86_64");
        let boot = install.args.iter().position(|a| a == "-boot").unwrap();
        assert_eq!(install.args[boot + 1], "once=d");
        assert!(install.args[boot + 2..].iter().any(|a| a.starts_with("ide-cd,bus=ide.0")));

        let run = app.synthesize(BootMode::Run, &runtime).unwrap();
        assert_eq!(run.args.last().unwrap(), "order=c");
        assert!(!run.args.iter().any(|a| a.contains("setup.iso")));
    }

    #[tokio::test]
    async fn init_without_disks_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_vm(tmp.path(), "name = 'foo'\nprototype = 'default-x86_64'\n");

        let app = App::open(tmp.path().to_path_buf(), paths(tmp.path())).unwrap();

        assert!(app.act_init().await.is_err());
    }

    #[tokio::test]
    async fn init_keeps_existing_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_vm(tmp.path(), "name = 'foo'\nprototype = 'default-x86_64'\ndisk = 'system.qcow2'\n");
        std::fs::write(tmp.path().join("system.qcow2"), b"data").unwrap();

        let app = App::open(tmp.path().to_path_buf(), paths(tmp.path())).unwrap();
        app.act_init().await.unwrap();

        assert_eq!(std::fs::read(tmp.path().join("system.qcow2")).unwrap(), b"data");
    }
}
