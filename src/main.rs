//! vmvm: user friendly QEMU frontend.
//!
//! Reads `vmconfig.toml` from a VM directory and launches `qemu-system-*`
//! with the synthesised command line.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use vmvm::app::App;
use vmvm::logging;
use vmvm::paths::VmvmPaths;
use vmvm::vm::BootMode;

#[derive(Parser, Debug)]
#[command(name = "vmvm", version, about = "User friendly QEMU frontend")]
struct Args {
    #[command(subcommand)]
    action: Action,
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Directory containing vmconfig.toml
    #[arg(default_value = ".")]
    dir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Create an image file for the first disk in the config (if it does not exist)
    Init(Target),
    /// Boot from the `os_install` media to install the operating system
    Install(Target),
    /// Boot from the first disk
    Run(Target),
    /// Print the emulator command line without launching it
    Args {
        /// Print the install command line instead of the run command line
        #[arg(long)]
        install: bool,
        #[command(flatten)]
        target: Target,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let paths = VmvmPaths::resolve();
    let _log_guard = logging::init(&paths.logs);
    paths.ensure().context("Failed to create log directory")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    runtime.block_on(async move {
        match args.action {
            Action::Init(t) => App::open(t.dir, paths)?.act_init().await,
            Action::Install(t) => App::open(t.dir, paths)?.act_install().await,
            Action::Run(t) => App::open(t.dir, paths)?.act_run().await,
            Action::Args { install, target } => {
                let mode = if install { BootMode::Install } else { BootMode::Run };
                App::open(target.dir, paths)?.act_args(mode)
            }
        }
    })
}
