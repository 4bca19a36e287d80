//! vmvm: declarative QEMU virtual machines.
//!
//! - [`vm`]: command-line synthesis (the part that knows QEMU).
//! - [`config`]: `vmconfig.toml` parsing, prototypes, and defaults.
//! - [`app`], [`exec`], [`tpm`]: launching the emulator and its helpers.

pub mod app;
pub mod config;
pub mod exec;
pub mod logging;
pub mod paths;
pub mod tpm;
pub mod vm;
