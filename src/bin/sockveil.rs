// src/bin/sockveil.rs
//! Sockveil launcher
//!
//! Runs a target command with the interposition library preloaded: locates
//! `libsockveil.so`, assembles the identity/domain/log environment, and
//! `exec`s the command in place. The child owns the process from then on, so
//! its exit code and signal behavior are untouched.

use std::env;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::Parser;

use sockveil::utils::config::{ENV_DOMAINS, ENV_IDENTITIES, ENV_LOG};

/// Environment variable naming the preload object explicitly
const ENV_LIB: &str = "SOCKVEIL_LIB";

/// Candidate locations for the preload object, tried in order
const STANDARD_LIB_PATHS: &[&str] = &[
    "/usr/lib/sockveil/libsockveil.so",
    "/usr/local/lib/sockveil/libsockveil.so",
    "./target/release/libsockveil.so",
    "./target/debug/libsockveil.so",
];

#[derive(Parser, Debug)]
#[command(
    name = "sockveil",
    version,
    about = "Run a command with overlay hostnames transparently tunneled"
)]
struct Args {
    /// Identity bundle path (repeatable)
    #[arg(short, long = "identity")]
    identities: Vec<PathBuf>,

    /// Overlay domain suffix (repeatable; default .ziti)
    #[arg(short, long = "domain")]
    domains: Vec<String>,

    /// Path to libsockveil.so
    #[arg(long = "lib", env = ENV_LIB)]
    lib: Option<PathBuf>,

    /// Log filter for the side channel (e.g. debug, sockveil=trace)
    #[arg(long, env = ENV_LOG)]
    log: Option<String>,

    /// Command to run under interposition
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let lib = locate_library(args.lib.clone())?;
    let (program, program_args) = args
        .command
        .split_first()
        .context("missing command to run")?;

    let mut command = Command::new(program);
    command.args(program_args);
    command.env("LD_PRELOAD", preload_value(&lib));

    if !args.identities.is_empty() {
        let joined = args
            .identities
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":");
        command.env(ENV_IDENTITIES, joined);
    }
    if !args.domains.is_empty() {
        command.env(ENV_DOMAINS, args.domains.join(","));
    }
    if let Some(log) = &args.log {
        command.env(ENV_LOG, log);
    }

    // exec replaces this process; returning at all means it failed.
    let err = command.exec();
    bail!("failed to exec {program}: {err}");
}

/// Find the preload object: explicit flag, then standard locations, then next
/// to this executable.
fn locate_library(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }
        bail!("preload library not found: {}", path.display());
    }

    for candidate in STANDARD_LIB_PATHS {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("libsockveil.so");
            if sibling.exists() {
                return Ok(sibling);
            }
        }
    }

    bail!("libsockveil.so not found; pass --lib or set {ENV_LIB}");
}

/// LD_PRELOAD value preserving anything already preloaded
fn preload_value(lib: &std::path::Path) -> String {
    match env::var("LD_PRELOAD") {
        Ok(existing) if !existing.is_empty() => {
            format!("{}:{existing}", lib.display())
        }
        _ => lib.display().to_string(),
    }
}
