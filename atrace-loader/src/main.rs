//! Producer CLI (spec.md §4.1/§6): `install`, `status`, `enable`, `disable`,
//! `quit`. Grounded on `xtask`'s small argv-dispatch shape and
//! `cognitod::main`'s `anyhow::Context`-glued error plumbing plus its exit-
//! code discipline (0 success, 5 warning, 20 failure).
//!
//! This binary targets the `sim` platform backend. There is no hosted
//! equivalent of an AmigaOS per-library jump table to patch, so `install`
//! here demonstrates the full install algorithm (descriptor fill, stub
//! generation, vector swap, anchor/patch-array/ring allocation, name
//! registration) against a simulated pair of libraries rather than real
//! ones; `status`/`enable`/`disable`/`quit` operate on whatever this same
//! process installed; a second, separately-run invocation of this binary
//! cannot see it, since nothing on a hosted POSIX box stands in for
//! AmigaOS's single address space shared across OS processes. On the real
//! target, all five subcommands address the one resident installation by
//! way of the named coordination primitive exactly as spec.md describes.

use std::collections::HashMap;

use anyhow::Context;
use atrace_common::function_table::{LIB_DOS, LIB_EXEC};
use atrace_installer::{InstallConfig, InstallError, Installer, ReconfigureCmd, ReconfigureReport};
use atrace_platform::sim::{SimInterruptGuard, SimLibrary, SimNamedLock};
use clap::{Parser, Subcommand};

const EXIT_SUCCESS: i32 = 0;
const EXIT_WARNING: i32 = 5;
const EXIT_FAILURE: i32 = 20;

#[derive(Parser, Debug)]
#[command(name = "atrace-loader")]
#[command(about = "Install and reconfigure the atrace syscall tracer")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install the tracer: allocate the ring, generate and swap in a stub
    /// for every entry in the static function table.
    Install {
        /// Ring capacity in slots (floor 16, default 8192).
        #[arg(long = "bufsz", value_name = "N")]
        bufsz: Option<u32>,
        /// Start every patch disabled rather than enabled-minus-noise.
        #[arg(long)]
        disable: bool,
        /// Enable only these functions (by name); all-or-nothing validation.
        #[arg(long = "funcs", num_args = 1.., value_name = "NAME")]
        funcs: Vec<String>,
    },
    /// Print per-patch enable state and ring counters.
    Status,
    /// Globally enable, or enable the named functions only.
    Enable { names: Vec<String> },
    /// Globally disable (draining in-flight calls), or disable named
    /// functions only.
    Disable { names: Vec<String> },
    /// Disable, release the ring, and unregister the anchor name. The
    /// anchor, patch array, and stub code remain resident (spec.md §4.1).
    Quit,
}

type LoaderInstaller = Installer<SimLibrary, SimInterruptGuard, SimNamedLock>;

/// A pair of simulated libraries standing in for `exec.library`/
/// `dos.library`, since the static function table only ever references
/// those two (spec.md §4.6, §8's worked examples).
fn simulated_libraries() -> HashMap<u8, SimLibrary> {
    let mut libs = HashMap::new();
    libs.insert(LIB_EXEC, SimLibrary::new(0xE000_0000));
    libs.insert(LIB_DOS, SimLibrary::new(0xD000_0000));
    libs
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let code = match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("atrace-loader: {err:#}");
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

fn run(args: Args) -> anyhow::Result<i32> {
    let mut installer: LoaderInstaller = Installer::new(simulated_libraries());

    match args.command {
        Command::Install { bufsz, disable, funcs } => {
            let cfg = InstallConfig {
                ring_capacity: bufsz.unwrap_or(atrace_common::DEFAULT_RING_CAPACITY),
                only: (!funcs.is_empty()).then_some(funcs),
                start_disabled: disable,
            };
            let report = installer
                .install(cfg)
                .context("install failed before any allocation")?;

            let total = report.installed.len() + report.failures.len();
            println!("installed {} of {total} patches", report.installed.len());
            for name in &report.installed {
                println!("  ok    {name}");
            }
            for (name, err) in &report.failures {
                println!("  fail  {name}: {err}");
            }

            if !report.failures.is_empty() {
                log::warn!("{} patch(es) failed to install", report.failures.len());
                Ok(EXIT_WARNING)
            } else {
                Ok(EXIT_SUCCESS)
            }
        }
        Command::Status => {
            let result = installer.reconfigure(ReconfigureCmd::Status);
            if let Err(InstallError::NotInstalled) = result {
                return Ok(report_not_installed());
            }
            match result.context("status failed")? {
                ReconfigureReport::Status {
                    patches,
                    globally_enabled,
                    overflow,
                    events_consumed,
                } => {
                    println!("global_enable={globally_enabled} overflow={overflow} events_consumed={events_consumed}");
                    for p in patches {
                        println!(
                            "  {:<24} enabled={:<5} use_count={}",
                            p.name, p.enabled, p.use_count
                        );
                    }
                    Ok(EXIT_SUCCESS)
                }
                _ => unreachable!("Status always yields ReconfigureReport::Status"),
            }
        }
        Command::Enable { names } => {
            let result = installer.reconfigure(ReconfigureCmd::Enable(names));
            if let Err(InstallError::NotInstalled) = result {
                return Ok(report_not_installed());
            }
            result.context("enable failed")?;
            Ok(EXIT_SUCCESS)
        }
        Command::Disable { names } => {
            let result = installer.reconfigure(ReconfigureCmd::Disable(names));
            if let Err(InstallError::NotInstalled) = result {
                return Ok(report_not_installed());
            }
            result.context("disable failed")?;
            Ok(EXIT_SUCCESS)
        }
        Command::Quit => {
            let result = installer.reconfigure(ReconfigureCmd::Quit);
            if let Err(InstallError::NotInstalled) = result {
                return Ok(report_not_installed());
            }
            result.context("quit failed")?;
            Ok(EXIT_SUCCESS)
        }
    }
}

/// `status`/`enable`/`disable`/`quit` run against a fresh `Installer` with no
/// prior `install` call in this process (see DESIGN.md's cross-process
/// shared-memory scope gap), so they always observe this condition. Report
/// it as spec.md §7's `internal` wire kind ("no tracer installed") rather
/// than a generic failure.
fn report_not_installed() -> i32 {
    eprintln!("atrace-loader: internal: no tracer is installed in this process");
    EXIT_FAILURE
}
