//! Consumer daemon (spec.md §4.4-§4.6): attaches to a published tracer,
//! drives the poll loop on a fixed tick, and exposes [`ControlApi`] for
//! whatever (out-of-scope) transport a real deployment wires on top.
//! Grounded on `cognitod::main` + `cognitod::config::Config`: `env_logger`
//! is initialized once at the top of `main`, the config is loaded with an
//! env-var override, and the steady-state loop is a plain synchronous tick
//! rather than an async runtime (spec.md §5 describes a single-threaded,
//! poll-driven consumer, not a service with concurrent request handling).
//!
//! This binary's platform backend is `sim`: there is no POSIX analogue of
//! AmigaOS's per-library jump table, so the daemon installs its own tracer
//! against a pair of simulated libraries in-process and immediately attaches
//! its own consumer to that installation, rather than attaching across
//! processes to a separately-run producer (see `atrace-loader`'s module doc
//! for the same constraint from the producer side).

mod config;
mod control;
mod sink;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use atrace_common::function_table::{LIB_DOS, LIB_EXEC};
use atrace_consumer::{Consumer, ControlApi, Filter, PollOutcome};
use atrace_installer::{InstallConfig, Installer};
use atrace_platform::sim::{SimCurrentTask, SimInterruptGuard, SimLibrary, SimNamedLock};
use clap::Parser;

use crate::config::Config;
use crate::control::Daemon;
use crate::sink::StdoutSink;

#[derive(Parser, Debug)]
#[command(name = "atraced")]
#[command(about = "atrace syscall tracer consumer daemon")]
struct Args {
    /// LIB=name filter for an initial free-subscribe subscriber.
    #[arg(long = "lib")]
    lib: Option<String>,
    /// FUNC=name filter for an initial free-subscribe subscriber.
    #[arg(long = "func")]
    func: Option<String>,
    /// PROC=substring filter for an initial free-subscribe subscriber.
    #[arg(long = "proc")]
    proc_substring: Option<String>,
    /// ERRORS-only filter for an initial free-subscribe subscriber.
    #[arg(long)]
    errors: bool,
    /// Exit after this many poll ticks instead of running forever (0 = forever).
    #[arg(long, default_value_t = 0)]
    max_ticks: u64,
}

fn simulated_libraries() -> HashMap<u8, SimLibrary> {
    let mut libs = HashMap::new();
    libs.insert(LIB_EXEC, SimLibrary::new(0xE000_0000));
    libs.insert(LIB_DOS, SimLibrary::new(0xD000_0000));
    libs
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let cfg = Config::load();

    let mut installer: Installer<SimLibrary, SimInterruptGuard, SimNamedLock> =
        Installer::new(simulated_libraries());
    let report = installer
        .install(InstallConfig {
            ring_capacity: cfg.ring_capacity,
            only: None,
            start_disabled: false,
        })
        .context("install failed before any allocation")?;
    for (name, err) in &report.failures {
        log::warn!("stub install failed for {name}: {err}");
    }
    for name in &cfg.extra_noise_functions {
        if atrace_common::function_table::find_by_func_name(name).is_none() {
            log::warn!("extra_noise_functions entry {name:?} names no known syscall");
            continue;
        }
        installer.reconfigure(atrace_installer::ReconfigureCmd::Disable(vec![name.clone()]))?;
    }

    let anchor = installer.installed_anchor().expect("install just succeeded above");
    let patches = installer.installed_patches().expect("install just succeeded above");
    let ring = installer.installed_ring().expect("install just succeeded above");

    let consumer = Consumer::<SimNamedLock, SimInterruptGuard, SimCurrentTask, StdoutSink>::attach(
        anchor,
        patches,
        ring,
        &cfg.anchor_name,
    )
    .context("consumer failed to attach to the anchor this process just installed")?;

    let mut daemon = Daemon::new(consumer);

    if args.lib.is_some() || args.func.is_some() || args.proc_substring.is_some() || args.errors {
        let mut filter = Filter::any();
        if let Some(lib) = &args.lib {
            filter = filter.with_lib_name(lib);
        }
        if let Some(func) = &args.func {
            filter = filter.with_func_name(func);
        }
        if let Some(proc_substring) = args.proc_substring.clone() {
            filter = filter.with_caller_substring(proc_substring);
        }
        filter = filter.with_errors_only(args.errors);
        daemon
            .start(filter)
            .expect("Daemon::start never fails for a locally-registered subscriber");
    }

    let tick = Duration::from_millis(cfg.poll_interval_ms.max(1));
    let mut ticks = 0u64;
    loop {
        match daemon.consumer.poll_once() {
            PollOutcome::ShutDown => {
                log::info!("producer detached, shutting down");
                break;
            }
            PollOutcome::Drained(n) if n > 0 => log::debug!("drained {n} events"),
            PollOutcome::Drained(_) | PollOutcome::SkippedReconfiguring => {}
        }
        ticks += 1;
        if args.max_ticks != 0 && ticks >= args.max_ticks {
            break;
        }
        std::thread::sleep(tick);
    }

    Ok(())
}
