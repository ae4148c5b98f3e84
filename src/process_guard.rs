//! Lifecycle management for convergence engine processes
//!
//! A `puppet apply` run installs packages and restarts services. If the
//! harness is interrupted mid-run, the engine and everything it spawned must
//! not keep mutating the host unobserved.
//!
//! Each engine run leads its own process group and is tracked by group id
//! while it runs. Stopping sends SIGTERM to every tracked group and escalates
//! to SIGKILL for groups still populated after the grace period. A delivered
//! SIGINT/SIGTERM/SIGHUP is recorded before anything is stopped, so the main
//! thread can tell an interrupted run from a failed one.

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Signals that end the harness
const TERMINATING_SIGNALS: [i32; 3] = [
    signal_hook::consts::SIGINT,
    signal_hook::consts::SIGTERM,
    signal_hook::consts::SIGHUP,
];

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Signal number that interrupted the harness, 0 while none has
static DELIVERED_SIGNAL: AtomicI32 = AtomicI32::new(0);

static ENGINES: Mutex<EngineRegistry> = Mutex::new(EngineRegistry::new());

/// Process groups of engine runs that have not finished yet
#[derive(Debug, Default)]
pub struct EngineRegistry {
    groups: BTreeSet<i32>,
    stopping: bool,
}

impl EngineRegistry {
    pub const fn new() -> Self {
        Self {
            groups: BTreeSet::new(),
            stopping: false,
        }
    }

    pub fn track(&mut self, pgid: u32) {
        if let Ok(raw) = i32::try_from(pgid) {
            self.groups.insert(raw);
            debug!(pgid, "tracking engine process group");
        }
    }

    pub fn untrack(&mut self, pgid: u32) {
        if let Ok(raw) = i32::try_from(pgid) {
            self.groups.remove(&raw);
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Stop every tracked group: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Only the first call does anything. Returns how many groups needed
    /// SIGKILL.
    pub fn stop_all(&mut self, grace: Duration) -> usize {
        if std::mem::replace(&mut self.stopping, true) {
            debug!("engine groups already being stopped");
            return 0;
        }
        let groups: Vec<Pid> = std::mem::take(&mut self.groups)
            .into_iter()
            .map(Pid::from_raw)
            .collect();
        if groups.is_empty() {
            return 0;
        }

        info!(count = groups.len(), "stopping engine process group(s)");
        for &group in &groups {
            if let Err(e) = killpg(group, Signal::SIGTERM) {
                debug!(pgid = group.as_raw(), error = %e, "SIGTERM not delivered");
            }
        }

        let deadline = Instant::now() + grace;
        let mut remaining = groups;
        loop {
            remaining.retain(|&group| group_populated(group));
            if remaining.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        for &group in &remaining {
            warn!(pgid = group.as_raw(), "engine group outlived SIGTERM, sending SIGKILL");
            let _ = killpg(group, Signal::SIGKILL);
        }
        remaining.len()
    }
}

/// Any process, zombies included, still belongs to the group
fn group_populated(group: Pid) -> bool {
    killpg(group, None).is_ok()
}

/// Deregisters an engine run from the global registry when dropped.
#[derive(Debug)]
pub struct TrackedEngine {
    pgid: u32,
}

impl Drop for TrackedEngine {
    fn drop(&mut self) {
        if let Ok(mut engines) = ENGINES.lock() {
            engines.untrack(self.pgid);
        }
    }
}

/// Track a spawned engine (the leader of its own group) until the token drops.
pub fn track_engine(pid: u32) -> TrackedEngine {
    if let Ok(mut engines) = ENGINES.lock() {
        engines.track(pid);
    }
    TrackedEngine { pgid: pid }
}

fn stop_tracked_engines(grace: Duration) {
    if let Ok(mut engines) = ENGINES.lock() {
        let killed = engines.stop_all(grace);
        if killed > 0 {
            warn!(killed, "engine group(s) had to be killed");
        }
    }
}

/// The signal that interrupted the harness, if any.
pub fn delivered_signal() -> Option<i32> {
    match DELIVERED_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        sig => Some(sig),
    }
}

/// Shell convention for a process ended by `sig`
pub fn interrupt_exit_code(sig: i32) -> u8 {
    u8::try_from(128 + sig).unwrap_or(u8::MAX)
}

fn signal_name(sig: i32) -> &'static str {
    Signal::try_from(sig).map(Signal::as_str).unwrap_or("unknown signal")
}

/// Watch for SIGINT, SIGTERM and SIGHUP on a dedicated thread.
///
/// The signal is recorded first, then the tracked engine groups are stopped
/// and the process exits with `128 + signal`. The main thread checks
/// `delivered_signal()` so an engine run cut short is never reported as an
/// ordinary failure.
pub fn init_signal_handlers() -> std::io::Result<()> {
    let mut signals = signal_hook::iterator::Signals::new(TERMINATING_SIGNALS)?;

    thread::Builder::new()
        .name("signal-watch".to_string())
        .spawn(move || {
            let Some(sig) = signals.forever().next() else {
                return;
            };
            DELIVERED_SIGNAL.store(sig, Ordering::SeqCst);
            info!(signal = signal_name(sig), "interrupted, stopping engine runs");

            stop_tracked_engines(Duration::from_secs(3));
            std::process::exit(i32::from(interrupt_exit_code(sig)));
        })?;

    Ok(())
}

/// Stops whatever engine runs are still tracked when the harness unwinds.
/// Held by `main` for the whole program run.
pub struct ProcessGuard {
    grace: Duration,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            grace: Duration::from_secs(5),
        }
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        stop_tracked_engines(self.grace);
    }
}

/// Isolation for engine commands
pub trait EngineCommandExt {
    /// Lead a new process group and receive SIGTERM if the harness dies
    fn isolate_engine(&mut self) -> &mut Self;
}

impl EngineCommandExt for Command {
    fn isolate_engine(&mut self) -> &mut Self {
        self.process_group(0);
        // SAFETY: prctl is async-signal-safe and takes no pointers
        unsafe {
            self.pre_exec(set_parent_death_signal);
        }
        self
    }
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> std::io::Result<()> {
    // SAFETY: PR_SET_PDEATHSIG takes a plain signal number
    if unsafe { nix::libc::prctl(nix::libc::PR_SET_PDEATHSIG, nix::libc::SIGTERM) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}
