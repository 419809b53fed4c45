//! In-memory process table with launcher/terminator implementations over it,
//! for exercising the lifecycle manager without real processes.

use super::{ProcessHandle, ProcessLauncher, ProcessTerminator, TerminationOutcome};
use portkeeper_core::{ForwardSpec, LastKnownPid, LaunchError, TerminationError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Simulated host process table: pid -> listen port of a live forwarder.
#[derive(Default)]
pub struct FakeProcessTable {
    live: Mutex<HashMap<u32, u16>>,
    next_pid: AtomicU32,
}

impl FakeProcessTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            live: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(1000),
        })
    }

    pub fn is_live(&self, pid: LastKnownPid) -> bool {
        self.live.lock().unwrap().contains_key(&pid.get())
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Live forwarders listening on `port`.
    pub fn live_on_port(&self, port: u16) -> usize {
        self.live.lock().unwrap().values().filter(|p| **p == port).count()
    }

    /// Simulate a forwarder dying on its own.
    pub fn kill_externally(&self, pid: LastKnownPid) {
        self.live.lock().unwrap().remove(&pid.get());
    }
}

pub struct FakeLauncher {
    table: Arc<FakeProcessTable>,
    failing_ports: Mutex<HashSet<u16>>,
    delay: Duration,
    pub launches: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(table: Arc<FakeProcessTable>) -> Self {
        Self {
            table,
            failing_ports: Mutex::new(HashSet::new()),
            delay: Duration::ZERO,
            launches: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_port(&self, port: u16) {
        self.failing_ports.lock().unwrap().insert(port);
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &ForwardSpec) -> Result<ProcessHandle, LaunchError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let port = spec.listen_port();
        let mut live = self.table.live.lock().unwrap();
        // A forwarder still alive on the port keeps it bound.
        let port_taken = live.values().any(|p| *p == port);
        if port_taken || self.failing_ports.lock().unwrap().contains(&port) {
            self.launches.fetch_add(1, Ordering::SeqCst);
            return Err(LaunchError::SpawnFailed(format!("port {port} already in use")));
        }
        let pid = self.table.next_pid.fetch_add(1, Ordering::SeqCst);
        live.insert(pid, port);
        drop(live);
        // Counted only once the process is visible in the table.
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessHandle::new(pid))
    }

    fn supervises(&self, pid: LastKnownPid) -> bool {
        self.table.is_live(pid)
    }
}

pub struct FakeTerminator {
    table: Arc<FakeProcessTable>,
    failure: Mutex<Option<TerminationError>>,
    delay: Duration,
    /// How long a signalled process lingers before it is gone.
    exit_delay: Duration,
}

impl FakeTerminator {
    pub fn new(table: Arc<FakeProcessTable>) -> Self {
        Self {
            table,
            failure: Mutex::new(None),
            delay: Duration::ZERO,
            exit_delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Signalled processes keep running (and holding their port) for
    /// `exit_delay` before they disappear.
    pub fn with_exit_delay(mut self, exit_delay: Duration) -> Self {
        self.exit_delay = exit_delay;
        self
    }

    /// Make every following stop request fail with `error`.
    pub fn fail_with(&self, error: TerminationError) {
        *self.failure.lock().unwrap() = Some(error);
    }
}

impl ProcessTerminator for FakeTerminator {
    fn terminate(&self, pid: LastKnownPid) -> Result<TerminationOutcome, TerminationError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Some(e) = self.failure.lock().unwrap().clone() {
            return Err(e);
        }
        if self.exit_delay.is_zero() {
            return match self.table.live.lock().unwrap().remove(&pid.get()) {
                Some(_) => Ok(TerminationOutcome::Stopped),
                None => Ok(TerminationOutcome::AlreadyGone),
            };
        }

        if !self.table.is_live(pid) {
            return Ok(TerminationOutcome::AlreadyGone);
        }
        let table = Arc::clone(&self.table);
        let exit_delay = self.exit_delay;
        std::thread::spawn(move || {
            std::thread::sleep(exit_delay);
            table.kill_externally(pid);
        });
        Ok(TerminationOutcome::Stopped)
    }
}
