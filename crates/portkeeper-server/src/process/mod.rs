//! Forwarder process control: launching and stopping the external program
//! that carries the traffic for each rule.

pub mod launcher;
pub mod terminator;

pub use launcher::CommandLauncher;
pub use terminator::SignalTerminator;

use portkeeper_core::{ForwardSpec, LastKnownPid, LaunchError, TerminationError};

/// A forwarder started by this process.
///
/// Unlike [`LastKnownPid`], a `ProcessHandle` is only ever produced by a
/// successful launch, so it refers to a process that was alive at that moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: u32,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The value to persist for this forwarder.
    pub fn last_known(&self) -> LastKnownPid {
        LastKnownPid(self.pid)
    }
}

/// Result of a stop request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The stop signal was delivered.
    Stopped,
    /// No process with that pid exists any more.
    AlreadyGone,
}

/// Starts forwarders. Calls block and may be slow.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &ForwardSpec) -> Result<ProcessHandle, LaunchError>;

    /// Whether `pid` is a forwarder this launcher started during the current
    /// process lifetime and that has not exited yet.
    fn supervises(&self, _pid: LastKnownPid) -> bool {
        false
    }
}

/// Stops forwarders. Calls block and may be slow.
pub trait ProcessTerminator: Send + Sync {
    fn terminate(&self, pid: LastKnownPid) -> Result<TerminationOutcome, TerminationError>;
}

#[cfg(test)]
pub mod fake;
