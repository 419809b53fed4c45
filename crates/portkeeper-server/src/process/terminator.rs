//! Stops forwarders by sending `SIGTERM`.

use super::{ProcessTerminator, TerminationOutcome};
use portkeeper_core::{LastKnownPid, TerminationError};
use tracing::{debug, warn};

/// Sends the graceful-stop signal to a recorded pid.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalTerminator;

impl SignalTerminator {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessTerminator for SignalTerminator {
    #[cfg(unix)]
    fn terminate(&self, pid: LastKnownPid) -> Result<TerminationOutcome, TerminationError> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // 0 and negative values address process groups; never signal those.
        let raw = match i32::try_from(pid.get()) {
            Ok(raw) if raw > 0 => raw,
            _ => {
                warn!(pid = pid.get(), "recorded pid is not a valid process id");
                return Ok(TerminationOutcome::AlreadyGone);
            }
        };

        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => {
                debug!(pid = raw, "sent SIGTERM");
                Ok(TerminationOutcome::Stopped)
            }
            Err(Errno::ESRCH) => {
                debug!(pid = raw, "process already gone");
                Ok(TerminationOutcome::AlreadyGone)
            }
            Err(Errno::EPERM) => Err(TerminationError::PermissionDenied(pid.get())),
            Err(e) => Err(TerminationError::Os {
                pid: pid.get(),
                reason: e.desc().to_string(),
            }),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self, pid: LastKnownPid) -> Result<TerminationOutcome, TerminationError> {
        Err(TerminationError::Os {
            pid: pid.get(),
            reason: "signals are not supported on this platform".into(),
        })
    }
}
