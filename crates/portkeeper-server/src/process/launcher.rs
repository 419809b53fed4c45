//! Launches the configured forwarding program (socat by default) as a
//! detached background process.
//!
//! The child is put in its own process group with all stdio detached, so it
//! outlives both the launching call and the daemon itself. A reaper thread
//! per child collects its exit status to keep the process table clean.

use super::{ProcessHandle, ProcessLauncher};
use crate::config::ForwarderConfig;
use portkeeper_core::{ForwardSpec, LastKnownPid, LaunchError};
use std::collections::HashSet;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Interval between exit checks during the startup grace period.
const GRACE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Launches forwarders by running `program` with a templated argument list.
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    startup_grace: Duration,
    /// Pids started by this launcher whose exit has not been reaped yet.
    children: Arc<Mutex<HashSet<u32>>>,
}

impl CommandLauncher {
    pub fn new(config: &ForwarderConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            startup_grace: config.startup_grace,
            children: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Wait up to the grace period for an early exit, which usually means
    /// the forwarder could not bind its listen port.
    fn check_early_exit(&self, child: &mut Child) -> Result<(), LaunchError> {
        if self.startup_grace.is_zero() {
            return Ok(());
        }
        let deadline = Instant::now() + self.startup_grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(LaunchError::SpawnFailed(format!(
                        "forwarder exited immediately ({status})"
                    )));
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(LaunchError::SpawnFailed(format!(
                        "cannot query forwarder status: {e}"
                    )));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(GRACE_POLL_INTERVAL.min(deadline - now));
        }
    }

    fn spawn_reaper(&self, mut child: Child) {
        let pid = child.id();
        let children = Arc::clone(&self.children);
        let spawned = std::thread::Builder::new()
            .name(format!("reaper-{pid}"))
            .spawn(move || {
                match child.wait() {
                    Ok(status) => info!(pid, %status, "forwarder exited"),
                    Err(e) => warn!(pid, error = %e, "failed waiting on forwarder"),
                }
                lock_children(&children).remove(&pid);
            });
        if let Err(e) = spawned {
            // The child keeps running; it just will not be reaped by us.
            warn!(pid, error = %e, "could not start reaper thread");
            lock_children(&self.children).remove(&pid);
        }
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, spec: &ForwardSpec) -> Result<ProcessHandle, LaunchError> {
        // Specs read back from the state file bypass parsing; check again.
        let spec = ForwardSpec::new(spec.listen_port(), spec.target_host(), spec.target_port())
            .map_err(|e| LaunchError::InvalidParameters(e.to_string()))?;
        let args = render_args(&self.args, &spec);

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        debug!(program = %self.program, ?args, "spawning forwarder");
        let mut child = command
            .spawn()
            .map_err(|e| LaunchError::SpawnFailed(format!("{}: {e}", self.program)))?;
        let pid = child.id();

        if let Err(e) = self.check_early_exit(&mut child) {
            let _ = child.kill();
            let _ = child.wait();
            warn!(pid, spec = %spec, error = %e, "forwarder did not start");
            return Err(e);
        }

        lock_children(&self.children).insert(pid);
        self.spawn_reaper(child);

        info!(pid, spec = %spec, "forwarder started");
        Ok(ProcessHandle::new(pid))
    }

    fn supervises(&self, pid: LastKnownPid) -> bool {
        lock_children(&self.children).contains(&pid.get())
    }
}

fn lock_children(children: &Mutex<HashSet<u32>>) -> MutexGuard<'_, HashSet<u32>> {
    children.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Substitute `{listen_port}`, `{target_host}` and `{target_port}` in each
/// template argument.
pub fn render_args(template: &[String], spec: &ForwardSpec) -> Vec<String> {
    let listen = spec.listen_port().to_string();
    let host = spec.target_host_for_address();
    let target = spec.target_port().to_string();
    template
        .iter()
        .map(|arg| {
            arg.replace("{listen_port}", &listen)
                .replace("{target_host}", &host)
                .replace("{target_port}", &target)
        })
        .collect()
}
