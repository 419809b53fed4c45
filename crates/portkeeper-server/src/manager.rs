//! Forwarding-rule lifecycle management.
//!
//! [`RuleManager`] is the only component that starts or stops forwarders.
//! It implements three protocols on top of the store and the process
//! launcher/terminator:
//!
//! - **create**: validate, launch, then persist. A failed launch persists
//!   nothing.
//! - **delete**: check ownership, stop the forwarder, then remove the rule.
//!   A forwarder that already exited still counts as success (with a
//!   warning); any other stop failure keeps the rule so a later run can
//!   retry.
//! - **reconcile**: at startup, respawn every stored rule and record the new
//!   pid. Pids stored by a previous run are never signalled; they may belong
//!   to unrelated processes by now.
//!
//! Operations on the same rule id are serialized through [`KeyedLocks`].
//! Launch and stop calls run on the blocking pool under a timeout while only
//! that rule's lock is held. Store calls run on the blocking pool too.

use crate::locks::KeyedLocks;
use crate::process::{ProcessHandle, ProcessLauncher, ProcessTerminator, TerminationOutcome};
use crate::store::RuleStore;
use portkeeper_core::{
    ForwardSpec, ForwardingRule, KeeperError, KeeperResult, LastKnownPid, LaunchError, NewRule,
    RuleId, RuleParams, TerminationError, UserId,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Warning attached to a delete whose forwarder had already exited.
pub const PROCESS_ALREADY_GONE: &str = "process already gone";

/// How often to check whether a signalled forwarder has been reaped.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Successful result of [`RuleManager::delete_rule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The forwarder was signalled and the rule removed.
    Stopped,
    /// The rule was removed; its forwarder was no longer running.
    ProcessAlreadyGone,
}

impl DeleteOutcome {
    pub fn warning(self) -> Option<&'static str> {
        match self {
            DeleteOutcome::Stopped => None,
            DeleteOutcome::ProcessAlreadyGone => Some(PROCESS_ALREADY_GONE),
        }
    }
}

/// What startup reconciliation did, per rule. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Rules respawned, with their new pid.
    pub succeeded: Vec<(RuleId, LastKnownPid)>,
    /// Rules that could not be respawned, with the reason. Their stored pid
    /// was left untouched.
    pub failed: Vec<(RuleId, String)>,
    /// Rules deleted while reconciliation was running.
    pub skipped: Vec<RuleId>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

enum RuleReconciliation {
    Respawned(LastKnownPid),
    Failed(String),
    Vanished,
}

/// Timeouts bounding calls into the forwarder program.
#[derive(Debug, Clone, Copy)]
pub struct ManagerTimeouts {
    pub launch: Duration,
    pub terminate: Duration,
}

impl Default for ManagerTimeouts {
    fn default() -> Self {
        Self {
            launch: Duration::from_secs(10),
            terminate: Duration::from_secs(10),
        }
    }
}

/// Creates, deletes and reconciles forwarding rules.
pub struct RuleManager {
    store: Arc<dyn RuleStore>,
    launcher: Arc<dyn ProcessLauncher>,
    terminator: Arc<dyn ProcessTerminator>,
    locks: KeyedLocks<RuleId>,
    timeouts: ManagerTimeouts,
}

impl RuleManager {
    pub fn new(
        store: Arc<dyn RuleStore>,
        launcher: Arc<dyn ProcessLauncher>,
        terminator: Arc<dyn ProcessTerminator>,
        timeouts: ManagerTimeouts,
    ) -> Self {
        Self {
            store,
            launcher,
            terminator,
            locks: KeyedLocks::new(),
            timeouts,
        }
    }

    /// Validate `params`, start a forwarder, and persist the new rule.
    ///
    /// Invalid parameters fail before anything is spawned. A launch failure
    /// is returned as is and nothing is stored.
    pub async fn create_rule(
        &self,
        params: &RuleParams,
        owner: UserId,
    ) -> KeeperResult<ForwardingRule> {
        let spec = ForwardSpec::parse(params)?;

        let listen_port = spec.listen_port();
        let clashes = self
            .with_store(move |store| {
                Ok(store
                    .get_all()?
                    .into_iter()
                    .filter(|r| r.spec.listen_port() == listen_port)
                    .count())
            })
            .await?;
        if clashes > 0 {
            warn!(
                listen_port = spec.listen_port(),
                existing = clashes,
                "another rule already uses this listen port"
            );
        }

        let handle = self.launch(spec.clone()).await?;

        let new_rule = NewRule {
            spec,
            owner,
            last_known_pid: handle.last_known(),
        };
        let id = match self.with_store(move |store| store.insert(new_rule)).await {
            Ok(id) => id,
            Err(e) => {
                error!(pid = handle.pid(), error = %e, "could not persist rule, stopping its forwarder");
                if let Err(stop_err) = self.terminate(handle.last_known()).await {
                    error!(pid = handle.pid(), error = %stop_err, "forwarder left running without a rule");
                }
                return Err(e);
            }
        };

        let rule = self
            .with_store(move |store| store.get_by_id(id))
            .await?
            .ok_or_else(|| KeeperError::Store(format!("rule {id} missing right after insert")))?;
        info!(rule_id = %id, owner = %owner, pid = handle.pid(), spec = %rule.spec, "rule created");
        Ok(rule)
    }

    /// Stop a rule's forwarder and remove the rule.
    ///
    /// Only the owner may delete a rule. If stopping fails for any reason
    /// other than the process being gone, the rule is kept.
    pub async fn delete_rule(&self, id: RuleId, requester: UserId) -> KeeperResult<DeleteOutcome> {
        let _guard = self.locks.lock(id).await;

        let rule = self
            .with_store(move |store| store.get_by_id(id))
            .await?
            .ok_or(KeeperError::NotFound(id))?;
        if rule.owner != requester {
            warn!(rule_id = %id, owner = %rule.owner, requester = %requester, "delete refused");
            return Err(KeeperError::Unauthorized(id));
        }

        let outcome = match self.terminate(rule.last_known_pid).await {
            Ok(TerminationOutcome::Stopped) => DeleteOutcome::Stopped,
            Ok(TerminationOutcome::AlreadyGone) => DeleteOutcome::ProcessAlreadyGone,
            Err(e) => {
                warn!(rule_id = %id, pid = %rule.last_known_pid, error = %e, "could not stop forwarder, keeping rule");
                return Err(e.into());
            }
        };

        self.with_store(move |store| store.delete(id)).await?;
        match outcome {
            DeleteOutcome::Stopped => {
                info!(rule_id = %id, pid = %rule.last_known_pid, "rule deleted")
            }
            DeleteOutcome::ProcessAlreadyGone => {
                warn!(rule_id = %id, pid = %rule.last_known_pid, "rule deleted, process already gone")
            }
        }
        Ok(outcome)
    }

    /// Respawn a forwarder for every stored rule.
    ///
    /// Per-rule failures are collected in the report and never stop the
    /// remaining rules. Only a failure to list the rules is an error.
    pub async fn reconcile_on_startup(&self) -> KeeperResult<ReconciliationReport> {
        let rules = self.with_store(|store| store.get_all()).await?;
        let mut report = ReconciliationReport::default();

        if rules.is_empty() {
            info!("no forwarding rules to reactivate");
            return Ok(report);
        }
        info!(count = rules.len(), "reactivating forwarding rules");

        for rule in rules {
            match self.reconcile_rule(rule.id).await {
                RuleReconciliation::Respawned(pid) => report.succeeded.push((rule.id, pid)),
                RuleReconciliation::Failed(reason) => report.failed.push((rule.id, reason)),
                RuleReconciliation::Vanished => report.skipped.push(rule.id),
            }
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_rule(&self, id: RuleId) -> RuleReconciliation {
        let _guard = self.locks.lock(id).await;

        // Re-read under the lock: the rule may have been deleted meanwhile.
        let rule = match self.with_store(move |store| store.get_by_id(id)).await {
            Ok(Some(rule)) => rule,
            Ok(None) => {
                debug!(rule_id = %id, "rule deleted before reconciliation, skipping");
                return RuleReconciliation::Vanished;
            }
            Err(e) => return RuleReconciliation::Failed(e.to_string()),
        };

        // A forwarder we started ourselves in this process lifetime is known
        // to be ours. Stop it and wait for it to exit: it holds the listen
        // port until then and its replacement would fail to bind.
        if self.launcher.supervises(rule.last_known_pid) {
            if let Err(e) = self.replace_supervised(rule.last_known_pid).await {
                warn!(rule_id = %id, pid = %rule.last_known_pid, error = %e, "cannot replace running forwarder");
                return RuleReconciliation::Failed(e.to_string());
            }
        }

        let handle = match self.launch(rule.spec.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(rule_id = %id, spec = %rule.spec, error = %e, "reactivation failed, rule kept");
                return RuleReconciliation::Failed(e.to_string());
            }
        };

        let new_pid = handle.last_known();
        let recorded = self
            .with_store(move |store| store.update_process_handle(id, new_pid))
            .await;
        if let Err(e) = recorded {
            error!(rule_id = %id, pid = handle.pid(), error = %e, "could not record new pid, stopping forwarder");
            if let Err(stop_err) = self.terminate(handle.last_known()).await {
                error!(pid = handle.pid(), error = %stop_err, "forwarder left running without a record");
            }
            return RuleReconciliation::Failed(e.to_string());
        }

        info!(rule_id = %id, spec = %rule.spec, pid = handle.pid(), "rule reactivated");
        RuleReconciliation::Respawned(handle.last_known())
    }

    /// Rules owned by `owner`, ordered by id.
    pub async fn list_rules_for_owner(&self, owner: UserId) -> KeeperResult<Vec<ForwardingRule>> {
        self.with_store(move |store| store.get_by_owner(owner)).await
    }

    /// Stop a forwarder this process supervises and wait until it has been
    /// reaped, all within the terminate timeout.
    async fn replace_supervised(&self, pid: LastKnownPid) -> Result<(), TerminationError> {
        let deadline = tokio::time::Instant::now() + self.timeouts.terminate;
        self.terminate(pid).await?;
        while self.launcher.supervises(pid) {
            if tokio::time::Instant::now() >= deadline {
                return Err(TerminationError::TimedOut(pid.get()));
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        debug!(%pid, "replaced forwarder exited");
        Ok(())
    }

    /// Run a store call on the blocking pool.
    async fn with_store<T, F>(&self, f: F) -> KeeperResult<T>
    where
        F: FnOnce(&dyn RuleStore) -> KeeperResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| KeeperError::Store(format!("store task failed: {e}")))?
    }

    /// Launch on the blocking pool under the launch timeout.
    ///
    /// If the timeout fires, the launch keeps running in the background; should
    /// it still succeed, the late forwarder is stopped so nothing untracked is
    /// left behind.
    async fn launch(&self, spec: ForwardSpec) -> Result<ProcessHandle, LaunchError> {
        let launcher = Arc::clone(&self.launcher);
        let mut task = tokio::task::spawn_blocking(move || launcher.launch(&spec));

        match tokio::time::timeout(self.timeouts.launch, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(LaunchError::SpawnFailed(format!(
                "launch task failed: {join_err}"
            ))),
            Err(_) => {
                let terminator = Arc::clone(&self.terminator);
                tokio::spawn(async move {
                    if let Ok(Ok(handle)) = task.await {
                        let pid = handle.last_known();
                        warn!(%pid, "stopping forwarder that started after its launch timed out");
                        match tokio::task::spawn_blocking(move || terminator.terminate(pid)).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => {
                                error!(%pid, error = %e, "forwarder left running without a rule")
                            }
                            Err(e) => {
                                error!(%pid, error = %e, "forwarder left running without a rule")
                            }
                        }
                    }
                });
                Err(LaunchError::SpawnFailed(format!(
                    "launch timed out after {:?}",
                    self.timeouts.launch
                )))
            }
        }
    }

    /// Terminate on the blocking pool under the terminate timeout.
    async fn terminate(&self, pid: LastKnownPid) -> Result<TerminationOutcome, TerminationError> {
        let terminator = Arc::clone(&self.terminator);
        let task = tokio::task::spawn_blocking(move || terminator.terminate(pid));

        match tokio::time::timeout(self.timeouts.terminate, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(TerminationError::Os {
                pid: pid.get(),
                reason: format!("terminate task failed: {join_err}"),
            }),
            Err(_) => Err(TerminationError::TimedOut(pid.get())),
        }
    }
}
