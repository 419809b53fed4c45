//! Daemon startup: wires the store, process control, lifecycle manager and
//! control server together.
//!
//! Order matters: accounts are bootstrapped and every stored rule is
//! reconciled before the control listener is bound, so no operator request
//! can race with startup reactivation.

use crate::auth::bootstrap_admin;
use crate::config::ServerConfig;
use crate::control::ControlServer;
use crate::manager::{ManagerTimeouts, ReconciliationReport, RuleManager};
use crate::process::{CommandLauncher, ProcessLauncher, ProcessTerminator, SignalTerminator};
use crate::store::{AccountStore, SqliteStateStore};
use portkeeper_core::{KeeperError, KeeperResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// A started daemon whose control listener is bound but not yet serving.
pub struct Daemon {
    control: ControlServer,
    listener: TcpListener,
    report: ReconciliationReport,
}

impl Daemon {
    /// Run the startup sequence with the real forwarder launcher/terminator.
    pub async fn start(config: ServerConfig) -> KeeperResult<Self> {
        let launcher = Arc::new(CommandLauncher::new(&config.forwarder));
        let terminator = Arc::new(SignalTerminator::new());
        Self::start_with(config, launcher, terminator).await
    }

    pub async fn start_with(
        config: ServerConfig,
        launcher: Arc<dyn ProcessLauncher>,
        terminator: Arc<dyn ProcessTerminator>,
    ) -> KeeperResult<Self> {
        let store = Arc::new(SqliteStateStore::open(&config.state_file)?);

        let admin = bootstrap_admin(store.as_ref(), &config.admin_user, &config.admin_password)?;
        info!(
            admin = %admin.user_id(),
            accounts = store.account_count()?,
            "accounts ready"
        );

        let manager = Arc::new(RuleManager::new(
            store.clone(),
            launcher,
            terminator,
            ManagerTimeouts {
                launch: config.forwarder.launch_timeout,
                terminate: config.forwarder.terminate_timeout,
            },
        ));

        let report = manager.reconcile_on_startup().await?;
        for (rule_id, reason) in &report.failed {
            warn!(rule_id = %rule_id, reason = %reason, "rule left inactive, it stays stored");
        }

        let listener = TcpListener::bind(config.control_addr).await.map_err(|e| {
            KeeperError::Other(format!("cannot bind control address {}: {e}", config.control_addr))
        })?;
        if !config.control_addr.ip().is_loopback() {
            warn!(addr = %config.control_addr, "control server is reachable from other hosts");
        }

        Ok(Self {
            control: ControlServer::new(manager, store),
            listener,
            report,
        })
    }

    pub fn local_addr(&self) -> KeeperResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    #[cfg(test)]
    pub fn reconciliation(&self) -> &ReconciliationReport {
        &self.report
    }

    /// Serve control requests until the future is dropped.
    pub async fn serve(self) {
        let addr = match self.local_addr() {
            Ok(addr) => addr.to_string(),
            Err(e) => format!("unknown ({e})"),
        };
        if self.report.is_clean() {
            info!(
                addr = %addr,
                reactivated = self.report.succeeded.len(),
                "portkeeperd ready"
            );
        } else {
            warn!(
                addr = %addr,
                reactivated = self.report.succeeded.len(),
                failed = self.report.failed.len(),
                "portkeeperd ready, some rules are inactive"
            );
        }
        self.control.serve(self.listener).await
    }
}
