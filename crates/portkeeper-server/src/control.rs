//! Control server: accepts operator connections and dispatches requests to
//! the rule manager.
//!
//! Each connection carries length-prefixed CBOR frames. Every
//! [`ControlRequest`] is authenticated on its own and answered with exactly
//! one [`ControlResponse`] frame.

use crate::auth::{authenticate, LoginRateLimiter};
use crate::manager::RuleManager;
use crate::store::AccountStore;
use portkeeper_core::messages::PROTOCOL_VERSION;
use portkeeper_core::{
    frame_encode, ControlRequest, ControlResponse, ErrorKind, FrameDecoder, KeeperError,
    KeeperResult, Operation, UserId,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Connections idle for longer than this are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ControlServer {
    manager: Arc<RuleManager>,
    accounts: Arc<dyn AccountStore>,
    rate_limits: Arc<Mutex<LoginRateLimiter>>,
}

impl ControlServer {
    pub fn new(manager: Arc<RuleManager>, accounts: Arc<dyn AccountStore>) -> Self {
        Self {
            manager,
            accounts,
            rate_limits: Arc::new(Mutex::new(LoginRateLimiter::default())),
        }
    }

    /// Accept connections on `listener` until the task is dropped.
    pub async fn serve(self, listener: TcpListener) {
        let server = Arc::new(self);

        let gc_limits = server.rate_limits.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let mut limits = gc_limits.lock().await;
                limits.gc();
                debug!(tracked_peers = limits.tracked_peers(), "login limiter pruned");
            }
        });

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "control connection accepted");
                    let srv = server.clone();
                    tokio::spawn(async move {
                        if let Err(e) = srv.handle_connection(stream, peer).await {
                            warn!(peer = %peer, error = %e, "control connection error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    // Back off so a persistent error (e.g. EMFILE) does not spin.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> KeeperResult<()> {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 8192];

        loop {
            let n = match tokio::time::timeout(IDLE_TIMEOUT, stream.read(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => {
                    debug!(peer = %peer, "control connection idle, closing");
                    return Ok(());
                }
            };
            if n == 0 {
                if decoder.pending() > 0 {
                    debug!(peer = %peer, pending = decoder.pending(), "peer closed mid-frame");
                }
                return Ok(());
            }

            let requests: Vec<ControlRequest> = match decoder.feed(&buf[..n]) {
                Ok(requests) => requests,
                Err(e) => {
                    // The stream cannot be resynchronised after a bad frame.
                    let response = ControlResponse::Error {
                        kind: ErrorKind::Protocol,
                        message: e.to_string(),
                    };
                    stream.write_all(&frame_encode(&response)?).await?;
                    return Err(e);
                }
            };

            for request in requests {
                let response = self.handle_request(peer.ip(), request).await;
                stream.write_all(&frame_encode(&response)?).await?;
            }
        }
    }

    /// Authenticate and execute one request.
    pub async fn handle_request(&self, peer: IpAddr, request: ControlRequest) -> ControlResponse {
        if request.version != PROTOCOL_VERSION {
            return ControlResponse::Error {
                kind: ErrorKind::Protocol,
                message: format!(
                    "unsupported protocol version {} (server speaks {PROTOCOL_VERSION})",
                    request.version
                ),
            };
        }

        let user = match self.login(peer, &request).await {
            Ok(user) => user,
            Err(e) => return ControlResponse::error(&e),
        };

        match self.dispatch(user, request.operation).await {
            Ok(response) => response,
            Err(e) => {
                debug!(user = %user, error = %e, "request failed");
                ControlResponse::error(&e)
            }
        }
    }

    async fn login(&self, peer: IpAddr, request: &ControlRequest) -> KeeperResult<UserId> {
        if self.rate_limits.lock().await.is_blocked(peer) {
            warn!(peer = %peer, "too many failed logins, refusing request");
            return Err(KeeperError::RateLimited);
        }

        // Hash verification runs on the blocking pool without the limiter
        // lock, so one slow login does not hold up other peers.
        let accounts = Arc::clone(&self.accounts);
        let credentials = request.credentials.clone();
        let result =
            tokio::task::spawn_blocking(move || authenticate(accounts.as_ref(), &credentials))
                .await
                .map_err(|e| KeeperError::Other(format!("login task failed: {e}")))?;

        let mut limits = self.rate_limits.lock().await;
        match result {
            Ok(user) => {
                limits.record_success(peer);
                Ok(user)
            }
            Err(e) => {
                if matches!(e, KeeperError::AuthFailed(_)) {
                    limits.record_failure(peer);
                    warn!(peer = %peer, username = %request.credentials.username, "login failed");
                }
                Err(e)
            }
        }
    }

    async fn dispatch(&self, user: UserId, operation: Operation) -> KeeperResult<ControlResponse> {
        match operation {
            Operation::CreateRule(params) => {
                let rule = self.manager.create_rule(&params, user).await?;
                Ok(ControlResponse::RuleCreated { rule })
            }
            Operation::DeleteRule { rule_id } => {
                let outcome = self.manager.delete_rule(rule_id, user).await?;
                Ok(ControlResponse::RuleDeleted {
                    rule_id,
                    warning: outcome.warning().map(str::to_string),
                })
            }
            Operation::ListRules => {
                let rules = self.manager.list_rules_for_owner(user).await?;
                Ok(ControlResponse::Rules { rules })
            }
        }
    }
}
