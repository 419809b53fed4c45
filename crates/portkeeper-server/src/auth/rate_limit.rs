//! Sliding-window limiter for failed control-protocol logins.
//!
//! Only failures are recorded. Once a peer address has used up its budget
//! within the window, further requests from it are refused before the
//! password is even checked.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Default budget: 5 failed logins per minute per peer address.
pub const DEFAULT_MAX_FAILURES: u32 = 5;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct LoginRateLimiter {
    max_failures: u32,
    window: Duration,
    /// Peer address -> timestamps of its recent failures.
    failures: HashMap<IpAddr, Vec<Instant>>,
}

impl Default for LoginRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FAILURES, DEFAULT_WINDOW)
    }
}

impl LoginRateLimiter {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            max_failures,
            window,
            failures: HashMap::new(),
        }
    }

    /// Whether `ip` has exhausted its failure budget.
    pub fn is_blocked(&mut self, ip: IpAddr) -> bool {
        let cutoff = self.cutoff();
        match self.failures.get_mut(&ip) {
            Some(attempts) => {
                attempts.retain(|t| *t > cutoff);
                attempts.len() as u32 >= self.max_failures
            }
            None => false,
        }
    }

    pub fn record_failure(&mut self, ip: IpAddr) {
        let cutoff = self.cutoff();
        let attempts = self.failures.entry(ip).or_default();
        attempts.retain(|t| *t > cutoff);
        attempts.push(Instant::now());
    }

    /// A successful login wipes the peer's failure history.
    pub fn record_success(&mut self, ip: IpAddr) {
        self.failures.remove(&ip);
    }

    /// Drop peers with no failures left in the window.
    pub fn gc(&mut self) {
        let cutoff = self.cutoff();
        self.failures.retain(|_, attempts| {
            attempts.retain(|t| *t > cutoff);
            !attempts.is_empty()
        });
    }

    pub fn tracked_peers(&self) -> usize {
        self.failures.len()
    }

    fn cutoff(&self) -> Instant {
        Instant::now()
            .checked_sub(self.window)
            .unwrap_or_else(Instant::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const OTHER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    #[test]
    fn blocks_after_budget_is_spent() {
        let mut limiter = LoginRateLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(!limiter.is_blocked(PEER));
            limiter.record_failure(PEER);
        }
        assert!(limiter.is_blocked(PEER));
        assert!(!limiter.is_blocked(OTHER));
    }

    #[test]
    fn success_resets_history() {
        let mut limiter = LoginRateLimiter::new(2, Duration::from_secs(60));
        limiter.record_failure(PEER);
        limiter.record_success(PEER);
        limiter.record_failure(PEER);
        assert!(!limiter.is_blocked(PEER));
    }

    #[test]
    fn failures_expire_with_the_window() {
        let mut limiter = LoginRateLimiter::new(1, Duration::from_millis(30));
        limiter.record_failure(PEER);
        assert!(limiter.is_blocked(PEER));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!limiter.is_blocked(PEER));
        limiter.gc();
        assert_eq!(limiter.tracked_peers(), 0);
    }
}
