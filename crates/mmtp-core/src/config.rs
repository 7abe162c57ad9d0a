use std::time::Duration;

use crate::{BroadcastOptions, MaritimeId};

/// Back-off schedule for re-establishing a dropped transport.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Ceiling for the exponential growth.
    pub max: Duration,
    /// Proportional jitter, 0.0..=1.0. A value of 0.25 spreads each delay
    /// over ±25% of its nominal value.
    pub jitter: f64,
    /// Give up after this many consecutive failed attempts. `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            jitter: 0.25,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// The delay before attempt number `attempt` (0-based), doubled per
    /// attempt up to `max`, spread by `jitter` using `random` in [0, 1).
    #[must_use]
    pub fn delay_for(&self, attempt: u32, random: f64) -> Duration {
        let nominal = self
            .initial
            .saturating_mul(2u32.saturating_pow(attempt.min(31)))
            .min(self.max);
        let spread = (2.0 * random - 1.0) * self.jitter.clamp(0.0, 1.0);
        nominal.mul_f64((1.0 + spread).max(0.0)).min(self.max)
    }

    #[must_use]
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Everything the engine needs to know about one client, minus the
/// position supplier (which is a closure and lives with the runtime).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Identity announced in the hello frame. Required.
    pub local_id: MaritimeId,
    /// Server to connect to: a bare `host[:port]` or a full `ws://`/`wss://`
    /// URL.
    pub host: String,
    pub reconnect: ReconnectPolicy,
    /// Interval between transport-level keep-alive pings.
    pub keep_alive_interval: Duration,
    /// Interval between position reports.
    pub position_interval: Duration,
    /// Budget for transport open plus the welcome/hello/connected exchange.
    pub handshake_timeout: Duration,
    pub default_broadcast_options: BroadcastOptions,
}

impl ClientConfig {
    #[must_use]
    pub fn new(local_id: MaritimeId, host: impl Into<String>) -> Self {
        Self {
            local_id,
            host: host.into(),
            reconnect: ReconnectPolicy::default(),
            keep_alive_interval: Duration::from_secs(30),
            position_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(10),
            default_broadcast_options: BroadcastOptions::default(),
        }
    }

    /// The WebSocket URL to dial.
    #[must_use]
    pub fn url(&self) -> String {
        if self.host.starts_with("ws://") || self.host.starts_with("wss://") {
            self.host.clone()
        } else {
            format!("ws://{}/", self.host)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ReconnectPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            jitter: 0.0,
            max_attempts: None,
        };
        assert_eq!(policy.delay_for(0, 0.5), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1, 0.5), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, 0.5), Duration::from_millis(800));
        assert_eq!(policy.delay_for(20, 0.5), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_the_configured_proportion() {
        let policy = ReconnectPolicy {
            initial: Duration::from_millis(1000),
            max: Duration::from_secs(60),
            jitter: 0.25,
            max_attempts: None,
        };
        let lo = policy.delay_for(0, 0.0);
        let hi = policy.delay_for(0, 0.9999);
        assert!(lo >= Duration::from_millis(750), "{lo:?}");
        assert!(hi <= Duration::from_millis(1250), "{hi:?}");
    }

    #[test]
    fn attempt_budget() {
        let policy = ReconnectPolicy {
            max_attempts: Some(3),
            ..ReconnectPolicy::default()
        };
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
        assert!(!ReconnectPolicy::default().exhausted(u32::MAX));
    }

    #[test]
    fn url_derivation() {
        let cfg = ClientConfig::new(MaritimeId::mmsi(1), "localhost:43234");
        assert_eq!(cfg.url(), "ws://localhost:43234/");
        let cfg = ClientConfig::new(MaritimeId::mmsi(1), "wss://mms.example.net/");
        assert_eq!(cfg.url(), "wss://mms.example.net/");
    }
}
