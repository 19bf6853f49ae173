//! Reconnection policy.
//!
//! ```text
//! Connected ──error──► Disconnected ──► Backoff ──connect──► Connected
//!                                          ▲          │fail
//!                                          └──────────┘
//! ```
//!
//! Delays grow exponentially from `initial_backoff` up to `max_backoff`, with
//! random jitter. The delay only resets once a connection has delivered
//! frames for `stable_period`, so a relay that accepts connections and then
//! drops them immediately keeps backing off.

use std::time::{Duration, Instant};

use rand::Rng;

/// Backoff settings.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random (0.2 = ±20%).
    pub jitter: f64,
    /// Frame consumption needed before the backoff resets.
    pub stable_period: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            stable_period: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based). `jitter_sample` is in
    /// `[-1.0, 1.0]` and scales the jitter fraction.
    pub fn delay(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let base = self.initial_backoff.as_secs_f64()
            * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jittered = capped * (1.0 + self.jitter * jitter_sample.clamp(-1.0, 1.0));
        Duration::from_secs_f64(jittered.clamp(0.0, self.max_backoff.as_secs_f64()))
    }
}

/// Where the connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Backoff,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Backoff => "backoff",
        }
    }
}

/// Reconnection bookkeeping. Every method takes the current time so the
/// transitions are testable without sleeping.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempt: u32,
    failed_attempts: u64,
    connected_at: Option<Instant>,
    disconnected_at: Option<Instant>,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy, now: Instant) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempt: 0,
            failed_attempts: 0,
            connected_at: None,
            disconnected_at: Some(now),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Failed or dropped connections since startup.
    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts
    }

    /// Consecutive attempts counted toward the current backoff.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn on_connected(&mut self, now: Instant) {
        self.state = ConnectionState::Connected;
        self.connected_at = Some(now);
        self.disconnected_at = None;
    }

    /// A frame arrived; resets the backoff once the connection is stable.
    pub fn on_frame(&mut self, now: Instant) {
        if self.attempt > 0
            && let Some(since) = self.connected_at
            && now.saturating_duration_since(since) >= self.policy.stable_period
        {
            self.attempt = 0;
        }
    }

    /// The connection attempt failed or an open connection dropped.
    pub fn on_disconnected(&mut self, now: Instant) {
        self.state = ConnectionState::Disconnected;
        self.failed_attempts += 1;
        self.connected_at = None;
        self.disconnected_at.get_or_insert(now);
    }

    /// Enter backoff and return how long to wait, with a random jitter.
    pub fn next_delay(&mut self) -> Duration {
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.next_delay_with(sample)
    }

    /// [`next_delay`](Self::next_delay) with a fixed jitter sample.
    pub fn next_delay_with(&mut self, jitter_sample: f64) -> Duration {
        self.state = ConnectionState::Backoff;
        let delay = self.policy.delay(self.attempt, jitter_sample);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Time since the stream was last connected; zero while connected.
    pub fn outage(&self, now: Instant) -> Duration {
        self.disconnected_at
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default()
    }
}
