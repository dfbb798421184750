//! Keepalive supervision
//!
//! Each client gets a ping ticker in its write loop and a read deadline in its read loop.
//! Only a pong moves the deadline forward, so a peer that stops answering pings is reaped
//! on the first read after the deadline passes.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Default time allowed between pongs before a peer is considered dead
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(10);

/// Shortest pong wait accepted; keeps the ping interval non-zero
pub const MIN_PONG_WAIT: Duration = Duration::from_millis(10);

/// Ping/pong timing for one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pong_wait: Duration,
    ping_interval: Duration,
}

impl Keepalive {
    /// Create keepalive timing from the pong wait
    ///
    /// Pings go out at 90% of the pong wait so a healthy peer always has time to
    /// answer before its deadline. Waits shorter than [`MIN_PONG_WAIT`] are raised to it.
    pub fn new(pong_wait: Duration) -> Self {
        let pong_wait = pong_wait.max(MIN_PONG_WAIT);
        Self {
            pong_wait,
            ping_interval: pong_wait * 9 / 10,
        }
    }

    /// Time allowed between pongs
    pub fn pong_wait(&self) -> Duration {
        self.pong_wait
    }

    /// Time between pings
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// Ping ticker for the write loop, first tick one interval from now
    pub fn ping_ticker(&self) -> Interval {
        let period = self.ping_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Read deadline for the read loop, starting now
    pub fn read_deadline(&self) -> ReadDeadline {
        ReadDeadline {
            expires_at: Instant::now() + self.pong_wait,
            pong_wait: self.pong_wait,
        }
    }
}

impl Default for Keepalive {
    fn default() -> Self {
        Self::new(DEFAULT_PONG_WAIT)
    }
}

/// Point in time by which the next pong must arrive
#[derive(Debug, Clone, Copy)]
pub struct ReadDeadline {
    expires_at: Instant,
    pong_wait: Duration,
}

impl ReadDeadline {
    /// When the current deadline expires
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Push the deadline a full pong wait past now
    pub fn refresh(&mut self) {
        self.expires_at = Instant::now() + self.pong_wait;
    }
}
