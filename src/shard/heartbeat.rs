//! Heartbeat acknowledgement tracking

use tokio::time::{Duration, Instant};

/// What to do on a heartbeat tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Send,
    /// Too many acks missed; the connection is a zombie
    Stale,
}

/// Counts consecutive heartbeats that went unacknowledged
#[derive(Debug)]
pub struct HeartbeatMonitor {
    miss_threshold: u32,
    missed: u32,
    sent_at: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(miss_threshold: u32) -> Self {
        Self {
            miss_threshold: miss_threshold.max(1),
            missed: 0,
            sent_at: None,
        }
    }

    /// Called when the interval elapses, before sending
    pub fn on_tick(&mut self) -> HeartbeatAction {
        if self.sent_at.is_some() {
            self.missed += 1;
            if self.missed >= self.miss_threshold {
                return HeartbeatAction::Stale;
            }
        }
        HeartbeatAction::Send
    }

    pub fn on_sent(&mut self, now: Instant) {
        self.sent_at = Some(now);
    }

    /// Returns the round-trip latency of the acknowledged heartbeat
    pub fn on_ack(&mut self, now: Instant) -> Option<Duration> {
        self.missed = 0;
        self.sent_at.take().map(|sent| now.duration_since(sent))
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}
