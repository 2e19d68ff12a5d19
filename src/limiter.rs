//! Identify rate limiting
//!
//! One limiter is shared by every shard of a manager. It enforces the
//! platform limits together:
//!
//! - at most `max_concurrency` tickets outstanding, where a ticket is held
//!   from grant until its shard leaves `Identifying`;
//! - at most `max_concurrency` identifies started inside any rolling window;
//! - the per-epoch `session_start_limit` budget.
//!
//! Outstanding tickets are counted by a fair semaphore. The window state
//! sits behind a single async mutex that is held while a caller waits for
//! capacity, so acquires are evaluated one at a time and granted in
//! arrival order.

use crate::error::GatewayError;
use crate::rest::SessionStartLimit;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Permission for exactly one identify attempt
///
/// Not `Clone`. While a ticket is alive it occupies one of the
/// `max_concurrency` identify slots; dropping it frees the slot.
#[derive(Debug)]
#[must_use = "an unused ticket still counts against the identify window"]
pub struct IdentifyTicket {
    shard_id: u32,
    granted_at: Instant,
    _slot: OwnedSemaphorePermit,
}

impl IdentifyTicket {
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }

    /// Give the identify slot back once the shard is done identifying
    pub fn release(self) {
        debug!(
            shard_id = self.shard_id,
            held_ms = self.granted_at.elapsed().as_millis() as u64,
            "Identify ticket released"
        );
    }
}

#[derive(Debug)]
struct Window {
    max_concurrency: usize,
    /// Grants still inside the rolling window, oldest first
    grants: VecDeque<Instant>,
    total: u32,
    remaining: u32,
    reset_after: Duration,
    /// When the epoch budget refills; starts at the first grant of an epoch
    epoch_reset_at: Option<Instant>,
}

enum Decision {
    Grant,
    WaitUntil(Instant),
    Exhausted,
}

impl Window {
    fn evaluate(&mut self, now: Instant, window: Duration) -> Decision {
        if let Some(reset_at) = self.epoch_reset_at {
            if now >= reset_at {
                info!(total = self.total, "Identify budget epoch reset");
                self.remaining = self.total;
                self.epoch_reset_at = None;
            }
        }

        if self.remaining == 0 {
            return match self.epoch_reset_at {
                Some(reset_at) => Decision::WaitUntil(reset_at),
                None => Decision::Exhausted,
            };
        }

        while let Some(oldest) = self.grants.front() {
            if now.duration_since(*oldest) >= window {
                self.grants.pop_front();
            } else {
                break;
            }
        }

        if self.grants.len() < self.max_concurrency {
            Decision::Grant
        } else {
            match self.grants.front() {
                Some(oldest) => Decision::WaitUntil(*oldest + window),
                None => Decision::Grant,
            }
        }
    }

    fn grant(&mut self, now: Instant) {
        if self.epoch_reset_at.is_none() && !self.reset_after.is_zero() {
            self.epoch_reset_at = Some(now + self.reset_after);
        }
        self.remaining -= 1;
        self.grants.push_back(now);
    }
}

/// Shared identify gate
#[derive(Debug)]
pub struct IdentifyLimiter {
    window: Duration,
    slots: Arc<Semaphore>,
    state: Mutex<Window>,
}

impl IdentifyLimiter {
    /// `window` is the rolling interval in which `max_concurrency`
    /// identifies may start.
    pub fn new(limit: SessionStartLimit, window: Duration) -> Self {
        let now = Instant::now();
        let epoch_reset_at = (limit.remaining == 0 && !limit.reset_after.is_zero())
            .then(|| now + limit.reset_after);
        let max_concurrency = limit.max_concurrency.max(1) as usize;

        Self {
            window,
            slots: Arc::new(Semaphore::new(max_concurrency)),
            state: Mutex::new(Window {
                max_concurrency,
                grants: VecDeque::new(),
                total: limit.total,
                remaining: limit.remaining,
                reset_after: limit.reset_after,
                epoch_reset_at,
            }),
        }
    }

    /// Block until an identify may be sent.
    ///
    /// Nothing is consumed unless a ticket is returned, so a cancelled
    /// acquire leaves the window and the slots untouched.
    pub async fn acquire(
        &self,
        shard_id: u32,
        cancel: &CancellationToken,
    ) -> Result<IdentifyTicket, GatewayError> {
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            slot = Arc::clone(&self.slots).acquire_owned() => {
                slot.map_err(|_| GatewayError::Cancelled)?
            }
        };

        let mut state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            guard = self.state.lock() => guard,
        };

        loop {
            let now = Instant::now();
            match state.evaluate(now, self.window) {
                Decision::Grant => {
                    state.grant(now);
                    debug!(
                        shard_id,
                        remaining = state.remaining,
                        in_window = state.grants.len(),
                        "Identify ticket granted"
                    );
                    return Ok(IdentifyTicket {
                        shard_id,
                        granted_at: now,
                        _slot: slot,
                    });
                }
                Decision::WaitUntil(deadline) => {
                    debug!(
                        shard_id,
                        wait_ms = deadline.saturating_duration_since(now).as_millis() as u64,
                        "Waiting for identify window"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                        _ = sleep_until(deadline) => {}
                    }
                }
                Decision::Exhausted => {
                    warn!(shard_id, total = state.total, "Identify budget exhausted with no reset");
                    return Err(GatewayError::LimitExhausted);
                }
            }
        }
    }

    /// Identifies left in the current epoch
    pub async fn remaining(&self) -> u32 {
        self.state.lock().await.remaining
    }

    /// Slots not held by an outstanding ticket
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}
