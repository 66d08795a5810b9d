//! Liveness probing and round-trip latency.
//!
//! [`PingMonitor`] holds no timers of its own. The connection task asks it
//! for the next deadline, sleeps until then and calls [`PingMonitor::on_tick`]:
//!
//! ```text
//!  t0+I   no ping outstanding   → SendPing
//!  t0+2I  ping still unanswered → miss 1, SendPing again
//!  t0+3I  still unanswered      → miss 2, LivenessFailure
//!  any    Pong                  → latency, misses reset
//! ```
//!
//! Manual `ping()` calls are tracked separately by [`PingWaiters`] so a
//! slow manual ping never tears the socket down on its own.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::LinkError;

/// Default interval between periodic pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Default deadline for a manual ping.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive unanswered periodic pings that count as a dead peer.
pub const MAX_MISSED_PINGS: u32 = 2;

/// What the connection task must do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    SendPing(u64),
    LivenessFailure { missed: u32 },
}

#[derive(Debug)]
pub struct PingMonitor {
    epoch: Instant,
    interval: Duration,
    enabled: bool,
    next_tick: Option<Instant>,
    awaiting_since: Option<u64>,
    missed: u32,
    latency: Option<Duration>,
}

impl PingMonitor {
    pub fn new(interval: Duration, enabled: bool) -> Self {
        Self {
            epoch: Instant::now(),
            interval,
            enabled,
            next_tick: None,
            awaiting_since: None,
            missed: 0,
            latency: None,
        }
    }

    /// Milliseconds since this monitor was created, as sent on the wire.
    pub fn stamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Arm the periodic timer. No-op when pings are disabled.
    pub fn start(&mut self, now: Instant) {
        self.awaiting_since = None;
        self.missed = 0;
        self.next_tick = self.enabled.then(|| now + self.interval);
    }

    pub fn stop(&mut self) {
        self.next_tick = None;
        self.awaiting_since = None;
        self.missed = 0;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_tick
    }

    pub fn is_running(&self) -> bool {
        self.next_tick.is_some()
    }

    pub fn on_tick(&mut self, now: Instant) -> Option<TickAction> {
        self.next_tick?;
        if self.awaiting_since.is_some() {
            self.missed += 1;
            if self.missed >= MAX_MISSED_PINGS {
                let missed = self.missed;
                self.stop();
                return Some(TickAction::LivenessFailure { missed });
            }
        }
        let sent_at = self.stamp(now);
        self.awaiting_since = Some(sent_at);
        self.next_tick = Some(now + self.interval);
        Some(TickAction::SendPing(sent_at))
    }

    /// Record a pong and return the measured round trip.
    pub fn on_pong(&mut self, echo_of: u64, now: Instant) -> Duration {
        let sent = self.epoch + Duration::from_millis(echo_of);
        let latency = now.saturating_duration_since(sent);
        self.awaiting_since = None;
        self.missed = 0;
        self.latency = Some(latency);
        latency
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}

type PingReply = oneshot::Sender<Result<Duration, LinkError>>;

/// Outstanding manual `ping()` calls.
#[derive(Debug, Default)]
pub struct PingWaiters {
    waiters: Vec<(Instant, Duration, PingReply)>,
}

impl PingWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, now: Instant, timeout: Duration, reply: PingReply) {
        self.waiters.push((now + timeout, timeout, reply));
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.waiters.iter().map(|(deadline, _, _)| *deadline).min()
    }

    /// A pong answers every outstanding manual ping.
    pub fn resolve_all(&mut self, latency: Duration) {
        for (_, _, reply) in self.waiters.drain(..) {
            let _ = reply.send(Ok(latency));
        }
    }

    /// Reject waiters whose deadline has passed.
    pub fn expire(&mut self, now: Instant) {
        let mut kept = Vec::with_capacity(self.waiters.len());
        for (deadline, timeout, reply) in self.waiters.drain(..) {
            if deadline <= now {
                let _ = reply.send(Err(LinkError::PingTimeout(timeout)));
            } else {
                kept.push((deadline, timeout, reply));
            }
        }
        self.waiters = kept;
    }

    pub fn reject_all(&mut self, err: LinkError) {
        for (_, _, reply) in self.waiters.drain(..) {
            let _ = reply.send(Err(err.clone()));
        }
    }
}
