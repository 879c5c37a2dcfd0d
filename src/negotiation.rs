//! Offer preconditions and gated ICE-restart recovery.
//!
//! Offer creation only proceeds from a quiescent link; any precondition
//! failure is a benign race (role flip, session already advanced) and
//! aborts silently. Transport recovery is an ICE restart gated by a
//! single-flight guard, a cooldown since the previous restart, the app
//! being foregrounded, and an attempt budget that resets whenever the
//! transport connects.

use crate::link::PeerLink;
use crate::types::NegotiationState;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Cooldown between ICE restarts
pub const RESTART_COOLDOWN: Duration = Duration::from_secs(10);

/// Restart attempts allowed between successful connections
pub const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Outcome of asking for an ICE restart slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartGate {
    /// Slot acquired; caller must invoke [`Negotiator::finish_restart`]
    Granted,
    /// Another restart is already in flight
    InFlight,
    /// Too soon after the previous restart
    Cooldown,
    /// App is backgrounded
    Background,
    /// Attempt budget exhausted; surface as connection lost
    Exhausted,
}

/// Negotiation-state bookkeeping for one session
pub struct Negotiator {
    restart_in_flight: AtomicBool,
    restart_attempts: AtomicU32,
    last_restart: Mutex<Option<Instant>>,
    cooldown: Duration,
    max_attempts: u32,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new(RESTART_COOLDOWN, MAX_RESTART_ATTEMPTS)
    }
}

impl Negotiator {
    /// Create a negotiator with explicit gating parameters
    #[must_use]
    pub fn new(cooldown: Duration, max_attempts: u32) -> Self {
        Self {
            restart_in_flight: AtomicBool::new(false),
            restart_attempts: AtomicU32::new(0),
            last_restart: Mutex::new(None),
            cooldown,
            max_attempts,
        }
    }

    /// Whether a fresh offer may be created on this link.
    ///
    /// Requires a stable negotiation state with no local or remote
    /// description applied. A remote description already present means
    /// the partner's offer won the race; skipping is the normal outcome,
    /// not an error.
    #[must_use]
    pub fn offer_preconditions_met(link: &PeerLink) -> bool {
        link.negotiation_state() == NegotiationState::Stable
            && !link.has_local_description()
            && !link.has_remote_description()
    }

    /// Try to acquire the restart slot
    pub fn begin_restart(&self, foregrounded: bool) -> RestartGate {
        if self.restart_attempts.load(Ordering::SeqCst) >= self.max_attempts {
            return RestartGate::Exhausted;
        }
        if !foregrounded {
            return RestartGate::Background;
        }
        if let Some(last) = *self.last_restart.lock() {
            if last.elapsed() < self.cooldown {
                return RestartGate::Cooldown;
            }
        }
        if self
            .restart_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return RestartGate::InFlight;
        }
        self.restart_attempts.fetch_add(1, Ordering::SeqCst);
        *self.last_restart.lock() = Some(Instant::now());
        RestartGate::Granted
    }

    /// Release the restart slot after the restart offer was handled
    pub fn finish_restart(&self) {
        self.restart_in_flight.store(false, Ordering::SeqCst);
    }

    /// Reset backoff state; called when the transport reaches connected
    pub fn reset(&self) {
        self.restart_attempts.store(0, Ordering::SeqCst);
        *self.last_restart.lock() = None;
    }

    /// Restart attempts used since the last reset
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.restart_attempts.load(Ordering::SeqCst)
    }
}
