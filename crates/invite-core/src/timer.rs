//! Session-level timers
//!
//! The session core never sleeps. It asks its host to arm a timer by queueing a
//! [`SessionAction::ArmTimer`](crate::actions::SessionAction::ArmTimer) and is
//! told about expiry through a [`TimerFire`] event. Every arming bumps a
//! generation counter, so a fire that raced with a cancellation or a re-arm is
//! recognised as stale and dropped.
//!
//! # Timer kinds
//!
//! - **Retransmit**: resend a 2xx to an INVITE until the ACK arrives
//! - **Glare**: randomized backoff after our re-offer was rejected with 491
//! - **SessionRefresh**: we are the refresher and a refresh is due
//! - **SessionExpiry**: the peer is the refresher and its refresh is overdue

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identity of a session timer
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum TimerKind {
    Retransmit,
    Glare,
    SessionRefresh,
    SessionExpiry,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerKind::Retransmit => "retransmit",
            TimerKind::Glare => "glare",
            TimerKind::SessionRefresh => "session-refresh",
            TimerKind::SessionExpiry => "session-expiry",
        };
        f.write_str(name)
    }
}

/// A timer expiry delivered back to the session
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct TimerFire {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Book-keeping for the timers a session currently has armed
#[derive(Debug, Clone, Default)]
pub struct TimerSet {
    armed: HashMap<TimerKind, (u64, Duration)>,
    next_generation: u64,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new arming; any previous arming of the same kind is superseded.
    pub fn arm(&mut self, kind: TimerKind, after: Duration) -> TimerFire {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.armed.insert(kind, (generation, after));
        TimerFire { kind, generation }
    }

    /// Forget an arming. Returns whether the timer was armed.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.armed.remove(&kind).is_some()
    }

    /// Consume a fire if it matches the current arming (timers are one-shot)
    pub fn accept(&mut self, fire: &TimerFire) -> bool {
        match self.armed.get(&fire.kind) {
            Some((generation, _)) if *generation == fire.generation => {
                self.armed.remove(&fire.kind);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Duration of the current arming of `kind`
    pub fn interval(&self, kind: TimerKind) -> Option<Duration> {
        self.armed.get(&kind).map(|(_, after)| *after)
    }

    pub fn armed_kinds(&self) -> Vec<TimerKind> {
        self.armed.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_accepted_once() {
        let mut timers = TimerSet::new();
        let fire = timers.arm(TimerKind::Retransmit, Duration::from_millis(500));
        assert!(timers.is_armed(TimerKind::Retransmit));
        assert!(timers.accept(&fire));
        assert!(!timers.accept(&fire));
        assert!(!timers.is_armed(TimerKind::Retransmit));
    }

    #[test]
    fn test_rearm_makes_old_fire_stale() {
        let mut timers = TimerSet::new();
        let first = timers.arm(TimerKind::Glare, Duration::from_secs(2));
        let second = timers.arm(TimerKind::Glare, Duration::from_secs(3));
        assert_ne!(first.generation, second.generation);
        assert!(!timers.accept(&first));
        assert_eq!(timers.interval(TimerKind::Glare), Some(Duration::from_secs(3)));
        assert!(timers.accept(&second));
    }

    #[test]
    fn test_cancelled_fire_is_stale() {
        let mut timers = TimerSet::new();
        let fire = timers.arm(TimerKind::SessionRefresh, Duration::from_secs(900));
        assert!(timers.cancel(TimerKind::SessionRefresh));
        assert!(!timers.cancel(TimerKind::SessionRefresh));
        assert!(!timers.accept(&fire));
        assert!(timers.is_empty());
    }
}
