//! Glare detection and resolution (RFC 3261 §14.1)
//!
//! Glare happens when both peers send a session modification at the same
//! time. Each side rejects the other's request with 491 Request Pending and
//! neither negotiated description changes. The side whose own request was
//! rejected waits a randomized interval before retrying; the interval ranges
//! differ for the Call-ID owner and the other party so that the retries do not
//! collide again.
//!
//! ```text
//! Alice (owner)                 Bob
//!   |-- re-INVITE ------------->|
//!   |<------------- re-INVITE --|
//!   |-- 491 ------------------->|
//!   |<------------------- 491 --|
//!   |   wait 2.1-4.0 s          |   wait 0-2.0 s
//!   |                           |-- re-INVITE (retry) -->
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::GlareBackoffConfig;
use crate::message::InboundMessage;
use crate::session::ModificationKind;
use crate::types::{Method, Sdp};

/// A modification to resend once the backoff expires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlareRetry {
    pub kind: ModificationKind,
    pub offer: Sdp,
    pub contact: Option<String>,
}

/// Detects renegotiation collisions and schedules the retry
#[derive(Debug, Clone)]
pub struct GlareResolver {
    backoff: GlareBackoffConfig,
    call_id_owner: bool,
    retry: Option<GlareRetry>,
    scheduled: Option<Duration>,
    collisions: u32,
}

impl GlareResolver {
    pub fn new(backoff: GlareBackoffConfig, call_id_owner: bool) -> Self {
        Self {
            backoff,
            call_id_owner,
            retry: None,
            scheduled: None,
            collisions: 0,
        }
    }

    /// An incoming request collides when it tries to modify the session while
    /// our own modification is outstanding.
    pub fn is_collision(local_outstanding: bool, message: &InboundMessage) -> bool {
        if !local_outstanding {
            return false;
        }
        match message {
            InboundMessage::Request { method: Method::Invite, .. } => true,
            InboundMessage::Request { method: Method::Update, body, .. } => body.offer().is_some(),
            _ => false,
        }
    }

    /// Our modification was rejected with 491. Keeps the retry and returns the
    /// backoff to wait before resending it.
    pub fn on_rejected(&mut self, retry: GlareRetry) -> Duration {
        self.collisions += 1;
        self.retry = Some(retry);
        let delay = self.backoff();
        self.scheduled = Some(delay);
        debug!(
            collisions = self.collisions,
            owner = self.call_id_owner,
            backoff_ms = delay.as_millis() as u64,
            "glare detected, backing off"
        );
        delay
    }

    /// Pick a random delay from the configured range
    pub fn backoff(&self) -> Duration {
        let (min, max) = self.backoff.range(self.call_id_owner);
        let min_ms = min.as_millis() as u64;
        let max_ms = max.as_millis() as u64;
        if min_ms >= max_ms {
            return min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
    }

    /// Backoff chosen for the pending retry
    pub fn scheduled_backoff(&self) -> Option<Duration> {
        self.scheduled
    }

    pub fn take_retry(&mut self) -> Option<GlareRetry> {
        self.scheduled = None;
        self.retry.take()
    }

    pub fn retry(&self) -> Option<&GlareRetry> {
        self.retry.as_ref()
    }

    pub fn has_retry(&self) -> bool {
        self.retry.is_some()
    }

    /// Swap the description of a pending retry. Returns false if none is pending.
    pub fn replace_offer(&mut self, offer: Sdp) -> bool {
        match &mut self.retry {
            Some(retry) => {
                retry.offer = offer;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.retry = None;
        self.scheduled = None;
    }

    /// Number of 491 rejections seen over the session lifetime
    pub fn collisions(&self) -> u32 {
        self.collisions
    }

    pub fn is_call_id_owner(&self) -> bool {
        self.call_id_owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Body;

    fn retry(offer: &str) -> GlareRetry {
        GlareRetry {
            kind: ModificationKind::Reinvite,
            offer: Sdp::from(offer),
            contact: None,
        }
    }

    #[test]
    fn test_collision_detection() {
        let reinvite = InboundMessage::request(Method::Invite, Body::Offer(Sdp::from("x")));
        let update_offer = InboundMessage::request(Method::Update, Body::Offer(Sdp::from("x")));
        let update_refresh = InboundMessage::request(Method::Update, Body::None);
        let info = InboundMessage::request(Method::Info, Body::None);

        assert!(GlareResolver::is_collision(true, &reinvite));
        assert!(GlareResolver::is_collision(true, &update_offer));
        assert!(!GlareResolver::is_collision(true, &update_refresh));
        assert!(!GlareResolver::is_collision(true, &info));
        assert!(!GlareResolver::is_collision(false, &reinvite));
    }

    #[test]
    fn test_backoff_within_owner_range() {
        let resolver = GlareResolver::new(GlareBackoffConfig::default(), true);
        for _ in 0..50 {
            let delay = resolver.backoff();
            assert!(delay >= Duration::from_millis(2100) && delay <= Duration::from_millis(4000));
        }
    }

    #[test]
    fn test_backoff_within_non_owner_range() {
        let resolver = GlareResolver::new(GlareBackoffConfig::default(), false);
        for _ in 0..50 {
            assert!(resolver.backoff() <= Duration::from_millis(2000));
        }
    }

    #[test]
    fn test_retry_kept_until_taken() {
        let mut resolver =
            GlareResolver::new(GlareBackoffConfig::fixed(Duration::from_millis(300)), true);
        assert_eq!(resolver.on_rejected(retry("a")), Duration::from_millis(300));
        assert!(resolver.has_retry());
        assert_eq!(resolver.scheduled_backoff(), Some(Duration::from_millis(300)));
        assert!(resolver.replace_offer(Sdp::from("b")));
        assert_eq!(resolver.take_retry(), Some(retry("b")));
        assert!(!resolver.has_retry());
        assert_eq!(resolver.scheduled_backoff(), None);
        assert!(!resolver.replace_offer(Sdp::from("c")));
        assert_eq!(resolver.collisions(), 1);
    }
}
