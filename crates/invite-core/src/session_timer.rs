//! Session timer negotiation (RFC 4028)
//!
//! Tracks the negotiated session interval and which side refreshes. After
//! every successful negotiation the session arms either a refresh timer (we
//! refresh at half the interval) or an expiry watchdog (the peer must refresh
//! before `interval - min(32s, interval/3)`).
//!
//! The `refresher` parameter on the wire is relative to the transaction that
//! carried it; this module translates it to [`Refresher::Local`] or
//! [`Refresher::Remote`] as soon as it is seen.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{RefresherPreference, SessionTimerSettings};
use crate::timer::TimerKind;
use crate::types::{RefresherRole, SessionExpires};

/// Which peer keeps the session alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Refresher {
    Local,
    Remote,
}

/// Negotiated session timer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimerConfig {
    pub interval: Duration,
    pub refresher: Refresher,
    /// Negotiation number this configuration came from
    pub sequence: u32,
}

impl SessionTimerConfig {
    pub fn is_local_refresher(&self) -> bool {
        self.refresher == Refresher::Local
    }
}

/// Negotiates and tracks the session interval and refresher
#[derive(Debug, Clone)]
pub struct SessionTimerNegotiator {
    settings: SessionTimerSettings,
    negotiated: Option<SessionTimerConfig>,
    sequence: u32,
}

impl SessionTimerNegotiator {
    pub fn new(settings: SessionTimerSettings) -> Self {
        Self {
            settings,
            negotiated: None,
            sequence: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Session-Expires for a request we send (initial INVITE or refresh)
    pub fn request_value(&self) -> Option<SessionExpires> {
        if !self.settings.enabled {
            return None;
        }
        let (delta_seconds, refresher) = match &self.negotiated {
            // keep the current arrangement; we are the UAC of this request
            Some(current) => (
                current.interval.as_secs() as u32,
                match current.refresher {
                    Refresher::Local => RefresherRole::Uac,
                    Refresher::Remote => RefresherRole::Uas,
                },
            ),
            None => (
                self.settings.session_expires_secs,
                match self.settings.preferred_refresher {
                    RefresherPreference::Local => RefresherRole::Uac,
                    RefresherPreference::Remote => RefresherRole::Uas,
                },
            ),
        };
        Some(SessionExpires::new(delta_seconds).with_refresher(refresher))
    }

    /// Check a received Session-Expires against our Min-SE.
    /// `Err(min_se)` means the request must be rejected with 422.
    pub fn check_request(&self, value: Option<&SessionExpires>) -> Result<(), u32> {
        match value {
            Some(se) if self.settings.enabled && se.delta_seconds < self.settings.min_se_secs => {
                Err(self.settings.min_se_secs)
            }
            _ => Ok(()),
        }
    }

    /// We answered a request with 2xx: fix the negotiated values and return
    /// the Session-Expires to put in the response.
    pub fn answer_request(&mut self, requested: Option<SessionExpires>) -> Option<SessionExpires> {
        self.sequence += 1;
        let requested = match requested {
            Some(se) if self.settings.enabled => se,
            _ => {
                self.negotiated = None;
                return None;
            }
        };

        let delta_seconds = requested
            .delta_seconds
            .min(self.settings.session_expires_secs)
            .max(self.settings.min_se_secs);

        // we are the UAS of this transaction
        let role = requested.refresher.unwrap_or(match self.settings.preferred_refresher {
            RefresherPreference::Local => RefresherRole::Uas,
            RefresherPreference::Remote => RefresherRole::Uac,
        });
        let refresher = match role {
            RefresherRole::Uas => Refresher::Local,
            RefresherRole::Uac => Refresher::Remote,
        };

        self.set(delta_seconds, refresher);
        Some(SessionExpires::new(delta_seconds).with_refresher(role))
    }

    /// A 2xx to our request arrived: adopt its Session-Expires
    pub fn apply_response(&mut self, value: Option<SessionExpires>) {
        self.sequence += 1;
        match value {
            Some(se) if self.settings.enabled => {
                // we are the UAC of this transaction
                let refresher = match se.refresher {
                    Some(RefresherRole::Uas) => Refresher::Remote,
                    Some(RefresherRole::Uac) | None => Refresher::Local,
                };
                let delta_seconds = se.delta_seconds.max(self.settings.min_se_secs);
                if delta_seconds != se.delta_seconds {
                    warn!(
                        offered_secs = se.delta_seconds,
                        min_se_secs = self.settings.min_se_secs,
                        "Session-Expires in 2xx below Min-SE, raising it"
                    );
                }
                self.set(delta_seconds, refresher);
            }
            _ => {
                debug!(sequence = self.sequence, "no Session-Expires in response, session timer off");
                self.negotiated = None;
            }
        }
    }

    fn set(&mut self, delta_seconds: u32, refresher: Refresher) {
        debug!(
            interval_secs = delta_seconds,
            refresher = ?refresher,
            sequence = self.sequence,
            "session timer negotiated"
        );
        self.negotiated = Some(SessionTimerConfig {
            interval: Duration::from_secs(delta_seconds as u64),
            refresher,
            sequence: self.sequence,
        });
    }

    pub fn current(&self) -> Option<SessionTimerConfig> {
        self.negotiated
    }

    /// Number of negotiations seen so far
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Whether a configuration came from the latest negotiation
    pub fn is_current(&self, config: &SessionTimerConfig) -> bool {
        config.sequence == self.sequence
    }

    /// Timer to arm after the latest negotiation
    pub fn next_timer(&self) -> Option<(TimerKind, Duration)> {
        let current = self.negotiated?;
        match current.refresher {
            Refresher::Local => Some((TimerKind::SessionRefresh, current.interval / 2)),
            Refresher::Remote => {
                let margin = (current.interval / 3).min(Duration::from_secs(32));
                Some((TimerKind::SessionExpiry, current.interval - margin))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiator() -> SessionTimerNegotiator {
        SessionTimerNegotiator::new(SessionTimerSettings::default())
    }

    #[test]
    fn test_request_value_uses_preference() {
        let n = negotiator();
        assert_eq!(
            n.request_value(),
            Some(SessionExpires::new(1800).with_refresher(RefresherRole::Uac))
        );

        let disabled = SessionTimerNegotiator::new(SessionTimerSettings {
            enabled: false,
            ..Default::default()
        });
        assert_eq!(disabled.request_value(), None);
    }

    #[test]
    fn test_min_se_check() {
        let n = negotiator();
        assert_eq!(n.check_request(Some(&SessionExpires::new(60))), Err(90));
        assert_eq!(n.check_request(Some(&SessionExpires::new(90))), Ok(()));
        assert_eq!(n.check_request(None), Ok(()));
    }

    #[test]
    fn test_answer_request_honours_peer_refresher() {
        let mut n = negotiator();
        let response = n
            .answer_request(Some(SessionExpires::new(600).with_refresher(RefresherRole::Uac)))
            .unwrap();
        assert_eq!(response, SessionExpires::new(600).with_refresher(RefresherRole::Uac));
        let current = n.current().unwrap();
        assert_eq!(current.refresher, Refresher::Remote);
        assert_eq!(current.interval, Duration::from_secs(600));
        assert_eq!(current.sequence, 1);
        assert!(n.is_current(&current));
    }

    #[test]
    fn test_answer_request_caps_interval_and_picks_refresher() {
        let mut n = negotiator();
        let response = n.answer_request(Some(SessionExpires::new(7200))).unwrap();
        assert_eq!(response.delta_seconds, 1800);
        assert_eq!(response.refresher, Some(RefresherRole::Uas));
        assert!(n.current().unwrap().is_local_refresher());
    }

    #[test]
    fn test_refresh_without_session_expires_disables_timer() {
        let mut n = negotiator();
        n.answer_request(Some(SessionExpires::new(600)));
        let stale = n.current().unwrap();
        assert_eq!(n.answer_request(None), None);
        assert_eq!(n.current(), None);
        assert!(!n.is_current(&stale));
        assert_eq!(n.next_timer(), None);
    }

    #[test]
    fn test_apply_response_sets_refresher() {
        let mut n = negotiator();
        n.apply_response(Some(SessionExpires::new(1200).with_refresher(RefresherRole::Uas)));
        assert_eq!(n.current().unwrap().refresher, Refresher::Remote);
        n.apply_response(Some(SessionExpires::new(1200).with_refresher(RefresherRole::Uac)));
        assert_eq!(n.current().unwrap().refresher, Refresher::Local);
        assert_eq!(n.sequence(), 2);
        n.apply_response(None);
        assert_eq!(n.current(), None);
    }

    #[test]
    fn test_apply_response_raises_interval_to_min_se() {
        let mut n = negotiator();
        n.apply_response(Some(SessionExpires::new(0).with_refresher(RefresherRole::Uac)));
        assert_eq!(n.current().unwrap().interval, Duration::from_secs(90));
        assert_eq!(
            n.next_timer(),
            Some((TimerKind::SessionRefresh, Duration::from_secs(45)))
        );

        n.apply_response(Some(SessionExpires::new(30).with_refresher(RefresherRole::Uas)));
        assert_eq!(n.current().unwrap().interval, Duration::from_secs(90));
        assert_eq!(
            n.next_timer(),
            Some((TimerKind::SessionExpiry, Duration::from_secs(60)))
        );
    }

    #[test]
    fn test_next_timer_intervals() {
        let mut n = negotiator();
        n.apply_response(Some(SessionExpires::new(1800).with_refresher(RefresherRole::Uac)));
        assert_eq!(
            n.next_timer(),
            Some((TimerKind::SessionRefresh, Duration::from_secs(900)))
        );

        n.apply_response(Some(SessionExpires::new(1800).with_refresher(RefresherRole::Uas)));
        assert_eq!(
            n.next_timer(),
            Some((TimerKind::SessionExpiry, Duration::from_secs(1768)))
        );

        n.apply_response(Some(SessionExpires::new(90).with_refresher(RefresherRole::Uas)));
        assert_eq!(
            n.next_timer(),
            Some((TimerKind::SessionExpiry, Duration::from_secs(60)))
        );
    }
}
