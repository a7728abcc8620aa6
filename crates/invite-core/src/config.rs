//! Session configuration
//!
//! [`SessionConfig`] gathers every tunable of the INVITE session core: the
//! RFC 3261 retransmission timers used for 2xx responses, the glare backoff
//! ranges, RFC 4028 session timer preferences and the local policies for
//! ambiguous flows.
//!
//! ## Examples
//!
//! ```rust
//! use rvoip_invite_core::config::{SessionConfig, NoOfferPolicy};
//!
//! let config = SessionConfig::default()
//!     .with_session_expires(600)
//!     .with_no_offer_policy(NoOfferPolicy::AskApplication);
//! assert!(config.validate().is_ok());
//! ```
//!
//! Configuration can also be loaded from TOML:
//!
//! ```rust
//! use rvoip_invite_core::config::SessionConfig;
//!
//! let config = SessionConfig::from_toml_str(r#"
//!     t1_ms = 250
//!     max_ack_retransmits = 6
//!
//!     [glare]
//!     owner_min_ms = 2100
//!     owner_max_ms = 4000
//! "#).unwrap();
//! assert_eq!(config.t1_ms, 250);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{InviteError, InviteResult};

/// What to do with a re-INVITE that carries no offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoOfferPolicy {
    /// Answer at once with the current local description as the offer; the
    /// ACK must carry the answer. Suitable for keep-alive re-INVITEs.
    OfferCurrent,
    /// Ask the application for an offer before sending the 2xx
    AskApplication,
}

/// Method used for session refreshes and target refreshes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMethod {
    /// UPDATE when the peer allows it, re-INVITE otherwise
    Update,
    Reinvite,
}

/// Which side should refresh when we get to choose (RFC 4028)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefresherPreference {
    Local,
    Remote,
}

/// Randomized backoff after a 491 (RFC 3261 §14.1)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlareBackoffConfig {
    /// Range used when we own the Call-ID (we sent the initial INVITE)
    pub owner_min_ms: u64,
    pub owner_max_ms: u64,
    /// Range used when the peer owns the Call-ID
    pub non_owner_min_ms: u64,
    pub non_owner_max_ms: u64,
}

impl Default for GlareBackoffConfig {
    fn default() -> Self {
        Self {
            owner_min_ms: 2100,
            owner_max_ms: 4000,
            non_owner_min_ms: 0,
            non_owner_max_ms: 2000,
        }
    }
}

impl GlareBackoffConfig {
    /// Fixed backoff regardless of Call-ID ownership (useful in tests)
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            owner_min_ms: ms,
            owner_max_ms: ms,
            non_owner_min_ms: ms,
            non_owner_max_ms: ms,
        }
    }

    pub fn range(&self, call_id_owner: bool) -> (Duration, Duration) {
        if call_id_owner {
            (
                Duration::from_millis(self.owner_min_ms),
                Duration::from_millis(self.owner_max_ms),
            )
        } else {
            (
                Duration::from_millis(self.non_owner_min_ms),
                Duration::from_millis(self.non_owner_max_ms),
            )
        }
    }
}

/// Session timer preferences (RFC 4028)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTimerSettings {
    pub enabled: bool,
    /// Requested session interval in seconds
    pub session_expires_secs: u32,
    /// Smallest interval we accept (Min-SE)
    pub min_se_secs: u32,
    pub preferred_refresher: RefresherPreference,
}

impl Default for SessionTimerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            session_expires_secs: 1800,
            min_se_secs: 90,
            preferred_refresher: RefresherPreference::Local,
        }
    }
}

/// Configuration for INVITE sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// RTT estimate (T1) in milliseconds
    pub t1_ms: u64,
    /// Cap on the retransmit interval (T2) in milliseconds
    pub t2_ms: u64,
    /// 2xx retransmissions sent before giving up on the ACK
    pub max_ack_retransmits: u32,
    pub glare: GlareBackoffConfig,
    pub session_timer: SessionTimerSettings,
    pub no_offer_reinvite: NoOfferPolicy,
    pub refresh_method: RefreshMethod,
    /// How long a terminated session stays reachable so late requests get
    /// 481 and late 2xx retransmissions their ACK
    pub terminated_linger_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            t1_ms: 500,
            t2_ms: 4000,
            // 0.5 + 1 + 2 + 4 * 7 s: roughly Timer H (64 * T1)
            max_ack_retransmits: 10,
            glare: GlareBackoffConfig::default(),
            session_timer: SessionTimerSettings::default(),
            no_offer_reinvite: NoOfferPolicy::OfferCurrent,
            refresh_method: RefreshMethod::Update,
            // 64 * T1
            terminated_linger_ms: 32_000,
        }
    }
}

impl SessionConfig {
    /// Parse a configuration from TOML; missing fields take their defaults.
    pub fn from_toml_str(input: &str) -> InviteResult<Self> {
        let config: SessionConfig = toml::from_str(input)
            .map_err(|e| InviteError::config(format!("Invalid session config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn t1(&self) -> Duration {
        Duration::from_millis(self.t1_ms)
    }

    pub fn t2(&self) -> Duration {
        Duration::from_millis(self.t2_ms)
    }

    pub fn terminated_linger(&self) -> Duration {
        Duration::from_millis(self.terminated_linger_ms)
    }

    pub fn with_terminated_linger(mut self, linger: Duration) -> Self {
        self.terminated_linger_ms = linger.as_millis() as u64;
        self
    }

    pub fn with_timers(mut self, t1: Duration, t2: Duration) -> Self {
        self.t1_ms = t1.as_millis() as u64;
        self.t2_ms = t2.as_millis() as u64;
        self
    }

    pub fn with_max_ack_retransmits(mut self, attempts: u32) -> Self {
        self.max_ack_retransmits = attempts;
        self
    }

    pub fn with_glare_backoff(mut self, glare: GlareBackoffConfig) -> Self {
        self.glare = glare;
        self
    }

    pub fn with_session_expires(mut self, secs: u32) -> Self {
        self.session_timer.session_expires_secs = secs;
        self
    }

    pub fn with_min_se(mut self, secs: u32) -> Self {
        self.session_timer.min_se_secs = secs;
        self
    }

    pub fn with_preferred_refresher(mut self, preference: RefresherPreference) -> Self {
        self.session_timer.preferred_refresher = preference;
        self
    }

    pub fn without_session_timer(mut self) -> Self {
        self.session_timer.enabled = false;
        self
    }

    pub fn with_no_offer_policy(mut self, policy: NoOfferPolicy) -> Self {
        self.no_offer_reinvite = policy;
        self
    }

    pub fn with_refresh_method(mut self, method: RefreshMethod) -> Self {
        self.refresh_method = method;
        self
    }

    /// Check the configuration for inconsistent values
    pub fn validate(&self) -> InviteResult<()> {
        if self.t1_ms == 0 {
            return Err(InviteError::config("t1_ms must be greater than zero"));
        }
        if self.t2_ms < self.t1_ms {
            return Err(InviteError::config("t2_ms must not be smaller than t1_ms"));
        }
        if self.max_ack_retransmits == 0 {
            return Err(InviteError::config("max_ack_retransmits must be at least 1"));
        }
        if self.glare.owner_min_ms > self.glare.owner_max_ms
            || self.glare.non_owner_min_ms > self.glare.non_owner_max_ms
        {
            return Err(InviteError::config("glare backoff minimum exceeds maximum"));
        }
        let timer = &self.session_timer;
        if timer.enabled {
            // RFC 4028 §4: Min-SE can never be below 90 seconds
            if timer.min_se_secs < 90 {
                return Err(InviteError::config("min_se_secs must be at least 90"));
            }
            if timer.session_expires_secs < timer.min_se_secs {
                return Err(InviteError::config(format!(
                    "session_expires_secs ({}) is below min_se_secs ({})",
                    timer.session_expires_secs, timer.min_se_secs
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.t1(), Duration::from_millis(500));
        assert_eq!(config.t2(), Duration::from_secs(4));
        assert_eq!(config.no_offer_reinvite, NoOfferPolicy::OfferCurrent);
        assert_eq!(config.terminated_linger(), Duration::from_secs(32));
    }

    #[test]
    fn test_validation_failures() {
        assert!(SessionConfig::default().with_max_ack_retransmits(0).validate().is_err());
        assert!(SessionConfig::default().with_min_se(30).validate().is_err());
        assert!(SessionConfig::default()
            .with_min_se(120)
            .with_session_expires(100)
            .validate()
            .is_err());
        assert!(SessionConfig::default()
            .with_timers(Duration::from_secs(5), Duration::from_secs(1))
            .validate()
            .is_err());

        let mut config = SessionConfig::default();
        config.glare.owner_min_ms = 5000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_timer_can_be_disabled() {
        let config = SessionConfig::default().without_session_timer().with_min_se(10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = SessionConfig::from_toml_str(
            r#"
            max_ack_retransmits = 4
            no_offer_reinvite = "ask_application"
            refresh_method = "reinvite"
            terminated_linger_ms = 5000

            [session_timer]
            session_expires_secs = 300
            preferred_refresher = "remote"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_ack_retransmits, 4);
        assert_eq!(config.t1_ms, 500);
        assert_eq!(config.no_offer_reinvite, NoOfferPolicy::AskApplication);
        assert_eq!(config.refresh_method, RefreshMethod::Reinvite);
        assert_eq!(config.terminated_linger(), Duration::from_secs(5));
        assert_eq!(config.session_timer.session_expires_secs, 300);
        assert_eq!(config.session_timer.min_se_secs, 90);
        assert_eq!(config.session_timer.preferred_refresher, RefresherPreference::Remote);
    }

    #[test]
    fn test_from_toml_rejects_invalid_values() {
        assert!(SessionConfig::from_toml_str("t1_ms = 0").is_err());
        assert!(SessionConfig::from_toml_str("t1_ms = \"fast\"").is_err());
    }

    #[test]
    fn test_glare_ranges() {
        let glare = GlareBackoffConfig::default();
        assert_eq!(
            glare.range(true),
            (Duration::from_millis(2100), Duration::from_millis(4000))
        );
        assert_eq!(glare.range(false), (Duration::ZERO, Duration::from_millis(2000)));

        let fixed = GlareBackoffConfig::fixed(Duration::from_millis(750));
        assert_eq!(fixed.range(true), fixed.range(false));
    }
}
