//! INVITE session states
//!
//! The client (UAC) and server (UAS) establishment phases have their own
//! states; once the initial INVITE transaction completes both roles share the
//! connected-phase states.
//!
//! ```text
//!             UAC                                   UAS
//!  UacStart ─▶ UacEarly ─▶ ...            UasStart ─▶ UasOfferReliable ─▶ ...
//!      │                    │                 │                │
//!      ▼                    ▼                 ▼                ▼
//!  UacTerminated        Connected ◀──────── UasAccepted ◀──────┘
//!                           │
//!        ┌──────────────────┼──────────────────────┐
//!        ▼                  ▼                      ▼
//!  SentReinvite       ReceivedReinvite        WaitingToOffer
//!  SentUpdate         ReceivedUpdate          WaitingToTerminate
//!  *Glare             Answered                      │
//!                                                   ▼
//!                                              Terminated
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::timer::TimerKind;

/// All states of an INVITE session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InviteState {
    // Connected phase, shared by both roles
    Connected,
    SentUpdate,
    SentUpdateGlare,
    SentReinvite,
    SentReinviteGlare,
    ReceivedUpdate,
    ReceivedReinvite,
    ReceivedReinviteNoOffer,
    /// 2xx sent for the peer's re-INVITE, waiting for the ACK
    Answered,
    /// Local offer queued until a subsidiary request completes
    WaitingToOffer,
    /// `end()` called while a transaction is outstanding
    WaitingToTerminate,
    Terminated,

    // Client establishment
    UacStart,
    UacEarly,
    UacEarlyWithOffer,
    UacEarlyWithAnswer,
    UacWaitingForAnswerFromApp,
    /// Initial INVITE failed or was cancelled; absorbing
    UacTerminated,
    UacSentUpdateEarly,
    UacReceivedUpdateEarly,
    UacPrackAnswerWait,
    UacCanceled,

    // Server establishment
    UasStart,
    UasOfferReliable,
    UasNoOfferReliable,
    UasFirstSentOfferReliable,
    UasFirstEarlyReliable,
    UasAccepted,
    UasEarlyReliable,
    UasSentUpdate,
    UasSentUpdateAccepted,
    UasReceivedUpdate,
    UasReceivedUpdateWaitingAnswer,
    UasWaitingToTerminate,
    UasWaitingToHangup,
}

impl InviteState {
    /// Absorbing states: no further transitions or timers
    pub fn is_terminated(&self) -> bool {
        matches!(self, InviteState::Terminated | InviteState::UacTerminated)
    }

    pub fn is_client_early(&self) -> bool {
        matches!(
            self,
            InviteState::UacStart
                | InviteState::UacEarly
                | InviteState::UacEarlyWithOffer
                | InviteState::UacEarlyWithAnswer
                | InviteState::UacWaitingForAnswerFromApp
                | InviteState::UacSentUpdateEarly
                | InviteState::UacReceivedUpdateEarly
                | InviteState::UacPrackAnswerWait
                | InviteState::UacCanceled
        )
    }

    pub fn is_server_early(&self) -> bool {
        matches!(
            self,
            InviteState::UasStart
                | InviteState::UasOfferReliable
                | InviteState::UasNoOfferReliable
                | InviteState::UasFirstSentOfferReliable
                | InviteState::UasFirstEarlyReliable
                | InviteState::UasAccepted
                | InviteState::UasEarlyReliable
                | InviteState::UasSentUpdate
                | InviteState::UasSentUpdateAccepted
                | InviteState::UasReceivedUpdate
                | InviteState::UasReceivedUpdateWaitingAnswer
                | InviteState::UasWaitingToTerminate
                | InviteState::UasWaitingToHangup
        )
    }

    /// Initial INVITE transaction not yet complete
    pub fn is_early(&self) -> bool {
        self.is_client_early() || self.is_server_early()
    }

    /// Connected phase, not terminated
    pub fn is_connected_phase(&self) -> bool {
        !self.is_early() && !self.is_terminated()
    }

    /// Settled connected-phase states with no transaction outstanding
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            InviteState::Connected
                | InviteState::WaitingToOffer
                | InviteState::SentReinviteGlare
                | InviteState::SentUpdateGlare
        )
    }

    pub fn is_glare(&self) -> bool {
        matches!(self, InviteState::SentReinviteGlare | InviteState::SentUpdateGlare)
    }

    /// Whether a timer of `kind` may stay armed while in this state
    pub fn owns_timer(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::Retransmit => matches!(
                self,
                InviteState::Answered
                    | InviteState::WaitingToTerminate
                    | InviteState::UasAccepted
                    | InviteState::UasWaitingToHangup
            ),
            TimerKind::Glare => self.is_glare(),
            TimerKind::SessionRefresh | TimerKind::SessionExpiry => self.is_connected_phase(),
        }
    }
}

impl fmt::Display for InviteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_are_disjoint() {
        let all = [
            InviteState::Connected,
            InviteState::Answered,
            InviteState::Terminated,
            InviteState::UacStart,
            InviteState::UacTerminated,
            InviteState::UacCanceled,
            InviteState::UasStart,
            InviteState::UasAccepted,
            InviteState::UasWaitingToHangup,
        ];
        for state in all {
            let phases = [state.is_early(), state.is_connected_phase(), state.is_terminated()];
            assert_eq!(phases.iter().filter(|p| **p).count(), 1, "{}", state);
        }
    }

    #[test]
    fn test_timer_ownership() {
        assert!(InviteState::Answered.owns_timer(TimerKind::Retransmit));
        assert!(InviteState::UasAccepted.owns_timer(TimerKind::Retransmit));
        assert!(!InviteState::Connected.owns_timer(TimerKind::Retransmit));
        assert!(InviteState::SentUpdateGlare.owns_timer(TimerKind::Glare));
        assert!(!InviteState::SentUpdate.owns_timer(TimerKind::Glare));
        assert!(InviteState::SentReinvite.owns_timer(TimerKind::SessionRefresh));
        assert!(!InviteState::UacEarly.owns_timer(TimerKind::SessionExpiry));
        assert!(!InviteState::Terminated.owns_timer(TimerKind::SessionExpiry));
    }

    #[test]
    fn test_display_is_variant_name() {
        assert_eq!(InviteState::ReceivedReinviteNoOffer.to_string(), "ReceivedReinviteNoOffer");
    }
}
