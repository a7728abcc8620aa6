//! SDP Offer/Answer Model Implementation
//!
//! This module implements the sequencing rules of the offer/answer model
//! defined in RFC 3264 for use within an INVITE session. It does not look at
//! the descriptions themselves; it tracks which description is negotiated and
//! which one is in flight.
//!
//! ## Offer/Answer Flow
//!
//! ```text
//! Offerer                    Answerer
//!    |-- Offer (SDP) -------->|
//!    |<-- Answer (SDP) -------|
//!    |                        |
//! ```
//!
//! ## Rules
//!
//! - an offer may be proposed only when no offer is outstanding
//! - an answer may be applied only to an outstanding offer
//! - applying an answer promotes the proposed pair to the current pair
//! - rejecting discards the proposed pair and leaves the current pair alone
//!
//! Violations are reported as [`InviteError::ProtocolViolation`].

use tracing::trace;

use crate::errors::{InviteError, InviteResult};
use crate::types::Sdp;

/// Current and proposed descriptions at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpSnapshot {
    pub current_local: Option<Sdp>,
    pub current_remote: Option<Sdp>,
    pub proposed_local: Option<Sdp>,
    pub proposed_remote: Option<Sdp>,
}

impl SdpSnapshot {
    pub fn has_proposal(&self) -> bool {
        self.proposed_local.is_some() || self.proposed_remote.is_some()
    }
}

/// In-flight negotiation; each variant carries only the proposed data it needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum Negotiation {
    #[default]
    Idle,
    /// We proposed an offer; `sent` once it left in a request or response
    LocalOffer { offer: Sdp, sent: bool },
    /// The peer offered; `answer` once the application staged one
    RemoteOffer { offer: Sdp, answer: Option<Sdp> },
}

/// Negotiated and proposed session descriptions for one session
#[derive(Debug, Clone, Default)]
pub struct OfferAnswerStore {
    current_local: Option<Sdp>,
    current_remote: Option<Sdp>,
    negotiation: Negotiation,
}

impl OfferAnswerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a local offer. An unsent offer may be replaced.
    pub fn propose_local_offer(&mut self, offer: Sdp) -> InviteResult<()> {
        match &self.negotiation {
            Negotiation::Idle | Negotiation::LocalOffer { sent: false, .. } => {
                self.negotiation = Negotiation::LocalOffer { offer, sent: false };
                Ok(())
            }
            Negotiation::LocalOffer { sent: true, .. } => Err(InviteError::protocol_violation(
                "offer proposed while a previous offer is unanswered",
            )),
            Negotiation::RemoteOffer { .. } => Err(InviteError::protocol_violation(
                "offer proposed while the peer's offer is unanswered",
            )),
        }
    }

    /// Mark the staged local offer as sent and return it
    pub fn mark_offer_sent(&mut self) -> InviteResult<Sdp> {
        match &mut self.negotiation {
            Negotiation::LocalOffer { offer, sent } => {
                *sent = true;
                Ok(offer.clone())
            }
            _ => Err(InviteError::protocol_violation("no local offer staged")),
        }
    }

    /// Stage and mark sent in one step
    pub fn send_local_offer(&mut self, offer: Sdp) -> InviteResult<Sdp> {
        self.propose_local_offer(offer)?;
        self.mark_offer_sent()
    }

    /// Record an offer received from the peer
    pub fn receive_remote_offer(&mut self, offer: Sdp) -> InviteResult<()> {
        match &self.negotiation {
            Negotiation::Idle => {
                self.negotiation = Negotiation::RemoteOffer { offer, answer: None };
                Ok(())
            }
            // An unsent local offer loses to the peer's offer; the caller keeps
            // its own copy if it wants to retry later.
            Negotiation::LocalOffer { sent: false, .. } => {
                self.negotiation = Negotiation::RemoteOffer { offer, answer: None };
                Ok(())
            }
            Negotiation::LocalOffer { sent: true, .. } => Err(InviteError::protocol_violation(
                "offer received while our offer is unanswered",
            )),
            Negotiation::RemoteOffer { .. } => Err(InviteError::protocol_violation(
                "second offer received before the first was answered",
            )),
        }
    }

    /// Stage our answer to the peer's outstanding offer. Takes effect on commit.
    pub fn stage_local_answer(&mut self, answer: Sdp) -> InviteResult<()> {
        match &mut self.negotiation {
            Negotiation::RemoteOffer { answer: staged, .. } => {
                *staged = Some(answer);
                Ok(())
            }
            _ => Err(InviteError::protocol_violation(
                "answer provided with no outstanding offer from the peer",
            )),
        }
    }

    /// Promote the peer's offer and our staged answer to current.
    /// Returns the new (local, remote) pair.
    pub fn commit_local_answer(&mut self) -> InviteResult<(Sdp, Sdp)> {
        match std::mem::take(&mut self.negotiation) {
            Negotiation::RemoteOffer {
                offer,
                answer: Some(answer),
            } => Ok(self.promote(answer, offer)),
            other => {
                self.negotiation = other;
                Err(InviteError::protocol_violation("no staged answer to commit"))
            }
        }
    }

    /// Apply the peer's answer to our sent offer and promote the pair.
    /// Returns the new (local, remote) pair.
    pub fn apply_remote_answer(&mut self, answer: Sdp) -> InviteResult<(Sdp, Sdp)> {
        match std::mem::take(&mut self.negotiation) {
            Negotiation::LocalOffer { offer, sent: true } => Ok(self.promote(offer, answer)),
            other => {
                self.negotiation = other;
                Err(InviteError::protocol_violation(
                    "answer received with no outstanding local offer",
                ))
            }
        }
    }

    /// Drop the in-flight proposal, leaving the current pair untouched.
    /// Returns whether anything was discarded.
    pub fn discard(&mut self) -> bool {
        let discarded = !self.is_idle();
        if discarded {
            trace!("discarding proposed session description");
        }
        self.negotiation = Negotiation::Idle;
        discarded
    }

    fn promote(&mut self, local: Sdp, remote: Sdp) -> (Sdp, Sdp) {
        self.current_local = Some(local.clone());
        self.current_remote = Some(remote.clone());
        (local, remote)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.negotiation, Negotiation::Idle)
    }

    /// A local offer has been sent and awaits the answer
    pub fn awaiting_answer(&self) -> bool {
        matches!(self.negotiation, Negotiation::LocalOffer { sent: true, .. })
    }

    /// A local offer is staged but not sent yet
    pub fn staged_offer(&self) -> Option<&Sdp> {
        match &self.negotiation {
            Negotiation::LocalOffer { offer, sent: false } => Some(offer),
            _ => None,
        }
    }

    /// The peer's offer is outstanding
    pub fn has_remote_offer(&self) -> bool {
        matches!(self.negotiation, Negotiation::RemoteOffer { .. })
    }

    pub fn staged_answer(&self) -> Option<&Sdp> {
        match &self.negotiation {
            Negotiation::RemoteOffer { answer, .. } => answer.as_ref(),
            _ => None,
        }
    }

    pub fn current_local(&self) -> Option<&Sdp> {
        self.current_local.as_ref()
    }

    pub fn current_remote(&self) -> Option<&Sdp> {
        self.current_remote.as_ref()
    }

    pub fn proposed_local(&self) -> Option<&Sdp> {
        match &self.negotiation {
            Negotiation::Idle => None,
            Negotiation::LocalOffer { offer, .. } => Some(offer),
            Negotiation::RemoteOffer { answer, .. } => answer.as_ref(),
        }
    }

    pub fn proposed_remote(&self) -> Option<&Sdp> {
        match &self.negotiation {
            Negotiation::RemoteOffer { offer, .. } => Some(offer),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> SdpSnapshot {
        SdpSnapshot {
            current_local: self.current_local.clone(),
            current_remote: self.current_remote.clone(),
            proposed_local: self.proposed_local().cloned(),
            proposed_remote: self.proposed_remote().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sdp(s: &str) -> Sdp {
        Sdp::from(s)
    }

    #[test]
    fn test_local_offer_then_remote_answer_promotes() {
        let mut store = OfferAnswerStore::new();
        store.send_local_offer(sdp("offer-a")).unwrap();
        assert!(store.awaiting_answer());
        assert_eq!(store.current_local(), None);

        let (local, remote) = store.apply_remote_answer(sdp("answer-b")).unwrap();
        assert_eq!(local, sdp("offer-a"));
        assert_eq!(remote, sdp("answer-b"));
        assert!(store.is_idle());
        assert_eq!(
            store.snapshot(),
            SdpSnapshot {
                current_local: Some(sdp("offer-a")),
                current_remote: Some(sdp("answer-b")),
                proposed_local: None,
                proposed_remote: None,
            }
        );
    }

    #[test]
    fn test_remote_offer_commit_only_after_staging() {
        let mut store = OfferAnswerStore::new();
        store.receive_remote_offer(sdp("remote-offer")).unwrap();
        assert!(store.commit_local_answer().is_err());
        assert!(store.has_remote_offer());

        store.stage_local_answer(sdp("local-answer")).unwrap();
        assert_eq!(store.current_local(), None);
        assert_eq!(store.proposed_local(), Some(&sdp("local-answer")));
        assert_eq!(store.proposed_remote(), Some(&sdp("remote-offer")));

        store.commit_local_answer().unwrap();
        assert_eq!(store.current_local(), Some(&sdp("local-answer")));
        assert_eq!(store.current_remote(), Some(&sdp("remote-offer")));
        assert!(!store.snapshot().has_proposal());
    }

    #[test]
    fn test_second_offer_is_protocol_violation() {
        let mut store = OfferAnswerStore::new();
        store.receive_remote_offer(sdp("one")).unwrap();
        let err = store.receive_remote_offer(sdp("two")).unwrap_err();
        assert!(matches!(err, InviteError::ProtocolViolation { .. }));
        assert_eq!(store.proposed_remote(), Some(&sdp("one")));

        let mut store = OfferAnswerStore::new();
        store.send_local_offer(sdp("mine")).unwrap();
        assert!(store.propose_local_offer(sdp("again")).is_err());
        assert!(store.receive_remote_offer(sdp("theirs")).is_err());
    }

    #[test]
    fn test_answer_without_offer_is_protocol_violation() {
        let mut store = OfferAnswerStore::new();
        assert!(store.apply_remote_answer(sdp("answer")).is_err());
        assert!(store.stage_local_answer(sdp("answer")).is_err());

        // a staged but unsent offer cannot be answered either
        store.propose_local_offer(sdp("draft")).unwrap();
        assert!(store.apply_remote_answer(sdp("answer")).is_err());
        assert_eq!(store.staged_offer(), Some(&sdp("draft")));
    }

    #[test]
    fn test_unsent_offer_can_be_replaced() {
        let mut store = OfferAnswerStore::new();
        store.propose_local_offer(sdp("draft-1")).unwrap();
        store.propose_local_offer(sdp("draft-2")).unwrap();
        assert_eq!(store.mark_offer_sent().unwrap(), sdp("draft-2"));
    }

    #[test]
    fn test_discard_keeps_current() {
        let mut store = OfferAnswerStore::new();
        store.send_local_offer(sdp("a")).unwrap();
        store.apply_remote_answer(sdp("b")).unwrap();

        store.send_local_offer(sdp("c")).unwrap();
        assert!(store.discard());
        assert!(!store.discard());
        assert_eq!(store.current_local(), Some(&sdp("a")));
        assert_eq!(store.current_remote(), Some(&sdp("b")));
        assert!(store.is_idle());
    }
}
