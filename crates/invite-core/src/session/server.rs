//! Callee (UAS) establishment phase
//!
//! ```text
//!              INVITE + offer                      reliable 1xx + answer
//!   UasStart ─────────────────▶ UasOfferReliable ────────────────────────▶ UasFirstEarlyReliable
//!      │       INVITE, no offer                    reliable 1xx + offer        │ PRACK
//!      └──────────────────────▶ UasNoOfferReliable ───▶ UasFirstSentOfferReliable ─▶ UasEarlyReliable
//!                                       │                                         │
//!                              accept() │                          UPDATE out/in ─┤
//!                                       ▼                                         │ accept()
//!                                  UasAccepted ◀──────────────────────────────────┘
//!                                       │ ACK
//!                                       ▼
//!                                   Connected
//! ```
//!
//! `UasAccepted` retransmits the 2xx until the ACK arrives; a missing ACK
//! ends the session with a BYE.

use tracing::{debug, info, trace, warn};

use crate::actions::{OutboundRequest, OutboundResponse, SessionNotification, TerminationReason};
use crate::errors::{ErrorKind, InviteError, InviteResult};
use crate::message::{Body, InboundMessage};
use crate::types::{Method, Role, Sdp, StatusCode};

use super::{InviteState, ModificationKind, PendingModification, RoleBehavior, SessionCore};

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ServerRole;

impl ServerRole {
    fn on_invite(&self, core: &mut SessionCore, message: &InboundMessage) -> InviteResult<()> {
        if core.state != InviteState::UasStart {
            trace!(session_id = %core.id, "INVITE retransmission ignored");
            return Ok(());
        }
        if core.reject_short_interval(message) {
            core.terminate(TerminationReason::Rejected(StatusCode::SESSION_INTERVAL_TOO_SMALL));
            return Ok(());
        }
        core.initial_session_expires = message.session_expires();
        match message.body() {
            Body::Offer(offer) => {
                core.offer_answer.receive_remote_offer(offer.clone())?;
                core.transition(InviteState::UasOfferReliable);
                core.notify(SessionNotification::OfferReceived { sdp: offer.clone() });
            }
            Body::None => {
                core.transition(InviteState::UasNoOfferReliable);
                core.notify(SessionNotification::OfferRequested);
            }
            _ => {
                warn!(session_id = %core.id, "initial INVITE carried an answer");
                core.respond(Method::Invite, StatusCode::SERVER_INTERNAL_ERROR);
                core.notify_error(ErrorKind::ProtocolViolation, message.to_string());
                core.terminate(TerminationReason::ProtocolViolation);
            }
        }
        Ok(())
    }

    fn on_prack(&self, core: &mut SessionCore, message: &InboundMessage) -> InviteResult<()> {
        match core.state {
            InviteState::UasFirstEarlyReliable => {
                let (local, remote) = core.offer_answer.commit_local_answer()?;
                core.respond(Method::Prack, StatusCode::OK);
                core.notify_negotiated(local, remote);
                core.transition(InviteState::UasEarlyReliable);
            }
            InviteState::UasFirstSentOfferReliable => {
                let Some(answer) = message.body().answer() else {
                    return Err(InviteError::protocol_violation(
                        "PRACK did not answer the offer in our reliable provisional",
                    ));
                };
                let (local, remote) = core.offer_answer.apply_remote_answer(answer.clone())?;
                core.respond(Method::Prack, StatusCode::OK);
                core.notify(SessionNotification::AnswerReceived { sdp: answer.clone() });
                core.notify_negotiated(local, remote);
                core.transition(InviteState::UasEarlyReliable);
            }
            _ => core.respond(Method::Prack, StatusCode::OK),
        }
        Ok(())
    }

    fn on_update_request(&self, core: &mut SessionCore, message: &InboundMessage) -> InviteResult<()> {
        match message.body() {
            Body::None => {
                core.answer_refresh_update(message);
                Ok(())
            }
            Body::Offer(offer) => match core.state {
                InviteState::UasEarlyReliable => {
                    if core.reject_short_interval(message) {
                        return Ok(());
                    }
                    core.offer_answer.receive_remote_offer(offer.clone())?;
                    core.pending = Some(PendingModification::remote(
                        ModificationKind::Update,
                        message.session_expires(),
                    ));
                    core.notify(SessionNotification::OfferReceived { sdp: offer.clone() });
                    core.transition(InviteState::UasReceivedUpdate);
                    Ok(())
                }
                InviteState::UasSentUpdate | InviteState::UasSentUpdateAccepted => {
                    core.reject_collision(message)
                }
                _ => {
                    core.respond(Method::Update, StatusCode::SERVER_INTERNAL_ERROR);
                    core.notify_error(ErrorKind::ProtocolViolation, message.to_string());
                    Ok(())
                }
            },
            _ => Err(InviteError::protocol_violation("UPDATE carried an answer")),
        }
    }

    fn on_update_response(&self, core: &mut SessionCore, message: &InboundMessage, status: StatusCode) -> InviteResult<()> {
        let sent = matches!(
            core.state,
            InviteState::UasSentUpdate | InviteState::UasSentUpdateAccepted | InviteState::UasWaitingToTerminate
        );
        if !sent || status.is_provisional() {
            return Ok(());
        }
        core.conclude_early_update(message, status)?;

        match core.state {
            InviteState::UasSentUpdateAccepted => send_accept(core, Body::None),
            InviteState::UasWaitingToTerminate => {
                core.respond(Method::Invite, StatusCode::TEMPORARILY_UNAVAILABLE);
                core.terminate(TerminationReason::LocalHangup);
            }
            _ => core.transition(InviteState::UasEarlyReliable),
        }
        Ok(())
    }

    fn on_ack(&self, core: &mut SessionCore, message: &InboundMessage) -> InviteResult<()> {
        match core.state {
            InviteState::UasAccepted => {
                core.retransmit.acknowledge();
                if core.offer_answer.awaiting_answer() {
                    // our offer was in the 2xx
                    match message.body().answer() {
                        Some(answer) => {
                            let (local, remote) = core.offer_answer.apply_remote_answer(answer.clone())?;
                            core.notify(SessionNotification::AnswerReceived { sdp: answer.clone() });
                            core.notify_negotiated(local, remote);
                        }
                        None => {
                            warn!(session_id = %core.id, "ACK did not answer the offer in our 2xx");
                            core.send_bye();
                            core.notify_error(ErrorKind::ProtocolViolation, message.to_string());
                            core.terminate(TerminationReason::ProtocolViolation);
                            return Ok(());
                        }
                    }
                } else if core.offer_answer.staged_answer().is_some() {
                    let (local, remote) = core.offer_answer.commit_local_answer()?;
                    core.notify_negotiated(local, remote);
                }
                info!(session_id = %core.id, "session connected");
                core.notify(SessionNotification::Connected);
                core.transition(InviteState::Connected);
            }
            InviteState::UasWaitingToHangup => {
                core.retransmit.acknowledge();
                core.send_bye();
                core.terminate(TerminationReason::LocalHangup);
            }
            _ => trace!(session_id = %core.id, state = %core.state, "stray ACK ignored"),
        }
        Ok(())
    }

    fn on_cancel(&self, core: &mut SessionCore) {
        if matches!(core.state, InviteState::UasAccepted | InviteState::UasWaitingToHangup) {
            debug!(session_id = %core.id, "CANCEL after 2xx has no effect");
            return;
        }
        info!(session_id = %core.id, "caller cancelled");
        core.respond(Method::Invite, StatusCode::REQUEST_TERMINATED);
        core.terminate(TerminationReason::RemoteCancel);
    }

    fn on_bye(&self, core: &mut SessionCore) {
        if !matches!(core.state, InviteState::UasAccepted | InviteState::UasWaitingToHangup) {
            core.respond(Method::Invite, StatusCode::REQUEST_TERMINATED);
        }
        core.respond(Method::Bye, StatusCode::OK);
        core.terminate(TerminationReason::RemoteHangup);
    }

    /// Refuse the initial INVITE
    fn refuse_invite(&self, core: &mut SessionCore, status: StatusCode, reason: TerminationReason) {
        info!(session_id = %core.id, status = %status, "refusing INVITE");
        core.respond(Method::Invite, status);
        core.terminate(reason);
    }
}

impl RoleBehavior for ServerRole {
    fn role(&self) -> Role {
        Role::Uas
    }

    fn dispatch(&self, core: &mut SessionCore, message: &InboundMessage) -> InviteResult<()> {
        match message {
            InboundMessage::Request { method: Method::Invite, .. } => self.on_invite(core, message),
            InboundMessage::Request { method: Method::Prack, .. } => self.on_prack(core, message),
            InboundMessage::Request { method: Method::Update, .. } => self.on_update_request(core, message),
            InboundMessage::Request { method: Method::Ack, .. } => self.on_ack(core, message),
            InboundMessage::Request { method: Method::Cancel, .. } => {
                self.on_cancel(core);
                Ok(())
            }
            InboundMessage::Request { method: Method::Bye, .. } => {
                self.on_bye(core);
                Ok(())
            }
            InboundMessage::Response { method: Method::Update, status, .. } => {
                self.on_update_response(core, message, *status)
            }
            _ => core.on_in_dialog(message),
        }
    }

    fn provide_offer(&self, core: &mut SessionCore, sdp: Sdp) -> InviteResult<()> {
        match core.state {
            // goes out in a reliable provisional or the 2xx
            InviteState::UasNoOfferReliable => core.offer_answer.propose_local_offer(sdp),
            InviteState::UasEarlyReliable => {
                if !core.dialog.peer_supports_update {
                    return Err(InviteError::invalid_state("offer without UPDATE support", core.state));
                }
                let offer = core.offer_answer.send_local_offer(sdp)?;
                core.send_request(OutboundRequest::new(Method::Update, Body::Offer(offer)));
                core.pending = Some(PendingModification::local(ModificationKind::Update, None, false));
                core.transition(InviteState::UasSentUpdate);
                Ok(())
            }
            InviteState::UasStart | InviteState::UasAccepted | InviteState::UasWaitingToHangup => {
                Err(InviteError::invalid_state("provide offer", core.state))
            }
            _ => Err(InviteError::protocol_violation(
                "offer proposed while an offer/answer exchange is in progress",
            )),
        }
    }

    fn provide_answer(&self, core: &mut SessionCore, sdp: Sdp) -> InviteResult<()> {
        match core.state {
            // goes out in a reliable provisional or the 2xx
            InviteState::UasOfferReliable => core.offer_answer.stage_local_answer(sdp),
            InviteState::UasReceivedUpdate | InviteState::UasReceivedUpdateWaitingAnswer => {
                core.offer_answer.stage_local_answer(sdp.clone())?;
                let (local, remote) = core.offer_answer.commit_local_answer()?;
                let requested = core.pending.take().and_then(|p| p.session_expires);
                let mut response = OutboundResponse::new(Method::Update, StatusCode::OK, Body::Answer(sdp));
                response.session_expires = core.session_timer.answer_request(requested);
                core.send_response(response);
                core.notify_negotiated(local, remote);
                if core.state == InviteState::UasReceivedUpdateWaitingAnswer {
                    send_accept(core, Body::None);
                } else {
                    core.transition(InviteState::UasEarlyReliable);
                }
                Ok(())
            }
            _ => Err(InviteError::protocol_violation(
                "answer provided with no outstanding offer from the peer",
            )),
        }
    }

    fn end(&self, core: &mut SessionCore) -> InviteResult<()> {
        match core.state {
            InviteState::UasStart => core.terminate(TerminationReason::LocalHangup),
            InviteState::UasAccepted => {
                debug!(session_id = %core.id, "hangup waits for the ACK");
                core.transition(InviteState::UasWaitingToHangup);
            }
            InviteState::UasSentUpdate | InviteState::UasSentUpdateAccepted => {
                core.transition(InviteState::UasWaitingToTerminate);
            }
            InviteState::UasWaitingToTerminate | InviteState::UasWaitingToHangup => {}
            _ => self.refuse_invite(
                core,
                StatusCode::TEMPORARILY_UNAVAILABLE,
                TerminationReason::LocalHangup,
            ),
        }
        Ok(())
    }

    fn reject(&self, core: &mut SessionCore, status: StatusCode) -> InviteResult<()> {
        match core.state {
            InviteState::UasReceivedUpdate | InviteState::UasReceivedUpdateWaitingAnswer => {
                core.respond(Method::Update, status);
                core.offer_answer.discard();
                core.pending = None;
                core.notify_error(
                    ErrorKind::ApplicationRejection,
                    InviteError::ApplicationRejection { status }.to_string(),
                );
                if core.state == InviteState::UasReceivedUpdateWaitingAnswer {
                    send_accept(core, Body::None);
                } else {
                    core.transition(InviteState::UasEarlyReliable);
                }
                Ok(())
            }
            InviteState::UasOfferReliable
            | InviteState::UasNoOfferReliable
            | InviteState::UasFirstSentOfferReliable
            | InviteState::UasFirstEarlyReliable
            | InviteState::UasEarlyReliable
            | InviteState::UasSentUpdate
            | InviteState::UasSentUpdateAccepted => {
                self.refuse_invite(core, status, TerminationReason::Rejected(status));
                Ok(())
            }
            state => Err(InviteError::invalid_state("reject", state)),
        }
    }

    fn accept(&self, core: &mut SessionCore) -> InviteResult<()> {
        match core.state {
            InviteState::UasOfferReliable => {
                let Some(answer) = core.offer_answer.staged_answer().cloned() else {
                    return Err(InviteError::protocol_violation("accept before an answer was provided"));
                };
                send_accept(core, Body::Answer(answer));
            }
            InviteState::UasNoOfferReliable => {
                if core.offer_answer.staged_offer().is_none() {
                    return Err(InviteError::protocol_violation("accept before an offer was provided"));
                }
                let offer = core.offer_answer.mark_offer_sent()?;
                send_accept(core, Body::Offer(offer));
            }
            InviteState::UasEarlyReliable => send_accept(core, Body::None),
            InviteState::UasSentUpdate => core.transition(InviteState::UasSentUpdateAccepted),
            InviteState::UasReceivedUpdate => core.transition(InviteState::UasReceivedUpdateWaitingAnswer),
            state => return Err(InviteError::invalid_state("accept", state)),
        }
        Ok(())
    }

    fn provisional(&self, core: &mut SessionCore, status: StatusCode) -> InviteResult<()> {
        let state = core.state;
        if !state.is_server_early()
            || matches!(
                state,
                InviteState::UasStart | InviteState::UasAccepted | InviteState::UasWaitingToHangup
            )
        {
            return Err(InviteError::invalid_state("send provisional", state));
        }

        // a staged description makes the first reliable provisional
        if core.dialog.peer_supports_100rel {
            if state == InviteState::UasOfferReliable {
                if let Some(answer) = core.offer_answer.staged_answer().cloned() {
                    send_reliable(core, status, Body::Answer(answer));
                    core.transition(InviteState::UasFirstEarlyReliable);
                    return Ok(());
                }
            }
            if state == InviteState::UasNoOfferReliable && core.offer_answer.staged_offer().is_some() {
                let offer = core.offer_answer.mark_offer_sent()?;
                send_reliable(core, status, Body::Offer(offer));
                core.transition(InviteState::UasFirstSentOfferReliable);
                return Ok(());
            }
        }
        core.respond(Method::Invite, status);
        Ok(())
    }
}

fn send_reliable(core: &mut SessionCore, status: StatusCode, body: Body) {
    let mut response = OutboundResponse::new(Method::Invite, status, body);
    response.reliable = true;
    core.send_response(response);
}

/// 200 to the initial INVITE; retransmitted until the ACK
fn send_accept(core: &mut SessionCore, body: Body) {
    info!(session_id = %core.id, "accepting INVITE");
    let requested = core.initial_session_expires;
    let mut response = OutboundResponse::new(Method::Invite, StatusCode::OK, body);
    response.session_expires = core.session_timer.answer_request(requested);
    core.send_invite_success(response);
    core.transition(InviteState::UasAccepted);
}
