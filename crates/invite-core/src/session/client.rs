//! Caller (UAC) establishment phase
//!
//! ```text
//!                 1xx                 reliable 1xx + answer
//!   UacStart ───────────▶ UacEarly ─────────────────────────▶ UacEarlyWithAnswer
//!      │                    │  reliable 1xx + offer              │  UPDATE out/in
//!      │                    ├──────────────▶ UacEarlyWithOffer   ├─▶ UacSentUpdateEarly
//!      │                    │  PRACK + offer                     └─▶ UacReceivedUpdateEarly
//!      │                    └──────────────▶ UacPrackAnswerWait
//!      │ 2xx                     2xx + offer
//!      ├──────────▶ Connected ◀──────────── UacWaitingForAnswerFromApp
//!      │ 3xx-6xx
//!      └──────────▶ UacTerminated ◀──────── UacCanceled (after end())
//! ```

use tracing::{debug, info, trace, warn};

use crate::actions::{OutboundRequest, OutboundResponse, SessionNotification, TerminationReason};
use crate::errors::{ErrorKind, InviteError, InviteResult};
use crate::message::{Body, InboundMessage};
use crate::types::{Method, Role, Sdp, StatusCode};

use super::{InviteState, ModificationKind, PendingModification, RoleBehavior, SessionCore};

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ClientRole;

impl ClientRole {
    fn on_provisional(
        &self,
        core: &mut SessionCore,
        message: &InboundMessage,
        status: StatusCode,
    ) -> InviteResult<()> {
        core.notify(SessionNotification::Provisional { status });
        let reliable = matches!(message, InboundMessage::Response { reliable: true, .. });
        if !reliable {
            if let Some(sdp) = message.body().sdp() {
                core.notify(SessionNotification::EarlyMedia { sdp: sdp.clone() });
            }
            if core.state == InviteState::UacStart {
                core.transition(InviteState::UacEarly);
            }
            return Ok(());
        }

        let before_negotiation = matches!(core.state, InviteState::UacStart | InviteState::UacEarly);
        match message.body() {
            Body::Answer(answer) if before_negotiation => {
                let (local, remote) = core.offer_answer.apply_remote_answer(answer.clone())?;
                send_prack(core, Body::None);
                core.notify(SessionNotification::AnswerReceived { sdp: answer.clone() });
                core.notify_negotiated(local, remote);
                core.transition(InviteState::UacEarlyWithAnswer);
            }
            Body::Offer(offer) if before_negotiation => {
                // PRACK goes out with our answer
                core.offer_answer.receive_remote_offer(offer.clone())?;
                core.notify(SessionNotification::OfferReceived { sdp: offer.clone() });
                core.transition(InviteState::UacEarlyWithOffer);
            }
            _ if before_negotiation => {
                if core.offer_answer.staged_offer().is_some() {
                    let offer = core.offer_answer.mark_offer_sent()?;
                    send_prack(core, Body::Offer(offer));
                    core.transition(InviteState::UacPrackAnswerWait);
                } else {
                    send_prack(core, Body::None);
                    core.transition(InviteState::UacEarly);
                }
            }
            _ => {
                trace!(session_id = %core.id, state = %core.state, "reliable provisional acknowledged");
                send_prack(core, Body::None);
            }
        }
        Ok(())
    }

    fn on_success(&self, core: &mut SessionCore, message: &InboundMessage) -> InviteResult<()> {
        if core.state == InviteState::UacWaitingForAnswerFromApp {
            trace!(session_id = %core.id, "2xx retransmission while the application answers");
            return Ok(());
        }
        core.session_timer.apply_response(message.session_expires());

        match core.state {
            // the early UPDATE exchange is still open; it finishes connected
            InviteState::UacSentUpdateEarly => {
                core.send_ack(Body::None);
                connect(core, InviteState::SentUpdate);
            }
            InviteState::UacReceivedUpdateEarly => {
                core.send_ack(Body::None);
                connect(core, InviteState::ReceivedUpdate);
            }
            // 2xx overtook the PRACK's response; the answer is still on its way
            InviteState::UacPrackAnswerWait if message.body().answer().is_none() => {
                core.send_ack(Body::None);
                core.pending = Some(PendingModification::local(ModificationKind::Prack, None, false));
                connect(core, InviteState::SentUpdate);
            }
            _ if core.offer_answer.awaiting_answer() => match message.body().answer() {
                Some(answer) => {
                    let (local, remote) = core.offer_answer.apply_remote_answer(answer.clone())?;
                    core.send_ack(Body::None);
                    core.notify(SessionNotification::AnswerReceived { sdp: answer.clone() });
                    core.notify_negotiated(local, remote);
                    connect(core, InviteState::Connected);
                }
                None => abort_establishment(core, message),
            },
            // answer to the reliable provisional's offer goes in the ACK
            _ if core.offer_answer.has_remote_offer() => {
                core.transition(InviteState::UacWaitingForAnswerFromApp);
            }
            _ if core.offer_answer.current_local().is_some() => {
                core.send_ack(Body::None);
                connect(core, InviteState::Connected);
            }
            _ => match message.body() {
                Body::Offer(offer) => {
                    core.offer_answer.receive_remote_offer(offer.clone())?;
                    core.notify(SessionNotification::OfferReceived { sdp: offer.clone() });
                    core.transition(InviteState::UacWaitingForAnswerFromApp);
                }
                _ => abort_establishment(core, message),
            },
        }
        Ok(())
    }

    fn on_prack_response(&self, core: &mut SessionCore, message: &InboundMessage, status: StatusCode) -> InviteResult<()> {
        if core.state != InviteState::UacPrackAnswerWait || status.is_provisional() {
            return Ok(());
        }
        if status.is_success() {
            match message.body().answer() {
                Some(answer) => {
                    let (local, remote) = core.offer_answer.apply_remote_answer(answer.clone())?;
                    core.notify(SessionNotification::AnswerReceived { sdp: answer.clone() });
                    core.notify_negotiated(local, remote);
                    core.transition(InviteState::UacEarlyWithAnswer);
                }
                None => {
                    warn!(session_id = %core.id, "PRACK 2xx without the answer to our offer");
                    core.offer_answer.discard();
                    core.notify_error(ErrorKind::ProtocolViolation, message.to_string());
                    core.transition(InviteState::UacEarly);
                }
            }
        } else {
            core.offer_answer.discard();
            core.notify(SessionNotification::ModificationRejected { status });
            core.transition(InviteState::UacEarly);
        }
        Ok(())
    }

    fn on_update_response(&self, core: &mut SessionCore, message: &InboundMessage, status: StatusCode) -> InviteResult<()> {
        if core.state != InviteState::UacSentUpdateEarly || status.is_provisional() {
            return Ok(());
        }
        core.conclude_early_update(message, status)?;
        core.transition(InviteState::UacEarlyWithAnswer);
        Ok(())
    }

    fn on_update_request(&self, core: &mut SessionCore, message: &InboundMessage) -> InviteResult<()> {
        match message.body() {
            Body::None => {
                core.answer_refresh_update(message);
                Ok(())
            }
            Body::Offer(offer) => match core.state {
                InviteState::UacEarlyWithAnswer => {
                    if core.reject_short_interval(message) {
                        return Ok(());
                    }
                    core.offer_answer.receive_remote_offer(offer.clone())?;
                    core.pending = Some(PendingModification::remote(
                        ModificationKind::Update,
                        message.session_expires(),
                    ));
                    core.notify(SessionNotification::OfferReceived { sdp: offer.clone() });
                    core.transition(InviteState::UacReceivedUpdateEarly);
                    Ok(())
                }
                InviteState::UacSentUpdateEarly => core.reject_collision(message),
                _ => {
                    core.respond(Method::Update, StatusCode::SERVER_INTERNAL_ERROR);
                    core.notify_error(ErrorKind::ProtocolViolation, message.to_string());
                    Ok(())
                }
            },
            _ => Err(InviteError::protocol_violation("UPDATE carried an answer")),
        }
    }

    /// After `end()` only the outcome of the INVITE matters
    fn on_canceled(&self, core: &mut SessionCore, message: &InboundMessage) -> InviteResult<()> {
        match message {
            InboundMessage::Response { method: Method::Invite, status, .. } if status.is_success() => {
                // 2xx raced our CANCEL
                debug!(session_id = %core.id, "2xx after CANCEL, hanging up");
                core.send_ack(Body::None);
                core.send_bye();
                core.terminate(TerminationReason::LocalCancel);
            }
            InboundMessage::Response { method: Method::Invite, status, .. } if status.is_final() => {
                core.terminate_in(InviteState::UacTerminated, TerminationReason::LocalCancel);
            }
            _ => trace!(session_id = %core.id, message = %message, "ignored while cancelling"),
        }
        Ok(())
    }
}

impl RoleBehavior for ClientRole {
    fn role(&self) -> Role {
        Role::Uac
    }

    fn dispatch(&self, core: &mut SessionCore, message: &InboundMessage) -> InviteResult<()> {
        if core.state == InviteState::UacCanceled {
            return self.on_canceled(core, message);
        }
        match message {
            InboundMessage::Response { method: Method::Invite, status, .. } => {
                if status.is_provisional() {
                    self.on_provisional(core, message, *status)
                } else if status.is_success() {
                    self.on_success(core, message)
                } else {
                    info!(session_id = %core.id, status = %status, "INVITE rejected");
                    core.terminate_in(InviteState::UacTerminated, TerminationReason::Rejected(*status));
                    Ok(())
                }
            }
            InboundMessage::Response { method: Method::Prack, status, .. } => {
                self.on_prack_response(core, message, *status)
            }
            InboundMessage::Response { method: Method::Update, status, .. } => {
                self.on_update_response(core, message, *status)
            }
            InboundMessage::Request { method: Method::Update, .. } => self.on_update_request(core, message),
            _ => core.on_in_dialog(message),
        }
    }

    fn provide_offer(&self, core: &mut SessionCore, sdp: Sdp) -> InviteResult<()> {
        match core.state {
            // late offer: rides on the PRACK of the next reliable provisional
            InviteState::UacStart | InviteState::UacEarly => core.offer_answer.propose_local_offer(sdp),
            InviteState::UacEarlyWithAnswer => {
                if !core.dialog.peer_supports_update {
                    return Err(InviteError::invalid_state("offer without UPDATE support", core.state));
                }
                let offer = core.offer_answer.send_local_offer(sdp)?;
                core.send_request(OutboundRequest::new(Method::Update, Body::Offer(offer)));
                core.pending = Some(PendingModification::local(ModificationKind::Update, None, false));
                core.transition(InviteState::UacSentUpdateEarly);
                Ok(())
            }
            InviteState::UacCanceled => Err(InviteError::invalid_state("provide offer", core.state)),
            _ => Err(InviteError::protocol_violation(
                "offer proposed while an offer/answer exchange is in progress",
            )),
        }
    }

    fn provide_answer(&self, core: &mut SessionCore, sdp: Sdp) -> InviteResult<()> {
        match core.state {
            InviteState::UacEarlyWithOffer => {
                core.offer_answer.stage_local_answer(sdp.clone())?;
                let (local, remote) = core.offer_answer.commit_local_answer()?;
                send_prack(core, Body::Answer(sdp));
                core.notify_negotiated(local, remote);
                core.transition(InviteState::UacEarlyWithAnswer);
                Ok(())
            }
            InviteState::UacWaitingForAnswerFromApp => {
                core.offer_answer.stage_local_answer(sdp.clone())?;
                let (local, remote) = core.offer_answer.commit_local_answer()?;
                core.send_ack(Body::Answer(sdp));
                core.notify_negotiated(local, remote);
                connect(core, InviteState::Connected);
                Ok(())
            }
            InviteState::UacReceivedUpdateEarly => {
                core.offer_answer.stage_local_answer(sdp.clone())?;
                let (local, remote) = core.offer_answer.commit_local_answer()?;
                let requested = core.pending.take().and_then(|p| p.session_expires);
                let mut response = OutboundResponse::new(Method::Update, StatusCode::OK, Body::Answer(sdp));
                response.session_expires = core.session_timer.answer_request(requested);
                core.send_response(response);
                core.notify_negotiated(local, remote);
                core.transition(InviteState::UacEarlyWithAnswer);
                Ok(())
            }
            _ => Err(InviteError::protocol_violation(
                "answer provided with no outstanding offer from the peer",
            )),
        }
    }

    fn end(&self, core: &mut SessionCore) -> InviteResult<()> {
        match core.state {
            InviteState::UacCanceled => Ok(()),
            InviteState::UacWaitingForAnswerFromApp => {
                // the INVITE transaction needs its ACK before the BYE
                core.send_ack(Body::None);
                core.send_bye();
                core.terminate(TerminationReason::LocalHangup);
                Ok(())
            }
            _ => {
                info!(session_id = %core.id, state = %core.state, "cancelling INVITE");
                core.send_request(OutboundRequest::new(Method::Cancel, Body::None));
                core.offer_answer.discard();
                core.pending = None;
                core.transition(InviteState::UacCanceled);
                Ok(())
            }
        }
    }

    fn reject(&self, core: &mut SessionCore, status: StatusCode) -> InviteResult<()> {
        match core.state {
            InviteState::UacReceivedUpdateEarly => {
                core.respond(Method::Update, status);
                core.offer_answer.discard();
                core.pending = None;
                core.notify_error(
                    ErrorKind::ApplicationRejection,
                    InviteError::ApplicationRejection { status }.to_string(),
                );
                core.transition(InviteState::UacEarlyWithAnswer);
                Ok(())
            }
            // an offer in a provisional or 2xx can only be refused by leaving
            InviteState::UacEarlyWithOffer | InviteState::UacWaitingForAnswerFromApp => self.end(core),
            state => Err(InviteError::invalid_state("reject", state)),
        }
    }
}

fn send_prack(core: &mut SessionCore, body: Body) {
    core.send_request(OutboundRequest::new(Method::Prack, body));
}

fn connect(core: &mut SessionCore, target: InviteState) {
    info!(session_id = %core.id, "session connected");
    core.notify(SessionNotification::Connected);
    core.transition(target);
}

/// 2xx without the description we need: acknowledge and hang up
fn abort_establishment(core: &mut SessionCore, message: &InboundMessage) {
    warn!(session_id = %core.id, "2xx to INVITE without a usable session description");
    core.send_ack(Body::None);
    core.send_bye();
    core.notify_error(ErrorKind::ProtocolViolation, message.to_string());
    core.terminate(TerminationReason::ProtocolViolation);
}
