//! Connected-phase handlers, shared by both roles
//!
//! Once the initial INVITE transaction is over the caller and callee behave
//! the same way: either side may renegotiate with re-INVITE or UPDATE, send
//! INFO and REFER, refresh the session, or hang up.

use tracing::{debug, info, trace, warn};

use crate::actions::{OutboundRequest, OutboundResponse, SessionNotification, TerminationReason};
use crate::config::NoOfferPolicy;
use crate::errors::{ErrorKind, InviteError, InviteResult};
use crate::glare::{GlareResolver, GlareRetry};
use crate::message::{Body, InboundMessage};
use crate::types::{InfoContent, Method, Sdp, StatusCode};

use super::{InviteState, ModificationKind, PendingModification, QueuedOffer, SessionCore};

impl SessionCore {
    pub(crate) fn dispatch_connected_phase(&mut self, message: &InboundMessage) -> InviteResult<()> {
        match self.state {
            InviteState::Connected | InviteState::WaitingToOffer => self.on_connected(message),
            InviteState::SentReinvite | InviteState::SentUpdate => self.on_sent_modification(message),
            InviteState::SentReinviteGlare | InviteState::SentUpdateGlare => self.on_glare(message),
            InviteState::ReceivedReinvite
            | InviteState::ReceivedReinviteNoOffer
            | InviteState::ReceivedUpdate => self.on_received_modification(message),
            InviteState::Answered => self.on_answered(message),
            InviteState::WaitingToTerminate => self.on_waiting_to_terminate(message),
            state => {
                trace!(session_id = %self.id, state = %state, "no connected-phase handler");
                Ok(())
            }
        }
    }

    // ---- per-state handlers ------------------------------------------------

    fn on_connected(&mut self, message: &InboundMessage) -> InviteResult<()> {
        match message {
            InboundMessage::Request { method: Method::Invite, body, .. } => {
                self.receive_reinvite(message, body)
            }
            InboundMessage::Request { method: Method::Update, body, .. } => {
                self.receive_update(message, body)
            }
            _ => self.on_in_dialog(message),
        }
    }

    fn on_sent_modification(&mut self, message: &InboundMessage) -> InviteResult<()> {
        let Some(pending) = self.pending.clone() else {
            return Err(InviteError::protocol_violation("modification state without a pending request"));
        };
        if GlareResolver::is_collision(true, message) {
            return self.reject_collision(message);
        }
        match message {
            InboundMessage::Response { method, status, .. } if *method == pending.kind.method() => {
                if status.is_provisional() {
                    trace!(session_id = %self.id, status = %status, "provisional to modification");
                    Ok(())
                } else if pending.kind == ModificationKind::Prack {
                    self.conclude_prack_offer(message, *status)
                } else if status.is_success() {
                    self.complete_local_modification(pending, message)?;
                    self.transition(InviteState::Connected);
                    Ok(())
                } else {
                    self.fail_local_modification(pending, *status)
                }
            }
            _ => self.on_in_dialog(message),
        }
    }

    fn on_glare(&mut self, message: &InboundMessage) -> InviteResult<()> {
        let peer_offer = match message {
            InboundMessage::Request { method: Method::Invite, .. } => true,
            InboundMessage::Request { method: Method::Update, body, .. } => body.offer().is_some(),
            _ => false,
        };
        if peer_offer {
            // the peer retried first; ours goes out once theirs completes
            if let Some(retry) = self.glare.take_retry() {
                debug!(session_id = %self.id, "peer won the glare race, queueing our retry");
                self.queued_offer = Some(QueuedOffer {
                    kind: retry.kind,
                    offer: retry.offer,
                    contact: retry.contact,
                });
            }
            return self.on_connected(message);
        }
        self.on_in_dialog(message)
    }

    fn on_received_modification(&mut self, message: &InboundMessage) -> InviteResult<()> {
        match message {
            InboundMessage::Request { method: Method::Update, body: Body::None, .. } => {
                self.answer_refresh_update(message);
                Ok(())
            }
            InboundMessage::Request { method: Method::Invite | Method::Update, .. } => {
                // RFC 3261 §14.2: overlapping peer requests get 500
                warn!(session_id = %self.id, "peer sent an offer while its previous one is unanswered");
                self.respond(message.method(), StatusCode::SERVER_INTERNAL_ERROR);
                self.notify_error(ErrorKind::ProtocolViolation, message.to_string());
                Ok(())
            }
            InboundMessage::Request { method: Method::Cancel, .. }
                if self.state != InviteState::ReceivedUpdate =>
            {
                info!(session_id = %self.id, "peer cancelled its re-INVITE");
                self.respond(Method::Invite, StatusCode::REQUEST_TERMINATED);
                self.offer_answer.discard();
                self.pending = None;
                self.notify_error(ErrorKind::ApplicationRejection, "re-INVITE cancelled by peer");
                self.transition(InviteState::Connected);
                Ok(())
            }
            _ => self.on_in_dialog(message),
        }
    }

    fn on_answered(&mut self, message: &InboundMessage) -> InviteResult<()> {
        match message {
            InboundMessage::Request { method: Method::Ack, body, .. } => {
                self.retransmit.acknowledge();
                let pending = self.pending.take();
                let offer_in_response = pending.as_ref().map(|p| p.offer_in_response).unwrap_or(false);
                if offer_in_response {
                    match body.answer() {
                        Some(answer) => {
                            let (local, remote) = self.offer_answer.apply_remote_answer(answer.clone())?;
                            self.notify(SessionNotification::AnswerReceived { sdp: answer.clone() });
                            self.notify_negotiated(local, remote);
                        }
                        None => {
                            warn!(session_id = %self.id, "ACK did not carry the answer to our offer");
                            self.offer_answer.discard();
                            self.notify_error(ErrorKind::ProtocolViolation, message.to_string());
                        }
                    }
                } else {
                    let (local, remote) = self.offer_answer.commit_local_answer()?;
                    self.notify_negotiated(local, remote);
                }
                self.transition(InviteState::Connected);
                self.rearm_session_timer();
                Ok(())
            }
            InboundMessage::Request { method: Method::Invite | Method::Update, body, .. }
                if message.method() == Method::Invite || body.offer().is_some() =>
            {
                warn!(session_id = %self.id, "offer received before our 2xx was acknowledged");
                self.respond(message.method(), StatusCode::SERVER_INTERNAL_ERROR);
                self.notify_error(ErrorKind::ProtocolViolation, message.to_string());
                Ok(())
            }
            _ => self.on_in_dialog(message),
        }
    }

    fn on_waiting_to_terminate(&mut self, message: &InboundMessage) -> InviteResult<()> {
        let pending = self.pending.clone();
        match (message, pending) {
            (InboundMessage::Response { method, status, .. }, Some(pending))
                if pending.is_local() && *method == pending.kind.method() && status.is_final() =>
            {
                if status.is_success() && *method == Method::Invite {
                    self.send_ack(Body::None);
                }
                self.send_bye();
                self.terminate(TerminationReason::LocalHangup);
                Ok(())
            }
            (InboundMessage::Request { method: Method::Ack, .. }, Some(pending)) if !pending.is_local() => {
                self.retransmit.acknowledge();
                self.send_bye();
                self.terminate(TerminationReason::LocalHangup);
                Ok(())
            }
            (InboundMessage::Request { method: Method::Invite | Method::Update, .. }, _) => {
                self.respond(message.method(), StatusCode::REQUEST_PENDING);
                Ok(())
            }
            _ => self.on_in_dialog(message),
        }
    }

    /// Messages every connected-phase state handles the same way
    pub(crate) fn on_in_dialog(&mut self, message: &InboundMessage) -> InviteResult<()> {
        match message {
            InboundMessage::Request { method: Method::Bye, .. } => {
                if let Some(pending) = self.pending.clone() {
                    let unanswered = matches!(
                        self.state,
                        InviteState::ReceivedReinvite | InviteState::ReceivedReinviteNoOffer
                    );
                    if unanswered && !pending.is_local() {
                        self.respond(Method::Invite, StatusCode::REQUEST_TERMINATED);
                    }
                }
                self.respond(Method::Bye, StatusCode::OK);
                self.terminate(TerminationReason::RemoteHangup);
                Ok(())
            }
            InboundMessage::Request { method: Method::Info, body, .. } => {
                self.respond(Method::Info, StatusCode::OK);
                let content = match body {
                    Body::Info(content) => content.clone(),
                    _ => InfoContent::new("application/octet-stream", Vec::new()),
                };
                self.notify(SessionNotification::InfoReceived { content });
                Ok(())
            }
            InboundMessage::Request { method: Method::Refer, body, .. } => match body {
                Body::ReferTo(target) => {
                    self.send_response(OutboundResponse::new(Method::Refer, StatusCode::ACCEPTED, Body::None));
                    self.notify(SessionNotification::ReferReceived { target: target.clone() });
                    Ok(())
                }
                _ => Err(InviteError::protocol_violation("REFER without a Refer-To target")),
            },
            InboundMessage::Request { method: Method::Update, body: Body::None, .. } => {
                self.answer_refresh_update(message);
                Ok(())
            }
            InboundMessage::Request { method: Method::Prack, .. } => {
                self.respond(Method::Prack, StatusCode::CALL_DOES_NOT_EXIST);
                Ok(())
            }
            InboundMessage::Request { method: Method::Invite | Method::Update, .. } => {
                Err(InviteError::protocol_violation(format!("unexpected offer in {}", self.state)))
            }
            InboundMessage::Request { method, .. } => {
                trace!(session_id = %self.id, method = %method, "request ignored");
                Ok(())
            }
            InboundMessage::Response { method: method @ (Method::Info | Method::Refer), status, .. } => {
                if self.subsidiary.complete(*method, *status) {
                    if status.is_dialog_failure() {
                        return self.fail_dialog(*status);
                    }
                    let notification = match method {
                        Method::Info => SessionNotification::InfoCompleted { status: *status },
                        _ => SessionNotification::ReferCompleted { status: *status },
                    };
                    self.notify(notification);
                }
                Ok(())
            }
            InboundMessage::Response { method: Method::Invite, status, .. } if status.is_success() => {
                // our ACK got lost
                if let Some(ack) = self.last_ack.clone() {
                    debug!(session_id = %self.id, "2xx retransmission, re-sending ACK");
                    self.send_request(ack);
                }
                Ok(())
            }
            InboundMessage::Response { .. } => {
                trace!(session_id = %self.id, message = %message, "response ignored");
                Ok(())
            }
        }
    }

    // ---- remote modifications --------------------------------------------

    fn receive_reinvite(&mut self, message: &InboundMessage, body: &Body) -> InviteResult<()> {
        if self.reject_short_interval(message) {
            return Ok(());
        }
        let mut pending = PendingModification::remote(ModificationKind::Reinvite, message.session_expires());
        match body {
            Body::Offer(offer) => {
                self.offer_answer.receive_remote_offer(offer.clone())?;
                self.pending = Some(pending);
                self.transition(InviteState::ReceivedReinvite);
                self.notify(SessionNotification::OfferReceived { sdp: offer.clone() });
                Ok(())
            }
            Body::None => {
                pending.offer_in_response = true;
                self.pending = Some(pending);
                self.transition(InviteState::ReceivedReinviteNoOffer);
                match self.config.no_offer_reinvite {
                    NoOfferPolicy::OfferCurrent => {
                        let Some(current) = self.offer_answer.current_local().cloned() else {
                            return Err(InviteError::protocol_violation(
                                "offerless re-INVITE before any description was negotiated",
                            ));
                        };
                        self.answer_with_offer(current)
                    }
                    NoOfferPolicy::AskApplication => {
                        self.notify(SessionNotification::OfferRequested);
                        Ok(())
                    }
                }
            }
            _ => Err(InviteError::protocol_violation("re-INVITE carried an answer")),
        }
    }

    fn receive_update(&mut self, message: &InboundMessage, body: &Body) -> InviteResult<()> {
        if self.reject_short_interval(message) {
            return Ok(());
        }
        match body {
            Body::Offer(offer) => {
                self.offer_answer.receive_remote_offer(offer.clone())?;
                self.pending = Some(PendingModification::remote(
                    ModificationKind::Update,
                    message.session_expires(),
                ));
                self.transition(InviteState::ReceivedUpdate);
                self.notify(SessionNotification::OfferReceived { sdp: offer.clone() });
                Ok(())
            }
            Body::None => {
                self.answer_refresh_update(message);
                Ok(())
            }
            _ => Err(InviteError::protocol_violation("UPDATE carried an answer")),
        }
    }

    /// Bodiless UPDATE: a pure session refresh
    pub(crate) fn answer_refresh_update(&mut self, message: &InboundMessage) {
        if self.reject_short_interval(message) {
            return;
        }
        let mut response = OutboundResponse::new(Method::Update, StatusCode::OK, Body::None);
        response.session_expires = self.session_timer.answer_request(message.session_expires());
        self.send_response(response);
        if self.state.is_connected_phase() {
            self.rearm_session_timer();
        }
        debug!(session_id = %self.id, "session refreshed by peer");
        self.notify(SessionNotification::SessionRefreshed);
    }

    /// 2xx to an offerless re-INVITE, carrying our offer
    fn answer_with_offer(&mut self, offer: Sdp) -> InviteResult<()> {
        let offer = self.offer_answer.send_local_offer(offer)?;
        let requested = self.pending.as_ref().and_then(|p| p.session_expires);
        let mut response = OutboundResponse::new(Method::Invite, StatusCode::OK, Body::Offer(offer));
        response.session_expires = self.session_timer.answer_request(requested);
        self.send_invite_success(response);
        self.transition(InviteState::Answered);
        Ok(())
    }

    pub(crate) fn reject_collision(&mut self, message: &InboundMessage) -> InviteResult<()> {
        let method = message.method();
        warn!(session_id = %self.id, method = %method, "glare: rejecting peer modification with 491");
        self.respond(method, StatusCode::REQUEST_PENDING);
        self.notify_error(
            ErrorKind::GlareCollision,
            InviteError::GlareCollision { method }.to_string(),
        );
        Ok(())
    }

    // ---- local modification outcomes ---------------------------------------

    fn complete_local_modification(
        &mut self,
        pending: PendingModification,
        message: &InboundMessage,
    ) -> InviteResult<()> {
        self.pending = None;
        match message.body().answer() {
            Some(answer) => {
                let (local, remote) = self.offer_answer.apply_remote_answer(answer.clone())?;
                self.notify(SessionNotification::AnswerReceived { sdp: answer.clone() });
                self.notify_negotiated(local, remote);
            }
            None => {
                warn!(session_id = %self.id, "2xx to our offer carried no answer");
                self.offer_answer.discard();
                self.notify_error(ErrorKind::ProtocolViolation, message.to_string());
            }
        }
        if pending.kind == ModificationKind::Reinvite {
            self.send_ack(Body::None);
        }
        self.session_timer.apply_response(message.session_expires());
        if pending.is_refresh {
            self.notify(SessionNotification::SessionRefreshed);
        }
        self.rearm_session_timer();
        Ok(())
    }

    fn fail_local_modification(&mut self, pending: PendingModification, status: StatusCode) -> InviteResult<()> {
        if pending.kind == ModificationKind::Reinvite {
            // the transaction layer ACKs non-2xx finals
            trace!(session_id = %self.id, status = %status, "re-INVITE failed");
        }
        self.pending = None;
        let Some(offer) = self.offer_answer.proposed_local().cloned() else {
            return Err(InviteError::protocol_violation("failed modification without a proposal"));
        };
        self.offer_answer.discard();

        if status.is_glare() {
            self.glare.on_rejected(GlareRetry {
                kind: pending.kind,
                offer,
                contact: pending.contact,
            });
            self.notify_error(
                ErrorKind::GlareCollision,
                InviteError::GlareCollision { method: pending.kind.method() }.to_string(),
            );
            self.transition(pending.kind.glare_state());
            return Ok(());
        }
        if status.is_dialog_failure() {
            return self.fail_dialog(status);
        }

        info!(session_id = %self.id, status = %status, "peer rejected our modification");
        self.notify(SessionNotification::ModificationRejected { status });
        self.transition(InviteState::Connected);
        self.rearm_session_timer();
        Ok(())
    }

    /// Final response to the PRACK that carried our late offer. The session
    /// timer stays as the INVITE's 2xx negotiated it.
    fn conclude_prack_offer(&mut self, message: &InboundMessage, status: StatusCode) -> InviteResult<()> {
        self.pending = None;
        match message.body().answer() {
            Some(answer) if status.is_success() => {
                let (local, remote) = self.offer_answer.apply_remote_answer(answer.clone())?;
                self.notify(SessionNotification::AnswerReceived { sdp: answer.clone() });
                self.notify_negotiated(local, remote);
            }
            _ if status.is_success() => {
                warn!(session_id = %self.id, "PRACK 2xx without the answer to our offer");
                self.offer_answer.discard();
                self.notify_error(ErrorKind::ProtocolViolation, message.to_string());
            }
            _ => {
                self.offer_answer.discard();
                self.notify(SessionNotification::ModificationRejected { status });
            }
        }
        self.transition(InviteState::Connected);
        Ok(())
    }

    /// 408/481: the dialog is gone on the far side
    fn fail_dialog(&mut self, status: StatusCode) -> InviteResult<()> {
        warn!(session_id = %self.id, status = %status, "dialog failure, tearing down");
        self.send_bye();
        self.terminate(TerminationReason::DialogFailure(status));
        Ok(())
    }

    // ---- local operations ------------------------------------------------

    pub(crate) fn provide_offer(&mut self, sdp: Sdp) -> InviteResult<()> {
        match self.state {
            // sent by `settle` once nothing else is outstanding; a newer
            // description replaces one still waiting
            InviteState::Connected | InviteState::WaitingToOffer | InviteState::Answered => {
                self.queued_offer = Some(QueuedOffer {
                    kind: ModificationKind::Reinvite,
                    offer: sdp,
                    contact: None,
                });
                Ok(())
            }
            InviteState::ReceivedReinviteNoOffer => self.answer_with_offer(sdp),
            InviteState::SentReinviteGlare | InviteState::SentUpdateGlare => {
                self.glare.replace_offer(sdp);
                Ok(())
            }
            InviteState::SentReinvite | InviteState::SentUpdate => Err(InviteError::protocol_violation(
                "offer proposed while a previous offer is unanswered",
            )),
            InviteState::ReceivedReinvite | InviteState::ReceivedUpdate => Err(
                InviteError::protocol_violation("offer proposed while the peer's offer is unanswered"),
            ),
            state => Err(InviteError::invalid_state("provide offer", state)),
        }
    }

    pub(crate) fn provide_answer(&mut self, sdp: Sdp) -> InviteResult<()> {
        match self.state {
            InviteState::ReceivedReinvite => {
                self.offer_answer.stage_local_answer(sdp.clone())?;
                let requested = self.pending.as_ref().and_then(|p| p.session_expires);
                let mut response = OutboundResponse::new(Method::Invite, StatusCode::OK, Body::Answer(sdp));
                response.session_expires = self.session_timer.answer_request(requested);
                self.send_invite_success(response);
                self.transition(InviteState::Answered);
                Ok(())
            }
            InviteState::ReceivedUpdate => {
                self.offer_answer.stage_local_answer(sdp.clone())?;
                let (local, remote) = self.offer_answer.commit_local_answer()?;
                let requested = self.pending.take().and_then(|p| p.session_expires);
                let mut response = OutboundResponse::new(Method::Update, StatusCode::OK, Body::Answer(sdp));
                response.session_expires = self.session_timer.answer_request(requested);
                self.send_response(response);
                self.notify_negotiated(local, remote);
                self.transition(InviteState::Connected);
                self.rearm_session_timer();
                Ok(())
            }
            _ => Err(InviteError::protocol_violation(
                "answer provided with no outstanding offer from the peer",
            )),
        }
    }

    pub(crate) fn reject(&mut self, status: StatusCode) -> InviteResult<()> {
        let method = match self.state {
            InviteState::ReceivedReinvite | InviteState::ReceivedReinviteNoOffer => Method::Invite,
            InviteState::ReceivedUpdate => Method::Update,
            state => return Err(InviteError::invalid_state("reject", state)),
        };
        info!(session_id = %self.id, status = %status, method = %method, "rejecting peer modification");
        self.respond(method, status);
        self.offer_answer.discard();
        self.pending = None;
        self.notify_error(
            ErrorKind::ApplicationRejection,
            InviteError::ApplicationRejection { status }.to_string(),
        );
        self.transition(InviteState::Connected);
        Ok(())
    }

    pub(crate) fn end(&mut self) -> InviteResult<()> {
        match self.state {
            InviteState::Connected
            | InviteState::WaitingToOffer
            | InviteState::SentReinviteGlare
            | InviteState::SentUpdateGlare => {
                self.send_bye();
                self.terminate(TerminationReason::LocalHangup);
            }
            InviteState::SentReinvite | InviteState::SentUpdate | InviteState::Answered => {
                debug!(session_id = %self.id, state = %self.state, "hangup waits for the outstanding transaction");
                self.queued_offer = None;
                self.transition(InviteState::WaitingToTerminate);
            }
            InviteState::ReceivedReinvite
            | InviteState::ReceivedReinviteNoOffer
            | InviteState::ReceivedUpdate => {
                let method = self.pending.as_ref().map(|p| p.kind.method()).unwrap_or(Method::Invite);
                self.respond(method, StatusCode::NOT_ACCEPTABLE_HERE);
                self.send_bye();
                self.terminate(TerminationReason::LocalHangup);
            }
            InviteState::WaitingToTerminate => {}
            state => return Err(InviteError::invalid_state("end", state)),
        }
        Ok(())
    }

    pub(crate) fn target_refresh(&mut self, contact: String) -> InviteResult<()> {
        if self.state != InviteState::Connected {
            return Err(InviteError::invalid_state("target refresh", self.state));
        }
        let Some(current) = self.offer_answer.current_local().cloned() else {
            return Err(InviteError::invalid_state("target refresh", self.state));
        };
        info!(session_id = %self.id, contact = %contact, "target refresh");
        self.send_modification(self.refresh_kind(), current, Some(contact), false)
    }

    pub(crate) fn info(&mut self, content: InfoContent) -> InviteResult<()> {
        self.require_connected_phase("send INFO")?;
        self.subsidiary.begin(Method::Info)?;
        self.send_request(OutboundRequest::new(Method::Info, Body::Info(content)));
        Ok(())
    }

    pub(crate) fn refer(&mut self, target: String) -> InviteResult<()> {
        self.require_connected_phase("send REFER")?;
        self.subsidiary.begin(Method::Refer)?;
        self.send_request(OutboundRequest::new(Method::Refer, Body::ReferTo(target)));
        Ok(())
    }

    fn require_connected_phase(&self, operation: &'static str) -> InviteResult<()> {
        if self.state.is_connected_phase() && self.state != InviteState::WaitingToTerminate {
            Ok(())
        } else {
            Err(InviteError::invalid_state(operation, self.state))
        }
    }
}
