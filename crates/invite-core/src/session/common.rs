//! Session data and the helpers every handler shares

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::actions::{
    OutboundRequest, OutboundResponse, SessionAction, SessionNotification, TerminationReason,
};
use crate::config::{RefreshMethod, SessionConfig};
use crate::errors::{ErrorKind, InviteError, InviteResult};
use crate::glare::GlareResolver;
use crate::message::{Body, InboundMessage, SessionEvent};
use crate::offer_answer::OfferAnswerStore;
use crate::retransmit::{RetransmissionController, RetransmitStep};
use crate::session_timer::SessionTimerNegotiator;
use crate::subsidiary::SubsidiaryRequestTracker;
use crate::timer::{TimerFire, TimerKind, TimerSet};
use crate::types::{Method, Role, Sdp, SessionExpires, SessionId, StatusCode};

use super::{DialogContext, InviteState, ModificationKind, PendingModification, QueuedOffer};

/// Everything one session knows. Cloned as a checkpoint before each event.
#[derive(Debug, Clone)]
pub(crate) struct SessionCore {
    pub(crate) id: SessionId,
    pub(crate) config: Arc<SessionConfig>,
    pub(crate) dialog: DialogContext,
    pub(crate) state: InviteState,
    pub(crate) offer_answer: OfferAnswerStore,
    pub(crate) pending: Option<PendingModification>,
    pub(crate) queued_offer: Option<QueuedOffer>,
    pub(crate) refresh_due: bool,
    pub(crate) retransmit: RetransmissionController,
    pub(crate) glare: GlareResolver,
    pub(crate) session_timer: SessionTimerNegotiator,
    pub(crate) subsidiary: SubsidiaryRequestTracker,
    pub(crate) timers: TimerSet,
    /// Session-Expires of the initial INVITE (server side)
    pub(crate) initial_session_expires: Option<SessionExpires>,
    /// ACK for our last 2xx-answered INVITE, re-sent on 2xx retransmission
    pub(crate) last_ack: Option<OutboundRequest>,
    pub(crate) termination: Option<TerminationReason>,
    outbox: Vec<SessionAction>,
}

impl SessionCore {
    pub(crate) fn new(
        id: SessionId,
        role: Role,
        config: Arc<SessionConfig>,
        dialog: DialogContext,
    ) -> Self {
        let state = match role {
            Role::Uac => InviteState::UacStart,
            Role::Uas => InviteState::UasStart,
        };
        Self {
            id,
            dialog,
            state,
            offer_answer: OfferAnswerStore::new(),
            pending: None,
            queued_offer: None,
            refresh_due: false,
            retransmit: RetransmissionController::from_config(&config),
            // the caller generated the Call-ID
            glare: GlareResolver::new(config.glare.clone(), role == Role::Uac),
            session_timer: SessionTimerNegotiator::new(config.session_timer.clone()),
            subsidiary: SubsidiaryRequestTracker::new(),
            timers: TimerSet::new(),
            initial_session_expires: None,
            last_ack: None,
            termination: None,
            outbox: Vec::new(),
            config,
        }
    }

    // ---- outputs -------------------------------------------------------

    pub(crate) fn send_request(&mut self, request: OutboundRequest) {
        trace!(session_id = %self.id, method = %request.method, "queue request");
        self.outbox.push(SessionAction::SendRequest(request));
    }

    pub(crate) fn send_response(&mut self, response: OutboundResponse) {
        trace!(
            session_id = %self.id,
            method = %response.method,
            status = %response.status,
            "queue response"
        );
        self.outbox.push(SessionAction::SendResponse(response));
    }

    /// Bodiless response
    pub(crate) fn respond(&mut self, method: Method, status: StatusCode) {
        self.send_response(OutboundResponse::new(method, status, Body::None));
    }

    pub(crate) fn notify(&mut self, notification: SessionNotification) {
        self.outbox.push(SessionAction::Notify(notification));
    }

    pub(crate) fn notify_error(&mut self, kind: ErrorKind, trigger: impl Into<String>) {
        self.notify(SessionNotification::Error {
            kind,
            trigger: trigger.into(),
        });
    }

    pub(crate) fn notify_negotiated(&mut self, local: Sdp, remote: Sdp) {
        info!(session_id = %self.id, "session description negotiated");
        self.notify(SessionNotification::Negotiated { local, remote });
    }

    pub(crate) fn take_actions(&mut self) -> Vec<SessionAction> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn has_actions(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub(crate) fn send_bye(&mut self) {
        self.send_request(OutboundRequest::new(Method::Bye, Body::None));
    }

    /// ACK a 2xx to an INVITE and remember it for 2xx retransmissions
    pub(crate) fn send_ack(&mut self, body: Body) {
        let ack = OutboundRequest::new(Method::Ack, body);
        self.last_ack = Some(ack.clone());
        self.send_request(ack);
    }

    /// Send a 2xx to an INVITE and keep retransmitting it until the ACK
    pub(crate) fn send_invite_success(&mut self, response: OutboundResponse) {
        self.retransmit.start(response.clone());
        self.send_response(response);
    }

    /// Answer with 422 if the requested interval is below our Min-SE.
    /// Returns true when the request was rejected.
    pub(crate) fn reject_short_interval(&mut self, message: &InboundMessage) -> bool {
        let requested = message.session_expires();
        match self.session_timer.check_request(requested.as_ref()) {
            Ok(()) => false,
            Err(min_se) => {
                debug!(session_id = %self.id, min_se, "session interval too small");
                let mut response = OutboundResponse::new(
                    message.method(),
                    StatusCode::SESSION_INTERVAL_TOO_SMALL,
                    Body::None,
                );
                response.min_se = Some(min_se);
                self.send_response(response);
                true
            }
        }
    }

    // ---- timers and transitions ------------------------------------------

    pub(crate) fn arm_timer(&mut self, kind: TimerKind, after: Duration) {
        let timer = self.timers.arm(kind, after);
        self.outbox.push(SessionAction::ArmTimer { timer, after });
    }

    pub(crate) fn cancel_timer(&mut self, kind: TimerKind) {
        if self.timers.cancel(kind) {
            self.outbox.push(SessionAction::CancelTimer { kind });
        }
    }

    /// The only place `state` changes. Timers the target does not own are
    /// cancelled; timers its controllers need are armed.
    pub(crate) fn transition(&mut self, target: InviteState) {
        let from = self.state;
        if from == target {
            return;
        }
        for kind in self.timers.armed_kinds() {
            if !target.owns_timer(kind) {
                self.cancel_timer(kind);
            }
        }
        if !target.owns_timer(TimerKind::Retransmit) {
            self.retransmit.stop();
        }
        self.state = target;
        debug!(session_id = %self.id, from = %from, to = %target, "state transition");

        if target.owns_timer(TimerKind::Retransmit)
            && self.retransmit.is_active()
            && !self.timers.is_armed(TimerKind::Retransmit)
        {
            self.arm_timer(TimerKind::Retransmit, self.retransmit.interval());
        }
        if target.is_glare() && !self.timers.is_armed(TimerKind::Glare) {
            if let Some(delay) = self.glare.scheduled_backoff() {
                self.arm_timer(TimerKind::Glare, delay);
            }
        }
        if from.is_early() && target.is_connected_phase() {
            self.rearm_session_timer();
        }
    }

    /// Replace the session refresh/expiry timer after a negotiation
    pub(crate) fn rearm_session_timer(&mut self) {
        self.refresh_due = false;
        self.cancel_timer(TimerKind::SessionRefresh);
        self.cancel_timer(TimerKind::SessionExpiry);
        if let Some((kind, after)) = self.session_timer.next_timer() {
            if self.state.owns_timer(kind) {
                self.arm_timer(kind, after);
            }
        }
    }

    /// Move to `Terminated` and tell the application why
    pub(crate) fn terminate(&mut self, reason: TerminationReason) {
        self.terminate_in(InviteState::Terminated, reason);
    }

    pub(crate) fn terminate_in(&mut self, target: InviteState, reason: TerminationReason) {
        if self.state.is_terminated() {
            return;
        }
        self.retransmit.stop();
        self.glare.clear();
        self.subsidiary.reset();
        self.offer_answer.discard();
        self.pending = None;
        self.queued_offer = None;
        self.refresh_due = false;
        self.termination = Some(reason);
        self.transition(target);
        info!(session_id = %self.id, reason = %reason, state = %target, "session terminated");
        self.notify(SessionNotification::Terminated { reason });
    }

    pub(crate) fn dispatch_timer(&mut self, fire: TimerFire) -> InviteResult<()> {
        if !self.timers.accept(&fire) {
            trace!(session_id = %self.id, kind = %fire.kind, generation = fire.generation, "stale timer ignored");
            return Ok(());
        }
        match fire.kind {
            TimerKind::Retransmit => self.on_retransmit_timer(),
            TimerKind::Glare => self.on_glare_timer(),
            TimerKind::SessionRefresh => self.on_refresh_timer(),
            TimerKind::SessionExpiry => {
                warn!(session_id = %self.id, "peer did not refresh the session");
                self.notify(SessionNotification::RefreshMissed);
                Ok(())
            }
        }
    }

    fn on_retransmit_timer(&mut self) -> InviteResult<()> {
        match self.retransmit.on_fire() {
            Some(RetransmitStep::Resend { response, next }) => {
                self.send_response(response);
                self.arm_timer(TimerKind::Retransmit, next);
                let attempts = self.retransmit.attempts();
                if let Some(pending) = &mut self.pending {
                    pending.retransmits = attempts;
                }
            }
            Some(RetransmitStep::Exhausted { attempts }) => {
                let err = InviteError::AckTimeout { attempts };
                self.notify_error(ErrorKind::AckTimeout, err.to_string());
                self.send_bye();
                self.terminate(TerminationReason::AckTimeout);
            }
            None => trace!(session_id = %self.id, "retransmit fired with nothing to resend"),
        }
        Ok(())
    }

    fn on_glare_timer(&mut self) -> InviteResult<()> {
        if !self.state.is_glare() {
            return Ok(());
        }
        match self.glare.take_retry() {
            Some(retry) => {
                debug!(session_id = %self.id, kind = ?retry.kind, "retrying modification after glare");
                self.send_modification(retry.kind, retry.offer, retry.contact, false)
            }
            None => {
                self.transition(InviteState::Connected);
                Ok(())
            }
        }
    }

    fn on_refresh_timer(&mut self) -> InviteResult<()> {
        if self.state == InviteState::Connected {
            self.start_refresh()
        } else {
            debug!(session_id = %self.id, state = %self.state, "session refresh deferred");
            self.refresh_due = true;
            Ok(())
        }
    }

    // ---- modifications ---------------------------------------------------

    /// UPDATE when the peer allows it and we prefer it, re-INVITE otherwise
    pub(crate) fn refresh_kind(&self) -> ModificationKind {
        if self.dialog.peer_supports_update && self.config.refresh_method == RefreshMethod::Update {
            ModificationKind::Update
        } else {
            ModificationKind::Reinvite
        }
    }

    pub(crate) fn start_refresh(&mut self) -> InviteResult<()> {
        self.refresh_due = false;
        let Some(offer) = self.offer_answer.current_local().cloned() else {
            debug!(session_id = %self.id, "nothing negotiated yet, skipping session refresh");
            return Ok(());
        };
        info!(session_id = %self.id, "refreshing session");
        self.send_modification(self.refresh_kind(), offer, None, true)
    }

    /// Send a re-INVITE or UPDATE carrying `offer`
    pub(crate) fn send_modification(
        &mut self,
        kind: ModificationKind,
        offer: Sdp,
        contact: Option<String>,
        is_refresh: bool,
    ) -> InviteResult<()> {
        let offer = self.offer_answer.send_local_offer(offer)?;
        let mut request = OutboundRequest::new(kind.method(), Body::Offer(offer));
        request.session_expires = self.session_timer.request_value();
        request.contact = contact.clone();
        self.pending = Some(PendingModification::local(kind, contact, is_refresh));
        self.send_request(request);
        self.transition(kind.sent_state());
        Ok(())
    }

    /// Final response to an UPDATE sent before the session connected. There
    /// is no glare backoff this early; a 491 just drops our offer.
    pub(crate) fn conclude_early_update(
        &mut self,
        message: &InboundMessage,
        status: StatusCode,
    ) -> InviteResult<()> {
        self.pending = None;
        if !status.is_success() {
            self.offer_answer.discard();
            if status.is_glare() {
                self.notify_error(
                    ErrorKind::GlareCollision,
                    InviteError::GlareCollision { method: Method::Update }.to_string(),
                );
            } else {
                self.notify(SessionNotification::ModificationRejected { status });
            }
            return Ok(());
        }
        match message.body().answer() {
            Some(answer) => {
                let (local, remote) = self.offer_answer.apply_remote_answer(answer.clone())?;
                self.notify(SessionNotification::AnswerReceived { sdp: answer.clone() });
                self.notify_negotiated(local, remote);
            }
            None => {
                self.offer_answer.discard();
                self.notify_error(ErrorKind::ProtocolViolation, message.to_string());
            }
        }
        Ok(())
    }

    /// Initial INVITE of a client session
    pub(crate) fn send_initial_invite(&mut self, offer: Option<Sdp>) -> InviteResult<()> {
        let body = match offer {
            Some(offer) => Body::Offer(self.offer_answer.send_local_offer(offer)?),
            None => Body::None,
        };
        let mut request = OutboundRequest::new(Method::Invite, body);
        request.session_expires = self.session_timer.request_value();
        info!(session_id = %self.id, late_offer = request.body.is_none(), "sending INVITE");
        self.send_request(request);
        Ok(())
    }

    /// Start whatever was waiting for the session to become idle
    pub(crate) fn settle(&mut self) -> InviteResult<()> {
        if !matches!(self.state, InviteState::Connected | InviteState::WaitingToOffer) {
            return Ok(());
        }
        if self.queued_offer.is_some() {
            if self.subsidiary.is_proceeding() {
                self.transition(InviteState::WaitingToOffer);
                return Ok(());
            }
            if let Some(queued) = self.queued_offer.take() {
                return self.send_modification(queued.kind, queued.offer, queued.contact, false);
            }
        }
        self.transition(InviteState::Connected);
        if self.refresh_due {
            return self.start_refresh();
        }
        Ok(())
    }

    // ---- error paths -------------------------------------------------------

    /// The checkpoint was restored after `err`; reject the trigger and report
    pub(crate) fn recover(&mut self, event: &SessionEvent, err: &InviteError) {
        let kind = err.kind().unwrap_or(ErrorKind::ProtocolViolation);
        if let SessionEvent::Message(InboundMessage::Request { method, .. }) = event {
            if *method != Method::Ack {
                let status = match kind {
                    ErrorKind::GlareCollision => StatusCode::REQUEST_PENDING,
                    _ => StatusCode::SERVER_INTERNAL_ERROR,
                };
                self.respond(*method, status);
            }
        }
        self.notify_error(kind, format!("{}: {}", event, err));
    }

    /// Terminated sessions only tell the peer the dialog is gone
    pub(crate) fn dispatch_after_termination(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Message(InboundMessage::Request { method, .. }) if *method != Method::Ack => {
                debug!(session_id = %self.id, method = %method, "request after termination");
                self.respond(*method, StatusCode::CALL_DOES_NOT_EXIST);
            }
            SessionEvent::Message(InboundMessage::Response { method: Method::Invite, status, .. })
                if status.is_success() =>
            {
                // the peer still retransmits until our ACK lands, even after BYE
                if let Some(ack) = self.last_ack.clone() {
                    debug!(session_id = %self.id, "2xx retransmission after termination, re-sending ACK");
                    self.send_request(ack);
                }
            }
            _ => trace!(session_id = %self.id, event = %event, "event after termination ignored"),
        }
    }
}
