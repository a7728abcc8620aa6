//! INVITE session state machine
//!
//! An [`InviteSession`] owns one INVITE-established session from the initial
//! INVITE until teardown. It is sans-IO: inbound messages and timer fires are
//! fed in through [`InviteSession::dispatch`], application decisions through
//! the operation methods, and everything the session wants done comes back as
//! [`SessionAction`]s from [`InviteSession::take_actions`].
//!
//! ## Structure
//!
//! ```text
//! ┌────────────────────────── InviteSession ──────────────────────────┐
//! │  role: &dyn RoleBehavior   (ClientRole | ServerRole)               │
//! │      establishment phase handlers and operations                   │
//! │                                                                    │
//! │  core: SessionCore                                                 │
//! │      state, OfferAnswerStore, PendingModification,                 │
//! │      RetransmissionController, GlareResolver,                      │
//! │      SessionTimerNegotiator, SubsidiaryRequestTracker, TimerSet    │
//! │      connected phase handlers and operations                       │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every event and operation is atomic: the core is checkpointed before the
//! handler runs and restored if it fails, so a rejected message never leaves
//! half-applied state behind. Failed inbound requests are answered with 500
//! (or 491 for collisions) and reported as an error notification.

mod client;
mod connected;
mod common;
mod role;
mod server;
mod state;


use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::actions::SessionAction;
use crate::config::SessionConfig;
use crate::errors::{InviteError, InviteResult};
use crate::message::SessionEvent;
use crate::offer_answer::SdpSnapshot;
use crate::session_timer::SessionTimerConfig;
use crate::subsidiary::SubsidiaryRequestState;
use crate::types::{InfoContent, Method, Role, Sdp, SessionExpires, SessionId, StatusCode};

pub use self::state::InviteState;

pub(crate) use self::client::ClientRole;
pub(crate) use self::common::SessionCore;
pub(crate) use self::role::RoleBehavior;
pub(crate) use self::server::ServerRole;

/// Kind of session modification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModificationKind {
    Reinvite,
    Update,
    /// Caller's late offer in a PRACK, still open when the INVITE's 2xx arrived
    Prack,
}

impl ModificationKind {
    pub fn method(&self) -> Method {
        match self {
            ModificationKind::Reinvite => Method::Invite,
            ModificationKind::Update => Method::Update,
            ModificationKind::Prack => Method::Prack,
        }
    }

    pub(crate) fn sent_state(&self) -> InviteState {
        match self {
            ModificationKind::Reinvite => InviteState::SentReinvite,
            ModificationKind::Update | ModificationKind::Prack => InviteState::SentUpdate,
        }
    }

    pub(crate) fn glare_state(&self) -> InviteState {
        match self {
            ModificationKind::Reinvite => InviteState::SentReinviteGlare,
            ModificationKind::Update | ModificationKind::Prack => InviteState::SentUpdateGlare,
        }
    }
}

/// Which side started a modification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    Local,
    Remote,
}

/// The one renegotiation in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingModification {
    pub kind: ModificationKind,
    pub origin: Origin,
    /// Remote offerless re-INVITE: our 2xx carries the offer, the ACK the answer
    pub offer_in_response: bool,
    /// Session-Expires the peer put in its request
    pub session_expires: Option<SessionExpires>,
    /// Sent to keep the session timer alive
    pub is_refresh: bool,
    /// Contact for a target refresh
    pub contact: Option<String>,
    /// 2xx retransmissions sent so far
    pub retransmits: u32,
}

impl PendingModification {
    pub(crate) fn local(kind: ModificationKind, contact: Option<String>, is_refresh: bool) -> Self {
        Self {
            kind,
            origin: Origin::Local,
            offer_in_response: false,
            session_expires: None,
            is_refresh,
            contact,
            retransmits: 0,
        }
    }

    pub(crate) fn remote(kind: ModificationKind, session_expires: Option<SessionExpires>) -> Self {
        Self {
            kind,
            origin: Origin::Remote,
            offer_in_response: false,
            session_expires,
            is_refresh: false,
            contact: None,
            retransmits: 0,
        }
    }

    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }
}

/// A local offer waiting for the session to settle
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueuedOffer {
    pub kind: ModificationKind,
    pub offer: Sdp,
    pub contact: Option<String>,
}

/// What the dialog layer learned about the peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialogContext {
    /// Peer listed UPDATE in Allow
    pub peer_supports_update: bool,
    /// Peer supports reliable provisionals (100rel)
    pub peer_supports_100rel: bool,
}

impl DialogContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update(mut self) -> Self {
        self.peer_supports_update = true;
        self
    }

    pub fn with_100rel(mut self) -> Self {
        self.peer_supports_100rel = true;
        self
    }
}

/// One INVITE-established session
#[derive(Debug)]
pub struct InviteSession {
    core: SessionCore,
    role: &'static dyn RoleBehavior,
}

impl InviteSession {
    /// Session for an outgoing call. The initial INVITE is queued as the first
    /// action; `offer` goes in its body, or the offer comes later (late offer).
    pub(crate) fn new_client(
        id: SessionId,
        config: Arc<SessionConfig>,
        dialog: DialogContext,
        offer: Option<Sdp>,
    ) -> InviteResult<Self> {
        let mut core = SessionCore::new(id, Role::Uac, config, dialog);
        core.send_initial_invite(offer)?;
        Ok(Self {
            core,
            role: &ClientRole,
        })
    }

    /// Session for an incoming call; the INVITE is delivered through `dispatch`
    pub(crate) fn new_server(id: SessionId, config: Arc<SessionConfig>, dialog: DialogContext) -> Self {
        Self {
            core: SessionCore::new(id, Role::Uas, config, dialog),
            role: &ServerRole,
        }
    }

    pub fn id(&self) -> SessionId {
        self.core.id
    }

    pub fn role(&self) -> Role {
        self.role.role()
    }

    pub fn state(&self) -> InviteState {
        self.core.state
    }

    pub fn is_terminated(&self) -> bool {
        self.core.state.is_terminated()
    }

    pub fn termination_reason(&self) -> Option<crate::actions::TerminationReason> {
        self.core.termination
    }

    /// Feed an inbound message or timer fire through the state machine.
    ///
    /// Never fails: an event the session cannot apply is rejected toward the
    /// peer and reported to the application, and the session stays in the
    /// state it was in before the event.
    pub fn dispatch(&mut self, event: impl Into<SessionEvent>) {
        let event = event.into();
        if self.core.state.is_terminated() {
            self.core.dispatch_after_termination(&event);
            return;
        }

        let checkpoint = self.core.clone();
        let from = self.core.state;
        let result = match &event {
            SessionEvent::Message(message) => {
                if from.is_early() {
                    self.role.dispatch(&mut self.core, message)
                } else {
                    self.core.dispatch_connected_phase(message)
                }
            }
            SessionEvent::Timer(fire) => self.core.dispatch_timer(*fire),
        }
        .and_then(|_| self.core.settle());

        match result {
            Ok(()) => debug!(
                session_id = %self.core.id,
                event = %event,
                from = %from,
                to = %self.core.state,
                "event handled"
            ),
            Err(err) => {
                warn!(
                    session_id = %self.core.id,
                    event = %event,
                    state = %from,
                    error = %err,
                    "event rejected, state restored"
                );
                self.core = checkpoint;
                self.core.recover(&event, &err);
            }
        }
    }

    /// Run a local operation atomically
    fn guarded<T>(
        &mut self,
        operation: impl FnOnce(&mut SessionCore, &'static dyn RoleBehavior) -> InviteResult<T>,
    ) -> InviteResult<T> {
        if self.core.state.is_terminated() {
            return Err(InviteError::Terminated(self.core.id));
        }
        let checkpoint = self.core.clone();
        let result = operation(&mut self.core, self.role).and_then(|value| {
            self.core.settle()?;
            Ok(value)
        });
        if result.is_err() {
            self.core = checkpoint;
        }
        result
    }

    /// Offer a new session description (renegotiation, late offer, or the
    /// offer the peer asked for)
    pub fn provide_offer(&mut self, sdp: Sdp) -> InviteResult<()> {
        self.guarded(|core, role| {
            if core.state.is_early() {
                role.provide_offer(core, sdp)
            } else {
                core.provide_offer(sdp)
            }
        })
    }

    /// Answer the peer's outstanding offer
    pub fn provide_answer(&mut self, sdp: Sdp) -> InviteResult<()> {
        self.guarded(|core, role| {
            if core.state.is_early() {
                role.provide_answer(core, sdp)
            } else {
                core.provide_answer(sdp)
            }
        })
    }

    /// Hang up. Waits for an outstanding transaction when the protocol
    /// requires it. Ending a terminated session does nothing.
    pub fn end(&mut self) -> InviteResult<()> {
        if self.core.state.is_terminated() {
            return Ok(());
        }
        self.guarded(|core, role| {
            if core.state.is_early() {
                role.end(core)
            } else {
                core.end()
            }
        })
    }

    /// Refuse the peer's outstanding offer (or the whole call before it is
    /// accepted) with a final failure status
    pub fn reject(&mut self, status: impl Into<StatusCode>) -> InviteResult<()> {
        let status = status.into();
        if status.0 < 300 || status.0 > 699 {
            return Err(InviteError::invalid_status(status, "rejection needs a 3xx-6xx status"));
        }
        self.guarded(|core, role| {
            if core.state.is_early() {
                role.reject(core, status)
            } else {
                core.reject(status)
            }
        })
    }

    /// Answer the initial INVITE with 200
    pub fn accept(&mut self) -> InviteResult<()> {
        self.guarded(|core, role| role.accept(core))
    }

    /// Send a provisional response to the initial INVITE. When the peer
    /// supports 100rel and a description is staged, it goes out reliably.
    pub fn provisional(&mut self, status: impl Into<StatusCode>) -> InviteResult<()> {
        let status = status.into();
        if !status.is_provisional() || status.0 == 100 {
            return Err(InviteError::invalid_status(status, "provisional needs a 101-199 status"));
        }
        self.guarded(|core, role| role.provisional(core, status))
    }

    /// Tell the peer our new contact, re-sending the current description
    pub fn target_refresh(&mut self, contact: impl Into<String>) -> InviteResult<()> {
        let contact = contact.into();
        self.guarded(|core, _| core.target_refresh(contact))
    }

    pub fn refer(&mut self, target: impl Into<String>) -> InviteResult<()> {
        let target = target.into();
        self.guarded(|core, _| core.refer(target))
    }

    pub fn info(&mut self, content: InfoContent) -> InviteResult<()> {
        self.guarded(|core, _| core.info(content))
    }

    /// Negotiated local description
    pub fn local_sdp(&self) -> Option<&Sdp> {
        self.core.offer_answer.current_local()
    }

    /// Negotiated remote description
    pub fn remote_sdp(&self) -> Option<&Sdp> {
        self.core.offer_answer.current_remote()
    }

    pub fn sdp_snapshot(&self) -> SdpSnapshot {
        self.core.offer_answer.snapshot()
    }

    pub fn pending_modification(&self) -> Option<&PendingModification> {
        self.core.pending.as_ref()
    }

    pub fn session_timer(&self) -> Option<SessionTimerConfig> {
        self.core.session_timer.current()
    }

    pub fn subsidiary_state(&self) -> SubsidiaryRequestState {
        self.core.subsidiary.state()
    }

    pub fn peer_supports_update(&self) -> bool {
        self.core.dialog.peer_supports_update
    }

    /// Number of glare collisions seen so far
    pub fn glare_collisions(&self) -> u32 {
        self.core.glare.collisions()
    }

    /// Drain the actions queued since the last call
    pub fn take_actions(&mut self) -> Vec<SessionAction> {
        self.core.take_actions()
    }

    pub fn has_actions(&self) -> bool {
        self.core.has_actions()
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &SessionCore {
        &self.core
    }
}
