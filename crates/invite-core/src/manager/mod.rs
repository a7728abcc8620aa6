//! Session manager: the runtime host for INVITE sessions
//!
//! The [`SessionManager`] is the only component that constructs
//! [`InviteSession`]s. It keeps every live session behind a tokio mutex,
//! executes the actions the sessions queue, and realizes their timers as
//! spawned sleep tasks.
//!
//! ## Ownership
//!
//! ```text
//!   SessionManager ──Arc──▶ ManagerInner
//!                             ├── sessions: DashMap<SessionId, Arc<Mutex<InviteSession>>>
//!                             ├── timers:   DashMap<(SessionId, TimerKind), TimerHandle>
//!                             ├── reapers:  DashMap<SessionId, JoinHandle<()>>
//!                             └── output:   mpsc::UnboundedSender<SessionOutput>
//!
//!   timer task ──Weak──▶ ManagerInner      (upgrade on fire, else exit)
//!   reaper task ─Weak──▶ ManagerInner      (upgrade after linger, else exit)
//! ```
//!
//! Timer tasks never keep the manager alive. On fire a task upgrades its weak
//! reference, checks that its arming is still the current one, and feeds the
//! [`TimerFire`] to the session, which drops it if the generation is stale.
//! A session that reaches a terminated state loses its remaining timer tasks
//! at once but stays in the map for
//! [`terminated_linger`](SessionConfig::terminated_linger). Until a reaper task
//! removes it, requests on the dialog are answered with 481 and a retransmitted
//! 2xx to the INVITE gets its ACK again. Dropping the manager aborts every task.
//!
//! Requests, responses and notifications are forwarded on the output channel
//! returned by [`SessionManager::new`] in the order the session queued them.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::actions::SessionAction;
use crate::config::SessionConfig;
use crate::errors::{InviteError, InviteResult};
use crate::message::SessionEvent;
use crate::offer_answer::SdpSnapshot;
use crate::session::{DialogContext, InviteSession, InviteState};
use crate::timer::{TimerFire, TimerKind};
use crate::types::{InfoContent, Sdp, SessionId, StatusCode};

/// An action forwarded to the dialog layer or the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutput {
    pub session_id: SessionId,
    pub action: SessionAction,
}

/// A spawned timer and the arming it belongs to
#[derive(Debug)]
struct TimerHandle {
    generation: u64,
    task: JoinHandle<()>,
}

struct ManagerInner {
    config: Arc<SessionConfig>,
    sessions: DashMap<SessionId, Arc<Mutex<InviteSession>>>,
    timers: DashMap<(SessionId, TimerKind), TimerHandle>,
    reapers: DashMap<SessionId, JoinHandle<()>>,
    output_tx: mpsc::UnboundedSender<SessionOutput>,
}

impl ManagerInner {
    fn session(&self, session_id: SessionId) -> InviteResult<Arc<Mutex<InviteSession>>> {
        self.sessions
            .get(&session_id)
            .map(|entry| entry.value().clone())
            .ok_or(InviteError::SessionNotFound(session_id))
    }

    /// Execute everything `session` queued. Called with the session locked so
    /// outputs of one session stay in order.
    fn drain(self: &Arc<Self>, session: &mut InviteSession) {
        let session_id = session.id();
        for action in session.take_actions() {
            match action {
                SessionAction::ArmTimer { timer, after } => self.arm_timer(session_id, timer, after),
                SessionAction::CancelTimer { kind } => self.cancel_timer(session_id, kind),
                action => {
                    if self.output_tx.send(SessionOutput { session_id, action }).is_err() {
                        trace!(session_id = %session_id, "output receiver dropped");
                    }
                }
            }
        }
        if session.is_terminated() {
            self.linger(session_id);
        }
    }

    /// Keep a terminated session reachable until the linger elapses
    fn linger(self: &Arc<Self>, session_id: SessionId) {
        if self.reapers.contains_key(&session_id) {
            return;
        }
        self.abort_timers(session_id);
        let linger = self.config.terminated_linger();
        if linger.is_zero() {
            self.remove(session_id);
            return;
        }
        debug!(session_id = %session_id, linger_ms = linger.as_millis() as u64, "session terminated, lingering");
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            if let Some(inner) = weak.upgrade() {
                inner.reapers.remove(&session_id);
                inner.remove(session_id);
            }
        });
        self.reapers.insert(session_id, task);
    }

    fn arm_timer(self: &Arc<Self>, session_id: SessionId, timer: TimerFire, after: Duration) {
        trace!(
            session_id = %session_id,
            kind = %timer.kind,
            generation = timer.generation,
            after_ms = after.as_millis() as u64,
            "arming timer"
        );
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            fire(weak, session_id, timer).await;
        });
        let handle = TimerHandle {
            generation: timer.generation,
            task,
        };
        if let Some(previous) = self.timers.insert((session_id, timer.kind), handle) {
            previous.task.abort();
        }
    }

    fn cancel_timer(&self, session_id: SessionId, kind: TimerKind) {
        if let Some((_, handle)) = self.timers.remove(&(session_id, kind)) {
            trace!(session_id = %session_id, kind = %kind, "timer cancelled");
            handle.task.abort();
        }
    }

    /// Forget a session and abort whatever tasks it still has
    fn remove(&self, session_id: SessionId) {
        if self.sessions.remove(&session_id).is_some() {
            info!(session_id = %session_id, "session removed");
        }
        if let Some((_, reaper)) = self.reapers.remove(&session_id) {
            reaper.abort();
        }
        self.abort_timers(session_id);
    }

    fn abort_timers(&self, session_id: SessionId) {
        self.timers.retain(|(id, _), handle| {
            if *id == session_id {
                handle.task.abort();
                false
            } else {
                true
            }
        });
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().task.abort();
        }
        for entry in self.reapers.iter() {
            entry.value().abort();
        }
    }
}

/// Body of a timer task once its sleep elapsed
async fn fire(weak: Weak<ManagerInner>, session_id: SessionId, timer: TimerFire) {
    let Some(inner) = weak.upgrade() else {
        trace!(session_id = %session_id, kind = %timer.kind, "manager gone, timer dropped");
        return;
    };
    // only the current arming may fire; a re-arm replaced the entry already
    let current = inner
        .timers
        .remove_if(&(session_id, timer.kind), |_, handle| handle.generation == timer.generation)
        .is_some();
    if !current {
        trace!(session_id = %session_id, kind = %timer.kind, "superseded timer dropped");
        return;
    }
    let Ok(session) = inner.session(session_id) else {
        trace!(session_id = %session_id, kind = %timer.kind, "timer fired for a removed session");
        return;
    };
    let mut session = session.lock().await;
    debug!(session_id = %session_id, kind = %timer.kind, "timer fired");
    session.dispatch(timer);
    inner.drain(&mut session);
}

/// Owns and drives every INVITE session of one endpoint
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Create a manager and the receiver for everything its sessions send
    pub fn new(config: SessionConfig) -> InviteResult<(Self, mpsc::UnboundedReceiver<SessionOutput>)> {
        config.validate()?;
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            config: Arc::new(config),
            sessions: DashMap::new(),
            timers: DashMap::new(),
            reapers: DashMap::new(),
            output_tx,
        });
        Ok((Self { inner }, output_rx))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Start an outgoing call. The INVITE is the first output of the new
    /// session; without `offer` the call uses a late offer.
    pub async fn create_client_session(
        &self,
        dialog: DialogContext,
        offer: Option<Sdp>,
    ) -> InviteResult<SessionId> {
        let session_id = SessionId::new();
        let session = InviteSession::new_client(session_id, self.inner.config.clone(), dialog, offer)?;
        let session = Arc::new(Mutex::new(session));
        self.inner.sessions.insert(session_id, session.clone());
        info!(session_id = %session_id, "client session created");

        let mut session = session.lock().await;
        self.inner.drain(&mut session);
        Ok(session_id)
    }

    /// Prepare a session for an incoming call; deliver the INVITE with
    /// [`dispatch`](Self::dispatch)
    pub async fn create_server_session(&self, dialog: DialogContext) -> SessionId {
        let session_id = SessionId::new();
        let session = InviteSession::new_server(session_id, self.inner.config.clone(), dialog);
        self.inner
            .sessions
            .insert(session_id, Arc::new(Mutex::new(session)));
        info!(session_id = %session_id, "server session created");
        session_id
    }

    /// Feed an inbound message to a session
    pub async fn dispatch(&self, session_id: SessionId, event: impl Into<SessionEvent>) -> InviteResult<()> {
        let event = event.into();
        let session = self.inner.session(session_id)?;
        let mut session = session.lock().await;
        session.dispatch(event);
        self.inner.drain(&mut session);
        Ok(())
    }

    /// Run `operation` on a session and execute the actions it queued
    pub async fn with_session<T>(
        &self,
        session_id: SessionId,
        operation: impl FnOnce(&mut InviteSession) -> InviteResult<T>,
    ) -> InviteResult<T> {
        let session = self.inner.session(session_id)?;
        let mut session = session.lock().await;
        let result = operation(&mut session);
        self.inner.drain(&mut session);
        result
    }

    pub async fn provide_offer(&self, session_id: SessionId, sdp: Sdp) -> InviteResult<()> {
        self.with_session(session_id, |s| s.provide_offer(sdp)).await
    }

    pub async fn provide_answer(&self, session_id: SessionId, sdp: Sdp) -> InviteResult<()> {
        self.with_session(session_id, |s| s.provide_answer(sdp)).await
    }

    pub async fn end(&self, session_id: SessionId) -> InviteResult<()> {
        self.with_session(session_id, |s| s.end()).await
    }

    pub async fn reject(&self, session_id: SessionId, status: impl Into<StatusCode>) -> InviteResult<()> {
        let status = status.into();
        self.with_session(session_id, |s| s.reject(status)).await
    }

    pub async fn accept(&self, session_id: SessionId) -> InviteResult<()> {
        self.with_session(session_id, |s| s.accept()).await
    }

    pub async fn provisional(&self, session_id: SessionId, status: impl Into<StatusCode>) -> InviteResult<()> {
        let status = status.into();
        self.with_session(session_id, |s| s.provisional(status)).await
    }

    pub async fn target_refresh(&self, session_id: SessionId, contact: impl Into<String>) -> InviteResult<()> {
        let contact = contact.into();
        self.with_session(session_id, |s| s.target_refresh(contact)).await
    }

    pub async fn refer(&self, session_id: SessionId, target: impl Into<String>) -> InviteResult<()> {
        let target = target.into();
        self.with_session(session_id, |s| s.refer(target)).await
    }

    pub async fn info(&self, session_id: SessionId, content: InfoContent) -> InviteResult<()> {
        self.with_session(session_id, |s| s.info(content)).await
    }

    pub async fn state(&self, session_id: SessionId) -> InviteResult<InviteState> {
        let session = self.inner.session(session_id)?;
        let session = session.lock().await;
        Ok(session.state())
    }

    pub async fn local_sdp(&self, session_id: SessionId) -> InviteResult<Option<Sdp>> {
        let session = self.inner.session(session_id)?;
        let session = session.lock().await;
        Ok(session.local_sdp().cloned())
    }

    pub async fn remote_sdp(&self, session_id: SessionId) -> InviteResult<Option<Sdp>> {
        let session = self.inner.session(session_id)?;
        let session = session.lock().await;
        Ok(session.remote_sdp().cloned())
    }

    pub async fn sdp_snapshot(&self, session_id: SessionId) -> InviteResult<SdpSnapshot> {
        let session = self.inner.session(session_id)?;
        let session = session.lock().await;
        Ok(session.sdp_snapshot())
    }

    /// Number of sessions held, terminated ones still lingering included
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.inner.sessions.contains_key(&session_id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Timers currently scheduled on the runtime for a session
    pub fn armed_timers(&self, session_id: SessionId) -> Vec<TimerKind> {
        self.inner
            .timers
            .iter()
            .filter(|entry| entry.key().0 == session_id)
            .map(|entry| entry.key().1)
            .collect()
    }

    /// Drop a session without signaling, e.g. after the dialog layer lost it
    pub fn discard(&self, session_id: SessionId) -> bool {
        let known = self.contains(session_id);
        if known {
            warn!(session_id = %session_id, "discarding session without teardown");
            self.inner.remove(session_id);
        }
        known
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::SessionNotification;
    use crate::message::{Body, InboundMessage};
    use crate::types::Method;

    fn manager() -> (SessionManager, mpsc::UnboundedReceiver<SessionOutput>) {
        SessionManager::new(SessionConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_client_session_emits_invite() {
        let (manager, mut rx) = manager();
        let id = manager
            .create_client_session(DialogContext::new(), Some(Sdp::from("v=0 alice")))
            .await
            .unwrap();

        let output = rx.recv().await.unwrap();
        assert_eq!(output.session_id, id);
        match output.action {
            SessionAction::SendRequest(request) => assert_eq!(request.method, Method::Invite),
            other => panic!("unexpected action {:?}", other),
        }
        assert_eq!(manager.state(id).await.unwrap(), InviteState::UacStart);
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminated_session_lingers_then_is_removed() {
        let (manager, mut rx) = manager();
        let id = manager.create_server_session(DialogContext::new()).await;
        manager
            .dispatch(id, InboundMessage::request(Method::Invite, Body::Offer(Sdp::from("offer"))))
            .await
            .unwrap();
        manager.reject(id, 486).await.unwrap();

        let mut terminated = false;
        while let Ok(output) = rx.try_recv() {
            if let SessionAction::Notify(SessionNotification::Terminated { .. }) = output.action {
                terminated = true;
            }
        }
        assert!(terminated);
        assert!(manager.contains(id));
        assert!(manager.state(id).await.unwrap().is_terminated());
        assert!(manager.armed_timers(id).is_empty());

        manager
            .dispatch(id, InboundMessage::request(Method::Info, Body::None))
            .await
            .unwrap();
        let output = rx.try_recv().unwrap();
        match output.action {
            SessionAction::SendResponse(response) => {
                assert_eq!(response.method, Method::Info);
                assert_eq!(response.status, StatusCode::CALL_DOES_NOT_EXIST);
            }
            other => panic!("unexpected action {:?}", other),
        }

        tokio::time::sleep(manager.config().terminated_linger() + Duration::from_secs(1)).await;
        assert!(!manager.contains(id));
        assert_eq!(manager.session_count(), 0);
        assert!(matches!(manager.end(id).await, Err(InviteError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_zero_linger_removes_at_once() {
        let config = SessionConfig::default().with_terminated_linger(Duration::ZERO);
        let (manager, _rx) = SessionManager::new(config).unwrap();
        let id = manager.create_server_session(DialogContext::new()).await;
        manager
            .dispatch(id, InboundMessage::request(Method::Invite, Body::Offer(Sdp::from("offer"))))
            .await
            .unwrap();
        manager.reject(id, 486).await.unwrap();
        assert!(!manager.contains(id));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = SessionConfig::default().with_timers(Duration::ZERO, Duration::from_secs(4));
        assert!(SessionManager::new(config).is_err());
    }

    #[tokio::test]
    async fn test_discard_aborts_timers() {
        let (manager, _rx) = manager();
        let id = manager.create_server_session(DialogContext::new()).await;
        manager
            .dispatch(id, InboundMessage::request(Method::Invite, Body::Offer(Sdp::from("offer"))))
            .await
            .unwrap();
        manager.provide_answer(id, Sdp::from("answer")).await.unwrap();
        manager.accept(id).await.unwrap();
        assert_eq!(manager.armed_timers(id), vec![TimerKind::Retransmit]);

        assert!(manager.discard(id));
        assert!(manager.armed_timers(id).is_empty());
        assert!(!manager.discard(id));
    }
}
