//! Outbound actions requested by an INVITE session
//!
//! Handlers never perform I/O. They queue [`SessionAction`]s which the host
//! (normally the [`SessionManager`](crate::manager::SessionManager)) drains and
//! executes: sending requests and responses through the dialog layer, arming
//! and cancelling timers, and notifying the application.

use std::fmt;
use std::time::Duration;

use crate::errors::ErrorKind;
use crate::timer::{TimerFire, TimerKind};
use crate::message::Body;
use crate::types::{InfoContent, Method, SessionExpires, Sdp, StatusCode};

/// A request the dialog layer should send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: Method,
    pub body: Body,
    pub session_expires: Option<SessionExpires>,
    /// New local contact for a target refresh
    pub contact: Option<String>,
}

impl OutboundRequest {
    pub fn new(method: Method, body: Body) -> Self {
        Self {
            method,
            body,
            session_expires: None,
            contact: None,
        }
    }
}

/// A response the dialog layer should send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResponse {
    /// Method of the request being answered
    pub method: Method,
    pub status: StatusCode,
    pub body: Body,
    pub session_expires: Option<SessionExpires>,
    /// Min-SE to advertise in a 422
    pub min_se: Option<u32>,
    /// Send as a reliable provisional (100rel)
    pub reliable: bool,
}

impl OutboundResponse {
    pub fn new(method: Method, status: StatusCode, body: Body) -> Self {
        Self {
            method,
            status,
            body,
            session_expires: None,
            min_se: None,
            reliable: false,
        }
    }
}

/// Why a session terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationReason {
    /// Local `end()`
    LocalHangup,
    /// BYE received
    RemoteHangup,
    /// Local `end()` before the session connected (CANCEL sent)
    LocalCancel,
    /// CANCEL received before the session connected
    RemoteCancel,
    /// Initial INVITE rejected with a final failure response
    Rejected(StatusCode),
    /// No ACK for our 2xx within the retransmission budget
    AckTimeout,
    /// Establishment failed on an unrecoverable protocol error
    ProtocolViolation,
    /// 408/481 to an in-dialog request: the dialog no longer exists
    DialogFailure(StatusCode),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::LocalHangup => f.write_str("local hangup"),
            TerminationReason::RemoteHangup => f.write_str("remote hangup"),
            TerminationReason::LocalCancel => f.write_str("local cancel"),
            TerminationReason::RemoteCancel => f.write_str("remote cancel"),
            TerminationReason::Rejected(status) => write!(f, "rejected with {}", status),
            TerminationReason::AckTimeout => f.write_str("ACK timeout"),
            TerminationReason::ProtocolViolation => f.write_str("protocol violation"),
            TerminationReason::DialogFailure(status) => write!(f, "dialog failure ({})", status),
        }
    }
}

/// Application-facing events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotification {
    /// Provisional response to our initial INVITE
    Provisional { status: StatusCode },
    /// Session description in an unreliable provisional (not negotiated)
    EarlyMedia { sdp: Sdp },
    /// The peer offered; answer with `provide_answer` or refuse with `reject`
    OfferReceived { sdp: Sdp },
    /// The peer expects us to offer (offerless INVITE or re-INVITE)
    OfferRequested,
    /// The peer answered our offer
    AnswerReceived { sdp: Sdp },
    /// Session reached the connected phase
    Connected,
    /// An offer/answer exchange completed and became current
    Negotiated { local: Sdp, remote: Sdp },
    /// The peer refused our modification; the previous description remains
    ModificationRejected { status: StatusCode },
    /// A session refresh completed (sent or received)
    SessionRefreshed,
    /// The peer did not refresh within the session interval
    RefreshMissed,
    InfoReceived { content: InfoContent },
    InfoCompleted { status: StatusCode },
    ReferReceived { target: String },
    ReferCompleted { status: StatusCode },
    /// Non-fatal protocol error
    Error { kind: ErrorKind, trigger: String },
    Terminated { reason: TerminationReason },
}

/// Work queued by the session for its host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    SendRequest(OutboundRequest),
    SendResponse(OutboundResponse),
    ArmTimer { timer: TimerFire, after: Duration },
    CancelTimer { kind: TimerKind },
    Notify(SessionNotification),
}

impl SessionAction {
    pub fn is_timer(&self) -> bool {
        matches!(self, SessionAction::ArmTimer { .. } | SessionAction::CancelTimer { .. })
    }
}
