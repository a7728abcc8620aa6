//! Inbound events delivered to an INVITE session
//!
//! The message layer parses SIP and classifies each in-dialog message before
//! handing it to the session. The session only needs to know the method, the
//! status for responses, whether the body is an offer or an answer, and the
//! negotiated Session-Expires value if one was present.
//!
//! ```text
//! message layer ──▶ InboundMessage ──┐
//!                                    ├──▶ SessionEvent ──▶ InviteSession::dispatch
//! timer runtime ──▶ TimerFire ───────┘
//! ```

use std::fmt;

use crate::timer::TimerFire;
use crate::types::{InfoContent, Method, SessionExpires, Sdp, StatusCode};

/// Classified message body, shared by inbound and outbound messages
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Body {
    /// No session description (or one that is neither offer nor answer)
    #[default]
    None,
    Offer(Sdp),
    Answer(Sdp),
    /// Application payload of an INFO
    Info(InfoContent),
    /// Refer-To target of a REFER
    ReferTo(String),
}

impl Body {
    pub fn is_none(&self) -> bool {
        matches!(self, Body::None)
    }

    pub fn offer(&self) -> Option<&Sdp> {
        match self {
            Body::Offer(sdp) => Some(sdp),
            _ => None,
        }
    }

    pub fn answer(&self) -> Option<&Sdp> {
        match self {
            Body::Answer(sdp) => Some(sdp),
            _ => None,
        }
    }

    /// Session description carried, whether offer or answer
    pub fn sdp(&self) -> Option<&Sdp> {
        match self {
            Body::Offer(sdp) | Body::Answer(sdp) => Some(sdp),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Body::None => "no body",
            Body::Offer(_) => "offer",
            Body::Answer(_) => "answer",
            Body::Info(_) => "info payload",
            Body::ReferTo(_) => "refer target",
        }
    }
}

/// A classified in-dialog SIP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Request {
        method: Method,
        body: Body,
        session_expires: Option<SessionExpires>,
    },
    Response {
        method: Method,
        status: StatusCode,
        body: Body,
        /// Provisional response sent reliably (100rel)
        reliable: bool,
        session_expires: Option<SessionExpires>,
    },
}

impl InboundMessage {
    pub fn request(method: Method, body: Body) -> Self {
        InboundMessage::Request {
            method,
            body,
            session_expires: None,
        }
    }

    pub fn response(method: Method, status: impl Into<StatusCode>, body: Body) -> Self {
        InboundMessage::Response {
            method,
            status: status.into(),
            body,
            reliable: false,
            session_expires: None,
        }
    }

    /// A reliable (100rel) provisional response to the initial INVITE
    pub fn reliable_provisional(status: impl Into<StatusCode>, body: Body) -> Self {
        InboundMessage::Response {
            method: Method::Invite,
            status: status.into(),
            body,
            reliable: true,
            session_expires: None,
        }
    }

    pub fn ack(body: Body) -> Self {
        Self::request(Method::Ack, body)
    }

    /// Attach a Session-Expires value
    pub fn with_session_expires(mut self, value: SessionExpires) -> Self {
        match &mut self {
            InboundMessage::Request { session_expires, .. }
            | InboundMessage::Response { session_expires, .. } => *session_expires = Some(value),
        }
        self
    }

    pub fn method(&self) -> Method {
        match self {
            InboundMessage::Request { method, .. } | InboundMessage::Response { method, .. } => *method,
        }
    }

    pub fn body(&self) -> &Body {
        match self {
            InboundMessage::Request { body, .. } | InboundMessage::Response { body, .. } => body,
        }
    }

    pub fn session_expires(&self) -> Option<SessionExpires> {
        match self {
            InboundMessage::Request { session_expires, .. }
            | InboundMessage::Response { session_expires, .. } => *session_expires,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, InboundMessage::Request { .. })
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            InboundMessage::Response { status, .. } => Some(*status),
            InboundMessage::Request { .. } => None,
        }
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundMessage::Request { method, body, .. } => {
                write!(f, "{} request ({})", method, body.label())
            }
            InboundMessage::Response { method, status, body, .. } => {
                write!(f, "{} response to {} ({})", status, method, body.label())
            }
        }
    }
}

/// Anything that can drive the session state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Message(InboundMessage),
    Timer(TimerFire),
}

impl From<InboundMessage> for SessionEvent {
    fn from(message: InboundMessage) -> Self {
        SessionEvent::Message(message)
    }
}

impl From<TimerFire> for SessionEvent {
    fn from(fire: TimerFire) -> Self {
        SessionEvent::Timer(fire)
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Message(message) => message.fmt(f),
            SessionEvent::Timer(fire) => write!(f, "{} timer", fire.kind),
        }
    }
}
