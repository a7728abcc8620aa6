//! Core types shared by every component of the INVITE session core
//!
//! This module defines identifiers, the opaque session description wrapper and
//! the small slice of SIP vocabulary (methods, status codes, Session-Expires)
//! that the state machine reasons about. Parsing and serialization of the wire
//! format belong to the message layer; these types only carry the values the
//! message layer already extracted.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of an INVITE session
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// An opaque session description (SDP body)
///
/// The session core never inspects the description; it only tracks which
/// description was offered, answered and finally negotiated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sdp(String);

impl Sdp {
    pub fn new(body: impl Into<String>) -> Self {
        Self(body.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Sdp {
    fn from(body: &str) -> Self {
        Self(body.to_string())
    }
}

impl From<String> for Sdp {
    fn from(body: String) -> Self {
        Self(body)
    }
}

impl fmt::Display for Sdp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SIP methods the INVITE session exchanges inside its dialog
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Update,
    Prack,
    Info,
    Refer,
}

impl Method {
    /// Methods that carry a session modification (re-offer)
    pub fn is_session_modification(&self) -> bool {
        matches!(self, Method::Invite | Method::Update)
    }

    /// Methods tracked by the subsidiary request tracker
    pub fn is_subsidiary(&self) -> bool {
        matches!(self, Method::Info | Method::Refer)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Update => "UPDATE",
            Method::Prack => "PRACK",
            Method::Info => "INFO",
            Method::Refer => "REFER",
        };
        f.write_str(name)
    }
}

/// A SIP response status code
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const SESSION_PROGRESS: StatusCode = StatusCode(183);
    pub const OK: StatusCode = StatusCode(200);
    pub const ACCEPTED: StatusCode = StatusCode(202);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const SESSION_INTERVAL_TOO_SMALL: StatusCode = StatusCode(422);
    pub const TEMPORARILY_UNAVAILABLE: StatusCode = StatusCode(480);
    pub const CALL_DOES_NOT_EXIST: StatusCode = StatusCode(481);
    pub const REQUEST_TERMINATED: StatusCode = StatusCode(487);
    pub const NOT_ACCEPTABLE_HERE: StatusCode = StatusCode(488);
    pub const REQUEST_PENDING: StatusCode = StatusCode(491);
    pub const SERVER_INTERNAL_ERROR: StatusCode = StatusCode(500);

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.0)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    /// Final response other than 2xx
    pub fn is_failure(&self) -> bool {
        self.0 >= 300
    }

    pub fn is_final(&self) -> bool {
        self.0 >= 200
    }

    /// 491 Request Pending: the peer detected a renegotiation collision
    pub fn is_glare(&self) -> bool {
        *self == Self::REQUEST_PENDING
    }

    /// 408 or 481 to an in-dialog request means the dialog is gone (RFC 3261 §14.1)
    pub fn is_dialog_failure(&self) -> bool {
        *self == Self::REQUEST_TIMEOUT || *self == Self::CALL_DOES_NOT_EXIST
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of the local endpoint for the dialog-forming INVITE
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Role {
    /// Sent the initial INVITE (caller)
    Uac,
    /// Received the initial INVITE (callee)
    Uas,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Uac => f.write_str("uac"),
            Role::Uas => f.write_str("uas"),
        }
    }
}

/// The `refresher` parameter of Session-Expires (RFC 4028)
///
/// The value is relative to the transaction carrying the header, not to the
/// dialog-forming roles.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefresherRole {
    Uac,
    Uas,
}

impl fmt::Display for RefresherRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefresherRole::Uac => f.write_str("uac"),
            RefresherRole::Uas => f.write_str("uas"),
        }
    }
}

/// Session-Expires header value as extracted by the message layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionExpires {
    /// Session interval in seconds
    pub delta_seconds: u32,
    pub refresher: Option<RefresherRole>,
}

impl SessionExpires {
    pub fn new(delta_seconds: u32) -> Self {
        Self {
            delta_seconds,
            refresher: None,
        }
    }

    pub fn with_refresher(mut self, refresher: RefresherRole) -> Self {
        self.refresher = Some(refresher);
        self
    }
}

impl fmt::Display for SessionExpires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.refresher {
            Some(refresher) => write!(f, "{};refresher={}", self.delta_seconds, refresher),
            None => write!(f, "{}", self.delta_seconds),
        }
    }
}

/// Body of an INFO exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoContent {
    pub content_type: String,
    pub body: Bytes,
}

impl InfoContent {
    pub fn new(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
        }
    }
}
