//! INVITE session core for the rvoip stack
//!
//! This crate implements the signaling state machine of one INVITE-established
//! session: offer/answer bookkeeping (RFC 3264), reliable provisionals and
//! early UPDATE, re-INVITE/UPDATE renegotiation with glare resolution
//! (RFC 3261 §14.1), 2xx retransmission until the ACK, and session timers
//! (RFC 4028).
//!
//! The state machine ([`InviteSession`]) is sans-IO. Parsed messages and
//! timer fires go in through `dispatch`, application decisions through its
//! operations, and the session answers with [`SessionAction`]s. The
//! [`SessionManager`] hosts sessions on tokio, runs their timers and forwards
//! their output on a channel.
//!
//! ```no_run
//! use rvoip_invite_core::prelude::*;
//!
//! # async fn example() -> InviteResult<()> {
//! let (manager, mut output) = SessionManager::new(SessionConfig::default())?;
//! let id = manager
//!     .create_client_session(DialogContext::new().with_update(), Some(Sdp::from("v=0 ...")))
//!     .await?;
//! while let Some(out) = output.recv().await {
//!     if let SessionAction::SendRequest(request) = out.action {
//!         println!("{} wants to send {}", out.session_id, request.method);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Message parsing, dialog routing and the transaction layer live elsewhere in
//! the stack; this crate only sees their classified results.

pub mod actions;
pub mod config;
pub mod errors;
pub mod glare;
pub mod manager;
pub mod message;
pub mod offer_answer;
pub mod retransmit;
pub mod session;
pub mod session_timer;
pub mod subsidiary;
pub mod timer;
pub mod types;

// Re-export commonly used types
pub use actions::{OutboundRequest, OutboundResponse, SessionAction, SessionNotification, TerminationReason};
pub use config::{GlareBackoffConfig, NoOfferPolicy, RefreshMethod, RefresherPreference, SessionConfig, SessionTimerSettings};
pub use errors::{ErrorKind, InviteError, InviteResult};
pub use manager::{SessionManager, SessionOutput};
pub use message::{Body, InboundMessage, SessionEvent};
pub use offer_answer::SdpSnapshot;
pub use session::{DialogContext, InviteSession, InviteState, ModificationKind, PendingModification};
pub use session_timer::{Refresher, SessionTimerConfig};
pub use subsidiary::SubsidiaryRequestState;
pub use timer::{TimerFire, TimerKind};
pub use types::{InfoContent, Method, RefresherRole, Role, Sdp, SessionExpires, SessionId, StatusCode};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        Body, DialogContext, ErrorKind, InboundMessage, InviteError, InviteResult, InviteSession,
        InviteState, Method, Sdp, SessionAction, SessionConfig, SessionEvent, SessionExpires,
        SessionId, SessionManager, SessionNotification, SessionOutput, StatusCode,
        TerminationReason,
    };
}
