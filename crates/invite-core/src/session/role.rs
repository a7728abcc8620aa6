use std::fmt;

use crate::errors::{InviteError, InviteResult};
use crate::message::InboundMessage;
use crate::types::{Role, Sdp, StatusCode};

use super::SessionCore;

/// Establishment-phase behavior that differs between caller and callee.
///
/// Implementations are stateless; all session data lives in [`SessionCore`].
/// Once the session is connected the shared handlers on the core take over.
pub(crate) trait RoleBehavior: fmt::Debug + Send + Sync {
    fn role(&self) -> Role;

    /// Handle a message while the initial INVITE transaction is in progress
    fn dispatch(&self, core: &mut SessionCore, message: &InboundMessage) -> InviteResult<()>;

    fn provide_offer(&self, core: &mut SessionCore, sdp: Sdp) -> InviteResult<()>;

    fn provide_answer(&self, core: &mut SessionCore, sdp: Sdp) -> InviteResult<()>;

    fn end(&self, core: &mut SessionCore) -> InviteResult<()>;

    fn reject(&self, core: &mut SessionCore, status: StatusCode) -> InviteResult<()>;

    fn accept(&self, core: &mut SessionCore) -> InviteResult<()> {
        Err(InviteError::invalid_state("accept", core.state))
    }

    fn provisional(&self, core: &mut SessionCore, _status: StatusCode) -> InviteResult<()> {
        Err(InviteError::invalid_state("send provisional", core.state))
    }
}
