//! Serialization of subsidiary in-dialog requests
//!
//! INFO and REFER travel inside the INVITE dialog but are not part of the
//! offer/answer exchange. Only one of them may be outstanding at a time; a
//! second attempt is refused locally before anything is sent.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::errors::{InviteError, InviteResult};
use crate::types::{Method, StatusCode};

/// Whether a subsidiary request is outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubsidiaryRequestState {
    Complete,
    Proceeding,
}

#[derive(Debug, Clone)]
pub struct SubsidiaryRequestTracker {
    state: SubsidiaryRequestState,
    outstanding: Option<Method>,
}

impl Default for SubsidiaryRequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SubsidiaryRequestTracker {
    pub fn new() -> Self {
        Self {
            state: SubsidiaryRequestState::Complete,
            outstanding: None,
        }
    }

    /// Reserve the channel for a new subsidiary request
    pub fn begin(&mut self, method: Method) -> InviteResult<()> {
        if let Some(pending) = self.outstanding {
            return Err(InviteError::SubsidiaryPending { method: pending });
        }
        self.state = SubsidiaryRequestState::Proceeding;
        self.outstanding = Some(method);
        Ok(())
    }

    /// Process a response to a subsidiary request. Returns true when it was
    /// the final response to the outstanding request.
    pub fn complete(&mut self, method: Method, status: StatusCode) -> bool {
        match self.outstanding {
            Some(pending) if pending == method && status.is_final() => {
                self.state = SubsidiaryRequestState::Complete;
                self.outstanding = None;
                true
            }
            _ => {
                trace!(%method, %status, "response does not complete a subsidiary request");
                false
            }
        }
    }

    /// Forget any outstanding request (session teardown)
    pub fn reset(&mut self) {
        self.state = SubsidiaryRequestState::Complete;
        self.outstanding = None;
    }

    pub fn state(&self) -> SubsidiaryRequestState {
        self.state
    }

    pub fn is_proceeding(&self) -> bool {
        self.state == SubsidiaryRequestState::Proceeding
    }

    pub fn outstanding(&self) -> Option<Method> {
        self.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_request_refused_while_proceeding() {
        let mut tracker = SubsidiaryRequestTracker::new();
        tracker.begin(Method::Info).unwrap();
        assert_eq!(tracker.state(), SubsidiaryRequestState::Proceeding);

        let err = tracker.begin(Method::Refer).unwrap_err();
        assert_eq!(err, InviteError::SubsidiaryPending { method: Method::Info });
        assert_eq!(tracker.outstanding(), Some(Method::Info));
    }

    #[test]
    fn test_only_final_response_completes() {
        let mut tracker = SubsidiaryRequestTracker::new();
        tracker.begin(Method::Refer).unwrap();

        assert!(!tracker.complete(Method::Refer, StatusCode(100)));
        assert!(!tracker.complete(Method::Info, StatusCode::OK));
        assert!(tracker.is_proceeding());

        assert!(tracker.complete(Method::Refer, StatusCode::ACCEPTED));
        assert_eq!(tracker.state(), SubsidiaryRequestState::Complete);
        assert!(tracker.begin(Method::Info).is_ok());
    }

    #[test]
    fn test_failure_response_also_completes() {
        let mut tracker = SubsidiaryRequestTracker::new();
        tracker.begin(Method::Info).unwrap();
        assert!(tracker.complete(Method::Info, StatusCode(415)));
        assert!(!tracker.is_proceeding());
    }
}
