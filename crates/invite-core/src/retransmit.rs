//! 2xx retransmission for INVITE and re-INVITE
//!
//! A UAS core keeps retransmitting its 2xx to an INVITE until the ACK arrives
//! (RFC 3261 §13.3.1.4). The interval starts at T1 and doubles up to T2. When
//! the configured budget of retransmissions is spent without an ACK the
//! controller reports exhaustion and the session tears the dialog down.

use std::time::Duration;

use tracing::{debug, warn};

use crate::actions::OutboundResponse;
use crate::config::SessionConfig;

/// Outcome of a retransmit timer fire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetransmitStep {
    /// Send `response` again and re-arm for `next`
    Resend {
        response: OutboundResponse,
        next: Duration,
    },
    /// Budget spent without an ACK
    Exhausted { attempts: u32 },
}

/// Retransmits the last 2xx until it is acknowledged or the budget runs out
#[derive(Debug, Clone)]
pub struct RetransmissionController {
    t1: Duration,
    t2: Duration,
    budget: u32,
    response: Option<OutboundResponse>,
    attempts: u32,
    interval: Duration,
}

impl RetransmissionController {
    pub fn new(t1: Duration, t2: Duration, budget: u32) -> Self {
        Self {
            t1,
            t2,
            budget,
            response: None,
            attempts: 0,
            interval: t1,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.t1(), config.t2(), config.max_ack_retransmits)
    }

    /// Begin retransmitting `response`. Returns the delay until the first resend.
    pub fn start(&mut self, response: OutboundResponse) -> Duration {
        debug!(status = %response.status, method = %response.method, "starting 2xx retransmission");
        self.response = Some(response);
        self.attempts = 0;
        self.interval = self.t1;
        self.interval
    }

    /// Handle a timer fire. `None` when nothing is being retransmitted.
    pub fn on_fire(&mut self) -> Option<RetransmitStep> {
        let response = self.response.clone()?;
        if self.attempts >= self.budget {
            warn!(attempts = self.attempts, "no ACK received, retransmission budget exhausted");
            let attempts = self.attempts;
            self.stop();
            return Some(RetransmitStep::Exhausted { attempts });
        }
        self.attempts += 1;
        self.interval = (self.interval * 2).min(self.t2);
        debug!(
            attempt = self.attempts,
            budget = self.budget,
            next_ms = self.interval.as_millis() as u64,
            "retransmitting 2xx"
        );
        Some(RetransmitStep::Resend {
            response,
            next: self.interval,
        })
    }

    /// ACK arrived. Returns whether a retransmission was in progress.
    pub fn acknowledge(&mut self) -> bool {
        let active = self.is_active();
        self.stop();
        active
    }

    pub fn stop(&mut self) {
        self.response = None;
        self.attempts = 0;
        self.interval = self.t1;
    }

    pub fn is_active(&self) -> bool {
        self.response.is_some()
    }

    /// Retransmissions sent so far for the current response
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay until the next timer fire
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    pub fn response(&self) -> Option<&OutboundResponse> {
        self.response.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Body;
    use crate::types::{Method, StatusCode};

    fn ok_response() -> OutboundResponse {
        OutboundResponse::new(Method::Invite, StatusCode::OK, Body::None)
    }

    #[test]
    fn test_backoff_doubles_up_to_t2() {
        let mut controller =
            RetransmissionController::new(Duration::from_millis(500), Duration::from_secs(4), 6);
        assert_eq!(controller.start(ok_response()), Duration::from_millis(500));

        let mut intervals = Vec::new();
        while let Some(RetransmitStep::Resend { next, .. }) = controller.on_fire() {
            intervals.push(next.as_millis() as u64);
        }
        assert_eq!(intervals, vec![1000, 2000, 4000, 4000, 4000, 4000]);
        assert!(!controller.is_active());
    }

    #[test]
    fn test_exhaustion_after_budget() {
        let mut controller =
            RetransmissionController::new(Duration::from_millis(100), Duration::from_millis(400), 3);
        controller.start(ok_response());
        for attempt in 1..=3 {
            match controller.on_fire() {
                Some(RetransmitStep::Resend { response, .. }) => {
                    assert_eq!(response, ok_response());
                    assert_eq!(controller.attempts(), attempt);
                }
                other => panic!("expected resend, got {:?}", other),
            }
        }
        assert_eq!(controller.on_fire(), Some(RetransmitStep::Exhausted { attempts: 3 }));
        assert_eq!(controller.on_fire(), None);
    }

    #[test]
    fn test_acknowledge_stops_retransmission() {
        let mut controller = RetransmissionController::from_config(&SessionConfig::default());
        assert!(!controller.acknowledge());
        controller.start(ok_response());
        controller.on_fire();
        assert!(controller.acknowledge());
        assert_eq!(controller.attempts(), 0);
        assert_eq!(controller.on_fire(), None);
    }
}
