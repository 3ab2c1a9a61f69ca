use std::mem;

use crate::bridge::demand::Demand;
use crate::bridge::error::Violation;
use crate::state_machine::StateMachine;

/// Credit bookkeeping between a consumer's demand and a push transport.
///
/// Credit starts at zero, so nothing can be delivered before a consumer asked for it. Grants are
/// coalesced until polled, and the transport is told to pause or resume only when credit crosses
/// zero.
#[derive(Debug)]
pub struct CreditController {
    credit: Demand,
    unflushed: Demand,
    advertised_paused: bool,
}

/// A signal for the transport, drained with [`poll_output`](StateMachine::poll_output).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    /// Allow `n` more inbound messages.
    Request(Demand),
    /// Credit went from zero to positive.
    Resume,
    /// Credit dropped to zero.
    Pause,
}

impl CreditController {
    pub fn new() -> Self {
        Self {
            credit: Demand::NONE,
            unflushed: Demand::NONE,
            advertised_paused: true,
        }
    }

    /// The number of messages the transport may currently push.
    pub fn credit(&self) -> Demand {
        self.credit
    }

    pub fn grant(&mut self, n: Demand) {
        if n.is_zero() {
            return;
        }
        self.credit = self.credit.add(n);
        self.unflushed = self.unflushed.add(n);
    }

    /// Account for one delivered message.
    pub fn consume(&mut self) -> Result<(), Violation> {
        if self.credit.take_one() {
            Ok(())
        } else {
            Err(Violation::CreditExceeded)
        }
    }

    fn poll_signal(&mut self) -> Option<FlowSignal> {
        if !self.unflushed.is_zero() {
            return Some(FlowSignal::Request(mem::take(&mut self.unflushed)));
        }

        let paused = self.credit.is_zero();
        if paused != self.advertised_paused {
            self.advertised_paused = paused;
            return Some(if paused {
                FlowSignal::Pause
            } else {
                FlowSignal::Resume
            });
        }

        None
    }
}

impl Default for CreditController {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for CreditController {
    type Input = Demand;
    type Output = FlowSignal;

    fn process_input(&mut self, input: Self::Input) {
        self.grant(input);
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.poll_signal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(controller: &mut CreditController) -> Vec<FlowSignal> {
        std::iter::from_fn(|| controller.poll_output()).collect()
    }

    #[test]
    fn test_starts_paused_without_credit() {
        let mut controller = CreditController::new();
        assert!(controller.credit().is_zero());
        assert!(drain(&mut controller).is_empty());
        assert_eq!(controller.consume(), Err(Violation::CreditExceeded));
    }

    #[test]
    fn test_grant_requests_then_resumes() {
        let mut controller = CreditController::new();
        controller.process_input(Demand::from(2u64));

        assert_eq!(
            drain(&mut controller),
            vec![FlowSignal::Request(Demand::from(2u64)), FlowSignal::Resume]
        );
    }

    #[test]
    fn test_grants_are_coalesced() {
        let mut controller = CreditController::new();
        controller.grant(Demand::from(1u64));
        controller.grant(Demand::from(3u64));
        controller.grant(Demand::NONE);

        assert_eq!(
            drain(&mut controller),
            vec![FlowSignal::Request(Demand::from(4u64)), FlowSignal::Resume]
        );
    }

    #[test]
    fn test_consuming_last_credit_pauses() {
        let mut controller = CreditController::new();
        controller.grant(Demand::from(2u64));
        drain(&mut controller);

        controller.consume().unwrap();
        assert!(drain(&mut controller).is_empty());

        controller.consume().unwrap();
        assert_eq!(drain(&mut controller), vec![FlowSignal::Pause]);
        assert_eq!(controller.consume(), Err(Violation::CreditExceeded));
    }

    #[test]
    fn test_pause_then_resume_before_flush_is_silent() {
        let mut controller = CreditController::new();
        controller.grant(Demand::from(1u64));
        drain(&mut controller);

        controller.consume().unwrap();
        controller.grant(Demand::from(1u64));

        assert_eq!(
            drain(&mut controller),
            vec![FlowSignal::Request(Demand::from(1u64))]
        );
    }

    #[test]
    fn test_unbounded_credit_never_pauses() {
        let mut controller = CreditController::new();
        controller.grant(Demand::Unbounded);
        drain(&mut controller);

        for _ in 0..1000 {
            controller.consume().unwrap();
        }
        assert!(drain(&mut controller).is_empty());
        assert!(controller.credit().is_unbounded());
    }
}
