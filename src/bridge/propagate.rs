//! Terminal-signal propagation between the two directions of a call and the transport.
//!
//! Every function here runs with the call's lock held. Each direction latches its first
//! terminal; later ones are logged and dropped. The transport is cancelled at most once.

use tonic::Status;
use tracing::{debug, info, warn};

use crate::bridge::call::lifecycle::{CallState, Direction, LifecycleInput, TerminalSignal};
use crate::bridge::call::{CallCore, CallInner};
use crate::bridge::error::CallError;
use crate::state_machine::StateMachine;

/// Type-erased way to end a call from outside, used by the call registry.
pub(crate) trait CallAbort: Send + Sync {
    fn abort(&self, error: CallError);
}

impl<T: Send + 'static> CallAbort for CallInner<T> {
    fn abort(&self, error: CallError) {
        let mut guard = self.lock();
        let core = &mut *guard;
        match error {
            CallError::Cancelled(reason) => {
                core.inbound.cancelled = true;
                self.cancel_locked(core, reason);
            }
            other => self.fail_locked(core, other),
        }
    }
}

impl<T> CallInner<T> {
    /// Record the end of the inbound direction for the consumer. Returns `false` if it had
    /// already ended.
    pub(crate) fn terminate_inbound(&self, core: &mut CallCore<T>, signal: TerminalSignal) -> bool {
        if core.lifecycle.is_terminated(Direction::Inbound) {
            self.ignore_inbound(core, "terminal");
            return false;
        }

        debug!(call_id = %self.meta.id, signal = ?signal.kind(), "Inbound terminated");
        core.lifecycle
            .process_input(LifecycleInput::Terminate(Direction::Inbound, signal.kind()));
        core.inbound.terminal = Some(signal);
        core.inbound.wake();
        self.flush_lifecycle(core);
        true
    }

    /// Record the end of the outbound direction. Returns `false` if it had already ended.
    pub(crate) fn terminate_outbound(
        &self,
        core: &mut CallCore<T>,
        signal: TerminalSignal,
    ) -> bool {
        if core.lifecycle.is_terminated(Direction::Outbound) {
            if core.inbound.cancelled {
                debug!(call_id = %self.meta.id, "Outbound terminal after cancellation ignored");
            } else {
                warn!(
                    call_id = %self.meta.id,
                    signal = ?signal.kind(),
                    "Protocol anomaly: duplicate outbound terminal ignored"
                );
            }
            return false;
        }

        debug!(call_id = %self.meta.id, signal = ?signal.kind(), "Outbound terminated");
        core.lifecycle
            .process_input(LifecycleInput::Terminate(Direction::Outbound, signal.kind()));
        self.flush_lifecycle(core);
        true
    }

    pub(crate) fn ignore_inbound(&self, core: &CallCore<T>, event: &str) {
        if core.inbound.cancelled {
            debug!(call_id = %self.meta.id, event, "Inbound event after cancellation ignored");
        } else {
            warn!(
                call_id = %self.meta.id,
                event,
                "Protocol anomaly: inbound event after terminal ignored"
            );
        }
    }

    /// End the outbound direction from outside the drain; the drain observes `error` on its next
    /// poll.
    pub(crate) fn abort_outbound(&self, core: &mut CallCore<T>, error: CallError) {
        if !self.terminate_outbound(core, TerminalSignal::from_error(error.clone())) {
            return;
        }
        core.outbound.abort = Some(error);
        core.outbound.wake();
    }

    pub(crate) fn cancel_transport(&self, core: &mut CallCore<T>, status: Status) {
        if core.transport_cancelled {
            return;
        }
        core.transport_cancelled = true;
        debug!(
            call_id = %self.meta.id,
            code = ?status.code(),
            message = status.message(),
            "Cancelling transport"
        );
        self.control.cancel(status);
    }

    /// The transport ended the inbound direction with an error status.
    pub(crate) fn transport_failed(&self, core: &mut CallCore<T>, status: Status) {
        let error = CallError::from_transport(status);
        if !self.terminate_inbound(core, TerminalSignal::from_error(error.clone())) {
            return;
        }

        if error.is_cancellation() {
            info!(call_id = %self.meta.id, %error, "Call cancelled by peer");
        } else {
            warn!(call_id = %self.meta.id, %error, "Call failed by transport");
        }
        self.abort_outbound(core, error);
    }

    /// Fail both directions and the transport with `error`.
    pub(crate) fn fail_locked(&self, core: &mut CallCore<T>, error: CallError) {
        if core.lifecycle.state() == CallState::Terminated {
            debug!(call_id = %self.meta.id, %error, "Failure after termination ignored");
            return;
        }

        warn!(
            call_id = %self.meta.id,
            method = %self.meta.method,
            %error,
            "Failing call"
        );

        if !core.lifecycle.is_terminated(Direction::Inbound) {
            core.inbound.discard();
            self.terminate_inbound(core, TerminalSignal::from_error(error.clone()));
        }
        self.abort_outbound(core, error.clone());
        self.cancel_transport(core, error.to_status());
    }

    pub(crate) fn fail(&self, error: CallError) {
        let mut core = self.lock();
        self.fail_locked(&mut core, error);
    }

    /// Cancel both directions and the transport.
    pub(crate) fn cancel_locked(&self, core: &mut CallCore<T>, reason: String) {
        core.inbound.discard();
        if core.lifecycle.state() == CallState::Terminated {
            return;
        }

        info!(call_id = %self.meta.id, reason = %reason, "Cancelling call");

        if !core.lifecycle.is_terminated(Direction::Inbound) {
            self.terminate_inbound(core, TerminalSignal::Cancelled(reason.clone()));
        }
        self.abort_outbound(core, CallError::Cancelled(reason.clone()));
        self.cancel_transport(core, Status::cancelled(reason));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::{FutureExt, StreamExt};
    use tonic::Code;

    use super::*;
    use crate::bridge::call::{Call, CallMeta, Side};
    use crate::bridge::demand::Demand;
    use crate::bridge::flow::inbound::InboundConfig;
    use crate::bridge::shape::CallShape;
    use crate::bridge::transport::{CallControl, Listener};

    #[derive(Default)]
    struct CancelLog(Mutex<Vec<Status>>);

    impl CallControl for CancelLog {
        fn request_more(&self, _n: Demand) {}

        fn cancel(&self, status: Status) {
            self.0.lock().unwrap().push(status);
        }
    }

    fn open() -> (Arc<CancelLog>, Call<u32>, crate::bridge::RxStream<u32>) {
        let control = Arc::new(CancelLog::default());
        let meta = CallMeta::new("test.Service/Method", CallShape::StreamStream, Side::Client);
        let (call, stream) = Call::open(meta, control.clone(), InboundConfig::default());
        (control, call, stream)
    }

    #[test]
    fn test_peer_cancel_is_not_echoed_back() {
        let (control, call, mut stream) = open();
        call.sink().on_error(Status::cancelled("peer gave up"));

        let error = stream.next().now_or_never().unwrap().unwrap().unwrap_err();
        assert!(error.is_cancellation());
        assert_eq!(call.state(), CallState::Terminated);
        assert!(control.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_external_cancel_is_observed_by_consumer() {
        let (control, call, mut stream) = open();
        call.cancel("shutting down");

        let error = stream.next().now_or_never().unwrap().unwrap().unwrap_err();
        assert!(matches!(error, CallError::Cancelled(ref r) if r == "shutting down"));
        assert_eq!(call.state(), CallState::Terminated);

        let cancelled = control.0.lock().unwrap().clone();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].code(), Code::Cancelled);
    }

    #[test]
    fn test_failure_after_termination_is_ignored() {
        let (control, call, _stream) = open();
        call.cancel("first");
        call.abort_handle()
            .upgrade()
            .unwrap()
            .abort(CallError::Transport(Status::internal("second")));
        assert_eq!(control.0.lock().unwrap().len(), 1);
    }
}
