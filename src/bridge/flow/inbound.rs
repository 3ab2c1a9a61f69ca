use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bon::Builder;
use futures::Stream;
use tonic::Status;
use tracing::{debug, trace};

use crate::bridge::call::lifecycle::{CallState, Direction, TerminalSignal};
use crate::bridge::call::{CallCore, CallId, CallInner, Side};
use crate::bridge::demand::Demand;
use crate::bridge::error::{CallError, Violation};
use crate::bridge::flow::credit::CreditController;
use crate::bridge::transport::Listener;

/// Demand policy of an inbound sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder)]
pub struct InboundConfig {
    /// Granted on the first poll.
    #[builder(default = Demand::Bounded(1))]
    pub initial_demand: Demand,

    /// Granted whenever the consumer polls with no demand outstanding.
    #[builder(default = Demand::Bounded(1))]
    pub replenish: Demand,
}

impl InboundConfig {
    /// Asks for one message past the first so a second one is detected eagerly.
    pub(crate) fn single() -> Self {
        Self {
            initial_demand: Demand::Bounded(2),
            replenish: Demand::Bounded(1),
        }
    }
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

pub(crate) struct InboundState<T> {
    pub(crate) credit: CreditController,
    /// Requested by the consumer and not yet delivered.
    pub(crate) outstanding: Demand,
    pub(crate) subscribed: bool,
    pub(crate) ready: VecDeque<T>,
    /// At most one message that arrived while no credit was granted.
    pub(crate) pending: Option<T>,
    pub(crate) terminal: Option<TerminalSignal>,
    /// The consumer has observed the end of the sequence, or gave up on it.
    pub(crate) finished: bool,
    pub(crate) cancelled: bool,
    pub(crate) waker: Option<Waker>,
}

impl<T> InboundState<T> {
    pub(crate) fn new() -> Self {
        Self {
            credit: CreditController::new(),
            outstanding: Demand::NONE,
            subscribed: false,
            ready: VecDeque::new(),
            pending: None,
            terminal: None,
            finished: false,
            cancelled: false,
            waker: None,
        }
    }

    pub(crate) fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    pub(crate) fn discard(&mut self) {
        self.ready.clear();
        self.pending = None;
    }
}

impl<T> CallInner<T> {
    pub(crate) fn request_locked(&self, core: &mut CallCore<T>, n: Demand) {
        if core.inbound.cancelled || core.inbound.finished || n.is_zero() {
            return;
        }

        let mut n = n;
        if let Some(item) = core.inbound.pending.take() {
            trace!(call_id = %self.meta.id, "Releasing pending message");
            core.inbound.ready.push_back(item);
            n.take_one();
        }

        if !n.is_zero() && !core.lifecycle.is_terminated(Direction::Inbound) {
            core.inbound.outstanding = core.inbound.outstanding.add(n);
            core.inbound.credit.grant(n);
            self.flush_credit(core);
        }

        core.inbound.wake();
    }
}

/// Transport-facing end of an inbound sequence.
///
/// Every event is handled under the call's lock, so concurrent deliveries from a misbehaving
/// transport are serialized.
pub struct InboundSink<T> {
    call: Arc<CallInner<T>>,
}

impl<T> InboundSink<T> {
    pub(crate) fn new(call: Arc<CallInner<T>>) -> Self {
        Self { call }
    }
}

impl<T: Send + 'static> Listener<T> for InboundSink<T> {
    fn on_message(&self, item: T) {
        let call = &self.call;
        let mut guard = call.lock();
        let core = &mut *guard;

        if core.lifecycle.is_terminated(Direction::Inbound) {
            call.ignore_inbound(core, "message");
            return;
        }

        match core.inbound.credit.consume() {
            Ok(()) => {
                core.inbound.outstanding.take_one();
                core.inbound.ready.push_back(item);
            }
            Err(violation) if core.inbound.pending.is_none() => {
                debug!(
                    call_id = %call.meta.id,
                    %violation,
                    "Holding message delivered without demand"
                );
                core.inbound.pending = Some(item);
            }
            Err(_) => {
                call.fail_locked(core, Violation::PendingOverflow.into());
                return;
            }
        }

        call.flush_credit(core);
        core.inbound.wake();
    }

    fn on_half_close(&self) {
        let mut core = self.call.lock();
        self.call
            .terminate_inbound(&mut core, TerminalSignal::Completed);
    }

    fn on_error(&self, status: Status) {
        let mut core = self.call.lock();
        self.call.transport_failed(&mut core, status);
    }

    fn on_failure(&self, error: CallError) {
        let mut core = self.call.lock();
        self.call.fail_locked(&mut core, error);
    }
}

/// Inbound messages of a call as a demand-driven stream.
///
/// Nothing is requested from the transport until the first poll. Each poll that finds nothing
/// buffered and no demand outstanding grants [`InboundConfig::replenish`] more. The terminal
/// signal is yielded once, after every buffered message: `None` on completion, `Some(Err(_))`
/// on failure or cancellation.
///
/// Dropping the stream before it ended cancels the call. A server handler that drops its
/// requests without ever polling them only ends the inbound direction.
pub struct RxStream<T> {
    call: Arc<CallInner<T>>,
    config: InboundConfig,
}

impl<T> RxStream<T> {
    pub(crate) fn new(call: Arc<CallInner<T>>, config: InboundConfig) -> Self {
        Self { call, config }
    }

    pub(crate) fn with_config(mut self, config: InboundConfig) -> Self {
        self.config = config;
        self
    }

    pub fn call_id(&self) -> &CallId {
        &self.call.meta.id
    }

    pub fn method(&self) -> &str {
        &self.call.meta.method
    }

    pub fn state(&self) -> CallState {
        self.call.lock().lifecycle.state()
    }

    /// Ask for `n` more messages on top of what the stream requests by itself.
    pub fn request(&self, n: impl Into<Demand>) {
        let mut core = self.call.lock();
        self.call.request_locked(&mut core, n.into());
    }

    /// Stop consuming. The transport is cancelled and the stream ends without a terminal item.
    pub fn cancel(&self) {
        let mut guard = self.call.lock();
        let core = &mut *guard;
        core.inbound.finished = true;
        core.inbound.cancelled = true;
        self.call.cancel_locked(core, "cancelled by consumer".to_string());
    }

    /// Fail the call on behalf of the consumer, which already reported `error` itself.
    pub(crate) fn reject(&self, error: CallError) {
        let mut guard = self.call.lock();
        let core = &mut *guard;
        self.call.fail_locked(core, error);
        core.inbound.finished = true;
    }
}

impl<T> Stream for RxStream<T> {
    type Item = Result<T, CallError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let call = &this.call;
        let mut guard = call.lock();
        let core = &mut *guard;

        if core.inbound.finished {
            return Poll::Ready(None);
        }

        if !core.inbound.subscribed {
            core.inbound.subscribed = true;
            debug!(
                call_id = %call.meta.id,
                demand = %this.config.initial_demand,
                "Inbound subscribed"
            );
            call.request_locked(core, this.config.initial_demand);
        }

        let mut replenished = false;
        loop {
            if let Some(item) = core.inbound.ready.pop_front() {
                return Poll::Ready(Some(Ok(item)));
            }

            if core.inbound.pending.is_none() {
                if let Some(terminal) = core.inbound.terminal.take() {
                    core.inbound.finished = true;
                    return Poll::Ready(match terminal {
                        TerminalSignal::Completed => None,
                        TerminalSignal::Failed(error) => Some(Err(error)),
                        TerminalSignal::Cancelled(reason) => {
                            Some(Err(CallError::Cancelled(reason)))
                        }
                    });
                }
            }

            if core.inbound.outstanding.is_zero() && !replenished {
                replenished = true;
                call.request_locked(core, this.config.replenish);
                continue;
            }

            break;
        }

        core.inbound.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> Drop for RxStream<T> {
    fn drop(&mut self) {
        let Some(mut guard) = self.call.try_lock() else {
            return;
        };
        let core = &mut *guard;
        if core.inbound.finished {
            return;
        }
        core.inbound.finished = true;

        if std::thread::panicking() {
            let status = Status::internal("handler panicked");
            self.call
                .fail_locked(core, CallError::BusinessLogic(status));
        } else if !core.inbound.subscribed && self.call.meta.side == Side::Server {
            // A handler that never read its requests: end the inbound direction locally and
            // leave the transport to the responses.
            core.inbound.cancelled = true;
            core.inbound.discard();
            if !core.lifecycle.is_terminated(Direction::Inbound) {
                self.call.terminate_inbound(
                    core,
                    TerminalSignal::Cancelled("inbound stream dropped unread".to_string()),
                );
            }
        } else {
            core.inbound.cancelled = true;
            self.call
                .cancel_locked(core, "inbound stream dropped".to_string());
        }
    }
}

impl<T> std::fmt::Debug for RxStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxStream")
            .field("call_id", &self.call.meta.id)
            .field("config", &self.config)
            .finish()
    }
}
