use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::StreamExt;
use futures::stream::BoxStream;
use tonic::Status;
use tracing::{debug, trace, warn};

use crate::bridge::call::{CallCore, CallInner};
use crate::bridge::call::lifecycle::{Direction, TerminalSignal};
use crate::bridge::error::{CallError, Violation};
use crate::bridge::shape::Cardinality;
use crate::bridge::transport::MessageSink;

/// Drains a pull source into the transport, one item per readiness signal.
///
/// The source is only polled after the sink reported readiness, so a slow transport slows the
/// producer down instead of buffering. Resolves with the number of messages sent once the
/// outbound direction ended:
///
/// - source completed: the sink is half-closed,
/// - source failed: the sink is closed with the failure's status and the call is failed,
/// - call aborted (cancel, violation, transport failure): the source is dropped unpolled.
pub struct Drain<T, Out> {
    call: Arc<CallInner<T>>,
    source: Option<BoxStream<'static, Result<Out, Status>>>,
    sink: Box<dyn MessageSink<Out>>,
    cardinality: Cardinality,
    sent: u64,
}

impl<T, Out: 'static> Drain<T, Out> {
    pub(crate) fn new(
        call: Arc<CallInner<T>>,
        source: BoxStream<'static, Result<Out, Status>>,
        sink: Box<dyn MessageSink<Out>>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            call,
            source: Some(source),
            sink,
            cardinality,
            sent: 0,
        }
    }

    /// Take an abort recorded by the rest of the call, or register for one.
    fn take_abort(&mut self, cx: &mut Context<'_>) -> Option<CallError> {
        let mut core = self.call.lock();
        let aborted = Self::aborted(&mut self.sink, &mut core);
        if aborted.is_none() {
            core.outbound.waker = Some(cx.waker().clone());
        }
        aborted
    }

    /// Consume a recorded abort, ending the outbound stream with its status unless it was a
    /// cancellation.
    fn aborted(
        sink: &mut Box<dyn MessageSink<Out>>,
        core: &mut CallCore<T>,
    ) -> Option<CallError> {
        let error = core.outbound.abort.take()?;
        if !error.is_cancellation() {
            sink.close(error.to_status());
        }
        Some(error)
    }

    fn transport_gone(&mut self, error: CallError) -> CallError {
        let mut core = self.call.lock();
        if let Some(aborted) = Self::aborted(&mut self.sink, &mut core) {
            return aborted;
        }
        debug!(call_id = %self.call.meta.id, %error, "Transport stopped accepting messages");
        self.call
            .terminate_outbound(&mut core, TerminalSignal::from_error(error.clone()));
        error
    }

    fn business_failed(&mut self, status: Status) -> CallError {
        let mut guard = self.call.lock();
        let core = &mut *guard;

        // A call failure recorded first, e.g. a request violation the handler returned with
        // `?`, is what the peer sees.
        if let Some(error) = Self::aborted(&mut self.sink, core) {
            debug!(call_id = %self.call.meta.id, %error, "Outbound source ended by call failure");
            return error;
        }

        let error = CallError::BusinessLogic(status.clone());
        warn!(
            call_id = %self.call.meta.id,
            code = ?status.code(),
            message = status.message(),
            "Outbound source failed"
        );

        if self
            .call
            .terminate_outbound(core, TerminalSignal::Failed(error.clone()))
        {
            self.sink.close(status.clone());
        }
        if !core.lifecycle.is_terminated(Direction::Inbound) {
            core.inbound.discard();
            self.call
                .terminate_inbound(core, TerminalSignal::Failed(error.clone()));
        }
        self.call.cancel_transport(core, status);
        error
    }

    fn complete(&mut self) -> Result<u64, CallError> {
        let mut guard = self.call.lock();
        let core = &mut *guard;
        if let Some(error) = Self::aborted(&mut self.sink, core) {
            return Err(error);
        }

        self.call.terminate_outbound(core, TerminalSignal::Completed);
        self.sink.half_close();
        debug!(call_id = %self.call.meta.id, sent = self.sent, "Outbound completed");
        Ok(self.sent)
    }
}

impl<T, Out> Unpin for Drain<T, Out> {}

impl<T, Out: 'static> Future for Drain<T, Out> {
    type Output = Result<u64, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            if let Some(error) = this.take_abort(cx) {
                // Dropped outside the call lock: the source may own this call's inbound stream.
                this.source = None;
                return Poll::Ready(Err(error));
            }

            let Some(source) = this.source.as_mut() else {
                return Poll::Ready(Ok(this.sent));
            };

            match this.sink.poll_ready(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(error)) => {
                    let error = this.transport_gone(error);
                    this.source = None;
                    return Poll::Ready(Err(error));
                }
                Poll::Ready(Ok(())) => {}
            }

            match source.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(item))) => {
                    if this.cardinality == Cardinality::One && this.sent == 1 {
                        this.call.fail(Violation::ExtraItem.into());
                        continue;
                    }
                    if let Err(error) = this.sink.send_message(item) {
                        let error = this.transport_gone(error);
                        this.source = None;
                        return Poll::Ready(Err(error));
                    }
                    this.sent += 1;
                    trace!(call_id = %this.call.meta.id, sent = this.sent, "Sent message");
                }
                Poll::Ready(Some(Err(status))) => {
                    let error = this.business_failed(status);
                    this.source = None;
                    return Poll::Ready(Err(error));
                }
                Poll::Ready(None) => {
                    if this.cardinality == Cardinality::One && this.sent == 0 {
                        this.call.fail(Violation::MissingItem.into());
                        continue;
                    }
                    let result = this.complete();
                    this.source = None;
                    return Poll::Ready(result);
                }
            }
        }
    }
}
