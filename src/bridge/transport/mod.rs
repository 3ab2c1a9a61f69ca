//! Collaborator contracts between the bridge and an RPC transport.
//!
//! A transport hands the bridge one [`TransportCall`] per invocation. The bridge drives it
//! through three seams:
//!
//! - [`CallControl`]: credit grants, pause/resume hints and out-of-band cancellation,
//! - [`MessageSink`]: readiness-gated outbound sends and the in-band end of the stream,
//! - [`InboundSource`]/[`Listener`]: inbound events, serialized per call.
//!
//! Two transports ship with the crate: [`memory`] (in-process client/server pairs) and
//! [`stream`] (bridging an existing `Stream<Item = Result<T, Status>>`, such as
//! `tonic::Streaming<T>`).

pub mod memory;
pub mod stream;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::StreamExt;
use futures::stream::BoxStream;
use tonic::Status;

use crate::bridge::demand::Demand;
use crate::bridge::error::CallError;

/// Control plane of one call.
///
/// Methods are invoked while the bridge holds the call's lock, so implementations must not call
/// back into the call's [`Listener`] synchronously.
pub trait CallControl: Send + Sync + 'static {
    /// Allow the transport to deliver `n` more inbound messages.
    fn request_more(&self, n: Demand);

    /// Credit reached zero.
    fn pause(&self) {}

    /// Credit became positive again.
    fn resume(&self) {}

    /// Terminate the call immediately, reporting `status` to the peer.
    fn cancel(&self, status: Status);
}

/// Outbound half of one call.
pub trait MessageSink<T>: Send + 'static {
    /// Ready for exactly one more [`send_message`](MessageSink::send_message).
    ///
    /// An error means the transport will never accept another send (e.g. the peer cancelled).
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), CallError>>;

    fn send_message(&mut self, item: T) -> Result<(), CallError>;

    /// End of the outbound stream.
    fn half_close(&mut self);

    /// End the outbound stream with an error status, after anything already sent.
    fn close(&mut self, status: Status);
}

impl<T, S> MessageSink<T> for Box<S>
where
    S: MessageSink<T> + ?Sized,
{
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), CallError>> {
        (**self).poll_ready(cx)
    }

    fn send_message(&mut self, item: T) -> Result<(), CallError> {
        (**self).send_message(item)
    }

    fn half_close(&mut self) {
        (**self).half_close()
    }

    fn close(&mut self, status: Status) {
        (**self).close(status)
    }
}

/// Receiver of inbound events for one call.
///
/// Exactly one of [`on_half_close`](Listener::on_half_close) and
/// [`on_error`](Listener::on_error) ends the inbound direction.
pub trait Listener<T>: Send + Sync + 'static {
    fn on_message(&self, item: T);

    fn on_half_close(&self);

    fn on_error(&self, status: Status);

    /// A failure detected locally while handling an inbound event, e.g. a decode error.
    fn on_failure(&self, error: CallError) {
        self.on_error(error.to_status());
    }
}

/// Inbound half of one call, started once a listener exists.
pub trait InboundSource<T>: Send + 'static {
    fn start(self: Box<Self>, listener: Arc<dyn Listener<T>>);
}

/// Everything the bridge needs from the transport for one call.
pub struct TransportCall<In, Out> {
    pub control: Arc<dyn CallControl>,
    pub inbound: Box<dyn InboundSource<In>>,
    pub outbound: Box<dyn MessageSink<Out>>,
}

impl<In, Out> std::fmt::Debug for TransportCall<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCall")
            .field("control", &"<CallControl>")
            .field("inbound", &"<InboundSource>")
            .field("outbound", &"<MessageSink>")
            .finish()
    }
}

pub(crate) enum GateCheck {
    Open,
    /// The local side cancelled; it already knows how the call ended.
    Stop,
    /// The peer cancelled before finishing its stream.
    PeerCancelled(Status),
}

/// Credit and cancellation state a [`Pump`] consults before each delivery.
pub(crate) trait Gate: Send + Sync + 'static {
    /// Register the pump's waker, then report whether delivery may continue.
    fn check(&self, cx: &mut Context<'_>) -> GateCheck;

    fn take_credit(&self) -> bool;

    /// The error status the peer ended its stream with, if it did not end cleanly.
    fn trailer(&self) -> Option<Status> {
        None
    }
}

/// Delivers frames from a pull-based stream to a [`Listener`], one credit per message.
///
/// A frame pulled while no credit is available is held until credit arrives. End of stream and
/// errors are delivered without credit.
pub(crate) struct Pump<T> {
    frames: BoxStream<'static, Result<T, Status>>,
    gate: Arc<dyn Gate>,
    listener: Arc<dyn Listener<T>>,
    held: Option<T>,
}

impl<T> Pump<T> {
    pub(crate) fn new(
        frames: BoxStream<'static, Result<T, Status>>,
        gate: Arc<dyn Gate>,
        listener: Arc<dyn Listener<T>>,
    ) -> Self {
        Self {
            frames,
            gate,
            listener,
            held: None,
        }
    }
}

impl<T> Unpin for Pump<T> {}

impl<T: Send + 'static> Future for Pump<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            match this.gate.check(cx) {
                GateCheck::Open => {}
                GateCheck::Stop => return Poll::Ready(()),
                GateCheck::PeerCancelled(status) => {
                    this.listener.on_error(status);
                    return Poll::Ready(());
                }
            }

            if let Some(item) = this.held.take() {
                if this.gate.take_credit() {
                    this.listener.on_message(item);
                    continue;
                }
                this.held = Some(item);
                return Poll::Pending;
            }

            match this.frames.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(item))) => this.held = Some(item),
                Poll::Ready(Some(Err(status))) => {
                    this.listener.on_error(status);
                    return Poll::Ready(());
                }
                Poll::Ready(None) => {
                    match this.gate.trailer() {
                        Some(status) => this.listener.on_error(status),
                        None => this.listener.on_half_close(),
                    }
                    return Poll::Ready(());
                }
            }
        }
    }
}
