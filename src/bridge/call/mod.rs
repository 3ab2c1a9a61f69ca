pub mod lifecycle;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Poll, Waker};

use futures::stream::BoxStream;
use tonic::Status;
use tracing::{debug, info};
use uuid::Uuid;

use self::lifecycle::{CallLifecycle, CallState, LifecycleInput};
use crate::bridge::error::CallError;
use crate::bridge::flow::credit::FlowSignal;
use crate::bridge::flow::inbound::{InboundConfig, InboundSink, InboundState, RxStream};
use crate::bridge::flow::outbound::Drain;
use crate::bridge::propagate::CallAbort;
use crate::bridge::shape::{CallShape, Cardinality};
use crate::bridge::transport::{CallControl, InboundSource, MessageSink};
use crate::state_machine::StateMachine;

#[derive(Clone, Hash, PartialEq, Eq)]
pub struct CallId(Arc<Uuid>);

impl CallId {
    pub fn generate() -> Self {
        Self(Arc::new(Uuid::new_v4()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallId({})", self.0)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which end of the call this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn peer(&self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Client => "client",
            Side::Server => "server",
        })
    }
}

/// Immutable description of a call.
#[derive(Debug, Clone)]
pub struct CallMeta {
    pub id: CallId,
    pub method: Arc<str>,
    pub shape: CallShape,
    pub side: Side,
}

impl CallMeta {
    pub fn new(method: impl Into<Arc<str>>, shape: CallShape, side: Side) -> Self {
        Self {
            id: CallId::generate(),
            method: method.into(),
            shape,
            side,
        }
    }
}

/// Everything mutable about a call. Guarded by a single mutex, entered by both the transport's
/// event path and the consumer's demand/cancel path.
pub(crate) struct CallCore<T> {
    pub(crate) lifecycle: CallLifecycle,
    pub(crate) inbound: InboundState<T>,
    pub(crate) outbound: OutboundState,
    pub(crate) transport_cancelled: bool,
    closed_wakers: Vec<Waker>,
}

#[derive(Default)]
pub(crate) struct OutboundState {
    /// Set when something other than the drain ends the outbound direction.
    pub(crate) abort: Option<CallError>,
    pub(crate) waker: Option<Waker>,
}

impl OutboundState {
    pub(crate) fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

pub(crate) struct CallInner<T> {
    pub(crate) meta: CallMeta,
    pub(crate) control: Arc<dyn CallControl>,
    core: Mutex<CallCore<T>>,
}

impl<T> CallInner<T> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, CallCore<T>> {
        self.core.lock().expect("call state lock poisoned")
    }

    /// Lock without panicking, for use from `Drop`.
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, CallCore<T>>> {
        self.core.lock().ok()
    }

    /// Forward pending credit signals to the transport, in order.
    pub(crate) fn flush_credit(&self, core: &mut CallCore<T>) {
        while let Some(signal) = core.inbound.credit.poll_output() {
            match signal {
                FlowSignal::Request(n) => self.control.request_more(n),
                FlowSignal::Resume => self.control.resume(),
                FlowSignal::Pause => self.control.pause(),
            }
        }
    }

    pub(crate) fn flush_lifecycle(&self, core: &mut CallCore<T>) {
        while let Some(transition) = core.lifecycle.poll_output() {
            debug!(
                call_id = %self.meta.id,
                from = %transition.from,
                to = %transition.to,
                "Call state changed"
            );

            if transition.to == CallState::Terminated {
                info!(
                    call_id = %self.meta.id,
                    method = %self.meta.method,
                    side = %self.meta.side,
                    "Call terminated"
                );
                for waker in core.closed_wakers.drain(..) {
                    waker.wake();
                }
            }
        }
    }
}

/// Handle to the shared state of one call.
///
/// Created together with the call's inbound [`RxStream`]; the outbound side is attached with
/// [`drain`](Call::drain) and the transport's inbound events with [`listen`](Call::listen).
pub struct Call<T> {
    inner: Arc<CallInner<T>>,
}

impl<T> Clone for Call<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Call<T> {
    /// Open a call over `control`, returning the handle and the (not yet subscribed) inbound
    /// sequence.
    pub fn open(
        meta: CallMeta,
        control: Arc<dyn CallControl>,
        config: InboundConfig,
    ) -> (Call<T>, RxStream<T>) {
        let inner = Arc::new(CallInner {
            meta,
            control,
            core: Mutex::new(CallCore {
                lifecycle: CallLifecycle::new(),
                inbound: InboundState::new(),
                outbound: OutboundState::default(),
                transport_cancelled: false,
                closed_wakers: Vec::new(),
            }),
        });

        {
            let mut core = inner.lock();
            core.lifecycle.process_input(LifecycleInput::Activate);
            inner.flush_lifecycle(&mut core);
        }

        debug!(
            call_id = %inner.meta.id,
            method = %inner.meta.method,
            shape = %inner.meta.shape,
            side = %inner.meta.side,
            "Call opened"
        );

        let stream = RxStream::new(Arc::clone(&inner), config);
        (Call { inner }, stream)
    }

    /// The transport-facing listener for this call's inbound direction.
    pub fn sink(&self) -> InboundSink<T> {
        InboundSink::new(Arc::clone(&self.inner))
    }

    /// Start the transport's inbound delivery into this call.
    pub fn listen(&self, source: Box<dyn InboundSource<T>>) {
        source.start(Arc::new(self.sink()));
    }

    /// Build the future draining `source` into the transport's outbound `sink`.
    pub fn drain<Out: Send + 'static>(
        &self,
        source: BoxStream<'static, Result<Out, Status>>,
        sink: Box<dyn MessageSink<Out>>,
        cardinality: Cardinality,
    ) -> Drain<T, Out> {
        Drain::new(Arc::clone(&self.inner), source, sink, cardinality)
    }

    /// Cancel the call from outside of its consumer, e.g. on server shutdown.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.inner.abort(CallError::Cancelled(reason.into()));
    }

    /// Resolves once both directions of the call have terminated.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        futures::future::poll_fn(move |cx| {
            let mut core = inner.lock();
            if core.lifecycle.state() == CallState::Terminated {
                return Poll::Ready(());
            }
            if !core.closed_wakers.iter().any(|w| w.will_wake(cx.waker())) {
                core.closed_wakers.push(cx.waker().clone());
            }
            Poll::Pending
        })
    }

    pub(crate) fn abort_handle(&self) -> Weak<dyn CallAbort> {
        let weak: Weak<CallInner<T>> = Arc::downgrade(&self.inner);
        weak
    }
}

impl<T> Call<T> {
    pub fn meta(&self) -> &CallMeta {
        &self.inner.meta
    }

    pub fn id(&self) -> &CallId {
        &self.inner.meta.id
    }

    pub fn state(&self) -> CallState {
        self.inner.lock().lifecycle.state()
    }
}

impl<T> fmt::Debug for Call<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("meta", &self.inner.meta)
            .field("state", &self.state())
            .finish()
    }
}
