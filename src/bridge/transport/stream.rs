//! Transport over an existing pull-based request stream and a channel-backed response stream.
//!
//! This is how a handler is mounted behind a tonic service: the request side is the
//! `tonic::Streaming<Req>` tonic hands to the service method, the response side is a
//! [`ResponseStream`] returned as the method's response body.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use tonic::Status;
use tracing::debug;

use crate::bridge::demand::Demand;
use crate::bridge::error::CallError;
use crate::bridge::transport::{
    CallControl, Gate, GateCheck, InboundSource, Listener, MessageSink, Pump, TransportCall,
};

#[derive(Default)]
struct BridgeState {
    credit: Demand,
    /// Cancelled by the local call.
    cancelled: Option<Status>,
    /// The response consumer went away.
    peer_gone: Option<Status>,
    /// The response stream ended in-band.
    finished: bool,
    trailer: Option<Status>,
    pump_waker: Option<Waker>,
    response_waker: Option<Waker>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BridgeState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().expect("bridge state lock poisoned")
    }
}

fn wake(waker: &mut Option<Waker>) {
    if let Some(waker) = waker.take() {
        waker.wake();
    }
}

/// Bridge `requests` into a call, returning the transport for the call and the stream of its
/// responses.
///
/// `window` bounds the responses buffered ahead of the response consumer.
pub fn bridge<Req, Resp, S>(
    requests: S,
    window: usize,
) -> (TransportCall<Req, Resp>, ResponseStream<Resp>)
where
    Req: Send + 'static,
    Resp: Send + 'static,
    S: Stream<Item = Result<Req, Status>> + Send + 'static,
{
    let shared = Arc::new(Shared::default());
    let (tx, rx) = mpsc::channel(window.max(1) - 1);

    let transport: TransportCall<Req, Resp> = TransportCall {
        control: Arc::new(StreamControl {
            shared: Arc::clone(&shared),
        }),
        inbound: Box::new(StreamSource {
            requests: requests.boxed(),
            shared: Arc::clone(&shared),
        }),
        outbound: Box::new(ChannelSink {
            responses: tx,
            shared: Arc::clone(&shared),
        }),
    };
    let responses = ResponseStream {
        responses: rx,
        shared,
        done: false,
    };
    (transport, responses)
}

struct StreamControl {
    shared: Arc<Shared>,
}

impl CallControl for StreamControl {
    fn request_more(&self, n: Demand) {
        let mut state = self.shared.lock();
        state.credit = state.credit.add(n);
        wake(&mut state.pump_waker);
    }

    fn cancel(&self, status: Status) {
        let mut state = self.shared.lock();
        if state.cancelled.is_some() {
            return;
        }
        debug!(code = ?status.code(), "Stream call cancelled");
        state.cancelled = Some(status);
        wake(&mut state.pump_waker);
        wake(&mut state.response_waker);
    }
}

struct StreamSource<Req> {
    requests: futures::stream::BoxStream<'static, Result<Req, Status>>,
    shared: Arc<Shared>,
}

impl<Req: Send + 'static> InboundSource<Req> for StreamSource<Req> {
    fn start(self: Box<Self>, listener: Arc<dyn Listener<Req>>) {
        let gate = Arc::new(StreamGate {
            shared: self.shared,
        });
        tokio::spawn(Pump::new(self.requests, gate, listener));
    }
}

struct StreamGate {
    shared: Arc<Shared>,
}

impl Gate for StreamGate {
    fn check(&self, cx: &mut Context<'_>) -> GateCheck {
        let mut state = self.shared.lock();
        if state.cancelled.is_some() {
            return GateCheck::Stop;
        }
        if let Some(status) = state.peer_gone.take() {
            return GateCheck::PeerCancelled(status);
        }
        state.pump_waker = Some(cx.waker().clone());
        GateCheck::Open
    }

    fn take_credit(&self) -> bool {
        self.shared.lock().credit.take_one()
    }
}

struct ChannelSink<Resp> {
    responses: mpsc::Sender<Resp>,
    shared: Arc<Shared>,
}

impl<Resp> ChannelSink<Resp> {
    fn finish(&mut self, trailer: Option<Status>) {
        {
            let mut state = self.shared.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            state.trailer = trailer;
        }
        self.responses.close_channel();
    }
}

impl<Resp: Send + 'static> MessageSink<Resp> for ChannelSink<Resp> {
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), CallError>> {
        if let Some(status) = &self.shared.lock().cancelled {
            return Poll::Ready(Err(CallError::from_transport(status.clone())));
        }
        self.responses
            .poll_ready(cx)
            .map_err(|_| CallError::Cancelled("response stream dropped".to_string()))
    }

    fn send_message(&mut self, item: Resp) -> Result<(), CallError> {
        self.responses
            .start_send(item)
            .map_err(|_| CallError::Cancelled("response stream dropped".to_string()))
    }

    fn half_close(&mut self) {
        self.finish(None);
    }

    fn close(&mut self, status: Status) {
        self.finish(Some(status));
    }
}

impl<Resp> Drop for ChannelSink<Resp> {
    fn drop(&mut self) {
        if self.shared.state.lock().is_ok() {
            self.finish(Some(Status::cancelled("response sender dropped")));
        }
    }
}

/// Responses of a bridged call: every message sent, then `Err(status)` if the call failed.
///
/// Dropping it before the end cancels the call.
pub struct ResponseStream<T> {
    responses: mpsc::Receiver<T>,
    shared: Arc<Shared>,
    done: bool,
}

impl<T> Stream for ResponseStream<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        {
            let mut state = this.shared.lock();
            if !state.finished {
                if let Some(status) = state.cancelled.clone() {
                    this.done = true;
                    return Poll::Ready(Some(Err(status)));
                }
            }
            state.response_waker = Some(cx.waker().clone());
        }

        match this.responses.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(item)) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(this.shared.lock().trailer.take().map(Err))
            }
        }
    }
}

impl<T> Drop for ResponseStream<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Ok(mut state) = self.shared.state.lock() {
            if state.cancelled.is_none() && !state.finished {
                state.peer_gone = Some(Status::cancelled("response stream dropped"));
                wake(&mut state.pump_waker);
            }
        }
    }
}

impl<T> std::fmt::Debug for ResponseStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;
    use tonic::Code;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        items: Mutex<Vec<u32>>,
        ended: Mutex<Option<Result<(), Status>>>,
    }

    impl Listener<u32> for Recorder {
        fn on_message(&self, item: u32) {
            self.items.lock().unwrap().push(item);
        }

        fn on_half_close(&self) {
            *self.ended.lock().unwrap() = Some(Ok(()));
        }

        fn on_error(&self, status: Status) {
            *self.ended.lock().unwrap() = Some(Err(status));
        }
    }

    #[tokio::test]
    async fn test_requests_are_pumped_against_credit() {
        let requests = stream::iter(vec![Ok(1u32), Ok(2), Ok(3)]);
        let (transport, _responses) = bridge::<u32, u32, _>(requests, 4);
        let recorder = Arc::new(Recorder::default());
        transport.inbound.start(recorder.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(recorder.items.lock().unwrap().is_empty());

        transport.control.request_more(Demand::from(2u64));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*recorder.items.lock().unwrap(), vec![1, 2]);
        assert!(recorder.ended.lock().unwrap().is_none());

        transport.control.request_more(Demand::from(1u64));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*recorder.items.lock().unwrap(), vec![1, 2, 3]);
        assert!(matches!(*recorder.ended.lock().unwrap(), Some(Ok(()))));
    }

    #[tokio::test]
    async fn test_response_trailer_follows_messages() {
        let (transport, responses) = bridge::<u32, u32, _>(stream::empty(), 4);
        let mut outbound = transport.outbound;

        futures::future::poll_fn(|cx| outbound.poll_ready(cx))
            .await
            .unwrap();
        outbound.send_message(5).unwrap();
        outbound.close(Status::permission_denied("not yours"));

        let received: Vec<Result<u32, Status>> = responses.collect().await;
        assert_eq!(received.len(), 2);
        assert_eq!(*received[0].as_ref().unwrap(), 5);
        assert_eq!(
            received[1].as_ref().unwrap_err().code(),
            Code::PermissionDenied
        );
    }

    #[tokio::test]
    async fn test_dropping_responses_cancels_requests() {
        let (transport, responses) = bridge::<u32, u32, _>(stream::pending(), 4);
        let recorder = Arc::new(Recorder::default());
        transport.inbound.start(recorder.clone());
        transport.control.request_more(Demand::Unbounded);

        drop(responses);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ended = recorder.ended.lock().unwrap().clone();
        assert_eq!(ended.unwrap().unwrap_err().code(), Code::Cancelled);
    }
}
