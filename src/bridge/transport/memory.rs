//! In-process transport: both ends of a call in one process, connected by bounded channels.
//!
//! Each direction is a bounded channel of frames. The sender sees readiness only while the
//! direction holds fewer than [`MemoryConfig::window`] frames; the receiving pump hands a frame to
//! its listener only against credit granted through [`CallControl::request_more`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use bon::Builder;
use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc;
use tonic::Status;
use tracing::{debug, trace};

use crate::bridge::call::Side;
use crate::bridge::demand::Demand;
use crate::bridge::error::CallError;
use crate::bridge::transport::{
    CallControl, Gate, GateCheck, InboundSource, Listener, MessageSink, Pump, TransportCall,
};

#[derive(Debug, Clone, Builder)]
pub struct MemoryConfig {
    /// Maximum frames in flight per direction, counting the one held by the receiver while it
    /// waits for credit. At least 2.
    #[builder(default = 4)]
    pub window: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn index(side: Side) -> usize {
    match side {
        Side::Client => 0,
        Side::Server => 1,
    }
}

#[derive(Default)]
struct WireState {
    /// First cancellation, and which side issued it.
    cancelled: Option<(Side, Status)>,
    /// Per sender: its stream has ended in-band.
    finished: [bool; 2],
    /// Per sender: the error status its stream ended with.
    trailer: [Option<Status>; 2],
    /// Per receiver: credit granted by its call.
    credit: [Demand; 2],
    pump_wakers: [Option<Waker>; 2],
    sink_wakers: [Option<Waker>; 2],
}

#[derive(Default)]
struct Wire {
    state: Mutex<WireState>,
}

impl Wire {
    fn lock(&self) -> MutexGuard<'_, WireState> {
        self.state.lock().expect("wire state lock poisoned")
    }
}

fn wake(waker: &mut Option<Waker>) {
    if let Some(waker) = waker.take() {
        waker.wake();
    }
}

/// Create the two ends of one in-process call, client end first.
pub fn call_pair(
    config: &MemoryConfig,
) -> (TransportCall<Bytes, Bytes>, TransportCall<Bytes, Bytes>) {
    // A channel holds `buffer + 1` frames for a single sender; the pump holds one more.
    let buffer = config.window.max(2) - 2;
    let (to_server, from_client) = mpsc::channel(buffer);
    let (to_client, from_server) = mpsc::channel(buffer);
    let wire = Arc::new(Wire::default());

    let end = |side: Side,
               tx: mpsc::Sender<Bytes>,
               rx: mpsc::Receiver<Bytes>|
     -> TransportCall<Bytes, Bytes> {
        TransportCall {
            control: Arc::new(MemoryControl {
                wire: Arc::clone(&wire),
                side,
            }),
            inbound: Box::new(MemorySource {
                frames: rx,
                wire: Arc::clone(&wire),
                side,
            }),
            outbound: Box::new(MemorySink {
                frames: tx,
                wire: Arc::clone(&wire),
                side,
            }),
        }
    };

    (
        end(Side::Client, to_server, from_server),
        end(Side::Server, to_client, from_client),
    )
}

struct MemoryControl {
    wire: Arc<Wire>,
    side: Side,
}

impl CallControl for MemoryControl {
    fn request_more(&self, n: Demand) {
        let mut state = self.wire.lock();
        let i = index(self.side);
        state.credit[i] = state.credit[i].add(n);
        trace!(side = %self.side, credit = %state.credit[i], "Credit granted");
        wake(&mut state.pump_wakers[i]);
    }

    fn pause(&self) {
        trace!(side = %self.side, "Receiver paused");
    }

    fn resume(&self) {
        trace!(side = %self.side, "Receiver resumed");
    }

    fn cancel(&self, status: Status) {
        let mut state = self.wire.lock();
        if state.cancelled.is_some() {
            return;
        }
        debug!(side = %self.side, code = ?status.code(), "Call cancelled on the wire");
        state.cancelled = Some((self.side, status));
        for i in 0..2 {
            wake(&mut state.pump_wakers[i]);
            wake(&mut state.sink_wakers[i]);
        }
    }
}

struct MemorySource {
    frames: mpsc::Receiver<Bytes>,
    wire: Arc<Wire>,
    side: Side,
}

impl InboundSource<Bytes> for MemorySource {
    fn start(self: Box<Self>, listener: Arc<dyn Listener<Bytes>>) {
        let gate = Arc::new(MemoryGate {
            wire: self.wire,
            side: self.side,
        });
        tokio::spawn(Pump::new(self.frames.map(Ok).boxed(), gate, listener));
    }
}

/// The receiving side's view of the wire.
struct MemoryGate {
    wire: Arc<Wire>,
    side: Side,
}

impl Gate for MemoryGate {
    fn check(&self, cx: &mut Context<'_>) -> GateCheck {
        let mut state = self.wire.lock();
        let peer = index(self.side.peer());

        if let Some((by, status)) = &state.cancelled {
            if *by == self.side {
                return GateCheck::Stop;
            }
            // A peer that finished in-band before cancelling still gets its frames delivered.
            if !state.finished[peer] {
                return GateCheck::PeerCancelled(status.clone());
            }
        }

        state.pump_wakers[index(self.side)] = Some(cx.waker().clone());
        GateCheck::Open
    }

    fn take_credit(&self) -> bool {
        self.wire.lock().credit[index(self.side)].take_one()
    }

    fn trailer(&self) -> Option<Status> {
        self.wire.lock().trailer[index(self.side.peer())].take()
    }
}

struct MemorySink {
    frames: mpsc::Sender<Bytes>,
    wire: Arc<Wire>,
    side: Side,
}

impl MemorySink {
    fn finish(&mut self, trailer: Option<Status>) {
        {
            let mut state = self.wire.lock();
            let i = index(self.side);
            if state.finished[i] {
                return;
            }
            state.finished[i] = true;
            state.trailer[i] = trailer;
        }
        self.frames.close_channel();
    }
}

impl MessageSink<Bytes> for MemorySink {
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), CallError>> {
        {
            let mut state = self.wire.lock();
            if let Some((_, status)) = &state.cancelled {
                return Poll::Ready(Err(CallError::from_transport(status.clone())));
            }
            state.sink_wakers[index(self.side)] = Some(cx.waker().clone());
        }

        self.frames
            .poll_ready(cx)
            .map_err(|_| CallError::Cancelled("receiver is gone".to_string()))
    }

    fn send_message(&mut self, frame: Bytes) -> Result<(), CallError> {
        self.frames
            .start_send(frame)
            .map_err(|_| CallError::Cancelled("receiver is gone".to_string()))
    }

    fn half_close(&mut self) {
        self.finish(None);
    }

    fn close(&mut self, status: Status) {
        self.finish(Some(status));
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        if self.wire.state.lock().is_ok() {
            self.finish(Some(Status::cancelled("sender dropped")));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::Notify;
    use tonic::Code;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Bytes>>,
        ended: Mutex<Option<Result<(), Status>>>,
        notify: Notify,
    }

    impl Listener<Bytes> for Recorder {
        fn on_message(&self, frame: Bytes) {
            self.frames.lock().unwrap().push(frame);
            self.notify.notify_one();
        }

        fn on_half_close(&self) {
            *self.ended.lock().unwrap() = Some(Ok(()));
            self.notify.notify_one();
        }

        fn on_error(&self, status: Status) {
            *self.ended.lock().unwrap() = Some(Err(status));
            self.notify.notify_one();
        }
    }

    impl Recorder {
        async fn until(&self, done: impl Fn(&Self) -> bool) {
            tokio::time::timeout(Duration::from_secs(1), async {
                while !done(self) {
                    self.notify.notified().await;
                }
            })
            .await
            .expect("timed out waiting for listener");
        }
    }

    async fn send(sink: &mut Box<dyn MessageSink<Bytes>>, frame: &'static [u8]) {
        futures::future::poll_fn(|cx| sink.poll_ready(cx))
            .await
            .unwrap();
        sink.send_message(Bytes::from_static(frame)).unwrap();
    }

    #[tokio::test]
    async fn test_frames_need_credit() {
        let (client, server) = call_pair(&MemoryConfig::default());
        let recorder = Arc::new(Recorder::default());
        server.inbound.start(recorder.clone());

        let mut outbound = client.outbound;
        send(&mut outbound, b"a").await;
        send(&mut outbound, b"b").await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(recorder.frames.lock().unwrap().is_empty());

        server.control.request_more(Demand::from(1u64));
        recorder.until(|r| r.frames.lock().unwrap().len() == 1).await;

        server.control.request_more(Demand::from(5u64));
        outbound.half_close();
        recorder.until(|r| r.ended.lock().unwrap().is_some()).await;

        assert_eq!(recorder.frames.lock().unwrap().len(), 2);
        assert!(matches!(*recorder.ended.lock().unwrap(), Some(Ok(()))));
    }

    #[tokio::test]
    async fn test_close_with_status_reaches_peer() {
        let (client, server) = call_pair(&MemoryConfig::default());
        let recorder = Arc::new(Recorder::default());
        client.inbound.start(recorder.clone());

        let mut outbound = server.outbound;
        outbound.close(Status::not_found("nobody here"));
        recorder.until(|r| r.ended.lock().unwrap().is_some()).await;

        let ended = recorder.ended.lock().unwrap().clone().unwrap();
        assert_eq!(ended.unwrap_err().code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_cancel_reaches_peer_but_not_self() {
        let (client, server) = call_pair(&MemoryConfig::default());
        let at_client = Arc::new(Recorder::default());
        let at_server = Arc::new(Recorder::default());
        client.inbound.start(at_client.clone());
        server.inbound.start(at_server.clone());

        client.control.cancel(Status::cancelled("user gave up"));
        at_server.until(|r| r.ended.lock().unwrap().is_some()).await;

        let ended = at_server.ended.lock().unwrap().clone().unwrap();
        assert_eq!(ended.unwrap_err().code(), Code::Cancelled);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(at_client.ended.lock().unwrap().is_none());

        let mut outbound = server.outbound;
        let ready = futures::future::poll_fn(|cx| outbound.poll_ready(cx)).await;
        assert!(ready.is_err());
    }

    #[tokio::test]
    async fn test_sender_waits_when_window_is_full() {
        let config = MemoryConfig::builder().window(2).build();
        let (client, server) = call_pair(&config);
        let recorder = Arc::new(Recorder::default());
        server.inbound.start(recorder.clone());

        let mut outbound = client.outbound;
        let mut sent = 0;
        for _ in 0..10 {
            let ready = tokio::time::timeout(
                Duration::from_millis(50),
                futures::future::poll_fn(|cx| outbound.poll_ready(cx)),
            )
            .await;
            if ready.is_err() {
                break;
            }
            outbound.send_message(Bytes::from_static(b"x")).unwrap();
            sent += 1;
        }
        assert_eq!(sent, 2);

        server.control.request_more(Demand::Unbounded);
        recorder.until(|r| r.frames.lock().unwrap().len() == 2).await;
    }
}
