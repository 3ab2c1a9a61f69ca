//! Protobuf framing between byte-level transports and typed calls.

use std::marker::PhantomData;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use prost::Message;
use tonic::Status;

use crate::bridge::error::CallError;
use crate::bridge::transport::{InboundSource, Listener, MessageSink, TransportCall};

/// Decodes inbound frames for a typed listener. A frame that fails to decode fails the call.
pub struct Decoding<T> {
    listener: Arc<dyn Listener<T>>,
}

impl<T> Decoding<T> {
    pub fn new(listener: Arc<dyn Listener<T>>) -> Self {
        Self { listener }
    }
}

impl<T: Message + Default + 'static> Listener<Bytes> for Decoding<T> {
    fn on_message(&self, frame: Bytes) {
        match T::decode(frame) {
            Ok(message) => self.listener.on_message(message),
            Err(error) => self.listener.on_failure(error.into()),
        }
    }

    fn on_half_close(&self) {
        self.listener.on_half_close();
    }

    fn on_error(&self, status: Status) {
        self.listener.on_error(status);
    }

    fn on_failure(&self, error: CallError) {
        self.listener.on_failure(error);
    }
}

struct DecodingSource<T> {
    frames: Box<dyn InboundSource<Bytes>>,
    _message: PhantomData<fn() -> T>,
}

impl<T: Message + Default + 'static> InboundSource<T> for DecodingSource<T> {
    fn start(self: Box<Self>, listener: Arc<dyn Listener<T>>) {
        self.frames.start(Arc::new(Decoding::new(listener)));
    }
}

/// Encodes typed outbound messages onto a byte-level sink.
pub struct Encoding<T, K> {
    frames: K,
    _message: PhantomData<fn(T)>,
}

impl<T, K> Encoding<T, K> {
    pub fn new(frames: K) -> Self {
        Self {
            frames,
            _message: PhantomData,
        }
    }
}

impl<T, K> MessageSink<T> for Encoding<T, K>
where
    T: Message + 'static,
    K: MessageSink<Bytes>,
{
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), CallError>> {
        self.frames.poll_ready(cx)
    }

    fn send_message(&mut self, item: T) -> Result<(), CallError> {
        self.frames.send_message(Bytes::from(item.encode_to_vec()))
    }

    fn half_close(&mut self) {
        self.frames.half_close();
    }

    fn close(&mut self, status: Status) {
        self.frames.close(status);
    }
}

impl TransportCall<Bytes, Bytes> {
    /// View a byte-level call as carrying protobuf messages.
    pub fn typed<In, Out>(self) -> TransportCall<In, Out>
    where
        In: Message + Default + 'static,
        Out: Message + 'static,
    {
        TransportCall {
            control: self.control,
            inbound: Box::new(DecodingSource::<In> {
                frames: self.inbound,
                _message: PhantomData,
            }),
            outbound: Box::new(Encoding::<Out, _>::new(self.outbound)),
        }
    }
}
