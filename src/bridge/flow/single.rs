use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::StreamExt;

use crate::bridge::call::CallId;
use crate::bridge::error::{CallError, Violation};
use crate::bridge::flow::inbound::{InboundConfig, RxStream};

/// The exactly-one view of an inbound sequence.
///
/// Resolves with the message once the sequence completed. Completion without a message fails
/// with [`Violation::MissingItem`]; a second message fails with [`Violation::ExtraItem`] as soon
/// as it arrives. Either violation also fails the call.
pub struct RxSingle<T> {
    stream: RxStream<T>,
    first: Option<T>,
    done: bool,
    /// The message was already received and validated.
    received: bool,
}

impl<T> RxSingle<T> {
    pub fn new(stream: RxStream<T>) -> Self {
        Self {
            stream: stream.with_config(InboundConfig::single()),
            first: None,
            done: false,
            received: false,
        }
    }

    /// Wait until exactly one message arrived and the sequence completed, then hand back a
    /// single that resolves with that message immediately.
    pub(crate) async fn received(mut self) -> Result<Self, CallError> {
        let item = (&mut self).await?;
        self.first = Some(item);
        self.done = false;
        self.received = true;
        Ok(self)
    }

    pub fn call_id(&self) -> &CallId {
        self.stream.call_id()
    }

    /// Give up on the message and cancel the call.
    pub fn cancel(&self) {
        self.stream.cancel();
    }

    fn violation(&mut self, violation: Violation) -> CallError {
        let error = CallError::from(violation);
        self.stream.reject(error.clone());
        error
    }
}

impl<T> Unpin for RxSingle<T> {}

impl<T> Future for RxSingle<T> {
    type Output = Result<T, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Err(CallError::Cancelled(
                "single polled after completion".to_string(),
            )));
        }

        if this.received {
            if let Some(item) = this.first.take() {
                this.done = true;
                return Poll::Ready(Ok(item));
            }
        }

        loop {
            match ready!(this.stream.poll_next_unpin(cx)) {
                Some(Ok(item)) if this.first.is_none() => this.first = Some(item),
                Some(Ok(_)) => {
                    this.done = true;
                    return Poll::Ready(Err(this.violation(Violation::ExtraItem)));
                }
                Some(Err(error)) => {
                    this.done = true;
                    return Poll::Ready(Err(error));
                }
                None => {
                    this.done = true;
                    return Poll::Ready(match this.first.take() {
                        Some(item) => Ok(item),
                        None => Err(this.violation(Violation::MissingItem)),
                    });
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for RxSingle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxSingle")
            .field("call_id", self.call_id())
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::FutureExt;
    use tonic::{Code, Status};

    use super::*;
    use crate::bridge::call::{Call, CallMeta, Side};
    use crate::bridge::demand::Demand;
    use crate::bridge::shape::CallShape;
    use crate::bridge::transport::{CallControl, Listener};

    #[derive(Default)]
    struct Control {
        requested: Mutex<Vec<Demand>>,
        cancelled: Mutex<Vec<Status>>,
    }

    impl CallControl for Control {
        fn request_more(&self, n: Demand) {
            self.requested.lock().unwrap().push(n);
        }

        fn cancel(&self, status: Status) {
            self.cancelled.lock().unwrap().push(status);
        }
    }

    fn open() -> (Arc<Control>, Call<String>, RxSingle<String>) {
        let control = Arc::new(Control::default());
        let meta = CallMeta::new("test.Service/Unary", CallShape::SingleSingle, Side::Server);
        let (call, stream) = Call::open(meta, control.clone(), Default::default());
        (control, call, RxSingle::new(stream))
    }

    #[test]
    fn test_resolves_after_completion() {
        let (control, call, mut single) = open();
        assert!((&mut single).now_or_never().is_none());
        assert_eq!(*control.requested.lock().unwrap(), vec![Demand::from(2u64)]);

        call.sink().on_message("hello".to_string());
        assert!((&mut single).now_or_never().is_none());

        call.sink().on_half_close();
        assert_eq!(single.now_or_never().unwrap().unwrap(), "hello");
        assert!(control.cancelled.lock().unwrap().is_empty());
    }

    #[test]
    fn test_second_item_is_rejected_eagerly() {
        let (control, call, mut single) = open();
        assert!((&mut single).now_or_never().is_none());

        call.sink().on_message("one".to_string());
        call.sink().on_message("two".to_string());

        let error = single.now_or_never().unwrap().unwrap_err();
        assert!(matches!(
            error,
            CallError::ProtocolViolation(Violation::ExtraItem)
        ));

        let cancelled = control.cancelled.lock().unwrap().clone();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].code(), Code::Internal);
    }

    #[test]
    fn test_completion_without_item_is_rejected() {
        let (control, call, mut single) = open();
        assert!((&mut single).now_or_never().is_none());
        call.sink().on_half_close();

        let error = single.now_or_never().unwrap().unwrap_err();
        assert!(matches!(
            error,
            CallError::ProtocolViolation(Violation::MissingItem)
        ));
        assert_eq!(control.cancelled.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_received_single_resolves_without_transport() {
        let (control, call, single) = open();
        let mut received = single.received().boxed();
        assert!((&mut received).now_or_never().is_none());

        call.sink().on_message("hello".to_string());
        call.sink().on_half_close();
        let single = received.now_or_never().unwrap().unwrap();

        assert_eq!(single.now_or_never().unwrap().unwrap(), "hello");
        assert!(control.cancelled.lock().unwrap().is_empty());
    }

    #[test]
    fn test_transport_error_passes_through() {
        let (_control, call, mut single) = open();
        assert!((&mut single).now_or_never().is_none());
        call.sink().on_error(Status::unavailable("gone"));

        let error = single.now_or_never().unwrap().unwrap_err();
        assert_eq!(error.code(), Code::Unavailable);
    }
}
