use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, Stream, StreamExt};
use prost::Message;
use tonic::Status;
use tracing::{debug, error};

use crate::bridge::call::{Call, CallMeta, Side};
use crate::bridge::flow::inbound::{InboundConfig, RxStream};
use crate::bridge::flow::outbound::Drain;
use crate::bridge::flow::single::RxSingle;
use crate::bridge::server::config::RouterConfig;
use crate::bridge::server::registry::CallGuard;
use crate::bridge::shape::CallShape;
use crate::bridge::transport::TransportCall;
use crate::bridge::transport::stream::{self as stream_transport, ResponseStream};

type UnaryFn<Req, Resp> =
    dyn Fn(RxSingle<Req>) -> BoxFuture<'static, Result<Resp, Status>> + Send + Sync;
type ServerStreamingFn<Req, Resp> =
    dyn Fn(RxSingle<Req>) -> BoxStream<'static, Result<Resp, Status>> + Send + Sync;
type ClientStreamingFn<Req, Resp> =
    dyn Fn(RxStream<Req>) -> BoxFuture<'static, Result<Resp, Status>> + Send + Sync;
type BidiStreamingFn<Req, Resp> =
    dyn Fn(RxStream<Req>) -> BoxStream<'static, Result<Resp, Status>> + Send + Sync;

/// Business logic for one method, tagged with its call shape.
pub enum Handler<Req, Resp> {
    SingleSingle(Arc<UnaryFn<Req, Resp>>),
    SingleStream(Arc<ServerStreamingFn<Req, Resp>>),
    StreamSingle(Arc<ClientStreamingFn<Req, Resp>>),
    StreamStream(Arc<BidiStreamingFn<Req, Resp>>),
}

impl<Req, Resp> Clone for Handler<Req, Resp> {
    fn clone(&self) -> Self {
        match self {
            Handler::SingleSingle(f) => Handler::SingleSingle(Arc::clone(f)),
            Handler::SingleStream(f) => Handler::SingleStream(Arc::clone(f)),
            Handler::StreamSingle(f) => Handler::StreamSingle(Arc::clone(f)),
            Handler::StreamStream(f) => Handler::StreamStream(Arc::clone(f)),
        }
    }
}

fn panicked() -> Status {
    Status::internal("handler panicked")
}

impl<Req, Resp> Handler<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn unary<F, Fut>(handler: F) -> Self
    where
        F: Fn(RxSingle<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        Handler::SingleSingle(Arc::new(move |request| handler(request).boxed()))
    }

    pub fn server_streaming<F, S>(handler: F) -> Self
    where
        F: Fn(RxSingle<Req>) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        Handler::SingleStream(Arc::new(move |request| handler(request).boxed()))
    }

    pub fn client_streaming<F, Fut>(handler: F) -> Self
    where
        F: Fn(RxStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        Handler::StreamSingle(Arc::new(move |requests| handler(requests).boxed()))
    }

    pub fn bidi_streaming<F, S>(handler: F) -> Self
    where
        F: Fn(RxStream<Req>) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        Handler::StreamStream(Arc::new(move |requests| handler(requests).boxed()))
    }

    pub fn shape(&self) -> CallShape {
        match self {
            Handler::SingleSingle(_) => CallShape::SingleSingle,
            Handler::SingleStream(_) => CallShape::SingleStream,
            Handler::StreamSingle(_) => CallShape::StreamSingle,
            Handler::StreamStream(_) => CallShape::StreamStream,
        }
    }

    /// Hand the inbound sequence to the business logic and return its outbound sequence.
    ///
    /// Single-request shapes run the business logic only once the request was fully received,
    /// so zero or two requests fail the call whether or not the handler looks at its input.
    /// A panic, whether raised while building the response or while producing it, becomes an
    /// `INTERNAL` failure of the outbound sequence.
    fn invoke(&self, requests: RxStream<Req>) -> BoxStream<'static, Result<Resp, Status>> {
        let invoked = panic::catch_unwind(AssertUnwindSafe(|| match self {
            Handler::SingleSingle(f) => {
                let f = Arc::clone(f);
                async move {
                    let request = RxSingle::new(requests).received().await?;
                    f(request).await
                }
                .into_stream()
                .boxed()
            }
            Handler::SingleStream(f) => {
                let f = Arc::clone(f);
                async move {
                    match RxSingle::new(requests).received().await {
                        Ok(request) => f(request),
                        Err(error) => {
                            stream::once(async move { Err(Status::from(error)) }).boxed()
                        }
                    }
                }
                .flatten_stream()
                .boxed()
            }
            Handler::StreamSingle(f) => f(requests).into_stream().boxed(),
            Handler::StreamStream(f) => f(requests),
        }));

        match invoked {
            Ok(responses) => AssertUnwindSafe(responses)
                .catch_unwind()
                .map(|item| {
                    item.unwrap_or_else(|_| {
                        error!("Handler panicked while producing a response");
                        Err(panicked())
                    })
                })
                .boxed(),
            Err(_) => {
                error!("Handler panicked");
                stream::once(async { Err(panicked()) }).boxed()
            }
        }
    }

    /// Open the server side of a call over `transport` and start the business logic.
    ///
    /// Returns the call and the drain that must be polled to send its responses.
    pub fn serve(
        &self,
        meta: CallMeta,
        transport: TransportCall<Req, Resp>,
        config: InboundConfig,
    ) -> (Call<Req>, Drain<Req, Resp>) {
        let TransportCall {
            control,
            inbound,
            outbound,
        } = transport;

        let (call, requests) = Call::open(meta, control, config);
        call.listen(inbound);
        let responses = self.invoke(requests);
        let drain = call.drain(
            responses,
            outbound,
            self.shape().response_cardinality(),
        );
        (call, drain)
    }

    /// Serve one call whose requests arrive on a pull-based stream, such as the
    /// `tonic::Streaming<Req>` of a tonic service method. The returned stream is the response
    /// body.
    pub fn serve_stream<S>(
        &self,
        method: &str,
        requests: S,
        config: &RouterConfig,
    ) -> ResponseStream<Resp>
    where
        S: Stream<Item = Result<Req, Status>> + Send + 'static,
    {
        let (transport, responses) = stream_transport::bridge(requests, config.response_window);
        let meta = CallMeta::new(method, self.shape(), Side::Server);
        let (call, drain) = self.serve(meta, transport, config.inbound);
        tokio::spawn(run(call, drain, None));
        responses
    }
}

/// Drive a served call to the end, keeping it registered meanwhile.
async fn run<Req, Resp>(call: Call<Req>, drain: Drain<Req, Resp>, guard: Option<CallGuard>)
where
    Req: Send + 'static,
    Resp: 'static,
{
    let _guard = guard;
    match drain.await {
        Ok(sent) => debug!(call_id = %call.id(), sent, "Responses drained"),
        Err(error) => debug!(call_id = %call.id(), %error, "Responses ended early"),
    }
    call.closed().await;
}

/// Type-erased handler stored in the router, working on protobuf frames.
pub(crate) trait ErasedHandler: Send + Sync {
    fn shape(&self) -> CallShape;

    fn spawn(
        &self,
        meta: CallMeta,
        transport: TransportCall<Bytes, Bytes>,
        config: InboundConfig,
        guard: CallGuard,
    );
}

impl<Req, Resp> ErasedHandler for Handler<Req, Resp>
where
    Req: Message + Default + 'static,
    Resp: Message + 'static,
{
    fn shape(&self) -> CallShape {
        Handler::shape(self)
    }

    fn spawn(
        &self,
        meta: CallMeta,
        transport: TransportCall<Bytes, Bytes>,
        config: InboundConfig,
        guard: CallGuard,
    ) {
        let (call, drain) = self.serve(meta, transport.typed::<Req, Resp>(), config);
        guard.attach(call.abort_handle());
        tokio::spawn(run(call, drain, Some(guard)));
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use tonic::Code;

    use super::*;

    #[test]
    fn test_constructors_tag_shapes() {
        let unary = Handler::<u32, u32>::unary(|request| async move {
            Ok::<_, Status>(request.await? + 1)
        });
        let server =
            Handler::<u32, u32>::server_streaming(|_| stream::iter(vec![Ok::<_, Status>(1)]));
        let client = Handler::<u32, u32>::client_streaming(|requests| async move {
            let all: Vec<u32> = requests.try_collect().await?;
            Ok::<_, Status>(all.len() as u32)
        });
        let bidi = Handler::<u32, u32>::bidi_streaming(|requests| {
            requests.map_err(Status::from)
        });

        assert_eq!(unary.shape(), CallShape::SingleSingle);
        assert_eq!(server.shape(), CallShape::SingleStream);
        assert_eq!(client.shape(), CallShape::StreamSingle);
        assert_eq!(bidi.shape(), CallShape::StreamStream);
    }

    #[tokio::test]
    async fn test_serve_stream_bidi() {
        let handler = Handler::<u32, u32>::bidi_streaming(|requests| {
            requests.map_ok(|n| n * 10).map_err(Status::from)
        });
        let requests = stream::iter(vec![Ok(1), Ok(2), Ok(3)]);
        let responses =
            handler.serve_stream("test.Math/Scale", requests, &RouterConfig::default());

        let received: Vec<u32> = responses.try_collect().await.unwrap();
        assert_eq!(received, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_serve_stream_unary_rejects_two_requests() {
        let handler = Handler::<u32, u32>::unary(|request| async move {
            Ok::<_, Status>(request.await?)
        });
        let requests = stream::iter(vec![Ok(1), Ok(2)]);
        let responses =
            handler.serve_stream("test.Math/Echo", requests, &RouterConfig::default());

        let received: Vec<Result<u32, Status>> = responses.collect().await;
        let status = received
            .into_iter()
            .find_map(Result::err)
            .expect("call should fail");
        assert_eq!(status.code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_request_count_enforced_when_handler_ignores_request() {
        let unary = Handler::<u32, u32>::unary(|_request| async move { Ok::<_, Status>(7) });
        let server = Handler::<u32, u32>::server_streaming(|_request| {
            stream::iter(vec![Ok::<_, Status>(1), Ok(2)])
        });

        for handler in [unary, server] {
            for requests in [vec![], vec![Ok(1), Ok(2)]] {
                let responses = handler.serve_stream(
                    "test.Math/Ignore",
                    stream::iter(requests),
                    &RouterConfig::default(),
                );
                let received: Vec<Result<u32, Status>> = responses.collect().await;
                assert_eq!(received.len(), 1, "{:?}: {received:?}", handler.shape());
                assert_eq!(received[0].as_ref().unwrap_err().code(), Code::Internal);
            }
        }
    }

    #[tokio::test]
    async fn test_ignored_single_request_still_answers() {
        let handler = Handler::<u32, u32>::unary(|_request| async move { Ok::<_, Status>(7) });
        let responses = handler.serve_stream(
            "test.Math/Ignore",
            stream::iter(vec![Ok(1)]),
            &RouterConfig::default(),
        );

        let received: Vec<u32> = responses.try_collect().await.unwrap();
        assert_eq!(received, vec![7]);
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_with_internal() {
        let handler = Handler::<u32, u32>::server_streaming(|_request| -> BoxStream<'static, _> {
            panic!("boom")
        });
        let requests = stream::iter(vec![Ok(1)]);
        let responses =
            handler.serve_stream("test.Math/Boom", requests, &RouterConfig::default());

        let received: Vec<Result<u32, Status>> = responses.collect().await;
        let status = received.into_iter().find_map(Result::err).unwrap();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "handler panicked");
    }

    #[tokio::test]
    async fn test_handler_error_reaches_peer() {
        let handler = Handler::<u32, u32>::unary(|_request| async move {
            Err::<u32, _>(Status::failed_precondition("not today"))
        });
        let requests = stream::iter(vec![Ok(1)]);
        let responses =
            handler.serve_stream("test.Math/Fail", requests, &RouterConfig::default());

        let received: Vec<Result<u32, Status>> = responses.collect().await;
        assert_eq!(received.len(), 1);
        assert_eq!(
            received[0].as_ref().unwrap_err().code(),
            Code::FailedPrecondition
        );
    }
}
