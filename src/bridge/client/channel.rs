use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use prost::Message;
use tonic::Status;
use tracing::{debug, warn};

use crate::bridge::call::{Call, CallMeta, Side};
use crate::bridge::client::config::ChannelConfig;
use crate::bridge::flow::inbound::RxStream;
use crate::bridge::flow::single::RxSingle;
use crate::bridge::server::RpcRouter;
use crate::bridge::shape::{CallShape, Cardinality};
use crate::bridge::transport::memory::call_pair;

/// Client end of an in-process RPC connection.
///
/// Every call gets its own transport pair; the server end is handed to the router and the
/// client end is bridged into an [`RxStream`] of responses, while the requests are drained into
/// the transport on a spawned task.
#[derive(Clone)]
pub struct RpcChannel {
    router: Arc<RpcRouter>,
    config: ChannelConfig,
}

impl RpcChannel {
    pub fn in_process(router: Arc<RpcRouter>, config: ChannelConfig) -> Self {
        Self { router, config }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Issue a call without enforcing the request cardinality of `shape`.
    ///
    /// Lets a caller send zero or several requests to a method that expects exactly one, which
    /// the server must reject.
    pub fn start_call<Req, Resp, S>(
        &self,
        method: &str,
        shape: CallShape,
        requests: S,
    ) -> RxStream<Resp>
    where
        Req: Message + 'static,
        Resp: Message + Default + 'static,
        S: Stream<Item = Result<Req, Status>> + Send + 'static,
    {
        self.open_call(method, shape, requests.boxed(), Cardinality::Many)
    }

    pub fn unary<Req, Resp>(&self, method: &str, request: Req) -> RxSingle<Resp>
    where
        Req: Message + 'static,
        Resp: Message + Default + 'static,
    {
        let requests = stream::once(async move { Ok(request) }).boxed();
        RxSingle::new(self.open_call(method, CallShape::SingleSingle, requests, Cardinality::One))
    }

    pub fn server_streaming<Req, Resp>(&self, method: &str, request: Req) -> RxStream<Resp>
    where
        Req: Message + 'static,
        Resp: Message + Default + 'static,
    {
        let requests = stream::once(async move { Ok(request) }).boxed();
        self.open_call(method, CallShape::SingleStream, requests, Cardinality::One)
    }

    pub fn client_streaming<Req, Resp, S>(&self, method: &str, requests: S) -> RxSingle<Resp>
    where
        Req: Message + 'static,
        Resp: Message + Default + 'static,
        S: Stream<Item = Result<Req, Status>> + Send + 'static,
    {
        RxSingle::new(self.open_call(
            method,
            CallShape::StreamSingle,
            requests.boxed(),
            Cardinality::Many,
        ))
    }

    pub fn bidi_streaming<Req, Resp, S>(&self, method: &str, requests: S) -> RxStream<Resp>
    where
        Req: Message + 'static,
        Resp: Message + Default + 'static,
        S: Stream<Item = Result<Req, Status>> + Send + 'static,
    {
        self.open_call(
            method,
            CallShape::StreamStream,
            requests.boxed(),
            Cardinality::Many,
        )
    }

    fn open_call<Req, Resp>(
        &self,
        method: &str,
        shape: CallShape,
        requests: BoxStream<'static, Result<Req, Status>>,
        cardinality: Cardinality,
    ) -> RxStream<Resp>
    where
        Req: Message + 'static,
        Resp: Message + Default + 'static,
    {
        let (client_end, server_end) = call_pair(&self.config.memory);
        let transport = client_end.typed::<Resp, Req>();

        let meta = CallMeta::new(method, shape, Side::Client);
        let (call, responses) = Call::open(meta, transport.control, self.config.inbound);
        call.listen(transport.inbound);

        let drain = call.drain(requests, transport.outbound, cardinality);
        let call_id = call.id().clone();
        tokio::spawn(async move {
            match drain.await {
                Ok(sent) => debug!(call_id = %call_id, sent, "Requests drained"),
                Err(error) => debug!(call_id = %call_id, %error, "Requests ended early"),
            }
        });

        // A rejected dispatch closes the server end, which the response stream observes.
        if let Err(error) = self.router.dispatch(method, server_end) {
            warn!(call_id = %call.id(), method = %method, %error, "Call was not dispatched");
        }

        responses
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::TryStreamExt;
    use tokio::time::timeout;
    use tonic::Code;

    use super::*;
    use crate::bridge::error::CallError;
    use crate::bridge::server::RouterConfig;
    use crate::greeter::{HelloRequest, HelloResponse};

    fn router() -> Arc<RpcRouter> {
        let mut router = RpcRouter::new(RouterConfig::default());
        router
            .unary::<HelloRequest, HelloResponse, _, _>("test.Echo/Echo", |request| async move {
                let request = request.await?;
                Ok::<_, Status>(HelloResponse {
                    message: request.name,
                })
            })
            .unwrap();
        Arc::new(router)
    }

    #[tokio::test]
    async fn test_unary_echo() {
        let channel = RpcChannel::in_process(router(), ChannelConfig::default());
        let reply: HelloResponse = timeout(
            Duration::from_secs(5),
            channel.unary("test.Echo/Echo", HelloRequest::new("ping")),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reply.message, "ping");
    }

    #[tokio::test]
    async fn test_start_call_with_two_requests_fails() {
        let channel = RpcChannel::in_process(router(), ChannelConfig::default());
        let requests = stream::iter(vec![
            Ok(HelloRequest::new("a")),
            Ok(HelloRequest::new("b")),
        ]);
        let responses = channel.start_call::<_, HelloResponse, _>(
            "test.Echo/Echo",
            CallShape::SingleSingle,
            requests,
        );

        let result: Result<Vec<HelloResponse>, CallError> =
            timeout(Duration::from_secs(5), responses.try_collect())
                .await
                .unwrap();
        assert_eq!(result.unwrap_err().code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let channel = RpcChannel::in_process(router(), ChannelConfig::default());
        let result = timeout(
            Duration::from_secs(5),
            channel.unary::<_, HelloResponse>("test.Echo/Missing", HelloRequest::new("x")),
        )
        .await
        .unwrap();
        assert_eq!(result.unwrap_err().code(), Code::Unimplemented);
    }
}
