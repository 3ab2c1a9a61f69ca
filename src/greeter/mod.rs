//! Demo `greeter.Greeter` service covering all four call shapes.

use std::sync::Arc;

use async_stream::try_stream;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, TryChunksError};
use futures::{FutureExt, Stream, StreamExt, TryStreamExt};
use tonic::Status;
use tracing::debug;

use crate::bridge::{CallError, RouterError, RpcChannel, RpcRouter, RxSingle, RxStream};

pub const SAY_HELLO: &str = "greeter.Greeter/SayHello";
pub const SAY_HELLO_RESP_STREAM: &str = "greeter.Greeter/SayHelloRespStream";
pub const SAY_HELLO_REQ_STREAM: &str = "greeter.Greeter/SayHelloReqStream";
pub const SAY_HELLO_BOTH_STREAM: &str = "greeter.Greeter/SayHelloBothStream";

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

impl HelloRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloResponse {
    #[prost(string, tag = "1")]
    pub message: String,
}

pub fn greet(greeting: &str, name: &str) -> HelloResponse {
    HelloResponse {
        message: format!("{greeting} {name}"),
    }
}

/// Business logic of the greeter, one method per call shape.
pub trait Greeter: Send + Sync + 'static {
    fn say_hello(
        &self,
        request: RxSingle<HelloRequest>,
    ) -> BoxFuture<'static, Result<HelloResponse, Status>>;

    fn say_hello_resp_stream(
        &self,
        request: RxSingle<HelloRequest>,
    ) -> BoxStream<'static, Result<HelloResponse, Status>>;

    fn say_hello_req_stream(
        &self,
        requests: RxStream<HelloRequest>,
    ) -> BoxFuture<'static, Result<HelloResponse, Status>>;

    fn say_hello_both_stream(
        &self,
        requests: RxStream<HelloRequest>,
    ) -> BoxStream<'static, Result<HelloResponse, Status>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GreeterService;

impl Greeter for GreeterService {
    fn say_hello(
        &self,
        request: RxSingle<HelloRequest>,
    ) -> BoxFuture<'static, Result<HelloResponse, Status>> {
        async move {
            let request = request.await?;
            Ok::<_, Status>(greet("Hello", &request.name))
        }
        .boxed()
    }

    fn say_hello_resp_stream(
        &self,
        request: RxSingle<HelloRequest>,
    ) -> BoxStream<'static, Result<HelloResponse, Status>> {
        try_stream! {
            let request = request.await.map_err(Status::from)?;
            for greeting in ["Hello", "Hi", "Greetings"] {
                yield greet(greeting, &request.name);
            }
        }
        .boxed()
    }

    fn say_hello_req_stream(
        &self,
        requests: RxStream<HelloRequest>,
    ) -> BoxFuture<'static, Result<HelloResponse, Status>> {
        async move {
            let names: Vec<String> = requests.map_ok(|r| r.name).try_collect().await?;
            Ok::<_, Status>(greet("Hello", &names.join(" and ")))
        }
        .boxed()
    }

    fn say_hello_both_stream(
        &self,
        requests: RxStream<HelloRequest>,
    ) -> BoxStream<'static, Result<HelloResponse, Status>> {
        requests
            .try_chunks(2)
            .map(|batch| match batch {
                Ok(batch) => {
                    let names: Vec<&str> = batch.iter().map(|r| r.name.as_str()).collect();
                    Ok(greet("Hello", &names.join(" and ")))
                }
                Err(TryChunksError(_, error)) => Err(Status::from(error)),
            })
            .boxed()
    }
}

/// Register every greeter method on `router`.
pub fn register<G: Greeter>(router: &mut RpcRouter, greeter: Arc<G>) -> Result<(), RouterError> {
    let service = Arc::clone(&greeter);
    router.unary(SAY_HELLO, move |request| service.say_hello(request))?;

    let service = Arc::clone(&greeter);
    router.server_streaming(SAY_HELLO_RESP_STREAM, move |request| {
        service.say_hello_resp_stream(request)
    })?;

    let service = Arc::clone(&greeter);
    router.client_streaming(SAY_HELLO_REQ_STREAM, move |requests| {
        service.say_hello_req_stream(requests)
    })?;

    let service = greeter;
    router.bidi_streaming(SAY_HELLO_BOTH_STREAM, move |requests| {
        service.say_hello_both_stream(requests)
    })?;

    debug!("Greeter service registered");
    Ok(())
}

/// Typed client for the greeter methods.
#[derive(Clone)]
pub struct GreeterClient {
    channel: RpcChannel,
}

impl GreeterClient {
    pub fn new(channel: RpcChannel) -> Self {
        Self { channel }
    }

    pub async fn say_hello(&self, name: &str) -> Result<HelloResponse, CallError> {
        self.channel.unary(SAY_HELLO, HelloRequest::new(name)).await
    }

    pub fn say_hello_resp_stream(&self, name: &str) -> RxStream<HelloResponse> {
        self.channel
            .server_streaming(SAY_HELLO_RESP_STREAM, HelloRequest::new(name))
    }

    pub async fn say_hello_req_stream<S>(&self, requests: S) -> Result<HelloResponse, CallError>
    where
        S: Stream<Item = Result<HelloRequest, Status>> + Send + 'static,
    {
        self.channel
            .client_streaming(SAY_HELLO_REQ_STREAM, requests)
            .await
    }

    pub fn say_hello_both_stream<S>(&self, requests: S) -> RxStream<HelloResponse>
    where
        S: Stream<Item = Result<HelloRequest, Status>> + Send + 'static,
    {
        self.channel.bidi_streaming(SAY_HELLO_BOTH_STREAM, requests)
    }
}
