use std::sync::Arc;

use anyhow::Result;
use futures::{StreamExt, TryStreamExt, stream};
use rxgrpc::bridge::{ChannelConfig, RouterConfig, RpcChannel, RpcRouter};
use rxgrpc::greeter::{self, GreeterClient, GreeterService, HelloRequest};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let name = std::env::args().nth(1).unwrap_or_else(|| "rxjava".to_string());

    let mut router = RpcRouter::new(RouterConfig::default());
    greeter::register(&mut router, Arc::new(GreeterService))?;
    let router = Arc::new(router);

    let channel = RpcChannel::in_process(Arc::clone(&router), ChannelConfig::default());
    let client = GreeterClient::new(channel);

    let reply = client.say_hello(&name).await?;
    info!(message = %reply.message, "SayHello");

    let mut replies = client.say_hello_resp_stream(&name);
    while let Some(reply) = replies.try_next().await? {
        info!(message = %reply.message, "SayHelloRespStream");
    }

    let names = stream::iter(["a", "b", "c"]).map(|n| Ok(HelloRequest::new(n)));
    let reply = client.say_hello_req_stream(names).await?;
    info!(message = %reply.message, "SayHelloReqStream");

    let names = stream::iter(["a", "b", "c", "d", "e"]).map(|n| Ok(HelloRequest::new(n)));
    let replies: Vec<_> = client.say_hello_both_stream(names).try_collect().await?;
    for reply in replies {
        info!(message = %reply.message, "SayHelloBothStream");
    }

    info!(active_calls = router.active_calls(), "Done");
    Ok(())
}
