use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tonic::Status;
use tracing::{info, warn};

use crate::bridge::call::{CallId, CallMeta, Side};
use crate::bridge::error::RouterError;
use crate::bridge::flow::inbound::RxStream;
use crate::bridge::flow::single::RxSingle;
use crate::bridge::server::config::RouterConfig;
use crate::bridge::server::handler::{ErasedHandler, Handler};
use crate::bridge::server::registry::CallRegistry;
use crate::bridge::transport::TransportCall;

/// Dispatches incoming calls to the handler registered for their method path.
pub struct RpcRouter {
    handlers: HashMap<String, Arc<dyn ErasedHandler>>,
    calls: Arc<CallRegistry>,
    config: RouterConfig,
}

impl RpcRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            calls: Arc::new(CallRegistry::with_limit(config.max_calls)),
            config,
        }
    }

    /// Register a handler for a method path.
    ///
    /// # Example
    /// ```ignore
    /// router.register(
    ///     "greeter.Greeter/SayHelloBothStream",
    ///     Handler::<HelloRequest, HelloResponse>::bidi_streaming(|requests| {
    ///         requests.map_ok(|r| greet("Hello", &r.name)).map_err(Status::from)
    ///     }),
    /// )?;
    /// ```
    pub fn register<Req, Resp>(
        &mut self,
        method: impl Into<String>,
        handler: Handler<Req, Resp>,
    ) -> Result<(), RouterError>
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
    {
        let method = method.into();
        if self.handlers.contains_key(&method) {
            return Err(RouterError::DuplicateHandler(method));
        }

        info!(method = %method, shape = %handler.shape(), "Registered RPC handler");
        self.handlers.insert(method, Arc::new(handler));
        Ok(())
    }

    pub fn unary<Req, Resp, F, Fut>(
        &mut self,
        method: impl Into<String>,
        handler: F,
    ) -> Result<(), RouterError>
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(RxSingle<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.register(method, Handler::unary(handler))
    }

    pub fn server_streaming<Req, Resp, F, S>(
        &mut self,
        method: impl Into<String>,
        handler: F,
    ) -> Result<(), RouterError>
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(RxSingle<Req>) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        self.register(method, Handler::server_streaming(handler))
    }

    pub fn client_streaming<Req, Resp, F, Fut>(
        &mut self,
        method: impl Into<String>,
        handler: F,
    ) -> Result<(), RouterError>
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(RxStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.register(method, Handler::client_streaming(handler))
    }

    pub fn bidi_streaming<Req, Resp, F, S>(
        &mut self,
        method: impl Into<String>,
        handler: F,
    ) -> Result<(), RouterError>
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(RxStream<Req>) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        self.register(method, Handler::bidi_streaming(handler))
    }

    /// Start serving one call over `transport`.
    ///
    /// A call that cannot be dispatched is closed with the matching status before the error is
    /// returned, so the caller observes it too.
    pub fn dispatch(
        &self,
        method: &str,
        transport: TransportCall<Bytes, Bytes>,
    ) -> Result<CallId, RouterError> {
        let Some(handler) = self.handlers.get(method) else {
            warn!(method = %method, "No handler registered for method");
            return Err(reject(transport, RouterError::NoHandler(method.to_string())));
        };

        let meta = CallMeta::new(method, handler.shape(), Side::Server);
        let guard = match self.calls.try_register(&meta) {
            Ok(guard) => guard,
            Err(error) => {
                warn!(method = %method, %error, "Rejecting call");
                return Err(reject(transport, error));
            }
        };

        info!(
            call_id = %meta.id,
            method = %method,
            shape = %meta.shape,
            "Dispatching call"
        );

        let id = meta.id.clone();
        handler.spawn(meta, transport, self.config.inbound, guard);
        Ok(id)
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn calls(&self) -> &Arc<CallRegistry> {
        &self.calls
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Cancel every active call. Handlers stay registered.
    pub fn shutdown(&self) -> usize {
        self.calls.cancel_all("server shutting down")
    }
}

fn reject(transport: TransportCall<Bytes, Bytes>, error: RouterError) -> RouterError {
    let TransportCall { mut outbound, .. } = transport;
    outbound.close(error.to_status());
    error
}
