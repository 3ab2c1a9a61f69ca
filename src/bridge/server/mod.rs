//! Server side: handler registration, call dispatch and the registry of active calls.
//!
//! A handler receives its requests as an [`RxSingle`](crate::bridge::RxSingle) or
//! [`RxStream`](crate::bridge::RxStream) according to the call shape and returns a future or a
//! stream of responses. The router opens the call, starts the handler and drains its responses
//! into the transport on a spawned task that lives until both directions of the call ended.

mod config;
mod handler;
mod registry;
mod router;

pub use config::RouterConfig;
pub use handler::Handler;
pub use registry::{CallEntry, CallGuard, CallRegistry};
pub use router::RpcRouter;
