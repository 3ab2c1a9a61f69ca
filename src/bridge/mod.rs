//! # bridge
//!
//! Adapts a push-driven, credit-gated RPC transport to demand-driven streams and back.
//!
//! Inbound messages are handed to business logic as an [`RxStream`] (many) or an [`RxSingle`]
//! (exactly one). Outbound messages are produced by business logic as any
//! `Stream<Item = Result<T, Status>>` or `Future<Output = Result<T, Status>>` and drained into
//! the transport one readiness signal at a time.
//!
//! ## Server Side
//!
//! ```ignore
//! use rxgrpc::bridge::{RpcRouter, RouterConfig};
//!
//! let mut router = RpcRouter::new(RouterConfig::builder().build());
//!
//! router.unary::<HelloRequest, HelloResponse, _, _>(
//!     "greeter.Greeter/SayHello",
//!     |request| async move {
//!         let request = request.await?;
//!         Ok(HelloResponse { message: format!("Hello {}", request.name) })
//!     },
//! )?;
//! ```
//!
//! ## Client Side
//!
//! ```ignore
//! use rxgrpc::bridge::{ChannelConfig, RpcChannel};
//! use futures::TryStreamExt;
//!
//! let channel = RpcChannel::in_process(Arc::new(router), ChannelConfig::builder().build());
//!
//! let replies: Vec<HelloResponse> = channel
//!     .bidi_streaming::<HelloRequest, HelloResponse, _>(greeter::SAY_HELLO_BOTH_STREAM, requests)
//!     .try_collect()
//!     .await?;
//! ```
//!
//! ## Flow Control
//!
//! Nothing is delivered before the consumer polls for the first time. Every poll that finds no
//! buffered message turns into a credit grant on the transport, and the transport may only push
//! as many messages as it has been granted. Outbound, one item is pulled from the producer only
//! after the transport reports readiness for another send.

mod call;
mod codec;
mod demand;
mod error;
mod flow;
mod propagate;
mod shape;

pub mod client;
pub mod server;
pub mod transport;

pub use call::lifecycle::{CallState, Direction, TerminalKind, TerminalSignal};
pub use call::{Call, CallId, CallMeta, Side};
pub use codec::{Decoding, Encoding};
pub use demand::Demand;
pub use error::{CallError, RouterError, Violation};
pub use flow::credit::{CreditController, FlowSignal};
pub use flow::inbound::{InboundConfig, InboundSink, RxStream};
pub use flow::outbound::Drain;
pub use flow::single::RxSingle;
pub use shape::{Cardinality, CallShape};

pub use client::{ChannelConfig, RpcChannel};
pub use server::{CallRegistry, Handler, RouterConfig, RpcRouter};
