//! Client side: issuing calls and consuming their responses as demand-driven sequences.

mod channel;
mod config;

pub use channel::RpcChannel;
pub use config::ChannelConfig;
