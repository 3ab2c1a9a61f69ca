use bon::Builder;

use crate::bridge::flow::inbound::InboundConfig;
use crate::bridge::transport::memory::MemoryConfig;

/// Configuration for an RPC channel.
#[derive(Debug, Clone, Builder)]
pub struct ChannelConfig {
    /// Demand policy for response streams.
    #[builder(default)]
    pub inbound: InboundConfig,

    /// In-process transport settings.
    #[builder(default)]
    pub memory: MemoryConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
