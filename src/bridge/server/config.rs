use bon::Builder;

use crate::bridge::flow::inbound::InboundConfig;

/// Configuration for the RPC router.
#[derive(Debug, Clone, Builder)]
pub struct RouterConfig {
    /// Demand policy for the request streams handed to handlers.
    #[builder(default)]
    pub inbound: InboundConfig,

    /// Maximum number of concurrently active calls.
    /// Unlimited if not specified.
    pub max_calls: Option<usize>,

    /// Responses buffered ahead of a tonic response consumer, for handlers served through
    /// [`Handler::serve_stream`](crate::bridge::Handler::serve_stream).
    #[builder(default = 16)]
    pub response_window: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
