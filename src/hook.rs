//! Interface between the host proxy and the agent.
//!
//! The host calls [`Interceptor::on_exchange`] once per intercepted exchange
//! and applies the returned [`Action`].

use crate::exchange::{Exchange, Headers, HttpResponse};
use crate::substitute::ReplacementResponse;
use async_trait::async_trait;
use bytes::Bytes;

/// What the host should do with an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Forward the original response unmodified
    Passthrough,
    /// Send this response instead of the original
    Replace(ReplacementResponse),
    /// Answer with a block page
    Block(BlockResponse),
}

impl Action {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, Action::Passthrough)
    }

    /// Write the decision into the exchange's response.
    pub fn apply(self, exchange: &mut Exchange) {
        match self {
            Action::Passthrough => {}
            Action::Replace(replacement) => exchange.response = Some(replacement.into()),
            Action::Block(block) => exchange.response = Some(block.into_response()),
        }
    }
}

/// A block page returned when a mapped file cannot be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockResponse {
    pub status: u16,
    pub reason: String,
}

impl BlockResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn into_response(self) -> HttpResponse {
        let body = Bytes::from(format!("Map Local: {}\n", self.reason));
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/plain; charset=utf-8");
        headers.set("Content-Length", body.len().to_string());
        headers.set("Cache-Control", "no-store");
        HttpResponse::new(self.status, headers, body)
    }
}

/// Callback surface the host proxy drives.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Decide the fate of one exchange. Must not panic into the host.
    async fn on_exchange(&self, exchange: &Exchange) -> Action;

    /// Configuration pushed by the host.
    async fn on_configure(&self, _config: serde_json::Value) -> Result<(), String> {
        Ok(())
    }

    /// The host is unloading the agent.
    async fn on_shutdown(&self) {}
}
