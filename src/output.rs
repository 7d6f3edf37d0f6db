use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::message::{Element, Message, OutboundContent};

/// Where finalized output goes: the platform plus, when known, the
/// conversation the triggering message came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub platform: String,
    pub conversation_id: Option<String>,
}

impl Destination {
    pub fn new(platform: impl Into<String>, conversation_id: Option<String>) -> Self {
        Self {
            platform: platform.into(),
            conversation_id,
        }
    }

    pub fn for_message(message: &Message) -> Self {
        Self {
            platform: message.platform(),
            conversation_id: message.conversation_id(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("destination `{0}` is not reachable")]
    Unreachable(String),
    #[error("transport failed: {0}")]
    Failed(String),
}

/// One way of getting finalized output to the user. Transports are called
/// with already-normalized chunks, one call per dispatch.
#[async_trait]
pub trait OutputTransport: Send + Sync {
    async fn send(
        &self,
        destination: &Destination,
        chunks: &[Vec<Element>],
    ) -> Result<(), TransportError>;
}

/// Ordered chain of output transports. Every registered transport
/// receives the same normalized chunks, awaited one after another —
/// side-effect order across transports matters (log sinks before network
/// sends).
#[derive(Clone, Default)]
pub struct OutputSender {
    transports: Arc<Mutex<Vec<Arc<dyn OutputTransport>>>>,
}

impl OutputSender {
    pub fn new() -> Self {
        Self {
            transports: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add_sender(&self, transport: Arc<dyn OutputTransport>) {
        self.transports.lock().unwrap().push(transport);
    }

    pub fn sender_count(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    /// Normalize `content` and hand the chunks to every transport in
    /// registration order. A failing transport is logged and skipped; it
    /// never blocks the rest of the chain.
    pub async fn deliver(&self, destination: &Destination, content: &OutboundContent) {
        let chunks = content.to_chunks();
        if chunks.is_empty() {
            return;
        }
        // snapshot under the lock, then call without holding it
        let transports: Vec<Arc<dyn OutputTransport>> = {
            let guard = self.transports.lock().unwrap();
            guard.clone()
        };
        for transport in transports {
            if let Err(e) = transport.send(destination, &chunks).await {
                warn!(platform = %destination.platform, error = %e, "output transport failed");
            }
        }
    }
}

impl std::fmt::Debug for OutputSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSender")
            .field("transports", &self.sender_count())
            .finish()
    }
}
