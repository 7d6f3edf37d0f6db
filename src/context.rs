use std::collections::HashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigManager;
use crate::message::{Message, OutboundContent};

/// Per-dispatch mutable state threaded through every handler in order.
/// One context belongs to exactly one dispatch call and is never shared
/// across concurrent dispatches.
pub struct RequestContext {
    message: Message,
    output: OutboundContent,
    command: Option<String>,
    options: HashMap<String, Value>,
    config: ConfigManager,
    cancel: CancellationToken,
}

impl RequestContext {
    /// The output starts as the inbound text; the dispatcher only flushes
    /// it when a handler has replaced it with something different.
    pub fn new(message: Message, config: ConfigManager) -> Self {
        let output = OutboundContent::text(message.content().to_string());
        Self {
            message,
            output,
            command: None,
            options: HashMap::new(),
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn output(&self) -> &OutboundContent {
        &self.output
    }

    pub fn set_output(&mut self, output: impl Into<OutboundContent>) {
        self.output = output.into();
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn set_command(&mut self, command: Option<String>) {
        self.command = command;
    }

    pub fn get_option(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    pub fn set_option(&mut self, key: &str, value: Value) {
        self.options.insert(key.to_string(), value);
    }

    pub fn delete_option(&mut self, key: &str) {
        self.options.remove(key);
    }

    pub fn config(&self) -> &ConfigManager {
        &self.config
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
