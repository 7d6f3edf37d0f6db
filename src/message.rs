use std::collections::HashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single inbound chat or command event, as handed to the dispatcher by
/// the hosting platform adapter. Immutable for the lifetime of a dispatch.
#[derive(Debug, Clone, PartialEq, JsonSchema, Serialize, Deserialize)]
pub struct Message {
    id: String,
    platform: String,
    conversation_id: Option<String>,
    sender_id: Option<String>,
    content: String,
    metadata: HashMap<String, String>,
}

impl Message {
    pub fn new(
        id: &str,
        platform: impl Into<String>,
        content: impl Into<String>,
        conversation_id: Option<String>,
    ) -> Self {
        Self {
            id: id.to_string(),
            platform: platform.into(),
            conversation_id,
            sender_id: None,
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    /// Build a message with a generated id, for hosts that have none.
    pub fn generated(
        platform: impl Into<String>,
        content: impl Into<String>,
        conversation_id: Option<String>,
    ) -> Self {
        Self::new(
            &uuid::Uuid::new_v4().to_string(),
            platform,
            content,
            conversation_id,
        )
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn id(&self) -> String {
        self.id.clone()
    }

    pub fn platform(&self) -> String {
        self.platform.clone()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.conversation_id.clone()
    }

    pub fn sender_id(&self) -> Option<String> {
        self.sender_id.clone()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn get(&self, name: &str) -> Option<&String> {
        self.metadata.get(name)
    }

    pub fn add(&mut self, name: String, value: String) {
        self.metadata.insert(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        self.metadata.remove(name);
    }
}

/// One piece of a rendered outbound message.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub enum Element {
    Text(String),
    Media(MediaRef),
    Mention(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub url: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub enum MediaKind {
    Image,
    Audio,
    Video,
}

/// What a dispatch produces: plain text, one rendered message, or several
/// discrete messages sent one after another. A closed set, so handlers and
/// transports match on shape instead of inspecting it at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub enum OutboundContent {
    Text(String),
    Elements(Vec<Element>),
    Batches(Vec<Vec<Element>>),
}

impl OutboundContent {
    pub fn text(content: impl Into<String>) -> Self {
        OutboundContent::Text(content.into())
    }

    /// Normalize into discrete message chunks: text and a single element
    /// list become one chunk, batches become one chunk each. Empty inner
    /// lists are skipped.
    pub fn to_chunks(&self) -> Vec<Vec<Element>> {
        match self {
            OutboundContent::Text(text) => vec![vec![Element::Text(text.clone())]],
            OutboundContent::Elements(elements) => vec![elements.clone()],
            OutboundContent::Batches(batches) => {
                batches.iter().filter(|b| !b.is_empty()).cloned().collect()
            }
        }
    }
}

impl From<String> for OutboundContent {
    fn from(value: String) -> Self {
        OutboundContent::Text(value)
    }
}

impl From<&str> for OutboundContent {
    fn from(value: &str) -> Self {
        OutboundContent::Text(value.to_string())
    }
}

impl From<Vec<Element>> for OutboundContent {
    fn from(value: Vec<Element>) -> Self {
        OutboundContent::Elements(value)
    }
}

impl From<Vec<Vec<Element>>> for OutboundContent {
    fn from(value: Vec<Vec<Element>>) -> Self {
        OutboundContent::Batches(value)
    }
}
