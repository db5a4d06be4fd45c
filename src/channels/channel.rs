//! Channel trait and the message types that flow through it.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use uuid::Uuid;

use crate::error::ChannelError;

/// A message arriving from a transport, normalized to a text body plus
/// media references (data URIs or local paths).
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: Uuid,
    pub channel: String,
    pub sender_id: String,
    pub content: String,
    pub media: Vec<String>,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(channel: &str, sender_id: &str, content: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            media: Vec::new(),
            metadata: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_media(mut self, media: Vec<String>) -> Self {
        self.media = media;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Destination chat id, when the transport put one in the metadata.
    pub fn chat_id(&self) -> Option<&str> {
        self.metadata.get("chat_id").and_then(|v| v.as_str())
    }
}

/// A reply produced by the agent, ready for a channel to deliver.
#[derive(Debug, Clone, Default)]
pub struct OutgoingResponse {
    pub content: String,
    pub media: Vec<String>,
}

impl OutgoingResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            media: Vec::new(),
        }
    }

    pub fn with_media(mut self, media: Vec<String>) -> Self {
        self.media = media;
        self
    }
}

/// Stream of incoming messages produced by a running channel.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A bidirectional message transport.
///
/// `start` spawns whatever background work the transport needs and hands
/// back a stream of normalized messages. `respond` delivers a reply to the
/// chat the triggering message came from.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<MessageStream, ChannelError>;

    async fn respond(
        &self,
        msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError>;

    async fn health_check(&self) -> Result<(), ChannelError>;

    async fn shutdown(&self) -> Result<(), ChannelError>;
}
