//! Transport interfaces for the integration bus.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur on integration transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("publish to `{channel}` failed: {message}")]
    Publish { channel: ChannelId, message: String },

    #[error("subscribe to `{channel}` failed: {message}")]
    Subscribe { channel: ChannelId, message: String },
}

/// Identity of one transport channel; the integration bus uses one
/// channel per message class.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(value: impl Into<String>) -> Self {
        ChannelId(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

/// Publishes raw frames to one channel.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn channel(&self) -> &ChannelId;

    async fn publish(&self, frame: Vec<u8>) -> Result<()>;
}

/// Subscribes to raw frames of one channel.
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn channel(&self) -> &ChannelId;

    /// Open the frame stream. Frames published after this call are
    /// delivered; earlier ones are not replayed.
    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>>;
}

/// Creates publisher/subscriber channels for the integration bus.
pub trait TransportFactory: Send + Sync {
    fn create_publisher(&self, channel: &ChannelId) -> Arc<dyn Publisher>;

    fn create_subscriber(&self, channel: &ChannelId) -> Arc<dyn Subscriber>;
}
