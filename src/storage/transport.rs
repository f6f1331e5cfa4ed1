//! In-memory transport for the integration bus.
//!
//! One broadcast channel per channel id; publishers and subscribers of
//! the same factory share the underlying channels, so two contexts wired
//! to the same factory can exchange events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;

use crate::interfaces::transport::Result;
use crate::interfaces::{ChannelId, Publisher, Subscriber, TransportFactory};

const CHANNEL_CAPACITY: usize = 1024;

/// Transport factory backed by tokio broadcast channels.
#[derive(Default)]
pub struct InMemoryTransport {
    channels: Mutex<HashMap<ChannelId, broadcast::Sender<Vec<u8>>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_of(&self, channel: &ChannelId) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.channels.lock().expect("transport lock");
        channels
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl TransportFactory for InMemoryTransport {
    fn create_publisher(&self, channel: &ChannelId) -> Arc<dyn Publisher> {
        Arc::new(InMemoryPublisher {
            channel: channel.clone(),
            sender: self.sender_of(channel),
        })
    }

    fn create_subscriber(&self, channel: &ChannelId) -> Arc<dyn Subscriber> {
        Arc::new(InMemorySubscriber {
            channel: channel.clone(),
            sender: self.sender_of(channel),
        })
    }
}

struct InMemoryPublisher {
    channel: ChannelId,
    sender: broadcast::Sender<Vec<u8>>,
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    fn channel(&self) -> &ChannelId {
        &self.channel
    }

    async fn publish(&self, frame: Vec<u8>) -> Result<()> {
        // No receivers is fine for publish-only scenarios.
        let _ = self.sender.send(frame);
        Ok(())
    }
}

struct InMemorySubscriber {
    channel: ChannelId,
    sender: broadcast::Sender<Vec<u8>>,
}

#[async_trait]
impl Subscriber for InMemorySubscriber {
    fn channel(&self) -> &ChannelId {
        &self.channel
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>> {
        let receiver = self.sender.subscribe();
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(frame) => return Some((frame, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
