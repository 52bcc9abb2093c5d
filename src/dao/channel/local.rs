use std::sync::Arc;

use dashmap::DashMap;
use futures::{StreamExt, future::BoxFuture};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use super::{BroadcastTransport, FrameStream, TransportError};

/// In-process transport: one Tokio broadcast channel per topic.
#[derive(Clone)]
pub struct LocalBroadcast {
    topics: Arc<DashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl LocalBroadcast {
    /// Transport whose topics buffer up to `capacity` frames per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish a raw frame, returning how many subscribers received it.
    pub fn publish(&self, topic: &str, frame: impl Into<String>) -> usize {
        self.sender(topic).send(frame.into()).unwrap_or(0)
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl BroadcastTransport for LocalBroadcast {
    fn subscribe(&self, topic: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let receiver = self.sender(topic).subscribe();
        let topic = topic.to_string();
        Box::pin(async move {
            let stream = BroadcastStream::new(receiver).map(move |frame| {
                frame.map_err(|BroadcastStreamRecvError::Lagged(skipped)| TransportError::Lagged {
                    topic: topic.clone(),
                    skipped,
                })
            });
            Ok(stream.boxed())
        })
    }
}
