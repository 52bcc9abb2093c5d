//! Broadcast channel transports delivering raw event frames per topic.

mod local;
mod sse;

use futures::{future::BoxFuture, stream::BoxStream};
use thiserror::Error;

pub use local::LocalBroadcast;
pub use sse::{SseFrameDecoder, SseTransport};

/// Stream of raw JSON frames received on one topic.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Failures raised while subscribing to or reading from a broadcast topic.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The subscription request failed.
    #[error("failed to open channel `{topic}`")]
    Connect {
        /// Topic being opened.
        topic: String,
        /// HTTP client failure.
        #[source]
        source: reqwest::Error,
    },
    /// The channel endpoint refused the subscription.
    #[error("channel `{topic}` answered with status {status}")]
    Status {
        /// Topic being opened.
        topic: String,
        /// HTTP status code.
        status: u16,
    },
    /// An open subscription broke.
    #[error("channel `{topic}` stream failed")]
    Stream {
        /// Topic of the broken stream.
        topic: String,
        /// HTTP client failure.
        #[source]
        source: reqwest::Error,
    },
    /// The subscriber fell behind and frames were discarded.
    #[error("subscriber on `{topic}` lagged behind by {skipped} messages")]
    Lagged {
        /// Topic of the lagging subscriber.
        topic: String,
        /// Frames lost.
        skipped: u64,
    },
}

/// Publish/subscribe transport for session topics.
pub trait BroadcastTransport: Send + Sync {
    /// Open one upstream subscription to `topic`.
    ///
    /// Dropping the returned stream closes the upstream.
    fn subscribe(&self, topic: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>>;
}
