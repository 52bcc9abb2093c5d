use std::sync::Arc;

use async_stream::stream;
use futures::{StreamExt, future::BoxFuture};
use reqwest::{Client, header};
use serde_json::{Value, json};
use tracing::debug;

use super::{BroadcastTransport, FrameStream, TransportError};

/// Transport reading a topic as server-sent events from `{base}/channels/{topic}`.
#[derive(Clone)]
pub struct SseTransport {
    client: Client,
    base_url: Arc<str>,
    api_key: Option<Arc<str>>,
}

impl SseTransport {
    /// Transport for the channel service at `base_url`, optionally authenticated.
    pub fn new(base_url: impl AsRef<str>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: Arc::<str>::from(base_url.as_ref().trim_end_matches('/')),
            api_key: api_key.map(Arc::<str>::from),
        }
    }
}

impl BroadcastTransport for SseTransport {
    fn subscribe(&self, topic: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let url = format!("{}/channels/{}", self.base_url, topic);
        let mut request = self
            .client
            .get(url)
            .header(header::ACCEPT, "text/event-stream");
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key.as_ref());
        }
        let topic = topic.to_string();

        Box::pin(async move {
            let response = request
                .send()
                .await
                .map_err(|source| TransportError::Connect {
                    topic: topic.clone(),
                    source,
                })?;
            if !response.status().is_success() {
                return Err(TransportError::Status {
                    topic,
                    status: response.status().as_u16(),
                });
            }

            let mut body = response.bytes_stream();
            let frames = stream! {
                let mut decoder = SseFrameDecoder::default();
                while let Some(chunk) = body.next().await {
                    match chunk {
                        Ok(bytes) => {
                            for frame in decoder.push(&bytes) {
                                yield Ok(frame);
                            }
                        }
                        Err(source) => {
                            yield Err(TransportError::Stream { topic: topic.clone(), source });
                            break;
                        }
                    }
                }
                debug!(topic = %topic, "channel stream ended");
            };

            Ok(frames.boxed())
        })
    }
}

/// Incremental decoder turning SSE bytes into JSON envelope frames.
///
/// A frame whose `event:` name is set and whose `data:` is not already a
/// `{type, data}` envelope is wrapped as `{"type": event, "data": data}`.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseFrameDecoder {
    /// Feed raw bytes, returning every frame completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw = self.buffer.drain(..=newline).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (name, value) = match line.split_once(':') {
                Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match name {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        frames
    }

    fn dispatch(&mut self) -> Option<String> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");

        let Some(event) = event.filter(|name| !name.is_empty() && name != "message") else {
            return Some(data);
        };
        let parsed = serde_json::from_str::<Value>(&data).unwrap_or(Value::String(data.clone()));
        if parsed.get("type").is_some() {
            return Some(data);
        }
        Some(json!({ "type": event, "data": parsed }).to_string())
    }
}
