//! Upstream channel subscriptions shared per topic, and duplicate frame suppression.

use std::{
    collections::VecDeque,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::StreamExt;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    dao::channel::{BroadcastTransport, TransportError},
    dto::events::ChannelEvent,
    services::backoff::Backoff,
    state::Generation,
};

/// Raw frame tagged with the generation of the session entry it is delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Entry the frame is addressed to.
    pub generation: Generation,
    /// Raw JSON frame.
    pub frame: String,
}

#[derive(Clone)]
struct Sink {
    generation: Generation,
    tx: mpsc::Sender<Delivery>,
}

struct Upstream {
    sink: watch::Sender<Option<Sink>>,
    task: JoinHandle<()>,
}

/// At most one upstream subscription per topic.
///
/// Re-subscribing a topic whose upstream is still running retargets it to the
/// new session entry instead of opening a second upstream.
pub struct ChannelRegistry {
    transport: Arc<dyn BroadcastTransport>,
    upstreams: DashMap<String, Upstream>,
}

impl ChannelRegistry {
    /// Registry opening upstreams through `transport`.
    pub fn new(transport: Arc<dyn BroadcastTransport>) -> Self {
        Self {
            transport,
            upstreams: DashMap::new(),
        }
    }

    /// Route frames of `topic` to `tx`, tagged with `generation`.
    ///
    /// Returns `true` when an existing upstream was reused.
    pub fn subscribe(&self, topic: &str, generation: Generation, tx: mpsc::Sender<Delivery>) -> bool {
        let sink = Sink { generation, tx };
        match self.upstreams.entry(topic.to_string()) {
            Entry::Occupied(entry) if !entry.get().task.is_finished() => {
                entry.get().sink.send_replace(Some(sink));
                debug!(topic, %generation, "reusing open channel subscription");
                true
            }
            entry => {
                let (sink_tx, sink_rx) = watch::channel(Some(sink));
                let task = tokio::spawn(forward(
                    Arc::clone(&self.transport),
                    topic.to_string(),
                    sink_rx,
                ));
                entry.insert(Upstream {
                    sink: sink_tx,
                    task,
                });
                info!(topic, %generation, "opening channel subscription");
                false
            }
        }
    }

    /// Release `topic` if it is still held by `generation`. Teardown is never retried.
    pub fn unsubscribe(&self, topic: &str, generation: Generation) -> bool {
        let removed = self.upstreams.remove_if(topic, |_, upstream| {
            upstream
                .sink
                .borrow()
                .as_ref()
                .is_some_and(|sink| sink.generation == generation)
        });
        match removed {
            Some((_, upstream)) => {
                upstream.sink.send_replace(None);
                upstream.task.abort();
                info!(topic, %generation, "released channel subscription");
                true
            }
            None => {
                debug!(topic, %generation, "channel held by another entry; leaving it open");
                false
            }
        }
    }

    /// Whether an upstream for `topic` is running.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.upstreams
            .get(topic)
            .is_some_and(|upstream| !upstream.task.is_finished())
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        for upstream in self.upstreams.iter() {
            upstream.task.abort();
        }
    }
}

/// Forward frames from the transport to the current sink, reconnecting with backoff.
async fn forward(
    transport: Arc<dyn BroadcastTransport>,
    topic: String,
    mut sink: watch::Receiver<Option<Sink>>,
) {
    let mut backoff = Backoff::new();

    loop {
        match transport.subscribe(&topic).await {
            Ok(mut frames) => {
                backoff.reset();
                debug!(topic = %topic, "channel upstream connected");
                loop {
                    tokio::select! {
                        changed = sink.changed() => {
                            if changed.is_err() || sink.borrow().is_none() {
                                return;
                            }
                        }
                        frame = frames.next() => match frame {
                            Some(Ok(frame)) => {
                                let current = sink.borrow().clone();
                                let Some(Sink { generation, tx }) = current else {
                                    return;
                                };
                                if tx.send(Delivery { generation, frame }).await.is_err() {
                                    debug!(topic = %topic, %generation, "session stopped reading; dropping frame");
                                }
                            }
                            Some(Err(err @ TransportError::Lagged { .. })) => {
                                warn!(topic = %topic, error = %err, "channel frames lost");
                            }
                            Some(Err(err)) => {
                                warn!(topic = %topic, error = %err, "channel stream failed; reconnecting");
                                break;
                            }
                            None => {
                                warn!(topic = %topic, "channel stream closed; reconnecting");
                                break;
                            }
                        },
                    }
                }
            }
            Err(err) => {
                warn!(topic = %topic, error = %err, "channel subscribe failed");
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = sleep(delay) => {}
            changed = sink.changed() => {
                if changed.is_err() || sink.borrow().is_none() {
                    return;
                }
            }
        }
    }
}

/// Drops frames identical to one seen within the last `window` frames.
///
/// Timer syncs and items flagged `repeat` are exempt: the authority may send
/// the same frame again on purpose.
#[derive(Debug, Clone)]
pub struct FrameFilter {
    window: usize,
    recent: VecDeque<u64>,
}

impl FrameFilter {
    /// Filter remembering the last `window` frames (at least one).
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            recent: VecDeque::new(),
        }
    }

    /// Whether `frame` should reach the session loop.
    pub fn admit(&mut self, frame: &str, event: &ChannelEvent) -> bool {
        match event {
            ChannelEvent::TimerSync(_) => return true,
            ChannelEvent::NewItem(item) if item.repeat => return true,
            _ => {}
        }

        let mut hasher = DefaultHasher::new();
        frame.hash(&mut hasher);
        let fingerprint = hasher.finish();
        if self.recent.contains(&fingerprint) {
            return false;
        }
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(fingerprint);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::dao::channel::LocalBroadcast;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    #[tokio::test]
    async fn resubscribe_reuses_upstream_and_retargets_generation() {
        let hub = LocalBroadcast::new(16);
        let registry = ChannelRegistry::new(Arc::new(hub.clone()));
        let (old_tx, mut old_rx) = mpsc::channel(8);
        let (new_tx, mut new_rx) = mpsc::channel(8);

        assert!(!registry.subscribe("battle-1", Generation(1), old_tx));
        wait_until(|| hub.subscriber_count("battle-1") == 1).await;
        assert!(registry.subscribe("battle-1", Generation(2), new_tx));
        sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.subscriber_count("battle-1"), 1);

        hub.publish("battle-1", "{\"type\":\"timer\",\"data\":3}");
        let delivery = timeout(Duration::from_secs(1), new_rx.recv())
            .await
            .expect("delivered")
            .expect("open");
        assert_eq!(delivery.generation, Generation(2));
        assert!(old_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_requires_current_generation_and_closes_upstream() {
        let hub = LocalBroadcast::new(16);
        let registry = ChannelRegistry::new(Arc::new(hub.clone()));
        let (tx, mut rx) = mpsc::channel(8);

        registry.subscribe("battle-2", Generation(5), tx);
        wait_until(|| hub.subscriber_count("battle-2") == 1).await;

        assert!(!registry.unsubscribe("battle-2", Generation(4)));
        assert!(registry.is_subscribed("battle-2"));
        assert!(registry.unsubscribe("battle-2", Generation(5)));
        assert!(!registry.is_subscribed("battle-2"));
        wait_until(|| hub.subscriber_count("battle-2") == 0).await;

        hub.publish("battle-2", "{\"type\":\"session_end\"}");
        sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn duplicate_frames_are_dropped_within_window() {
        let mut filter = FrameFilter::new(2);
        let reveal = "{\"type\":\"reveal\",\"data\":{\"mcq_id\":\"Q1\"}}";
        let event = ChannelEvent::from_json_str(reveal);

        assert!(filter.admit(reveal, &event));
        assert!(!filter.admit(reveal, &event));
        assert!(filter.admit("{\"type\":\"a\"}", &ChannelEvent::Unrecognized("a".into())));
        assert!(filter.admit("{\"type\":\"b\"}", &ChannelEvent::Unrecognized("b".into())));
        assert!(filter.admit(reveal, &event));

        let timer = ChannelEvent::TimerSync(Some(5));
        assert!(filter.admit("{\"type\":\"timer\",\"data\":5}", &timer));
        assert!(filter.admit("{\"type\":\"timer\",\"data\":5}", &timer));
    }

    #[test]
    fn repeated_item_frames_pass_the_window() {
        let mut filter = FrameFilter::new(8);
        let repeat = r#"{"type":"new_question","data":{"mcq_id":"Q1","react_order":1,"repeat":true}}"#;
        let event = ChannelEvent::from_json_str(repeat);
        assert!(matches!(&event, ChannelEvent::NewItem(item) if item.repeat));

        assert!(filter.admit(repeat, &event));
        assert!(filter.admit(repeat, &event));

        let plain = r#"{"type":"new_question","data":{"mcq_id":"Q2","react_order":2}}"#;
        let event = ChannelEvent::from_json_str(plain);
        assert!(filter.admit(plain, &event));
        assert!(!filter.admit(plain, &event));
    }
}
