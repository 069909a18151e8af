use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Topic the gateway publishes on teardown.
pub const DESTROY_TOPIC: &str = "destroy";

const CHANNEL_CAPACITY: usize = 64;

/// In-process topic pub/sub over broadcast channels. Subscribers get an
/// async stream and cancel by dropping it.
pub struct PubSub {
    topics: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl PubSub {
    pub fn new() -> Self {
        PubSub {
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Value> {
        let mut topics = self.topics.lock().expect("pubsub lock poisoned");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publishes to every current subscriber of the topic. A topic with no
    /// subscribers drops the payload.
    pub fn publish(&self, topic: &str, payload: Value) {
        let _ = self.sender(topic).send(payload);
    }

    pub fn subscribe(&self, topic: &str) -> BoxStream<'static, Value> {
        let receiver = self.sender(topic).subscribe();
        futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => return Some((payload, receiver)),
                    // A lagged subscriber skips what it missed and keeps going.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

impl Default for PubSub {
    fn default() -> Self {
        PubSub::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_to_subscriber() {
        let pubsub = PubSub::new();
        let mut stream = pubsub.subscribe("events");
        pubsub.publish("events", json!({"n": 1}));
        assert_eq!(stream.next().await, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let pubsub = PubSub::new();
        pubsub.publish("nobody", json!(1));
    }
}
