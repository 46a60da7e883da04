//! Topic publish/subscribe on top of GossipSub.
//!
//! Topics are plain names. Joining happens on the node's driver task, so
//! [`subscribe`] returns immediately and a failed join surfaces on the
//! first [`Subscription::next`].
//!
//! GossipSub never hands a node its own messages back. Publishing through
//! this module delivers to local subscribers of the same node directly, so
//! a subscriber sees every message on its topic regardless of origin.

use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use trellis_core::{Context, ContextError};

use crate::node::{Command, Node};

/// Longest accepted topic name, in bytes.
pub const MAX_TOPIC_LEN: usize = 256;

/// GossipSub settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Mesh maintenance interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Largest message accepted or published, in bytes.
    pub max_transmit_size: usize,

    /// How many distinct topics a node may join at once.
    pub max_topics: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            max_transmit_size: 1024 * 1024,
            max_topics: 256,
        }
    }
}

/// A message received on a topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub data: Vec<u8>,
    /// The author, not the peer that forwarded it.
    pub sender: PeerId,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("Invalid topic {topic:?}: {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("Could not join topic {topic}: {reason}")]
    JoinFailed { topic: String, reason: String },

    #[error("Node is shut down")]
    NodeClosed,

    #[error("Cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Subscription closed")]
    Closed,
}

impl From<ContextError> for SubscriptionError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => SubscriptionError::Cancelled,
            ContextError::DeadlineExceeded => SubscriptionError::DeadlineExceeded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("No peers or local subscribers for topic {topic}")]
    NoPeers { topic: String },

    #[error("Message of {size} bytes exceeds the transmit limit")]
    TooLarge { size: usize },

    #[error("Publish failed: {reason}")]
    Failed { reason: String },

    #[error("Node is shut down")]
    NodeClosed,

    #[error("Cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,
}

impl From<ContextError> for PublishError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => PublishError::Cancelled,
            ContextError::DeadlineExceeded => PublishError::DeadlineExceeded,
        }
    }
}

/// Check a topic name: non-empty, at most [`MAX_TOPIC_LEN`] bytes, no
/// control characters.
pub fn validate_topic(topic: &str) -> Result<(), SubscriptionError> {
    let invalid = |reason: &str| SubscriptionError::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.to_string(),
    };

    if topic.is_empty() {
        return Err(invalid("empty name"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(invalid("name too long"));
    }
    if topic.chars().any(char::is_control) {
        return Err(invalid("control character in name"));
    }
    Ok(())
}

/// Join `topic` on `node` and start receiving its messages.
///
/// Fails immediately only for an invalid name or a closed node. Subscribing
/// twice to the same topic yields two independent subscriptions that both
/// receive every message.
pub fn subscribe(node: &Node, topic: &str) -> Result<Subscription, SubscriptionError> {
    validate_topic(topic)?;
    if node.is_closed() {
        return Err(SubscriptionError::NodeClosed);
    }

    let id = node.next_subscription_id();
    let (messages_tx, messages) = mpsc::unbounded_channel();
    let (reply, joined) = oneshot::channel();
    node.send(Command::Subscribe {
        topic: topic.to_string(),
        id,
        messages: messages_tx,
        reply,
    })
    .map_err(|_| SubscriptionError::NodeClosed)?;

    Ok(Subscription {
        node: node.clone(),
        topic: topic.to_string(),
        id,
        joined: Some(joined),
        messages,
        terminated: None,
        left: false,
    })
}

/// A publishing handle for `name` on `node`. Does not join the topic.
pub fn topic(node: &Node, name: &str) -> Result<Topic, SubscriptionError> {
    validate_topic(name)?;
    if node.is_closed() {
        return Err(SubscriptionError::NodeClosed);
    }
    Ok(Topic {
        node: node.clone(),
        name: name.to_string(),
    })
}

/// An ordered stream of messages on one topic.
///
/// Once `next` fails, the subscription is finished and every later call
/// returns the same error. Dropping it leaves the topic.
pub struct Subscription {
    node: Node,
    topic: String,
    id: u64,
    joined: Option<oneshot::Receiver<Result<(), SubscriptionError>>>,
    messages: mpsc::UnboundedReceiver<Message>,
    terminated: Option<SubscriptionError>,
    left: bool,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next message, in arrival order.
    pub async fn next(&mut self, ctx: &Context) -> Result<Message, SubscriptionError> {
        if let Some(err) = &self.terminated {
            return Err(err.clone());
        }

        let result = self.pull(ctx).await;
        if let Err(err) = &result {
            tracing::debug!(topic = %self.topic, error = %err, "subscription finished");
            self.terminated = Some(err.clone());
            self.leave();
        }
        result
    }

    /// Leave the topic now instead of on drop.
    pub fn unsubscribe(mut self) {
        self.leave();
    }

    async fn pull(&mut self, ctx: &Context) -> Result<Message, SubscriptionError> {
        let node_ctx = self.node.context().clone();

        if let Some(joined) = self.joined.take() {
            tokio::select! {
                biased;
                err = ctx.done() => return Err(err.into()),
                _ = node_ctx.done() => return Err(SubscriptionError::NodeClosed),
                reply = joined => match reply {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(_) => return Err(SubscriptionError::NodeClosed),
                },
            }
        }

        tokio::select! {
            biased;
            err = ctx.done() => Err(err.into()),
            _ = node_ctx.done() => Err(SubscriptionError::NodeClosed),
            message = self.messages.recv() => message.ok_or(SubscriptionError::Closed),
        }
    }

    fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        self.messages.close();
        let _ = self.node.send(Command::Unsubscribe {
            topic: self.topic.clone(),
            id: self.id,
        });
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.leave();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("terminated", &self.terminated)
            .finish()
    }
}

/// Publishing handle for one topic.
#[derive(Clone, Debug)]
pub struct Topic {
    node: Node,
    name: String,
}

impl Topic {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish `data` to every subscriber of the topic.
    ///
    /// Messages from one publisher reach a given subscriber in publish order.
    /// Fails with [`PublishError::NoPeers`] while nobody, local or remote, is
    /// known to be subscribed.
    pub async fn publish(&self, ctx: &Context, data: impl Into<Vec<u8>>) -> Result<(), PublishError> {
        let (reply, result) = oneshot::channel();
        self.node
            .send(Command::Publish {
                topic: self.name.clone(),
                data: data.into(),
                reply,
            })
            .map_err(|_| PublishError::NodeClosed)?;

        match ctx.run(result).await? {
            Ok(outcome) => outcome,
            Err(_) => Err(PublishError::NodeClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("my-topic").is_ok());
        assert!(validate_topic(&"a".repeat(MAX_TOPIC_LEN)).is_ok());

        for bad in ["", "tab\there", "line\nbreak"] {
            assert!(matches!(
                validate_topic(bad),
                Err(SubscriptionError::InvalidTopic { .. })
            ));
        }
        assert!(validate_topic(&"a".repeat(MAX_TOPIC_LEN + 1)).is_err());
    }

    #[test]
    fn test_context_errors_map() {
        assert_eq!(
            SubscriptionError::from(ContextError::DeadlineExceeded),
            SubscriptionError::DeadlineExceeded
        );
        assert_eq!(PublishError::from(ContextError::Cancelled), PublishError::Cancelled);
    }

    #[test]
    fn test_config_defaults() {
        let config = PubSubConfig::default();
        assert_eq!(config.heartbeat_interval_ms, 1000);
        assert_eq!(config.max_transmit_size, 1 << 20);
        assert_eq!(config.max_topics, 256);

        let partial: PubSubConfig = serde_json::from_str(r#"{"max_topics": 1}"#).unwrap();
        assert_eq!(partial.max_topics, 1);
        assert_eq!(partial.heartbeat_interval_ms, 1000);
    }
}
