//! Dialing a set of peers, once or continuously.
//!
//! [`connect`] reports one [`ConnectionEvent`] per attempt. In once mode
//! every target is dialed a single time and the stream closes after the
//! last result. In watch mode each target is redialed after failures and
//! after disconnects until the node's context ends.

use std::time::Duration;

use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, Instrument};
use trellis_core::{event_channel, Context, ContextError, EventSender, EventStream};

use crate::node::Node;
use crate::peer::{PeerEvent, PeerInfo};

/// Smallest event buffer handed out by [`connect`].
const MIN_EVENT_BUFFER: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialError {
    #[error("Dial to {peer} failed: {reason}")]
    Failed { peer: PeerId, reason: String },

    #[error("Dial to {peer} timed out after {timeout:?}")]
    Timeout { peer: PeerId, timeout: Duration },

    #[error("Node is shut down")]
    NodeClosed,
}

/// The outcome of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub target: PeerInfo,
    /// `None` on success.
    pub error: Option<DialError>,
}

impl ConnectionEvent {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Stream of connection outcomes returned by [`connect`].
pub type ConnectionEvents = EventStream<ConnectionEvent>;

/// Delay between failed attempts in watch mode.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchBackoff {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: u32,
}

impl Default for WatchBackoff {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 5_000,
            multiplier: 2,
        }
    }
}

impl WatchBackoff {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    /// The delay after `current`, capped at the maximum.
    pub fn next(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.multiplier.max(1))
            .min(Duration::from_millis(self.max_ms))
    }
}

/// How [`connect_with`] treats its targets.
#[derive(Clone, Debug)]
pub enum DialMode {
    /// One attempt per target.
    Once,
    /// Keep every target connected until the node's context ends.
    Watch(WatchBackoff),
}

/// Dial `targets` from `node` and report each attempt.
///
/// With `once` set, exactly one event per target is emitted and the stream
/// closes afterwards. Otherwise targets are watched with the default
/// backoff. See [`connect_with`].
pub fn connect(node: &Node, targets: Vec<PeerInfo>, once: bool) -> ConnectionEvents {
    let mode = if once {
        DialMode::Once
    } else {
        DialMode::Watch(WatchBackoff::default())
    };
    connect_with(node, targets, mode)
}

/// Like [`connect`] with an explicit mode.
///
/// Targets are dialed concurrently; events for one target arrive in attempt
/// order. No event is emitted once the node's context has ended. Dropping
/// the returned stream stops the attempts.
pub fn connect_with(node: &Node, targets: Vec<PeerInfo>, mode: DialMode) -> ConnectionEvents {
    let ctx = node.context().clone();
    if ctx.is_done() {
        return EventStream::closed();
    }

    let (events, stream) = event_channel(targets.len().max(MIN_EVENT_BUFFER));
    let span = node.logger().clone();

    if targets.is_empty() {
        if let DialMode::Watch(_) = mode {
            // Nothing to dial, but a watch stream stays open for the node's lifetime.
            tokio::spawn(async move {
                ctx.done().await;
                drop(events);
            });
        }
        return stream;
    }

    for target in targets {
        let node = node.clone();
        let ctx = ctx.clone();
        let events = events.clone();
        match &mode {
            DialMode::Once => {
                tokio::spawn(dial_once(node, ctx, target, events).instrument(span.clone()));
            }
            DialMode::Watch(backoff) => {
                tokio::spawn(watch(node, ctx, target, events, backoff.clone()).instrument(span.clone()));
            }
        }
    }
    stream
}

async fn attempt(node: &Node, target: &PeerInfo) -> ConnectionEvent {
    let error = node.dial(target).await.err();
    match &error {
        None => debug!(peer = %target.id, "connected to target"),
        Some(e) => debug!(peer = %target.id, error = %e, "connection attempt failed"),
    }
    ConnectionEvent {
        target: target.clone(),
        error,
    }
}

async fn dial_once(node: Node, ctx: Context, target: PeerInfo, events: EventSender<ConnectionEvent>) {
    let event = attempt(&node, &target).await;
    let _ = events.emit(&ctx, event).await;
}

async fn watch(
    node: Node,
    ctx: Context,
    target: PeerInfo,
    events: EventSender<ConnectionEvent>,
    backoff: WatchBackoff,
) {
    let mut delay = backoff.initial();
    loop {
        if events.is_abandoned() {
            debug!(peer = %target.id, "nobody reads the watch stream, stopping");
            return;
        }
        let event = attempt(&node, &target).await;
        let connected = event.is_ok();
        if events.emit(&ctx, event).await.is_err() {
            return;
        }

        if connected {
            delay = backoff.initial();
            if wait_disconnected(&node, &ctx, target.id).await.is_err() {
                return;
            }
            debug!(peer = %target.id, "watched peer disconnected, redialing");
        }

        if ctx.sleep(delay).await.is_err() {
            return;
        }
        if !connected {
            delay = backoff.next(delay);
        }
    }
}

/// Resolve once `peer` has no connection left.
async fn wait_disconnected(node: &Node, ctx: &Context, peer: PeerId) -> Result<(), ContextError> {
    let mut peer_events = node.peer_events();
    if !node.is_connected(peer).await {
        return Ok(());
    }

    loop {
        match ctx.run(peer_events.recv()).await? {
            Ok(PeerEvent::Disconnected { peer: gone }) if gone == peer => return Ok(()),
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {
                if !node.is_connected(peer).await {
                    return Ok(());
                }
            }
            Err(RecvError::Closed) => return Err(ContextError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = WatchBackoff::default();
        let mut delay = backoff.initial();
        let mut seen = vec![delay];
        for _ in 0..6 {
            delay = backoff.next(delay);
            seen.push(delay);
        }
        let millis: Vec<u128> = seen.iter().map(Duration::as_millis).collect();
        assert_eq!(millis, vec![250, 500, 1000, 2000, 4000, 5000, 5000]);
    }

    #[test]
    fn test_backoff_zero_multiplier_does_not_shrink() {
        let backoff = WatchBackoff {
            multiplier: 0,
            ..WatchBackoff::default()
        };
        assert_eq!(backoff.next(backoff.initial()), backoff.initial());
    }

    #[test]
    fn test_connection_event_is_ok() {
        let target = PeerInfo::from_id(PeerId::random());
        let ok = ConnectionEvent {
            target: target.clone(),
            error: None,
        };
        let failed = ConnectionEvent {
            target: target.clone(),
            error: Some(DialError::NodeClosed),
        };
        assert!(ok.is_ok());
        assert!(!failed.is_ok());
    }
}
