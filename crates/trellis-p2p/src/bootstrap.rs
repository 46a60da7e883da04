//! Startup bootstrap: connect to the configured peers, then seed the DHT.
//!
//! Bootstrap peers are trusted only for introductions. A node whose
//! bootstrap peers are all unreachable still runs; it simply has to be
//! dialed or discovered by others.

use std::collections::HashMap;

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::connect::connect;
use crate::node::Node;
use crate::peer::PeerInfo;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootstrapError {
    #[error("Invalid bootstrap address {addr:?}: {reason}")]
    InvalidAddr { addr: String, reason: String },
}

/// Group `/p2p/<id>`-terminated addresses into one target per peer.
///
/// The order of first appearance is kept.
pub fn peers_from_addrs<S: AsRef<str>>(addrs: &[S]) -> Result<Vec<PeerInfo>, BootstrapError> {
    let mut peers: Vec<PeerInfo> = Vec::new();
    let mut index = HashMap::new();

    for raw in addrs {
        let raw = raw.as_ref();
        let invalid = |reason: String| BootstrapError::InvalidAddr {
            addr: raw.to_string(),
            reason,
        };
        let addr: Multiaddr = raw.parse().map_err(|e| invalid(format!("{e}")))?;
        let info = PeerInfo::from_p2p_addr(&addr).ok_or_else(|| invalid("missing /p2p/<peer id>".to_string()))?;

        match index.get(&info.id) {
            Some(&i) => {
                let known: &mut PeerInfo = &mut peers[i];
                known.addrs.extend(info.addrs);
            }
            None => {
                index.insert(info.id, peers.len());
                peers.push(info);
            }
        }
    }
    Ok(peers)
}

/// Bootstrap state, tracking the progress of the startup connections.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapState {
    /// Current phase of bootstrapping.
    pub phase: BootstrapPhase,
    /// Number of bootstrap peers configured.
    pub peers_configured: usize,
    /// Number of bootstrap peers successfully connected.
    pub peers_connected: usize,
    /// Number of connection attempts that failed.
    pub connection_failures: usize,
}

/// Phases of the bootstrap process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootstrapPhase {
    NotStarted,
    /// Dialing the configured peers.
    Connecting,
    /// Peers dialed and the DHT bootstrap round started.
    Complete,
    /// None of the configured peers could be reached.
    Failed { reason: String },
}

impl BootstrapState {
    pub fn new(peers_configured: usize) -> Self {
        Self {
            phase: BootstrapPhase::NotStarted,
            peers_configured,
            peers_connected: 0,
            connection_failures: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == BootstrapPhase::Complete
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.phase, BootstrapPhase::Failed { .. })
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        match &self.phase {
            BootstrapPhase::NotStarted => "Bootstrap not started".to_string(),
            BootstrapPhase::Connecting => format!(
                "Connecting to bootstrap peers... ({} of {} connected, {} failed)",
                self.peers_connected, self.peers_configured, self.connection_failures
            ),
            BootstrapPhase::Complete => format!(
                "Bootstrap complete: {} of {} peers connected",
                self.peers_connected, self.peers_configured
            ),
            BootstrapPhase::Failed { reason } => format!("Bootstrap failed: {}", reason),
        }
    }

    fn record(&mut self, connected: bool) {
        if connected {
            self.peers_connected += 1;
        } else {
            self.connection_failures += 1;
        }
    }

    fn finish(&mut self) {
        self.phase = if self.peers_configured > 0 && self.peers_connected == 0 {
            BootstrapPhase::Failed {
                reason: "no bootstrap peer reachable".to_string(),
            }
        } else {
            BootstrapPhase::Complete
        };
    }
}

/// Dial every bootstrap peer once, then start a DHT bootstrap round.
pub(crate) async fn run(node: Node, peers: Vec<PeerInfo>, state: watch::Sender<BootstrapState>) {
    let update = |f: &dyn Fn(&mut BootstrapState)| {
        state.send_modify(|s| f(s));
        state.borrow().summary()
    };

    update(&|s| s.phase = BootstrapPhase::Connecting);

    let mut events = connect(&node, peers, true);
    while let Some(event) = events.recv().await {
        if let Some(err) = &event.error {
            warn!(peer = %event.target.id, error = %err, "bootstrap peer unreachable");
        }
        let connected = event.is_ok();
        update(&|s| s.record(connected));
    }

    if node.is_closed() {
        return;
    }
    if let Err(e) = node.bootstrap().await {
        warn!(error = %e, "dht bootstrap failed");
    }

    let summary = update(&|s| s.finish());
    info!("{summary}");
}
