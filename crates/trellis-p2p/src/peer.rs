//! Peer identities, dial targets and connection notifications.

use std::fmt;

use libp2p::{identity::Keypair, multiaddr::Protocol, Multiaddr, PeerId};

use crate::relay::ConnectionKind;

/// A peer identity plus the addresses it is known under.
///
/// Used both as a node's own identity and as a dial target. An empty
/// address list means "resolve through the routing layer".
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

/// A dial target is just the peer info we know about it.
pub type ConnectionTarget = PeerInfo;

impl PeerInfo {
    pub fn new(id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { id, addrs }
    }

    /// A target with no addresses; dialing relies on routing lookups.
    pub fn from_id(id: PeerId) -> Self {
        Self {
            id,
            addrs: Vec::new(),
        }
    }

    /// Split an address ending in `/p2p/<id>` into peer info.
    ///
    /// Returns `None` when the address does not name a peer.
    pub fn from_p2p_addr(addr: &Multiaddr) -> Option<Self> {
        let mut transport = addr.clone();
        match transport.pop() {
            Some(Protocol::P2p(id)) => {
                let addrs = if transport.is_empty() {
                    Vec::new()
                } else {
                    vec![transport]
                };
                Some(Self { id, addrs })
            }
            _ => None,
        }
    }

    /// Every address with `/p2p/<id>` appended, ready to share.
    pub fn p2p_addrs(&self) -> Vec<Multiaddr> {
        self.addrs
            .iter()
            .map(|addr| match addr.iter().last() {
                Some(Protocol::P2p(id)) if id == self.id => addr.clone(),
                _ => addr.clone().with(Protocol::P2p(self.id)),
            })
            .collect()
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}: [", self.id)?;
        for (i, addr) in self.addrs.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", addr)?;
        }
        write!(f, "]}}")
    }
}

/// Generate a fresh Ed25519 identity.
pub fn generate_identity() -> (PeerId, Keypair) {
    let keypair = Keypair::generate_ed25519();
    (keypair.public().to_peer_id(), keypair)
}

/// Connection-level changes broadcast by a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// A connection to `peer` was established.
    Connected { peer: PeerId, kind: ConnectionKind },
    /// The last connection to `peer` closed.
    Disconnected { peer: PeerId },
    /// A relay accepted our circuit reservation; we are reachable through it.
    RelayReserved { relay: PeerId },
}
