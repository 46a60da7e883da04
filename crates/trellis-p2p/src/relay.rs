//! Circuit relay addressing.
//!
//! Two nodes without mutual direct connectivity reach each other through a
//! relay `R` that both can dial. The dialing side uses a composite address
//!
//! ```text
//! <R's transport address>/p2p/<R>/p2p-circuit/p2p/<target>
//! ```
//!
//! which the relay client transport resolves at dial time: connect to `R`
//! first, then ask `R` to open a circuit to `target`. The target must hold
//! a reservation on `R`, which nodes take automatically once they identify
//! a peer as a relay (see `Options::auto_relay`).
//!
//! Relays only forward bytes. The end-to-end session is still encrypted
//! with Noise between the two endpoints.

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};

use crate::peer::PeerInfo;

/// How a connection reaches its peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Straight over the transport.
    Direct,
    /// Through a circuit on `relay`. `None` when the relay is not named in
    /// the address.
    Relayed { relay: Option<PeerId> },
}

impl ConnectionKind {
    /// Classify a connection by its remote address.
    pub fn of(addr: &Multiaddr) -> Self {
        if is_relayed(addr) {
            ConnectionKind::Relayed {
                relay: relay_of(addr),
            }
        } else {
            ConnectionKind::Direct
        }
    }

    pub fn is_relayed(&self) -> bool {
        matches!(self, ConnectionKind::Relayed { .. })
    }

    /// Human-readable description for logging.
    pub fn description(&self) -> String {
        match self {
            ConnectionKind::Direct => "direct".to_string(),
            ConnectionKind::Relayed { relay: Some(relay) } => format!("relayed via {relay}"),
            ConnectionKind::Relayed { relay: None } => "relayed".to_string(),
        }
    }
}

/// Build a dial target for `target` that routes through `relay`.
///
/// One circuit address is produced per known relay address. With no relay
/// addresses the result still names the relay, leaving its resolution to
/// previously learned addresses or the routing layer. Pure: no I/O.
pub fn circuit_relay_addr_info(relay: &PeerInfo, target: PeerId) -> PeerInfo {
    let via = |relay_addr: Multiaddr| {
        strip_p2p(relay_addr)
            .with(Protocol::P2p(relay.id))
            .with(Protocol::P2pCircuit)
            .with(Protocol::P2p(target))
    };

    let addrs = if relay.addrs.is_empty() {
        vec![via(Multiaddr::empty())]
    } else {
        relay.addrs.iter().cloned().map(via).collect()
    };

    PeerInfo { id: target, addrs }
}

/// The address to listen on to accept circuits through `relay`, reached at
/// `relay_addr`.
pub fn circuit_listen_addr(relay_addr: &Multiaddr, relay: PeerId) -> Multiaddr {
    strip_p2p(relay_addr.clone())
        .with(Protocol::P2p(relay))
        .with(Protocol::P2pCircuit)
}

/// Whether `addr` goes through a circuit relay.
pub fn is_relayed(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// The relay named before the first `/p2p-circuit` in `addr`.
pub fn relay_of(addr: &Multiaddr) -> Option<PeerId> {
    let mut last_peer = None;
    for proto in addr.iter() {
        match proto {
            Protocol::P2pCircuit => return last_peer,
            Protocol::P2p(id) => last_peer = Some(id),
            _ => {}
        }
    }
    None
}

/// Drop a trailing `/p2p/<id>` so another peer component can be appended.
fn strip_p2p(mut addr: Multiaddr) -> Multiaddr {
    if let Some(Protocol::P2p(_)) = addr.iter().last() {
        addr.pop();
    }
    addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::generate_identity;

    fn relay_info() -> PeerInfo {
        let (id, _) = generate_identity();
        PeerInfo::new(
            id,
            vec![
                "/ip4/127.0.0.1/tcp/4001".parse().unwrap(),
                format!("/ip6/::1/tcp/4001/p2p/{id}").parse().unwrap(),
            ],
        )
    }

    #[test]
    fn test_circuit_addr_per_relay_addr() {
        let relay = relay_info();
        let (target, _) = generate_identity();

        let info = circuit_relay_addr_info(&relay, target);
        assert_eq!(info.id, target);
        assert_eq!(
            info.addrs,
            vec![
                format!("/ip4/127.0.0.1/tcp/4001/p2p/{}/p2p-circuit/p2p/{target}", relay.id)
                    .parse::<Multiaddr>()
                    .unwrap(),
                format!("/ip6/::1/tcp/4001/p2p/{}/p2p-circuit/p2p/{target}", relay.id)
                    .parse::<Multiaddr>()
                    .unwrap(),
            ]
        );
        assert!(info.addrs.iter().all(is_relayed));
        assert!(info.addrs.iter().all(|a| relay_of(a) == Some(relay.id)));
    }

    #[test]
    fn test_circuit_addr_is_deterministic() {
        let relay = relay_info();
        let (target, _) = generate_identity();
        assert_eq!(
            circuit_relay_addr_info(&relay, target),
            circuit_relay_addr_info(&relay, target)
        );
    }

    #[test]
    fn test_circuit_addr_without_relay_addrs() {
        let (relay, _) = generate_identity();
        let (target, _) = generate_identity();

        let info = circuit_relay_addr_info(&PeerInfo::from_id(relay), target);
        assert_eq!(
            info.addrs,
            vec![format!("/p2p/{relay}/p2p-circuit/p2p/{target}")
                .parse::<Multiaddr>()
                .unwrap()]
        );
    }

    #[test]
    fn test_connection_kind() {
        let relay = relay_info();
        let (target, _) = generate_identity();
        let circuit = &circuit_relay_addr_info(&relay, target).addrs[0];

        assert_eq!(
            ConnectionKind::of(circuit),
            ConnectionKind::Relayed {
                relay: Some(relay.id)
            }
        );
        assert_eq!(ConnectionKind::of(&relay.addrs[0]), ConnectionKind::Direct);
        assert!(!ConnectionKind::Direct.is_relayed());
        assert!(ConnectionKind::of(circuit)
            .description()
            .contains(&relay.id.to_string()));
    }

    #[test]
    fn test_circuit_listen_addr() {
        let relay = relay_info();
        let listen = circuit_listen_addr(&relay.addrs[1], relay.id);
        assert_eq!(
            listen,
            format!("/ip6/::1/tcp/4001/p2p/{}/p2p-circuit", relay.id)
                .parse::<Multiaddr>()
                .unwrap()
        );
        assert_eq!(relay_of(&listen), Some(relay.id));
    }
}
