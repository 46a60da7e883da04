//! libp2p network behaviour for Trellis nodes.
//!
//! Defines the composite behaviour that combines:
//! - Relay client, so circuits can be dialed and reserved
//! - Relay server, only on nodes that forward circuits for others
//! - GossipSub for topic publish/subscribe
//! - Kademlia for identity-only address resolution
//! - mDNS for local discovery, when enabled
//! - Identify for exchanging listen addresses and supported protocols
//! - Ping for connection keep-alive
//! - Generic streams for application protocols such as `/hello`

use std::time::Duration;

use libp2p::{
    gossipsub, identify, identity::Keypair, kad, mdns, ping, relay,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
    StreamProtocol,
};
use serde::{Deserialize, Serialize};

use crate::pubsub::PubSubConfig;

/// Protocol version announced through identify.
pub const PROTOCOL_VERSION: &str = "/trellis/0.1.0";

/// Kademlia protocol name; only Trellis peers join the routing table.
pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/trellis/kad/1.0.0");

/// The composite network behaviour for Trellis.
///
/// This bundles every libp2p protocol a node speaks into one behaviour that
/// the node's driver task polls.
#[derive(NetworkBehaviour)]
pub struct TrellisBehaviour {
    /// Dial and listen through circuit relays.
    pub relay_client: relay::client::Behaviour,

    /// Forward circuits for other peers. Enabled on relayers only.
    pub relay: Toggle<relay::Behaviour>,

    /// GossipSub for topic messaging.
    pub gossipsub: gossipsub::Behaviour,

    /// DHT routing for peers dialed by identity only.
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,

    /// Local network discovery.
    pub mdns: Toggle<mdns::tokio::Behaviour>,

    /// Identify protocol for exchanging peer information.
    pub identify: identify::Behaviour,

    /// Ping for keeping connections alive and measuring latency.
    pub ping: ping::Behaviour,

    /// Application streams opened through `Node::new_stream`.
    pub stream: libp2p_stream::Behaviour,
}

/// Local discovery settings. Passing `None` in the node options disables
/// discovery entirely.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryOptions {
    /// Announce and discover peers over multicast DNS.
    pub mdns: bool,

    /// How often mDNS queries the local network, in milliseconds.
    pub mdns_query_interval_ms: u64,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            mdns: true,
            mdns_query_interval_ms: 30_000,
        }
    }
}

/// Everything needed to assemble a [`TrellisBehaviour`].
pub struct BehaviourParts<'a> {
    pub keypair: &'a Keypair,
    pub relay_client: relay::client::Behaviour,
    pub relay_service: bool,
    pub store: kad::store::MemoryStore,
    pub discovery: Option<&'a DiscoveryOptions>,
    pub pubsub: &'a PubSubConfig,
}

impl TrellisBehaviour {
    pub fn new(parts: BehaviourParts<'_>) -> Result<Self, String> {
        let local_peer_id = parts.keypair.public().to_peer_id();

        let relay = parts
            .relay_service
            .then(|| relay::Behaviour::new(local_peer_id, relay::Config::default()));

        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(parts.keypair.clone()),
            create_gossipsub_config(parts.pubsub)?,
        )
        .map_err(|e| format!("gossipsub: {e}"))?;

        let mut kademlia = kad::Behaviour::with_config(
            local_peer_id,
            parts.store,
            kad::Config::new(KAD_PROTOCOL),
        );
        // Serve records even before an external address is confirmed; private
        // networks rarely get one.
        kademlia.set_mode(Some(kad::Mode::Server));

        let mdns = match parts.discovery {
            Some(options) if options.mdns => Some(
                mdns::tokio::Behaviour::new(create_mdns_config(options), local_peer_id)
                    .map_err(|e| format!("mdns: {e}"))?,
            ),
            _ => None,
        };

        Ok(Self {
            relay_client: parts.relay_client,
            relay: relay.into(),
            gossipsub,
            kademlia,
            mdns: mdns.into(),
            identify: identify::Behaviour::new(create_identify_config(
                parts.keypair.public(),
            )),
            ping: ping::Behaviour::new(ping::Config::new()),
            stream: libp2p_stream::Behaviour::new(),
        })
    }

    pub fn local_relay_enabled(&self) -> bool {
        self.relay.is_enabled()
    }
}

/// Create a GossipSub configuration for private-network topics.
pub fn create_gossipsub_config(config: &PubSubConfig) -> Result<gossipsub::Config, String> {
    gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_millis(config.heartbeat_interval_ms))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .max_transmit_size(config.max_transmit_size)
        .build()
        .map_err(|e| format!("gossipsub config: {e}"))
}

/// Create identify configuration for Trellis.
pub fn create_identify_config(local_public_key: libp2p::identity::PublicKey) -> identify::Config {
    identify::Config::new(PROTOCOL_VERSION.to_string(), local_public_key)
}

fn create_mdns_config(options: &DiscoveryOptions) -> mdns::Config {
    mdns::Config {
        query_interval: Duration::from_millis(options.mdns_query_interval_ms),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts<'a>(
        keypair: &'a Keypair,
        relay_service: bool,
        discovery: Option<&'a DiscoveryOptions>,
        pubsub: &'a PubSubConfig,
    ) -> BehaviourParts<'a> {
        let peer_id = keypair.public().to_peer_id();
        let (_transport, relay_client) = relay::client::new(peer_id);
        BehaviourParts {
            keypair,
            relay_client,
            relay_service,
            store: kad::store::MemoryStore::new(peer_id),
            discovery,
            pubsub,
        }
    }

    #[tokio::test]
    async fn test_relay_server_toggle() {
        let keypair = Keypair::generate_ed25519();
        let pubsub = PubSubConfig::default();

        let relayer = TrellisBehaviour::new(parts(&keypair, true, None, &pubsub)).unwrap();
        assert!(relayer.local_relay_enabled());

        let plain = TrellisBehaviour::new(parts(&keypair, false, None, &pubsub)).unwrap();
        assert!(!plain.local_relay_enabled());
        assert!(!plain.mdns.is_enabled());
    }

    #[test]
    fn test_gossipsub_config_uses_pubsub_settings() {
        let pubsub = PubSubConfig {
            heartbeat_interval_ms: 250,
            max_transmit_size: 4096,
            ..PubSubConfig::default()
        };
        let config = create_gossipsub_config(&pubsub).unwrap();
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(250));
        assert_eq!(config.max_transmit_size(), 4096);
    }

    #[test]
    fn test_discovery_defaults() {
        let options = DiscoveryOptions::default();
        assert!(options.mdns);
        assert_eq!(
            create_mdns_config(&options).query_interval,
            Duration::from_secs(30)
        );
    }
}
