//! Node options.
//!
//! Every field may be left unset. [`Options::resolve`] fills the gaps at
//! construction time, so the running node always holds concrete values:
//! a keypair, a secret, listen addresses, a logging span and a record store.

use std::fmt;

use libp2p::{identity::Keypair, kad::store::MemoryStore, multiaddr::Protocol, Multiaddr, PeerId};
use tracing::Span;
use trellis_core::Secret;

use crate::behaviour::DiscoveryOptions;
use crate::peer::PeerInfo;
use crate::pubsub::PubSubConfig;
use crate::transport::TransportConfig;

/// Hook for adjusting the swarm configuration before the node starts.
pub type ConfigureSwarm = Box<dyn FnOnce(libp2p::swarm::Config) -> libp2p::swarm::Config + Send>;

/// Configuration for creating a node.
pub struct Options {
    /// Identity of the node. A fresh Ed25519 keypair when unset.
    pub keypair: Option<Keypair>,

    /// Private network secret. [`Secret::default_network`] when unset.
    pub secret: Option<Secret>,

    /// Addresses to listen on. Wildcard IPv4 and IPv6 TCP with an ephemeral
    /// port when empty.
    pub listen_addrs: Vec<Multiaddr>,

    /// Span all node logging is recorded under. A `node` span carrying the
    /// peer id when unset.
    pub logger: Option<Span>,

    /// Record store backing the DHT.
    pub store: Option<MemoryStore>,

    /// Custom swarm configuration hook.
    pub configure: Option<ConfigureSwarm>,

    /// Local discovery. `None` disables mDNS.
    pub discovery: Option<DiscoveryOptions>,

    /// Peers to connect to on startup.
    pub peers: Vec<PeerInfo>,

    /// Forward circuits for other peers.
    pub relay_service: bool,

    /// Take a circuit reservation on every relay we connect to, so peers
    /// that cannot dial us directly can still reach us.
    pub auto_relay: bool,

    pub transport: TransportConfig,

    pub pubsub: PubSubConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            keypair: None,
            secret: None,
            listen_addrs: Vec::new(),
            logger: None,
            store: None,
            configure: None,
            discovery: None,
            peers: Vec::new(),
            relay_service: false,
            auto_relay: true,
            transport: TransportConfig::default(),
            pubsub: PubSubConfig::default(),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("peer_id", &self.keypair.as_ref().map(|k| k.public().to_peer_id()))
            .field("secret", &self.secret)
            .field("listen_addrs", &self.listen_addrs)
            .field("discovery", &self.discovery)
            .field("peers", &self.peers)
            .field("relay_service", &self.relay_service)
            .field("auto_relay", &self.auto_relay)
            .field("transport", &self.transport)
            .field("pubsub", &self.pubsub)
            .finish_non_exhaustive()
    }
}

impl Options {
    /// The minimum needed to join a private network.
    pub fn new(keypair: Option<Keypair>, secret: Secret, discovery: Option<DiscoveryOptions>) -> Self {
        Self {
            keypair,
            secret: Some(secret),
            discovery,
            ..Self::default()
        }
    }

    pub fn with_listen_addrs(mut self, addrs: Vec<Multiaddr>) -> Self {
        self.listen_addrs = addrs;
        self
    }

    pub fn with_peers(mut self, peers: Vec<PeerInfo>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_logger(mut self, span: Span) -> Self {
        self.logger = Some(span);
        self
    }

    pub fn with_configure(
        mut self,
        hook: impl FnOnce(libp2p::swarm::Config) -> libp2p::swarm::Config + Send + 'static,
    ) -> Self {
        self.configure = Some(Box::new(hook));
        self
    }

    /// Apply defaults for every unset field.
    pub fn resolve(self) -> ResolvedOptions {
        let keypair = self.keypair.unwrap_or_else(Keypair::generate_ed25519);
        let peer_id = keypair.public().to_peer_id();
        let listen_addrs = if self.listen_addrs.is_empty() {
            default_listen_addrs()
        } else {
            self.listen_addrs
        };

        ResolvedOptions {
            peer_id,
            secret: self.secret.unwrap_or_default(),
            listen_addrs,
            logger: self
                .logger
                .unwrap_or_else(|| tracing::info_span!("node", peer = %peer_id)),
            store: self.store.unwrap_or_else(|| MemoryStore::new(peer_id)),
            configure: self.configure.unwrap_or_else(|| Box::new(|config| config)),
            discovery: self.discovery,
            peers: self.peers,
            relay_service: self.relay_service,
            auto_relay: self.auto_relay,
            transport: self.transport,
            pubsub: self.pubsub,
            keypair,
        }
    }
}

/// [`Options`] with every default applied.
pub struct ResolvedOptions {
    pub keypair: Keypair,
    pub peer_id: PeerId,
    pub secret: Secret,
    pub listen_addrs: Vec<Multiaddr>,
    pub logger: Span,
    pub store: MemoryStore,
    pub configure: ConfigureSwarm,
    pub discovery: Option<DiscoveryOptions>,
    pub peers: Vec<PeerInfo>,
    pub relay_service: bool,
    pub auto_relay: bool,
    pub transport: TransportConfig,
    pub pubsub: PubSubConfig,
}

/// `/ip4/0.0.0.0/tcp/0` and `/ip6/::/tcp/0`.
pub fn default_listen_addrs() -> Vec<Multiaddr> {
    vec![
        Multiaddr::empty()
            .with(Protocol::Ip4([0, 0, 0, 0].into()))
            .with(Protocol::Tcp(0)),
        Multiaddr::empty()
            .with(Protocol::Ip6([0u16; 8].into()))
            .with(Protocol::Tcp(0)),
    ]
}

/// Loopback-only listen address on an ephemeral port.
pub fn loopback_listen_addr() -> Multiaddr {
    Multiaddr::empty()
        .with(Protocol::Ip4([127, 0, 0, 1].into()))
        .with(Protocol::Tcp(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve() {
        let resolved = Options::default().resolve();
        assert_eq!(resolved.secret, Secret::default_network());
        assert_eq!(resolved.listen_addrs, default_listen_addrs());
        assert!(resolved.auto_relay);
        assert!(!resolved.relay_service);
        assert!(resolved.discovery.is_none());
        assert_eq!(resolved.peer_id, resolved.keypair.public().to_peer_id());
    }

    #[test]
    fn test_explicit_values_are_kept() {
        let keypair = Keypair::generate_ed25519();
        let peer_id = keypair.public().to_peer_id();
        let secret = Secret::generate();
        let resolved = Options::new(Some(keypair), secret.clone(), Some(DiscoveryOptions::default()))
            .with_listen_addrs(vec![loopback_listen_addr()])
            .resolve();

        assert_eq!(resolved.peer_id, peer_id);
        assert_eq!(resolved.secret, secret);
        assert_eq!(resolved.listen_addrs, vec![loopback_listen_addr()]);
        assert!(resolved.discovery.unwrap().mdns);
    }

    #[test]
    fn test_default_listen_addrs() {
        let addrs: Vec<String> = default_listen_addrs().iter().map(|a| a.to_string()).collect();
        assert_eq!(addrs, vec!["/ip4/0.0.0.0/tcp/0", "/ip6/::/tcp/0"]);
    }

    #[test]
    fn test_configure_hook_defaults_to_identity() {
        let resolved = Options::default()
            .with_configure(|config| config.with_notify_handler_buffer_size(std::num::NonZeroUsize::MIN))
            .resolve();
        let config = libp2p::swarm::Config::with_tokio_executor();
        let _ = (resolved.configure)(config);
    }

    #[test]
    fn test_debug_hides_secret() {
        let secret = Secret::generate();
        let options = Options::new(None, secret.clone(), None);
        assert!(!format!("{:?}", options).contains(&secret.to_hex()));
    }
}
