//! # Trellis P2P
//!
//! Private-network peer-to-peer layer for Trellis nodes.
//!
//! ## Architecture
//!
//! - Every node runs TCP gated by a pre-shared network secret, then Noise
//!   and Yamux, plus the circuit relay client for peers it cannot dial
//! - One driver task owns the libp2p swarm; [`Node`] handles send it commands
//! - [`connect`] dials targets once or keeps them connected
//! - [`subscribe`] and [`topic`] expose GossipSub as named topics
//! - Relayers forward circuits so NAT-bound peers can still reach each other
//!
//! ## Trust Model
//!
//! Only peers holding the network secret complete a handshake. Relays and
//! bootstrap peers are trusted for introductions and forwarding only; the
//! end-to-end session is authenticated and encrypted between the endpoints.

pub mod behaviour;
pub mod bootstrap;
pub mod connect;
pub mod node;
pub mod options;
pub mod peer;
pub mod pubsub;
pub mod relay;
pub mod transport;

pub use behaviour::{DiscoveryOptions, TrellisBehaviour, KAD_PROTOCOL, PROTOCOL_VERSION};
pub use bootstrap::{peers_from_addrs, BootstrapError, BootstrapPhase, BootstrapState};
pub use connect::{connect, connect_with, ConnectionEvent, ConnectionEvents, DialError, DialMode, WatchBackoff};
pub use node::{Node, NodeError, SHUTDOWN_GRACE};
pub use options::{default_listen_addrs, loopback_listen_addr, ConfigureSwarm, Options};
pub use peer::{generate_identity, ConnectionTarget, PeerEvent, PeerInfo};
pub use pubsub::{
    subscribe, topic, validate_topic, Message, PubSubConfig, PublishError, Subscription, SubscriptionError, Topic,
    MAX_TOPIC_LEN,
};
pub use relay::{circuit_relay_addr_info, ConnectionKind};
pub use transport::TransportConfig;

pub use libp2p::{identity::Keypair, Multiaddr, PeerId, Stream, StreamProtocol};
pub use trellis_core::{setup_group, Context, ContextError, Live, Secret, SetupError};
