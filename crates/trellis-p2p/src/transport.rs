//! Transport configuration for private-network nodes.
//!
//! Every direct connection runs TCP, then the private network handshake,
//! then Noise, then Yamux. A peer without the shared secret fails the
//! handshake before any libp2p protocol is spoken.
//!
//! Relayed connections ride inside a connection to the relay, which is
//! itself protected by the same stack.

use std::time::Duration;

use libp2p::{
    core::{
        muxing::StreamMuxerBox,
        transport::{timeout::TransportTimeout, Boxed},
        upgrade,
    },
    identity::Keypair,
    noise,
    pnet::{PnetConfig, PreSharedKey},
    tcp, yamux, PeerId, Transport,
};
use serde::{Deserialize, Serialize};
use trellis_core::Secret;

/// Configuration for the transport layer and connection lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Upper bound for a single dial attempt in milliseconds.
    pub dial_timeout_ms: u64,

    /// How long a connection with no active streams is kept open.
    pub idle_connection_timeout_ms: u64,

    /// Disable Nagle's algorithm on TCP sockets.
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 15_000,
            idle_connection_timeout_ms: 600_000,
            nodelay: true,
        }
    }
}

impl TransportConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn idle_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_connection_timeout_ms)
    }
}

/// The libp2p form of a private network secret.
pub fn pre_shared_key(secret: &Secret) -> PreSharedKey {
    PreSharedKey::new(*secret.as_bytes())
}

/// TCP + pnet + Noise + Yamux, boxed so it can be handed to the swarm builder.
///
/// Each dial and each inbound upgrade is bounded by the configured dial
/// timeout, so a peer that never answers fails instead of hanging.
pub fn private_tcp_transport(
    key: &Keypair,
    psk: PreSharedKey,
    config: &TransportConfig,
) -> Result<Boxed<(PeerId, StreamMuxerBox)>, noise::Error> {
    let noise_config = noise::Config::new(key)?;
    let tcp_config = tcp::Config::default().nodelay(config.nodelay);

    let upgraded = tcp::tokio::Transport::new(tcp_config)
        .and_then(move |socket, _| PnetConfig::new(psk).handshake(socket))
        .upgrade(upgrade::Version::V1Lazy)
        .authenticate(noise_config)
        .multiplex(yamux::Config::default())
        .map(|(peer, muxer), _| (peer, StreamMuxerBox::new(muxer)));

    Ok(TransportTimeout::new(upgraded, config.dial_timeout()).boxed())
}
