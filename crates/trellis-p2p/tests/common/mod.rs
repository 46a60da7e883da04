//! Shared helpers for localhost network tests.

#![allow(dead_code)]

use std::time::Duration;

use trellis_p2p::{loopback_listen_addr, Context, Multiaddr, Node, Options, Secret};

/// Upper bound for any single network step in these tests.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(30);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
}

/// Loopback-only options on a private network of our own.
pub fn options(secret: &Secret) -> Options {
    Options::new(None, secret.clone(), None).with_listen_addrs(vec![loopback_listen_addr()])
}

pub async fn node(ctx: &Context, secret: &Secret) -> Node {
    Node::new(ctx, options(secret)).await.unwrap()
}


/// A TCP address that accepts connections and never says a word, so every
/// handshake against it stalls until the dialer gives up.
pub async fn silent_addr() -> Multiaddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap()
}
