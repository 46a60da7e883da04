//! A running Trellis node.
//!
//! The swarm is owned by a single driver task. [`Node`] is a cheap handle
//! that talks to the driver over a command channel, so every operation on
//! the network state is serialized through one place.
//!
//! ## Lifetime
//!
//! A node lives until its context ends: the caller's context is cancelled,
//! [`Node::shutdown`] is called, or the last handle is dropped. The driver
//! then closes every listener and connection and reports itself stopped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    gossipsub::{self, IdentTopic, TopicHash},
    identify, kad, mdns, noise, relay,
    swarm::{
        dial_opts::{DialOpts, PeerCondition},
        ConnectionId, DialError as SwarmDialError, ListenerId, SwarmEvent,
    },
    yamux, Multiaddr, PeerId, Stream, StreamProtocol, Swarm, SwarmBuilder,
};
use libp2p_stream::{Control, IncomingStreams};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn, Instrument, Span};
use trellis_core::{Context, ContextError, Live};

use crate::behaviour::{BehaviourParts, TrellisBehaviour, TrellisBehaviourEvent, KAD_PROTOCOL};
use crate::bootstrap::{self, BootstrapState};
use crate::connect::DialError;
use crate::options::{Options, ResolvedOptions};
use crate::peer::{PeerEvent, PeerInfo};
use crate::pubsub::{Message, PublishError, SubscriptionError};
use crate::relay::{circuit_listen_addr, is_relayed, ConnectionKind};
use crate::transport::{pre_shared_key, private_tcp_transport};

/// How long `shutdown` waits for the driver to close everything.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long startup waits for the first bound listen address.
const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);

const PEER_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Transport setup failed: {0}")]
    Transport(String),

    #[error("Behaviour setup failed: {0}")]
    Behaviour(String),

    #[error("Listen failed: {0}")]
    Listen(String),

    #[error("Node is shut down")]
    Closed,

    #[error("Protocol {protocol} already has a stream handler")]
    HandlerExists { protocol: String },

    #[error("Opening stream to {peer} failed: {reason}")]
    OpenStream { peer: PeerId, reason: String },

    #[error("Shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),

    #[error(transparent)]
    Context(#[from] ContextError),
}

type DialReply = oneshot::Sender<Result<(), DialError>>;

/// Requests handled by the driver task.
pub(crate) enum Command {
    Dial {
        target: PeerInfo,
        reply: DialReply,
    },
    IsConnected {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Bootstrap {
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        topic: String,
        id: u64,
        messages: mpsc::UnboundedSender<Message>,
        reply: oneshot::Sender<Result<(), SubscriptionError>>,
    },
    Unsubscribe {
        topic: String,
        id: u64,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), PublishError>>,
    },
}

/// Handle to a running node. Clones share the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    peer_id: PeerId,
    ctx: Context,
    span: Span,
    commands: mpsc::UnboundedSender<Command>,
    addrs: watch::Receiver<Vec<Multiaddr>>,
    peer_events: broadcast::Sender<PeerEvent>,
    streams: Control,
    stopped: watch::Receiver<bool>,
    bootstrap: watch::Receiver<BootstrapState>,
    dial_timeout: Duration,
    relay_service: bool,
    next_subscription: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

impl Node {
    /// Build, start listening and begin bootstrapping.
    ///
    /// Returns once at least one listen address is bound. The node's context
    /// is a child of `ctx`.
    pub async fn new(ctx: &Context, options: Options) -> Result<Self, NodeError> {
        let options = options.resolve();
        let span = options.logger.clone();
        Self::start(ctx, options).instrument(span).await
    }

    /// A node that also forwards circuits for other peers.
    pub async fn relayer(ctx: &Context, mut options: Options) -> Result<Self, NodeError> {
        options.relay_service = true;
        Self::new(ctx, options).await
    }

    async fn start(parent: &Context, options: ResolvedOptions) -> Result<Self, NodeError> {
        if let Some(err) = parent.err() {
            return Err(err.into());
        }

        let ResolvedOptions {
            keypair,
            peer_id,
            secret,
            listen_addrs,
            logger,
            store,
            configure,
            discovery,
            peers,
            relay_service,
            auto_relay,
            transport,
            pubsub,
        } = options;

        info!(%peer_id, network = %secret.fingerprint(), relay_service, "starting node");

        let psk = pre_shared_key(&secret);
        let idle_timeout = transport.idle_connection_timeout();
        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_other_transport(|key| private_tcp_transport(key, psk, &transport))
            .map_err(|e| NodeError::Transport(e.to_string()))?
            .with_relay_client(noise::Config::new, yamux::Config::default)
            .map_err(|e| NodeError::Transport(e.to_string()))?
            .with_behaviour(
                |key, relay_client| -> Result<TrellisBehaviour, Box<dyn std::error::Error + Send + Sync>> {
                    Ok(TrellisBehaviour::new(BehaviourParts {
                        keypair: key,
                        relay_client,
                        relay_service,
                        store,
                        discovery: discovery.as_ref(),
                        pubsub: &pubsub,
                    })?)
                },
            )
            .map_err(|e| NodeError::Behaviour(e.to_string()))?
            .with_swarm_config(|config| configure(config.with_idle_connection_timeout(idle_timeout)))
            .build();

        let mut listening = 0;
        for addr in listen_addrs {
            match swarm.listen_on(addr.clone()) {
                Ok(_) => listening += 1,
                Err(e) => warn!(%addr, error = %e, "cannot listen on address, skipping"),
            }
        }
        if listening == 0 {
            return Err(NodeError::Listen("no listen address could be bound".to_string()));
        }
        let first_addr = first_listen_addr(&mut swarm).await?;
        if relay_service {
            swarm.add_external_address(first_addr.clone());
        }

        let ctx = parent.child();
        let (addrs_tx, addrs) = watch::channel(vec![first_addr]);
        let (bootstrap_tx, bootstrap_rx) = watch::channel(BootstrapState::new(peers.len()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (peer_events, _) = broadcast::channel(PEER_EVENT_CAPACITY);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let streams = swarm.behaviour().stream.new_control();

        let driver = Driver {
            swarm,
            commands: commands_rx,
            ctx: ctx.clone(),
            local_peer_id: peer_id,
            addrs: addrs_tx,
            peer_events: peer_events.clone(),
            pending_dials: HashMap::new(),
            lookups: HashMap::new(),
            pending_lookups: HashMap::new(),
            topics: HashMap::new(),
            max_topics: pubsub.max_topics,
            relay_service,
            auto_relay,
            relay_listeners: HashMap::new(),
            dialed_addrs: HashMap::new(),
            stopped: stopped_tx,
        };
        tokio::spawn(driver.run().instrument(logger.clone()));

        let node = Node {
            inner: Arc::new(Inner {
                peer_id,
                ctx,
                span: logger,
                commands: commands_tx,
                addrs,
                peer_events,
                streams,
                stopped: stopped_rx,
                bootstrap: bootstrap_rx,
                dial_timeout: transport.dial_timeout(),
                relay_service,
                next_subscription: AtomicU64::new(0),
            }),
        };
        info!(addrs = ?node.addrs(), "node started");

        tokio::spawn(
            bootstrap::run(node.clone(), peers, bootstrap_tx).instrument(node.inner.span.clone()),
        );
        Ok(node)
    }

    pub fn id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// Addresses the node currently listens on.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        self.inner.addrs.borrow().clone()
    }

    /// This node as a dial target for others.
    pub fn info(&self) -> PeerInfo {
        PeerInfo::new(self.id(), self.addrs())
    }

    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// The span node activity is logged under.
    pub fn logger(&self) -> &Span {
        &self.inner.span
    }

    pub fn is_relay_service(&self) -> bool {
        self.inner.relay_service
    }

    pub fn is_closed(&self) -> bool {
        self.inner.ctx.is_done() || *self.inner.stopped.borrow()
    }

    /// Subscribe to connection changes from now on.
    pub fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.peer_events.subscribe()
    }

    pub fn bootstrap_state(&self) -> BootstrapState {
        self.inner.bootstrap.borrow().clone()
    }

    /// Make sure a connection to `target` exists.
    ///
    /// Succeeds at once when already connected. A dial still in flight is
    /// joined when it already covers the target's addresses; new addresses
    /// start another attempt. A target without addresses is resolved through
    /// the DHT.
    pub async fn dial(&self, target: &PeerInfo) -> Result<(), DialError> {
        let peer = target.id;
        if peer == self.id() {
            return Err(DialError::Failed {
                peer,
                reason: "cannot dial the local peer".to_string(),
            });
        }

        let timeout = self.inner.dial_timeout;
        let (reply, result) = oneshot::channel();
        self.send(Command::Dial {
            target: target.clone(),
            reply,
        })
        .map_err(|_| DialError::NodeClosed)?;

        match self.inner.ctx.run(tokio::time::timeout(timeout, result)).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Err(_elapsed)) => Err(DialError::Timeout { peer, timeout }),
            Ok(Ok(Err(_))) | Err(_) => Err(DialError::NodeClosed),
        }
    }

    pub async fn is_connected(&self, peer: PeerId) -> bool {
        self.request(|reply| Command::IsConnected { peer, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.request(|reply| Command::ConnectedPeers { reply })
            .await
            .unwrap_or_default()
    }

    /// Start a DHT bootstrap round. Having no known peers is not an error.
    pub async fn bootstrap(&self) -> Result<(), NodeError> {
        self.request(|reply| Command::Bootstrap { reply }).await
    }

    /// Serve inbound streams for `protocol` with `handler`, one task per stream.
    pub fn set_stream_handler<H, Fut>(&self, protocol: StreamProtocol, handler: H) -> Result<(), NodeError>
    where
        H: Fn(PeerId, Stream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut control = self.inner.streams.clone();
        let mut incoming: IncomingStreams = control
            .accept(protocol.clone())
            .map_err(|_| NodeError::HandlerExists {
                protocol: protocol.to_string(),
            })?;

        let ctx = self.inner.ctx.clone();
        tokio::spawn(
            async move {
                while let Ok(Some((peer, stream))) = ctx.run(incoming.next()).await {
                    debug!(%peer, %protocol, "inbound stream");
                    let ctx = ctx.clone();
                    let serve = handler(peer, stream);
                    tokio::spawn(
                        async move {
                            let _ = ctx.run(serve).await;
                        }
                        .in_current_span(),
                    );
                }
            }
            .instrument(self.inner.span.clone()),
        );
        Ok(())
    }

    /// Open an outbound stream for `protocol` on a connection to `peer`.
    pub async fn new_stream(
        &self,
        ctx: &Context,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Stream, NodeError> {
        let mut control = self.inner.streams.clone();
        ctx.run(control.open_stream(peer, protocol))
            .await?
            .map_err(|e| NodeError::OpenStream {
                peer,
                reason: e.to_string(),
            })
    }

    /// Stop the node and wait for every connection and listener to close.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.inner.ctx.cancel();
        let mut stopped = self.inner.stopped.clone();
        // A dropped sender also means the driver is gone.
        match tokio::time::timeout(SHUTDOWN_GRACE, stopped.wait_for(|stopped| *stopped)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(NodeError::ShutdownTimeout(SHUTDOWN_GRACE)),
        }
    }

    pub(crate) fn send(&self, command: Command) -> Result<(), NodeError> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| NodeError::Closed)
    }

    pub(crate) fn next_subscription_id(&self) -> u64 {
        self.inner.next_subscription.fetch_add(1, Ordering::Relaxed)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, NodeError> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply))?;
        self.inner
            .ctx
            .run(response)
            .await
            .map_err(|_| NodeError::Closed)?
            .map_err(|_| NodeError::Closed)
    }
}

impl Live for Node {
    fn context(&self) -> &Context {
        &self.inner.ctx
    }

    fn is_live(&self) -> bool {
        !self.is_closed()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.peer_id)
            .field("relay_service", &self.inner.relay_service)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Poll a fresh swarm until it reports its first bound address.
async fn first_listen_addr(swarm: &mut Swarm<TrellisBehaviour>) -> Result<Multiaddr, NodeError> {
    let bound = async {
        loop {
            match swarm.select_next_some().await {
                SwarmEvent::NewListenAddr { address, .. } => break address,
                SwarmEvent::ListenerError { error, .. } => warn!(error = %error, "listener error"),
                SwarmEvent::ListenerClosed {
                    reason: Err(error), ..
                } => warn!(error = %error, "listener closed"),
                _ => {}
            }
        }
    };
    tokio::time::timeout(LISTEN_TIMEOUT, bound)
        .await
        .map_err(|_| NodeError::Listen(format!("no address bound within {LISTEN_TIMEOUT:?}")))
}

/// Outbound attempts to one peer. The first connection answers everyone.
#[derive(Default)]
struct PendingDial {
    connections: Vec<ConnectionId>,
    addrs: Vec<Multiaddr>,
    replies: Vec<DialReply>,
}

impl PendingDial {
    fn covers(&self, addrs: &[Multiaddr]) -> bool {
        addrs.iter().all(|addr| self.addrs.contains(addr))
    }
}

fn answer(replies: Vec<DialReply>, outcome: Result<(), DialError>) {
    for reply in replies {
        let _ = reply.send(outcome.clone());
    }
}

struct LocalTopic {
    name: String,
    subscribers: Vec<(u64, mpsc::UnboundedSender<Message>)>,
}

struct Driver {
    swarm: Swarm<TrellisBehaviour>,
    commands: mpsc::UnboundedReceiver<Command>,
    ctx: Context,
    local_peer_id: PeerId,
    addrs: watch::Sender<Vec<Multiaddr>>,
    peer_events: broadcast::Sender<PeerEvent>,
    pending_dials: HashMap<PeerId, PendingDial>,
    /// DHT lookups for targets dialed by identity only.
    lookups: HashMap<kad::QueryId, PeerId>,
    pending_lookups: HashMap<PeerId, Vec<DialReply>>,
    topics: HashMap<TopicHash, LocalTopic>,
    max_topics: usize,
    relay_service: bool,
    auto_relay: bool,
    /// Circuit listeners, one per relay we hold a reservation on.
    relay_listeners: HashMap<PeerId, ListenerId>,
    /// Direct addresses we reached peers on.
    dialed_addrs: HashMap<PeerId, Multiaddr>,
    stopped: watch::Sender<bool>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                reason = self.ctx.done() => {
                    debug!(?reason, "node context ended");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
            }
        }

        info!("node stopping");
        for (_, pending) in self.pending_dials.drain() {
            answer(pending.replies, Err(DialError::NodeClosed));
        }
        for (_, replies) in self.pending_lookups.drain() {
            answer(replies, Err(DialError::NodeClosed));
        }
        self.topics.clear();
        drop(self.swarm);
        let _ = self.stopped.send(true);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { target, reply } => self.dial(target, reply),
            Command::IsConnected { peer, reply } => {
                let _ = reply.send(self.swarm.is_connected(&peer));
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().copied().collect());
            }
            Command::Bootstrap { reply } => {
                match self.swarm.behaviour_mut().kademlia.bootstrap() {
                    Ok(query) => debug!(?query, "dht bootstrap started"),
                    Err(_) => debug!("dht bootstrap skipped, no known peers"),
                }
                let _ = reply.send(());
            }
            Command::Subscribe {
                topic,
                id,
                messages,
                reply,
            } => {
                let _ = reply.send(self.subscribe(topic, id, messages));
            }
            Command::Unsubscribe { topic, id } => self.unsubscribe(topic, id),
            Command::Publish { topic, data, reply } => {
                let _ = reply.send(self.publish(topic, data));
            }
        }
    }

    fn dial(&mut self, target: PeerInfo, reply: DialReply) {
        let peer = target.id;
        if self.swarm.is_connected(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }
        if let Some(pending) = self.pending_dials.get_mut(&peer) {
            if pending.covers(&target.addrs) {
                pending.replies.push(reply);
                return;
            }
        }
        if target.addrs.is_empty() {
            if let Some(waiting) = self.pending_lookups.get_mut(&peer) {
                waiting.push(reply);
                return;
            }
        }
        self.start_dial(peer, target.addrs, vec![reply]);
    }

    fn start_dial(&mut self, peer: PeerId, addrs: Vec<Multiaddr>, replies: Vec<DialReply>) {
        // Without explicit addresses the behaviours (routing table, identify
        // cache) supply them.
        let opts = if addrs.is_empty() {
            DialOpts::peer_id(peer).condition(PeerCondition::Always).build()
        } else {
            DialOpts::peer_id(peer)
                .addresses(addrs.clone())
                .condition(PeerCondition::Always)
                .build()
        };
        let connection = opts.connection_id();

        match self.swarm.dial(opts) {
            Ok(()) => {
                debug!(%peer, addrs = addrs.len(), "dialing");
                let pending = self.pending_dials.entry(peer).or_default();
                pending.connections.push(connection);
                for addr in addrs {
                    if !pending.addrs.contains(&addr) {
                        pending.addrs.push(addr);
                    }
                }
                pending.replies.extend(replies);
            }
            Err(SwarmDialError::NoAddresses) if addrs.is_empty() => self.look_up(peer, replies),
            Err(e) => {
                debug!(%peer, error = %e, "dial rejected");
                answer(
                    replies,
                    Err(DialError::Failed {
                        peer,
                        reason: e.to_string(),
                    }),
                );
            }
        }
    }

    fn look_up(&mut self, peer: PeerId, replies: Vec<DialReply>) {
        debug!(%peer, "no known address, querying the dht");
        let query = self.swarm.behaviour_mut().kademlia.get_closest_peers(peer);
        self.lookups.insert(query, peer);
        self.pending_lookups.entry(peer).or_default().extend(replies);
    }

    fn finish_lookup(&mut self, query: kad::QueryId, result: kad::GetClosestPeersResult) {
        let Some(peer) = self.lookups.remove(&query) else {
            return;
        };
        let Some(replies) = self.pending_lookups.remove(&peer) else {
            return;
        };

        let found = match result {
            Ok(ok) => ok.peers,
            Err(kad::GetClosestPeersError::Timeout { peers, .. }) => peers,
        };
        let addrs: Vec<Multiaddr> = found
            .into_iter()
            .filter(|info| info.peer_id == peer)
            .flat_map(|info| info.addrs)
            .collect();

        if self.swarm.is_connected(&peer) {
            answer(replies, Ok(()));
        } else if addrs.is_empty() {
            debug!(%peer, "dht lookup found no address");
            answer(
                replies,
                Err(DialError::Failed {
                    peer,
                    reason: "no address found in the dht".to_string(),
                }),
            );
        } else {
            debug!(%peer, addrs = addrs.len(), "dht lookup resolved peer");
            self.start_dial(peer, addrs, replies);
        }
    }

    fn subscribe(
        &mut self,
        name: String,
        id: u64,
        messages: mpsc::UnboundedSender<Message>,
    ) -> Result<(), SubscriptionError> {
        let topic = IdentTopic::new(name.as_str());
        let hash = topic.hash();

        if let Some(local) = self.topics.get_mut(&hash) {
            local.subscribers.push((id, messages));
            return Ok(());
        }
        if self.topics.len() >= self.max_topics {
            return Err(SubscriptionError::JoinFailed {
                topic: name,
                reason: format!("already joined the maximum of {} topics", self.max_topics),
            });
        }

        self.swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e| SubscriptionError::JoinFailed {
                topic: name.clone(),
                reason: format!("{e:?}"),
            })?;
        debug!(topic = %name, "joined topic");
        self.topics.insert(
            hash,
            LocalTopic {
                name,
                subscribers: vec![(id, messages)],
            },
        );
        Ok(())
    }

    fn unsubscribe(&mut self, name: String, id: u64) {
        let topic = IdentTopic::new(name.as_str());
        let hash = topic.hash();
        let Some(local) = self.topics.get_mut(&hash) else {
            return;
        };

        local.subscribers.retain(|(subscriber, _)| *subscriber != id);
        if local.subscribers.is_empty() {
            self.topics.remove(&hash);
            let _ = self.swarm.behaviour_mut().gossipsub.unsubscribe(&topic);
            debug!(topic = %name, "left topic");
        }
    }

    fn publish(&mut self, name: String, data: Vec<u8>) -> Result<(), PublishError> {
        let topic = IdentTopic::new(name.as_str());
        let hash = topic.hash();
        let size = data.len();

        let remote = match self.swarm.behaviour_mut().gossipsub.publish(topic, data.clone()) {
            Ok(_) => Ok(()),
            Err(gossipsub::PublishError::InsufficientPeers) => Err(PublishError::NoPeers { topic: name.clone() }),
            Err(gossipsub::PublishError::MessageTooLarge) => return Err(PublishError::TooLarge { size }),
            Err(e) => {
                return Err(PublishError::Failed {
                    reason: format!("{e:?}"),
                })
            }
        };

        let local = self.deliver(
            &hash,
            Message {
                data,
                sender: self.local_peer_id,
                topic: name,
            },
        );
        match remote {
            Err(PublishError::NoPeers { .. }) if local > 0 => Ok(()),
            other => other,
        }
    }

    /// Hand `message` to every local subscriber of `hash`; returns how many
    /// are still listening.
    fn deliver(&mut self, hash: &TopicHash, message: Message) -> usize {
        let Some(local) = self.topics.get_mut(hash) else {
            return 0;
        };
        local
            .subscribers
            .retain(|(_, messages)| messages.send(message.clone()).is_ok());
        local.subscribers.len()
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<TrellisBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "listening");
                // Relays only grant reservations once they have an external address.
                if self.relay_service && !is_relayed(&address) {
                    self.swarm.add_external_address(address.clone());
                }
                self.addrs.send_if_modified(|addrs| {
                    if addrs.contains(&address) {
                        return false;
                    }
                    addrs.push(address);
                    true
                });
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                debug!(%address, "listen address expired");
                self.forget_addrs(&[address]);
            }
            SwarmEvent::ListenerClosed {
                listener_id,
                addresses,
                reason,
            } => {
                debug!(?listener_id, ?reason, "listener closed");
                self.forget_addrs(&addresses);
                self.relay_listeners.retain(|_, id| *id != listener_id);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                let remote = endpoint.get_remote_address();
                let kind = ConnectionKind::of(remote);
                info!(peer = %peer_id, addr = %remote, kind = %kind.description(), "connection established");

                if endpoint.is_dialer() && !kind.is_relayed() {
                    self.dialed_addrs.insert(peer_id, remote.clone());
                }
                if let Some(pending) = self.pending_dials.remove(&peer_id) {
                    answer(pending.replies, Ok(()));
                }
                if let Some(replies) = self.pending_lookups.remove(&peer_id) {
                    answer(replies, Ok(()));
                }
                let _ = self.peer_events.send(PeerEvent::Connected { peer: peer_id, kind });
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                debug!(peer = %peer_id, ?cause, remaining = num_established, "connection closed");
                if num_established == 0 {
                    info!(peer = %peer_id, "peer disconnected");
                    self.dialed_addrs.remove(&peer_id);
                    if let Some(listener) = self.relay_listeners.remove(&peer_id) {
                        self.swarm.remove_listener(listener);
                    }
                    let _ = self.peer_events.send(PeerEvent::Disconnected { peer: peer_id });
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id: Some(peer),
                error,
            } => {
                debug!(%peer, error = %error, "outgoing connection failed");
                let exhausted = match self.pending_dials.get_mut(&peer) {
                    Some(pending) if pending.connections.contains(&connection_id) => {
                        pending.connections.retain(|id| *id != connection_id);
                        pending.connections.is_empty()
                    }
                    _ => false,
                };
                // Other attempts to the same peer may still succeed.
                if exhausted {
                    if let Some(pending) = self.pending_dials.remove(&peer) {
                        answer(
                            pending.replies,
                            Err(DialError::Failed {
                                peer,
                                reason: error.to_string(),
                            }),
                        );
                    }
                }
            }
            SwarmEvent::IncomingConnectionError {
                send_back_addr, error, ..
            } => {
                debug!(addr = %send_back_addr, error = %error, "incoming connection failed");
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: TrellisBehaviourEvent) {
        match event {
            TrellisBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                trace!(peer = %peer_id, protocols = info.protocols.len(), "identified peer");
                if info.protocols.contains(&KAD_PROTOCOL) {
                    let kademlia = &mut self.swarm.behaviour_mut().kademlia;
                    for addr in info.listen_addrs.iter().filter(|a| !is_relayed(a)) {
                        kademlia.add_address(&peer_id, addr.clone());
                    }
                }
                if self.auto_relay && info.protocols.contains(&relay::HOP_PROTOCOL_NAME) {
                    let fallback = info.listen_addrs.iter().find(|a| !is_relayed(a)).cloned();
                    self.reserve_on(peer_id, fallback);
                }
            }
            TrellisBehaviourEvent::RelayClient(relay::client::Event::ReservationReqAccepted {
                relay_peer_id,
                renewal,
                ..
            }) => {
                if !renewal {
                    info!(relay = %relay_peer_id, "relay reservation accepted");
                    let _ = self.peer_events.send(PeerEvent::RelayReserved {
                        relay: relay_peer_id,
                    });
                }
            }
            TrellisBehaviourEvent::RelayClient(event) => debug!(?event, "relay client"),
            TrellisBehaviourEvent::Relay(relay::Event::ReservationReqAccepted { src_peer_id, .. }) => {
                info!(peer = %src_peer_id, "granted relay reservation");
            }
            TrellisBehaviourEvent::Relay(relay::Event::CircuitReqAccepted {
                src_peer_id,
                dst_peer_id,
                ..
            }) => {
                debug!(src = %src_peer_id, dst = %dst_peer_id, "relaying circuit");
            }
            TrellisBehaviourEvent::Relay(event) => trace!(?event, "relay"),
            TrellisBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            }) => {
                let Some(topic) = self.topics.get(&message.topic).map(|t| t.name.clone()) else {
                    return;
                };
                let sender = message.source.unwrap_or(propagation_source);
                trace!(%topic, %sender, bytes = message.data.len(), "gossip message");
                self.deliver(
                    &message.topic,
                    Message {
                        data: message.data,
                        sender,
                        topic,
                    },
                );
            }
            TrellisBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed { peer_id, topic }) => {
                debug!(peer = %peer_id, %topic, "peer joined topic");
            }
            TrellisBehaviourEvent::Mdns(mdns::Event::Discovered(found)) => {
                for (peer, addr) in found {
                    debug!(%peer, %addr, "discovered peer via mDNS");
                    self.swarm.behaviour_mut().kademlia.add_address(&peer, addr.clone());
                    if !self.swarm.is_connected(&peer) {
                        if let Err(e) = self.swarm.dial(DialOpts::peer_id(peer).addresses(vec![addr]).build()) {
                            trace!(%peer, error = %e, "mDNS dial skipped");
                        }
                    }
                }
            }
            TrellisBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result: kad::QueryResult::GetClosestPeers(result),
                ..
            }) => self.finish_lookup(id, result),
            TrellisBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                result: kad::QueryResult::Bootstrap(result),
                ..
            }) => match result {
                Ok(ok) => debug!(remaining = ok.num_remaining, "dht bootstrap progressed"),
                Err(e) => debug!(error = ?e, "dht bootstrap failed"),
            },
            _ => {}
        }
    }

    /// Listen through `relay` so peers can reach us over a circuit.
    fn reserve_on(&mut self, relay: PeerId, fallback: Option<Multiaddr>) {
        if self.relay_listeners.contains_key(&relay) {
            return;
        }
        let Some(relay_addr) = self.dialed_addrs.get(&relay).cloned().or(fallback) else {
            debug!(%relay, "no direct address for relay, not reserving");
            return;
        };

        let listen_addr = circuit_listen_addr(&relay_addr, relay);
        match self.swarm.listen_on(listen_addr.clone()) {
            Ok(listener) => {
                debug!(%relay, addr = %listen_addr, "requesting relay reservation");
                self.relay_listeners.insert(relay, listener);
            }
            Err(e) => warn!(%relay, error = %e, "cannot listen through relay"),
        }
    }

    fn forget_addrs(&self, gone: &[Multiaddr]) {
        self.addrs.send_if_modified(|addrs| {
            let before = addrs.len();
            addrs.retain(|addr| !gone.contains(addr));
            addrs.len() != before
        });
    }
}
