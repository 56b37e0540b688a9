//! Peer routing over a Kademlia DHT.
//!
//! Every node participates in the overlay in server mode, publishes
//! provider records for the content keys it can serve and resolves a key to
//! a lazy stream of peer IP addresses. The router is only a hint: content
//! presence is always re-checked by the serving node.

pub mod behaviour;

pub use behaviour::RouterBehaviour;

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::kad::{self, GetProvidersOk, QueryId, QueryResult, RecordKey};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::{Swarm, SwarmEvent};
use libp2p::{identify, noise, tcp, yamux, Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::key::ContentKey;
use crate::routing::behaviour::RouterBehaviourEvent;

/// Lifetime of an advertised key in the DHT. The advertiser refreshes well
/// before this expires.
pub const KEY_TTL: Duration = Duration::from_secs(10 * 60);

/// Peer lookup interface the registry depends on.
#[async_trait]
pub trait Router: Send + Sync {
    /// Publish provider records for the given keys. Partial failure is
    /// reported as [`Error::Advertise`] naming the keys that failed.
    async fn advertise(&self, keys: Vec<String>) -> Result<()>;

    /// Open a lazy, finite stream of peers able to serve `key`.
    ///
    /// Peers arrive in DHT order. Records for this node itself are filtered
    /// unless `allow_self` is set. `max_retries` bounds how many consecutive
    /// empty lookup rounds are attempted before the stream closes; the
    /// caller bounds wall-clock time with its own resolve timeout.
    async fn resolve(
        &self,
        key: &str,
        allow_self: bool,
        max_retries: usize,
    ) -> Result<mpsc::Receiver<IpAddr>>;

    /// True once the routing table holds at least one other peer.
    async fn ready(&self) -> Result<bool>;

    /// Release all network resources.
    fn close(&self);
}

/// Supplies the address of one existing peer at startup.
///
/// Implementations may use leader election, a static address or DNS. The
/// router treats it as opaque.
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Called once with this node's own dialable multiaddress.
    async fn run(&self, self_addr: Multiaddr) -> Result<()>;

    /// Address of the peer to join through. `None` means this node leads a
    /// fresh cluster and waits for inbound connections.
    async fn get_address(&self) -> Result<Option<Multiaddr>>;
}

/// Bootstrapper backed by a fixed peer address.
#[derive(Debug, Clone, Default)]
pub struct StaticBootstrapper {
    peer: Option<Multiaddr>,
}

impl StaticBootstrapper {
    pub fn new(peer: Option<Multiaddr>) -> Self {
        Self { peer }
    }
}

#[async_trait]
impl Bootstrapper for StaticBootstrapper {
    async fn run(&self, _self_addr: Multiaddr) -> Result<()> {
        Ok(())
    }

    async fn get_address(&self) -> Result<Option<Multiaddr>> {
        Ok(self.peer.clone())
    }
}

/// Which peer addresses are considered usable.
///
/// The default picks the first IPv4, non-loopback address and ignores the
/// rest; IPv6 is not supported. Loopback can be admitted for single-host
/// setups and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressPolicy {
    pub allow_loopback: bool,
}

impl AddressPolicy {
    /// Select the first usable IP out of a peer's multiaddresses.
    pub fn select(&self, addrs: &[Multiaddr]) -> Option<IpAddr> {
        addrs.iter().find_map(|addr| self.ip_of(addr))
    }

    fn ip_of(&self, addr: &Multiaddr) -> Option<IpAddr> {
        addr.iter().find_map(|protocol| match protocol {
            Protocol::Ip4(ip) if self.allow_loopback || !ip.is_loopback() => {
                Some(IpAddr::V4(ip))
            }
            _ => None,
        })
    }
}

/// Router command for async operations
enum RouterCommand {
    Advertise {
        keys: Vec<String>,
        response: oneshot::Sender<Result<()>>,
    },
    Resolve {
        key: String,
        allow_self: bool,
        max_retries: usize,
        peers: mpsc::Sender<IpAddr>,
        response: oneshot::Sender<Result<()>>,
    },
    Ready {
        response: oneshot::Sender<bool>,
    },
}

/// An in-flight provider lookup feeding one resolve stream.
struct ResolveState {
    key: RecordKey,
    peers: mpsc::Sender<IpAddr>,
    allow_self: bool,
    retries_left: usize,
    found_in_round: bool,
}

/// DHT-backed [`Router`] running a libp2p swarm on a background task.
pub struct P2pRouter {
    command_tx: mpsc::UnboundedSender<RouterCommand>,
    task: tokio::task::JoinHandle<()>,
    local_peer_id: PeerId,
    self_addr: Multiaddr,
}

impl P2pRouter {
    /// Create a router listening on `addr` (`host:port`, empty host binds
    /// all interfaces) and join the overlay through `bootstrapper`.
    pub async fn new(
        addr: &str,
        bootstrapper: &dyn Bootstrapper,
        policy: AddressPolicy,
    ) -> Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::malformed(format!("router address must be host:port: {addr}")))?;
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        let listen_addr: Multiaddr = format!("/ip4/{host}/tcp/{port}").parse()?;

        let mut swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|key| RouterBehaviour::new(key))
            .map_err(|e| Error::Libp2p(format!("Behaviour error: {e}")))?
            .with_swarm_config(|config| {
                config.with_idle_connection_timeout(Duration::from_secs(60))
            })
            .build();

        let local_peer_id = *swarm.local_peer_id();
        swarm.listen_on(listen_addr)?;

        // Wait for the listener so the bootstrapper sees a dialable address
        // even when the port was chosen by the OS.
        let first_listen = loop {
            if let SwarmEvent::NewListenAddr { address, .. } = swarm.select_next_some().await {
                break address;
            }
        };
        let self_addr = first_listen.clone().with(Protocol::P2p(local_peer_id));
        tracing::info!(addr = %self_addr, "starting p2p router");

        bootstrapper.run(self_addr.clone()).await?;

        let mut task = RouterTask {
            swarm,
            policy,
            pending_resolves: HashMap::new(),
            addresses: HashMap::new(),
            listen_addrs: Vec::new(),
        };
        task.register_listen_addr(first_listen);

        match bootstrapper.get_address().await? {
            Some(peer_addr) => task.join(peer_addr, local_peer_id)?,
            None => {
                tracing::info!("no bootstrap peer configured, waiting for inbound connections");
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(task.run(command_rx));

        Ok(Self {
            command_tx,
            task: handle,
            local_peer_id,
            self_addr,
        })
    }

    /// This node's peer identity.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// This node's dialable multiaddress, including the `/p2p/` component.
    pub fn local_multiaddr(&self) -> &Multiaddr {
        &self.self_addr
    }
}

#[async_trait]
impl Router for P2pRouter {
    async fn advertise(&self, keys: Vec<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(RouterCommand::Advertise {
            keys,
            response: tx,
        })?;
        rx.await?
    }

    async fn resolve(
        &self,
        key: &str,
        allow_self: bool,
        max_retries: usize,
    ) -> Result<mpsc::Receiver<IpAddr>> {
        let (peer_tx, peer_rx) = mpsc::channel(64);
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(RouterCommand::Resolve {
            key: key.to_owned(),
            allow_self,
            max_retries,
            peers: peer_tx,
            response: tx,
        })?;
        rx.await??;
        Ok(peer_rx)
    }

    async fn ready(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RouterCommand::Ready { response: tx })?;
        Ok(rx.await?)
    }

    fn close(&self) {
        self.task.abort();
    }
}

/// State owned by the background swarm task.
struct RouterTask {
    swarm: Swarm<RouterBehaviour>,
    policy: AddressPolicy,
    pending_resolves: HashMap<QueryId, ResolveState>,
    /// Addresses learned from identify and DHT traffic, keyed by peer.
    addresses: HashMap<PeerId, Vec<Multiaddr>>,
    /// Our own listen addresses, used when a lookup returns self.
    listen_addrs: Vec<Multiaddr>,
}

impl RouterTask {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<RouterCommand>) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                Some(command) = command_rx.recv() => {
                    self.handle_command(command);
                }
            }
        }
    }

    /// Dial the bootstrap peer and seed the routing table with it.
    fn join(&mut self, peer_addr: Multiaddr, local_peer_id: PeerId) -> Result<()> {
        let Some(Protocol::P2p(peer_id)) = peer_addr.iter().last() else {
            return Err(Error::dht(format!(
                "bootstrap address is missing its /p2p component: {peer_addr}"
            )));
        };
        if peer_id == local_peer_id {
            tracing::info!("bootstrap peer is self, waiting for inbound connections");
            return Ok(());
        }

        let mut dial_target = peer_addr.clone();
        dial_target.pop();
        self.swarm
            .behaviour_mut()
            .kademlia
            .add_address(&peer_id, dial_target);
        if let Err(err) = self.swarm.dial(peer_addr.clone()) {
            tracing::warn!(addr = %peer_addr, error = %err, "failed to dial bootstrap peer");
        }
        if let Err(err) = self.swarm.behaviour_mut().kademlia.bootstrap() {
            tracing::warn!(error = %err, "failed to start dht bootstrap");
        }
        Ok(())
    }

    fn register_listen_addr(&mut self, address: Multiaddr) {
        // Publish a single usable address so peer records stay small; the
        // policy drops loopback-only candidates.
        if self.listen_addrs.is_empty()
            && self.policy.select(std::slice::from_ref(&address)).is_some()
        {
            self.swarm.add_external_address(address.clone());
        }
        tracing::info!(addr = %address, "dht listening");
        self.listen_addrs.push(address);
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<RouterBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(RouterBehaviourEvent::Kademlia(kad_event)) => {
                self.handle_kad_event(kad_event);
            }
            SwarmEvent::Behaviour(RouterBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                // Feed identified addresses into both the routing table and
                // the resolver's address book.
                for addr in &info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                }
                let known = self.addresses.entry(peer_id).or_default();
                for addr in info.listen_addrs {
                    if !known.contains(&addr) {
                        known.push(addr);
                    }
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                self.register_listen_addr(address);
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                tracing::debug!(peer = %peer_id, "connected to peer");
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                tracing::debug!(peer = %peer_id, "disconnected from peer");
            }
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => match result {
                QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders {
                    providers,
                    ..
                })) => {
                    for provider in providers {
                        self.emit_provider(id, provider);
                    }
                    if step.last {
                        self.finish_resolve_round(id);
                    }
                }
                QueryResult::GetProviders(Ok(
                    GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
                )) => {
                    self.finish_resolve_round(id);
                }
                QueryResult::GetProviders(Err(err)) => {
                    tracing::debug!(error = %err, "provider lookup failed");
                    self.finish_resolve_round(id);
                }
                QueryResult::StartProviding(Err(err)) => {
                    tracing::warn!(error = %err, "provider record publication failed");
                }
                _ => {}
            },
            kad::Event::RoutingUpdated {
                peer, addresses, ..
            } => {
                self.addresses.insert(peer, addresses.into_vec());
            }
            _ => {}
        }
    }

    /// Validate one provider record and forward its address downstream.
    fn emit_provider(&mut self, id: QueryId, provider: PeerId) {
        let local_peer_id = *self.swarm.local_peer_id();
        let Some(state) = self.pending_resolves.get_mut(&id) else {
            return;
        };
        if provider == local_peer_id && !state.allow_self {
            return;
        }
        let addrs = if provider == local_peer_id {
            &self.listen_addrs
        } else {
            match self.addresses.get(&provider) {
                Some(addrs) => addrs,
                None => return,
            }
        };
        let Some(ip) = self.policy.select(addrs) else {
            return;
        };
        state.found_in_round = true;
        // A full buffer means the consumer already has more candidates than
        // it will try; dropping the overflow is fine.
        let _ = state.peers.try_send(ip);
    }

    /// A lookup round completed. Empty rounds retry until the budget is
    /// spent; a round that produced peers ends the stream, the DHT has no
    /// more providers to offer.
    fn finish_resolve_round(&mut self, id: QueryId) {
        let Some(mut state) = self.pending_resolves.remove(&id) else {
            return;
        };
        if state.peers.is_closed() || state.found_in_round || state.retries_left == 0 {
            return;
        }
        state.retries_left -= 1;
        let query_id = self
            .swarm
            .behaviour_mut()
            .kademlia
            .get_providers(state.key.clone());
        self.pending_resolves.insert(query_id, state);
    }

    fn handle_command(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Advertise { keys, response } => {
                let mut failed = Vec::new();
                for key in &keys {
                    let record_key = match ContentKey::new(key) {
                        Ok(content_key) => content_key.to_record_key(),
                        Err(err) => {
                            tracing::warn!(key, error = %err, "cannot derive content key");
                            failed.push(key.clone());
                            continue;
                        }
                    };
                    if let Err(err) = self
                        .swarm
                        .behaviour_mut()
                        .kademlia
                        .start_providing(record_key)
                    {
                        tracing::warn!(key, error = %err, "failed to advertise key");
                        failed.push(key.clone());
                    }
                }
                let result = if failed.is_empty() {
                    Ok(())
                } else {
                    Err(Error::Advertise { failed })
                };
                let _ = response.send(result);
            }
            RouterCommand::Resolve {
                key,
                allow_self,
                max_retries,
                peers,
                response,
            } => {
                let record_key = match ContentKey::new(&key) {
                    Ok(content_key) => content_key.to_record_key(),
                    Err(err) => {
                        let _ = response.send(Err(err));
                        return;
                    }
                };
                let query_id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(record_key.clone());
                self.pending_resolves.insert(
                    query_id,
                    ResolveState {
                        key: record_key,
                        peers,
                        allow_self,
                        retries_left: max_retries,
                        found_in_round: false,
                    },
                );
                let _ = response.send(Ok(()));
            }
            RouterCommand::Ready { response } => {
                let ready = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .kbuckets()
                    .any(|bucket| bucket.iter().next().is_some());
                let _ = response.send(ready);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_picks_first_ipv4() {
        let policy = AddressPolicy::default();
        let addrs: Vec<Multiaddr> = vec![
            "/ip6/::1/tcp/4001".parse().unwrap(),
            "/ip4/10.0.0.7/tcp/4001".parse().unwrap(),
            "/ip4/10.0.0.8/tcp/4001".parse().unwrap(),
        ];
        assert_eq!(policy.select(&addrs), Some("10.0.0.7".parse().unwrap()));
    }

    #[test]
    fn test_policy_rejects_loopback_by_default() {
        let policy = AddressPolicy::default();
        let addrs: Vec<Multiaddr> = vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()];
        assert_eq!(policy.select(&addrs), None);

        let relaxed = AddressPolicy {
            allow_loopback: true,
        };
        assert_eq!(relaxed.select(&addrs), Some("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_policy_ignores_ipv6_only_peers() {
        let policy = AddressPolicy {
            allow_loopback: true,
        };
        let addrs: Vec<Multiaddr> = vec!["/ip6/2001:db8::1/tcp/4001".parse().unwrap()];
        assert_eq!(policy.select(&addrs), None);
    }
}
