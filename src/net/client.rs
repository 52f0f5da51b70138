//! Client coordinator
//!
//! Owns the peer pool, the shared chain store, the bloom filter, the
//! subscription table, and the inventory. Dials shuffled candidate addresses
//! until the pool is full, refills after disconnects (re-running DNS
//! discovery when the candidate list runs dry), selects download peers, and
//! fans filter reloads out to every connection.
//!
//! Lock order, where multiple locks are held together:
//! chain → filter → subscriptions → inventory → peers → candidates → listeners.
//! Guards are never held across an await.

use super::dns::DnsSeeds;
use super::peer::{spawn_peer, PeerCommand, PeerHandle};
use super::types::{
    default_user_agent, InvEntry, NetworkParams, PeerState, BROADCAST_TIMEOUT_SECS,
    DEFAULT_MAX_CONNECTIONS,
};
use super::wire::Message;
use super::inventory::Inventory;
use crate::chain::{ChainError, ChainStore};
use crate::filter::{BloomFilter, BLOOM_UPDATE_NONE};
use crate::listener::{Listener, Listeners};
use crate::subscription::{SubscriptionTable, TxCallback, TxSubscription};
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash as _;
use bitcoin::Transaction;
use rand::seq::SliceRandom;
use rand::Rng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Default filter sizing when nothing is subscribed yet.
const DEFAULT_FILTER_CAPACITY: usize = 10;
const DEFAULT_FILTER_FP_RATE: f64 = 0.1;

/// Seconds allowed for a TCP dial.
const DIAL_TIMEOUT_SECS: u64 = 10;

/// Lock a std mutex, recovering the data from a poisoned guard.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transaction decode: {0}")]
    Decode(#[from] encode::Error),
    #[error("invalid address: {0}")]
    Address(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Peer-task notifications consumed by the coordinator loop.
#[derive(Debug)]
pub enum NetEvent {
    PeerConnected(SocketAddr),
    PeerDisconnected(SocketAddr),
    DownloadComplete(SocketAddr),
}

/// Coordinator configuration.
#[derive(Clone)]
pub struct ClientConfig {
    pub params: NetworkParams,
    pub user_agent: String,
    pub max_connections: usize,
    /// Chain snapshot location; in-memory only when absent.
    pub snapshot_path: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new(params: NetworkParams) -> ClientConfig {
        ClientConfig {
            params,
            user_agent: default_user_agent(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            snapshot_path: None,
        }
    }
}

/// State shared between the coordinator and every peer task.
pub struct ClientState {
    pub params: NetworkParams,
    pub user_agent: String,
    pub chain: Mutex<ChainStore>,
    pub filter: Mutex<BloomFilter>,
    pub subscriptions: Mutex<SubscriptionTable>,
    pub inventory: Mutex<Inventory>,
    pub(crate) listeners: Mutex<Listeners>,
}

/// SPV client: peer pool plus subscription coordinator.
pub struct Client {
    state: Arc<ClientState>,
    peers: Mutex<Vec<PeerHandle>>,
    candidates: Mutex<Vec<SocketAddr>>,
    max_connections: usize,
    events_tx: mpsc::Sender<NetEvent>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<NetEvent>>,
}

impl Client {
    /// Build a client over a candidate address list (usually DNS discovery
    /// output). Connections are dialed by [`Client::run`].
    pub fn new(mut candidates: Vec<SocketAddr>, config: ClientConfig) -> Client {
        let chain = match &config.snapshot_path {
            Some(path) => ChainStore::open(config.params.chain.clone(), path.clone()),
            None => ChainStore::new(config.params.chain.clone()),
        };
        let filter = BloomFilter::new(
            DEFAULT_FILTER_CAPACITY,
            DEFAULT_FILTER_FP_RATE,
            rand::random(),
            BLOOM_UPDATE_NONE,
        );
        candidates.shuffle(&mut rand::thread_rng());

        let (events_tx, events_rx) = mpsc::channel(256);
        Client {
            state: Arc::new(ClientState {
                params: config.params,
                user_agent: config.user_agent,
                chain: Mutex::new(chain),
                filter: Mutex::new(filter),
                subscriptions: Mutex::new(SubscriptionTable::new()),
                inventory: Mutex::new(Inventory::new()),
                listeners: Mutex::new(Listeners::default()),
            }),
            peers: Mutex::new(Vec::new()),
            candidates: Mutex::new(candidates),
            max_connections: config.max_connections,
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }

    /// Drive the coordinator: dial the pool full, then react to peer events
    /// and run periodic maintenance (broadcast expiry, pool refill, download
    /// resumption) until shutdown.
    pub async fn run(&self) {
        self.fill_peer_pool().await;

        let mut events = self.events_rx.lock().await;
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => return,
                },
                _ = tick.tick() => {
                    {
                        let mut subs = lock(&self.state.subscriptions);
                        subs.expire_broadcasts(Instant::now());
                    }
                    self.fill_peer_pool().await;
                    self.check_for_more_blocks().await;
                }
            }
        }
    }

    async fn handle_event(&self, event: NetEvent) {
        match event {
            NetEvent::PeerConnected(addr) => {
                let count = self.peer_count();
                {
                    let listeners = lock(&self.state.listeners);
                    listeners.on_peer_connected(addr, count);
                }
                self.check_for_more_blocks().await;
            }
            NetEvent::PeerDisconnected(addr) => {
                {
                    let mut peers = lock(&self.peers);
                    peers.retain(|p| p.addr != addr);
                }
                let count = self.peer_count();
                debug!("peer {} removed, {} remain", addr, count);
                {
                    let listeners = lock(&self.state.listeners);
                    listeners.on_peer_disconnected(addr, count);
                }
                self.fill_peer_pool().await;
                self.check_for_more_blocks().await;
            }
            NetEvent::DownloadComplete(addr) => {
                debug!("download peer {} finished or failed", addr);
                self.check_for_more_blocks().await;
            }
        }
    }

    // =========================================================================
    // PEER POOL
    // =========================================================================

    pub fn peer_count(&self) -> usize {
        let peers = lock(&self.peers);
        peers
            .iter()
            .filter(|p| p.state() != PeerState::Shutdown)
            .count()
    }

    fn connected_peers(&self) -> Vec<PeerHandle> {
        let peers = lock(&self.peers);
        peers.iter().filter(|p| p.is_connected()).cloned().collect()
    }

    /// Dial candidates until the pool reaches its target size. An exhausted
    /// candidate list is refreshed from DNS once per call.
    async fn fill_peer_pool(&self) {
        let mut refreshed = false;
        loop {
            if self.peer_count() >= self.max_connections {
                return;
            }
            let next = {
                let mut candidates = lock(&self.candidates);
                if candidates.is_empty() {
                    None
                } else {
                    Some(candidates.remove(0))
                }
            };
            let Some(addr) = next else {
                if refreshed {
                    return;
                }
                refreshed = true;
                self.refresh_candidates().await;
                continue;
            };
            if lock(&self.peers).iter().any(|p| p.addr == addr) {
                continue;
            }
            match tokio::time::timeout(
                Duration::from_secs(DIAL_TIMEOUT_SECS),
                TcpStream::connect(addr),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    debug!("dialed {}", addr);
                    let handle =
                        spawn_peer(addr, stream, self.state.clone(), self.events_tx.clone());
                    lock(&self.peers).push(handle);
                }
                Ok(Err(e)) => debug!("connection to {} failed: {}", addr, e),
                Err(_) => debug!("connection to {} timed out", addr),
            }
        }
    }

    async fn refresh_candidates(&self) {
        let resolved = DnsSeeds::for_params(&self.state.params).resolve_async().await;
        let mut fresh: Vec<SocketAddr> = {
            let peers = lock(&self.peers);
            resolved
                .into_iter()
                .filter(|a| !peers.iter().any(|p| p.addr == *a))
                .collect()
        };
        fresh.shuffle(&mut rand::thread_rng());
        info!("candidate refresh: {} addresses", fresh.len());
        let mut candidates = lock(&self.candidates);
        candidates.extend(fresh);
        candidates.dedup();
    }

    // =========================================================================
    // CHAIN DOWNLOAD
    // =========================================================================

    /// If no peer is downloading and some connected peer advertises a higher
    /// starting height than our tip, ask one of them (at random) to download.
    async fn check_for_more_blocks(&self) {
        let tip = {
            let chain = lock(&self.state.chain);
            chain.tip_height()
        };
        let (busy, eligible) = {
            let peers = lock(&self.peers);
            let busy = peers.iter().any(|p| p.state() == PeerState::Downloading);
            let eligible: Vec<PeerHandle> = peers
                .iter()
                .filter(|p| {
                    p.state() == PeerState::Connected
                        && p.has_version()
                        && p.start_height() > tip as i32
                })
                .cloned()
                .collect();
            (busy, eligible)
        };
        if busy || eligible.is_empty() {
            return;
        }
        let index = rand::thread_rng().gen_range(0..eligible.len());
        let peer = &eligible[index];
        debug!("requesting chain download from {}", peer.addr);
        peer.command(PeerCommand::Download).await;
    }

    // =========================================================================
    // SUBSCRIPTIONS AND BROADCAST
    // =========================================================================

    /// Decode and broadcast a raw transaction. The inv goes to the first half
    /// of the pool; the second half gets the refreshed filter and should echo
    /// the tx back. The returned receiver resolves true once a quarter of the
    /// pool has announced it, false after ten seconds.
    pub async fn broadcast_tx(
        &self,
        raw: &[u8],
    ) -> Result<oneshot::Receiver<bool>, ClientError> {
        let tx: Transaction = encode::deserialize(raw)?;
        let (promise, result) = oneshot::channel();
        let peer_count = self.peer_count();
        let threshold = (peer_count.div_ceil(4)).max(1) as u32;
        let txid = {
            let mut filter = lock(&self.state.filter);
            let mut subs = lock(&self.state.subscriptions);
            let mut inventory = lock(&self.state.inventory);
            let txid = inventory.insert_tx(tx.clone());
            filter.insert(&txid.to_byte_array());
            let mut sub = TxSubscription::new(threshold, Arc::new(|_| {}));
            sub.tx = Some(tx);
            sub.broadcast = Some(promise);
            sub.broadcast_deadline =
                Some(Instant::now() + Duration::from_secs(BROADCAST_TIMEOUT_SECS));
            subs.insert_tx(txid, sub);
            txid
        };
        info!("broadcasting {} (announce threshold {})", txid, threshold);

        let handles = self.connected_peers();
        let half = handles.len() / 2;
        let inv = Message::Inv(vec![InvEntry::tx(txid)]);
        for peer in &handles[..half] {
            peer.command(PeerCommand::Send(inv.clone())).await;
        }
        for peer in &handles[half..] {
            peer.command(PeerCommand::LoadFilter).await;
        }
        Ok(result)
    }

    /// Watch an address: its hash160 goes into the filter, every peer gets
    /// the new filter, and `callback` fires per the announcement/confirmation
    /// rules once a matching transaction appears.
    pub async fn subscribe_address(
        &self,
        address: &str,
        callback: TxCallback,
    ) -> Result<(), ClientError> {
        let payload = address_payload(address)?;
        let threshold = (self.peer_count() / 2).max(1) as u32;
        {
            let mut filter = lock(&self.state.filter);
            let mut subs = lock(&self.state.subscriptions);
            filter.insert(&payload);
            subs.subscribe_address(address.to_string(), threshold, callback);
        }
        info!("subscribed to {}", address);
        self.reload_filters().await;
        Ok(())
    }

    /// Drop an address watch and rebuild the filter without it.
    pub async fn unsubscribe_address(&self, address: &str) -> Result<(), ClientError> {
        let payload = address_payload(address)?;
        let removed = {
            let mut filter = lock(&self.state.filter);
            let mut subs = lock(&self.state.subscriptions);
            if subs.unsubscribe_address(address) {
                filter.remove(&payload);
                true
            } else {
                false
            }
        };
        if removed {
            info!("unsubscribed from {}", address);
            self.reload_filters().await;
        }
        Ok(())
    }

    /// Push the current filter to every connected peer.
    async fn reload_filters(&self) {
        for peer in self.connected_peers() {
            peer.command(PeerCommand::LoadFilter).await;
        }
    }

    // =========================================================================
    // QUERIES AND LIFECYCLE
    // =========================================================================

    pub fn add_listener(&self, listener: Listener) {
        let mut listeners = lock(&self.state.listeners);
        listeners.register(listener);
    }

    pub fn tip_height(&self) -> u32 {
        lock(&self.state.chain).tip_height()
    }

    pub fn tip_hash(&self) -> bitcoin::BlockHash {
        lock(&self.state.chain).tip_hash()
    }

    pub fn confirmations(&self, block: &bitcoin::BlockHash) -> u32 {
        lock(&self.state.chain).confirmations(block)
    }

    /// Flush the chain snapshot if configured and dirty.
    pub fn save_snapshot(&self) -> Result<(), ClientError> {
        let mut chain = lock(&self.state.chain);
        if chain.needs_save() {
            chain.save()?;
        }
        Ok(())
    }

    /// Disconnect every peer. Pending broadcasts resolve by timeout.
    pub async fn shutdown(&self) {
        let handles: Vec<PeerHandle> = {
            let peers = lock(&self.peers);
            peers.clone()
        };
        for peer in handles {
            peer.command(PeerCommand::Shutdown).await;
        }
        if let Err(e) = self.save_snapshot() {
            warn!("final snapshot save failed: {}", e);
        }
    }
}

/// Base58check address → 20-byte hash payload (the filter element).
fn address_payload(address: &str) -> Result<[u8; 20], ClientError> {
    let decoded = bitcoin::base58::decode_check(address)
        .map_err(|e| ClientError::Address(e.to_string()))?;
    if decoded.len() != 21 {
        return Err(ClientError::Address(format!(
            "unexpected payload length {}",
            decoded.len()
        )));
    }
    let mut payload = [0u8; 20];
    payload.copy_from_slice(&decoded[1..21]);
    Ok(payload)
}
