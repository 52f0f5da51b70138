//! Per-peer protocol state machine
//!
//! One task per connected peer owning the socket: a select loop over socket
//! reads, coordinator commands, and a one-second deadline tick. Inbound bytes
//! accumulate in a read buffer and are dispatched one frame at a time, in
//! wire order. Handshake, per-request, and download timers are plain
//! deadlines scanned by the tick; any expiry tears the peer down.
//!
//! Shared client state lives behind std mutexes that are never held across
//! an await; callbacks collected under a lock fire after it is released.

use super::client::{lock, ClientState, NetEvent};
use super::types::{
    InvEntry, PeerState, DOWNLOAD_TIMEOUT_SECS, GETDATA_TIMEOUT_SECS, HANDSHAKE_TIMEOUT_SECS,
    MIN_PEER_VERSION,
};
use super::wire::{self, FrameHeader, Locator, Message, VersionMessage, WireError};
use crate::merkle::MerkleBlock;
use crate::subscription::TxSubscription;
use bitcoin::block::Header;
use bitcoin::p2p::ServiceFlags;
use bitcoin::{Address, Transaction, Txid};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Outbound command queue depth per peer.
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Socket read chunk size.
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("connection closed by remote")]
    ConnectionClosed,
    #[error("shut down by coordinator")]
    Shutdown,
}

/// Instructions from the coordinator to a peer task.
#[derive(Debug)]
pub enum PeerCommand {
    /// Send an arbitrary message.
    Send(Message),
    /// Serialize the shared filter as of now and send a filterload.
    LoadFilter,
    /// Start (or resume) driving the initial chain download.
    Download,
    /// Tear the connection down.
    Shutdown,
}

/// Peer state observable from the coordinator side.
pub struct PeerShared {
    state: Mutex<PeerState>,
    start_height: AtomicI32,
    has_version: AtomicBool,
}

impl PeerShared {
    fn new() -> PeerShared {
        PeerShared {
            state: Mutex::new(PeerState::Connecting),
            start_height: AtomicI32::new(-1),
            has_version: AtomicBool::new(false),
        }
    }
}

/// Coordinator-side handle to a running peer task.
#[derive(Clone)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    commands: mpsc::Sender<PeerCommand>,
    shared: Arc<PeerShared>,
}

impl PeerHandle {
    pub fn state(&self) -> PeerState {
        *lock(&self.shared.state)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), PeerState::Connected | PeerState::Downloading)
    }

    pub fn has_version(&self) -> bool {
        self.shared.has_version.load(Ordering::SeqCst)
    }

    /// Remote's advertised starting height, -1 before the handshake.
    pub fn start_height(&self) -> i32 {
        self.shared.start_height.load(Ordering::SeqCst)
    }

    /// Queue a command; false when the peer task is gone.
    pub async fn command(&self, command: PeerCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }
}

/// Spawn the protocol task for an established connection.
pub fn spawn_peer(
    addr: SocketAddr,
    stream: TcpStream,
    state: Arc<ClientState>,
    events: mpsc::Sender<NetEvent>,
) -> PeerHandle {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let shared = Arc::new(PeerShared::new());
    let handle = PeerHandle {
        addr,
        commands: command_tx,
        shared: shared.clone(),
    };

    let (reader, writer) = stream.into_split();
    let session = PeerSession {
        addr,
        state,
        events,
        shared,
        writer,
        buf: Vec::with_capacity(READ_CHUNK),
        peer_state: PeerState::Connecting,
        remote_version: None,
        version_deadline: None,
        verack_deadline: None,
        getdata_deadlines: HashMap::new(),
        download: DownloadProgress::default(),
    };
    tokio::spawn(session.run(reader, command_rx));
    handle
}

/// Counters for one download session.
#[derive(Default)]
struct DownloadProgress {
    deadline: Option<Instant>,
    /// Filtered blocks announced in the current batch.
    batch_expected: u32,
    /// Filtered blocks received in the current batch.
    batch_received: u32,
    total_done: u32,
    total_at_start: u32,
    /// Guards the download-complete signal against double firing.
    done_signalled: bool,
}

struct PeerSession {
    addr: SocketAddr,
    state: Arc<ClientState>,
    events: mpsc::Sender<NetEvent>,
    shared: Arc<PeerShared>,
    writer: OwnedWriteHalf,
    buf: Vec<u8>,
    peer_state: PeerState,
    remote_version: Option<VersionMessage>,
    version_deadline: Option<Instant>,
    verack_deadline: Option<Instant>,
    getdata_deadlines: HashMap<Txid, Instant>,
    download: DownloadProgress,
}

impl PeerSession {
    async fn run(
        mut self,
        mut reader: OwnedReadHalf,
        mut commands: mpsc::Receiver<PeerCommand>,
    ) {
        match self.session(&mut reader, &mut commands).await {
            Ok(()) | Err(PeerError::Shutdown) => debug!("peer {} closed", self.addr),
            Err(PeerError::ConnectionClosed) => debug!("peer {} hung up", self.addr),
            Err(e) => info!("peer {} dropped: {}", self.addr, e),
        }
        self.set_state(PeerState::Shutdown);
        let _ = self.events.send(NetEvent::PeerDisconnected(self.addr)).await;
    }

    async fn session(
        &mut self,
        reader: &mut OwnedReadHalf,
        commands: &mut mpsc::Receiver<PeerCommand>,
    ) -> Result<(), PeerError> {
        self.begin_handshake().await?;

        let mut chunk = vec![0u8; READ_CHUNK];
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                read = reader.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        return Err(PeerError::ConnectionClosed);
                    }
                    self.buf.extend_from_slice(&chunk[..n]);
                    self.drain_frames().await?;
                }
                command = commands.recv() => {
                    match command {
                        None | Some(PeerCommand::Shutdown) => return Err(PeerError::Shutdown),
                        Some(command) => self.handle_command(command).await?,
                    }
                }
                _ = tick.tick() => self.check_deadlines().await?,
            }
        }
    }

    // =========================================================================
    // TRANSPORT
    // =========================================================================

    async fn send(&mut self, msg: Message) -> Result<(), PeerError> {
        trace!("-> {} {}", self.addr, msg.command());
        let frame = wire::build_frame(self.state.params.magic, &msg);
        self.writer.write_all(&frame).await?;
        Ok(())
    }

    /// Dispatch every complete frame currently buffered, in order.
    async fn drain_frames(&mut self) -> Result<(), PeerError> {
        loop {
            if self.buf.len() < wire::FRAME_HEADER_SIZE {
                return Ok(());
            }
            let header = FrameHeader::parse(&self.buf, self.state.params.magic)?;
            let length = header.length as usize;
            if length > wire::max_payload_for(&header.command) {
                return Err(WireError::OversizedPayload {
                    command: header.command,
                    length,
                }
                .into());
            }
            if self.buf.len() < wire::FRAME_HEADER_SIZE + length {
                return Ok(());
            }
            let payload: Vec<u8> = self
                .buf
                .drain(..wire::FRAME_HEADER_SIZE + length)
                .skip(wire::FRAME_HEADER_SIZE)
                .collect();
            let msg = wire::decode_message(&header, &payload)?;
            self.handle_message(msg).await?;
        }
    }

    fn set_state(&mut self, state: PeerState) {
        self.peer_state = state;
        *lock(&self.shared.state) = state;
    }

    // =========================================================================
    // HANDSHAKE
    // =========================================================================

    async fn begin_handshake(&mut self) -> Result<(), PeerError> {
        let start_height = {
            let chain = lock(&self.state.chain);
            chain.tip_height() as i32
        };
        let version = VersionMessage::outbound(
            self.state.user_agent.clone(),
            self.addr,
            start_height,
        );
        let deadline = Instant::now() + Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);
        self.version_deadline = Some(deadline);
        self.verack_deadline = Some(deadline);
        self.send(Message::Version(version)).await
    }

    async fn handle_version(&mut self, version: VersionMessage) -> Result<(), PeerError> {
        if self.remote_version.is_some() {
            debug!("peer {} sent a duplicate version", self.addr);
            return Ok(());
        }
        if (version.version as u32) < MIN_PEER_VERSION {
            return Err(PeerError::Protocol(format!(
                "version {} below minimum",
                version.version
            )));
        }
        if !version.services.has(ServiceFlags::NETWORK) {
            return Err(PeerError::Protocol("peer is not a full node".into()));
        }

        self.shared
            .start_height
            .store(version.start_height, Ordering::SeqCst);
        self.shared.has_version.store(true, Ordering::SeqCst);
        debug!(
            "peer {} version {} agent {} height {}",
            self.addr, version.version, version.user_agent, version.start_height
        );
        self.remote_version = Some(version);
        self.version_deadline = None;
        self.send(Message::Verack).await?;
        self.maybe_handshake_complete().await
    }

    async fn handle_verack(&mut self) -> Result<(), PeerError> {
        self.verack_deadline = None;
        self.maybe_handshake_complete().await
    }

    async fn maybe_handshake_complete(&mut self) -> Result<(), PeerError> {
        if self.peer_state != PeerState::Connecting
            || self.version_deadline.is_some()
            || self.verack_deadline.is_some()
        {
            return Ok(());
        }
        self.set_state(PeerState::Connected);
        info!("connected to peer {}", self.addr);
        self.send_filter().await?;
        let _ = self.events.send(NetEvent::PeerConnected(self.addr)).await;
        Ok(())
    }

    /// Send a filterload reflecting the filter as of this moment.
    async fn send_filter(&mut self) -> Result<(), PeerError> {
        let load = {
            let filter = lock(&self.state.filter);
            wire::FilterLoad::from(&*filter)
        };
        self.send(Message::FilterLoad(load)).await
    }

    // =========================================================================
    // COMMANDS AND TIMERS
    // =========================================================================

    async fn handle_command(&mut self, command: PeerCommand) -> Result<(), PeerError> {
        match command {
            PeerCommand::Send(msg) => self.send(msg).await,
            PeerCommand::LoadFilter => self.send_filter().await,
            PeerCommand::Download => self.start_download().await,
            PeerCommand::Shutdown => Err(PeerError::Shutdown),
        }
    }

    async fn check_deadlines(&mut self) -> Result<(), PeerError> {
        let now = Instant::now();
        if self.version_deadline.is_some_and(|d| now >= d) {
            return Err(PeerError::Timeout("version"));
        }
        if self.verack_deadline.is_some_and(|d| now >= d) {
            return Err(PeerError::Timeout("verack"));
        }
        if self.getdata_deadlines.values().any(|d| now >= *d) {
            return Err(PeerError::Timeout("getdata"));
        }
        if self.download.deadline.is_some_and(|d| now >= d) {
            // The coordinator picks another download peer; this one goes away.
            self.signal_download_done().await;
            return Err(PeerError::Timeout("download"));
        }
        Ok(())
    }

    // =========================================================================
    // CHAIN DOWNLOAD
    // =========================================================================

    fn remote_start_height(&self) -> u32 {
        self.remote_version
            .as_ref()
            .map(|v| v.start_height.max(0) as u32)
            .unwrap_or(0)
    }

    /// Kick off the initial chain download against this peer.
    async fn start_download(&mut self) -> Result<(), PeerError> {
        if self.peer_state != PeerState::Connected || self.remote_version.is_none() {
            return Ok(());
        }
        let tip = {
            let chain = lock(&self.state.chain);
            chain.tip_height()
        };
        let remote = self.remote_start_height();
        let blocks_left = remote.saturating_sub(tip);

        self.set_state(PeerState::Downloading);
        self.download = DownloadProgress {
            deadline: None,
            batch_expected: 0,
            batch_received: 0,
            total_done: 0,
            total_at_start: blocks_left,
            done_signalled: false,
        };
        info!(
            "downloading {} blocks from {} (remote height {})",
            blocks_left, self.addr, remote
        );
        {
            let listeners = lock(&self.state.listeners);
            listeners.download_started(self.addr, blocks_left);
        }
        self.request_more().await
    }

    /// Issue the next download request: headers when nothing is subscribed,
    /// filtered blocks otherwise. Re-arms the download timer.
    async fn request_more(&mut self) -> Result<(), PeerError> {
        let (locator, passive) = {
            let chain = lock(&self.state.chain);
            let subs = lock(&self.state.subscriptions);
            (chain.locator(), subs.is_empty())
        };
        self.download.batch_expected = 0;
        self.download.batch_received = 0;
        self.download.deadline =
            Some(Instant::now() + Duration::from_secs(DOWNLOAD_TIMEOUT_SECS));
        let locator = Locator::new(locator);
        let msg = if passive {
            Message::GetHeaders(locator)
        } else {
            Message::GetBlocks(locator)
        };
        self.send(msg).await
    }

    /// Fire the coordinator's download-done signal exactly once per session.
    async fn signal_download_done(&mut self) {
        if !self.download.done_signalled {
            self.download.done_signalled = true;
            let _ = self
                .events
                .send(NetEvent::DownloadComplete(self.addr))
                .await;
        }
    }

    async fn finish_download(&mut self) -> Result<(), PeerError> {
        self.persist_chain();
        self.download.deadline = None;
        self.set_state(PeerState::Connected);
        info!("chain download from {} complete", self.addr);
        {
            let listeners = lock(&self.state.listeners);
            listeners.progress(100, self.download.total_done);
            listeners.download_complete();
        }
        self.signal_download_done().await;
        Ok(())
    }

    fn persist_chain(&self) {
        let mut chain = lock(&self.state.chain);
        if let Err(e) = chain.save() {
            warn!("chain snapshot save failed: {}", e);
        }
    }

    fn report_block(&self, block: &bitcoin::BlockHash, height: u32) {
        let remote = self.remote_start_height();
        let left = remote.saturating_sub(height);
        let listeners = lock(&self.state.listeners);
        listeners.on_block_downloaded(self.addr, block, left);
        if self.download.total_done % 50 == 0 || left == 0 {
            let percent = if self.download.total_at_start == 0 {
                100
            } else {
                (self.download.total_done.min(self.download.total_at_start) * 100)
                    / self.download.total_at_start
            };
            listeners.progress(percent, self.download.total_done);
        }
    }

    // =========================================================================
    // MESSAGE HANDLERS
    // =========================================================================

    async fn handle_message(&mut self, msg: Message) -> Result<(), PeerError> {
        trace!("<- {} {}", self.addr, msg.command());
        match msg {
            Message::Version(v) => self.handle_version(v).await,
            Message::Verack => self.handle_verack().await,
            Message::Ping(nonce) => self.send(Message::Pong(nonce)).await,
            Message::Inv(entries) => self.handle_inv(entries).await,
            Message::GetData(entries) => self.handle_getdata(entries).await,
            Message::Tx(tx) => self.handle_tx(tx).await,
            Message::MerkleBlock(mb) => self.handle_merkleblock(mb).await,
            Message::Headers(headers) => self.handle_headers(headers).await,
            Message::Reject(r) => {
                debug!(
                    "peer {} rejected {} ({:#04x}): {}",
                    self.addr, r.message, r.code, r.reason
                );
                Ok(())
            }
            Message::Pong(_)
            | Message::NotFound(_)
            | Message::Block(_)
            | Message::GetHeaders(_)
            | Message::GetBlocks(_)
            | Message::FilterLoad(_)
            | Message::FilterAdd(_) => {
                debug!("ignoring {} from {}", msg.command(), self.addr);
                Ok(())
            }
            Message::Unknown { command, length } => {
                debug!(
                    "unhandled command {:?} ({} bytes) from {}",
                    command, length, self.addr
                );
                Ok(())
            }
        }
    }

    async fn handle_inv(&mut self, entries: Vec<InvEntry>) -> Result<(), PeerError> {
        let mut request = Vec::new();
        let mut notifications = Vec::new();
        {
            let mut subs = lock(&self.state.subscriptions);
            let inventory = lock(&self.state.inventory);
            for entry in &entries {
                if entry.is_tx() {
                    let txid = entry.txid();
                    if subs.has_tx(&txid) {
                        if let Some(n) = subs.record_announcement(&txid) {
                            notifications.push(n);
                        }
                    } else if !inventory.has_tx(&txid) {
                        self.getdata_deadlines.insert(
                            txid,
                            Instant::now() + Duration::from_secs(GETDATA_TIMEOUT_SECS),
                        );
                        request.push(InvEntry::tx(txid));
                    }
                } else if entry.is_block() {
                    // Always fetch the filtered form.
                    request.push(InvEntry::filtered_block(entry.block_hash()));
                    if self.peer_state == PeerState::Downloading {
                        self.download.batch_expected += 1;
                    }
                }
            }
        }
        for n in notifications {
            n.fire();
        }
        if !request.is_empty() {
            self.send(Message::GetData(request)).await?;
        }
        Ok(())
    }

    async fn handle_getdata(&mut self, entries: Vec<InvEntry>) -> Result<(), PeerError> {
        let serve: Vec<Transaction> = {
            let inventory = lock(&self.state.inventory);
            entries
                .iter()
                .filter(|e| e.is_tx())
                .filter_map(|e| inventory.get_tx(&e.txid()).cloned())
                .collect()
        };
        for tx in serve {
            self.send(Message::Tx(tx)).await?;
        }
        Ok(())
    }

    async fn handle_tx(&mut self, tx: Transaction) -> Result<(), PeerError> {
        let txid = tx.compute_txid();
        self.getdata_deadlines.remove(&txid);

        let mut notifications = Vec::new();
        {
            let mut subs = lock(&self.state.subscriptions);
            let mut inventory = lock(&self.state.inventory);
            if let Some(sub) = subs.tx_mut(&txid) {
                if sub.tx.is_none() {
                    sub.tx = Some(tx.clone());
                }
            } else {
                for output in &tx.output {
                    // Non-standard scripts have no address form; skip them.
                    let Ok(address) =
                        Address::from_script(&output.script_pubkey, self.state.params.network)
                    else {
                        continue;
                    };
                    let address = address.to_string();
                    let Some(watch) = subs.address(&address) else {
                        continue;
                    };
                    let mut sub =
                        TxSubscription::new(watch.announce_threshold, watch.callback.clone());
                    sub.tx = Some(tx.clone());
                    sub.in_blocks
                        .extend(inventory.take_pending_blocks(&txid));
                    subs.insert_tx(txid, sub);
                    if let Some(n) = subs.record_announcement(&txid) {
                        notifications.push(n);
                    }
                    break;
                }
            }
        }
        for n in notifications {
            n.fire();
        }
        Ok(())
    }

    async fn handle_merkleblock(&mut self, mb: MerkleBlock) -> Result<(), PeerError> {
        let block_hash = mb.block_hash();
        let committed = {
            let mut chain = lock(&self.state.chain);
            chain.process(&mb.header)
        };
        let height = match committed {
            Ok(Some(height)) => Some(height),
            Ok(None) => {
                debug!("merkleblock {} from {} is an orphan", block_hash, self.addr);
                None
            }
            Err(e) => {
                debug!("rejected merkleblock from {}: {}", self.addr, e);
                None
            }
        };

        let matches = match mb.extract_matches() {
            Ok(matches) => matches,
            Err(e) => {
                debug!("invalid partial merkle tree from {}: {}", self.addr, e);
                Vec::new()
            }
        };

        let notifications = {
            let chain = lock(&self.state.chain);
            let mut subs = lock(&self.state.subscriptions);
            let mut inventory = lock(&self.state.inventory);
            for txid in &matches {
                if !subs.add_block_attribution(txid, block_hash) {
                    // The tx may still be in flight; attribute it when it lands.
                    inventory.add_pending_block(*txid, block_hash);
                }
            }
            subs.update_confirmations(&chain)
        };
        for n in notifications {
            n.fire();
        }

        if self.peer_state == PeerState::Downloading {
            self.download.batch_received += 1;
            if let Some(height) = height {
                self.download.total_done += 1;
                self.report_block(&block_hash, height);
            }
            let (tip, remote) = (
                {
                    let chain = lock(&self.state.chain);
                    chain.tip_height()
                },
                self.remote_start_height(),
            );
            if tip >= remote {
                self.finish_download().await?;
            } else if self.download.batch_expected > 0
                && self.download.batch_received >= self.download.batch_expected
            {
                // Batch drained with blocks still missing: ask again.
                self.request_more().await?;
            }
        } else {
            // Steady state: snapshot after each committed header.
            let mut chain = lock(&self.state.chain);
            if chain.needs_save() {
                if let Err(e) = chain.save() {
                    warn!("chain snapshot save failed: {}", e);
                }
            }
        }
        Ok(())
    }

    async fn handle_headers(&mut self, headers: Vec<Header>) -> Result<(), PeerError> {
        self.download.deadline = None;
        let downloading = self.peer_state == PeerState::Downloading;
        let mut orphaned = false;

        for header in &headers {
            let committed = {
                let mut chain = lock(&self.state.chain);
                chain.process(header)
            };
            match committed {
                Ok(Some(height)) => {
                    if downloading {
                        self.download.total_done += 1;
                        self.report_block(&header.block_hash(), height);
                    }
                }
                Ok(None) => {
                    if downloading {
                        orphaned = true;
                        break;
                    }
                    debug!("ignoring unsolicited orphan header from {}", self.addr);
                }
                Err(e) => {
                    debug!("rejected header from {}: {}", self.addr, e);
                }
            }
        }

        if orphaned {
            // No common ancestor in the window; let the coordinator try a
            // different peer.
            self.persist_chain();
            self.signal_download_done().await;
            return Err(PeerError::Protocol("unconnected header during sync".into()));
        }

        if !downloading {
            return Ok(());
        }
        let tip = {
            let chain = lock(&self.state.chain);
            chain.tip_height()
        };
        if tip < self.remote_start_height() {
            self.request_more().await
        } else {
            self.finish_download().await
        }
    }
}
