//! Network constants and small wire-adjacent types

use crate::chain::ChainConfig;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Txid};

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Protocol version we speak (includes the trailing relay flag).
pub const PROTOCOL_VERSION: u32 = 70002;

/// Peers announcing less than this are disconnected during handshake.
pub const MIN_PEER_VERSION: u32 = 70001;

/// Mainnet message-start magic.
pub const MAINNET_MAGIC: [u8; 4] = [0xF9, 0xBE, 0xB4, 0xD9];

/// Testnet3 message-start magic.
pub const TESTNET_MAGIC: [u8; 4] = [0x0B, 0x11, 0x09, 0x07];

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Seconds allowed for each inbound handshake message (version, verack).
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Seconds allowed for a peer to answer a per-transaction getdata.
pub const GETDATA_TIMEOUT_SECS: u64 = 5;

/// Seconds allowed for a peer to make progress on a download request.
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 30;

/// Seconds a broadcast waits for its announcement threshold.
pub const BROADCAST_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// SIZE LIMITS
// =============================================================================
// These bound per-peer memory. The frame assembler refuses anything above
// MAX_PAYLOAD_SIZE outright; per-command caps are tighter.

/// Hard cap on a single frame payload; larger announcements close the peer.
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

/// Maximum entries in one inv/getdata/notfound message.
pub const MAX_INV_ENTRIES: usize = 50_000;

/// Maximum headers in one headers message.
pub const MAX_HEADERS_PER_MESSAGE: usize = 2_000;

/// Maximum hashes in a block locator on the wire.
pub const MAX_LOCATOR_HASHES: usize = 2_000;

// =============================================================================
// CONNECTION DEFAULTS
// =============================================================================

/// Target size of the peer pool.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Current unix time in seconds.
pub fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// INVENTORY ENTRIES
// =============================================================================

/// Inventory object kinds used in inv/getdata messages.
pub const INV_TX: u32 = 1;
pub const INV_BLOCK: u32 = 2;
pub const INV_FILTERED_BLOCK: u32 = 3;

/// One inventory vector entry: object kind plus hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvEntry {
    pub kind: u32,
    pub hash: [u8; 32],
}

impl InvEntry {
    pub fn tx(txid: Txid) -> InvEntry {
        InvEntry { kind: INV_TX, hash: txid.to_byte_array() }
    }

    pub fn block(hash: BlockHash) -> InvEntry {
        InvEntry { kind: INV_BLOCK, hash: hash.to_byte_array() }
    }

    pub fn filtered_block(hash: BlockHash) -> InvEntry {
        InvEntry { kind: INV_FILTERED_BLOCK, hash: hash.to_byte_array() }
    }

    pub fn is_tx(&self) -> bool {
        self.kind == INV_TX
    }

    pub fn is_block(&self) -> bool {
        self.kind == INV_BLOCK || self.kind == INV_FILTERED_BLOCK
    }

    pub fn txid(&self) -> Txid {
        Txid::from_byte_array(self.hash)
    }

    pub fn block_hash(&self) -> BlockHash {
        BlockHash::from_byte_array(self.hash)
    }
}

// =============================================================================
// PEER STATE MACHINE
// =============================================================================

/// Peer protocol state.
///
/// ```text
/// Connecting --version + verack--> Connected
/// Connecting --handshake timer---> Shutdown
/// Connected --download_blocks()--> Downloading
/// Downloading --tip reaches remote starting height--> Connected
/// any --connection loss----------> Shutdown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Socket open, handshake in flight.
    Connecting,
    /// Handshake complete, passive relay.
    Connected,
    /// Driving the initial chain download.
    Downloading,
    /// Torn down; the task is exiting.
    Shutdown,
}

// =============================================================================
// NETWORK PARAMETERS
// =============================================================================

pub const MAINNET_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "dnsseed.bitcoin.dashjr.org",
    "seed.bitcoinstats.com",
    "seed.bitnodes.io",
];

pub const TESTNET_SEEDS: &[&str] = &[
    "testnet-seed.bitcoin.schildbach.de",
    "testnet-seed.bitcoin.petertodd.org",
];

/// Per-network constants: magic, port, seed hosts, chain checkpoint.
#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub network: bitcoin::Network,
    pub magic: [u8; 4],
    pub port: u16,
    pub dns_seeds: &'static [&'static str],
    pub chain: ChainConfig,
}

impl NetworkParams {
    pub fn mainnet() -> NetworkParams {
        NetworkParams {
            network: bitcoin::Network::Bitcoin,
            magic: MAINNET_MAGIC,
            port: 8333,
            dns_seeds: MAINNET_SEEDS,
            chain: ChainConfig::mainnet(),
        }
    }

    pub fn testnet() -> NetworkParams {
        NetworkParams {
            network: bitcoin::Network::Testnet,
            magic: TESTNET_MAGIC,
            port: 18333,
            dns_seeds: TESTNET_SEEDS,
            chain: ChainConfig::testnet(),
        }
    }

    pub fn for_network(testnet: bool) -> NetworkParams {
        if testnet {
            NetworkParams::testnet()
        } else {
            NetworkParams::mainnet()
        }
    }
}

/// Default user agent advertised in the version message.
pub fn default_user_agent() -> String {
    format!("/taper:{}/", env!("CARGO_PKG_VERSION"))
}
