//! taper — a Bitcoin SPV client
//!
//! A validated header chain with implicit reorg handling, a bloom filter
//! with removal for address/transaction subscriptions, and a peer protocol
//! state machine speaking the Bitcoin wire protocol (version 70002) over a
//! pool of full-node peers.

pub mod chain;
pub mod filter;
pub mod listener;
pub mod merkle;
pub mod net;
pub mod subscription;

pub use chain::{ChainConfig, ChainError, ChainStore, Checkpoint};
pub use filter::{murmur3_32, BloomFilter, BLOOM_UPDATE_NONE};
pub use listener::{DownloadListener, Listener, PeerEventListener};
pub use merkle::{MerkleBlock, MerkleError};
pub use net::{Client, ClientConfig, ClientError, NetEvent, NetworkParams};
pub use subscription::{
    SubscriptionTable, TxCallback, TxNotification, TxSubscription,
};
