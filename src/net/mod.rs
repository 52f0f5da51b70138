//! P2P networking layer

pub mod client;
pub mod dns;
pub mod inventory;
pub mod peer;
pub mod types;
pub mod wire;

// Re-exports
pub use client::{Client, ClientConfig, ClientError, ClientState, NetEvent};
pub use dns::{dns_discover, DnsSeeds};
pub use inventory::Inventory;
pub use peer::{PeerCommand, PeerError, PeerHandle};
pub use types::*;
pub use wire::{FilterLoad, FrameHeader, Locator, Message, Reject, VersionMessage, WireError};
