//! Shared inventory
//!
//! Two typed stores behind one facade: raw transactions we originated and
//! still serve to peers on getdata, and block attributions for txids that
//! matched a merkleblock before the transaction itself arrived (the hashes
//! seed the subscription's in_blocks set once the tx shows up).

use bitcoin::{BlockHash, Transaction, Txid};
use std::collections::HashMap;
use tracing::debug;

/// Caps keep a hostile relay from growing either map without bound.
const MAX_BROADCAST_TXS: usize = 10_000;
const MAX_PENDING_ATTRIBUTIONS: usize = 10_000;

#[derive(Default)]
pub struct Inventory {
    txs: HashMap<Txid, Transaction>,
    pending_blocks: HashMap<Txid, Vec<BlockHash>>,
}

impl Inventory {
    pub fn new() -> Inventory {
        Inventory::default()
    }

    /// Track a transaction we can serve to peers.
    pub fn insert_tx(&mut self, tx: Transaction) -> Txid {
        let txid = tx.compute_txid();
        if self.txs.len() >= MAX_BROADCAST_TXS {
            debug!("inventory full, dropping oldest broadcast entries");
            self.txs.clear();
        }
        self.txs.insert(txid, tx);
        txid
    }

    pub fn get_tx(&self, txid: &Txid) -> Option<&Transaction> {
        self.txs.get(txid)
    }

    pub fn has_tx(&self, txid: &Txid) -> bool {
        self.txs.contains_key(txid)
    }

    pub fn remove_tx(&mut self, txid: &Txid) -> Option<Transaction> {
        self.txs.remove(txid)
    }

    /// Remember that `txid` was proven into `block` before we saw the tx.
    pub fn add_pending_block(&mut self, txid: Txid, block: BlockHash) {
        if self.pending_blocks.len() >= MAX_PENDING_ATTRIBUTIONS
            && !self.pending_blocks.contains_key(&txid)
        {
            return;
        }
        let blocks = self.pending_blocks.entry(txid).or_default();
        if !blocks.contains(&block) {
            blocks.push(block);
        }
    }

    pub fn has_pending_blocks(&self, txid: &Txid) -> bool {
        self.pending_blocks.contains_key(txid)
    }

    /// Consume the buffered attributions for a now-arrived transaction.
    pub fn take_pending_blocks(&mut self, txid: &Txid) -> Vec<BlockHash> {
        self.pending_blocks.remove(txid).unwrap_or_default()
    }

    pub fn tx_count(&self) -> usize {
        self.txs.len()
    }
}
