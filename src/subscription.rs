//! Subscription table
//!
//! Two typed maps instead of one heterogeneous one: address subscriptions
//! (installed by the user) and transaction subscriptions (created by a
//! broadcast of ours, or on first sight of a transaction paying a watched
//! address). Callbacks are returned to the caller as pending notifications
//! so they can be fired after the table's lock is released.

use crate::chain::ChainStore;
use bitcoin::{BlockHash, Transaction, Txid};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

/// Event delivered to a subscription callback.
#[derive(Clone)]
pub struct TxNotification {
    pub txid: Txid,
    pub tx: Option<Transaction>,
    pub confirmations: u32,
    pub in_blocks: Vec<BlockHash>,
}

pub type TxCallback = Arc<dyn Fn(TxNotification) + Send + Sync>;

/// A callback ready to fire once the table lock is dropped.
pub struct PendingNotification {
    callback: TxCallback,
    notification: TxNotification,
}

impl PendingNotification {
    pub fn fire(self) {
        (self.callback)(self.notification);
    }
}

/// Watch entry for an address.
pub struct AddressSubscription {
    pub announce_threshold: u32,
    pub callback: TxCallback,
}

/// Watch entry for a single transaction.
pub struct TxSubscription {
    pub announced: u32,
    pub announce_threshold: u32,
    pub confirmations: u32,
    /// Confirmation count last delivered to the callback.
    pub last_reported: u32,
    pub in_blocks: BTreeSet<BlockHash>,
    pub callback: TxCallback,
    /// Single-shot broadcast promise; resolved true at the announcement
    /// threshold, false when the deadline expires.
    pub broadcast: Option<oneshot::Sender<bool>>,
    pub broadcast_deadline: Option<Instant>,
    pub tx: Option<Transaction>,
}

impl TxSubscription {
    pub fn new(announce_threshold: u32, callback: TxCallback) -> TxSubscription {
        TxSubscription {
            announced: 0,
            announce_threshold,
            confirmations: 0,
            last_reported: 0,
            in_blocks: BTreeSet::new(),
            callback,
            broadcast: None,
            broadcast_deadline: None,
            tx: None,
        }
    }

    fn notification(&self, txid: Txid) -> TxNotification {
        TxNotification {
            txid,
            tx: self.tx.clone(),
            confirmations: self.confirmations,
            in_blocks: self.in_blocks.iter().copied().collect(),
        }
    }
}

#[derive(Default)]
pub struct SubscriptionTable {
    by_address: HashMap<String, AddressSubscription>,
    by_tx: HashMap<Txid, TxSubscription>,
}

impl SubscriptionTable {
    pub fn new() -> SubscriptionTable {
        SubscriptionTable::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty() && self.by_tx.is_empty()
    }

    pub fn subscribe_address(
        &mut self,
        address: String,
        announce_threshold: u32,
        callback: TxCallback,
    ) {
        self.by_address.insert(
            address,
            AddressSubscription {
                announce_threshold,
                callback,
            },
        );
    }

    pub fn unsubscribe_address(&mut self, address: &str) -> bool {
        self.by_address.remove(address).is_some()
    }

    pub fn address(&self, address: &str) -> Option<&AddressSubscription> {
        self.by_address.get(address)
    }

    pub fn address_count(&self) -> usize {
        self.by_address.len()
    }

    pub fn has_tx(&self, txid: &Txid) -> bool {
        self.by_tx.contains_key(txid)
    }

    pub fn insert_tx(&mut self, txid: Txid, subscription: TxSubscription) {
        self.by_tx.insert(txid, subscription);
    }

    pub fn tx_mut(&mut self, txid: &Txid) -> Option<&mut TxSubscription> {
        self.by_tx.get_mut(txid)
    }

    pub fn tx_count(&self) -> usize {
        self.by_tx.len()
    }

    /// Attribute a block to a subscribed transaction. Returns false when the
    /// txid has no subscription.
    pub fn add_block_attribution(&mut self, txid: &Txid, block: BlockHash) -> bool {
        match self.by_tx.get_mut(txid) {
            Some(sub) => {
                sub.in_blocks.insert(block);
                true
            }
            None => false,
        }
    }

    /// A peer echoed `txid` in an inv. Counts toward the announcement
    /// threshold; the user callback fires exactly once at the crossing, and
    /// afterwards only for strictly increased confirmation counts.
    pub fn record_announcement(&mut self, txid: &Txid) -> Option<PendingNotification> {
        let sub = self.by_tx.get_mut(txid)?;
        if sub.announced < sub.announce_threshold {
            sub.announced += 1;
            if sub.announced >= sub.announce_threshold {
                if let Some(promise) = sub.broadcast.take() {
                    let _ = promise.send(true);
                    sub.broadcast_deadline = None;
                }
                sub.last_reported = sub.confirmations;
                return Some(PendingNotification {
                    callback: sub.callback.clone(),
                    notification: sub.notification(*txid),
                });
            }
        } else if sub.confirmations > sub.last_reported {
            sub.last_reported = sub.confirmations;
            return Some(PendingNotification {
                callback: sub.callback.clone(),
                notification: sub.notification(*txid),
            });
        }
        None
    }

    /// Recompute every transaction's confirmation count from its attributed
    /// blocks and collect callbacks for the ones that increased.
    pub fn update_confirmations(&mut self, chain: &ChainStore) -> Vec<PendingNotification> {
        let mut pending = Vec::new();
        for (txid, sub) in self.by_tx.iter_mut() {
            let confirmations = sub
                .in_blocks
                .iter()
                .map(|block| chain.confirmations(block))
                .max()
                .unwrap_or(0);
            sub.confirmations = confirmations;
            if confirmations > sub.last_reported {
                sub.last_reported = confirmations;
                pending.push(PendingNotification {
                    callback: sub.callback.clone(),
                    notification: sub.notification(*txid),
                });
            }
        }
        pending
    }

    /// Resolve broadcast promises whose deadline has passed as failures.
    pub fn expire_broadcasts(&mut self, now: Instant) {
        for sub in self.by_tx.values_mut() {
            if let Some(deadline) = sub.broadcast_deadline {
                if now >= deadline {
                    sub.broadcast_deadline = None;
                    if let Some(promise) = sub.broadcast.take() {
                        let _ = promise.send(false);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn counting_callback() -> (TxCallback, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let inner = count.clone();
        let cb: TxCallback = Arc::new(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (cb, count)
    }

    #[test]
    fn announcement_threshold_fires_once() {
        let mut table = SubscriptionTable::new();
        let txid = Txid::from_byte_array([7; 32]);
        let (cb, fired) = counting_callback();
        table.insert_tx(txid, TxSubscription::new(3, cb));

        assert!(table.record_announcement(&txid).is_none());
        assert!(table.record_announcement(&txid).is_none());
        let third = table.record_announcement(&txid);
        assert!(third.is_some());
        if let Some(p) = third {
            p.fire();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Further announcements with unchanged confirmations stay silent.
        assert!(table.record_announcement(&txid).is_none());
    }

    #[test]
    fn threshold_crossing_resolves_broadcast_promise() {
        let mut table = SubscriptionTable::new();
        let txid = Txid::from_byte_array([8; 32]);
        let (cb, _) = counting_callback();
        let mut sub = TxSubscription::new(1, cb);
        let (sender, mut receiver) = oneshot::channel();
        sub.broadcast = Some(sender);
        sub.broadcast_deadline = Some(Instant::now() + Duration::from_secs(10));
        table.insert_tx(txid, sub);

        table.record_announcement(&txid);
        assert!(matches!(receiver.try_recv(), Ok(true)));
    }

    #[test]
    fn expired_broadcast_resolves_false() {
        let mut table = SubscriptionTable::new();
        let txid = Txid::from_byte_array([9; 32]);
        let (cb, _) = counting_callback();
        let mut sub = TxSubscription::new(10, cb);
        let (sender, mut receiver) = oneshot::channel();
        sub.broadcast = Some(sender);
        sub.broadcast_deadline = Some(Instant::now());
        table.insert_tx(txid, sub);

        table.expire_broadcasts(Instant::now() + Duration::from_millis(1));
        assert!(matches!(receiver.try_recv(), Ok(false)));
    }

    #[test]
    fn confirmations_only_report_increases() {
        use crate::chain::{ChainConfig, ChainStore};

        let mut table = SubscriptionTable::new();
        let txid = Txid::from_byte_array([3; 32]);
        let (cb, fired) = counting_callback();
        table.insert_tx(txid, TxSubscription::new(0, cb));

        let chain = ChainStore::new(ChainConfig::testnet());
        // Attribute the checkpoint block itself: one confirmation.
        table.add_block_attribution(&txid, chain.tip_hash());
        let pending = table.update_confirmations(&chain);
        assert_eq!(pending.len(), 1);
        for p in pending {
            p.fire();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Unchanged confirmations: no further callback.
        assert!(table.update_confirmations(&chain).is_empty());
    }
}
