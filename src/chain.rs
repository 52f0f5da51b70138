//! Header chain store with implicit reorg handling
//!
//! Stores validated block headers keyed by cumulative work. Valid headers and
//! orphan-branch headers live in the same set, so reorganizations need no
//! explicit rollback: whichever branch accumulates the most work extends past
//! the previous tip and becomes the new one. Confirmation and locator queries
//! walk parent pointers from whatever the current tip is.
//!
//! Only a sliding window of headers is retained (enough to survive any
//! realistic reorg); everything below the window is pruned.

use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use bitcoin::pow::{CompactTarget, Target};
use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Retarget interval in blocks.
pub const RETARGET_INTERVAL: u32 = 2016;

/// Expected seconds per retarget span (two weeks).
pub const TARGET_TIMESPAN: u64 = 14 * 24 * 3600;

/// Clamp bounds for the measured retarget span.
const MIN_TIMESPAN: i64 = (TARGET_TIMESPAN / 4) as i64;
const MAX_TIMESPAN: i64 = (TARGET_TIMESPAN * 4) as i64;

/// Number of headers kept above the oldest stored height.
pub const HEADER_WINDOW: u32 = 5000;

/// Timestamps sampled for the median-time check.
const MEDIAN_TIME_SPAN: usize = 11;

/// Snapshot files larger than this are rejected before deserialization.
const MAX_SNAPSHOT_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("header {0} fails proof of work")]
    BadProofOfWork(BlockHash),
    #[error("header {hash} carries wrong difficulty bits {got:#010x}, expected {want:#010x}")]
    BadDifficulty { hash: BlockHash, got: u32, want: u32 },
    #[error("header {0} timestamp not above median of last 11")]
    BadTimestamp(BlockHash),
    #[error("retarget span walks past the stored window at {0}")]
    RetargetSpanMissing(BlockHash),
    #[error("snapshot rejected: {0}")]
    Snapshot(String),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// 256-bit cumulative work, big-endian limbs so the derived ordering is
/// numeric. Stored per record; only relative order matters (the checkpoint
/// starts at zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct WorkSum([u64; 4]);

impl WorkSum {
    pub const ZERO: WorkSum = WorkSum([0; 4]);

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        let mut limbs = [0u64; 4];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            *limb = u64::from_be_bytes(chunk);
        }
        WorkSum(limbs)
    }

    pub fn to_be_bytes(self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, limb) in self.0.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&limb.to_be_bytes());
        }
        out
    }

    pub fn saturating_add(self, rhs: WorkSum) -> WorkSum {
        let mut out = [0u64; 4];
        let mut carry: u128 = 0;
        for i in (0..4).rev() {
            let sum = self.0[i] as u128 + rhs.0[i] as u128 + carry;
            out[i] = sum as u64;
            carry = sum >> 64;
        }
        if carry != 0 {
            WorkSum([u64::MAX; 4])
        } else {
            WorkSum(out)
        }
    }
}

/// Scale a 256-bit target by `num / den` through a 320-bit intermediate so
/// near-limit targets cannot overflow during the multiply.
fn scale_target(target: Target, num: u64, den: u64) -> Target {
    let be = target.to_be_bytes();
    // limbs[0] is the 64-bit overflow limb, limbs[1..5] the target.
    let mut limbs = [0u64; 5];
    for i in 0..4 {
        let mut chunk = [0u8; 8];
        chunk.copy_from_slice(&be[i * 8..i * 8 + 8]);
        limbs[i + 1] = u64::from_be_bytes(chunk);
    }

    let mut carry: u128 = 0;
    for limb in limbs.iter_mut().rev() {
        let prod = *limb as u128 * num as u128 + carry;
        *limb = prod as u64;
        carry = prod >> 64;
    }

    let mut rem: u128 = 0;
    for limb in limbs.iter_mut() {
        let cur = (rem << 64) | *limb as u128;
        *limb = (cur / den as u128) as u64;
        rem = cur % den as u128;
    }

    if limbs[0] != 0 {
        return Target::MAX;
    }
    let mut out = [0u8; 32];
    for i in 0..4 {
        out[i * 8..i * 8 + 8].copy_from_slice(&limbs[i + 1].to_be_bytes());
    }
    Target::from_be_bytes(out)
}

/// Hard-coded starting point for a network. Headers before the checkpoint are
/// unknown to the store.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: BlockHash,
    pub time: u32,
    pub bits: CompactTarget,
}

impl Checkpoint {
    /// Mainnet checkpoint, height 376992 (a retarget boundary).
    pub fn mainnet() -> Checkpoint {
        Checkpoint {
            height: 376_992,
            hash: BlockHash::from_byte_array([
                0xb4, 0xfd, 0xdb, 0x6a, 0x9a, 0xbd, 0xf7, 0x2b, 0xcf, 0xfd, 0x0e, 0x0e, 0xbe,
                0x67, 0x50, 0xb2, 0x7d, 0xf9, 0x48, 0x51, 0xab, 0xe2, 0xcc, 0x02, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ]),
            time: 1_443_700_390,
            bits: CompactTarget::from_consensus(0x1809_CCE2),
        }
    }

    /// Testnet3 checkpoint, height 576576 (a retarget boundary).
    pub fn testnet() -> Checkpoint {
        Checkpoint {
            height: 576_576,
            hash: BlockHash::from_byte_array([
                0x70, 0x83, 0xa0, 0x8f, 0x12, 0xc9, 0xff, 0xb5, 0x42, 0xfc, 0xb4, 0xea, 0xc9,
                0xc7, 0x30, 0x5a, 0xd5, 0xbd, 0x22, 0x76, 0xa4, 0x0e, 0x05, 0x00, 0x45, 0x20,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ]),
            time: 1_444_142_008,
            bits: CompactTarget::from_consensus(0x1A3F_CD74),
        }
    }
}

/// Chain validation knobs.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub checkpoint: Checkpoint,
    /// Network proof-of-work limit; retargeted targets are clamped to it.
    pub pow_limit: Target,
    /// Median-of-11 timestamp predicate. Default on for mainnet, off for
    /// testnet where historical blocks violate it.
    pub enforce_median_time: bool,
}

impl ChainConfig {
    pub fn mainnet() -> ChainConfig {
        ChainConfig {
            checkpoint: Checkpoint::mainnet(),
            pow_limit: Target::MAX_ATTAINABLE_MAINNET,
            enforce_median_time: true,
        }
    }

    pub fn testnet() -> ChainConfig {
        ChainConfig {
            checkpoint: Checkpoint::testnet(),
            pow_limit: Target::MAX_ATTAINABLE_TESTNET,
            enforce_median_time: false,
        }
    }
}

/// One stored header.
#[derive(Debug, Clone)]
struct HeaderRecord {
    hash: BlockHash,
    prev: BlockHash,
    height: u32,
    time: u32,
    bits: u32,
    work: WorkSum,
    /// Insertion sequence; breaks cumulative-work ties (earlier wins).
    seq: u64,
}

impl HeaderRecord {
    /// Sort key: ascending work, and for equal work the *earlier* insertion
    /// sorts higher (inverted sequence), so the map's last entry is the tip.
    fn work_key(&self) -> (WorkSum, u64) {
        (self.work, u64::MAX - self.seq)
    }
}

/// Snapshot row; primitives only so the on-disk format is stable.
#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    work: [u8; 32],
    height: u32,
    hash: [u8; 32],
    prev: [u8; 32],
    time: u32,
    bits: u32,
}

/// In-memory header chain with an optional on-disk snapshot.
pub struct ChainStore {
    config: ChainConfig,
    records: HashMap<BlockHash, HeaderRecord>,
    by_work: BTreeMap<(WorkSum, u64), BlockHash>,
    by_height: BTreeMap<u32, Vec<BlockHash>>,
    next_seq: u64,
    snapshot_path: Option<PathBuf>,
    dirty: bool,
}

impl ChainStore {
    /// Fresh store seeded from the configured checkpoint.
    pub fn new(config: ChainConfig) -> ChainStore {
        let mut store = ChainStore {
            config,
            records: HashMap::new(),
            by_work: BTreeMap::new(),
            by_height: BTreeMap::new(),
            next_seq: 0,
            snapshot_path: None,
            dirty: false,
        };
        let cp = store.config.checkpoint;
        store.insert_record(HeaderRecord {
            hash: cp.hash,
            prev: BlockHash::all_zeros(),
            height: cp.height,
            time: cp.time,
            bits: cp.bits.to_consensus(),
            work: WorkSum::ZERO,
            seq: 0,
        });
        store.next_seq = 1;
        store
    }

    /// Open a store backed by a snapshot file. A missing or corrupt snapshot
    /// falls back to a checkpoint-seeded store.
    pub fn open(config: ChainConfig, path: PathBuf) -> ChainStore {
        match Self::load_snapshot(&config, &path) {
            Ok(store) => {
                info!(
                    "loaded chain snapshot: {} headers, tip height {}",
                    store.records.len(),
                    store.tip_height()
                );
                store
            }
            Err(e) => {
                debug!("no usable chain snapshot at {}: {}", path.display(), e);
                let mut store = ChainStore::new(config);
                store.snapshot_path = Some(path);
                store
            }
        }
    }

    fn insert_record(&mut self, record: HeaderRecord) {
        self.by_work.insert(record.work_key(), record.hash);
        self.by_height
            .entry(record.height)
            .or_default()
            .push(record.hash);
        self.records.insert(record.hash, record);
    }

    fn tip_record(&self) -> &HeaderRecord {
        // The set is never empty: it is seeded at construction.
        let (_, hash) = self
            .by_work
            .last_key_value()
            .unwrap_or_else(|| unreachable!("chain store is never empty"));
        &self.records[hash]
    }

    pub fn tip_height(&self) -> u32 {
        self.tip_record().height
    }

    pub fn tip_hash(&self) -> BlockHash {
        self.tip_record().hash
    }

    /// Oldest stored height (the bottom of the sliding window).
    pub fn min_height(&self) -> u32 {
        self.by_height
            .first_key_value()
            .map(|(h, _)| *h)
            .unwrap_or(0)
    }

    /// Number of stored headers. Never zero.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn height_of(&self, hash: &BlockHash) -> Option<u32> {
        self.records.get(hash).map(|r| r.height)
    }

    pub fn timestamp_of(&self, hash: &BlockHash) -> Option<u32> {
        self.records.get(hash).map(|r| r.time)
    }

    pub fn target_of(&self, hash: &BlockHash) -> Option<Target> {
        self.records
            .get(hash)
            .map(|r| Target::from_compact(CompactTarget::from_consensus(r.bits)))
    }

    pub fn parent_of(&self, hash: &BlockHash) -> Option<BlockHash> {
        self.records.get(hash).map(|r| r.prev)
    }

    /// Hash of the main-chain block at `height`, found by walking parent
    /// pointers down from the tip.
    pub fn hash_at(&self, height: u32) -> Option<BlockHash> {
        let tip = self.tip_record();
        if height > tip.height || height < self.min_height() {
            return None;
        }
        self.ancestor(tip.hash, tip.height - height)
    }

    /// Walk `steps` parent pointers from `hash`.
    fn ancestor(&self, mut hash: BlockHash, steps: u32) -> Option<BlockHash> {
        for _ in 0..steps {
            hash = self.records.get(&hash)?.prev;
            self.records.get(&hash)?;
        }
        Some(hash)
    }

    /// Confirmation count for a block: distance from the tip plus one if the
    /// block is on the main chain, zero for unknown or orphan-branch blocks.
    pub fn confirmations(&self, hash: &BlockHash) -> u32 {
        let Some(height) = self.height_of(hash) else {
            return 0;
        };
        let tip = self.tip_record();
        if height > tip.height {
            return 0;
        }
        match self.ancestor(tip.hash, tip.height - height) {
            Some(h) if h == *hash => tip.height - height + 1,
            _ => 0,
        }
    }

    /// Block locator for resumed sync: dense near the tip (ten single steps),
    /// then exponentially sparser, ending at the oldest stored block.
    pub fn locator(&self) -> Vec<BlockHash> {
        let min = self.min_height();
        let mut out = Vec::new();
        let mut hash = self.tip_hash();
        let mut height = self.tip_height();
        let mut step: u32 = 1;

        loop {
            out.push(hash);
            if out.len() >= 10 {
                step = step.saturating_mul(2);
            }
            match height.checked_sub(step) {
                Some(next) if next > min => {
                    match self.ancestor(hash, step) {
                        Some(h) => hash = h,
                        None => break,
                    }
                    height = next;
                }
                _ => {
                    if height > min {
                        if let Some(oldest) = self.ancestor(hash, height - min) {
                            out.push(oldest);
                        }
                    }
                    break;
                }
            }
        }
        out
    }

    /// Validate a header and commit it on success.
    ///
    /// Returns the committed height, or `None` when the parent is not in the
    /// store (orphan outside the window — the caller decides what that
    /// means). Validation failures are errors and leave the store untouched.
    pub fn process(&mut self, header: &Header) -> Result<Option<u32>, ChainError> {
        let hash = header.block_hash();
        if let Some(existing) = self.records.get(&hash) {
            return Ok(Some(existing.height));
        }

        header
            .validate_pow(header.target())
            .map_err(|_| ChainError::BadProofOfWork(hash))?;

        let Some(parent) = self.records.get(&header.prev_blockhash).cloned() else {
            return Ok(None);
        };

        let expected = self.expected_target(&parent)?;
        let retarget = (parent.height + 1) % RETARGET_INTERVAL == 0;
        let header_target = header.target();
        let acceptable = if retarget {
            // A retargeted header may be stricter than required, never looser.
            header_target <= expected
        } else {
            header.bits.to_consensus() == parent.bits
        };
        if !acceptable {
            return Err(ChainError::BadDifficulty {
                hash,
                got: header.bits.to_consensus(),
                want: expected.to_compact_lossy().to_consensus(),
            });
        }

        if self.config.enforce_median_time {
            self.check_median_time(&parent, header.time, hash)?;
        }

        let work_gain = WorkSum::from_be_bytes(header.work().to_be_bytes());
        let record = HeaderRecord {
            hash,
            prev: parent.hash,
            height: parent.height + 1,
            time: header.time,
            bits: header.bits.to_consensus(),
            work: parent.work.saturating_add(work_gain),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        let height = record.height;
        self.insert_record(record);
        self.cull();
        self.dirty = true;
        Ok(Some(height))
    }

    /// Target the child of `parent` must meet: the parent's target off
    /// retarget heights, or the recomputed span-scaled target (decoded,
    /// scaled, clamped, compact round-tripped) at retarget heights.
    fn expected_target(&self, parent: &HeaderRecord) -> Result<Target, ChainError> {
        let parent_target = Target::from_compact(CompactTarget::from_consensus(parent.bits));
        if (parent.height + 1) % RETARGET_INTERVAL != 0 {
            return Ok(parent_target);
        }

        let span_start = self
            .ancestor(parent.hash, RETARGET_INTERVAL - 1)
            .ok_or(ChainError::RetargetSpanMissing(parent.hash))?;
        let start_time = self
            .timestamp_of(&span_start)
            .ok_or(ChainError::RetargetSpanMissing(parent.hash))?;

        let spent = (parent.time as i64 - start_time as i64).clamp(MIN_TIMESPAN, MAX_TIMESPAN);
        let mut scaled = scale_target(parent_target, spent as u64, TARGET_TIMESPAN);
        if scaled > self.config.pow_limit {
            scaled = self.config.pow_limit;
        }
        // Compact round-trip so the comparison matches what peers encode.
        Ok(Target::from_compact(scaled.to_compact_lossy()))
    }

    /// Timestamp must exceed the median of the previous 11 timestamps.
    /// Skipped near the checkpoint where not enough ancestors exist.
    fn check_median_time(
        &self,
        parent: &HeaderRecord,
        time: u32,
        hash: BlockHash,
    ) -> Result<(), ChainError> {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = parent.hash;
        for _ in 0..MEDIAN_TIME_SPAN {
            let Some(record) = self.records.get(&cursor) else {
                return Ok(());
            };
            times.push(record.time);
            cursor = record.prev;
        }
        times.sort_unstable();
        if time <= times[MEDIAN_TIME_SPAN / 2] {
            return Err(ChainError::BadTimestamp(hash));
        }
        Ok(())
    }

    /// Prune whole bottom heights while the window exceeds its budget.
    fn cull(&mut self) {
        loop {
            let (Some(min), Some(max)) = (
                self.by_height.first_key_value().map(|(h, _)| *h),
                self.by_height.last_key_value().map(|(h, _)| *h),
            ) else {
                return;
            };
            if max - min <= HEADER_WINDOW {
                return;
            }
            if let Some(hashes) = self.by_height.remove(&min) {
                for hash in hashes {
                    if let Some(record) = self.records.remove(&hash) {
                        self.by_work.remove(&record.work_key());
                    }
                }
            }
        }
    }

    /// Whether there are committed headers not yet flushed to the snapshot.
    pub fn needs_save(&self) -> bool {
        self.dirty && self.snapshot_path.is_some()
    }

    /// Write the snapshot file (temp file, then atomic rename). A no-op when
    /// no snapshot path is configured.
    pub fn save(&mut self) -> Result<(), ChainError> {
        let Some(path) = self.snapshot_path.clone() else {
            return Ok(());
        };
        let mut rows: Vec<&HeaderRecord> = self.records.values().collect();
        rows.sort_by_key(|r| r.seq);
        let rows: Vec<SnapshotRecord> = rows
            .into_iter()
            .map(|r| SnapshotRecord {
                work: r.work.to_be_bytes(),
                height: r.height,
                hash: r.hash.to_byte_array(),
                prev: r.prev.to_byte_array(),
                time: r.time,
                bits: r.bits,
            })
            .collect();
        let data =
            bincode::serialize(&rows).map_err(|e| ChainError::Snapshot(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &path)?;
        self.dirty = false;
        debug!("chain snapshot saved: {} headers", rows.len());
        Ok(())
    }

    fn load_snapshot(config: &ChainConfig, path: &Path) -> Result<ChainStore, ChainError> {
        let meta = std::fs::metadata(path)?;
        if meta.len() > MAX_SNAPSHOT_SIZE {
            return Err(ChainError::Snapshot(format!(
                "file too large: {} bytes",
                meta.len()
            )));
        }
        let data = std::fs::read(path)?;
        let rows: Vec<SnapshotRecord> =
            bincode::deserialize(&data).map_err(|e| ChainError::Snapshot(e.to_string()))?;
        if rows.is_empty() {
            return Err(ChainError::Snapshot("empty record set".into()));
        }

        let mut store = ChainStore {
            config: config.clone(),
            records: HashMap::new(),
            by_work: BTreeMap::new(),
            by_height: BTreeMap::new(),
            next_seq: 0,
            snapshot_path: Some(path.to_path_buf()),
            dirty: false,
        };
        for row in rows {
            let seq = store.next_seq;
            store.next_seq += 1;
            store.insert_record(HeaderRecord {
                hash: BlockHash::from_byte_array(row.hash),
                prev: BlockHash::from_byte_array(row.prev),
                height: row.height,
                time: row.time,
                bits: row.bits,
                work: WorkSum::from_be_bytes(row.work),
                seq,
            });
        }
        Ok(store)
    }
}

impl std::fmt::Debug for ChainStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStore")
            .field("headers", &self.records.len())
            .field("tip_height", &self.tip_height())
            .field("tip_hash", &self.tip_hash())
            .finish()
    }
}
