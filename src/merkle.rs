//! Partial merkle tree verification for filtered blocks
//!
//! A merkle block carries the block header, the total transaction count, a
//! minimal set of interior hashes, and a flag bit-string describing which
//! branches they belong to. Extraction replays the traversal, rebuilds the
//! root, and rejects the mutated-tree shapes (identical left/right siblings,
//! CVE-2012-2459) before trusting any match.

use bitcoin::block::Header;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{Txid, TxMerkleNode};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("merkle block contains no transactions")]
    Empty,
    #[error("flag bits exhausted during traversal")]
    FlagsExhausted,
    #[error("hash list exhausted during traversal")]
    HashesExhausted,
    #[error("identical left and right branches")]
    DuplicateBranch,
    #[error("computed root does not match the header merkle root")]
    RootMismatch,
}

/// Width of the tree at `height` levels above the transactions. Widened so
/// a hostile transaction count cannot overflow the shift.
fn tree_width(total: u32, height: u32) -> u32 {
    ((total as u64 + (1u64 << height) - 1) >> height) as u32
}

/// A `merkleblock` payload: header plus the partial tree.
#[derive(Debug, Clone)]
pub struct MerkleBlock {
    pub header: Header,
    pub total_transactions: u32,
    pub hashes: Vec<[u8; 32]>,
    /// Flag bits packed LSB-first within each byte.
    pub flags: Vec<u8>,
}

struct Traversal<'a> {
    total: u32,
    hashes: &'a [[u8; 32]],
    flags: &'a [u8],
    hash_used: usize,
    bits_used: usize,
    matches: Vec<Txid>,
}

impl<'a> Traversal<'a> {
    fn next_flag(&mut self) -> Result<bool, MerkleError> {
        let byte = self
            .flags
            .get(self.bits_used / 8)
            .ok_or(MerkleError::FlagsExhausted)?;
        let bit = byte >> (self.bits_used % 8) & 1;
        self.bits_used += 1;
        Ok(bit == 1)
    }

    fn next_hash(&mut self) -> Result<[u8; 32], MerkleError> {
        let hash = self
            .hashes
            .get(self.hash_used)
            .copied()
            .ok_or(MerkleError::HashesExhausted)?;
        self.hash_used += 1;
        Ok(hash)
    }

    fn descend(&mut self, height: u32, pos: u32) -> Result<[u8; 32], MerkleError> {
        let flagged = self.next_flag()?;
        if height == 0 || !flagged {
            let hash = self.next_hash()?;
            if height == 0 && flagged {
                self.matches.push(Txid::from_byte_array(hash));
            }
            return Ok(hash);
        }

        let left = self.descend(height - 1, pos * 2)?;
        let right = if pos * 2 + 1 < tree_width(self.total, height - 1) {
            let right = self.descend(height - 1, pos * 2 + 1)?;
            if right == left {
                return Err(MerkleError::DuplicateBranch);
            }
            right
        } else {
            left
        };

        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&left);
        concat[32..].copy_from_slice(&right);
        Ok(sha256d::Hash::hash(&concat).to_byte_array())
    }
}

impl MerkleBlock {
    /// Verify the partial tree and return the txids that matched the remote
    /// filter. Any structural defect or root mismatch is an error; callers
    /// treat errors as "no matches".
    pub fn extract_matches(&self) -> Result<Vec<Txid>, MerkleError> {
        if self.total_transactions == 0 {
            return Err(MerkleError::Empty);
        }

        let mut height = 0;
        while tree_width(self.total_transactions, height) > 1 {
            height += 1;
        }

        let mut traversal = Traversal {
            total: self.total_transactions,
            hashes: &self.hashes,
            flags: &self.flags,
            hash_used: 0,
            bits_used: 0,
            matches: Vec::new(),
        };
        let root = traversal.descend(height, 0)?;

        if TxMerkleNode::from_byte_array(root) != self.header.merkle_root {
            return Err(MerkleError::RootMismatch);
        }
        Ok(traversal.matches)
    }

    pub fn block_hash(&self) -> bitcoin::BlockHash {
        self.header.block_hash()
    }
}
