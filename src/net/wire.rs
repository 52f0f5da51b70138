//! Message framing and payload codec
//!
//! Every message travels as a 24-byte frame header (magic, NUL-padded
//! command, little-endian payload length, double-SHA256 checksum prefix)
//! followed by the payload. Byte-level encoding of the established wire
//! objects (headers, transactions, var-ints, network addresses) is delegated
//! to the `bitcoin` consensus codec; this module owns the frame itself and
//! the payload layouts we extend or that the codec crate does not carry in
//! the shape we need (version with relay flag, filterload, merkleblock,
//! filtered-block inventory entries).

use super::types::{
    InvEntry, MAX_HEADERS_PER_MESSAGE, MAX_INV_ENTRIES, MAX_LOCATOR_HASHES, MAX_PAYLOAD_SIZE,
    PROTOCOL_VERSION,
};
use crate::filter::{BloomFilter, MAX_FILTER_SIZE};
use crate::merkle::MerkleBlock;
use bitcoin::block::Header;
use bitcoin::consensus::encode::{self, deserialize_partial, serialize, VarInt};
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::p2p::address::Address;
use bitcoin::p2p::ServiceFlags;
use bitcoin::{Block, BlockHash, Transaction};
use std::net::SocketAddr;

/// Frame header size on the wire.
pub const FRAME_HEADER_SIZE: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("malformed command field")]
    BadCommand,
    #[error("payload of {length} bytes exceeds the {command} limit")]
    OversizedPayload { command: String, length: usize },
    #[error("checksum mismatch on {0}")]
    BadChecksum(String),
    #[error("truncated {0} payload")]
    Truncated(&'static str),
    #[error("collection of {count} entries exceeds cap {cap}")]
    OversizedCount { count: u64, cap: u64 },
    #[error("trailing bytes after {0} payload")]
    TrailingBytes(&'static str),
    #[error("codec: {0}")]
    Codec(#[from] encode::Error),
}

/// First four bytes of double-SHA256 over the payload.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = sha256d::Hash::hash(payload).to_byte_array();
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Parsed 24-byte frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: String,
    pub length: u32,
    pub checksum: [u8; 4],
}

impl FrameHeader {
    /// Parse the fixed header from the front of `buf` (at least 24 bytes).
    pub fn parse(buf: &[u8], magic: [u8; 4]) -> Result<FrameHeader, WireError> {
        debug_assert!(buf.len() >= FRAME_HEADER_SIZE);
        if buf[..4] != magic {
            let mut got = [0u8; 4];
            got.copy_from_slice(&buf[..4]);
            return Err(WireError::BadMagic(got));
        }

        let raw = &buf[4..16];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        if end == 0 || raw[end..].iter().any(|b| *b != 0) {
            return Err(WireError::BadCommand);
        }
        let command = std::str::from_utf8(&raw[..end])
            .map_err(|_| WireError::BadCommand)?
            .to_string();
        if !command.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(WireError::BadCommand);
        }

        let length = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        if length as usize > MAX_PAYLOAD_SIZE {
            return Err(WireError::OversizedPayload {
                command,
                length: length as usize,
            });
        }
        let mut check = [0u8; 4];
        check.copy_from_slice(&buf[20..24]);
        Ok(FrameHeader {
            command,
            length,
            checksum: check,
        })
    }
}

/// Tightest payload size accepted per command; anything bigger closes the
/// peer before the payload is even buffered.
pub fn max_payload_for(command: &str) -> usize {
    match command {
        "version" => 1_024,
        "verack" => 16,
        "ping" | "pong" => 16,
        "inv" | "getdata" | "notfound" => 9 + MAX_INV_ENTRIES * 36,
        "tx" => 1024 * 1024,
        "block" => 4 * 1024 * 1024,
        "merkleblock" => 1024 * 1024,
        "headers" => 9 + MAX_HEADERS_PER_MESSAGE * 81,
        "getheaders" | "getblocks" => 13 + MAX_LOCATOR_HASHES * 32 + 32,
        "filterload" => MAX_FILTER_SIZE + 18,
        "filteradd" => 530,
        "reject" => 1_024,
        _ => MAX_PAYLOAD_SIZE,
    }
}

// =============================================================================
// PAYLOAD TYPES
// =============================================================================

/// Extended `version` (70002): the standard layout plus the relay flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: ServiceFlags,
    pub timestamp: i64,
    pub receiver: Address,
    pub sender: Address,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    /// Our outbound handshake: zero services, relay off, so the remote only
    /// forwards what the installed filter matches.
    pub fn outbound(user_agent: String, remote: SocketAddr, start_height: i32) -> VersionMessage {
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap_or_else(|_| unreachable!());
        VersionMessage {
            version: PROTOCOL_VERSION as i32,
            services: ServiceFlags::NONE,
            timestamp: super::types::unix_time() as i64,
            receiver: Address::new(&remote, ServiceFlags::NONE),
            sender: Address::new(&local, ServiceFlags::NONE),
            nonce: rand::random(),
            user_agent,
            start_height,
            relay: false,
        }
    }
}

/// Locator-based request body shared by getheaders/getblocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub version: u32,
    pub have: Vec<BlockHash>,
    pub stop: BlockHash,
}

impl Locator {
    pub fn new(have: Vec<BlockHash>) -> Locator {
        Locator {
            version: PROTOCOL_VERSION,
            have,
            stop: BlockHash::all_zeros(),
        }
    }
}

/// `filterload` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLoad {
    pub data: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

impl From<&BloomFilter> for FilterLoad {
    fn from(filter: &BloomFilter) -> FilterLoad {
        FilterLoad {
            data: filter.data().to_vec(),
            hash_funcs: filter.hash_funcs(),
            tweak: filter.tweak(),
            flags: filter.flags(),
        }
    }
}

/// `reject` payload; decoded leniently since it is advisory anyway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    pub message: String,
    pub code: u8,
    pub reason: String,
    pub data: Option<[u8; 32]>,
}

// =============================================================================
// MESSAGES
// =============================================================================

#[derive(Debug, Clone)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Inv(Vec<InvEntry>),
    GetData(Vec<InvEntry>),
    NotFound(Vec<InvEntry>),
    Tx(Transaction),
    Block(Box<Block>),
    MerkleBlock(MerkleBlock),
    Headers(Vec<Header>),
    GetHeaders(Locator),
    GetBlocks(Locator),
    FilterLoad(FilterLoad),
    FilterAdd(Vec<u8>),
    Reject(Reject),
    Unknown { command: String, length: usize },
}

impl Message {
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::Tx(_) => "tx",
            Message::Block(_) => "block",
            Message::MerkleBlock(_) => "merkleblock",
            Message::Headers(_) => "headers",
            Message::GetHeaders(_) => "getheaders",
            Message::GetBlocks(_) => "getblocks",
            Message::FilterLoad(_) => "filterload",
            Message::FilterAdd(_) => "filteradd",
            Message::Reject(_) => "reject",
            Message::Unknown { command, .. } => command,
        }
    }
}

// =============================================================================
// ENCODING
// =============================================================================

fn put_varint(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&serialize(&VarInt(value)));
}

fn encode_inv(entries: &[InvEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + entries.len() * 36);
    put_varint(&mut out, entries.len() as u64);
    for entry in entries {
        out.extend_from_slice(&entry.kind.to_le_bytes());
        out.extend_from_slice(&entry.hash);
    }
    out
}

fn encode_locator(locator: &Locator) -> Vec<u8> {
    let mut out = Vec::with_capacity(45 + locator.have.len() * 32);
    out.extend_from_slice(&locator.version.to_le_bytes());
    put_varint(&mut out, locator.have.len() as u64);
    for hash in &locator.have {
        out.extend_from_slice(&hash.to_byte_array());
    }
    out.extend_from_slice(&locator.stop.to_byte_array());
    out
}

/// Serialize one message payload (without the frame header).
pub fn encode_payload(msg: &Message) -> Vec<u8> {
    match msg {
        Message::Version(v) => {
            let mut out = Vec::with_capacity(128);
            out.extend_from_slice(&v.version.to_le_bytes());
            out.extend_from_slice(&v.services.to_u64().to_le_bytes());
            out.extend_from_slice(&v.timestamp.to_le_bytes());
            out.extend_from_slice(&serialize(&v.receiver));
            out.extend_from_slice(&serialize(&v.sender));
            out.extend_from_slice(&v.nonce.to_le_bytes());
            out.extend_from_slice(&serialize(&v.user_agent));
            out.extend_from_slice(&v.start_height.to_le_bytes());
            out.push(v.relay as u8);
            out
        }
        Message::Verack | Message::Unknown { .. } => Vec::new(),
        Message::Ping(nonce) | Message::Pong(nonce) => nonce.to_le_bytes().to_vec(),
        Message::Inv(entries) | Message::GetData(entries) | Message::NotFound(entries) => {
            encode_inv(entries)
        }
        Message::Tx(tx) => serialize(tx),
        Message::Block(block) => serialize(block.as_ref()),
        Message::MerkleBlock(mb) => {
            let mut out = serialize(&mb.header);
            out.extend_from_slice(&mb.total_transactions.to_le_bytes());
            put_varint(&mut out, mb.hashes.len() as u64);
            for hash in &mb.hashes {
                out.extend_from_slice(hash);
            }
            put_varint(&mut out, mb.flags.len() as u64);
            out.extend_from_slice(&mb.flags);
            out
        }
        Message::Headers(headers) => {
            let mut out = Vec::with_capacity(9 + headers.len() * 81);
            put_varint(&mut out, headers.len() as u64);
            for header in headers {
                out.extend_from_slice(&serialize(header));
                // Trailing transaction count, always zero in a headers message.
                put_varint(&mut out, 0);
            }
            out
        }
        Message::GetHeaders(locator) | Message::GetBlocks(locator) => encode_locator(locator),
        Message::FilterLoad(f) => {
            let mut out = Vec::with_capacity(f.data.len() + 18);
            put_varint(&mut out, f.data.len() as u64);
            out.extend_from_slice(&f.data);
            out.extend_from_slice(&f.hash_funcs.to_le_bytes());
            out.extend_from_slice(&f.tweak.to_le_bytes());
            out.push(f.flags);
            out
        }
        Message::FilterAdd(data) => {
            let mut out = Vec::with_capacity(data.len() + 9);
            put_varint(&mut out, data.len() as u64);
            out.extend_from_slice(data);
            out
        }
        Message::Reject(r) => {
            let mut out = Vec::new();
            out.extend_from_slice(&serialize(&r.message));
            out.push(r.code);
            out.extend_from_slice(&serialize(&r.reason));
            if let Some(data) = r.data {
                out.extend_from_slice(&data);
            }
            out
        }
    }
}

/// Serialize a complete frame: header plus payload.
pub fn build_frame(magic: [u8; 4], msg: &Message) -> Vec<u8> {
    let payload = encode_payload(msg);
    let name = msg.command();
    let mut command = [0u8; 12];
    command[..name.len().min(12)].copy_from_slice(&name.as_bytes()[..name.len().min(12)]);

    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&command);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum(&payload));
    out.extend_from_slice(&payload);
    out
}

// =============================================================================
// DECODING
// =============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], context: &'static str) -> Reader<'a> {
        Reader { buf, pos: 0, context }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated(self.context));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u32_le(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64_le(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn i32_le(&mut self) -> Result<i32, WireError> {
        Ok(self.u32_le()? as i32)
    }

    fn i64_le(&mut self) -> Result<i64, WireError> {
        Ok(self.u64_le()? as i64)
    }

    fn hash32(&mut self) -> Result<[u8; 32], WireError> {
        let b = self.take(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(b);
        Ok(out)
    }

    fn varint(&mut self) -> Result<u64, WireError> {
        let (v, used): (VarInt, usize) = deserialize_partial(&self.buf[self.pos..])?;
        self.pos += used;
        Ok(v.0)
    }

    fn counted(&mut self, cap: usize) -> Result<usize, WireError> {
        let count = self.varint()?;
        if count > cap as u64 {
            return Err(WireError::OversizedCount { count, cap: cap as u64 });
        }
        Ok(count as usize)
    }

    fn decode<T: encode::Decodable>(&mut self) -> Result<T, WireError> {
        let (v, used) = deserialize_partial(&self.buf[self.pos..])?;
        self.pos += used;
        Ok(v)
    }

    fn expect_empty(&self) -> Result<(), WireError> {
        if self.remaining() != 0 {
            return Err(WireError::TrailingBytes(self.context));
        }
        Ok(())
    }
}

fn decode_inv(payload: &[u8], context: &'static str) -> Result<Vec<InvEntry>, WireError> {
    let mut r = Reader::new(payload, context);
    let count = r.counted(MAX_INV_ENTRIES)?;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let kind = r.u32_le()?;
        let hash = r.hash32()?;
        entries.push(InvEntry { kind, hash });
    }
    r.expect_empty()?;
    Ok(entries)
}

fn decode_locator(payload: &[u8], context: &'static str) -> Result<Locator, WireError> {
    let mut r = Reader::new(payload, context);
    let version = r.u32_le()?;
    let count = r.counted(MAX_LOCATOR_HASHES)?;
    let mut have = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        have.push(BlockHash::from_byte_array(r.hash32()?));
    }
    let stop = BlockHash::from_byte_array(r.hash32()?);
    r.expect_empty()?;
    Ok(Locator { version, have, stop })
}

/// Decode a payload for a known command; unrecognized commands produce
/// `Message::Unknown` for the caller to log and drop.
pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Message, WireError> {
    match command {
        "version" => {
            let mut r = Reader::new(payload, "version");
            let version = r.i32_le()?;
            let services = ServiceFlags::from(r.u64_le()?);
            let timestamp = r.i64_le()?;
            let receiver: Address = r.decode()?;
            let sender: Address = r.decode()?;
            let nonce = r.u64_le()?;
            let user_agent: String = r.decode()?;
            let start_height = r.i32_le()?;
            // Pre-70001 peers omit the relay flag.
            let relay = if r.remaining() > 0 { r.u8()? != 0 } else { false };
            Ok(Message::Version(VersionMessage {
                version,
                services,
                timestamp,
                receiver,
                sender,
                nonce,
                user_agent,
                start_height,
                relay,
            }))
        }
        "verack" => Ok(Message::Verack),
        "ping" => {
            let mut r = Reader::new(payload, "ping");
            Ok(Message::Ping(r.u64_le()?))
        }
        "pong" => {
            let mut r = Reader::new(payload, "pong");
            Ok(Message::Pong(r.u64_le()?))
        }
        "inv" => Ok(Message::Inv(decode_inv(payload, "inv")?)),
        "getdata" => Ok(Message::GetData(decode_inv(payload, "getdata")?)),
        "notfound" => Ok(Message::NotFound(decode_inv(payload, "notfound")?)),
        "tx" => Ok(Message::Tx(encode::deserialize(payload)?)),
        "block" => Ok(Message::Block(Box::new(encode::deserialize(payload)?))),
        "merkleblock" => {
            let mut r = Reader::new(payload, "merkleblock");
            let header: Header = r.decode()?;
            let total_transactions = r.u32_le()?;
            let hash_count = r.counted(MAX_INV_ENTRIES)?;
            let mut hashes = Vec::with_capacity(hash_count.min(1024));
            for _ in 0..hash_count {
                hashes.push(r.hash32()?);
            }
            let flag_bytes = r.counted(MAX_INV_ENTRIES)?;
            let flags = r.take(flag_bytes)?.to_vec();
            r.expect_empty()?;
            Ok(Message::MerkleBlock(MerkleBlock {
                header,
                total_transactions,
                hashes,
                flags,
            }))
        }
        "headers" => {
            let mut r = Reader::new(payload, "headers");
            let count = r.counted(MAX_HEADERS_PER_MESSAGE)?;
            let mut headers = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let header: Header = r.decode()?;
                // Each entry carries a transaction count, zero by convention.
                r.varint()?;
                headers.push(header);
            }
            r.expect_empty()?;
            Ok(Message::Headers(headers))
        }
        "getheaders" => Ok(Message::GetHeaders(decode_locator(payload, "getheaders")?)),
        "getblocks" => Ok(Message::GetBlocks(decode_locator(payload, "getblocks")?)),
        "filterload" => {
            let mut r = Reader::new(payload, "filterload");
            let len = r.counted(MAX_FILTER_SIZE)?;
            let data = r.take(len)?.to_vec();
            let hash_funcs = r.u32_le()?;
            let tweak = r.u32_le()?;
            let flags = r.u8()?;
            r.expect_empty()?;
            Ok(Message::FilterLoad(FilterLoad {
                data,
                hash_funcs,
                tweak,
                flags,
            }))
        }
        "filteradd" => {
            let mut r = Reader::new(payload, "filteradd");
            let len = r.counted(520)?;
            let data = r.take(len)?.to_vec();
            r.expect_empty()?;
            Ok(Message::FilterAdd(data))
        }
        "reject" => {
            let mut r = Reader::new(payload, "reject");
            let message: String = r.decode()?;
            let code = r.u8()?;
            let reason: String = r.decode()?;
            let data = if r.remaining() >= 32 { Some(r.hash32()?) } else { None };
            Ok(Message::Reject(Reject {
                message,
                code,
                reason,
                data,
            }))
        }
        other => Ok(Message::Unknown {
            command: other.to_string(),
            length: payload.len(),
        }),
    }
}

/// Checksum-verify and decode a fully buffered frame payload.
pub fn decode_message(header: &FrameHeader, payload: &[u8]) -> Result<Message, WireError> {
    if payload.len() > max_payload_for(&header.command) {
        return Err(WireError::OversizedPayload {
            command: header.command.clone(),
            length: payload.len(),
        });
    }
    if checksum(payload) != header.checksum {
        return Err(WireError::BadChecksum(header.command.clone()));
    }
    decode_payload(&header.command, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::types::{MAINNET_MAGIC, TESTNET_MAGIC};
    use bitcoin::block::Version;
    use bitcoin::pow::CompactTarget;
    use bitcoin::TxMerkleNode;

    fn dummy_header(n: u8) -> Header {
        Header {
            version: Version::from_consensus(2),
            prev_blockhash: BlockHash::from_byte_array([n; 32]),
            merkle_root: TxMerkleNode::from_byte_array([n.wrapping_add(1); 32]),
            time: 1_444_000_000 + n as u32,
            bits: CompactTarget::from_consensus(0x1d00_ffff),
            nonce: n as u32,
        }
    }

    #[test]
    fn checksum_of_empty_payload() {
        assert_eq!(checksum(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn frame_round_trip() {
        let frame = build_frame(MAINNET_MAGIC, &Message::Ping(0xdead_beef));
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + 8);

        let header = FrameHeader::parse(&frame, MAINNET_MAGIC).unwrap();
        assert_eq!(header.command, "ping");
        assert_eq!(header.length, 8);

        let msg = decode_message(&header, &frame[FRAME_HEADER_SIZE..]).unwrap();
        match msg {
            Message::Ping(nonce) => assert_eq!(nonce, 0xdead_beef),
            other => panic!("unexpected {}", other.command()),
        }
    }

    #[test]
    fn wrong_magic_rejected() {
        let frame = build_frame(MAINNET_MAGIC, &Message::Verack);
        assert!(matches!(
            FrameHeader::parse(&frame, TESTNET_MAGIC),
            Err(WireError::BadMagic(_))
        ));
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let mut frame = build_frame(MAINNET_MAGIC, &Message::Ping(7));
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let header = FrameHeader::parse(&frame, MAINNET_MAGIC).unwrap();
        assert!(matches!(
            decode_message(&header, &frame[FRAME_HEADER_SIZE..]),
            Err(WireError::BadChecksum(_))
        ));
    }

    #[test]
    fn version_round_trip() {
        let remote: SocketAddr = "203.0.113.9:8333".parse().unwrap();
        let v = VersionMessage::outbound("/taper:0.1.0/".into(), remote, 576_576);
        let payload = encode_payload(&Message::Version(v.clone()));
        let decoded = decode_payload("version", &payload).unwrap();
        match decoded {
            Message::Version(got) => {
                assert_eq!(got, v);
                assert_eq!(got.services, ServiceFlags::NONE);
                assert!(!got.relay);
            }
            other => panic!("unexpected {}", other.command()),
        }
    }

    #[test]
    fn version_without_relay_byte() {
        let remote: SocketAddr = "203.0.113.9:8333".parse().unwrap();
        let v = VersionMessage::outbound("/taper:0.1.0/".into(), remote, -1);
        let mut payload = encode_payload(&Message::Version(v));
        payload.pop();
        match decode_payload("version", &payload).unwrap() {
            Message::Version(got) => {
                assert!(!got.relay);
                assert_eq!(got.start_height, -1);
            }
            other => panic!("unexpected {}", other.command()),
        }
    }

    #[test]
    fn inv_round_trip() {
        let entries = vec![
            InvEntry::tx(bitcoin::Txid::from_byte_array([1; 32])),
            InvEntry::filtered_block(BlockHash::from_byte_array([2; 32])),
        ];
        let payload = encode_payload(&Message::Inv(entries.clone()));
        match decode_payload("inv", &payload).unwrap() {
            Message::Inv(got) => assert_eq!(got, entries),
            other => panic!("unexpected {}", other.command()),
        }
    }

    #[test]
    fn headers_round_trip_skips_tx_counts() {
        let headers = vec![dummy_header(1), dummy_header(2), dummy_header(3)];
        let payload = encode_payload(&Message::Headers(headers.clone()));
        // varint count + 3 × (80-byte header + 1-byte zero count)
        assert_eq!(payload.len(), 1 + 3 * 81);
        match decode_payload("headers", &payload).unwrap() {
            Message::Headers(got) => assert_eq!(got, headers),
            other => panic!("unexpected {}", other.command()),
        }
    }

    #[test]
    fn locator_round_trip() {
        let locator = Locator::new(vec![
            BlockHash::from_byte_array([9; 32]),
            BlockHash::from_byte_array([8; 32]),
        ]);
        let payload = encode_payload(&Message::GetHeaders(locator.clone()));
        match decode_payload("getheaders", &payload).unwrap() {
            Message::GetHeaders(got) => assert_eq!(got, locator),
            other => panic!("unexpected {}", other.command()),
        }
    }

    #[test]
    fn filterload_matches_reference_layout() {
        let mut filter = BloomFilter::new(3, 0.01, 0, 1);
        filter.insert(&hex::decode("99108ad8ed9bb6274d3980bab5a85c048f0950c8").unwrap());
        filter.insert(&hex::decode("b5a2c786d9ef4658287ced5914b37a1b4aa32eee").unwrap());
        filter.insert(&hex::decode("b9300670b4c5366e95b2699e8b18bc75e5f729c5").unwrap());
        let payload = encode_payload(&Message::FilterLoad(FilterLoad::from(&filter)));
        assert_eq!(hex::encode(&payload), "03614e9b050000000000000001");
    }

    #[test]
    fn merkleblock_round_trip() {
        let mb = MerkleBlock {
            header: dummy_header(4),
            total_transactions: 7,
            hashes: vec![[1; 32], [2; 32]],
            flags: vec![0x1d, 0x03],
        };
        let payload = encode_payload(&Message::MerkleBlock(mb.clone()));
        match decode_payload("merkleblock", &payload).unwrap() {
            Message::MerkleBlock(got) => {
                assert_eq!(got.header, mb.header);
                assert_eq!(got.total_transactions, 7);
                assert_eq!(got.hashes, mb.hashes);
                assert_eq!(got.flags, mb.flags);
            }
            other => panic!("unexpected {}", other.command()),
        }
    }

    #[test]
    fn unknown_command_is_tolerated() {
        match decode_payload("sendheaders", &[]).unwrap() {
            Message::Unknown { command, length } => {
                assert_eq!(command, "sendheaders");
                assert_eq!(length, 0);
            }
            other => panic!("unexpected {}", other.command()),
        }
    }
}
