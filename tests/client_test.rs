//! Coordinator and peer protocol tests against an in-process remote peer.
//!
//! Each test binds a local listener that plays the remote full node,
//! points a client at it, and scripts the wire conversation.

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash;
use bitcoin::p2p::ServiceFlags;
use bitcoin::transaction::Version as TxVersion;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use std::sync::Arc;
use std::time::Duration;
use taper::net::wire::{self, FrameHeader, Message, VersionMessage};
use taper::net::{Client, ClientConfig, NetworkParams, INV_FILTERED_BLOCK, TESTNET_MAGIC};
use taper::net::{InvEntry, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn read_message(stream: &mut TcpStream) -> Message {
    let mut head = [0u8; wire::FRAME_HEADER_SIZE];
    timeout(WAIT, stream.read_exact(&mut head))
        .await
        .expect("frame header timed out")
        .expect("frame header read");
    let header = FrameHeader::parse(&head, TESTNET_MAGIC).expect("frame header");
    let mut payload = vec![0u8; header.length as usize];
    timeout(WAIT, stream.read_exact(&mut payload))
        .await
        .expect("payload timed out")
        .expect("payload read");
    wire::decode_message(&header, &payload).expect("decode")
}

async fn send_message(stream: &mut TcpStream, msg: &Message) {
    let frame = wire::build_frame(TESTNET_MAGIC, msg);
    stream.write_all(&frame).await.expect("write");
}

/// Remote's half of the handshake; returns once the client reports Connected
/// (verack read and filterload received).
async fn complete_handshake(stream: &mut TcpStream, start_height: i32) -> VersionMessage {
    let client_version = match read_message(stream).await {
        Message::Version(v) => v,
        other => panic!("expected version, got {}", other.command()),
    };

    let mut version = VersionMessage::outbound(
        "/fullnode:0.0/".into(),
        stream.peer_addr().expect("peer addr"),
        start_height,
    );
    version.services = ServiceFlags::NETWORK;
    send_message(stream, &Message::Version(version)).await;
    send_message(stream, &Message::Verack).await;

    match read_message(stream).await {
        Message::Verack => {}
        other => panic!("expected verack, got {}", other.command()),
    }
    match read_message(stream).await {
        Message::FilterLoad(_) => {}
        other => panic!("expected filterload, got {}", other.command()),
    }
    client_version
}

async fn client_against_listener(max_connections: usize) -> (Arc<Client>, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let mut config = ClientConfig::new(NetworkParams::testnet());
    config.max_connections = max_connections;
    let client = Arc::new(Client::new(vec![addr], config));
    let background = client.clone();
    tokio::spawn(async move { background.run().await });
    (client, listener)
}

fn one_in_one_out_tx() -> Transaction {
    Transaction {
        version: TxVersion::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

#[tokio::test]
async fn handshake_completes_and_installs_filter() {
    let (client, listener) = client_against_listener(1).await;
    let (mut stream, _) = timeout(WAIT, listener.accept()).await.expect("accept").expect("accept");

    let client_version = complete_handshake(&mut stream, 576_576).await;
    assert_eq!(client_version.version, PROTOCOL_VERSION as i32);
    assert_eq!(client_version.services, ServiceFlags::NONE);
    assert_eq!(client_version.start_height, 576_576);
    assert!(!client_version.relay);

    // The coordinator now counts one live peer.
    timeout(WAIT, async {
        while client.peer_count() != 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer never registered");
}

#[tokio::test]
async fn low_version_peer_is_disconnected() {
    let (client, listener) = client_against_listener(1).await;
    let (mut stream, _) = timeout(WAIT, listener.accept()).await.expect("accept").expect("accept");

    let _ = read_message(&mut stream).await; // client's version
    let mut version = VersionMessage::outbound(
        "/oldnode:0.0/".into(),
        stream.peer_addr().expect("peer addr"),
        576_576,
    );
    version.version = 60_002;
    version.services = ServiceFlags::NETWORK;
    send_message(&mut stream, &Message::Version(version)).await;

    // The client drops the connection without completing the handshake.
    let mut buf = [0u8; 1024];
    loop {
        match timeout(WAIT, stream.read(&mut buf)).await.expect("eof timed out") {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    timeout(WAIT, async {
        while client.peer_count() != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer never dropped");
}

#[tokio::test]
async fn non_network_services_are_rejected() {
    let (_client, listener) = client_against_listener(1).await;
    let (mut stream, _) = timeout(WAIT, listener.accept()).await.expect("accept").expect("accept");

    let _ = read_message(&mut stream).await;
    let version = VersionMessage::outbound(
        "/lightnode:0.0/".into(),
        stream.peer_addr().expect("peer addr"),
        576_576,
    );
    // services left at NONE: not a full node.
    send_message(&mut stream, &Message::Version(version)).await;

    let mut buf = [0u8; 1024];
    loop {
        match timeout(WAIT, stream.read(&mut buf)).await.expect("eof timed out") {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

#[tokio::test]
async fn frames_dribbled_byte_by_byte_dispatch_in_order() {
    let (_client, listener) = client_against_listener(1).await;
    let (mut stream, _) = timeout(WAIT, listener.accept()).await.expect("accept").expect("accept");
    complete_handshake(&mut stream, 576_576).await;

    // Three pings concatenated, delivered one byte at a time.
    let mut bytes = Vec::new();
    for nonce in [1u64, 2, 3] {
        bytes.extend_from_slice(&wire::build_frame(TESTNET_MAGIC, &Message::Ping(nonce)));
    }
    for byte in bytes {
        stream.write_all(&[byte]).await.expect("write");
        stream.flush().await.expect("flush");
    }

    for expected in [1u64, 2, 3] {
        match read_message(&mut stream).await {
            Message::Pong(nonce) => assert_eq!(nonce, expected),
            other => panic!("expected pong, got {}", other.command()),
        }
    }
}

#[tokio::test]
async fn block_announcements_request_the_filtered_form() {
    let (_client, listener) = client_against_listener(1).await;
    let (mut stream, _) = timeout(WAIT, listener.accept()).await.expect("accept").expect("accept");
    complete_handshake(&mut stream, 576_576).await;

    let block_hash = bitcoin::BlockHash::from_byte_array([0x42; 32]);
    send_message(&mut stream, &Message::Inv(vec![InvEntry::block(block_hash)])).await;

    match read_message(&mut stream).await {
        Message::GetData(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].kind, INV_FILTERED_BLOCK);
            assert_eq!(entries[0].block_hash(), block_hash);
        }
        other => panic!("expected getdata, got {}", other.command()),
    }
}

#[tokio::test]
async fn broadcast_resolves_true_once_announced_back() {
    let (client, listener) = client_against_listener(1).await;
    let (mut stream, _) = timeout(WAIT, listener.accept()).await.expect("accept").expect("accept");
    complete_handshake(&mut stream, 576_576).await;
    timeout(WAIT, async {
        while client.peer_count() != 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer never registered");

    let tx = one_in_one_out_tx();
    let txid = tx.compute_txid();
    let result = client.broadcast_tx(&serialize(&tx)).await.expect("broadcast");

    // With a single peer, the whole pool is in the filter-refresh half.
    match read_message(&mut stream).await {
        Message::FilterLoad(_) => {}
        other => panic!("expected filterload, got {}", other.command()),
    }

    // The remote can fetch the raw transaction on demand.
    send_message(&mut stream, &Message::GetData(vec![InvEntry::tx(txid)])).await;
    match read_message(&mut stream).await {
        Message::Tx(served) => assert_eq!(served.compute_txid(), txid),
        other => panic!("expected tx, got {}", other.command()),
    }

    // Echoing the inv meets the ceil(1/4) = 1 announcement threshold.
    send_message(&mut stream, &Message::Inv(vec![InvEntry::tx(txid)])).await;
    let resolved = timeout(WAIT, result)
        .await
        .expect("promise timed out")
        .expect("promise dropped");
    assert!(resolved);
}

#[tokio::test]
async fn broadcast_without_announcements_times_out_false() {
    let config = ClientConfig::new(NetworkParams::testnet());
    let client = Arc::new(Client::new(Vec::new(), config));
    let background = client.clone();
    tokio::spawn(async move { background.run().await });

    let tx = one_in_one_out_tx();
    let result = client.broadcast_tx(&serialize(&tx)).await.expect("broadcast");
    let resolved = timeout(Duration::from_secs(15), result)
        .await
        .expect("promise never resolved")
        .expect("promise dropped");
    assert!(!resolved);
}

#[tokio::test]
async fn taller_peer_triggers_header_download() {
    let (_client, listener) = client_against_listener(1).await;
    let (mut stream, _) = timeout(WAIT, listener.accept()).await.expect("accept").expect("accept");
    // Advertise 24 blocks beyond the client's checkpoint tip.
    complete_handshake(&mut stream, 576_600).await;

    let checkpoint_hash =
        "000000000000204500050ea47622bdd55a30c7c9eab4fc42b5ffc9128fa08370";
    match read_message(&mut stream).await {
        Message::GetHeaders(locator) => {
            assert_eq!(locator.have[0].to_string(), checkpoint_hash);
            assert_eq!(locator.stop, bitcoin::BlockHash::all_zeros());
        }
        other => panic!("expected getheaders, got {}", other.command()),
    }

    // An empty batch leaves the tip short of the target: the client asks
    // again rather than stalling.
    send_message(&mut stream, &Message::Headers(Vec::new())).await;
    match read_message(&mut stream).await {
        Message::GetHeaders(locator) => {
            assert_eq!(locator.have[0].to_string(), checkpoint_hash);
        }
        other => panic!("expected getheaders again, got {}", other.command()),
    }
}
