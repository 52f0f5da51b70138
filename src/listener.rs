//! Event listener interfaces
//!
//! Two capabilities: chain-download progress and peer connect/disconnect.
//! Implementors override what they care about; every method has a no-op
//! default. Registration goes through the [`Listener`] capability enum.

use bitcoin::BlockHash;
use std::net::SocketAddr;
use std::sync::Arc;

/// Observe the initial chain download.
pub trait DownloadListener: Send + Sync {
    /// Download kicked off against `peer` with roughly `blocks_left` to go.
    fn download_started(&self, _peer: SocketAddr, _blocks_left: u32) {}

    /// A header or filtered block was validated and committed.
    fn on_block_downloaded(&self, _peer: SocketAddr, _block: &BlockHash, _blocks_left: u32) {}

    /// Periodic progress, in whole percent.
    fn progress(&self, _percent: u32, _blocks_downloaded: u32) {}

    /// The local tip reached the download peer's starting height.
    fn download_complete(&self) {}
}

/// Observe peer pool membership.
pub trait PeerEventListener: Send + Sync {
    fn on_peer_connected(&self, _peer: SocketAddr, _peer_count: usize) {}
    fn on_peer_disconnected(&self, _peer: SocketAddr, _peer_count: usize) {}
}

/// A listener registration, matched by capability.
pub enum Listener {
    Download(Arc<dyn DownloadListener>),
    PeerEvents(Arc<dyn PeerEventListener>),
}

/// Registered listeners, fanned out by the coordinator.
#[derive(Default)]
pub(crate) struct Listeners {
    download: Vec<Arc<dyn DownloadListener>>,
    peer: Vec<Arc<dyn PeerEventListener>>,
}

impl Listeners {
    pub fn register(&mut self, listener: Listener) {
        match listener {
            Listener::Download(l) => self.download.push(l),
            Listener::PeerEvents(l) => self.peer.push(l),
        }
    }

    pub fn download_started(&self, peer: SocketAddr, blocks_left: u32) {
        for l in &self.download {
            l.download_started(peer, blocks_left);
        }
    }

    pub fn on_block_downloaded(&self, peer: SocketAddr, block: &BlockHash, blocks_left: u32) {
        for l in &self.download {
            l.on_block_downloaded(peer, block, blocks_left);
        }
    }

    pub fn progress(&self, percent: u32, blocks_downloaded: u32) {
        for l in &self.download {
            l.progress(percent, blocks_downloaded);
        }
    }

    pub fn download_complete(&self) {
        for l in &self.download {
            l.download_complete();
        }
    }

    pub fn on_peer_connected(&self, peer: SocketAddr, peer_count: usize) {
        for l in &self.peer {
            l.on_peer_connected(peer, peer_count);
        }
    }

    pub fn on_peer_disconnected(&self, peer: SocketAddr, peer_count: usize) {
        for l in &self.peer {
            l.on_peer_disconnected(peer, peer_count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        connects: AtomicUsize,
        completes: AtomicUsize,
    }

    impl PeerEventListener for Recorder {
        fn on_peer_connected(&self, _peer: SocketAddr, _count: usize) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl DownloadListener for Recorder {
        fn download_complete(&self) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn registration_matches_capability() {
        let recorder = Arc::new(Recorder::default());
        let mut listeners = Listeners::default();
        listeners.register(Listener::PeerEvents(recorder.clone()));
        listeners.register(Listener::Download(recorder.clone()));

        let addr: SocketAddr = "127.0.0.1:8333".parse().unwrap();
        listeners.on_peer_connected(addr, 1);
        listeners.download_complete();
        listeners.on_peer_disconnected(addr, 0);

        assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.completes.load(Ordering::SeqCst), 1);
    }
}
