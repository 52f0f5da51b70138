//! DNS seed discovery
//!
//! Bootstrap peer addresses come from the fixed seed hostnames; every
//! resolved A record is paired with the network's default port.

use super::types::{NetworkParams, MAINNET_SEEDS, TESTNET_SEEDS};
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::{debug, info, warn};

/// DNS seed resolver for one network.
pub struct DnsSeeds {
    seeds: Vec<String>,
    port: u16,
}

impl DnsSeeds {
    pub fn mainnet() -> DnsSeeds {
        DnsSeeds {
            seeds: MAINNET_SEEDS.iter().map(|s| s.to_string()).collect(),
            port: 8333,
        }
    }

    pub fn testnet() -> DnsSeeds {
        DnsSeeds {
            seeds: TESTNET_SEEDS.iter().map(|s| s.to_string()).collect(),
            port: 18333,
        }
    }

    pub fn for_params(params: &NetworkParams) -> DnsSeeds {
        DnsSeeds {
            seeds: params.dns_seeds.iter().map(|s| s.to_string()).collect(),
            port: params.port,
        }
    }

    pub fn with_seeds(seeds: Vec<String>, port: u16) -> DnsSeeds {
        DnsSeeds { seeds, port }
    }

    /// Resolve every seed, deduplicated. Failures are logged and skipped.
    pub fn resolve(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::new();
        for seed in &self.seeds {
            match self.resolve_seed(seed) {
                Ok(resolved) => {
                    debug!("seed {} resolved to {} addresses", seed, resolved.len());
                    addrs.extend(resolved);
                }
                Err(e) => warn!("failed to resolve {}: {}", seed, e),
            }
        }
        addrs.sort();
        addrs.dedup();
        info!("DNS discovery returned {} peers", addrs.len());
        addrs
    }

    fn resolve_seed(&self, seed: &str) -> Result<Vec<SocketAddr>, std::io::Error> {
        let lookup = format!("{}:{}", seed, self.port);
        Ok(lookup.to_socket_addrs()?.collect())
    }

    /// Resolve off the async runtime's worker threads.
    pub async fn resolve_async(&self) -> Vec<SocketAddr> {
        let seeds = self.seeds.clone();
        let port = self.port;
        tokio::task::spawn_blocking(move || DnsSeeds { seeds, port }.resolve())
            .await
            .unwrap_or_default()
    }
}

/// One-shot discovery against the standard seeds of the chosen network.
pub async fn dns_discover(testnet: bool) -> Vec<SocketAddr> {
    let resolver = if testnet {
        DnsSeeds::testnet()
    } else {
        DnsSeeds::mainnet()
    };
    resolver.resolve_async().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_localhost() {
        let dns = DnsSeeds::with_seeds(vec!["localhost".into()], 8333);
        let addrs = dns.resolve();
        assert!(addrs.iter().all(|a| a.port() == 8333));
    }

    #[test]
    fn unresolvable_seed_is_skipped() {
        let dns = DnsSeeds::with_seeds(vec!["invalid.invalid".into()], 18333);
        assert!(dns.resolve().is_empty());
    }
}
