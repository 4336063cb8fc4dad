//! Network access for escrow certificates
//!
//! Escrow certificate URLs that are not local paths need a reachable network.
//! The check is a plain TCP connect to the certificate host with a short
//! timeout; the download itself goes through `reqwest` when the `http-escrow`
//! feature is enabled.

use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{info, warn};

/// Connectivity timeout for the reachability probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Network connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    /// TCP connection to the probed host succeeded
    Online,
    /// TCP connection failed or timed out
    Offline,
}

impl NetworkState {
    /// Returns true if network connectivity is available.
    pub fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "Online"),
            Self::Offline => write!(f, "Offline"),
        }
    }
}

/// Probe `host:port` with a TCP connect.
///
/// Returns `NetworkState::Offline` if the name does not resolve, the
/// connection is refused or it times out.
pub fn detect_connectivity(host: &str, port: u16) -> NetworkState {
    let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            warn!("Failed to resolve {}: {}", host, e);
            return NetworkState::Offline;
        }
    };

    for addr in addrs {
        match TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) {
            Ok(_stream) => {
                info!("Network connectivity confirmed (TCP to {})", addr);
                return NetworkState::Online;
            }
            Err(e) => warn!("Network connectivity check to {} failed: {}", addr, e),
        }
    }
    NetworkState::Offline
}

/// Returns true if an escrow URL points at the local filesystem.
pub fn is_local_url(url: &str) -> bool {
    url.starts_with('/') || url.starts_with("file:")
}

/// Source of escrow certificates reachable over the network.
pub trait EscrowFetcher {
    /// Connectivity towards the host serving `url`.
    fn network_state(&mut self, url: &str) -> NetworkState;

    /// Download the certificate at `url`.
    fn fetch(&mut self, url: &str) -> Result<Vec<u8>, String>;
}

/// Fetcher for environments without network access; every network URL fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineFetcher;

impl EscrowFetcher for OfflineFetcher {
    fn network_state(&mut self, _url: &str) -> NetworkState {
        NetworkState::Offline
    }

    fn fetch(&mut self, url: &str) -> Result<Vec<u8>, String> {
        Err(format!("cannot download {} without network access", url))
    }
}

/// HTTP(S) fetcher backed by a blocking `reqwest` client.
#[cfg(feature = "http-escrow")]
#[derive(Debug, Default)]
pub struct HttpEscrowFetcher {
    client: Option<reqwest::blocking::Client>,
}

#[cfg(feature = "http-escrow")]
impl HttpEscrowFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&mut self) -> Result<&reqwest::blocking::Client, String> {
        if self.client.is_none() {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| format!("failed to build HTTP client: {}", e))?;
            self.client = Some(client);
        }
        self.client
            .as_ref()
            .ok_or_else(|| "HTTP client unavailable".to_string())
    }
}

#[cfg(feature = "http-escrow")]
impl EscrowFetcher for HttpEscrowFetcher {
    fn network_state(&mut self, url: &str) -> NetworkState {
        let parsed = match reqwest::Url::parse(url) {
            Ok(u) => u,
            Err(e) => {
                warn!("Invalid escrow URL {}: {}", url, e);
                return NetworkState::Offline;
            }
        };
        match (parsed.host_str(), parsed.port_or_known_default()) {
            (Some(host), Some(port)) => detect_connectivity(host, port),
            _ => NetworkState::Offline,
        }
    }

    fn fetch(&mut self, url: &str) -> Result<Vec<u8>, String> {
        let response = self
            .client()?
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("failed to download {}: {}", url, e))?;
        let bytes = response
            .bytes()
            .map_err(|e| format!("failed to read {}: {}", url, e))?;
        Ok(bytes.to_vec())
    }
}

/// Default fetcher for the enabled feature set.
pub fn default_fetcher() -> Box<dyn EscrowFetcher> {
    #[cfg(feature = "http-escrow")]
    {
        Box::new(HttpEscrowFetcher::new())
    }
    #[cfg(not(feature = "http-escrow"))]
    {
        Box::new(OfflineFetcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_urls() {
        assert!(is_local_url("/root/escrow.pem"));
        assert!(is_local_url("file:///root/escrow.pem"));
        assert!(!is_local_url("https://example.com/escrow.pem"));
        assert!(!is_local_url("ftp://example.com/escrow.pem"));
    }

    #[test]
    fn test_offline_fetcher_refuses() {
        let mut fetcher = OfflineFetcher;
        assert_eq!(fetcher.network_state("http://example.com/c.pem"), NetworkState::Offline);
        assert!(fetcher.fetch("http://example.com/c.pem").is_err());
    }

    #[test]
    fn test_network_state_display() {
        assert_eq!(NetworkState::Online.to_string(), "Online");
        assert!(!NetworkState::Offline.is_online());
    }
}
