//! Peer HTTP Client
//!
//! Reaches other nodes' HTTP API to push blocks and fetch chains.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::{Error, Result};
use crate::ledger::Block;
use crate::replication::{PeerTransport, SyncOutcome, SyncRequest, SyncResponse};

/// `PeerTransport` over the nodes' HTTP API
pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    /// Create a client whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    fn url(peer: &str, path: &str) -> String {
        if peer.starts_with("http://") || peer.starts_with("https://") {
            format!("{}{}", peer.trim_end_matches('/'), path)
        } else {
            format!("http://{}{}", peer, path)
        }
    }
}

#[async_trait]
impl PeerTransport for HttpPeerClient {
    async fn push_block(&self, peer: &str, block: &Block) -> Result<SyncOutcome> {
        let response = self
            .client
            .post(Self::url(peer, "/sync"))
            .json(&SyncRequest { block: block.clone() })
            .send()
            .await
            .map_err(|e| connection_error(peer, e))?;

        match response.status() {
            StatusCode::OK | StatusCode::CONFLICT => {
                let body: SyncResponse = response.json().await?;
                Ok(body.into_outcome())
            }
            status => Err(Error::Network(format!("{} answered /sync with {}", peer, status))),
        }
    }

    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>> {
        let response = self
            .client
            .get(Self::url(peer, "/blockchain"))
            .send()
            .await
            .map_err(|e| connection_error(peer, e))?
            .error_for_status()?;

        Ok(response.json().await?)
    }
}

fn connection_error(peer: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::ConnectionTimeout(peer.to_string())
    } else {
        Error::ConnectionFailed {
            address: peer.to_string(),
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        assert_eq!(HttpPeerClient::url("node2:5000", "/sync"), "http://node2:5000/sync");
        assert_eq!(
            HttpPeerClient::url("http://node2:5000/", "/blockchain"),
            "http://node2:5000/blockchain"
        );
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_connectivity_error() {
        let client = HttpPeerClient::new(Duration::from_millis(200)).unwrap();
        let err = client.fetch_chain("127.0.0.1:1").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
