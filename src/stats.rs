//! Transfer statistics
//!
//! Accounts bytes carried through port forwards, bucketed per server and
//! per destination. Destinations are classified by regex rewrite rules
//! supplied by the API session; unmatched hosts land in a catch-all
//! bucket. Accumulated payloads are drained for periodic status requests
//! and merged back when a request fails.

use crate::helper::split_host_port;
use crate::transport::TunnelStream;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Bucket name for destinations no regex claims
pub const OTHER_BUCKET: &str = "(OTHER)";

/// Bytes carried for one destination bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostBytes {
    /// Bytes sent toward the destination
    pub sent: u64,
    /// Bytes received from the destination
    pub received: u64,
}

/// Accumulated transfer stats for one server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsPayload {
    /// Total bytes sent through the server
    pub total_bytes_sent: u64,
    /// Total bytes received through the server
    pub total_bytes_received: u64,
    /// Per-destination-bucket byte counts
    pub bytes_by_host: HashMap<String, HostBytes>,
}

impl StatsPayload {
    /// Whether there is anything worth reporting
    pub fn is_empty(&self) -> bool {
        self.total_bytes_sent == 0
            && self.total_bytes_received == 0
            && self.bytes_by_host.is_empty()
    }

    /// Fold another payload into this one
    pub fn merge(&mut self, other: StatsPayload) {
        self.total_bytes_sent += other.total_bytes_sent;
        self.total_bytes_received += other.total_bytes_received;
        for (host, bytes) in other.bytes_by_host {
            let entry = self.bytes_by_host.entry(host).or_default();
            entry.sent += bytes.sent;
            entry.received += bytes.received;
        }
    }
}

/// A destination classification rule: hosts matching `pattern` are
/// bucketed under the pattern's rewrite of the host
#[derive(Debug, Clone)]
pub struct StatsRegex {
    /// Pattern matched against the destination host
    pub pattern: Regex,
    /// Replacement producing the bucket name
    pub replacement: String,
}

/// Classify a destination host into a reporting bucket
pub fn classify_host(host: &str, regexes: &[StatsRegex]) -> String {
    for rule in regexes {
        if rule.pattern.is_match(host) {
            return rule
                .pattern
                .replace(host, rule.replacement.as_str())
                .into_owned();
        }
    }
    OTHER_BUCKET.to_string()
}

/// Transfer-byte accounting service
pub trait StatsService: Send + Sync {
    /// Drain the pending payload for a server, if any
    fn get_for_server(&self, ip_address: &str) -> Option<StatsPayload>;

    /// Return a payload that could not be submitted
    fn put_back(&self, ip_address: &str, payload: StatsPayload);

    /// Wrap a forward's stream so its traffic is accounted under
    /// `server_id`, bucketed by classifying `remote_addr`
    fn new_accounting_stream(
        &self,
        inner: Box<dyn TunnelStream>,
        server_id: &str,
        regexes: &[StatsRegex],
        remote_addr: &str,
    ) -> Box<dyn TunnelStream>;
}

/// In-memory [`StatsService`]
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    pending: Arc<Mutex<HashMap<String, StatsPayload>>>,
}

impl TransferStats {
    /// Create an empty accumulator
    pub fn new() -> Self {
        TransferStats::default()
    }

    fn record(
        pending: &Mutex<HashMap<String, StatsPayload>>,
        server_id: &str,
        bucket: &str,
        sent: u64,
        received: u64,
    ) {
        let mut pending = pending.lock().expect("stats lock poisoned");
        let payload = pending.entry(server_id.to_string()).or_default();
        payload.total_bytes_sent += sent;
        payload.total_bytes_received += received;
        let host = payload.bytes_by_host.entry(bucket.to_string()).or_default();
        host.sent += sent;
        host.received += received;
    }
}

impl StatsService for TransferStats {
    fn get_for_server(&self, ip_address: &str) -> Option<StatsPayload> {
        let mut pending = self.pending.lock().expect("stats lock poisoned");
        match pending.remove(ip_address) {
            Some(payload) if !payload.is_empty() => Some(payload),
            _ => None,
        }
    }

    fn put_back(&self, ip_address: &str, payload: StatsPayload) {
        let mut pending = self.pending.lock().expect("stats lock poisoned");
        pending.entry(ip_address.to_string()).or_default().merge(payload);
    }

    fn new_accounting_stream(
        &self,
        inner: Box<dyn TunnelStream>,
        server_id: &str,
        regexes: &[StatsRegex],
        remote_addr: &str,
    ) -> Box<dyn TunnelStream> {
        let host = split_host_port(remote_addr)
            .map(|(host, _)| host)
            .unwrap_or(remote_addr);
        Box::new(AccountingStream {
            inner,
            pending: self.pending.clone(),
            server_id: server_id.to_string(),
            bucket: classify_host(host, regexes),
        })
    }
}

/// Stream wrapper that counts carried bytes
struct AccountingStream {
    inner: Box<dyn TunnelStream>,
    pending: Arc<Mutex<HashMap<String, StatsPayload>>>,
    server_id: String,
    bucket: String,
}

impl AsyncRead for AccountingStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let received = (buf.filled().len() - before) as u64;
                if received > 0 {
                    TransferStats::record(
                        &this.pending,
                        &this.server_id,
                        &this.bucket,
                        0,
                        received,
                    );
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for AccountingStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, data) {
            Poll::Ready(Ok(written)) => {
                if written > 0 {
                    TransferStats::record(
                        &this.pending,
                        &this.server_id,
                        &this.bucket,
                        written as u64,
                        0,
                    );
                }
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn rules() -> Vec<StatsRegex> {
        vec![
            StatsRegex {
                pattern: Regex::new(r"^.*\.example\.com$").unwrap(),
                replacement: "example.com".to_string(),
            },
            StatsRegex {
                pattern: Regex::new(r"^video\.service$").unwrap(),
                replacement: "video".to_string(),
            },
        ]
    }

    #[test]
    fn test_classify_host() {
        let rules = rules();
        assert_eq!(classify_host("www.example.com", &rules), "example.com");
        assert_eq!(classify_host("cdn.example.com", &rules), "example.com");
        assert_eq!(classify_host("video.service", &rules), "video");
        assert_eq!(classify_host("unrelated.net", &rules), OTHER_BUCKET);
        assert_eq!(classify_host("anything", &[]), OTHER_BUCKET);
    }

    #[test]
    fn test_payload_merge() {
        let mut a = StatsPayload::default();
        a.total_bytes_sent = 10;
        a.bytes_by_host.insert(
            "example.com".to_string(),
            HostBytes {
                sent: 10,
                received: 0,
            },
        );

        let mut b = StatsPayload::default();
        b.total_bytes_sent = 5;
        b.total_bytes_received = 7;
        b.bytes_by_host.insert(
            "example.com".to_string(),
            HostBytes {
                sent: 5,
                received: 7,
            },
        );

        a.merge(b);
        assert_eq!(a.total_bytes_sent, 15);
        assert_eq!(a.total_bytes_received, 7);
        let host = &a.bytes_by_host["example.com"];
        assert_eq!(host.sent, 15);
        assert_eq!(host.received, 7);
    }

    #[test]
    fn test_get_for_server_drains() {
        let stats = TransferStats::new();
        assert!(stats.get_for_server("192.0.2.1").is_none());

        TransferStats::record(&stats.pending, "192.0.2.1", "bucket", 100, 50);
        let payload = stats.get_for_server("192.0.2.1").unwrap();
        assert_eq!(payload.total_bytes_sent, 100);
        assert_eq!(payload.total_bytes_received, 50);

        // drained
        assert!(stats.get_for_server("192.0.2.1").is_none());

        // put_back restores it for the next attempt
        stats.put_back("192.0.2.1", payload);
        let payload = stats.get_for_server("192.0.2.1").unwrap();
        assert_eq!(payload.total_bytes_sent, 100);
    }

    #[tokio::test]
    async fn test_accounting_stream_counts_bytes() {
        let stats = TransferStats::new();
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut stream = stats.new_accounting_stream(
            Box::new(local),
            "192.0.2.1",
            &rules(),
            "www.example.com:443",
        );

        stream.write_all(b"0123456789").await.unwrap();
        remote.write_all(b"abcd").await.unwrap();

        let mut buf = [0u8; 10];
        remote.read_exact(&mut buf).await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();

        let payload = stats.get_for_server("192.0.2.1").unwrap();
        assert_eq!(payload.total_bytes_sent, 10);
        assert_eq!(payload.total_bytes_received, 4);
        let host = &payload.bytes_by_host["example.com"];
        assert_eq!(host.sent, 10);
        assert_eq!(host.received, 4);
    }
}
