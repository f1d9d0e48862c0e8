//! The HTTP tracker client (§4.5, §6).
//!
//! Only the compact peer list format is supported: a tracker that responds
//! with the dictionary-model peer list is treated as a protocol error (§1
//! Non-goals exclude the non-compact format, UDP trackers, and scrape).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use url::Url;

use crate::{
    error::{Result, TrackerError},
    conf::EngineConf,
    PeerId, Sha1Hash,
};

/// Bytes that must be percent-encoded when embedding a raw 20-byte hash
/// into a query string, matching the usual `info_hash`/`peer_id` quoting
/// rules (anything outside unreserved ASCII).
const QUERY_COMPONENT: &AsciiSet = NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Why we're announcing, sent as the tracker's `event` parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
    Completed,
    /// A periodic re-announce, not one of the three significant lifecycle
    /// events, so `event` is omitted entirely.
    None,
}

impl Event {
    fn as_str(self) -> Option<&'static str> {
        match self {
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
            Event::Completed => Some("completed"),
            Event::None => None,
        }
    }
}

/// The parameters of a single announce request.
#[derive(Clone, Debug)]
pub struct AnnounceParams {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
}

/// A peer as returned by the tracker's compact peer list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
}

/// The parsed result of a successful announce.
#[derive(Clone, Debug)]
pub struct AnnounceResponse {
    pub interval: std::time::Duration,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Deserialize)]
struct RawAnnounceResponse {
    #[serde(default)]
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<i64>,
    #[serde(with = "serde_bytes", default)]
    peers: Option<Vec<u8>>,
}

/// A thin client for a single torrent's HTTP tracker.
pub struct TrackerClient {
    announce_url: String,
    http: reqwest::Client,
}

impl TrackerClient {
    pub fn new(announce_url: String, conf: &EngineConf, timeout: std::time::Duration) -> Self {
        let _ = conf;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("tracker http client fails to build");
        Self {
            announce_url,
            http,
        }
    }

    /// Sends an announce request and parses the compact peer list out of the
    /// response.
    pub async fn announce(&self, params: AnnounceParams) -> Result<AnnounceResponse, TrackerError> {
        let url = self.build_url(&params)?;
        let bytes = self.http.get(url).send().await?.bytes().await?;
        let raw: RawAnnounceResponse = serde_bencode::from_bytes(&bytes)?;

        if let Some(reason) = raw.failure_reason {
            return Err(TrackerError::Failure(reason));
        }

        let peers_bytes = raw.peers.ok_or(TrackerError::NonCompactPeerList)?;
        let peers = parse_compact_peers(&peers_bytes)?;
        let interval = std::time::Duration::from_secs(raw.interval.unwrap_or(1800).max(0) as u64);

        Ok(AnnounceResponse { interval, peers })
    }

    fn build_url(&self, params: &AnnounceParams) -> Result<Url, TrackerError> {
        let info_hash = percent_encode(&params.info_hash, QUERY_COMPONENT).to_string();
        let peer_id = percent_encode(&params.peer_id, QUERY_COMPONENT).to_string();

        let mut url = Url::parse(&self.announce_url).map_err(|_| TrackerError::InvalidAnnounceUrl)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("port", &params.port.to_string())
                .append_pair("uploaded", &params.uploaded.to_string())
                .append_pair("downloaded", &params.downloaded.to_string())
                .append_pair("left", &params.left.to_string())
                .append_pair("compact", "1");
            if let Some(event) = params.event.as_str() {
                query.append_pair("event", event);
            }
        }
        // info_hash and peer_id are raw 20-byte strings, not valid UTF-8 in
        // general, so they're appended to the raw query string by hand
        // rather than through `query_pairs_mut`, which would re-encode them
        // as if they were text.
        let separator = if url.query().is_some() { "&" } else { "?" };
        let raw_query = format!(
            "{}{}info_hash={}&peer_id={}",
            url.query().unwrap_or(""),
            separator,
            info_hash,
            peer_id
        );
        url.set_query(Some(&raw_query));
        Ok(url)
    }
}

/// Decodes a compact peer list: 6 bytes per peer, 4 bytes big-endian IPv4
/// address followed by a 2 byte big-endian port.
fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<PeerInfo>, TrackerError> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::InvalidPeerListLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            PeerInfo {
                addr: SocketAddr::new(IpAddr::V4(ip), port),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peer_list() {
        let bytes = [127, 0, 0, 1, 0x1A, 0xE1, 192, 168, 1, 1, 0x1A, 0xE2];
        let peers = parse_compact_peers(&bytes).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(
            peers[0].addr,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6881)
        );
        assert_eq!(
            peers[1].addr,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 6882)
        );
    }

    #[test]
    fn rejects_peer_list_not_a_multiple_of_six() {
        let bytes = [0u8; 7];
        assert!(matches!(
            parse_compact_peers(&bytes),
            Err(TrackerError::InvalidPeerListLength(7))
        ));
    }

    #[test]
    fn build_url_percent_encodes_info_hash_and_peer_id() {
        let client = TrackerClient::new(
            "http://tracker.example:6969/announce".to_string(),
            &EngineConf {
                client_id: *crate::conf::DEFAULT_CLIENT_ID,
                listen_port: 6881,
            },
            std::time::Duration::from_secs(5),
        );
        let params = AnnounceParams {
            info_hash: [0xffu8; 20],
            peer_id: *crate::conf::DEFAULT_CLIENT_ID,
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1024,
            event: Event::Started,
        };
        let url = client.build_url(&params).unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("event=started"));
        assert!(query.contains("compact=1"));
        assert!(query.contains("info_hash=%FF%FF"));
    }

    #[tokio::test]
    async fn announce_decodes_compact_peers_from_a_real_http_response() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers12:");
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2]);
        body.push(b'e');

        let _mock = mockito::mock("GET", mockito::Matcher::Regex("^/announce".into()))
            .with_status(200)
            .with_body(body)
            .create();

        let client = TrackerClient::new(
            format!("{}/announce", mockito::server_url()),
            &EngineConf {
                client_id: *crate::conf::DEFAULT_CLIENT_ID,
                listen_port: 6881,
            },
            std::time::Duration::from_secs(5),
        );
        let params = AnnounceParams {
            info_hash: [1u8; 20],
            peer_id: *crate::conf::DEFAULT_CLIENT_ID,
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1024,
            event: Event::Started,
        };

        let response = client.announce(params).await.unwrap();
        assert_eq!(response.peers.len(), 2);
        assert_eq!(
            response.peers[0].addr,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6881)
        );
        assert_eq!(
            response.peers[1].addr,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 6882)
        );
    }

    #[tokio::test]
    async fn announce_surfaces_tracker_failure_reason() {
        let _mock = mockito::mock("GET", mockito::Matcher::Regex("^/announce".into()))
            .with_status(200)
            .with_body(b"d14:failure reason17:torrent not founde")
            .create();

        let client = TrackerClient::new(
            format!("{}/announce", mockito::server_url()),
            &EngineConf {
                client_id: *crate::conf::DEFAULT_CLIENT_ID,
                listen_port: 6881,
            },
            std::time::Duration::from_secs(5),
        );
        let params = AnnounceParams {
            info_hash: [2u8; 20],
            peer_id: *crate::conf::DEFAULT_CLIENT_ID,
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1024,
            event: Event::Started,
        };

        let result = client.announce(params).await;
        assert!(matches!(result, Err(TrackerError::Failure(reason)) if reason == "torrent not found"));
    }
}
