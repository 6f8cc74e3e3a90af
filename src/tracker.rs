//! HTTP(S) tracker announce client (BEP 3), with BEP 23 compact peer lists.
//!
//! UDP tracker announce (BEP 15) is not implemented; non-HTTP(S) announce
//! URLs are rejected when the tracker is constructed rather than at
//! announce time, so that an unsupported torrent fails fast instead of
//! during the event loop.

use std::{net::SocketAddr, time::Duration};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use url::Url;

use crate::{bencode, error::*, PeerId, Sha1Hash};

/// The event accompanying an announce request, per BEP 3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The first announce of a download.
    Started,
    /// Sent when the download completes.
    Completed,
    /// Sent on graceful shutdown.
    Stopped,
    /// A periodic, non-eventful re-announce.
    None,
}

impl Event {
    fn as_query_value(&self) -> Option<&'static str> {
        match self {
            Self::Started => Some("started"),
            Self::Completed => Some("completed"),
            Self::Stopped => Some("stopped"),
            Self::None => None,
        }
    }
}

/// The parameters of a single announce request.
#[derive(Clone, Copy, Debug)]
pub struct AnnounceParams {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub port: u16,
    pub event: Event,
}

/// A tracker's announce response.
#[derive(Clone, Debug)]
pub struct AnnounceResponse {
    /// How long to wait, at minimum, before announcing again.
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
}

/// A client for a single torrent's announce URL.
pub struct Tracker {
    announce_url: Url,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    http: reqwest::Client,
}

impl Tracker {
    /// Parses and validates the announce URL, rejecting anything other than
    /// `http://` or `https://`.
    pub fn new(announce: &str, info_hash: Sha1Hash, peer_id: PeerId) -> Result<Self> {
        let url = Url::parse(announce)?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::UnsupportedTrackerScheme(other.to_string()));
            }
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            announce_url: url,
            info_hash,
            peer_id,
            http,
        })
    }

    /// Sends an announce request and parses the response.
    pub async fn announce(&self, params: AnnounceParams) -> Result<AnnounceResponse> {
        let mut url = self.announce_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("port", &params.port.to_string())
                .append_pair("uploaded", &params.uploaded.to_string())
                .append_pair("downloaded", &params.downloaded.to_string())
                .append_pair("left", &params.left.to_string())
                .append_pair("compact", "1")
                .append_pair("numwant", "80");
            if let Some(event) = params.event.as_query_value() {
                query.append_pair("event", event);
            }
        }
        // `info_hash` and `peer_id` must be percent-encoded byte-exactly
        // (BEP 3): `url`'s own query encoder would UTF-8-mangle raw bytes,
        // so these two are appended manually instead of via query_pairs_mut.
        let info_hash = percent_encode(&self.info_hash, NON_ALPHANUMERIC);
        let peer_id = percent_encode(&self.peer_id, NON_ALPHANUMERIC);
        let mut raw = url.to_string();
        raw.push_str(&format!("&info_hash={}&peer_id={}", info_hash, peer_id));

        log::debug!("Announcing to {}", self.announce_url);
        let response = self.http.get(raw).send().await?;
        let body = response.bytes().await?;
        Self::parse_response(&body)
    }

    fn parse_response(body: &[u8]) -> Result<AnnounceResponse> {
        let (value, _) = bencode::decode(body)?;

        if let Some(reason) = value.get("failure reason").and_then(|v| v.as_bytes()) {
            return Err(Error::TrackerFailure(
                String::from_utf8_lossy(reason).to_string(),
            ));
        }

        let interval = value
            .get("interval")
            .and_then(|v| v.as_int())
            .unwrap_or(30 * 60) as u64;

        let peers = match value.get("peers") {
            Some(v) if v.as_bytes().is_some() => {
                Self::parse_compact_peers(v.as_bytes().unwrap())
            }
            Some(v) if v.as_list().is_some() => Self::parse_peer_list(v.as_list().unwrap()),
            _ => Vec::new(),
        };

        Ok(AnnounceResponse {
            interval: Duration::from_secs(interval),
            peers,
        })
    }

    /// Parses BEP 23's compact peer list: a string of 6-byte entries, each a
    /// 4-byte big-endian IPv4 address followed by a 2-byte big-endian port.
    fn parse_compact_peers(raw: &[u8]) -> Vec<SocketAddr> {
        raw.chunks_exact(6)
            .map(|chunk| {
                let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::from((ip, port))
            })
            .collect()
    }

    /// Parses the non-compact peer list form: a list of dictionaries each
    /// with `ip` and `port` keys.
    fn parse_peer_list(list: &[bencode::Value]) -> Vec<SocketAddr> {
        list.iter()
            .filter_map(|peer| {
                let ip = peer.get("ip")?.as_bytes()?;
                let ip = std::str::from_utf8(ip).ok()?;
                let ip: std::net::IpAddr = ip.parse().ok()?;
                let port = peer.get("port")?.as_int()? as u16;
                Some(SocketAddr::from((ip, port)))
            })
            .collect()
    }
}
