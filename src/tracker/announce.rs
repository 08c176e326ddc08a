use crate::bencode::BencodeValue;
use crate::error::{PeerwireError, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Lifecycle events reported alongside an announce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// Parameters of one announce to the tracker
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes still missing locally
    pub left: u64,
    pub event: Option<AnnounceEvent>,
}

impl AnnounceRequest {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], port: u16, left: u64) -> Self {
        Self {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left,
            event: None,
        }
    }

    /// Query parameters for the HTTP announce URL; compact peer lists
    /// are always requested
    pub fn query_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("info_hash".to_string(), percent_encode(&self.info_hash)),
            ("peer_id".to_string(), percent_encode(&self.peer_id)),
            ("port".to_string(), self.port.to_string()),
            ("uploaded".to_string(), self.uploaded.to_string()),
            ("downloaded".to_string(), self.downloaded.to_string()),
            ("left".to_string(), self.left.to_string()),
            ("compact".to_string(), "1".to_string()),
        ];

        if let Some(event) = self.event {
            params.push(("event".to_string(), event.as_str().to_string()));
        }

        params
    }
}

fn percent_encode(bytes: &[u8; 20]) -> String {
    bytes.iter().map(|b| format!("%{:02x}", b)).collect()
}

/// A peer address handed back by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

impl PeerAddr {
    /// Parse one peer from the 6-byte compact form (4 IP + 2 port)
    fn from_compact(chunk: &[u8]) -> Option<Self> {
        if chunk.len() != 6 {
            return None;
        }
        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
        Some(Self(SocketAddr::new(IpAddr::V4(ip), port)))
    }
}

/// The tracker's reply to an announce
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds to wait before the next announce
    pub interval: u64,
    pub peers: Vec<PeerAddr>,
}

impl AnnounceResponse {
    pub fn from_bencode(value: &BencodeValue) -> Result<Self> {
        if let Some(reason) = value.get(b"failure reason") {
            return Err(PeerwireError::TrackerError(
                reason.as_str().unwrap_or("Unknown failure").to_string(),
            ));
        }

        let interval = value
            .get(b"interval")
            .and_then(|v| v.as_int())
            .ok_or_else(|| {
                PeerwireError::TrackerError("Missing 'interval' field".to_string())
            })? as u64;

        let peers_value = value.get(b"peers").ok_or_else(|| {
            PeerwireError::TrackerError("Missing 'peers' field".to_string())
        })?;

        let peers = match peers_value {
            // Compact form: a flat run of 6-byte entries
            BencodeValue::Bytes(data) => data
                .chunks_exact(6)
                .filter_map(PeerAddr::from_compact)
                .collect(),
            BencodeValue::List(entries) => entries
                .iter()
                .map(parse_peer_dict)
                .collect::<Result<Vec<_>>>()?,
            _ => {
                return Err(PeerwireError::TrackerError(
                    "Invalid 'peers' format".to_string(),
                ))
            }
        };

        Ok(AnnounceResponse { interval, peers })
    }
}

fn parse_peer_dict(entry: &BencodeValue) -> Result<PeerAddr> {
    let ip: IpAddr = entry
        .get(b"ip")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| PeerwireError::TrackerError("Invalid peer 'ip'".to_string()))?;

    let port = entry
        .get(b"port")
        .and_then(|v| v.as_int())
        .ok_or_else(|| PeerwireError::TrackerError("Missing peer 'port'".to_string()))?
        as u16;

    Ok(PeerAddr(SocketAddr::new(ip, port)))
}
