use crate::error::Result;
use crate::peer::spawn_connection;
use crate::torrent::{self, Torrent};
use crate::tracker::{generate_peer_id, AnnounceEvent, AnnounceRequest, TrackerClient};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Seconds until the next attempt after a failed announce
const TRACKER_RETRY_INTERVAL: u64 = 15;

/// Configuration for the client
pub struct ClientConfig {
    pub download_dir: String,
    pub listen_port: u16,
    pub max_peers: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: "./downloads".to_string(),
            listen_port: 6881,
            max_peers: 50,
        }
    }
}

/// Drives one torrent: announces to the tracker on its interval and
/// hands every returned peer address to a fresh connection task
pub struct TorrentClient {
    config: ClientConfig,
    peer_id: [u8; 20],
}

impl TorrentClient {
    pub fn new(config: ClientConfig) -> Self {
        let peer_id = generate_peer_id();
        info!(
            "Client initialized with peer_id: {}",
            String::from_utf8_lossy(&peer_id)
        );

        Self { config, peer_id }
    }

    /// Download a torrent, then keep seeding it until the process stops
    pub async fn download(&self, torrent_path: &Path) -> Result<()> {
        let meta = torrent::load_torrent_file(torrent_path).await?;

        info!("Torrent: {}", meta.info.name);
        info!("Total size: {} bytes", meta.info.total_length);
        info!("Pieces: {}", meta.info.piece_count());
        info!("Info hash: {}", meta.info_hash_hex());

        let torrent = Arc::new(
            Torrent::create(
                meta,
                &self.config.download_dir,
                self.config.max_peers,
                self.peer_id,
            )
            .await?,
        );

        let tracker = TrackerClient::new();
        let mut started = false;
        let mut reported_complete = false;

        loop {
            let left = torrent.pieces_left() as u64 * torrent.meta.info.piece_length;
            let mut request = AnnounceRequest::new(
                torrent.meta.info_hash,
                self.peer_id,
                self.config.listen_port,
                left,
            );

            if !started {
                request.event = Some(AnnounceEvent::Started);
                started = true;
            }
            if torrent.is_complete() && !reported_complete {
                request.event = Some(AnnounceEvent::Completed);
                reported_complete = true;
            }

            let interval = match tracker.announce(&torrent.meta.announce, &request).await {
                Ok(response) => {
                    for peer in &response.peers {
                        if torrent.connection_count() >= self.config.max_peers {
                            break;
                        }
                        spawn_connection(torrent.clone(), peer.0);
                    }
                    info!(
                        "{} connected peers, {} pieces left",
                        torrent.connection_count(),
                        torrent.pieces_left()
                    );
                    response.interval
                }
                Err(err) => {
                    warn!(
                        "Announce failed: {}; retrying in {}s",
                        err, TRACKER_RETRY_INTERVAL
                    );
                    TRACKER_RETRY_INTERVAL
                }
            };

            tokio::time::sleep(Duration::from_secs(interval)).await;
        }
    }
}

impl Default for TorrentClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}
