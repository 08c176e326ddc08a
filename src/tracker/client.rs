use super::{AnnounceRequest, AnnounceResponse};
use crate::bencode::decode;
use crate::error::{PeerwireError, Result};
use reqwest::Client;
use tracing::{debug, info};

/// HTTP announce client. UDP trackers are not supported; the announce
/// URL scheme must be http or https.
pub struct TrackerClient {
    http: Client,
}

impl TrackerClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    /// Announce to the tracker and return its peer list
    pub async fn announce(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        info!("Announcing to tracker: {}", tracker_url);

        let url = reqwest::Url::parse_with_params(tracker_url, request.query_params())?;
        debug!("Announce URL: {}", url);

        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PeerwireError::TrackerError(format!(
                "HTTP error: {}",
                status
            )));
        }

        let body = response.bytes().await?;
        let announce = AnnounceResponse::from_bencode(&decode(&body)?)?;

        info!(
            "Received {} peers from tracker (interval: {}s)",
            announce.peers.len(),
            announce.interval
        );

        Ok(announce)
    }
}

impl Default for TrackerClient {
    fn default() -> Self {
        Self::new()
    }
}
