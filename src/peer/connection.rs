use super::message::{BlockSpec, PeerMessage};
use super::protocol::exchange_handshake;
use super::stream::MessageStream;
use super::{Bitfield, PeerFlags};
use crate::error::{PeerwireError, Result};
use crate::piece::{verify_piece, PieceRequest};
use crate::torrent::{ConnectionId, Torrent};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Tear the connection down after this long without any inbound message
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);
/// Send a keepalive when no request-bearing message has gone out for this long
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
/// Idle wait granularity of the event loop
const LOOP_TICK: Duration = Duration::from_secs(1);
/// Piece requests this connection keeps in flight at once
const OUTSTANDING_PIECE_REQUESTS: usize = 1;
/// Bound on queued requests from the remote; overflow drops the oldest
const MAX_PEER_REQUESTS: usize = 16;

/// Start a connection to `addr` as an independent task, fire-and-forget.
/// Every outcome, including connect/handshake failure, ends in the same
/// teardown path; nothing is reported back to the caller.
pub fn spawn_connection(torrent: Arc<Torrent>, addr: SocketAddr) {
    tokio::spawn(run(torrent, addr));
}

async fn run(torrent: Arc<Torrent>, addr: SocketAddr) {
    if let Err(err) = connect_and_drive(torrent, addr).await {
        warn!("Peer {}: {}", addr, err);
    }
    info!("Closed peer connection {}", addr);
}

async fn connect_and_drive(torrent: Arc<Torrent>, addr: SocketAddr) -> Result<()> {
    let mut socket = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            PeerwireError::PeerError(format!(
                "Peer {} timed out after {}s",
                addr,
                CONNECT_TIMEOUT.as_secs()
            ))
        })??;
    info!("Connection to peer {} established", addr);

    let remote_id = timeout(
        HANDSHAKE_TIMEOUT,
        exchange_handshake(&mut socket, torrent.meta.info_hash, torrent.peer_id),
    )
    .await
    .map_err(|_| PeerwireError::PeerError(format!("Handshake with {} timed out", addr)))??;
    info!(
        "Successful handshake with peer {}",
        String::from_utf8_lossy(&remote_id)
    );

    let (id, have_rx) = torrent.state.register_connection(addr);
    let stream = MessageStream::new(socket, torrent.meta.info.piece_count());
    let mut session = Session::new(torrent.clone(), stream, addr, id, have_rx);

    let result = session.drive().await;

    // Single teardown path no matter where the session stopped
    torrent.state.unregister_connection(id);
    info!(
        "Peer connection summary: blocks uploaded: {}, downloaded: {}",
        session.blocks_sent, session.blocks_recvd
    );

    result
}

/// Per-connection state, owned exclusively by this connection's task
struct Session<S> {
    torrent: Arc<Torrent>,
    stream: MessageStream<S>,
    addr: SocketAddr,
    id: ConnectionId,
    have_rx: mpsc::Receiver<u32>,
    have_open: bool,
    local: PeerFlags,
    remote: PeerFlags,
    /// Pieces the remote advertises
    peer_have: Bitfield,
    /// Pieces we have advertised; advisory snapshot of shared state
    local_have: Bitfield,
    /// Our in-flight piece downloads
    local_requests: Vec<PieceRequest>,
    /// Blocks the remote asked of us
    peer_requests: VecDeque<BlockSpec>,
    blocks_sent: u64,
    blocks_recvd: u64,
    last_message: Instant,
    last_request: Option<Instant>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(
        torrent: Arc<Torrent>,
        stream: MessageStream<S>,
        addr: SocketAddr,
        id: ConnectionId,
        have_rx: mpsc::Receiver<u32>,
    ) -> Self {
        let num_pieces = torrent.meta.info.piece_count();
        let local_have = torrent.state.snapshot_bitmap();

        Self {
            torrent,
            stream,
            addr,
            id,
            have_rx,
            have_open: true,
            local: PeerFlags::default(),
            remote: PeerFlags::default(),
            peer_have: Bitfield::new(num_pieces),
            local_have,
            local_requests: Vec::new(),
            peer_requests: VecDeque::new(),
            blocks_sent: 0,
            blocks_recvd: 0,
            last_message: Instant::now(),
            last_request: None,
        }
    }

    async fn drive(&mut self) -> Result<()> {
        self.stream
            .send(&PeerMessage::Bitfield {
                bits: self.local_have.as_bytes().to_vec(),
            })
            .await?;

        // Trivial choking policy: everyone we talk to gets unchoked
        self.stream.send(&PeerMessage::Unchoke).await?;
        self.remote.choked = false;
        debug!("Unchoked peer {}", self.addr);

        loop {
            if self.last_message.elapsed() > INACTIVITY_TIMEOUT {
                return Err(PeerwireError::PeerError(format!(
                    "Connection with peer {} timed out",
                    self.addr
                )));
            }

            if self
                .last_request
                .is_some_and(|at| at.elapsed() > KEEPALIVE_INTERVAL)
            {
                debug!("No requests for a while, sending keepalive to {}", self.addr);
                self.stream.send(&PeerMessage::KeepAlive).await?;
                self.last_request = Some(Instant::now());
            }

            self.relay_have_events().await?;
            self.process_buffered_messages().await?;

            // Upload first; new downloads wait until the remote is served
            if !self.peer_requests.is_empty() {
                self.service_peer_requests().await?;
            } else if !self.local.choked && self.local.interested {
                self.send_requests().await?;
            }

            self.wait_for_activity().await?;
        }
    }

    /// Park until bytes arrive, a sibling completes a piece, or a tick
    /// elapses so the timeout checks get another look
    async fn wait_for_activity(&mut self) -> Result<()> {
        tokio::select! {
            res = self.stream.fill() => res,
            event = self.have_rx.recv(), if self.have_open => match event {
                Some(index) => self.relay_have(index).await,
                None => {
                    self.have_open = false;
                    Ok(())
                }
            },
            _ = tokio::time::sleep(LOOP_TICK) => Ok(()),
        }
    }

    async fn relay_have_events(&mut self) -> Result<()> {
        while let Ok(index) = self.have_rx.try_recv() {
            self.relay_have(index).await?;
        }
        Ok(())
    }

    async fn relay_have(&mut self, index: u32) -> Result<()> {
        self.local_have.set(index as usize);
        self.stream
            .send(&PeerMessage::Have { piece_index: index })
            .await?;
        info!("Event serviced: have ({}) relayed to peer {}", index, self.addr);
        Ok(())
    }

    async fn process_buffered_messages(&mut self) -> Result<()> {
        while self.stream.has_complete_message() {
            let msg = self.stream.next_message().await?;
            self.last_message = Instant::now();
            self.handle_message(msg).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, msg: PeerMessage) -> Result<()> {
        match msg {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => self.local.choked = true,
            PeerMessage::Unchoke => {
                debug!("Unchoked by peer {}", self.addr);
                self.local.choked = false;
            }
            PeerMessage::Interested => {
                debug!("Peer {} interested in us", self.addr);
                self.remote.interested = true;
            }
            PeerMessage::NotInterested => self.remote.interested = false,
            PeerMessage::Have { piece_index } => self.handle_have(piece_index).await?,
            PeerMessage::Bitfield { bits } => self.handle_bitfield(bits).await?,
            PeerMessage::Request { block } => self.handle_request(block),
            PeerMessage::Piece {
                piece_index,
                begin,
                data,
            } => self.handle_piece(piece_index, begin, data).await?,
            // Accepted for protocol compatibility, no effect
            PeerMessage::Cancel { .. } | PeerMessage::Port { .. } => {}
        }
        Ok(())
    }

    async fn handle_have(&mut self, piece_index: u32) -> Result<()> {
        let index = piece_index as usize;
        if index >= self.peer_have.num_bits() {
            return Err(PeerwireError::ProtocolError(format!(
                "Have index {} out of range",
                piece_index
            )));
        }

        if !self.local.interested && !self.local_have.has(index) {
            self.show_interested().await?;
        }
        self.peer_have.set(index);
        Ok(())
    }

    async fn handle_bitfield(&mut self, bits: Vec<u8>) -> Result<()> {
        self.peer_have = Bitfield::from_bytes(bits, self.peer_have.num_bits())?;

        if !self.local.interested && self.torrent.state.wants_any(&self.peer_have) {
            self.show_interested().await?;
        }
        Ok(())
    }

    fn handle_request(&mut self, block: BlockSpec) {
        if self.remote.choked {
            debug!("Discarding request from choked peer {}", self.addr);
            return;
        }

        debug!(
            "Queueing request from {}: piece {} begin {} len {}",
            self.addr, block.piece_index, block.begin, block.length
        );

        if self.peer_requests.len() == MAX_PEER_REQUESTS {
            self.peer_requests.pop_front();
            debug!("Peer request queue full, dropped oldest entry");
        }
        self.peer_requests.push_back(block);
    }

    async fn handle_piece(&mut self, piece_index: u32, begin: u32, data: Vec<u8>) -> Result<()> {
        self.blocks_recvd += 1;

        let Some(pos) = self
            .local_requests
            .iter()
            .position(|r| r.piece_index == piece_index)
        else {
            debug!(
                "Ignoring block for piece {} with no outstanding request",
                piece_index
            );
            return Ok(());
        };

        {
            let request = &mut self.local_requests[pos];
            let Some(block) = request.match_block(begin, data.len() as u32) else {
                debug!(
                    "Ignoring unmatched block: piece {} begin {} len {}",
                    piece_index,
                    begin,
                    data.len()
                );
                return Ok(());
            };

            self.torrent.store.write_block(&block.slices, &data).await?;
            block.completed = true;
            request.blocks_left -= 1;

            if request.blocks_left > 0 {
                return Ok(());
            }
        }

        // Every block landed; the bytes are on disk, check them
        self.local_requests.swap_remove(pos);
        let verified = match verify_piece(
            &self.torrent.meta.info,
            &self.torrent.store,
            piece_index,
        )
        .await
        {
            Ok(ok) => ok,
            Err(err) => {
                error!(
                    "Could not read piece {} back for verification: {}",
                    piece_index, err
                );
                false
            }
        };

        if !verified {
            warn!(
                "Piece {} does not have the expected SHA-1 digest",
                piece_index
            );
            self.torrent
                .state
                .mark_failed_verification(piece_index as usize);
            return Ok(());
        }

        info!("Successfully downloaded piece {}", piece_index);
        self.complete_piece(piece_index).await
    }

    async fn complete_piece(&mut self, piece_index: u32) -> Result<()> {
        let became_complete = self.torrent.state.mark_have(piece_index as usize);
        self.local_have.set(piece_index as usize);

        if became_complete {
            self.torrent.store.finalize().await?;
            info!("Torrent completed");
        }

        self.stream
            .send(&PeerMessage::Have { piece_index })
            .await?;
        self.torrent.state.notify_piece_complete(piece_index, self.id);
        Ok(())
    }

    async fn service_peer_requests(&mut self) -> Result<()> {
        debug!("Servicing piece requests from {}", self.addr);

        while let Some(request) = self.peer_requests.pop_front() {
            let plan = PieceRequest::plan(&self.torrent.meta.info, request.piece_index);
            let Some(block) = plan.block_at(request.begin) else {
                warn!(
                    "Peer {} requested unknown block: piece {} begin {}",
                    self.addr, request.piece_index, request.begin
                );
                continue;
            };
            if block.length != request.length {
                warn!(
                    "Peer {} requested odd block length {} at piece {} begin {}",
                    self.addr, request.length, request.piece_index, request.begin
                );
                continue;
            }

            let data = self.torrent.store.read_block(&block.slices).await?;
            self.stream
                .send(&PeerMessage::Piece {
                    piece_index: request.piece_index,
                    begin: request.begin,
                    data,
                })
                .await?;
            self.blocks_sent += 1;
        }
        Ok(())
    }

    async fn send_requests(&mut self) -> Result<()> {
        let budget = OUTSTANDING_PIECE_REQUESTS.saturating_sub(self.local_requests.len());
        let mut starved = false;

        for _ in 0..budget {
            let Some(index) = self.torrent.state.claim_next_piece(&self.peer_have) else {
                debug!("Could not find a piece to request from {}", self.addr);
                starved = true;
                break;
            };

            info!("Requesting piece {} from {}", index, self.addr);
            let request = PieceRequest::plan(&self.torrent.meta.info, index as u32);
            for block in &request.blocks {
                self.stream
                    .send(&PeerMessage::Request {
                        block: BlockSpec {
                            piece_index: index as u32,
                            begin: block.begin,
                            length: block.length,
                        },
                    })
                    .await?;
                self.last_request = Some(Instant::now());
            }
            self.local_requests.push(request);
        }

        if self.local.interested && starved {
            self.show_not_interested().await?;
        }
        Ok(())
    }

    async fn show_interested(&mut self) -> Result<()> {
        self.stream.send(&PeerMessage::Interested).await?;
        self.local.interested = true;
        debug!("Showed interested to peer {}", self.addr);
        Ok(())
    }

    async fn show_not_interested(&mut self) -> Result<()> {
        self.stream.send(&PeerMessage::NotInterested).await?;
        self.local.interested = false;
        debug!("Showed not interested to peer {}", self.addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{Metainfo, PieceDigests, TorrentInfo};
    use sha1::{Digest, Sha1};
    use tempfile::TempDir;
    use tokio::io::DuplexStream;

    const PIECE_LEN: u64 = 16;
    const NUM_PIECES: usize = 4;

    fn test_content() -> Vec<u8> {
        (0..(PIECE_LEN as usize * NUM_PIECES))
            .map(|i| i as u8)
            .collect()
    }

    fn test_meta() -> Metainfo {
        let content = test_content();
        let mut digests = Vec::new();
        for chunk in content.chunks(PIECE_LEN as usize) {
            let mut hasher = Sha1::new();
            hasher.update(chunk);
            digests.extend_from_slice(&hasher.finalize());
        }

        Metainfo {
            announce: "http://tracker.local/announce".to_string(),
            announce_list: None,
            info: TorrentInfo {
                name: "payload.bin".to_string(),
                piece_length: PIECE_LEN,
                piece_digests: PieceDigests::from_bytes(&digests).unwrap(),
                files: vec![crate::torrent::FileInfo {
                    path: vec!["payload.bin".to_string()],
                    length: content.len() as u64,
                }],
                total_length: content.len() as u64,
            },
            info_hash: [7u8; 20],
        }
    }

    async fn test_session() -> (
        Session<DuplexStream>,
        MessageStream<DuplexStream>,
        Arc<Torrent>,
        TempDir,
    ) {
        let dir = TempDir::new().unwrap();
        let torrent = Arc::new(
            Torrent::create(test_meta(), dir.path(), 8, [1u8; 20])
                .await
                .unwrap(),
        );

        let addr: SocketAddr = "127.0.0.1:51413".parse().unwrap();
        let (id, have_rx) = torrent.state.register_connection(addr);
        let (near, far) = tokio::io::duplex(64 * 1024);

        let session = Session::new(
            torrent.clone(),
            MessageStream::new(near, NUM_PIECES),
            addr,
            id,
            have_rx,
        );
        let remote = MessageStream::new(far, NUM_PIECES);

        (session, remote, torrent, dir)
    }

    #[tokio::test]
    async fn test_have_for_wanted_piece_triggers_interest() {
        let (mut session, mut remote, _torrent, _dir) = test_session().await;
        assert!(!session.local.interested);

        session
            .handle_message(PeerMessage::Have { piece_index: 2 })
            .await
            .unwrap();

        // Interest goes out before anything else
        assert_eq!(remote.next_message().await.unwrap(), PeerMessage::Interested);
        assert!(session.local.interested);
        assert!(session.peer_have.has(2));
    }

    #[tokio::test]
    async fn test_have_for_owned_piece_stays_quiet() {
        let (mut session, _remote, _torrent, _dir) = test_session().await;
        session.local_have.set(2);

        session
            .handle_message(PeerMessage::Have { piece_index: 2 })
            .await
            .unwrap();
        assert!(!session.local.interested);
    }

    #[tokio::test]
    async fn test_have_out_of_range_is_protocol_error() {
        let (mut session, _remote, _torrent, _dir) = test_session().await;
        let result = session
            .handle_message(PeerMessage::Have { piece_index: 99 })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bitfield_with_new_pieces_triggers_interest() {
        let (mut session, mut remote, _torrent, _dir) = test_session().await;

        session
            .handle_message(PeerMessage::Bitfield {
                bits: vec![0b1111_0000],
            })
            .await
            .unwrap();

        assert_eq!(remote.next_message().await.unwrap(), PeerMessage::Interested);
        assert!(session.peer_have.has(0));
        assert!(session.peer_have.has(3));
    }

    #[tokio::test]
    async fn test_bitfield_of_wrong_size_is_fatal() {
        let (mut session, _remote, _torrent, _dir) = test_session().await;
        let result = session
            .handle_message(PeerMessage::Bitfield {
                bits: vec![0xFF, 0xFF],
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unexpected_block_is_ignored() {
        let (mut session, _remote, torrent, _dir) = test_session().await;
        let left_before = torrent.pieces_left();

        session
            .handle_message(PeerMessage::Piece {
                piece_index: 1,
                begin: 0,
                data: vec![0u8; PIECE_LEN as usize],
            })
            .await
            .unwrap();

        assert_eq!(torrent.pieces_left(), left_before);
        assert_eq!(session.blocks_recvd, 1);
        assert!(session.local_requests.is_empty());
    }

    #[tokio::test]
    async fn test_verified_piece_completes_and_fans_out() {
        let (mut session, mut remote, torrent, _dir) = test_session().await;

        // A sibling connection that should hear about the piece
        let sibling_addr: SocketAddr = "127.0.0.1:51414".parse().unwrap();
        let (_sibling_id, mut sibling_rx) = torrent.state.register_connection(sibling_addr);

        let claimed = {
            let mut everything = Bitfield::new(NUM_PIECES);
            for i in 0..NUM_PIECES {
                everything.set(i);
            }
            torrent.state.claim_next_piece(&everything).unwrap()
        };
        session
            .local_requests
            .push(PieceRequest::plan(&torrent.meta.info, claimed as u32));

        let content = test_content();
        let start = claimed * PIECE_LEN as usize;
        session
            .handle_message(PeerMessage::Piece {
                piece_index: claimed as u32,
                begin: 0,
                data: content[start..start + PIECE_LEN as usize].to_vec(),
            })
            .await
            .unwrap();

        assert_eq!(torrent.pieces_left(), NUM_PIECES - 1);
        assert!(session.local_requests.is_empty());
        assert!(session.local_have.has(claimed));

        // The remote hears a HAVE, the sibling gets the fan-out event
        assert_eq!(
            remote.next_message().await.unwrap(),
            PeerMessage::Have {
                piece_index: claimed as u32
            }
        );
        assert_eq!(sibling_rx.try_recv().unwrap(), claimed as u32);

        // The completed piece is never offered again
        let mut everything = Bitfield::new(NUM_PIECES);
        for i in 0..NUM_PIECES {
            everything.set(i);
        }
        assert_ne!(torrent.state.claim_next_piece(&everything), Some(claimed));
    }

    #[tokio::test]
    async fn test_corrupt_piece_is_released_for_retry() {
        let (mut session, _remote, torrent, _dir) = test_session().await;

        let sibling_addr: SocketAddr = "127.0.0.1:51415".parse().unwrap();
        let (_sibling_id, mut sibling_rx) = torrent.state.register_connection(sibling_addr);

        let mut everything = Bitfield::new(NUM_PIECES);
        for i in 0..NUM_PIECES {
            everything.set(i);
        }
        let claimed = torrent.state.claim_next_piece(&everything).unwrap();
        session
            .local_requests
            .push(PieceRequest::plan(&torrent.meta.info, claimed as u32));

        session
            .handle_message(PeerMessage::Piece {
                piece_index: claimed as u32,
                begin: 0,
                data: vec![0xAB; PIECE_LEN as usize],
            })
            .await
            .unwrap();

        // Nothing completed, no HAVE fanned out, and the piece is
        // claimable again
        assert_eq!(torrent.pieces_left(), NUM_PIECES);
        assert!(sibling_rx.try_recv().is_err());
        assert_eq!(torrent.state.claim_next_piece(&everything), Some(claimed));
    }

    #[tokio::test]
    async fn test_request_queue_drops_oldest_when_full() {
        let (mut session, _remote, _torrent, _dir) = test_session().await;
        session.remote.choked = false;

        for i in 0..(MAX_PEER_REQUESTS as u32 + 1) {
            session.handle_request(BlockSpec {
                piece_index: 0,
                begin: i,
                length: 1,
            });
        }

        assert_eq!(session.peer_requests.len(), MAX_PEER_REQUESTS);
        assert_eq!(session.peer_requests.front().unwrap().begin, 1);
        assert_eq!(
            session.peer_requests.back().unwrap().begin,
            MAX_PEER_REQUESTS as u32
        );
    }

    #[tokio::test]
    async fn test_requests_from_choked_peer_are_discarded() {
        let (mut session, _remote, _torrent, _dir) = test_session().await;

        session.handle_request(BlockSpec {
            piece_index: 0,
            begin: 0,
            length: PIECE_LEN as u32,
        });
        assert!(session.peer_requests.is_empty());
    }

    #[tokio::test]
    async fn test_serves_stored_blocks_back() {
        let (mut session, mut remote, torrent, _dir) = test_session().await;
        session.remote.choked = false;

        // Store piece 0 the way a download would have
        let content = test_content();
        let plan = PieceRequest::plan(&torrent.meta.info, 0);
        torrent
            .store
            .write_block(&plan.blocks[0].slices, &content[..PIECE_LEN as usize])
            .await
            .unwrap();

        session.handle_request(BlockSpec {
            piece_index: 0,
            begin: 0,
            length: PIECE_LEN as u32,
        });
        session.service_peer_requests().await.unwrap();

        assert_eq!(
            remote.next_message().await.unwrap(),
            PeerMessage::Piece {
                piece_index: 0,
                begin: 0,
                data: content[..PIECE_LEN as usize].to_vec(),
            }
        );
        assert_eq!(session.blocks_sent, 1);
    }

    #[tokio::test]
    async fn test_starved_connection_shows_not_interested() {
        let (mut session, mut remote, torrent, _dir) = test_session().await;
        session.local.interested = true;
        session.local.choked = false;

        // Everything the peer has is already complete locally
        for i in 0..NUM_PIECES {
            torrent.state.mark_have(i);
        }
        session.peer_have = torrent.state.snapshot_bitmap();

        session.send_requests().await.unwrap();

        assert!(!session.local.interested);
        assert_eq!(
            remote.next_message().await.unwrap(),
            PeerMessage::NotInterested
        );
    }

    #[tokio::test]
    async fn test_requests_claimed_piece_block_by_block() {
        let (mut session, mut remote, _torrent, _dir) = test_session().await;
        session.local.interested = true;
        session.local.choked = false;
        for i in 0..NUM_PIECES {
            session.peer_have.set(i);
        }

        session.send_requests().await.unwrap();

        assert_eq!(session.local_requests.len(), 1);
        assert!(session.last_request.is_some());
        assert_eq!(
            remote.next_message().await.unwrap(),
            PeerMessage::Request {
                block: BlockSpec {
                    piece_index: 0,
                    begin: 0,
                    length: PIECE_LEN as u32,
                },
            }
        );

        // The outstanding budget is spent; nothing more goes out
        session.send_requests().await.unwrap();
        assert_eq!(session.local_requests.len(), 1);
    }
}
