use crate::peer::Bitfield;
use crate::piece::PieceState;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Have notifications queued per connection before drops kick in
const HAVE_QUEUE_DEPTH: usize = 10;

/// Identity of one peer connection task, used to address its have
/// channel through the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Whether the torrent is still fetching pieces or only serving them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Leeching,
    Seeding,
}

struct Registration {
    id: ConnectionId,
    addr: SocketAddr,
    have_tx: mpsc::Sender<u32>,
}

struct Shared {
    piece_states: Vec<PieceState>,
    pieces_left: usize,
    completed: bool,
    stage: Stage,
    connections: Vec<Registration>,
}

/// Torrent-wide download state shared by every peer connection. All
/// fields sit behind one mutex; each operation is a short scan or flag
/// flip, so a single coarse lock is sufficient at realistic peer counts.
pub struct TorrentState {
    max_peers: usize,
    shared: Mutex<Shared>,
}

impl TorrentState {
    pub fn new(num_pieces: usize, max_peers: usize) -> Self {
        Self {
            max_peers,
            shared: Mutex::new(Shared {
                piece_states: vec![PieceState::NotRequested; num_pieces],
                pieces_left: num_pieces,
                completed: false,
                stage: Stage::Leeching,
                connections: Vec::new(),
            }),
        }
    }

    /// Pick a piece to download from a peer advertising `peer_have`.
    /// A piece some connection already claimed is preferred over opening
    /// a fresh one, bounding the spread of outstanding work; the chosen
    /// piece is marked Requested before the lock is released.
    pub fn claim_next_piece(&self, peer_have: &Bitfield) -> Option<usize> {
        let mut shared = self.shared.lock().unwrap();

        let mut in_flight = None;
        let mut fresh = None;
        for (index, state) in shared.piece_states.iter().enumerate() {
            if !peer_have.has(index) {
                continue;
            }
            match state {
                PieceState::Requested => {
                    in_flight = Some(index);
                    break;
                }
                PieceState::NotRequested if fresh.is_none() => fresh = Some(index),
                _ => {}
            }
        }

        let chosen = in_flight.or(fresh)?;
        shared.piece_states[chosen] = PieceState::Requested;
        Some(chosen)
    }

    /// Record a verified piece. Returns true exactly once: on the call
    /// that drives the remaining count to zero.
    pub fn mark_have(&self, index: usize) -> bool {
        let mut shared = self.shared.lock().unwrap();

        if shared.piece_states[index] == PieceState::Have {
            return false;
        }

        shared.piece_states[index] = PieceState::Have;
        shared.pieces_left -= 1;
        debug!("Pieces left: {}", shared.pieces_left);

        if shared.pieces_left == 0 && !shared.completed {
            shared.completed = true;
            shared.stage = Stage::Seeding;
            return true;
        }
        false
    }

    /// Return a piece to the pool after failed verification so any
    /// connection may retry it
    pub fn mark_failed_verification(&self, index: usize) {
        let mut shared = self.shared.lock().unwrap();
        if shared.piece_states[index] == PieceState::Requested {
            shared.piece_states[index] = PieceState::NotRequested;
        }
    }

    /// Bitmap of verified pieces, for a new connection's opening bitfield
    pub fn snapshot_bitmap(&self) -> Bitfield {
        let shared = self.shared.lock().unwrap();
        let mut bitmap = Bitfield::new(shared.piece_states.len());
        for (index, state) in shared.piece_states.iter().enumerate() {
            if *state == PieceState::Have {
                bitmap.set(index);
            }
        }
        bitmap
    }

    /// Does the peer advertise anything not yet verified locally?
    pub fn wants_any(&self, peer_have: &Bitfield) -> bool {
        let shared = self.shared.lock().unwrap();
        shared
            .piece_states
            .iter()
            .enumerate()
            .any(|(index, state)| *state != PieceState::Have && peer_have.has(index))
    }

    /// Add a connection to the registry and hand it a have channel.
    /// Beyond `max_peers` the registration silently stays out of the
    /// registry; the connection still runs, it just gets no fan-out.
    pub fn register_connection(&self, addr: SocketAddr) -> (ConnectionId, mpsc::Receiver<u32>) {
        let id = ConnectionId::next();
        let (have_tx, have_rx) = mpsc::channel(HAVE_QUEUE_DEPTH);

        let mut shared = self.shared.lock().unwrap();
        if shared.connections.len() < self.max_peers {
            shared.connections.push(Registration { id, addr, have_tx });
        } else {
            debug!("Peer registry full, {} runs unregistered", addr);
        }

        (id, have_rx)
    }

    /// Drop a closed connection's registry entry
    pub fn unregister_connection(&self, id: ConnectionId) {
        let mut shared = self.shared.lock().unwrap();
        shared.connections.retain(|conn| conn.id != id);
    }

    /// Tell every sibling connection about a fresh piece. Best-effort:
    /// a full or closed channel drops the notification, and the sibling
    /// catches up through its own bitfield logic later.
    pub fn notify_piece_complete(&self, index: u32, from: ConnectionId) {
        let shared = self.shared.lock().unwrap();
        for conn in &shared.connections {
            if conn.id == from {
                continue;
            }
            if let Err(err) = conn.have_tx.try_send(index) {
                warn!(
                    "Dropping have ({}) for peer {}: {}",
                    index, conn.addr, err
                );
            }
        }
    }

    pub fn pieces_left(&self) -> usize {
        self.shared.lock().unwrap().pieces_left
    }

    pub fn is_complete(&self) -> bool {
        self.shared.lock().unwrap().completed
    }

    pub fn stage(&self) -> Stage {
        self.shared.lock().unwrap().stage
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock().unwrap().connections.len()
    }
}
