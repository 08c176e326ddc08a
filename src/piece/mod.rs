mod request;
mod verify;

pub use request::{BlockRequest, FileSlice, PieceRequest};
pub use verify::verify_piece;

/// Maximum transfer unit for a single block request (16 KiB)
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Download status of a piece, tracked in the shared torrent state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// No connection has claimed it yet
    NotRequested,
    /// Claimed by a connection, transfer possibly in flight
    Requested,
    /// Present on disk and digest-verified
    Have,
}
