use super::request::PieceRequest;
use crate::error::{PeerwireError, Result};
use crate::storage::FileStore;
use crate::torrent::TorrentInfo;
use sha1::{Digest, Sha1};
use tracing::debug;

/// Recompute a piece's SHA-1 over the bytes actually on disk and compare
/// it to the digest from the torrent descriptor. The region list is
/// re-derived from the same plan the download used, so what gets hashed
/// is exactly what was stored. Read failures propagate as hard errors.
pub async fn verify_piece(
    info: &TorrentInfo,
    store: &FileStore,
    piece_index: u32,
) -> Result<bool> {
    let expected = info
        .piece_digests
        .get(piece_index as usize)
        .ok_or_else(|| {
            PeerwireError::PieceError(format!("No digest for piece {}", piece_index))
        })?;

    let plan = PieceRequest::plan(info, piece_index);
    let mut hasher = Sha1::new();

    for block in &plan.blocks {
        for slice in &block.slices {
            let data = store.read_slice(slice).await?;
            hasher.update(&data);
        }
    }

    let digest = hasher.finalize();
    let valid = digest.as_slice() == expected.as_bytes();
    debug!(
        "Verified piece {}: {}",
        piece_index,
        if valid { "ok" } else { "digest mismatch" }
    );

    Ok(valid)
}
