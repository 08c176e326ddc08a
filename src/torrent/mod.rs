mod metainfo;
mod pieces;
mod state;

pub use metainfo::{FileInfo, Metainfo, TorrentInfo};
pub use pieces::{PieceDigest, PieceDigests};
pub use state::{ConnectionId, Stage, TorrentState};

use crate::bencode::decode;
use crate::error::Result;
use crate::storage::FileStore;
use std::path::Path;
use tokio::fs;

/// Load and parse a .torrent file
pub async fn load_torrent_file<P: AsRef<Path>>(path: P) -> Result<Metainfo> {
    let data = fs::read(path).await?;
    parse_torrent(&data)
}

/// Parse torrent data from bytes
pub fn parse_torrent(data: &[u8]) -> Result<Metainfo> {
    let value = decode(data)?;
    Metainfo::from_bencode(&value)
}

/// One active torrent: the immutable descriptor, the shared download
/// state every peer connection mutates, and the on-disk backing store.
/// Handed to connections as an `Arc`.
pub struct Torrent {
    pub meta: Metainfo,
    pub state: TorrentState,
    pub store: FileStore,
    pub peer_id: [u8; 20],
}

impl Torrent {
    pub async fn create<P: AsRef<Path>>(
        meta: Metainfo,
        download_dir: P,
        max_peers: usize,
        peer_id: [u8; 20],
    ) -> Result<Self> {
        let store = FileStore::create(download_dir, &meta.info).await?;
        let state = TorrentState::new(meta.info.piece_count(), max_peers);

        Ok(Self {
            meta,
            state,
            store,
            peer_id,
        })
    }

    pub fn pieces_left(&self) -> usize {
        self.state.pieces_left()
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connection_count()
    }
}
