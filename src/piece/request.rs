use super::BLOCK_SIZE;
use crate::torrent::TorrentInfo;

/// One contiguous byte range inside a single destination file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    pub file_index: usize,
    pub offset: u64,
    pub length: u64,
}

/// One wire-sized block of a piece and the file region(s) it lands in.
/// A block that straddles a file boundary carries more than one slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    /// Offset of this block within its piece
    pub begin: u32,
    pub length: u32,
    pub completed: bool,
    pub slices: Vec<FileSlice>,
}

/// The full block plan for one piece
#[derive(Debug, Clone)]
pub struct PieceRequest {
    pub piece_index: u32,
    pub blocks: Vec<BlockRequest>,
    pub blocks_left: usize,
}

impl PieceRequest {
    /// Map a piece onto the torrent's file layout as an ordered run of
    /// blocks, each at most BLOCK_SIZE bytes. The final piece of the
    /// torrent may be short; planning stops at its true end.
    pub fn plan(info: &TorrentInfo, piece_index: u32) -> Self {
        let piece_len = info.piece_len(piece_index);

        // Walk the file list to the piece's starting position
        let mut skip = piece_index as u64 * info.piece_length;
        let mut file_index = 0;
        while file_index < info.files.len() && skip >= info.files[file_index].length {
            skip -= info.files[file_index].length;
            file_index += 1;
        }
        let mut offset = skip;

        let mut blocks = Vec::new();
        let mut left = piece_len;

        while left > 0 && file_index < info.files.len() {
            let begin = (piece_len - left) as u32;
            let mut slices = Vec::new();
            let mut block_len = 0u64;

            while block_len < BLOCK_SIZE as u64 && left > 0 && file_index < info.files.len() {
                let avail = info.files[file_index].length - offset;
                if avail == 0 {
                    file_index += 1;
                    offset = 0;
                    continue;
                }

                let want = (BLOCK_SIZE as u64 - block_len).min(left);
                let take = avail.min(want);

                slices.push(FileSlice {
                    file_index,
                    offset,
                    length: take,
                });
                block_len += take;
                left -= take;

                if take == avail {
                    file_index += 1;
                    offset = 0;
                } else {
                    offset += take;
                }
            }

            blocks.push(BlockRequest {
                begin,
                length: block_len as u32,
                completed: false,
                slices,
            });
        }

        let blocks_left = blocks.len();
        Self {
            piece_index,
            blocks,
            blocks_left,
        }
    }

    /// The block starting at the given piece-local offset, if any
    pub fn block_at(&self, begin: u32) -> Option<&BlockRequest> {
        self.blocks.iter().find(|b| b.begin == begin)
    }

    /// The not-yet-completed block matching a received (begin, length) pair
    pub fn match_block(&mut self, begin: u32, length: u32) -> Option<&mut BlockRequest> {
        self.blocks
            .iter_mut()
            .find(|b| b.begin == begin && b.length == length && !b.completed)
    }
}
