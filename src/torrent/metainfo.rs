use super::PieceDigests;
use crate::bencode::{encode, BencodeValue};
use crate::error::{PeerwireError, Result};
use sha1::{Digest, Sha1};

/// One destination file of the torrent; `path` components are joined
/// under the download directory
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: Vec<String>,
    pub length: u64,
}

/// The immutable content description from the metainfo's info dictionary
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: u64,
    pub piece_digests: PieceDigests,
    pub files: Vec<FileInfo>,
    pub total_length: u64,
}

impl TorrentInfo {
    pub fn piece_count(&self) -> usize {
        self.piece_digests.len()
    }

    /// Actual length of a piece; the torrent's final piece may be short
    pub fn piece_len(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_length;
        self.piece_length.min(self.total_length.saturating_sub(start))
    }

    pub fn piece_count_for(total_length: u64, piece_length: u64) -> usize {
        ((total_length + piece_length - 1) / piece_length) as usize
    }

    fn from_bencode(value: &BencodeValue) -> Result<Self> {
        let name = required(value, b"name", "name")?
            .as_str()
            .ok_or_else(|| invalid("name"))?
            .to_string();

        let piece_length = required(value, b"piece length", "piece length")?
            .as_int()
            .ok_or_else(|| invalid("piece length"))? as u64;

        let piece_digests = PieceDigests::from_bytes(
            required(value, b"pieces", "pieces")?
                .as_bytes()
                .ok_or_else(|| invalid("pieces"))?,
        )?;

        let (files, total_length) = match (value.get(b"length"), value.get(b"files")) {
            // Single-file mode: the torrent is one file named after itself
            (Some(length), _) => {
                let length = length.as_int().ok_or_else(|| invalid("length"))? as u64;
                let file = FileInfo {
                    path: vec![name.clone()],
                    length,
                };
                (vec![file], length)
            }
            (None, Some(list)) => {
                let list = list.as_list().ok_or_else(|| invalid("files"))?;
                let mut files = Vec::with_capacity(list.len());
                let mut total = 0u64;
                for entry in list {
                    let file = parse_file_entry(entry)?;
                    total += file.length;
                    files.push(file);
                }
                (files, total)
            }
            (None, None) => {
                return Err(PeerwireError::InvalidTorrent(
                    "Missing 'length' or 'files' field".to_string(),
                ))
            }
        };

        Ok(TorrentInfo {
            name,
            piece_length,
            piece_digests,
            files,
            total_length,
        })
    }
}

fn parse_file_entry(entry: &BencodeValue) -> Result<FileInfo> {
    let length = required(entry, b"length", "file length")?
        .as_int()
        .ok_or_else(|| invalid("file length"))? as u64;

    let path = required(entry, b"path", "file path")?
        .as_list()
        .ok_or_else(|| invalid("file path"))?
        .iter()
        .map(|component| {
            component
                .as_str()
                .map(String::from)
                .ok_or_else(|| invalid("file path component"))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(FileInfo { path, length })
}

/// Top-level metainfo from a .torrent file
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub info: TorrentInfo,
    /// SHA-1 over the bencoded info dictionary; identifies the torrent
    pub info_hash: [u8; 20],
}

impl Metainfo {
    pub fn from_bencode(value: &BencodeValue) -> Result<Self> {
        let announce = required(value, b"announce", "announce")?
            .as_str()
            .ok_or_else(|| invalid("announce"))?
            .to_string();

        let announce_list = value.get(b"announce-list").and_then(|tiers| {
            tiers.as_list().map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| {
                        tier.as_list().map(|urls| {
                            urls.iter()
                                .filter_map(|u| u.as_str().map(String::from))
                                .collect()
                        })
                    })
                    .collect()
            })
        });

        let info_value = required(value, b"info", "info")?;
        let info = TorrentInfo::from_bencode(info_value)?;

        // Bencode dictionaries are canonical (sorted keys), so hashing the
        // re-encoded info dictionary reproduces the identifier computed
        // over the original raw bytes.
        let mut hasher = Sha1::new();
        hasher.update(encode(info_value));
        let info_hash = hasher.finalize().into();

        Ok(Metainfo {
            announce,
            announce_list,
            info,
            info_hash,
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

fn required<'a>(value: &'a BencodeValue, key: &[u8], what: &str) -> Result<&'a BencodeValue> {
    value
        .get(key)
        .ok_or_else(|| PeerwireError::InvalidTorrent(format!("Missing '{}' field", what)))
}

fn invalid(what: &str) -> PeerwireError {
    PeerwireError::InvalidTorrent(format!("Invalid '{}' field", what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decode;

    fn single_file_torrent() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce19:http://tracker/path4:infod");
        data.extend_from_slice(b"6:lengthi32e4:name4:test12:piece lengthi16e");
        data.extend_from_slice(b"6:pieces40:");
        data.extend_from_slice(&[1u8; 20]);
        data.extend_from_slice(&[2u8; 20]);
        data.extend_from_slice(b"ee");
        data
    }

    #[test]
    fn test_parse_single_file() {
        let value = decode(&single_file_torrent()).unwrap();
        let meta = Metainfo::from_bencode(&value).unwrap();

        assert_eq!(meta.announce, "http://tracker/path");
        assert_eq!(meta.info.name, "test");
        assert_eq!(meta.info.piece_length, 16);
        assert_eq!(meta.info.total_length, 32);
        assert_eq!(meta.info.piece_count(), 2);
        assert_eq!(meta.info.files.len(), 1);
        assert_eq!(meta.info.files[0].path, vec!["test".to_string()]);
    }

    #[test]
    fn test_info_hash_is_stable() {
        let value = decode(&single_file_torrent()).unwrap();
        let a = Metainfo::from_bencode(&value).unwrap();
        let b = Metainfo::from_bencode(&value).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
        assert_eq!(a.info_hash_hex().len(), 40);
    }

    #[test]
    fn test_parse_multi_file() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce14:http://tracker4:infod");
        data.extend_from_slice(b"5:filesl");
        data.extend_from_slice(b"d6:lengthi10e4:pathl1:aeed6:lengthi20e4:pathl3:sub1:beee");
        data.extend_from_slice(b"4:name3:dir12:piece lengthi16e");
        data.extend_from_slice(b"6:pieces40:");
        data.extend_from_slice(&[0u8; 40]);
        data.extend_from_slice(b"ee");

        let value = decode(&data).unwrap();
        let meta = Metainfo::from_bencode(&value).unwrap();

        assert_eq!(meta.info.total_length, 30);
        assert_eq!(meta.info.files.len(), 2);
        assert_eq!(meta.info.files[1].path, vec!["sub".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_short_final_piece_length() {
        let value = decode(&single_file_torrent()).unwrap();
        let mut meta = Metainfo::from_bencode(&value).unwrap();
        meta.info.total_length = 20;

        assert_eq!(meta.info.piece_len(0), 16);
        assert_eq!(meta.info.piece_len(1), 4);
        assert_eq!(meta.info.piece_len(5), 0);
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        let value = decode(b"d4:infodee").unwrap();
        assert!(Metainfo::from_bencode(&value).is_err());
    }
}
