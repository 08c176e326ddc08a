use crate::error::{PeerwireError, Result};
use crate::piece::FileSlice;
use crate::torrent::TorrentInfo;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// Suffix carried by destination files until the torrent verifies complete
const INCOMPLETE_SUFFIX: &str = ".incomplete";

/// Random-access backing store for the torrent's destination files.
/// Files live under a provisional name while the download is in flight
/// and move to their final name in one rename per file at completion.
pub struct FileStore {
    files: Vec<StoreFile>,
}

struct StoreFile {
    final_path: PathBuf,
    part_path: PathBuf,
    length: u64,
}

impl FileStore {
    /// Create (or reopen) every destination file, pre-sized to its final
    /// length, under the provisional name.
    pub async fn create<P: AsRef<Path>>(download_dir: P, info: &TorrentInfo) -> Result<Self> {
        let download_dir = download_dir.as_ref();
        fs::create_dir_all(download_dir).await?;

        let mut files = Vec::with_capacity(info.files.len());
        for file_info in &info.files {
            let mut final_path = download_dir.to_path_buf();
            for component in &file_info.path {
                final_path.push(component);
            }
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent).await?;
            }

            let mut part_name = final_path
                .file_name()
                .map(|n| n.to_os_string())
                .ok_or_else(|| {
                    PeerwireError::StorageError(format!("Bad file path {:?}", final_path))
                })?;
            part_name.push(INCOMPLETE_SUFFIX);
            let part_path = final_path.with_file_name(part_name);

            // An already-finalized file needs no provisional copy
            if !fs::try_exists(&final_path).await? {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(&part_path)
                    .await?;
                file.set_len(file_info.length).await?;
                debug!(
                    "Opened {:?} at {} bytes",
                    part_path, file_info.length
                );
            }

            files.push(StoreFile {
                final_path,
                part_path,
                length: file_info.length,
            });
        }

        info!(
            "Storage initialized: {} files, {} bytes total",
            files.len(),
            info.total_length
        );

        Ok(Self { files })
    }

    fn entry(&self, index: usize) -> Result<&StoreFile> {
        self.files.get(index).ok_or_else(|| {
            PeerwireError::StorageError(format!("No file at index {}", index))
        })
    }

    async fn live_path<'a>(&self, entry: &'a StoreFile) -> Result<&'a Path> {
        if fs::try_exists(&entry.part_path).await? {
            Ok(&entry.part_path)
        } else {
            Ok(&entry.final_path)
        }
    }

    fn check_bounds(entry: &StoreFile, slice: &FileSlice) -> Result<()> {
        if slice.offset + slice.length > entry.length {
            return Err(PeerwireError::StorageError(format!(
                "Region {}..{} exceeds file length {}",
                slice.offset,
                slice.offset + slice.length,
                entry.length
            )));
        }
        Ok(())
    }

    /// Write `data` into a single file region; `data` must fill it exactly
    pub async fn write_slice(&self, slice: &FileSlice, data: &[u8]) -> Result<()> {
        let entry = self.entry(slice.file_index)?;
        Self::check_bounds(entry, slice)?;
        if data.len() as u64 != slice.length {
            return Err(PeerwireError::StorageError(format!(
                "Data length {} does not fill region of {}",
                data.len(),
                slice.length
            )));
        }

        let path = self.live_path(entry).await?;
        let mut file = OpenOptions::new().write(true).open(path).await?;
        file.seek(std::io::SeekFrom::Start(slice.offset)).await?;
        file.write_all(data).await?;
        Ok(())
    }

    /// Read a single file region back
    pub async fn read_slice(&self, slice: &FileSlice) -> Result<Vec<u8>> {
        let entry = self.entry(slice.file_index)?;
        Self::check_bounds(entry, slice)?;

        let path = self.live_path(entry).await?;
        let mut file = File::open(path).await?;
        file.seek(std::io::SeekFrom::Start(slice.offset)).await?;

        let mut buf = vec![0u8; slice.length as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Spread one block's data across its destination regions in order
    pub async fn write_block(&self, slices: &[FileSlice], data: &[u8]) -> Result<()> {
        let expected: u64 = slices.iter().map(|s| s.length).sum();
        if data.len() as u64 != expected {
            return Err(PeerwireError::StorageError(format!(
                "Block of {} bytes does not match {} bytes of regions",
                data.len(),
                expected
            )));
        }

        let mut consumed = 0usize;
        for slice in slices {
            let next = consumed + slice.length as usize;
            self.write_slice(slice, &data[consumed..next]).await?;
            consumed = next;
        }
        Ok(())
    }

    /// Concatenate a block's destination regions back into one buffer
    pub async fn read_block(&self, slices: &[FileSlice]) -> Result<Vec<u8>> {
        let total: u64 = slices.iter().map(|s| s.length).sum();
        let mut out = Vec::with_capacity(total as usize);
        for slice in slices {
            out.extend_from_slice(&self.read_slice(slice).await?);
        }
        Ok(out)
    }

    /// Move every file from its provisional name to its final name.
    /// Safe to call more than once; already-moved files are skipped.
    pub async fn finalize(&self) -> Result<()> {
        for entry in &self.files {
            if fs::try_exists(&entry.part_path).await? {
                fs::rename(&entry.part_path, &entry.final_path).await?;
                info!("Finalized {:?}", entry.final_path);
            }
        }
        Ok(())
    }
}
