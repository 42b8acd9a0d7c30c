use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    os::unix::io::AsRawFd,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use async_trait::async_trait;
use lru::LruCache;
use sha1::{Digest, Sha1};
use tokio::{sync::RwLock, task};

use super::{Stats, Storage, WriteOutcome};
use crate::{
    error::{NewTorrentError, ReadError, WriteError},
    metainfo::Metainfo,
    storage_info::{FileInfo, FsStructure, StorageInfo},
    Bitfield, PieceIndex, Sha1Hash,
};

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    fn write_at(&self, data: &[u8], offset: u64) -> Result<(), WriteError> {
        let mut written = 0;
        while written < data.len() {
            let n = nix::sys::uio::pwrite(
                self.handle.as_raw_fd(),
                &data[written..],
                (offset + written as u64) as i64,
            )
            .map_err(|e| {
                log::warn!("file {:?} write error: {}", self.info.path, e);
                WriteError::Io(std::io::Error::from(e))
            })?;
            written += n;
        }
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), ReadError> {
        use std::os::unix::fs::FileExt;
        self.handle.read_exact_at(buf, offset).map_err(|e| {
            log::warn!("file {:?} read error: {}", self.info.path, e);
            ReadError::Io(e)
        })
    }
}

#[derive(Default)]
struct AtomicStats {
    read_count: AtomicU64,
    write_count: AtomicU64,
    write_failure_count: AtomicU64,
}

/// A disk-backed [`Storage`]: opens every constituent file eagerly, hashes
/// and commits each incoming piece off the reactor, and serves reads from a
/// bounded LRU cache of whole pieces.
pub struct DiskStorage {
    name: String,
    info_hash: Sha1Hash,
    info: Arc<StorageInfo>,
    /// The concatenation of all expected piece hashes, 20 bytes each.
    piece_hashes: Arc<Vec<u8>>,
    files: Arc<Vec<StdMutex<TorrentFile>>>,
    bitfield: RwLock<Bitfield>,
    /// Pieces currently being validated and committed, so a concurrent
    /// duplicate write (the endgame race) can be told `AlreadyComplete`
    /// instead of redoing the work.
    in_progress: StdMutex<HashSet<PieceIndex>>,
    read_cache: tokio::sync::Mutex<LruCache<PieceIndex, Arc<Vec<u8>>>>,
    stats: AtomicStats,
}

impl DiskStorage {
    /// Creates the torrent's file system layout (opening or creating every
    /// constituent file) and returns a ready-to-use storage.
    pub async fn open(
        metainfo: &Metainfo,
        download_dir: PathBuf,
        read_cache_capacity: usize,
    ) -> Result<Self, NewTorrentError> {
        let info = StorageInfo::new(metainfo, download_dir);
        let info_hash = metainfo.create_info_hash().map_err(|e| {
            NewTorrentError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            ))
        })?;
        let piece_hashes = metainfo.info.pieces.to_vec();
        let name = metainfo.name().to_owned();
        let piece_count = info.piece_count;

        let files =
            task::spawn_blocking(move || Self::open_files(info))
                .await
                .expect("file open task panicked")?;

        let read_cache_capacity =
            std::num::NonZeroUsize::new(read_cache_capacity.max(1)).unwrap();

        Ok(Self {
            name,
            info_hash,
            info: Arc::new(files.0),
            piece_hashes: Arc::new(piece_hashes),
            files: Arc::new(files.1),
            bitfield: RwLock::new(Bitfield::repeat(false, piece_count)),
            in_progress: StdMutex::new(HashSet::new()),
            read_cache: tokio::sync::Mutex::new(LruCache::new(
                read_cache_capacity,
            )),
            stats: AtomicStats::default(),
        })
    }

    fn open_files(
        info: StorageInfo,
    ) -> Result<(StorageInfo, Vec<StdMutex<TorrentFile>>), NewTorrentError>
    {
        let open_file = |file: FileInfo| -> Result<StdMutex<TorrentFile>, NewTorrentError> {
            if let Some(parent) = file.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)?;
                }
            }
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&file.path)?;
            handle.set_len(file.len)?;
            Ok(StdMutex::new(TorrentFile { info: file, handle }))
        };

        let files = match &info.structure {
            FsStructure::File(file) => {
                let mut file = file.clone();
                file.path = info.download_dir.join(&file.path);
                vec![open_file(file)?]
            }
            FsStructure::Archive { files } => {
                let mut handles = Vec::with_capacity(files.len());
                for file in files {
                    let mut file = file.clone();
                    file.path = info.download_dir.join(&file.path);
                    handles.push(open_file(file)?);
                }
                handles
            }
        };

        Ok((info, files))
    }

    fn expected_hash(
        piece_hashes: &[u8],
        index: PieceIndex,
    ) -> Option<Sha1Hash> {
        let start = index * 20;
        let bytes = piece_hashes.get(start..start + 20)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(bytes);
        Some(hash)
    }

    /// Hashes, splits and writes `data` across the files the piece
    /// intersects. Runs off the reactor.
    async fn commit(
        &self,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<(), WriteError> {
        let expected_hash = Self::expected_hash(&self.piece_hashes, index)
            .ok_or(WriteError::InvalidPieceIndex)?;
        let piece_len = self.info.piece_len;
        let intersecting_files = self
            .info
            .files_intersecting_piece(index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        let files = Arc::clone(&self.files);
        let piece_torrent_offset = index as u64 * piece_len as u64;

        task::spawn_blocking(move || -> Result<(), WriteError> {
            let digest = Sha1::digest(&data);
            if digest.as_slice() != expected_hash {
                return Err(WriteError::HashMismatch);
            }
            write_across_files(
                &files,
                intersecting_files,
                &data,
                piece_torrent_offset,
            )
        })
        .await
        .expect("piece write task panicked")
    }

    /// Reads and reassembles a piece's bytes from the files it intersects.
    /// Runs off the reactor.
    async fn load(&self, index: PieceIndex) -> Result<Vec<u8>, ReadError> {
        let piece_len = self
            .info
            .piece_len(index)
            .map_err(|_| ReadError::InvalidPieceIndex)?;
        let intersecting_files = self
            .info
            .files_intersecting_piece(index)
            .map_err(|_| ReadError::InvalidPieceIndex)?;
        let files = Arc::clone(&self.files);
        let piece_torrent_offset = index as u64 * self.info.piece_len as u64;

        task::spawn_blocking(move || {
            read_across_files(
                &files,
                intersecting_files,
                piece_len,
                piece_torrent_offset,
            )
        })
        .await
        .expect("piece read task panicked")
    }
}

fn write_across_files(
    files: &[StdMutex<TorrentFile>],
    file_range: std::ops::Range<crate::FileIndex>,
    data: &[u8],
    piece_torrent_offset: u64,
) -> Result<(), WriteError> {
    let mut written = 0usize;
    let mut torrent_offset = piece_torrent_offset;
    for file_index in file_range {
        let file = files[file_index].lock().unwrap();
        let slice = file
            .info
            .get_slice(torrent_offset, data.len() as u64 - written as u64);
        let chunk = &data[written..written + slice.len as usize];
        file.write_at(chunk, slice.offset)?;
        written += chunk.len();
        torrent_offset += chunk.len() as u64;
    }
    debug_assert_eq!(written, data.len());
    Ok(())
}

fn read_across_files(
    files: &[StdMutex<TorrentFile>],
    file_range: std::ops::Range<crate::FileIndex>,
    piece_len: u32,
    piece_torrent_offset: u64,
) -> Result<Vec<u8>, ReadError> {
    let mut data = vec![0u8; piece_len as usize];
    let mut filled = 0usize;
    let mut torrent_offset = piece_torrent_offset;
    for file_index in file_range {
        let file = files[file_index].lock().unwrap();
        let slice = file
            .info
            .get_slice(torrent_offset, data.len() as u64 - filled as u64);
        let chunk = &mut data[filled..filled + slice.len as usize];
        file.read_at(chunk, slice.offset)?;
        filled += chunk.len();
        torrent_offset += chunk.len() as u64;
    }
    debug_assert_eq!(filled, data.len());
    Ok(data)
}

#[async_trait]
impl Storage for DiskStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn info_hash(&self) -> Sha1Hash {
        self.info_hash
    }

    fn len(&self) -> u64 {
        self.info.download_len
    }

    fn piece_count(&self) -> usize {
        self.info.piece_count
    }

    fn piece_len(&self, index: PieceIndex) -> Result<u32, ReadError> {
        self.info
            .piece_len(index)
            .map_err(|_| ReadError::InvalidPieceIndex)
    }

    fn max_piece_len(&self) -> u32 {
        self.info.piece_len
    }

    async fn bitfield(&self) -> Bitfield {
        self.bitfield.read().await.clone()
    }

    async fn is_complete(&self) -> bool {
        self.bitfield.read().await.all()
    }

    fn stat(&self) -> Stats {
        Stats {
            read_count: self.stats.read_count.load(Ordering::Relaxed),
            write_count: self.stats.write_count.load(Ordering::Relaxed),
            write_failure_count: self
                .stats
                .write_failure_count
                .load(Ordering::Relaxed),
        }
    }

    async fn read_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Vec<u8>, ReadError> {
        if index >= self.info.piece_count {
            return Err(ReadError::InvalidPieceIndex);
        }
        if !self.bitfield.read().await[index] {
            return Err(ReadError::PieceNotAvailable);
        }

        if let Some(piece) = self.read_cache.lock().await.get(&index) {
            return Ok((**piece).clone());
        }

        let data = self.load(index).await?;
        self.stats.read_count.fetch_add(1, Ordering::Relaxed);
        self.read_cache.lock().await.put(index, Arc::new(data.clone()));
        Ok(data)
    }

    async fn write_piece(
        &self,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<WriteOutcome, WriteError> {
        if index >= self.info.piece_count {
            return Err(WriteError::InvalidPieceIndex);
        }
        if self.bitfield.read().await[index] {
            return Ok(WriteOutcome::AlreadyComplete);
        }
        {
            let mut in_progress = self.in_progress.lock().unwrap();
            if !in_progress.insert(index) {
                return Ok(WriteOutcome::AlreadyComplete);
            }
        }

        let result = self.commit(index, data).await;
        self.in_progress.lock().unwrap().remove(&index);

        match result {
            Ok(()) => {
                self.bitfield.write().await.set(index, true);
                self.read_cache.lock().await.pop(&index);
                Ok(WriteOutcome::Written)
            }
            Err(e) => {
                self.stats
                    .write_failure_count
                    .fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_bytes::ByteBuf;
    use tempfile::tempdir;

    use super::*;
    use crate::metainfo::{File as MetaFile, Info};

    fn metainfo_with_pieces(data: &[u8], piece_len: u64) -> Metainfo {
        let mut pieces = Vec::new();
        for chunk in data.chunks(piece_len as usize) {
            pieces.extend_from_slice(&Sha1::digest(chunk));
        }
        Metainfo {
            info: Info {
                name: "single.bin".to_owned(),
                pieces: ByteBuf::from(pieces),
                piece_length: piece_len,
                length: Some(data.len() as u64),
                files: None,
                private: None,
            },
        }
    }

    #[tokio::test]
    async fn write_then_read_single_file_piece() {
        let dir = tempdir().unwrap();
        let data = b"hello world! this is a piece of data.".to_vec();
        let metainfo = metainfo_with_pieces(&data, data.len() as u64);
        let storage =
            DiskStorage::open(&metainfo, dir.path().to_path_buf(), 4)
                .await
                .unwrap();

        let outcome = storage.write_piece(0, data.clone()).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert!(storage.is_complete().await);

        let read_back = storage.read_piece(0).await.unwrap();
        assert_eq!(read_back, data);
    }

    #[tokio::test]
    async fn rewrite_is_idempotent() {
        let dir = tempdir().unwrap();
        let data = b"some bytes".to_vec();
        let metainfo = metainfo_with_pieces(&data, data.len() as u64);
        let storage =
            DiskStorage::open(&metainfo, dir.path().to_path_buf(), 4)
                .await
                .unwrap();

        storage.write_piece(0, data.clone()).await.unwrap();
        let second = storage.write_piece(0, data).await.unwrap();
        assert_eq!(second, WriteOutcome::AlreadyComplete);
    }

    #[tokio::test]
    async fn hash_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let data = b"expected payload".to_vec();
        let metainfo = metainfo_with_pieces(&data, data.len() as u64);
        let storage =
            DiskStorage::open(&metainfo, dir.path().to_path_buf(), 4)
                .await
                .unwrap();

        let corrupted = b"not the payload!".to_vec();
        let err = storage.write_piece(0, corrupted).await.unwrap_err();
        assert!(matches!(err, WriteError::HashMismatch));
        assert!(!storage.is_complete().await);
    }

    #[tokio::test]
    async fn multi_file_archive_layout_is_created() {
        let dir = tempdir().unwrap();
        let a = vec![1u8; 5];
        let b = vec![2u8; 5];
        let mut whole = a.clone();
        whole.extend_from_slice(&b);
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&Sha1::digest(&whole));

        let metainfo = Metainfo {
            info: Info {
                name: "archive".to_owned(),
                pieces: ByteBuf::from(pieces),
                piece_length: 10,
                length: None,
                files: Some(vec![
                    MetaFile { path: vec!["a.bin".into()], length: 5 },
                    MetaFile {
                        path: vec!["sub".into(), "b.bin".into()],
                        length: 5,
                    },
                ]),
                private: None,
            },
        };

        let storage =
            DiskStorage::open(&metainfo, dir.path().to_path_buf(), 4)
                .await
                .unwrap();
        let outcome = storage.write_piece(0, whole).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert!(dir.path().join("archive").join("a.bin").exists());
        assert!(dir
            .path()
            .join("archive")
            .join("sub")
            .join("b.bin")
            .exists());
    }
}
