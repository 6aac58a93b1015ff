use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use sha1::Digest;

use crate::Bitfield;

#[derive(Debug, thiserror::Error)]
pub enum PieceManagerError {

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("piece index {0} out of range")]
    InvalidIndex(usize),

    #[error("piece {index} failed hash verification")]
    HashMismatch { index: usize },

    #[error("wrong piece length: expected {expected}, got {got}")]
    WrongLength { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, PieceManagerError>;

/// One file within a (possibly multi-file) torrent, at the byte offset it
/// starts at in the concatenated piece space.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,
    pub length: usize,
    pub offset: usize,
    pub md5sum: Option<String>,
}

impl FileInfo {
    /// Half-open byte range `[offset, offset + length)` this file occupies
    /// in the concatenated piece space.
    pub fn byte_range(&self) -> std::ops::Range<usize> {
        self.offset..(self.offset + self.length)
    }
}

/// Describes how pieces map onto files: total length, piece size, and the
/// file table. Shared (read-only) between the piece manager and anything
/// that needs to report progress.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub files: Vec<FileInfo>,
    pub piece_len: usize,
    pub num_pieces: usize,
    pub total_len: usize,
    pub output_dir: PathBuf,
}

impl StoreInfo {
    pub fn new(files: Vec<FileInfo>, piece_len: usize, num_pieces: usize, output_dir: PathBuf) -> Self {
        let total_len = files.iter().map(|f| f.length).sum();
        Self { files, piece_len, num_pieces, total_len, output_dir }
    }

    /// Length of piece `index`: `piece_len` for every piece but the last,
    /// which is whatever remains.
    pub fn expected_piece_length(&self, index: usize) -> Result<usize> {
        if index >= self.num_pieces {
            return Err(PieceManagerError::InvalidIndex(index));
        }
        if index == self.num_pieces - 1 {
            let rem = self.total_len - self.piece_len * (self.num_pieces - 1);
            Ok(if rem == 0 { self.piece_len } else { rem })
        } else {
            Ok(self.piece_len)
        }
    }

    /// Every file whose byte range overlaps piece `index`, with the
    /// intersection expressed as (file index, range-within-piece,
    /// offset-within-file).
    fn piece_file_intersections(&self, index: usize) -> Vec<(usize, std::ops::Range<usize>, usize)> {
        let piece_start = index * self.piece_len;
        let piece_end = piece_start + self.expected_piece_length(index).unwrap_or(self.piece_len);

        let mut out = Vec::new();
        for (fi, file) in self.files.iter().enumerate() {
            let file_range = file.byte_range();
            let overlap_start = piece_start.max(file_range.start);
            let overlap_end = piece_end.min(file_range.end);
            if overlap_start >= overlap_end {
                continue;
            }
            let within_piece = (overlap_start - piece_start)..(overlap_end - piece_start);
            let within_file = overlap_start - file_range.start;
            out.push((fi, within_piece, within_file));
        }
        out
    }
}

struct Inner {
    handles: Vec<File>,
    have: Bitfield,
}

/// Content-addressed, hash-verified storage over a (possibly multi-file)
/// torrent layout. Opens/pre-allocates every file on construction and
/// verifies what's already on disk before reporting ownership.
pub struct PieceManager {
    info: StoreInfo,
    piece_hashes: Vec<[u8; 20]>,
    inner: Mutex<Inner>,
    cache: Mutex<lru::LruCache<usize, Vec<u8>>>,
}

const CACHE_CAPACITY: usize = 16;

impl PieceManager {
    pub fn new(info: StoreInfo, piece_hashes: Vec<[u8; 20]>) -> Result<Self> {
        debug_assert_eq!(info.num_pieces, piece_hashes.len());

        std::fs::create_dir_all(&info.output_dir)?;
        let mut handles = Vec::with_capacity(info.files.len());
        for file in &info.files {
            let path = info.output_dir.join(&file.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            handle.set_len(file.length as u64)?;
            handles.push(handle);
        }

        let have = Bitfield::repeat(false, info.num_pieces);
        let manager = Self {
            info,
            piece_hashes,
            inner: Mutex::new(Inner { handles, have }),
            cache: Mutex::new(lru::LruCache::new(std::num::NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        };
        manager.resume_scan();
        Ok(manager)
    }

    /// Best-effort pass over every piece on construction: a piece counts
    /// as owned only if it's present in full and hashes correctly. Short
    /// reads or I/O errors just leave the bit unset.
    fn resume_scan(&self) {
        for index in 0..self.info.num_pieces {
            match self.read_piece_uncached(index) {
                Ok(data) if self.verify(index, &data) => {
                    self.inner.lock().unwrap().have.set(index, true);
                }
                _ => {}
            }
        }
        let have = self.inner.lock().unwrap().have.count_ones();
        tracing::info!("resume scan: {}/{} pieces already present", have, self.info.num_pieces);
    }

    fn verify(&self, index: usize, data: &[u8]) -> bool {
        let mut hasher = sha1::Sha1::new();
        hasher.update(data);
        let digest: [u8; 20] = hasher.finalize().into();
        digest == self.piece_hashes[index]
    }

    pub fn expected_piece_length(&self, index: usize) -> Result<usize> {
        self.info.expected_piece_length(index)
    }

    pub fn info(&self) -> &StoreInfo {
        &self.info
    }

    /// Reads one full piece from disk, bypassing the cache. Used by the
    /// resume scan (which would otherwise poison the cache with
    /// not-yet-verified data).
    fn read_piece_uncached(&self, index: usize) -> Result<Vec<u8>> {
        let expected_len = self.info.expected_piece_length(index)?;
        let mut buf = vec![0u8; expected_len];
        let mut inner = self.inner.lock().unwrap();
        for (file_index, within_piece, within_file) in self.info.piece_file_intersections(index) {
            let handle = &mut inner.handles[file_index];
            handle.seek(SeekFrom::Start(within_file as u64))?;
            handle.read_exact(&mut buf[within_piece])?;
        }
        Ok(buf)
    }

    /// Reads a verified, owned piece, going through the small LRU cache.
    pub fn read_piece(&self, index: usize) -> Result<Vec<u8>> {
        if index >= self.info.num_pieces {
            return Err(PieceManagerError::InvalidIndex(index));
        }
        if let Some(cached) = self.cache.lock().unwrap().get(&index) {
            return Ok(cached.clone());
        }
        let data = self.read_piece_uncached(index)?;
        self.cache.lock().unwrap().put(index, data.clone());
        Ok(data)
    }

    /// Writes a downloaded piece, rejecting anything that isn't exactly
    /// the expected length or doesn't hash correctly. On success, marks
    /// the piece owned and evicts any stale cache entry for it.
    pub fn write_piece(&self, index: usize, data: &[u8]) -> Result<()> {
        if index >= self.info.num_pieces {
            return Err(PieceManagerError::InvalidIndex(index));
        }
        let expected_len = self.info.expected_piece_length(index)?;
        if data.len() != expected_len {
            return Err(PieceManagerError::WrongLength { expected: expected_len, got: data.len() });
        }
        if !self.verify(index, data) {
            return Err(PieceManagerError::HashMismatch { index });
        }

        let mut inner = self.inner.lock().unwrap();
        for (file_index, within_piece, within_file) in self.info.piece_file_intersections(index) {
            let handle = &mut inner.handles[file_index];
            handle.seek(SeekFrom::Start(within_file as u64))?;
            handle.write_all(&data[within_piece])?;
        }
        inner.have.set(index, true);
        drop(inner);
        self.cache.lock().unwrap().put(index, data.to_vec());
        Ok(())
    }

    /// Snapshot of the ownership bitmap, for BITFIELD exchange.
    pub fn bitfield(&self) -> Bitfield {
        self.inner.lock().unwrap().have.clone()
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.inner.lock().unwrap().have.get(index).map(|b| *b).unwrap_or(false)
    }

    pub fn missing_pieces(&self) -> Vec<usize> {
        let have = &self.inner.lock().unwrap().have;
        (0..self.info.num_pieces).filter(|i| !have[*i]).collect()
    }

    pub fn all_complete(&self) -> bool {
        self.inner.lock().unwrap().have.all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_info(dir: &Path, length: usize, piece_len: usize) -> StoreInfo {
        let num_pieces = (length + piece_len - 1) / piece_len;
        StoreInfo::new(
            vec![FileInfo { path: PathBuf::from("a.bin"), length, offset: 0, md5sum: None }],
            piece_len,
            num_pieces,
            dir.to_path_buf(),
        )
    }

    fn hash_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = sha1::Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[test]
    fn expected_piece_length_accounts_for_short_last_piece() {
        let dir = tempfile::tempdir().unwrap();
        let info = single_file_info(dir.path(), 25, 10);
        assert_eq!(info.expected_piece_length(0).unwrap(), 10);
        assert_eq!(info.expected_piece_length(1).unwrap(), 10);
        assert_eq!(info.expected_piece_length(2).unwrap(), 5);
        assert!(info.expected_piece_length(3).is_err());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let info = single_file_info(dir.path(), 20, 10);
        let hashes = vec![hash_of(&[1u8; 10]), hash_of(&[2u8; 10])];
        let pm = PieceManager::new(info, hashes).unwrap();

        pm.write_piece(0, &[1u8; 10]).unwrap();
        assert!(pm.has_piece(0));
        assert!(!pm.has_piece(1));
        assert_eq!(pm.read_piece(0).unwrap(), vec![1u8; 10]);
    }

    #[test]
    fn write_rejects_bad_hash() {
        let dir = tempfile::tempdir().unwrap();
        let info = single_file_info(dir.path(), 10, 10);
        let hashes = vec![hash_of(&[1u8; 10])];
        let pm = PieceManager::new(info, hashes).unwrap();

        let err = pm.write_piece(0, &[9u8; 10]).unwrap_err();
        assert!(matches!(err, PieceManagerError::HashMismatch { index: 0 }));
        assert!(!pm.has_piece(0));
    }

    #[test]
    fn write_rejects_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let info = single_file_info(dir.path(), 10, 10);
        let hashes = vec![hash_of(&[1u8; 10])];
        let pm = PieceManager::new(info, hashes).unwrap();

        let err = pm.write_piece(0, &[1u8; 5]).unwrap_err();
        assert!(matches!(err, PieceManagerError::WrongLength { expected: 10, got: 5 }));
    }

    #[test]
    fn resume_scan_picks_up_existing_valid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, [7u8; 10]).unwrap();

        let info = single_file_info(dir.path(), 10, 10);
        let hashes = vec![hash_of(&[7u8; 10])];
        let pm = PieceManager::new(info, hashes).unwrap();
        assert!(pm.has_piece(0));
    }

    #[test]
    fn multi_file_piece_spans_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        // piece_len = 10, file a = 6 bytes, file b = 14 bytes -> piece 0
        // spans both files.
        let files = vec![
            FileInfo { path: PathBuf::from("a.bin"), length: 6, offset: 0, md5sum: None },
            FileInfo { path: PathBuf::from("b.bin"), length: 14, offset: 6, md5sum: None },
        ];
        let info = StoreInfo::new(files, 10, 2, dir.path().to_path_buf());

        let mut piece0 = vec![1u8; 6];
        piece0.extend(vec![2u8; 4]);
        let mut piece1 = vec![2u8; 6];
        piece1.extend(vec![3u8; 4]);

        let hashes = vec![hash_of(&piece0), hash_of(&piece1)];
        let pm = PieceManager::new(info, hashes).unwrap();

        pm.write_piece(0, &piece0).unwrap();
        pm.write_piece(1, &piece1).unwrap();

        assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), vec![1u8; 6]);
        let b = std::fs::read(dir.path().join("b.bin")).unwrap();
        assert_eq!(&b[0..4], &[2u8; 4]);
        assert_eq!(&b[4..14], &[3u8; 10]);
        assert!(pm.all_complete());
    }

    #[test]
    fn missing_pieces_reflects_partial_download() {
        let dir = tempfile::tempdir().unwrap();
        let info = single_file_info(dir.path(), 30, 10);
        let hashes = vec![hash_of(&[1u8; 10]), hash_of(&[2u8; 10]), hash_of(&[3u8; 10])];
        let pm = PieceManager::new(info, hashes).unwrap();

        pm.write_piece(1, &[2u8; 10]).unwrap();
        assert_eq!(pm.missing_pieces(), vec![0, 2]);
        assert!(!pm.all_complete());
    }
}
