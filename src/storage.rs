//! Content-addressed storage for a single-file torrent (§4.1, §4.2).
//!
//! [`Piece`] accumulates the blocks of one piece in memory and validates the
//! assembled piece against its SHA-1 hash before it is ever written to disk.
//! [`StorageManager`] owns the backing file, the bitfield of pieces we
//! already have, and the set of pieces currently claimed by an in-flight
//! download, guarded by a single mutex (§7: the only state shared across
//! sessions).

use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::PathBuf,
    sync::Arc,
};

use sha1::{Digest, Sha1};
use tokio::{sync::Mutex, task};

use crate::{
    conf::TorrentConf,
    error::{Result, StorageError},
    metainfo::TorrentInfo,
    Bitfield, PieceIndex, Sha1Hash,
};

/// Accumulates the blocks of a single piece and validates the assembled
/// bytes against the piece's expected SHA-1 hash.
#[derive(Debug)]
pub struct Piece {
    index: PieceIndex,
    expected_hash: Sha1Hash,
    buf: Vec<u8>,
    /// Marks which bytes of `buf` have been filled in, one bit per
    /// [`crate::BLOCK_LEN`]-sized block.
    received_blocks: Vec<bool>,
}

impl Piece {
    pub fn new(index: PieceIndex, len: u32, expected_hash: Sha1Hash) -> Self {
        let block_count = crate::block_count(len);
        Self {
            index,
            expected_hash,
            buf: vec![0; len as usize],
            received_blocks: vec![false; block_count],
        }
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    /// Copies `data` into this piece's buffer at `offset`, marking the
    /// containing block as received.
    pub fn store_block(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let start = offset as usize;
        let end = start + data.len();
        if end > self.buf.len() {
            return Err(StorageError::InvalidBlockRange {
                index: self.index,
                offset,
                length: data.len() as u32,
            });
        }
        self.buf[start..end].copy_from_slice(data);
        let block_index = (offset / crate::BLOCK_LEN) as usize;
        if let Some(received) = self.received_blocks.get_mut(block_index) {
            *received = true;
        }
        Ok(())
    }

    /// Whether every block of this piece has been received.
    pub fn is_complete(&self) -> bool {
        self.received_blocks.iter().all(|&received| received)
    }

    /// Whether the assembled bytes hash to the expected piece hash. Only
    /// meaningful once [`Piece::is_complete`] is true.
    pub fn matches_hash(&self) -> bool {
        let digest = Sha1::digest(&self.buf);
        digest.as_slice() == self.expected_hash
    }

    /// Consumes the piece, returning its assembled bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

struct Inner {
    file: File,
    bitfield: Bitfield,
    /// Pieces currently claimed by a download in progress, to prevent two
    /// sessions from requesting the same piece redundantly.
    in_flight: HashSet<PieceIndex>,
}

/// Owns the on-disk file backing a torrent and tracks which pieces are
/// present, validated, and currently being fetched.
pub struct StorageManager {
    info: TorrentInfo,
    path: PathBuf,
    inner: Arc<Mutex<Inner>>,
}

impl StorageManager {
    /// Opens (creating if necessary) the backing file at
    /// `conf.download_path`, sized to the torrent's total length, and builds
    /// the initial bitfield by validating whatever is already on disk
    /// against each piece's hash.
    pub async fn new(info: TorrentInfo, conf: &TorrentConf) -> Result<Self, StorageError> {
        let path = conf.download_path.clone();
        let total_length = info.total_length;

        let (file, bitfield) = {
            let path = path.clone();
            let info = info.clone();
            task::spawn_blocking(move || -> Result<(File, Bitfield), StorageError> {
                let existed = path.exists();
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&path)
                    .map_err(|source| StorageError::Open {
                        path: path.clone(),
                        source,
                    })?;
                if existed {
                    let actual = file
                        .metadata()
                        .map_err(|source| StorageError::Open {
                            path: path.clone(),
                            source,
                        })?
                        .len();
                    if actual != total_length {
                        return Err(StorageError::SizeMismatch {
                            path: path.clone(),
                            expected: total_length,
                            actual,
                        });
                    }
                } else {
                    file.set_len(total_length)
                        .map_err(|source| StorageError::Open {
                            path: path.clone(),
                            source,
                        })?;
                }
                let bitfield = build_bitfield(&file, &info)?;
                Ok((file, bitfield))
            })
            .await
            .expect("storage init task panicked")?
        };

        Ok(Self {
            info,
            path,
            inner: Arc::new(Mutex::new(Inner {
                file,
                bitfield,
                in_flight: HashSet::new(),
            })),
        })
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// A snapshot of the pieces we currently have, for announcing in our own
    /// `bitfield` message.
    pub async fn bitfield(&self) -> Bitfield {
        self.inner.lock().await.bitfield.clone()
    }

    pub async fn has_piece(&self, index: PieceIndex) -> bool {
        let inner = self.inner.lock().await;
        inner.bitfield.get(index).map(|bit| *bit).unwrap_or(false)
    }

    /// Whether we have every piece of the torrent.
    pub async fn is_complete(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.bitfield.count_ones() == self.info.num_pieces()
    }

    /// Picks a piece the peer (per `peer_bitfield`) has but we neither have
    /// nor are already fetching, and claims it for the caller. Returns
    /// `None` if no such piece exists right now.
    pub async fn claim_needed_piece(&self, peer_bitfield: &Bitfield) -> Option<PieceIndex> {
        let mut inner = self.inner.lock().await;
        let index = (0..self.info.num_pieces()).find(|&index| {
            let peer_has = peer_bitfield.get(index).map(|bit| *bit).unwrap_or(false);
            let we_have = inner.bitfield.get(index).map(|bit| *bit).unwrap_or(false);
            peer_has && !we_have && !inner.in_flight.contains(&index)
        })?;
        inner.in_flight.insert(index);
        Some(index)
    }

    /// Releases a piece previously claimed via [`StorageManager::claim_needed_piece`]
    /// without completing it, e.g. because the peer that had it disconnected.
    pub async fn release_piece(&self, index: PieceIndex) {
        self.inner.lock().await.in_flight.remove(&index);
    }

    /// Validates and persists a completed piece, updating the bitfield.
    ///
    /// Returns [`StorageError::UnvalidatedWrite`] if the piece's bytes do not
    /// match its expected hash; the piece is not written in that case.
    pub async fn write_piece(&self, piece: Piece) -> Result<(), StorageError> {
        let index = piece.index();
        if !piece.matches_hash() {
            log::debug!(
                "piece {} expected hash {}",
                index,
                hex::encode(self.info.piece_hashes[index])
            );
            self.inner.lock().await.in_flight.remove(&index);
            return Err(StorageError::UnvalidatedWrite(index));
        }

        let offset = index as u64 * self.info.piece_length as u64;
        let data = piece.into_bytes();
        let inner = Arc::clone(&self.inner);
        let mut guard = inner.lock_owned().await;

        task::spawn_blocking(move || -> Result<(), StorageError> {
            guard.file.write_all_at(&data, offset)?;
            guard.file.sync_data()?;
            guard.bitfield.set(index, true);
            guard.in_flight.remove(&index);
            Ok(())
        })
        .await
        .expect("storage write task panicked")?;

        Ok(())
    }

    /// Reads a block of `length` bytes at `offset` within the piece at
    /// `index`, for serving an inbound `request` message.
    pub async fn read_block(
        &self,
        index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>, StorageError> {
        if index >= self.info.num_pieces() {
            return Err(StorageError::InvalidPieceIndex(index));
        }
        let piece_len = self.info.piece_len(index);
        if offset + length > piece_len {
            return Err(StorageError::InvalidBlockRange {
                index,
                offset,
                length,
            });
        }

        let file_offset = index as u64 * self.info.piece_length as u64 + offset as u64;
        let inner = Arc::clone(&self.inner);
        let guard = inner.lock_owned().await;
        task::spawn_blocking(move || -> Result<Vec<u8>, StorageError> {
            let mut buf = vec![0; length as usize];
            guard.file.read_exact_at(&mut buf, file_offset)?;
            Ok(buf)
        })
        .await
        .expect("storage read task panicked")
    }
}

/// Validates every piece already present in `file` against `info`'s piece
/// hashes, building the initial bitfield. A read or length mismatch is
/// treated as a missing piece rather than an error: a freshly-created,
/// zero-filled file is the common case and simply starts with an empty
/// bitfield.
fn build_bitfield(file: &File, info: &TorrentInfo) -> Result<Bitfield, StorageError> {
    let mut bitfield = Bitfield::repeat(false, info.num_pieces());
    let mut buf = vec![0u8; info.piece_length as usize];
    for index in 0..info.num_pieces() {
        let piece_len = info.piece_len(index) as usize;
        let offset = index as u64 * info.piece_length as u64;
        if file.read_exact_at(&mut buf[..piece_len], offset).is_err() {
            continue;
        }
        let digest = Sha1::digest(&buf[..piece_len]);
        if digest.as_slice() == info.piece_hashes[index] {
            bitfield.set(index, true);
        }
    }
    Ok(bitfield)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::TorrentInfo;

    fn torrent_info_for(data: &[u8], piece_length: u32) -> TorrentInfo {
        let piece_hashes = data
            .chunks(piece_length as usize)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&Sha1::digest(chunk));
                hash
            })
            .collect();
        TorrentInfo {
            info_hash: [0u8; 20],
            announce_url: "http://tracker.example/announce".to_string(),
            name: "test.bin".to_string(),
            piece_length,
            total_length: data.len() as u64,
            piece_hashes,
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("peerswarm-storage-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn piece_reports_complete_only_once_all_blocks_received() {
        let mut piece = Piece::new(0, crate::BLOCK_LEN * 2, [0u8; 20]);
        assert!(!piece.is_complete());
        piece.store_block(0, &vec![1u8; crate::BLOCK_LEN as usize]).unwrap();
        assert!(!piece.is_complete());
        piece
            .store_block(crate::BLOCK_LEN, &vec![2u8; crate::BLOCK_LEN as usize])
            .unwrap();
        assert!(piece.is_complete());
    }

    #[test]
    fn piece_rejects_out_of_range_block() {
        let mut piece = Piece::new(0, crate::BLOCK_LEN, [0u8; 20]);
        let result = piece.store_block(crate::BLOCK_LEN - 1, &[1, 2, 3]);
        assert!(matches!(result, Err(StorageError::InvalidBlockRange { .. })));
    }

    #[test]
    fn piece_hash_validation() {
        let data = b"exactly sixteen!";
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&Sha1::digest(data));
        let mut piece = Piece::new(0, data.len() as u32, hash);
        piece.store_block(0, data).unwrap();
        assert!(piece.matches_hash());

        let mut wrong = Piece::new(0, data.len() as u32, [0xffu8; 20]);
        wrong.store_block(0, data).unwrap();
        assert!(!wrong.matches_hash());
    }

    #[tokio::test]
    async fn new_storage_manager_builds_empty_bitfield_for_fresh_file() {
        let data = vec![0u8; 64];
        let info = torrent_info_for(&data, 16);
        let path = temp_path("fresh");
        let conf = TorrentConf::new(&path);
        let storage = StorageManager::new(info, &conf).await.unwrap();
        assert!(!storage.is_complete().await);
        let bitfield = storage.bitfield().await;
        assert_eq!(bitfield.count_ones(), 0);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn new_storage_manager_rejects_existing_file_with_wrong_size() {
        let data = vec![0u8; 64];
        let info = torrent_info_for(&data, 16);
        let path = temp_path("wrong-size");
        std::fs::write(&path, vec![0u8; 32]).unwrap();
        let conf = TorrentConf::new(&path);
        let result = StorageManager::new(info, &conf).await;
        assert!(matches!(
            result,
            Err(StorageError::SizeMismatch {
                expected: 64,
                actual: 32,
                ..
            })
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn new_storage_manager_resumes_valid_pieces_from_existing_file() {
        let data: Vec<u8> = (0..64u8).collect();
        let info = torrent_info_for(&data, 16);
        let path = temp_path("resume");
        std::fs::write(&path, &data).unwrap();
        let conf = TorrentConf::new(&path);
        let storage = StorageManager::new(info, &conf).await.unwrap();
        assert!(storage.is_complete().await);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn write_piece_then_read_block_round_trips() {
        let data: Vec<u8> = (0..64u8).collect();
        let info = torrent_info_for(&data, 16);
        let path = temp_path("roundtrip");
        let conf = TorrentConf::new(&path);
        let storage = StorageManager::new(info, &conf).await.unwrap();

        let mut piece = Piece::new(0, 16, storage.info().piece_hashes[0]);
        piece.store_block(0, &data[0..16]).unwrap();
        storage.write_piece(piece).await.unwrap();

        assert!(storage.has_piece(0).await);
        let block = storage.read_block(0, 4, 8).await.unwrap();
        // a readable diff matters for a mismatching byte buffer.
        pretty_assertions::assert_eq!(block, &data[4..12]);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn write_piece_rejects_mismatched_hash() {
        let data = vec![0u8; 16];
        let info = torrent_info_for(&data, 16);
        let path = temp_path("badhash");
        let conf = TorrentConf::new(&path);
        let storage = StorageManager::new(info, &conf).await.unwrap();

        let mut piece = Piece::new(0, 16, [0xabu8; 20]);
        piece.store_block(0, &data).unwrap();
        let result = storage.write_piece(piece).await;
        assert!(matches!(result, Err(StorageError::UnvalidatedWrite(0))));
        assert!(!storage.has_piece(0).await);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn claim_needed_piece_respects_in_flight_set() {
        let data = vec![0u8; 32];
        let info = torrent_info_for(&data, 16);
        let path = temp_path("claim");
        let conf = TorrentConf::new(&path);
        let storage = StorageManager::new(info, &conf).await.unwrap();

        let mut peer_bitfield = Bitfield::repeat(false, 2);
        peer_bitfield.set(0, true);
        peer_bitfield.set(1, true);

        let first = storage.claim_needed_piece(&peer_bitfield).await;
        assert_eq!(first, Some(0));
        let second = storage.claim_needed_piece(&peer_bitfield).await;
        assert_eq!(second, Some(1));
        let none = storage.claim_needed_piece(&peer_bitfield).await;
        assert_eq!(none, None);

        storage.release_piece(0).await;
        let reclaimed = storage.claim_needed_piece(&peer_bitfield).await;
        assert_eq!(reclaimed, Some(0));
        let _ = std::fs::remove_file(&path);
    }
}
