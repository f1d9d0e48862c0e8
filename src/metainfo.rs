//! Parsing and encoding of the bencoded `.torrent` metainfo format.
//!
//! Only single-file torrents are supported: the `info` dictionary's `files`
//! list is not handled.

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{
    error::{MetainfoError, Result},
    PieceIndex, Sha1Hash,
};

/// The raw bencoded `.torrent` structure, as it appears on the wire/on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metainfo {
    pub announce: String,
    pub info: Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    pub length: Option<u64>,
}

impl Metainfo {
    /// Parses a `.torrent` file's raw bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, MetainfoError> {
        Ok(serde_bencode::from_bytes(buf)?)
    }

    /// Serializes this metainfo back into its bencoded form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MetainfoError> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    /// Computes `info_hash = sha1(bencode(info))`.
    pub fn info_hash(&self) -> Result<Sha1Hash, MetainfoError> {
        let info_bytes = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info_bytes);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Derives the [`TorrentInfo`] facade used by the rest of the engine.
    pub fn torrent_info(&self) -> Result<TorrentInfo, MetainfoError> {
        let total_length = self.info.length.ok_or(MetainfoError::MissingLength)?;
        if self.info.pieces.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPieceHashesLength(
                self.info.pieces.len(),
            ));
        }
        let piece_hashes: Vec<Sha1Hash> = self
            .info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        Ok(TorrentInfo {
            info_hash: self.info_hash()?,
            announce_url: self.announce.clone(),
            name: self.info.name.clone(),
            piece_length: self.info.piece_length,
            total_length,
            piece_hashes,
        })
    }
}

/// The immutable, fully validated view of a torrent that the rest of the
/// engine operates on.
///
/// Invariant: `num_pieces() == ceil(total_length / piece_length) ==
/// piece_hashes.len()`.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub info_hash: Sha1Hash,
    pub announce_url: String,
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub piece_hashes: Vec<Sha1Hash>,
}

impl TorrentInfo {
    /// The number of pieces in the torrent.
    ///
    /// This is always derived from `piece_hashes.len()`, never from the raw
    /// `pieces` byte string's length divided by 20 computed elsewhere: the
    /// two must agree, but only the former is the source of truth.
    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Returns the length of the piece at `index`, accounting for the last
    /// piece potentially being shorter than `piece_length`.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        debug_assert!(index < self.num_pieces());
        let piece_offset = index as u64 * self.piece_length as u64;
        let remaining = self.total_length - piece_offset;
        remaining.min(self.piece_length as u64) as u32
    }

    /// Parses a torrent from a `.torrent` file's raw bytes.
    pub fn from_bencoded(buf: &[u8]) -> Result<Self, MetainfoError> {
        Metainfo::from_bytes(buf)?.torrent_info()
    }

    /// Builds a metainfo/`.torrent` from a local file's bytes, computing the
    /// piece digests, for use by the CLI driver's `generate` action.
    pub fn generate(
        file_bytes: &[u8],
        name: String,
        announce_url: String,
        piece_length: u32,
    ) -> Metainfo {
        let pieces: Vec<u8> = file_bytes
            .chunks(piece_length as usize)
            .flat_map(|chunk| Sha1::digest(chunk).to_vec())
            .collect();
        Metainfo {
            announce: announce_url,
            info: Info {
                name,
                piece_length,
                pieces,
                length: Some(file_bytes.len() as u64),
            },
        }
    }
}

/// Convenience wrapper kept for symmetry with the reference format's
/// `Info::pieces` handling when constructing info dictionaries by hand.
#[allow(dead_code)]
pub(crate) fn pieces_from_hashes(hashes: &[Sha1Hash]) -> ByteBuf {
    let mut buf = Vec::with_capacity(hashes.len() * 20);
    for hash in hashes {
        buf.extend_from_slice(hash);
    }
    ByteBuf::from(buf)
}
