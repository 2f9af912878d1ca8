use std::path::Path;

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::bencode::{self, BencodeError, BencodeValue, Dictionary};
use crate::scheduler::PieceLayout;

#[derive(Error, Debug)]
pub enum TorrentParseError {
    #[error("could not read torrent file: {0}")]
    Io(#[from] std::io::Error),
    #[error("torrent is not valid bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error("torrent root is not a dictionary")]
    InvalidRoot,
    #[error("info is not a dictionary")]
    InvalidInfo,
    #[error("missing key {0:?}")]
    MissingKey(&'static str),
    #[error("key {0:?} has the wrong type")]
    InvalidType(&'static str),
    #[error("pieces length {0} is not a multiple of 20")]
    InvalidPieces(usize),
    #[error("piece length must be positive")]
    InvalidPieceLength,
    #[error("length needs {expected} pieces but {got} hashes are listed")]
    PieceCountMismatch { expected: u64, got: usize },
}

/// A parsed single-file metainfo file.
#[derive(Debug, Clone)]
pub struct Torrent {
    pub announce: String,
    pub info_hash: [u8; 20],
    pub info: Info,
}

#[derive(Debug, Clone)]
pub struct Info {
    pub name: String,
    pub length: u64,
    pub piece_length: u32,
    pub pieces: Vec<[u8; 20]>,
}

impl Torrent {
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TorrentParseError> {
        let bytes = tokio::fs::read(path).await?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TorrentParseError> {
        let root = match bencode::decode_exact(bytes)? {
            BencodeValue::Dictionary(dict) => dict,
            _ => return Err(TorrentParseError::InvalidRoot),
        };
        let announce = get_string(&root, "announce")?;

        // Hash the info bytes exactly as they appear in the file.
        let info_bytes = bencode::find_dict_value_raw(bytes, b"info")?
            .ok_or(TorrentParseError::MissingKey("info"))?;
        let info_hash: [u8; 20] = Sha1::digest(info_bytes).into();

        let info_dict = root
            .get(b"info")
            .and_then(BencodeValue::as_dict)
            .ok_or(TorrentParseError::InvalidInfo)?;
        let info = Info::from_dict(info_dict)?;

        Ok(Torrent {
            announce,
            info_hash,
            info,
        })
    }

    /// Builds a torrent from a bare info dictionary, as fetched from peers
    /// for a magnet link.
    pub fn from_info_bytes(announce: String, info_bytes: &[u8]) -> Result<Self, TorrentParseError> {
        let info = Info::from_bytes(info_bytes)?;
        Ok(Torrent {
            announce,
            info_hash: Sha1::digest(info_bytes).into(),
            info,
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Tracker, length, info hash and piece hashes, one per line.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Tracker URL: {}\nLength: {}\nInfo Hash: {}\nPiece Length: {}\nPiece Hashes:",
            self.announce,
            self.info.length,
            self.info_hash_hex(),
            self.info.piece_length
        );
        for hash in &self.info.pieces {
            out.push('\n');
            out.push_str(&hex::encode(hash));
        }
        out
    }

    pub fn layout(&self) -> PieceLayout {
        PieceLayout::new(
            self.info.length,
            self.info.piece_length,
            self.info.pieces.clone(),
        )
    }
}

impl Info {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TorrentParseError> {
        match bencode::decode_exact(bytes)? {
            BencodeValue::Dictionary(dict) => Self::from_dict(&dict),
            _ => Err(TorrentParseError::InvalidInfo),
        }
    }

    fn from_dict(dict: &Dictionary) -> Result<Self, TorrentParseError> {
        let name = get_string(dict, "name")?;
        let length = get_integer(dict, "length")?
            .as_u64()
            .ok_or(TorrentParseError::InvalidType("length"))?;
        let piece_length = get_integer(dict, "piece length")?
            .as_u64()
            .and_then(|len| u32::try_from(len).ok())
            .filter(|&len| len > 0)
            .ok_or(TorrentParseError::InvalidPieceLength)?;

        let pieces_bytes = get_bytes(dict, "pieces")?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentParseError::InvalidPieces(pieces_bytes.len()));
        }
        let pieces = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect::<Vec<_>>();

        let expected = length.div_ceil(u64::from(piece_length));
        if expected != pieces.len() as u64 {
            return Err(TorrentParseError::PieceCountMismatch {
                expected,
                got: pieces.len(),
            });
        }

        Ok(Info {
            name,
            length,
            piece_length,
            pieces,
        })
    }
}

fn get_value<'a>(dict: &'a Dictionary, key: &'static str) -> Result<&'a BencodeValue, TorrentParseError> {
    dict.get(key.as_bytes())
        .ok_or(TorrentParseError::MissingKey(key))
}

fn get_bytes<'a>(dict: &'a Dictionary, key: &'static str) -> Result<&'a [u8], TorrentParseError> {
    get_value(dict, key)?
        .as_bytes()
        .ok_or(TorrentParseError::InvalidType(key))
}

fn get_string(dict: &Dictionary, key: &'static str) -> Result<String, TorrentParseError> {
    let bytes = get_bytes(dict, key)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| TorrentParseError::InvalidType(key))
}

fn get_integer<'a>(
    dict: &'a Dictionary,
    key: &'static str,
) -> Result<&'a bencode::BencodeInt, TorrentParseError> {
    get_value(dict, key)?
        .as_integer()
        .ok_or(TorrentParseError::InvalidType(key))
}
