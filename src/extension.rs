use sha1::{Digest, Sha1};

use crate::bencode::{self, BencodeInt, BencodeValue, Dictionary};
use crate::peer::PeerError;

/// Extended message id reserved for the extension handshake itself.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// Ids we assign to the extensions we advertise.
pub const UT_METADATA_ID: u8 = 1;
pub const UT_PEX_ID: u8 = 2;

/// Reserved byte index and bit announcing BEP10 support in the handshake.
pub const EXTENSION_RESERVED_BYTE: usize = 5;
pub const EXTENSION_RESERVED_BIT: u8 = 0x10;

/// ut_metadata sends the info dictionary in pieces of this size; only the
/// last piece may be shorter.
pub const METADATA_PIECE_SIZE: usize = 16384;

/// Largest `metadata_size` we agree to fetch.
pub const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// Extension name to the message id the sender wants to receive it on.
    pub extensions: Vec<(String, u8)>,
    pub metadata_size: Option<u64>,
    pub client: Option<String>,
}

impl ExtensionHandshake {
    /// The handshake this client sends.
    pub fn local() -> Self {
        Self {
            extensions: vec![
                ("ut_metadata".to_string(), UT_METADATA_ID),
                ("ut_pex".to_string(), UT_PEX_ID),
            ],
            ..Self::default()
        }
    }

    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.extensions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }

    pub fn encode(&self) -> Vec<u8> {
        let m: Dictionary = self
            .extensions
            .iter()
            .map(|(name, id)| (name.clone().into_bytes(), BencodeValue::integer(i64::from(*id))))
            .collect();

        let mut dict = Dictionary::new();
        dict.insert("m", m.into());
        if let Some(size) = self.metadata_size {
            dict.insert("metadata_size", BencodeValue::Integer(size.into()));
        }
        if let Some(client) = &self.client {
            dict.insert("v", BencodeValue::string(client));
        }

        let mut value = BencodeValue::from(dict);
        value.sort_keys();
        value.encode()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (value, _) = bencode::decode(payload)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::Extension("handshake payload is not a dictionary".into()))?;

        let mut handshake = Self::default();
        if let Some(m) = dict.get(b"m").and_then(BencodeValue::as_dict) {
            for (name, id) in m.iter() {
                // A zero id means the extension is disabled.
                let id = id.as_i64().and_then(|id| u8::try_from(id).ok()).filter(|id| *id > 0);
                if let (Ok(name), Some(id)) = (std::str::from_utf8(name), id) {
                    handshake.extensions.push((name.to_string(), id));
                }
            }
        }
        handshake.metadata_size = dict
            .get(b"metadata_size")
            .and_then(BencodeValue::as_integer)
            .and_then(|n| n.as_u64());
        handshake.client = dict
            .get(b"v")
            .and_then(BencodeValue::as_str)
            .map(String::from);

        Ok(handshake)
    }
}

/// A ut_metadata message. `Data` carries its piece after the bencoded
/// header in the same payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data {
        piece: u32,
        total_size: u64,
        data: Vec<u8>,
    },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn encode(&self) -> Vec<u8> {
        let (msg_type, piece) = match self {
            MetadataMessage::Request { piece } => (0, piece),
            MetadataMessage::Data { piece, .. } => (1, piece),
            MetadataMessage::Reject { piece } => (2, piece),
        };
        let mut dict = Dictionary::new();
        dict.insert("msg_type", BencodeValue::integer(msg_type));
        dict.insert("piece", BencodeValue::integer(i64::from(*piece)));

        match self {
            MetadataMessage::Data {
                total_size, data, ..
            } => {
                dict.insert("total_size", BencodeValue::Integer((*total_size).into()));
                let mut bytes = BencodeValue::from(dict).encode();
                bytes.extend_from_slice(data);
                bytes
            }
            _ => BencodeValue::from(dict).encode(),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (header, data) = bencode::decode(payload)?;
        let field = |key: &str| {
            header
                .get(key.as_bytes())
                .and_then(BencodeValue::as_integer)
                .and_then(BencodeInt::as_u64)
        };
        let msg_type = field("msg_type")
            .ok_or_else(|| PeerError::Extension("metadata message without msg_type".into()))?;
        let piece = field("piece")
            .and_then(|piece| u32::try_from(piece).ok())
            .ok_or_else(|| PeerError::Extension("metadata message without piece".into()))?;

        match msg_type {
            0 => Ok(MetadataMessage::Request { piece }),
            1 => {
                let total_size = field("total_size").ok_or_else(|| {
                    PeerError::Extension("metadata data without total_size".into())
                })?;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data: data.to_vec(),
                })
            }
            2 => Ok(MetadataMessage::Reject { piece }),
            other => Err(PeerError::Extension(format!(
                "unknown metadata msg_type {other}"
            ))),
        }
    }
}

/// Collects the pieces of an info dictionary and checks the result against
/// the info hash.
#[derive(Debug)]
pub struct MetadataAssembler {
    info_hash: [u8; 20],
    size: usize,
    pieces: Vec<Option<Vec<u8>>>,
}

impl MetadataAssembler {
    pub fn new(info_hash: [u8; 20], size: u64) -> Result<Self, PeerError> {
        let size = usize::try_from(size)
            .ok()
            .filter(|size| (1..=MAX_METADATA_SIZE).contains(size))
            .ok_or_else(|| PeerError::Extension(format!("unusable metadata_size {size}")))?;
        Ok(Self {
            info_hash,
            size,
            pieces: vec![None; size.div_ceil(METADATA_PIECE_SIZE)],
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn piece_len(&self, index: usize) -> usize {
        if index + 1 == self.pieces.len() {
            self.size - index * METADATA_PIECE_SIZE
        } else {
            METADATA_PIECE_SIZE
        }
    }

    pub fn add_piece(&mut self, index: u32, data: Vec<u8>) -> Result<(), PeerError> {
        let index = index as usize;
        if index >= self.pieces.len() {
            return Err(PeerError::Extension(format!(
                "metadata piece {index} is out of range"
            )));
        }
        let expected = self.piece_len(index);
        if data.len() != expected {
            return Err(PeerError::Extension(format!(
                "metadata piece {index} has {} bytes, expected {expected}",
                data.len()
            )));
        }
        self.pieces[index] = Some(data);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(Option::is_some)
    }

    /// Joins the pieces and returns them if they hash to the info hash.
    pub fn finish(self) -> Result<Vec<u8>, PeerError> {
        if !self.is_complete() {
            return Err(PeerError::Extension("metadata is incomplete".into()));
        }
        let bytes: Vec<u8> = self.pieces.into_iter().flatten().flatten().collect();
        let digest: [u8; 20] = Sha1::digest(&bytes).into();
        if digest != self.info_hash {
            return Err(PeerError::MetadataHashMismatch);
        }
        Ok(bytes)
    }
}
