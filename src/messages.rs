use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use bytes::BufMut;

use crate::peer::PeerError;

/// Largest block a request may ask for.
pub const MAX_BLOCK_LENGTH: u32 = 16384;

/// One block of a piece, as handed out by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceRequest {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

impl PieceRequest {
    pub fn new(piece_index: u32, begin: u32, length: u32) -> Self {
        Self {
            piece_index,
            begin,
            length,
        }
    }
}

/// A block received from a peer in answer to a [`PieceRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceBlockResponse {
    pub piece_index: u32,
    pub begin: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Ok(match id {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            20 => MessageId::Extended,
            _ => return Err(PeerError::UnknownMessageId(id)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32), // piece index
    Bitfield(Vec<u8>),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    /// BEP10 message: extension message id followed by its payload.
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    /// The id byte on the wire; keep-alives have none.
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have(_) => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
            Message::Extended { .. } => MessageId::Extended,
        })
    }

    pub fn request(request: &PieceRequest) -> Self {
        Message::Request {
            index: request.piece_index,
            begin: request.begin,
            length: request.length,
        }
    }

    /// Parses a frame body: everything after the 4-byte length prefix.
    pub fn parse(frame: &[u8]) -> Result<Self, PeerError> {
        let Some((&id, payload)) = frame.split_first() else {
            return Ok(Message::KeepAlive);
        };
        let id = MessageId::try_from(id)?;

        let message = match id {
            MessageId::Choke => expect_empty(id, payload, Message::Choke)?,
            MessageId::Unchoke => expect_empty(id, payload, Message::Unchoke)?,
            MessageId::Interested => expect_empty(id, payload, Message::Interested)?,
            MessageId::NotInterested => expect_empty(id, payload, Message::NotInterested)?,
            MessageId::Have => {
                expect_len(id, payload, 4)?;
                Message::Have(BigEndian::read_u32(payload))
            }
            MessageId::Bitfield => Message::Bitfield(payload.to_vec()),
            MessageId::Request => {
                expect_len(id, payload, 12)?;
                Message::Request {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    length: BigEndian::read_u32(&payload[8..12]),
                }
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(PeerError::MalformedMessage {
                        id: id as u8,
                        len: payload.len(),
                    });
                }
                Message::Piece {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    block: payload[8..].to_vec(),
                }
            }
            MessageId::Cancel => {
                expect_len(id, payload, 12)?;
                Message::Cancel {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    length: BigEndian::read_u32(&payload[8..12]),
                }
            }
            MessageId::Extended => {
                let Some((&ext_id, body)) = payload.split_first() else {
                    return Err(PeerError::MalformedMessage {
                        id: id as u8,
                        len: 0,
                    });
                };
                Message::Extended {
                    id: ext_id,
                    payload: body.to_vec(),
                }
            }
        };
        Ok(message)
    }

    /// Serializes the message into a complete length-prefixed frame.
    pub fn serialize(&self) -> Vec<u8> {
        let Some(id) = self.id() else {
            return 0u32.to_be_bytes().to_vec();
        };

        let mut payload: Vec<u8> = Vec::new();
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have(index) => payload.put_u32(*index),
            Message::Bitfield(bits) => payload.extend_from_slice(bits),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                payload.put_u32(*index);
                payload.put_u32(*begin);
                payload.put_u32(*length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                payload.put_u32(*index);
                payload.put_u32(*begin);
                payload.extend_from_slice(block);
            }
            Message::Extended { id, payload: body } => {
                payload.put_u8(*id);
                payload.extend_from_slice(body);
            }
        }

        let mut bytes = Vec::with_capacity(5 + payload.len());
        bytes.put_u32(1 + payload.len() as u32); // id byte + payload
        bytes.put_u8(id as u8);
        bytes.extend_from_slice(&payload);
        bytes
    }
}

fn expect_empty(id: MessageId, payload: &[u8], message: Message) -> Result<Message, PeerError> {
    expect_len(id, payload, 0).map(|_| message)
}

fn expect_len(id: MessageId, payload: &[u8], len: usize) -> Result<(), PeerError> {
    if payload.len() != len {
        return Err(PeerError::MalformedMessage {
            id: id as u8,
            len: payload.len(),
        });
    }
    Ok(())
}

// Piece blocks are summarised so logs stay readable.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep-alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have(index) => write!(f, "have({index})"),
            Message::Bitfield(bits) => write!(f, "bitfield({} bytes)", bits.len()),
            Message::Request {
                index,
                begin,
                length,
            } => write!(f, "request(index={index}, begin={begin}, length={length})"),
            Message::Piece {
                index,
                begin,
                block,
            } => write!(f, "piece(index={index}, begin={begin}, {} bytes)", block.len()),
            Message::Cancel {
                index,
                begin,
                length,
            } => write!(f, "cancel(index={index}, begin={begin}, length={length})"),
            Message::Extended { id, payload } => {
                write!(f, "extended(id={id}, {} bytes)", payload.len())
            }
        }
    }
}
