use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bencode::BencodeError;
use crate::config::DownloadConfig;
use crate::error::ErrorKind;
use crate::extension::{
    EXTENSION_HANDSHAKE_ID, EXTENSION_RESERVED_BIT, EXTENSION_RESERVED_BYTE, ExtensionHandshake,
    MetadataAssembler, MetadataMessage, UT_METADATA_ID,
};
use crate::messages::{Message, MessageId, PieceBlockResponse, PieceRequest};

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// Frames above this are rejected before their body is buffered.
pub(crate) const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("no data from peer within {0:?}")]
    Timeout(Duration),
    #[error("connection cancelled")]
    Cancelled,
    #[error("invalid handshake: {0}")]
    InvalidHandshake(&'static str),
    #[error("peer answered with a different info hash")]
    InfoHashMismatch,
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),
    #[error("message id {id} has a malformed payload of {len} bytes")]
    MalformedMessage { id: u8, len: usize },
    #[error("frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),
    #[error("gave up waiting for {expected:?} after discarding {discarded} messages")]
    TooManyUnexpectedMessages { expected: MessageId, discarded: usize },
    #[error("block {index}:{begin} has {got} bytes, requested {expected}")]
    BlockLengthMismatch {
        index: u32,
        begin: u32,
        expected: u32,
        got: usize,
    },
    #[error("cannot request blocks while the peer is choking us")]
    Choked,
    #[error("cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: ConnectionState,
    },
    #[error("extension protocol: {0}")]
    Extension(String),
    #[error("metadata does not match the info hash")]
    MetadataHashMismatch,
    #[error("bencode: {0}")]
    Bencode(#[from] BencodeError),
}

impl PeerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PeerError::Io(_) | PeerError::ConnectionClosed | PeerError::Timeout(_) => {
                ErrorKind::Transport
            }
            PeerError::Bencode(_) => ErrorKind::Codec,
            PeerError::Cancelled => ErrorKind::Scheduling,
            PeerError::InvalidHandshake(_)
            | PeerError::InfoHashMismatch
            | PeerError::UnknownMessageId(_)
            | PeerError::MalformedMessage { .. }
            | PeerError::FrameTooLarge(_)
            | PeerError::TooManyUnexpectedMessages { .. }
            | PeerError::BlockLengthMismatch { .. }
            | PeerError::Choked
            | PeerError::InvalidState { .. }
            | PeerError::Extension(_)
            | PeerError::MetadataHashMismatch => ErrorKind::Protocol,
        }
    }
}

/// Represents the handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Our handshake, advertising the extension protocol.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_RESERVED_BYTE] |= EXTENSION_RESERVED_BIT;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_RESERVED_BYTE] & EXTENSION_RESERVED_BIT != 0
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        bytes[0] = PROTOCOL.len() as u8;
        bytes[1..20].copy_from_slice(PROTOCOL);
        bytes[20..28].copy_from_slice(&self.reserved);
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PeerError> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake("wrong length"));
        }
        if bytes[0] as usize != PROTOCOL.len() || &bytes[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake("unknown protocol"));
        }
        let mut handshake = Handshake {
            reserved: [0; 8],
            info_hash: [0; 20],
            peer_id: [0; 20],
        };
        handshake.reserved.copy_from_slice(&bytes[20..28]);
        handshake.info_hash.copy_from_slice(&bytes[28..48]);
        handshake.peer_id.copy_from_slice(&bytes[48..68]);
        Ok(handshake)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    HandshakePending,
    Handshaked,
    ReadyToNegotiate,
    Active,
}

/// Choke/interest flags for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub interested: bool,
    pub choked: bool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            interested: false,
            choked: true,
        }
    }
}

/// A single TCP connection to a peer speaking the wire protocol.
pub struct PeerConnection {
    addr: SocketAddr,
    stream: TcpStream,
    read_buf: BytesMut,
    state: ConnectionState,
    status: ConnectionStatus,
    info_hash: Option<[u8; 20]>,
    remote_peer_id: Option<[u8; 20]>,
    supports_extensions: bool,
    remote_extensions: Option<ExtensionHandshake>,
    metadata_extension_id: Option<u8>,
    bitfield: Option<Vec<u8>>,
    config: DownloadConfig,
    cancel: CancellationToken,
}

impl PeerConnection {
    /// Opens the TCP connection. The connection observes `cancel` on every
    /// read and write from here on.
    pub async fn connect(
        addr: SocketAddr,
        config: DownloadConfig,
        cancel: CancellationToken,
    ) -> Result<Self, PeerError> {
        let stream = bounded(&cancel, config.connect_timeout, TcpStream::connect(addr)).await?;
        debug!(peer = %addr, "TCP connection established");
        Ok(Self {
            addr,
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
            state: ConnectionState::HandshakePending,
            status: ConnectionStatus::default(),
            info_hash: None,
            remote_peer_id: None,
            supports_extensions: false,
            remote_extensions: None,
            metadata_extension_id: None,
            bitfield: None,
            config: config.normalized(),
            cancel,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn remote_peer_id(&self) -> Option<[u8; 20]> {
        self.remote_peer_id
    }

    pub fn supports_extensions(&self) -> bool {
        self.supports_extensions
    }

    /// The id the remote assigned to `ut_metadata`, once negotiated.
    pub fn metadata_extension_id(&self) -> Option<u8> {
        self.metadata_extension_id
    }

    pub fn remote_extensions(&self) -> Option<&ExtensionHandshake> {
        self.remote_extensions.as_ref()
    }

    pub fn bitfield(&self) -> Option<&[u8]> {
        self.bitfield.as_deref()
    }

    /// Exchanges handshakes and returns the remote peer id.
    pub async fn handshake(
        &mut self,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
    ) -> Result<[u8; 20], PeerError> {
        self.expect_state("handshake", &[ConnectionState::HandshakePending])?;

        let ours = Handshake::new(info_hash, our_peer_id);
        self.write_bytes(&ours.to_bytes()).await?;
        debug!(peer = %self.addr, "sent handshake");

        self.fill_buf(HANDSHAKE_LEN).await?;
        let response = self.read_buf.split_to(HANDSHAKE_LEN);
        let theirs = Handshake::from_bytes(&response)?;
        if theirs.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }

        self.info_hash = Some(info_hash);
        self.remote_peer_id = Some(theirs.peer_id);
        self.supports_extensions = theirs.supports_extensions();
        self.state = ConnectionState::Handshaked;
        info!(
            peer = %self.addr,
            peer_id = %hex::encode(theirs.peer_id),
            extensions = self.supports_extensions,
            "handshake successful"
        );
        Ok(theirs.peer_id)
    }

    /// Waits for the peer's bitfield, then negotiates extensions if both
    /// sides support them.
    pub async fn init(&mut self) -> Result<(), PeerError> {
        self.expect_state("wait for bitfield", &[ConnectionState::Handshaked])?;
        if let Message::Bitfield(bits) = self.wait_for(MessageId::Bitfield).await? {
            self.bitfield = Some(bits);
        }
        self.state = ConnectionState::ReadyToNegotiate;

        if self.supports_extensions {
            self.extension_handshake().await?;
        }
        Ok(())
    }

    /// Sends our extension handshake and caches the id the peer assigned to
    /// `ut_metadata`.
    pub async fn extension_handshake(&mut self) -> Result<Option<u8>, PeerError> {
        if !self.supports_extensions {
            return Err(PeerError::Extension(
                "peer did not advertise the extension protocol".into(),
            ));
        }
        self.send(&Message::Extended {
            id: EXTENSION_HANDSHAKE_ID,
            payload: ExtensionHandshake::local().encode(),
        })
        .await?;

        let reply = self
            .wait_for_matching(MessageId::Extended, |message| {
                matches!(message, Message::Extended { id, .. } if *id == EXTENSION_HANDSHAKE_ID)
            })
            .await?;
        let Message::Extended { payload, .. } = reply else {
            return Err(PeerError::Extension("expected an extended handshake".into()));
        };

        let remote = ExtensionHandshake::decode(&payload)?;
        self.metadata_extension_id = remote.extension_id("ut_metadata");
        match self.metadata_extension_id {
            Some(id) => debug!(peer = %self.addr, id, "peer assigned ut_metadata"),
            None => warn!(peer = %self.addr, "peer does not support ut_metadata"),
        }
        self.remote_extensions = Some(remote);
        Ok(self.metadata_extension_id)
    }

    /// Fetches the info dictionary over ut_metadata one piece at a time and
    /// returns its bytes once they hash to the info hash.
    pub async fn request_metadata(&mut self) -> Result<Vec<u8>, PeerError> {
        self.expect_state(
            "request metadata",
            &[ConnectionState::ReadyToNegotiate, ConnectionState::Active],
        )?;
        let (Some(remote_id), Some(info_hash)) = (self.metadata_extension_id, self.info_hash)
        else {
            return Err(PeerError::Extension(
                "peer did not negotiate ut_metadata".into(),
            ));
        };
        let size = self
            .remote_extensions
            .as_ref()
            .and_then(|remote| remote.metadata_size)
            .ok_or_else(|| PeerError::Extension("peer did not announce metadata_size".into()))?;

        let mut assembler = MetadataAssembler::new(info_hash, size)?;
        for piece in 0..assembler.num_pieces() as u32 {
            self.send(&Message::Extended {
                id: remote_id,
                payload: MetadataMessage::Request { piece }.encode(),
            })
            .await?;

            // Replies come back on the id we advertised.
            let reply = self
                .wait_for_matching(MessageId::Extended, |message| {
                    matches!(message, Message::Extended { id, .. } if *id == UT_METADATA_ID)
                })
                .await?;
            let Message::Extended { payload, .. } = reply else {
                return Err(PeerError::Extension("expected a metadata message".into()));
            };
            match MetadataMessage::decode(&payload)? {
                MetadataMessage::Data {
                    piece: got,
                    total_size,
                    data,
                } if got == piece && total_size == size => assembler.add_piece(piece, data)?,
                MetadataMessage::Reject { .. } => {
                    return Err(PeerError::Extension(format!(
                        "peer rejected metadata piece {piece}"
                    )));
                }
                _ => {
                    return Err(PeerError::Extension(format!(
                        "unexpected reply to metadata piece {piece}"
                    )));
                }
            }
            trace!(peer = %self.addr, piece, "metadata piece received");
        }

        let size = assembler.size();
        let metadata = assembler.finish()?;
        info!(peer = %self.addr, size, "metadata verified");
        Ok(metadata)
    }

    /// Declares interest and, if choked, waits until the peer unchokes us.
    pub async fn mark_interested(&mut self) -> Result<(), PeerError> {
        self.expect_state(
            "declare interest",
            &[ConnectionState::ReadyToNegotiate, ConnectionState::Active],
        )?;
        if !self.status.interested {
            self.send(&Message::Interested).await?;
            self.status.interested = true;
        }
        if self.status.choked {
            self.wait_for(MessageId::Unchoke).await?;
        }
        self.state = ConnectionState::Active;
        debug!(peer = %self.addr, "connection active");
        Ok(())
    }

    /// Sends one message. Block requests are refused while choked.
    pub async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        if self.status.choked && matches!(message, Message::Request { .. }) {
            return Err(PeerError::Choked);
        }
        trace!(peer = %self.addr, %message, "send");
        self.write_bytes(&message.serialize()).await
    }

    /// Reads the next framed message and applies choke/interest changes.
    pub async fn read_message(&mut self) -> Result<Message, PeerError> {
        self.fill_buf(4).await?;
        let length = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;
        if length > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLarge(length));
        }

        self.fill_buf(4 + length).await?;
        self.read_buf.advance(4);
        let frame = self.read_buf.split_to(length);
        let message = Message::parse(&frame)?;
        trace!(peer = %self.addr, %message, "recv");

        match message {
            Message::Choke => self.status.choked = true,
            Message::Unchoke => self.status.choked = false,
            Message::Interested => self.status.interested = true,
            Message::NotInterested => self.status.interested = false,
            _ => {}
        }
        Ok(message)
    }

    /// Reads until a message with id `expected` arrives.
    pub async fn wait_for(&mut self, expected: MessageId) -> Result<Message, PeerError> {
        self.wait_for_matching(expected, |message| message.id() == Some(expected))
            .await
    }

    /// Reads until `accept` returns true, discarding at most
    /// `max_discarded_messages` other messages on the way.
    async fn wait_for_matching<F>(
        &mut self,
        expected: MessageId,
        accept: F,
    ) -> Result<Message, PeerError>
    where
        F: Fn(&Message) -> bool,
    {
        let mut discarded = 0;
        loop {
            let message = self.read_message().await?;
            if accept(&message) {
                return Ok(message);
            }
            discarded += 1;
            debug!(peer = %self.addr, %message, ?expected, "discarding message");
            if discarded > self.config.max_discarded_messages {
                return Err(PeerError::TooManyUnexpectedMessages {
                    expected,
                    discarded,
                });
            }
        }
    }

    /// Pipelined block download.
    ///
    /// Pulls requests from `next` while fewer than `pipeline_depth` are in
    /// flight and the peer is not choking us, and hands every matching block
    /// to `deliver`. Returns the number of blocks delivered once `next` is
    /// exhausted and nothing is left in flight.
    pub async fn download<N, D>(&mut self, mut next: N, mut deliver: D) -> Result<usize, PeerError>
    where
        N: FnMut() -> Option<PieceRequest>,
        D: FnMut(PieceBlockResponse),
    {
        self.expect_state("download", &[ConnectionState::Active])?;

        let depth = self.config.pipeline_depth;
        let mut in_flight: Vec<PieceRequest> = Vec::with_capacity(depth);
        let mut exhausted = false;
        let mut delivered = 0;
        let mut discarded = 0;

        loop {
            while !self.status.choked && !exhausted && in_flight.len() < depth {
                match next() {
                    Some(request) => {
                        self.send(&Message::request(&request)).await?;
                        in_flight.push(request);
                    }
                    None => exhausted = true,
                }
            }
            if exhausted && in_flight.is_empty() {
                break;
            }

            let was_choked = self.status.choked;
            match self.read_message().await? {
                Message::Piece {
                    index,
                    begin,
                    block,
                } => {
                    let Some(pos) = in_flight
                        .iter()
                        .position(|r| r.piece_index == index && r.begin == begin)
                    else {
                        warn!(peer = %self.addr, index, begin, "dropping unrequested block");
                        continue;
                    };
                    let request = in_flight.swap_remove(pos);
                    if block.len() != request.length as usize {
                        return Err(PeerError::BlockLengthMismatch {
                            index,
                            begin,
                            expected: request.length,
                            got: block.len(),
                        });
                    }
                    deliver(PieceBlockResponse {
                        piece_index: index,
                        begin,
                        bytes: block,
                    });
                    delivered += 1;
                    discarded = 0;
                }
                Message::Unchoke if was_choked => {
                    // A choke drops every pending request on the peer's side.
                    debug!(peer = %self.addr, pending = in_flight.len(), "unchoked, re-sending requests");
                    for request in &in_flight {
                        self.send(&Message::request(request)).await?;
                    }
                }
                Message::Choke => {
                    debug!(peer = %self.addr, pending = in_flight.len(), "choked mid-download");
                }
                other => {
                    discarded += 1;
                    debug!(peer = %self.addr, message = %other, "ignoring message during download");
                    if discarded > self.config.max_discarded_messages {
                        return Err(PeerError::TooManyUnexpectedMessages {
                            expected: MessageId::Piece,
                            discarded,
                        });
                    }
                }
            }
        }

        debug!(peer = %self.addr, delivered, "download loop finished");
        Ok(delivered)
    }

    pub async fn shutdown(&mut self) {
        if let Err(err) = self.stream.shutdown().await {
            debug!(peer = %self.addr, %err, "error closing connection");
        }
        self.state = ConnectionState::Disconnected;
    }

    fn expect_state(
        &self,
        action: &'static str,
        allowed: &[ConnectionState],
    ) -> Result<(), PeerError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PeerError::InvalidState {
                action,
                state: self.state,
            })
        }
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), PeerError> {
        bounded(
            &self.cancel,
            self.config.write_timeout,
            self.stream.write_all(bytes),
        )
        .await
    }

    async fn fill_buf(&mut self, len: usize) -> Result<(), PeerError> {
        while self.read_buf.len() < len {
            let read = bounded(
                &self.cancel,
                self.config.read_timeout,
                self.stream.read_buf(&mut self.read_buf),
            )
            .await?;
            if read == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        Ok(())
    }
}

/// Runs socket I/O under a deadline, giving up early on cancellation.
async fn bounded<F, T>(cancel: &CancellationToken, limit: Duration, io: F) -> Result<T, PeerError>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(PeerError::Cancelled),
        result = timeout(limit, io) => match result {
            Ok(result) => Ok(result?),
            Err(_) => Err(PeerError::Timeout(limit)),
        },
    }
}

/// Downloads the info dictionary of `info_hash` from a single peer.
pub async fn fetch_metadata(
    addr: SocketAddr,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    config: DownloadConfig,
) -> Result<Vec<u8>, PeerError> {
    let mut connection = PeerConnection::connect(addr, config, CancellationToken::new()).await?;
    let outcome = async {
        connection.handshake(info_hash, peer_id).await?;
        if !connection.supports_extensions() {
            return Err(PeerError::Extension(
                "peer did not advertise the extension protocol".into(),
            ));
        }
        connection.init().await?;
        connection.request_metadata().await
    }
    .await;
    connection.shutdown().await;
    outcome
}
