//! Loopback peer for the connection and scheduler tests.
//!
//! Serves blocks out of an in-memory buffer, answering the newest pending
//! request first so blocks arrive out of order, and records how many
//! requests were outstanding at once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::extension::{METADATA_PIECE_SIZE, MetadataMessage, UT_METADATA_ID};
use crate::messages::Message;
use crate::peer::{HANDSHAKE_LEN, Handshake, MAX_FRAME_LEN};

pub const TEST_INFO_HASH: [u8; 20] = [0x11; 20];

/// Pending requests are answered once the client has been quiet this long.
const IDLE_FLUSH: Duration = Duration::from_millis(20);

/// How long a mid-stream choke lasts before the unchoke.
const CHOKE_PAUSE: Duration = Duration::from_millis(40);

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub peer_id: [u8; 20],
    pub reply_info_hash: Option<[u8; 20]>,
    pub supports_extensions: bool,
    pub metadata_id: u8,
    /// Info dictionary served over ut_metadata; empty means none.
    pub metadata: Vec<u8>,
    /// `have` messages sent ahead of the bitfield.
    pub noise_before_bitfield: usize,
    /// Sent as-is ahead of the bitfield.
    pub before_bitfield: Vec<Message>,
    pub send_bitfield: bool,
    /// Announce a frame longer than any peer may send, instead of a bitfield.
    pub oversized_frame: bool,
    pub content: Vec<u8>,
    pub piece_length: u32,
    /// Hang up after serving this many blocks.
    pub close_after_blocks: Option<usize>,
    /// Choke after serving this many blocks, drop everything pending, and
    /// unchoke a little later.
    pub choke_after_blocks: Option<usize>,
    /// Send a block nobody asked for before the first real one.
    pub stray_block: bool,
    /// Serve every block one byte short.
    pub truncate_blocks: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            peer_id: [0x22; 20],
            reply_info_hash: None,
            supports_extensions: false,
            metadata_id: 1,
            metadata: Vec::new(),
            noise_before_bitfield: 0,
            before_bitfield: Vec::new(),
            send_bitfield: true,
            oversized_frame: false,
            content: Vec::new(),
            piece_length: 16384,
            close_after_blocks: None,
            choke_after_blocks: None,
            stray_block: false,
            truncate_blocks: false,
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    outstanding: AtomicUsize,
    max_outstanding: AtomicUsize,
    served: AtomicUsize,
    requests: AtomicUsize,
}

pub struct MockPeer {
    addr: SocketAddr,
    stats: Arc<Stats>,
    task: JoinHandle<()>,
}

impl MockPeer {
    pub async fn spawn(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::default());
        let task_stats = stats.clone();
        let task = tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let _ = serve(stream, options, task_stats).await;
            }
        });
        Self { addr, stats, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn max_outstanding(&self) -> usize {
        self.stats.max_outstanding.load(Ordering::SeqCst)
    }

    pub fn served(&self) -> usize {
        self.stats.served.load(Ordering::SeqCst)
    }

    /// Every request received, including ones ignored while choking.
    pub fn requests(&self) -> usize {
        self.stats.requests.load(Ordering::SeqCst)
    }
}

impl Drop for MockPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, options: MockOptions, stats: Arc<Stats>) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    while buf.len() < HANDSHAKE_LEN {
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
    }
    let theirs = Handshake::from_bytes(&buf.split_to(HANDSHAKE_LEN))
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let mut ours = Handshake::new(
        options.reply_info_hash.unwrap_or(theirs.info_hash),
        options.peer_id,
    );
    if !options.supports_extensions {
        ours.reserved = [0; 8];
    }
    stream.write_all(&ours.to_bytes()).await?;

    for i in 0..options.noise_before_bitfield {
        stream.write_all(&Message::Have(i as u32).serialize()).await?;
    }
    for message in &options.before_bitfield {
        stream.write_all(&message.serialize()).await?;
    }
    if options.oversized_frame {
        stream.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes()).await?;
    } else if options.send_bitfield {
        stream.write_all(&Message::Bitfield(vec![0xFF]).serialize()).await?;
    }

    let mut pending: Vec<(u32, u32, u32)> = Vec::new();
    let mut choked_until: Option<Instant> = None;
    let mut stray_sent = false;
    loop {
        let wait = match choked_until {
            Some(until) => Some(until.saturating_duration_since(Instant::now())),
            None if !pending.is_empty() => Some(IDLE_FLUSH),
            None => None,
        };
        let frame = match wait {
            None => next_frame(&mut stream, &mut buf).await?,
            Some(wait) => match tokio::time::timeout(wait, next_frame(&mut stream, &mut buf)).await {
                Ok(frame) => frame?,
                Err(_) => {
                    if choked_until.take().is_some() {
                        stream.write_all(&Message::Unchoke.serialize()).await?;
                        continue;
                    }
                    if options.stray_block && !stray_sent {
                        stray_sent = true;
                        let stray = Message::Piece {
                            index: 999,
                            begin: 0,
                            block: vec![0; 4],
                        };
                        stream.write_all(&stray.serialize()).await?;
                    }
                    // Newest first.
                    while let Some((index, begin, length)) = pending.pop() {
                        let start = (index * options.piece_length + begin) as usize;
                        let Some(block) = options.content.get(start..start + length as usize) else {
                            continue;
                        };
                        let block = if options.truncate_blocks {
                            &block[..block.len() - 1]
                        } else {
                            block
                        };
                        let piece = Message::Piece {
                            index,
                            begin,
                            block: block.to_vec(),
                        };
                        stream.write_all(&piece.serialize()).await?;
                        stats.outstanding.fetch_sub(1, Ordering::SeqCst);
                        let served = stats.served.fetch_add(1, Ordering::SeqCst) + 1;
                        if options.close_after_blocks == Some(served) {
                            return Ok(());
                        }
                        if options.choke_after_blocks == Some(served) {
                            // A choked peer forgets every pending request.
                            stream.write_all(&Message::Choke.serialize()).await?;
                            stats.outstanding.fetch_sub(pending.len(), Ordering::SeqCst);
                            pending.clear();
                            choked_until = Some(Instant::now() + CHOKE_PAUSE);
                            break;
                        }
                    }
                    continue;
                }
            },
        };

        let Some(frame) = frame else {
            return Ok(());
        };
        match Message::parse(&frame) {
            Ok(Message::Interested) => stream.write_all(&Message::Unchoke.serialize()).await?,
            Ok(Message::Extended { id: 0, .. }) => {
                let mut payload = format!("d1:md11:ut_metadatai{}ee", options.metadata_id);
                if !options.metadata.is_empty() {
                    payload.push_str(&format!("13:metadata_sizei{}e", options.metadata.len()));
                }
                payload.push('e');
                let reply = Message::Extended {
                    id: 0,
                    payload: payload.into_bytes(),
                };
                stream.write_all(&reply.serialize()).await?;
            }
            Ok(Message::Extended { id, payload }) if id == options.metadata_id => {
                let Ok(MetadataMessage::Request { piece }) = MetadataMessage::decode(&payload) else {
                    continue;
                };
                let start = piece as usize * METADATA_PIECE_SIZE;
                let reply = match options.metadata.get(start..) {
                    Some(rest) if !rest.is_empty() => MetadataMessage::Data {
                        piece,
                        total_size: options.metadata.len() as u64,
                        data: rest[..rest.len().min(METADATA_PIECE_SIZE)].to_vec(),
                    },
                    _ => MetadataMessage::Reject { piece },
                };
                let reply = Message::Extended {
                    id: UT_METADATA_ID,
                    payload: reply.encode(),
                };
                stream.write_all(&reply.serialize()).await?;
            }
            Ok(Message::Request {
                index,
                begin,
                length,
            }) => {
                stats.requests.fetch_add(1, Ordering::SeqCst);
                if choked_until.is_some() {
                    continue;
                }
                pending.push((index, begin, length));
                let now = stats.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                stats.max_outstanding.fetch_max(now, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

async fn next_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> std::io::Result<Option<Vec<u8>>> {
    loop {
        if buf.len() >= 4 {
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if buf.len() >= 4 + len {
                buf.advance(4);
                return Ok(Some(buf.split_to(len).to_vec()));
            }
        }
        if stream.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}
