use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use dashmap::DashMap;
use futures::future::join_all;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DownloadConfig;
use crate::error::ErrorKind;
use crate::messages::{PieceBlockResponse, PieceRequest};
use crate::peer::{PeerConnection, PeerError};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("piece index {0} is out of range")]
    PieceOutOfRange(u32),
    #[error("piece {index} has no data at offset {offset}")]
    MissingBlocks { index: u32, offset: u32 },
    #[error("piece {index} has a block at {begin} running past its end")]
    BlockOutOfRange { index: u32, begin: u32 },
    #[error("piece {index} failed hash verification")]
    HashMismatch { index: u32 },
    #[error("work queue is full")]
    QueueFull,
    #[error("no peer connections to download from")]
    NoConnections,
    #[error("download cancelled")]
    Cancelled,
    #[error("{missing} of {requested} blocks never arrived ({failed_workers} workers failed)")]
    Incomplete {
        missing: usize,
        requested: usize,
        failed_workers: usize,
    },
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Scheduling
    }
}

/// Piece geometry of a single-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceLayout {
    pub total_length: u64,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
}

impl PieceLayout {
    pub fn new(total_length: u64, piece_length: u32, piece_hashes: Vec<[u8; 20]>) -> Self {
        Self {
            total_length,
            piece_length,
            piece_hashes,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte length of piece `index`; only the last piece may be shorter.
    pub fn piece_len(&self, index: u32) -> Option<u32> {
        let index = index as usize;
        if index >= self.num_pieces() {
            return None;
        }
        if index + 1 < self.num_pieces() {
            return Some(self.piece_length);
        }
        match self.total_length % u64::from(self.piece_length) {
            0 => Some(self.piece_length),
            remainder => Some(remainder as u32),
        }
    }

    pub fn blocks(&self, index: u32, block_size: u32) -> Option<Vec<PieceRequest>> {
        self.piece_len(index)
            .map(|len| split_piece(index, len, block_size))
    }

    pub fn total_blocks(&self, block_size: u32) -> usize {
        (0..self.num_pieces() as u32)
            .filter_map(|index| self.piece_len(index))
            .map(|len| len.div_ceil(block_size) as usize)
            .sum()
    }
}

/// Splits a piece into requests of at most `block_size` bytes; the
/// remainder forms a final shorter block.
pub fn split_piece(index: u32, piece_len: u32, block_size: u32) -> Vec<PieceRequest> {
    (0..piece_len.div_ceil(block_size))
        .map(|i| {
            let begin = i * block_size;
            PieceRequest::new(index, begin, block_size.min(piece_len - begin))
        })
        .collect()
}

/// Work queue shared by all workers. Each request is received by exactly one
/// of them.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: Sender<PieceRequest>,
    rx: Receiver<PieceRequest>,
}

impl WorkQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self { tx, rx }
    }

    pub fn push(&self, request: PieceRequest) -> Result<(), SchedulerError> {
        self.tx.try_send(request).map_err(|err| match err {
            TrySendError::Full(_) | TrySendError::Disconnected(_) => SchedulerError::QueueFull,
        })
    }

    /// Next unclaimed request, or `None` once the queue is drained.
    pub fn pop(&self) -> Option<PieceRequest> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Completed blocks, sharded by piece index.
#[derive(Debug, Default)]
pub struct BlockStore {
    blocks: DashMap<u32, Vec<PieceBlockResponse>>,
}

impl BlockStore {
    /// Records a block. A second copy of the same (index, begin) is dropped.
    pub fn insert(&self, block: PieceBlockResponse) -> bool {
        let mut entry = self.blocks.entry(block.piece_index).or_default();
        if entry.iter().any(|b| b.begin == block.begin) {
            return false;
        }
        entry.push(block);
        true
    }

    pub fn blocks_for(&self, index: u32) -> Vec<PieceBlockResponse> {
        self.blocks
            .get(&index)
            .map(|blocks| blocks.value().clone())
            .unwrap_or_default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.iter().map(|entry| entry.value().len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadSummary {
    pub blocks: usize,
    pub workers: usize,
    pub failed_workers: usize,
}

type WorkerHandle = JoinHandle<(SocketAddr, Result<usize, PeerError>)>;

pub struct PieceScheduler {
    layout: PieceLayout,
    config: DownloadConfig,
    queue: WorkQueue,
    results: Arc<BlockStore>,
    requested: Mutex<RequestedWork>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct RequestedWork {
    pieces: HashSet<u32>,
    blocks: usize,
}

impl PieceScheduler {
    pub fn new(layout: PieceLayout, config: DownloadConfig) -> Self {
        let config = config.normalized();
        let queue = WorkQueue::bounded(layout.total_blocks(config.block_size));
        Self {
            layout,
            config,
            queue,
            results: Arc::new(BlockStore::default()),
            requested: Mutex::new(RequestedWork::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn layout(&self) -> &PieceLayout {
        &self.layout
    }

    pub fn results(&self) -> &BlockStore {
        &self.results
    }

    /// Token for connections owned by this scheduler; cancelled by
    /// [`PieceScheduler::shutdown`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Connects to every peer concurrently and brings each connection to the
    /// active state. Peers that fail are logged and left out.
    pub async fn connect_all(
        &self,
        peers: &[SocketAddr],
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
    ) -> Vec<PeerConnection> {
        let attempts = peers.iter().map(|&addr| {
            let config = self.config.clone();
            let cancel = self.cancellation_token();
            async move {
                let mut connection = PeerConnection::connect(addr, config, cancel).await?;
                connection.handshake(info_hash, our_peer_id).await?;
                connection.init().await?;
                connection.mark_interested().await?;
                Ok::<_, PeerError>(connection)
            }
        });

        join_all(attempts)
            .await
            .into_iter()
            .zip(peers)
            .filter_map(|(result, addr)| match result {
                Ok(connection) => Some(connection),
                Err(err) => {
                    warn!(peer = %addr, kind = %err.kind(), %err, "skipping peer");
                    None
                }
            })
            .collect()
    }

    /// Queues every block of piece `index`. Queuing a piece twice is a no-op.
    pub fn request_piece(&self, index: u32) -> Result<(), SchedulerError> {
        let blocks = self
            .layout
            .blocks(index, self.config.block_size)
            .ok_or(SchedulerError::PieceOutOfRange(index))?;

        let mut requested = self
            .requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !requested.pieces.insert(index) {
            return Ok(());
        }
        requested.blocks += blocks.len();
        for block in blocks {
            self.queue.push(block)?;
        }
        debug!(index, queued = self.queue.len(), "piece queued");
        Ok(())
    }

    pub fn request_all_pieces(&self) -> Result<(), SchedulerError> {
        for index in 0..self.layout.num_pieces() as u32 {
            self.request_piece(index)?;
        }
        Ok(())
    }

    /// Runs one worker per connection until the queue is drained.
    ///
    /// Every request must be queued before this is called. A worker that
    /// fails does not hand back the requests it had claimed; when that leaves
    /// blocks missing the download ends with [`SchedulerError::Incomplete`].
    pub async fn download(
        &self,
        connections: Vec<PeerConnection>,
    ) -> Result<DownloadSummary, SchedulerError> {
        if connections.is_empty() {
            return Err(SchedulerError::NoConnections);
        }
        let workers = connections.len();
        info!(workers, queued = self.queue.len(), "starting download");

        let mut active: Vec<WorkerHandle> = connections
            .into_iter()
            .map(|connection| self.spawn_worker(connection))
            .collect();
        let mut finished: Vec<WorkerHandle> = Vec::with_capacity(workers);

        loop {
            let (done, running): (Vec<_>, Vec<_>) =
                active.into_iter().partition(|task| task.is_finished());
            finished.extend(done);
            active = running;
            if active.is_empty() {
                break;
            }
            // Workers observe cancellation through their own tokens.
            tokio::time::sleep(self.config.poll_interval).await;
        }

        let mut failed_workers = 0;
        for outcome in join_all(finished).await {
            match outcome {
                Ok((peer, Ok(blocks))) => info!(peer = %peer, blocks, "worker finished"),
                Ok((peer, Err(err))) => {
                    failed_workers += 1;
                    warn!(peer = %peer, kind = %err.kind(), %err, "worker failed");
                }
                Err(err) => {
                    failed_workers += 1;
                    warn!(%err, "worker task panicked");
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        let requested = self
            .requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .blocks;
        let blocks = self.results.block_count();
        if blocks < requested {
            return Err(SchedulerError::Incomplete {
                missing: requested - blocks,
                requested,
                failed_workers,
            });
        }

        Ok(DownloadSummary {
            blocks,
            workers,
            failed_workers,
        })
    }

    /// Rebuilds piece `index` from the collected blocks.
    pub fn assemble_piece(&self, index: u32) -> Result<Vec<u8>, SchedulerError> {
        let len = self
            .layout
            .piece_len(index)
            .ok_or(SchedulerError::PieceOutOfRange(index))?;

        let mut blocks = self.results.blocks_for(index);
        blocks.sort_by_key(|block| block.begin);

        let mut piece = vec![0u8; len as usize];
        let mut covered = 0usize;
        for block in &blocks {
            let begin = block.begin as usize;
            if begin > covered {
                break;
            }
            let end = begin + block.bytes.len();
            if end > piece.len() {
                return Err(SchedulerError::BlockOutOfRange {
                    index,
                    begin: block.begin,
                });
            }
            piece[begin..end].copy_from_slice(&block.bytes);
            covered = covered.max(end);
        }
        if covered < piece.len() {
            return Err(SchedulerError::MissingBlocks {
                index,
                offset: covered as u32,
            });
        }

        if self.config.verify_pieces {
            let digest: [u8; 20] = Sha1::digest(&piece).into();
            if digest != self.layout.piece_hashes[index as usize] {
                return Err(SchedulerError::HashMismatch { index });
            }
        }
        Ok(piece)
    }

    /// All pieces concatenated in index order.
    pub fn assemble_all(&self) -> Result<Vec<u8>, SchedulerError> {
        let mut content = Vec::new();
        for index in 0..self.layout.num_pieces() as u32 {
            content.extend_from_slice(&self.assemble_piece(index)?);
        }
        Ok(content)
    }

    fn spawn_worker(&self, mut connection: PeerConnection) -> WorkerHandle {
        let queue = self.queue.clone();
        let results = self.results.clone();
        tokio::spawn(async move {
            let peer = connection.addr();
            let outcome = connection
                .download(
                    || queue.pop(),
                    |block| {
                        results.insert(block);
                    },
                )
                .await;
            connection.shutdown().await;
            (peer, outcome)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockOptions, MockPeer, TEST_INFO_HASH};
    use rand::seq::SliceRandom;
    use std::time::Duration;

    fn hash(data: &[u8]) -> [u8; 20] {
        Sha1::digest(data).into()
    }

    fn layout_for(content: &[u8], piece_length: u32) -> PieceLayout {
        let hashes = content.chunks(piece_length as usize).map(hash).collect();
        PieceLayout::new(content.len() as u64, piece_length, hashes)
    }

    fn test_config() -> DownloadConfig {
        DownloadConfig {
            block_size: 16,
            read_timeout: Duration::from_secs(5),
            ..DownloadConfig::default()
        }
    }

    fn sample_content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_split_piece_of_500000_bytes() {
        let blocks = split_piece(0, 500000, 16384);
        assert_eq!(blocks.len(), 31);
        assert!(blocks[..30].iter().all(|b| b.length == 16384));
        assert_eq!(blocks[30].length, 15680);
        assert_eq!(blocks[30].begin, 30 * 16384);
    }

    #[test]
    fn test_split_exact_multiple() {
        let blocks = split_piece(2, 32768, 16384);
        assert_eq!(
            blocks,
            vec![
                PieceRequest::new(2, 0, 16384),
                PieceRequest::new(2, 16384, 16384)
            ]
        );
    }

    #[test]
    fn test_last_piece_length() {
        let layout = PieceLayout::new(92063, 32768, vec![[0; 20]; 3]);
        assert_eq!(layout.piece_len(0), Some(32768));
        assert_eq!(layout.piece_len(2), Some(92063 - 2 * 32768));
        assert_eq!(layout.piece_len(3), None);

        let even = PieceLayout::new(65536, 32768, vec![[0; 20]; 2]);
        assert_eq!(even.piece_len(1), Some(32768));
        assert_eq!(even.total_blocks(16384), 4);
    }

    #[test]
    fn test_request_piece_validates_and_dedups() {
        let content = sample_content(100);
        let scheduler = PieceScheduler::new(layout_for(&content, 64), test_config());
        assert!(matches!(
            scheduler.request_piece(5),
            Err(SchedulerError::PieceOutOfRange(5))
        ));
        scheduler.request_piece(1).unwrap();
        scheduler.request_piece(1).unwrap();
        // 36 bytes in 16-byte blocks
        assert_eq!(scheduler.queue.len(), 3);
        scheduler.request_all_pieces().unwrap();
        assert_eq!(scheduler.queue.len(), 7);
    }

    #[test]
    fn test_each_request_dispatched_exactly_once() {
        let queue = WorkQueue::bounded(1000);
        for i in 0..1000 {
            queue.push(PieceRequest::new(i / 10, (i % 10) * 16, 16)).unwrap();
        }
        let taken = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let mut mine = Vec::new();
                    while let Some(request) = queue.pop() {
                        mine.push(request);
                    }
                    taken.lock().unwrap().extend(mine);
                });
            }
        });

        let mut taken = taken.into_inner().unwrap();
        assert_eq!(taken.len(), 1000);
        taken.sort_by_key(|r| (r.piece_index, r.begin));
        taken.dedup();
        assert_eq!(taken.len(), 1000);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reassembly_ignores_arrival_order() {
        let content = sample_content(200);
        let scheduler = PieceScheduler::new(layout_for(&content, 200), test_config());

        let mut blocks: Vec<PieceBlockResponse> = split_piece(0, 200, 16)
            .into_iter()
            .map(|r| PieceBlockResponse {
                piece_index: 0,
                begin: r.begin,
                bytes: content[r.begin as usize..(r.begin + r.length) as usize].to_vec(),
            })
            .collect();
        blocks.shuffle(&mut rand::thread_rng());

        let store = scheduler.results();
        std::thread::scope(|scope| {
            for chunk in blocks.chunks(3) {
                scope.spawn(move || {
                    for block in chunk {
                        store.insert(block.clone());
                    }
                });
            }
        });

        assert_eq!(scheduler.assemble_piece(0).unwrap(), content);
    }

    #[test]
    fn test_duplicate_blocks_are_dropped() {
        let store = BlockStore::default();
        let block = PieceBlockResponse {
            piece_index: 0,
            begin: 0,
            bytes: vec![1, 2],
        };
        assert!(store.insert(block.clone()));
        assert!(!store.insert(block));
        assert_eq!(store.block_count(), 1);
    }

    #[test]
    fn test_missing_block_detected() {
        let content = sample_content(64);
        let scheduler = PieceScheduler::new(layout_for(&content, 64), test_config());
        for begin in [0u32, 32, 48] {
            scheduler.results().insert(PieceBlockResponse {
                piece_index: 0,
                begin,
                bytes: content[begin as usize..begin as usize + 16].to_vec(),
            });
        }
        assert!(matches!(
            scheduler.assemble_piece(0),
            Err(SchedulerError::MissingBlocks {
                index: 0,
                offset: 16
            })
        ));
    }

    #[test]
    fn test_hash_mismatch_detected() {
        let content = sample_content(32);
        let scheduler = PieceScheduler::new(layout_for(&content, 32), test_config());
        scheduler.results().insert(PieceBlockResponse {
            piece_index: 0,
            begin: 0,
            bytes: vec![0; 32],
        });
        assert!(matches!(
            scheduler.assemble_piece(0),
            Err(SchedulerError::HashMismatch { index: 0 })
        ));

        let unchecked = PieceScheduler::new(
            layout_for(&content, 32),
            DownloadConfig {
                verify_pieces: false,
                ..test_config()
            },
        );
        unchecked.results().insert(PieceBlockResponse {
            piece_index: 0,
            begin: 0,
            bytes: vec![0; 32],
        });
        assert_eq!(unchecked.assemble_piece(0).unwrap(), vec![0; 32]);
    }

    #[test]
    fn test_assemble_all_with_inconsistent_layout() {
        let layout = PieceLayout::new(1 << 62, 64, vec![[0; 20]]);
        let scheduler = PieceScheduler::new(layout, test_config());
        assert!(matches!(
            scheduler.assemble_all(),
            Err(SchedulerError::MissingBlocks {
                index: 0,
                offset: 0
            })
        ));
    }

    #[tokio::test]
    async fn test_download_no_connections() {
        let scheduler = PieceScheduler::new(layout_for(&sample_content(16), 16), test_config());
        assert!(matches!(
            scheduler.download(Vec::new()).await,
            Err(SchedulerError::NoConnections)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_download_across_peers() {
        let content = sample_content(300);
        let options = MockOptions {
            content: content.clone(),
            piece_length: 64,
            ..MockOptions::default()
        };
        let mocks = vec![
            MockPeer::spawn(options.clone()).await,
            MockPeer::spawn(options.clone()).await,
            MockPeer::spawn(options).await,
        ];
        let addrs: Vec<SocketAddr> = mocks.iter().map(MockPeer::addr).collect();

        let scheduler = PieceScheduler::new(layout_for(&content, 64), test_config());
        let connections = scheduler.connect_all(&addrs, TEST_INFO_HASH, [7; 20]).await;
        assert_eq!(connections.len(), 3);

        scheduler.request_all_pieces().unwrap();
        let summary = scheduler.download(connections).await.unwrap();
        assert_eq!(summary.blocks, 19);
        assert_eq!(summary.failed_workers, 0);
        assert!(mocks.iter().all(|mock| mock.max_outstanding() <= 5));

        assert_eq!(scheduler.assemble_all().unwrap(), content);
        assert_eq!(scheduler.assemble_piece(4).unwrap(), &content[256..]);
    }

    #[tokio::test]
    async fn test_connect_all_skips_bad_peers() {
        let good = MockPeer::spawn(MockOptions::default()).await;
        let bad = MockPeer::spawn(MockOptions {
            reply_info_hash: Some([0xEE; 20]),
            ..MockOptions::default()
        })
        .await;
        let scheduler = PieceScheduler::new(layout_for(&sample_content(16), 16), test_config());
        let connections = scheduler
            .connect_all(&[bad.addr(), good.addr()], TEST_INFO_HASH, [7; 20])
            .await;
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].addr(), good.addr());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_worker_leaves_download_incomplete() {
        let content = sample_content(256);
        let healthy = MockPeer::spawn(MockOptions {
            content: content.clone(),
            piece_length: 128,
            ..MockOptions::default()
        })
        .await;
        let flaky = MockPeer::spawn(MockOptions {
            content: content.clone(),
            piece_length: 128,
            close_after_blocks: Some(1),
            ..MockOptions::default()
        })
        .await;

        let scheduler = PieceScheduler::new(layout_for(&content, 128), test_config());
        let connections = scheduler
            .connect_all(&[flaky.addr(), healthy.addr()], TEST_INFO_HASH, [7; 20])
            .await;
        assert_eq!(connections.len(), 2);
        scheduler.request_all_pieces().unwrap();

        match scheduler.download(connections).await {
            Err(SchedulerError::Incomplete {
                missing,
                requested,
                failed_workers,
            }) => {
                assert_eq!(requested, 16);
                assert_eq!(failed_workers, 1);
                assert_eq!(flaky.served(), 1);
                assert!(missing >= 1);
                assert_eq!(scheduler.results().block_count(), requested - missing);
            }
            other => panic!("expected an incomplete download, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_cancels_workers() {
        // The mock has no content, so requests are never answered.
        let mock = MockPeer::spawn(MockOptions::default()).await;
        let config = DownloadConfig {
            read_timeout: Duration::from_secs(60),
            ..test_config()
        };
        let content = sample_content(64);
        let scheduler = Arc::new(PieceScheduler::new(layout_for(&content, 64), config));
        let connections = scheduler
            .connect_all(&[mock.addr()], TEST_INFO_HASH, [7; 20])
            .await;
        scheduler.request_all_pieces().unwrap();

        let stopper = scheduler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.shutdown();
        });
        assert!(matches!(
            scheduler.download(connections).await,
            Err(SchedulerError::Cancelled)
        ));
    }
}
