use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail, ensure};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bitswarm::bencode;
use bitswarm::config::{self, DownloadConfig};
use bitswarm::magnet::Magnet;
use bitswarm::peer::{self, PeerConnection, PeerError};
use bitswarm::scheduler::PieceScheduler;
use bitswarm::torrent::Torrent;
use bitswarm::tracker::{self, Peer};

/// `left` reported for a magnet link, whose length is not known yet.
const MAGNET_LEFT: u64 = 1024;

#[derive(Debug, Parser)]
#[command(version, about = "A small BitTorrent client", long_about = None)]
struct Cli {
    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct Tuning {
    /// Block requests kept in flight per peer
    #[arg(long, global = true, default_value_t = config::DEFAULT_PIPELINE_DEPTH)]
    pipeline_depth: usize,

    /// Seconds to wait on a silent peer before dropping it
    #[arg(long, global = true, default_value_t = config::DEFAULT_READ_TIMEOUT.as_secs())]
    read_timeout: u64,

    /// Seconds allowed for the TCP connect
    #[arg(long, global = true, default_value_t = config::DEFAULT_CONNECT_TIMEOUT.as_secs())]
    connect_timeout: u64,

    /// Messages a peer may send while we wait for something else
    #[arg(long, global = true, default_value_t = config::DEFAULT_MAX_DISCARDED_MESSAGES)]
    max_discarded: usize,

    /// Skip SHA-1 verification of downloaded pieces
    #[arg(long, global = true)]
    no_verify: bool,
}

impl Tuning {
    fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            pipeline_depth: self.pipeline_depth,
            read_timeout: Duration::from_secs(self.read_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            max_discarded_messages: self.max_discarded,
            verify_pieces: !self.no_verify,
            ..DownloadConfig::default()
        }
        .normalized()
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode a bencoded value and print it as JSON
    Decode { value: String },
    /// Print the metainfo of a torrent file
    Info { torrent: PathBuf },
    /// Ask the tracker for peers
    Peers { torrent: PathBuf },
    /// Handshake with one peer and print its id
    Handshake { torrent: PathBuf, peer: SocketAddr },
    #[command(name = "download_piece")]
    /// Download a single piece
    DownloadPiece {
        #[arg(short, long)]
        output: PathBuf,
        torrent: PathBuf,
        index: u32,
    },
    /// Download the whole file
    Download {
        #[arg(short, long)]
        output: PathBuf,
        torrent: PathBuf,
    },
    #[command(name = "magnet_parse")]
    /// Print the tracker and info hash of a magnet link
    MagnetParse { uri: String },
    #[command(name = "magnet_handshake")]
    /// Handshake with a peer from a magnet link and negotiate extensions
    MagnetHandshake { uri: String },
    #[command(name = "magnet_info")]
    /// Fetch the metainfo of a magnet link from its peers and print it
    MagnetInfo { uri: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.tuning.download_config();

    match cli.command {
        Commands::Decode { value } => {
            let (decoded, _) =
                bencode::decode(value.as_bytes()).context("decoding bencoded value")?;
            println!("{}", decoded.to_json());
        }
        Commands::Info { torrent } => {
            let torrent = load_torrent(&torrent).await?;
            println!("{}", torrent.summary());
        }
        Commands::Peers { torrent } => {
            let torrent = load_torrent(&torrent).await?;
            for peer in discover_peers(&torrent, &config::generate_peer_id()).await? {
                println!("{peer}");
            }
        }
        Commands::Handshake { torrent, peer } => {
            let torrent = load_torrent(&torrent).await?;
            let mut connection = PeerConnection::connect(peer, config, CancellationToken::new())
                .await
                .with_context(|| format!("connecting to {peer}"))?;
            let peer_id = connection
                .handshake(torrent.info_hash, config::generate_peer_id())
                .await
                .context("handshaking with peer")?;
            println!("Peer ID: {}", hex::encode(peer_id));
            connection.shutdown().await;
        }
        Commands::DownloadPiece {
            output,
            torrent,
            index,
        } => {
            let torrent = load_torrent(&torrent).await?;
            let scheduler = Arc::new(PieceScheduler::new(torrent.layout(), config));
            scheduler
                .request_piece(index)
                .with_context(|| format!("queuing piece {index}"))?;
            run_download(&torrent, &scheduler).await?;
            let piece = scheduler
                .assemble_piece(index)
                .with_context(|| format!("assembling piece {index}"))?;
            write_output(&output, &piece).await?;
            println!("Piece {index} downloaded to {}.", output.display());
        }
        Commands::Download { output, torrent } => {
            let torrent = load_torrent(&torrent).await?;
            let scheduler = Arc::new(PieceScheduler::new(torrent.layout(), config));
            scheduler.request_all_pieces().context("queuing pieces")?;
            run_download(&torrent, &scheduler).await?;
            let content = scheduler.assemble_all().context("assembling file")?;
            write_output(&output, &content).await?;
            println!("Downloaded {} to {}.", torrent.info.name, output.display());
        }
        Commands::MagnetParse { uri } => {
            let magnet = Magnet::parse(&uri).context("parsing magnet link")?;
            if let Some(tracker) = magnet.trackers.first() {
                println!("Tracker URL: {tracker}");
            }
            println!("Info Hash: {}", magnet.info_hash_hex());
        }
        Commands::MagnetHandshake { uri } => {
            let magnet = Magnet::parse(&uri).context("parsing magnet link")?;
            magnet_handshake(&magnet, config).await?;
        }
        Commands::MagnetInfo { uri } => {
            let magnet = Magnet::parse(&uri).context("parsing magnet link")?;
            let torrent = magnet_torrent(&magnet, config).await?;
            println!("{}", torrent.summary());
        }
    }

    Ok(())
}

async fn load_torrent(path: &Path) -> Result<Torrent> {
    Torrent::from_file(path)
        .await
        .with_context(|| format!("reading torrent {}", path.display()))
}

async fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

async fn discover_peers(torrent: &Torrent, peer_id: &[u8; 20]) -> Result<Vec<Peer>> {
    let response = tracker::announce(
        &torrent.announce,
        &torrent.info_hash,
        peer_id,
        torrent.info.length,
    )
    .await
    .context("announcing to tracker")?;
    info!(peers = response.peers.len(), interval = response.interval, "tracker responded");
    Ok(response.peers)
}

/// Connects to every peer the tracker knows and runs the queued work.
/// Ctrl-C cancels all workers.
async fn run_download(torrent: &Torrent, scheduler: &Arc<PieceScheduler>) -> Result<()> {
    let started = Instant::now();
    let peer_id = config::generate_peer_id();
    let peers: Vec<SocketAddr> = discover_peers(torrent, &peer_id)
        .await?
        .iter()
        .map(Peer::socket_addr)
        .collect();

    let connections = scheduler
        .connect_all(&peers, torrent.info_hash, peer_id)
        .await;
    ensure!(
        !connections.is_empty(),
        "none of the {} peers completed the handshake",
        peers.len()
    );

    let interrupt = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping workers");
                scheduler.shutdown();
            }
        })
    };
    let outcome = scheduler.download(connections).await;
    interrupt.abort();

    let summary = outcome.context("downloading")?;
    info!(
        blocks = summary.blocks,
        workers = summary.workers,
        failed = summary.failed_workers,
        elapsed = ?started.elapsed(),
        "download finished"
    );
    Ok(())
}

async fn magnet_handshake(magnet: &Magnet, config: DownloadConfig) -> Result<()> {
    let peer_id = config::generate_peer_id();
    let response = tracker::find_peers(&magnet.trackers, &magnet.info_hash, &peer_id, MAGNET_LEFT)
        .await
        .context("finding peers for magnet link")?;

    for peer in &response.peers {
        match extension_session(peer.socket_addr(), magnet.info_hash, peer_id, &config).await {
            Ok((remote_id, metadata_id)) => {
                println!("Peer ID: {}", hex::encode(remote_id));
                match metadata_id {
                    Some(id) => println!("Peer Metadata Extension ID: {id}"),
                    None => println!("Peer does not support ut_metadata"),
                }
                return Ok(());
            }
            Err(err) => warn!(peer = %peer, kind = %err.kind(), %err, "extension handshake failed"),
        }
    }
    bail!("no peer completed the extension handshake")
}

async fn extension_session(
    addr: SocketAddr,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    config: &DownloadConfig,
) -> Result<([u8; 20], Option<u8>), PeerError> {
    let mut connection = PeerConnection::connect(addr, config.clone(), CancellationToken::new()).await?;
    let remote_id = connection.handshake(info_hash, peer_id).await?;
    if !connection.supports_extensions() {
        connection.shutdown().await;
        return Err(PeerError::Extension(
            "peer did not advertise the extension protocol".into(),
        ));
    }
    connection.init().await?;
    let metadata_id = connection.metadata_extension_id();
    connection.shutdown().await;
    Ok((remote_id, metadata_id))
}

/// Fetches the info dictionary from the first peer that serves it.
async fn magnet_torrent(magnet: &Magnet, config: DownloadConfig) -> Result<Torrent> {
    let peer_id = config::generate_peer_id();
    let response = tracker::find_peers(&magnet.trackers, &magnet.info_hash, &peer_id, MAGNET_LEFT)
        .await
        .context("finding peers for magnet link")?;
    let announce = magnet.trackers.first().cloned().unwrap_or_default();

    for peer in &response.peers {
        match peer::fetch_metadata(peer.socket_addr(), magnet.info_hash, peer_id, config.clone()).await {
            Ok(metadata) => {
                return Torrent::from_info_bytes(announce, &metadata)
                    .context("parsing metadata from peer");
            }
            Err(err) => warn!(peer = %peer, kind = %err.kind(), %err, "metadata fetch failed"),
        }
    }
    bail!("no peer served the metadata")
}
