//! Tunables shared by the peer connections and the scheduler.

use std::time::Duration;

use rand::RngCore;

use crate::messages::MAX_BLOCK_LENGTH;

/// Azureus-style client prefix for generated peer ids.
pub const CLIENT_PREFIX: &[u8; 8] = b"-RS0001-";

/// Port reported to trackers. We never accept connections on it.
pub const DEFAULT_PORT: u16 = 6881;

pub const DEFAULT_PIPELINE_DEPTH: usize = 5;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_DISCARDED_MESSAGES: usize = 100;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Upper bound on a single block request.
    pub block_size: u32,
    /// Requests allowed in flight per connection.
    pub pipeline_depth: usize,
    pub connect_timeout: Duration,
    /// Deadline for each socket read; a silent peer fails after this long.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// How many off-topic messages a wait may skip before giving up.
    pub max_discarded_messages: usize,
    /// How often the scheduler checks whether its workers are still alive.
    pub poll_interval: Duration,
    /// Check each assembled piece against its SHA-1 from the metainfo.
    pub verify_pieces: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            block_size: MAX_BLOCK_LENGTH,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_discarded_messages: DEFAULT_MAX_DISCARDED_MESSAGES,
            poll_interval: DEFAULT_POLL_INTERVAL,
            verify_pieces: true,
        }
    }
}

impl DownloadConfig {
    /// Clamps values that would break the protocol or stall the pipeline.
    pub fn normalized(mut self) -> Self {
        self.block_size = self.block_size.clamp(1, MAX_BLOCK_LENGTH);
        self.pipeline_depth = self.pipeline_depth.max(1);
        self
    }
}

/// `-RS0001-` followed by 12 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[0..8].copy_from_slice(CLIENT_PREFIX);
    rand::thread_rng().fill_bytes(&mut id[8..]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DownloadConfig::default();
        assert_eq!(config.block_size, 16384);
        assert_eq!(config.pipeline_depth, 5);
        assert!(config.verify_pieces);
    }

    #[test]
    fn test_normalized_clamps() {
        let config = DownloadConfig {
            block_size: 1 << 20,
            pipeline_depth: 0,
            ..DownloadConfig::default()
        }
        .normalized();
        assert_eq!(config.block_size, MAX_BLOCK_LENGTH);
        assert_eq!(config.pipeline_depth, 1);
    }

    #[test]
    fn test_peer_id_prefix() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        assert_eq!(&a[0..8], CLIENT_PREFIX);
        assert_ne!(a, b);
    }
}
