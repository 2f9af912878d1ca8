pub mod bencode;
pub mod config;
pub mod error;
pub mod extension;
pub mod magnet;
pub mod messages;
pub mod peer;
pub mod scheduler;
pub mod torrent;
pub mod tracker;

#[cfg(test)]
mod mock;
