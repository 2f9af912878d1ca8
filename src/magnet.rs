use std::fmt;

use thiserror::Error;

const SCHEME: &str = "magnet:?";
const BTIH_PREFIX: &str = "urn:btih:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MagnetError {
    #[error("magnet URI must start with {SCHEME:?}")]
    InvalidScheme,
    #[error("magnet URI has no xt parameter")]
    MissingInfoHash,
    #[error("xt parameter must start with {BTIH_PREFIX:?}")]
    UnsupportedTopic,
    #[error("info hash is not valid hex")]
    InvalidHex,
    #[error("info hash is {0} bytes, expected 20")]
    InvalidLength(usize),
}

/// The fields of a `magnet:` link we use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Magnet {
    pub info_hash: [u8; 20],
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl Magnet {
    pub fn parse(uri: &str) -> Result<Self, MagnetError> {
        let query = uri
            .strip_prefix(SCHEME)
            .ok_or(MagnetError::InvalidScheme)?;

        let mut topic = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        for (key, value) in query.split('&').filter_map(|pair| pair.split_once('=')) {
            match key {
                "xt" if topic.is_none() => topic = Some(value),
                "dn" if display_name.is_none() => display_name = decode_component(value),
                "tr" => trackers.extend(decode_component(value)),
                _ => {}
            }
        }

        let info_hash = parse_info_hash(topic.ok_or(MagnetError::MissingInfoHash)?)?;
        Ok(Self {
            info_hash,
            display_name,
            trackers,
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

impl fmt::Display for Magnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}xt={BTIH_PREFIX}{}", self.info_hash_hex())?;
        if let Some(name) = &self.display_name {
            write!(f, "&dn={}", urlencoding::encode(name))?;
        }
        for tracker in &self.trackers {
            write!(f, "&tr={}", urlencoding::encode(tracker))?;
        }
        Ok(())
    }
}

fn parse_info_hash(topic: &str) -> Result<[u8; 20], MagnetError> {
    let hex_hash = topic
        .strip_prefix(BTIH_PREFIX)
        .ok_or(MagnetError::UnsupportedTopic)?;
    let bytes = hex::decode(hex_hash).map_err(|_| MagnetError::InvalidHex)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| MagnetError::InvalidLength(bytes.len()))
}

/// Percent-decodes a query value, treating `+` as a space.
fn decode_component(value: &str) -> Option<String> {
    urlencoding::decode(&value.replace('+', " "))
        .ok()
        .map(|decoded| decoded.into_owned())
}
