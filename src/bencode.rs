use std::collections::HashSet;
use std::fmt;

use thiserror::Error;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Bytes(Vec<u8>),
    Integer(BencodeInt),
    List(Vec<BencodeValue>),
    Dictionary(Dictionary),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input at byte {position}")]
    UnexpectedEof { position: usize },
    #[error("malformed length prefix at byte {position}")]
    InvalidStringLength { position: usize },
    #[error("invalid integer at byte {position}")]
    InvalidInteger { position: usize },
    #[error("dictionary key at byte {position} is not a byte string")]
    NonStringKey { position: usize },
    #[error("duplicate dictionary key at byte {position}")]
    DuplicateKey { position: usize },
    #[error("unknown value tag {tag:?} at byte {position}")]
    UnexpectedToken { tag: char, position: usize },
    #[error("trailing data after value at byte {position}")]
    TrailingData { position: usize },
    #[error("nesting deeper than {MAX_DEPTH} levels at byte {position}")]
    NestingTooDeep { position: usize },
}

impl BencodeError {
    /// Byte offset into the decoded input where the problem was found.
    pub fn position(&self) -> usize {
        match self {
            BencodeError::UnexpectedEof { position }
            | BencodeError::InvalidStringLength { position }
            | BencodeError::InvalidInteger { position }
            | BencodeError::NonStringKey { position }
            | BencodeError::DuplicateKey { position }
            | BencodeError::UnexpectedToken { position, .. }
            | BencodeError::TrailingData { position }
            | BencodeError::NestingTooDeep { position } => *position,
        }
    }
}

/// A bencoded integer of any magnitude.
///
/// The value is held in its canonical decimal form (no leading zeros, no
/// negative zero), so equality of the text is equality of the number and
/// re-encoding reproduces the original bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BencodeInt(String);

impl BencodeInt {
    fn parse(digits: &[u8]) -> Option<Self> {
        let (negative, magnitude) = match digits.split_first() {
            Some((b'-', rest)) => (true, rest),
            _ => (false, digits),
        };
        if magnitude.is_empty() || !magnitude.iter().all(u8::is_ascii_digit) {
            return None;
        }
        if magnitude.len() > 1 && magnitude[0] == b'0' {
            return None;
        }
        if negative && magnitude == b"0" {
            return None;
        }
        // Only ASCII digits and '-' got this far.
        std::str::from_utf8(digits)
            .ok()
            .map(|s| BencodeInt(s.to_string()))
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<i64> for BencodeInt {
    fn from(value: i64) -> Self {
        BencodeInt(value.to_string())
    }
}

impl From<u64> for BencodeInt {
    fn from(value: u64) -> Self {
        BencodeInt(value.to_string())
    }
}

impl fmt::Display for BencodeInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dictionary entries in the order they were decoded or inserted.
///
/// Order is significant: the info hash is computed over the original bytes,
/// so re-encoding must not reorder keys the remote side chose.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary {
    entries: Vec<(Vec<u8>, BencodeValue)>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v)
    }

    /// Inserts or replaces a value. A replaced entry keeps its position.
    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: BencodeValue) -> Option<BencodeValue> {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &BencodeValue)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }
}

impl FromIterator<(Vec<u8>, BencodeValue)> for Dictionary {
    fn from_iter<I: IntoIterator<Item = (Vec<u8>, BencodeValue)>>(iter: I) -> Self {
        let mut dict = Dictionary::new();
        for (key, value) in iter {
            dict.insert(key, value);
        }
        dict
    }
}

impl BencodeValue {
    pub fn string(s: &str) -> Self {
        BencodeValue::Bytes(s.as_bytes().to_vec())
    }

    pub fn integer(value: i64) -> Self {
        BencodeValue::Integer(value.into())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<&BencodeInt> {
        match self {
            BencodeValue::Integer(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_integer().and_then(BencodeInt::as_i64)
    }

    pub fn as_dict(&self) -> Option<&Dictionary> {
        match self {
            BencodeValue::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up `key` if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// Reorders every dictionary in the tree by raw key bytes, the order most
    /// trackers and peers expect from values we build ourselves.
    pub fn sort_keys(&mut self) {
        match self {
            BencodeValue::List(items) => items.iter_mut().for_each(BencodeValue::sort_keys),
            BencodeValue::Dictionary(dict) => {
                dict.entries.sort_by(|(a, _), (b, _)| a.cmp(b));
                dict.entries.iter_mut().for_each(|(_, v)| v.sort_keys());
            }
            BencodeValue::Bytes(_) | BencodeValue::Integer(_) => {}
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_into(self, &mut buf);
        buf
    }

    /// JSON rendering used by the `decode` command. Byte strings become
    /// (lossy) UTF-8 strings; integers too large for `i64` stay textual.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            BencodeValue::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
            BencodeValue::Integer(i) => match i.as_i64() {
                Some(n) => serde_json::Value::from(n),
                None => serde_json::Value::String(i.to_string()),
            },
            BencodeValue::List(items) => {
                serde_json::Value::Array(items.iter().map(BencodeValue::to_json).collect())
            }
            BencodeValue::Dictionary(dict) => serde_json::Value::Object(
                dict.iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<i64> for BencodeValue {
    fn from(value: i64) -> Self {
        BencodeValue::integer(value)
    }
}

impl From<Dictionary> for BencodeValue {
    fn from(dict: Dictionary) -> Self {
        BencodeValue::Dictionary(dict)
    }
}

/// Decodes one value from the front of `encoded_value` and returns it with
/// the bytes that follow it.
pub fn decode(encoded_value: &[u8]) -> Result<(BencodeValue, &[u8]), BencodeError> {
    let mut decoder = Decoder::new(encoded_value);
    let value = decoder.value(0)?;
    Ok((value, &encoded_value[decoder.pos..]))
}

/// Like [`decode`], but the input must hold exactly one value.
pub fn decode_exact(encoded_value: &[u8]) -> Result<BencodeValue, BencodeError> {
    let (value, remaining) = decode(encoded_value)?;
    if !remaining.is_empty() {
        return Err(BencodeError::TrailingData {
            position: encoded_value.len() - remaining.len(),
        });
    }
    Ok(value)
}

pub fn encode(value: &BencodeValue) -> Vec<u8> {
    value.encode()
}

/// Returns the exact encoded bytes of `key`'s value in the top-level
/// dictionary `encoded_value`, or `None` if the key is absent.
pub fn find_dict_value_raw<'a>(
    encoded_value: &'a [u8],
    key: &[u8],
) -> Result<Option<&'a [u8]>, BencodeError> {
    let mut decoder = Decoder::new(encoded_value);
    match decoder.peek()? {
        b'd' => decoder.pos += 1,
        tag => {
            return Err(BencodeError::UnexpectedToken {
                tag: tag as char,
                position: 0,
            });
        }
    }
    loop {
        if decoder.peek()? == b'e' {
            return Ok(None);
        }
        let key_pos = decoder.pos;
        let entry_key = match decoder.value(1)? {
            BencodeValue::Bytes(b) => b,
            _ => return Err(BencodeError::NonStringKey { position: key_pos }),
        };
        let value_start = decoder.pos;
        decoder.value(1)?;
        if entry_key == key {
            return Ok(Some(&encoded_value[value_start..decoder.pos]));
        }
    }
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof { position: self.pos })
    }

    fn value(&mut self, depth: usize) -> Result<BencodeValue, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep { position: self.pos });
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dictionary(depth),
            b'0'..=b'9' => self.byte_string().map(BencodeValue::Bytes),
            tag => Err(BencodeError::UnexpectedToken {
                tag: tag as char,
                position: self.pos,
            }),
        }
    }

    fn byte_string(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        let digits = self.input[start..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        let colon = start + digits;
        match self.input.get(colon) {
            None => return Err(BencodeError::UnexpectedEof { position: colon }),
            Some(b':') => {}
            Some(_) => return Err(BencodeError::InvalidStringLength { position: start }),
        }
        let len_slice = &self.input[start..colon];
        // "03:abc" would not re-encode to the same bytes.
        if len_slice.len() > 1 && len_slice[0] == b'0' {
            return Err(BencodeError::InvalidStringLength { position: start });
        }
        let len = std::str::from_utf8(len_slice)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(BencodeError::InvalidStringLength { position: start })?;

        let body = colon + 1;
        let end = body
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or(BencodeError::UnexpectedEof {
                position: self.input.len(),
            })?;
        self.pos = end;
        Ok(self.input[body..end].to_vec())
    }

    fn integer(&mut self) -> Result<BencodeValue, BencodeError> {
        // Skip 'i'
        let start = self.pos + 1;
        let end = self.input[start..]
            .iter()
            .position(|&b| b == b'e')
            .map(|offset| start + offset)
            .ok_or(BencodeError::UnexpectedEof {
                position: self.input.len(),
            })?;
        let number = BencodeInt::parse(&self.input[start..end])
            .ok_or(BencodeError::InvalidInteger { position: start })?;
        self.pos = end + 1;
        Ok(BencodeValue::Integer(number))
    }

    fn list(&mut self, depth: usize) -> Result<BencodeValue, BencodeError> {
        self.pos += 1;
        let mut values = Vec::new();
        while self.peek()? != b'e' {
            values.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(BencodeValue::List(values))
    }

    fn dictionary(&mut self, depth: usize) -> Result<BencodeValue, BencodeError> {
        self.pos += 1;
        let mut dict = Dictionary::new();
        let mut seen: HashSet<&'a [u8]> = HashSet::new();
        while self.peek()? != b'e' {
            let key_pos = self.pos;
            let key = match self.value(depth + 1)? {
                BencodeValue::Bytes(b) => b,
                _ => return Err(BencodeError::NonStringKey { position: key_pos }),
            };
            // A byte string ends where the decoder now stands.
            let input = self.input;
            if !seen.insert(&input[self.pos - key.len()..self.pos]) {
                return Err(BencodeError::DuplicateKey { position: key_pos });
            }
            let value = self.value(depth + 1)?;
            dict.entries.push((key, value));
        }
        self.pos += 1;
        Ok(BencodeValue::Dictionary(dict))
    }
}

fn encode_into(value: &BencodeValue, buf: &mut Vec<u8>) {
    match value {
        BencodeValue::Bytes(bytes) => encode_bytes(bytes, buf),
        BencodeValue::Integer(number) => {
            buf.push(b'i');
            buf.extend_from_slice(number.as_str().as_bytes());
            buf.push(b'e');
        }
        BencodeValue::List(items) => {
            buf.push(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
        BencodeValue::Dictionary(dict) => {
            buf.push(b'd');
            for (key, item) in dict.iter() {
                encode_bytes(key, buf);
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
    }
}

fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(bytes);
}
