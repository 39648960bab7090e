#![forbid(unsafe_code)]

//! Binary form of an [`IdSet`].
//!
//! Layout (little endian): magic `NSIS`, version byte, block count `u32`,
//! then per block the key `u16`, a tag byte and the payload. Full blocks
//! carry no payload, interval blocks a `u32` count and `(start, end)` pairs,
//! dense blocks the raw 1 024 words.

use super::IdSet;
use super::block::{Bitmap, Block, Run, WORDS};
use std::collections::BTreeMap;
use std::fmt;

const MAGIC: &[u8; 4] = b"NSIS";
const VERSION: u8 = 1;

const TAG_FULL: u8 = 0;
const TAG_RUNS: u8 = 1;
const TAG_DENSE: u8 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdSetDecodeError {
    Truncated,
    BadMagic,
    UnsupportedVersion(u8),
    BadBlockTag { key: u16, tag: u8 },
    UnorderedBlocks { key: u16 },
    MalformedBlock { key: u16 },
    TrailingBytes(usize),
}

impl fmt::Display for IdSetDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "id set payload is truncated"),
            Self::BadMagic => write!(f, "id set payload has a bad magic"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported id set version {v}"),
            Self::BadBlockTag { key, tag } => write!(f, "block {key}: unknown tag {tag}"),
            Self::UnorderedBlocks { key } => write!(f, "block {key} is out of order"),
            Self::MalformedBlock { key } => write!(f, "block {key} is malformed"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after id set"),
        }
    }
}

impl std::error::Error for IdSetDecodeError {}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], IdSetDecodeError> {
        if self.buf.len() < n {
            return Err(IdSetDecodeError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, IdSetDecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, IdSetDecodeError> {
        let raw = self.take(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32, IdSetDecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> Result<u64, IdSetDecodeError> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_le_bytes(bytes))
    }
}

impl IdSet {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.blocks.len() * 16);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        for (key, block) in &self.blocks {
            out.extend_from_slice(&key.to_le_bytes());
            match block {
                Block::Full => out.push(TAG_FULL),
                Block::Runs(runs) => {
                    out.push(TAG_RUNS);
                    out.extend_from_slice(&(runs.len() as u32).to_le_bytes());
                    for run in runs {
                        out.extend_from_slice(&run.start.to_le_bytes());
                        out.extend_from_slice(&run.end.to_le_bytes());
                    }
                }
                Block::Dense(bitmap) => {
                    out.push(TAG_DENSE);
                    for word in bitmap.words.iter() {
                        out.extend_from_slice(&word.to_le_bytes());
                    }
                }
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdSetDecodeError> {
        let mut reader = Reader { buf: bytes };
        if reader.take(MAGIC.len())? != MAGIC {
            return Err(IdSetDecodeError::BadMagic);
        }
        let version = reader.u8()?;
        if version != VERSION {
            return Err(IdSetDecodeError::UnsupportedVersion(version));
        }
        let count = reader.u32()?;
        let mut blocks = BTreeMap::new();
        let mut prev_key: Option<u16> = None;
        for _ in 0..count {
            let key = reader.u16()?;
            if prev_key.is_some_and(|prev| prev >= key) {
                return Err(IdSetDecodeError::UnorderedBlocks { key });
            }
            prev_key = Some(key);
            let block = match reader.u8()? {
                TAG_FULL => Block::Full,
                TAG_RUNS => Block::Runs(read_runs(&mut reader, key)?),
                TAG_DENSE => {
                    let mut words = [0u64; WORDS];
                    for word in words.iter_mut() {
                        *word = reader.u64()?;
                    }
                    let mut bitmap = Box::new(Bitmap { words, count: 0 });
                    bitmap.recount();
                    if bitmap.count == 0 {
                        return Err(IdSetDecodeError::MalformedBlock { key });
                    }
                    Block::Dense(bitmap)
                }
                tag => return Err(IdSetDecodeError::BadBlockTag { key, tag }),
            };
            let block = block
                .optimize()
                .ok_or(IdSetDecodeError::MalformedBlock { key })?;
            blocks.insert(key, block);
        }
        if !reader.buf.is_empty() {
            return Err(IdSetDecodeError::TrailingBytes(reader.buf.len()));
        }
        Ok(IdSet { blocks })
    }
}

fn read_runs(reader: &mut Reader<'_>, key: u16) -> Result<Vec<Run>, IdSetDecodeError> {
    let count = reader.u32()? as usize;
    if count == 0 || count > WORDS * 32 {
        return Err(IdSetDecodeError::MalformedBlock { key });
    }
    let mut runs = Vec::with_capacity(count);
    for _ in 0..count {
        let start = reader.u16()?;
        let end = reader.u16()?;
        let ordered = runs
            .last()
            .is_none_or(|prev: &Run| u32::from(prev.end) + 1 < u32::from(start));
        if start > end || !ordered {
            return Err(IdSetDecodeError::MalformedBlock { key });
        }
        runs.push(Run { start, end });
    }
    Ok(runs)
}
