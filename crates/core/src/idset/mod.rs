#![forbid(unsafe_code)]

//! Compressed set of `u32` ids.
//!
//! The id space is cut into 65 536-bit blocks keyed by the upper half of the
//! id. A block is absent (empty), `Full`, an interval list or a dense bitmap,
//! and moves between those forms as its density changes, so memory follows
//! the shape of the data rather than the largest id. All set algebra is
//! block-local.
//!
//! The set does no locking of its own; owners serialize access.

mod block;
mod codec;

use block::{BLOCK_BITS, Block, SetOp, combine};
use std::collections::BTreeMap;
use std::fmt;

pub use codec::IdSetDecodeError;

#[derive(Clone, Default)]
pub struct IdSet {
    blocks: BTreeMap<u16, Block>,
}

fn split(id: u32) -> (u16, u16) {
    ((id >> 16) as u16, (id & 0xFFFF) as u16)
}

fn join(key: u16, bit: u16) -> u32 {
    (u32::from(key) << 16) | u32::from(bit)
}

impl IdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding every id in `lo..=hi`.
    pub fn from_range(lo: u32, hi: u32) -> Self {
        let mut set = Self::new();
        set.insert_range(lo, hi);
        set
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> u64 {
        self.blocks.values().map(|b| u64::from(b.len())).sum()
    }

    pub fn contains(&self, id: u32) -> bool {
        let (key, bit) = split(id);
        self.blocks.get(&key).is_some_and(|b| b.contains(bit))
    }

    /// Returns `true` when `id` was not already present.
    pub fn insert(&mut self, id: u32) -> bool {
        let (key, bit) = split(id);
        match self.blocks.get_mut(&key) {
            Some(block) => block.insert(bit),
            None => {
                self.blocks.insert(key, Block::single(bit));
                true
            }
        }
    }

    /// Returns `true` when `id` was present.
    pub fn remove(&mut self, id: u32) -> bool {
        let (key, bit) = split(id);
        let Some(block) = self.blocks.get_mut(&key) else {
            return false;
        };
        let removed = block.remove(bit);
        if block.is_empty() {
            self.blocks.remove(&key);
        }
        removed
    }

    pub fn insert_range(&mut self, lo: u32, hi: u32) {
        self.apply_range(lo, hi, SetOp::Union);
    }

    pub fn remove_range(&mut self, lo: u32, hi: u32) {
        self.apply_range(lo, hi, SetOp::Subtract);
    }

    fn apply_range(&mut self, lo: u32, hi: u32, op: SetOp) {
        if lo > hi {
            return;
        }
        let (lo_key, lo_bit) = split(lo);
        let (hi_key, hi_bit) = split(hi);
        for key in lo_key..=hi_key {
            let start = if key == lo_key { lo_bit } else { 0 };
            let end = if key == hi_key {
                hi_bit
            } else {
                (BLOCK_BITS - 1) as u16
            };
            let span = Block::interval(start, end);
            let next = match self.blocks.get(&key) {
                Some(existing) => combine(op, existing, &span),
                None if op == SetOp::Union => Some(span),
                None => None,
            };
            match next {
                Some(block) => {
                    self.blocks.insert(key, block);
                }
                None => {
                    self.blocks.remove(&key);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Number of members in `lo..=hi`.
    pub fn count_range(&self, lo: u32, hi: u32) -> u64 {
        if lo > hi {
            return 0;
        }
        let (lo_key, lo_bit) = split(lo);
        let (hi_key, hi_bit) = split(hi);
        self.blocks
            .range(lo_key..=hi_key)
            .map(|(key, block)| {
                let start = if *key == lo_key { lo_bit } else { 0 };
                let end = if *key == hi_key {
                    hi_bit
                } else {
                    (BLOCK_BITS - 1) as u16
                };
                u64::from(block.count_range(start, end))
            })
            .sum()
    }

    pub fn first(&self) -> Option<u32> {
        self.first_from(0)
    }

    /// Smallest member strictly greater than `prev`.
    pub fn next(&self, prev: u32) -> Option<u32> {
        prev.checked_add(1).and_then(|from| self.first_from(from))
    }

    /// Smallest member `>= from`.
    pub fn first_from(&self, from: u32) -> Option<u32> {
        let (from_key, from_bit) = split(from);
        self.blocks.range(from_key..).find_map(|(key, block)| {
            let start = if *key == from_key {
                u32::from(from_bit)
            } else {
                0
            };
            block.next_from(start).map(|bit| join(*key, bit))
        })
    }

    pub fn max(&self) -> Option<u32> {
        self.blocks
            .iter()
            .next_back()
            .and_then(|(key, block)| block.max().map(|bit| join(*key, bit)))
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            set: self,
            next: self.first(),
        }
    }

    pub fn union_with(&mut self, other: &IdSet) {
        for (key, theirs) in &other.blocks {
            let merged = match self.blocks.get(key) {
                Some(ours) => combine(SetOp::Union, ours, theirs),
                None => Some(theirs.clone()),
            };
            if let Some(block) = merged {
                self.blocks.insert(*key, block);
            }
        }
    }

    pub fn intersect_with(&mut self, other: &IdSet) {
        let keys: Vec<u16> = self.blocks.keys().copied().collect();
        for key in keys {
            let next = match (self.blocks.get(&key), other.blocks.get(&key)) {
                (Some(ours), Some(theirs)) => combine(SetOp::Intersect, ours, theirs),
                _ => None,
            };
            self.store(key, next);
        }
    }

    pub fn subtract(&mut self, other: &IdSet) {
        for (key, theirs) in &other.blocks {
            if let Some(ours) = self.blocks.get(key) {
                let next = combine(SetOp::Subtract, ours, theirs);
                self.store(*key, next);
            }
        }
    }

    pub fn xor_with(&mut self, other: &IdSet) {
        for (key, theirs) in &other.blocks {
            let next = match self.blocks.get(key) {
                Some(ours) => combine(SetOp::Xor, ours, theirs),
                None => Some(theirs.clone()),
            };
            self.store(*key, next);
        }
    }

    /// Complements the set over the whole `u32` space.
    pub fn invert(&mut self) {
        let mut blocks = BTreeMap::new();
        for key in 0..=u16::MAX {
            let next = match self.blocks.get(&key) {
                Some(block) => block::invert(block),
                None => Some(Block::Full),
            };
            if let Some(block) = next {
                blocks.insert(key, block);
            }
        }
        self.blocks = blocks;
    }

    /// Re-compacts every block into its cheapest form.
    pub fn optimize(&mut self) {
        let blocks = std::mem::take(&mut self.blocks);
        self.blocks = blocks
            .into_iter()
            .filter_map(|(key, block)| block.optimize().map(|b| (key, b)))
            .collect();
    }

    /// Approximate heap footprint of the block payloads.
    pub fn memory_bytes(&self) -> usize {
        self.blocks.values().map(Block::memory_bytes).sum::<usize>()
            + self.blocks.len() * (std::mem::size_of::<u16>() + std::mem::size_of::<Block>())
    }

    fn store(&mut self, key: u16, block: Option<Block>) {
        match block {
            Some(block) => {
                self.blocks.insert(key, block);
            }
            None => {
                self.blocks.remove(&key);
            }
        }
    }
}

impl PartialEq for IdSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl Eq for IdSet {}

impl fmt::Debug for IdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SHOWN: usize = 32;
        let len = self.len();
        let mut list = f.debug_list();
        list.entries(self.iter().take(SHOWN));
        if len > SHOWN as u64 {
            list.entry(&format_args!("... {} total", len));
        }
        list.finish()
    }
}

impl FromIterator<u32> for IdSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = IdSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<u32> for IdSet {
    fn extend<I: IntoIterator<Item = u32>>(&mut self, iter: I) {
        for id in iter {
            self.insert(id);
        }
    }
}

impl<'a> IntoIterator for &'a IdSet {
    type Item = u32;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Ascending iterator over an [`IdSet`].
pub struct Iter<'a> {
    set: &'a IdSet,
    next: Option<u32>,
}

impl Iterator for Iter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let current = self.next?;
        self.next = self.set.next(current);
        Some(current)
    }
}
