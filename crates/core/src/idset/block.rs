#![forbid(unsafe_code)]

//! One 65 536-bit slice of an [`IdSet`](super::IdSet).
//!
//! A block is never empty: an all-zero block is represented by its absence
//! from the owning map, so every function that can empty a block returns
//! `Option<Block>`.

pub(super) const BLOCK_BITS: u32 = 1 << 16;
pub(super) const WORDS: usize = (BLOCK_BITS / 64) as usize;
const LAST: u32 = BLOCK_BITS - 1;

/// Above this many intervals a `Runs` block costs more than a bitmap.
pub(super) const MAX_RUNS: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Run {
    pub start: u16,
    pub end: u16,
}

impl Run {
    fn len(self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }
}

#[derive(Clone, Debug)]
pub(super) struct Bitmap {
    pub words: [u64; WORDS],
    pub count: u32,
}

impl Bitmap {
    fn zeroed() -> Box<Self> {
        Box::new(Self {
            words: [0; WORDS],
            count: 0,
        })
    }

    fn test(&self, bit: u32) -> bool {
        self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
    }

    fn set(&mut self, bit: u32) -> bool {
        let word = &mut self.words[(bit / 64) as usize];
        let mask = 1u64 << (bit % 64);
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        self.count += 1;
        true
    }

    fn clear(&mut self, bit: u32) -> bool {
        let word = &mut self.words[(bit / 64) as usize];
        let mask = 1u64 << (bit % 64);
        if *word & mask == 0 {
            return false;
        }
        *word &= !mask;
        self.count -= 1;
        true
    }

    fn set_range(&mut self, lo: u32, hi: u32) {
        for bit in lo..=hi {
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.recount();
    }

    pub fn recount(&mut self) {
        self.count = self.words.iter().map(|w| w.count_ones()).sum();
    }

    fn next_set(&self, from: u32) -> Option<u32> {
        if from > LAST {
            return None;
        }
        let mut index = (from / 64) as usize;
        let mut word = self.words[index] & (u64::MAX << (from % 64));
        loop {
            if word != 0 {
                return Some(index as u32 * 64 + word.trailing_zeros());
            }
            index += 1;
            if index == WORDS {
                return None;
            }
            word = self.words[index];
        }
    }

    fn next_clear(&self, from: u32) -> Option<u32> {
        if from > LAST {
            return None;
        }
        let mut index = (from / 64) as usize;
        let mut word = !self.words[index] & (u64::MAX << (from % 64));
        loop {
            if word != 0 {
                return Some(index as u32 * 64 + word.trailing_zeros());
            }
            index += 1;
            if index == WORDS {
                return None;
            }
            word = !self.words[index];
        }
    }

    fn to_runs(&self) -> Vec<Run> {
        let mut runs = Vec::new();
        let mut pos = 0;
        while let Some(start) = self.next_set(pos) {
            let end = self.next_clear(start).map_or(LAST, |clear| clear - 1);
            runs.push(Run {
                start: start as u16,
                end: end as u16,
            });
            if end == LAST {
                break;
            }
            pos = end + 1;
        }
        runs
    }

    fn run_count(&self) -> usize {
        // A run starts wherever a set bit follows a clear one.
        let mut carry = 0u64;
        let mut runs = 0usize;
        for &word in &self.words {
            let starts = word & !((word << 1) | carry);
            runs += starts.count_ones() as usize;
            carry = word >> 63;
        }
        runs
    }
}

#[derive(Clone, Debug)]
pub(super) enum Block {
    Full,
    Runs(Vec<Run>),
    Dense(Box<Bitmap>),
}

impl Block {
    pub fn single(bit: u16) -> Self {
        Block::Runs(vec![Run {
            start: bit,
            end: bit,
        }])
    }

    pub fn interval(lo: u16, hi: u16) -> Self {
        if lo == 0 && u32::from(hi) == LAST {
            Block::Full
        } else {
            Block::Runs(vec![Run { start: lo, end: hi }])
        }
    }

    pub fn len(&self) -> u32 {
        match self {
            Block::Full => BLOCK_BITS,
            Block::Runs(runs) => runs.iter().map(|r| r.len()).sum(),
            Block::Dense(bitmap) => bitmap.count,
        }
    }

    pub fn contains(&self, bit: u16) -> bool {
        match self {
            Block::Full => true,
            Block::Runs(runs) => {
                let idx = runs.partition_point(|r| r.end < bit);
                idx < runs.len() && runs[idx].start <= bit
            }
            Block::Dense(bitmap) => bitmap.test(u32::from(bit)),
        }
    }

    /// Returns `true` when `bit` was newly added.
    pub fn insert(&mut self, bit: u16) -> bool {
        let added = match self {
            Block::Full => false,
            Block::Runs(runs) => runs_insert(runs, bit),
            Block::Dense(bitmap) => bitmap.set(u32::from(bit)),
        };
        if added {
            self.rebalance();
        }
        added
    }

    /// Returns `true` when `bit` was present. The caller drops the block
    /// when it reports empty afterwards.
    pub fn remove(&mut self, bit: u16) -> bool {
        match self {
            Block::Full => {
                let mut runs = Vec::with_capacity(2);
                if bit > 0 {
                    runs.push(Run {
                        start: 0,
                        end: bit - 1,
                    });
                }
                if u32::from(bit) < LAST {
                    runs.push(Run {
                        start: bit + 1,
                        end: LAST as u16,
                    });
                }
                *self = Block::Runs(runs);
                true
            }
            Block::Runs(runs) => {
                let removed = runs_remove(runs, bit);
                if removed {
                    self.rebalance();
                }
                removed
            }
            Block::Dense(bitmap) => bitmap.clear(u32::from(bit)),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Block::Full => false,
            Block::Runs(runs) => runs.is_empty(),
            Block::Dense(bitmap) => bitmap.count == 0,
        }
    }

    /// Lowest member `>= from`.
    pub fn next_from(&self, from: u32) -> Option<u16> {
        if from > LAST {
            return None;
        }
        match self {
            Block::Full => Some(from as u16),
            Block::Runs(runs) => {
                let idx = runs.partition_point(|r| u32::from(r.end) < from);
                runs.get(idx)
                    .map(|r| u32::from(r.start).max(from) as u16)
            }
            Block::Dense(bitmap) => bitmap.next_set(from).map(|b| b as u16),
        }
    }

    pub fn max(&self) -> Option<u16> {
        match self {
            Block::Full => Some(LAST as u16),
            Block::Runs(runs) => runs.last().map(|r| r.end),
            Block::Dense(bitmap) => bitmap
                .words
                .iter()
                .enumerate()
                .rev()
                .find(|(_, w)| **w != 0)
                .map(|(i, w)| (i as u32 * 64 + 63 - w.leading_zeros()) as u16),
        }
    }

    pub fn count_range(&self, lo: u16, hi: u16) -> u32 {
        match self {
            Block::Full => u32::from(hi) - u32::from(lo) + 1,
            Block::Runs(runs) => runs
                .iter()
                .filter(|r| r.end >= lo && r.start <= hi)
                .map(|r| u32::from(r.end.min(hi)) - u32::from(r.start.max(lo)) + 1)
                .sum(),
            Block::Dense(bitmap) => (u32::from(lo)..=u32::from(hi))
                .filter(|bit| bitmap.test(*bit))
                .count() as u32,
        }
    }

    pub fn memory_bytes(&self) -> usize {
        match self {
            Block::Full => 0,
            Block::Runs(runs) => runs.capacity() * std::mem::size_of::<Run>(),
            Block::Dense(_) => std::mem::size_of::<Bitmap>(),
        }
    }

    pub fn to_bitmap(&self) -> Box<Bitmap> {
        match self {
            Block::Full => Box::new(Bitmap {
                words: [u64::MAX; WORDS],
                count: BLOCK_BITS,
            }),
            Block::Runs(runs) => {
                let mut bitmap = Bitmap::zeroed();
                for run in runs {
                    bitmap.set_range(u32::from(run.start), u32::from(run.end));
                }
                bitmap
            }
            Block::Dense(bitmap) => bitmap.clone(),
        }
    }

    /// Picks the cheapest representation for the current contents.
    pub fn optimize(self) -> Option<Block> {
        match self {
            Block::Full => Some(Block::Full),
            Block::Runs(mut runs) => {
                if runs.is_empty() {
                    return None;
                }
                if runs.len() == 1 && runs[0].len() == BLOCK_BITS {
                    return Some(Block::Full);
                }
                if runs.len() > MAX_RUNS {
                    let mut block = Block::Runs(runs);
                    block.rebalance();
                    return Some(block);
                }
                runs.shrink_to_fit();
                Some(Block::Runs(runs))
            }
            Block::Dense(bitmap) => from_bitmap(bitmap),
        }
    }

    fn rebalance(&mut self) {
        match self {
            Block::Runs(runs) if runs.len() > MAX_RUNS => {
                let bitmap = Block::Runs(std::mem::take(runs)).to_bitmap();
                *self = Block::Dense(bitmap);
            }
            Block::Runs(runs) if runs.len() == 1 && runs[0].len() == BLOCK_BITS => {
                *self = Block::Full;
            }
            Block::Dense(bitmap) if bitmap.count == BLOCK_BITS => *self = Block::Full,
            _ => {}
        }
    }
}

pub(super) fn from_bitmap(bitmap: Box<Bitmap>) -> Option<Block> {
    match bitmap.count {
        0 => None,
        BLOCK_BITS => Some(Block::Full),
        _ if bitmap.run_count() <= MAX_RUNS => Some(Block::Runs(bitmap.to_runs())),
        _ => Some(Block::Dense(bitmap)),
    }
}

fn runs_insert(runs: &mut Vec<Run>, bit: u16) -> bool {
    let idx = runs.partition_point(|r| r.end < bit);
    if idx < runs.len() && runs[idx].start <= bit {
        return false;
    }
    let joins_prev = idx > 0 && u32::from(runs[idx - 1].end) + 1 == u32::from(bit);
    let joins_next = idx < runs.len() && u32::from(runs[idx].start) == u32::from(bit) + 1;
    match (joins_prev, joins_next) {
        (true, true) => {
            runs[idx - 1].end = runs[idx].end;
            runs.remove(idx);
        }
        (true, false) => runs[idx - 1].end = bit,
        (false, true) => runs[idx].start = bit,
        (false, false) => runs.insert(
            idx,
            Run {
                start: bit,
                end: bit,
            },
        ),
    }
    true
}

fn runs_remove(runs: &mut Vec<Run>, bit: u16) -> bool {
    let idx = runs.partition_point(|r| r.end < bit);
    if idx == runs.len() || runs[idx].start > bit {
        return false;
    }
    let run = runs[idx];
    if run.start == run.end {
        runs.remove(idx);
    } else if bit == run.start {
        runs[idx].start += 1;
    } else if bit == run.end {
        runs[idx].end -= 1;
    } else {
        runs[idx].end = bit - 1;
        runs.insert(
            idx + 1,
            Run {
                start: bit + 1,
                end: run.end,
            },
        );
    }
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum SetOp {
    Union,
    Intersect,
    Subtract,
    Xor,
}

/// Combines two blocks; `None` means the result is empty.
pub(super) fn combine(op: SetOp, left: &Block, right: &Block) -> Option<Block> {
    match (op, left, right) {
        (SetOp::Union, Block::Full, _) | (SetOp::Union, _, Block::Full) => Some(Block::Full),
        (SetOp::Intersect, Block::Full, other) | (SetOp::Intersect, other, Block::Full) => {
            Some(other.clone())
        }
        (SetOp::Subtract, _, Block::Full) => None,
        (SetOp::Subtract, Block::Full, other)
        | (SetOp::Xor, Block::Full, other)
        | (SetOp::Xor, other, Block::Full) => invert(other),
        (_, Block::Runs(a), Block::Runs(b)) => {
            let runs = match op {
                SetOp::Union => runs_union(a, b),
                SetOp::Intersect => runs_intersect(a, b),
                SetOp::Subtract => runs_subtract(a, b),
                SetOp::Xor => runs_subtract(&runs_union(a, b), &runs_intersect(a, b)),
            };
            Block::Runs(runs).optimize()
        }
        _ => {
            let mut out = left.to_bitmap();
            let other = right.to_bitmap();
            for (dst, src) in out.words.iter_mut().zip(other.words.iter()) {
                *dst = match op {
                    SetOp::Union => *dst | *src,
                    SetOp::Intersect => *dst & *src,
                    SetOp::Subtract => *dst & !*src,
                    SetOp::Xor => *dst ^ *src,
                };
            }
            out.recount();
            from_bitmap(out)
        }
    }
}

pub(super) fn invert(block: &Block) -> Option<Block> {
    match block {
        Block::Full => None,
        Block::Runs(runs) => {
            let mut out = Vec::with_capacity(runs.len() + 1);
            let mut next = 0u32;
            for run in runs {
                if u32::from(run.start) > next {
                    out.push(Run {
                        start: next as u16,
                        end: run.start - 1,
                    });
                }
                next = u32::from(run.end) + 1;
            }
            if next <= LAST {
                out.push(Run {
                    start: next as u16,
                    end: LAST as u16,
                });
            }
            Block::Runs(out).optimize()
        }
        Block::Dense(bitmap) => {
            let mut out = bitmap.clone();
            for word in out.words.iter_mut() {
                *word = !*word;
            }
            out.count = BLOCK_BITS - bitmap.count;
            from_bitmap(out)
        }
    }
}

fn push_run(out: &mut Vec<Run>, start: u16, end: u16) {
    if let Some(last) = out.last_mut() {
        if u32::from(last.end) + 1 >= u32::from(start) {
            last.end = last.end.max(end);
            return;
        }
    }
    out.push(Run { start, end });
}

fn runs_union(a: &[Run], b: &[Run]) -> Vec<Run> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        let take_a = j == b.len() || (i < a.len() && a[i].start <= b[j].start);
        let run = if take_a {
            i += 1;
            a[i - 1]
        } else {
            j += 1;
            b[j - 1]
        };
        push_run(&mut out, run.start, run.end);
    }
    out
}

fn runs_intersect(a: &[Run], b: &[Run]) -> Vec<Run> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let start = a[i].start.max(b[j].start);
        let end = a[i].end.min(b[j].end);
        if start <= end {
            out.push(Run { start, end });
        }
        if a[i].end < b[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

fn runs_subtract(a: &[Run], b: &[Run]) -> Vec<Run> {
    let mut out = Vec::with_capacity(a.len());
    let mut j = 0;
    for run in a {
        let mut start = u32::from(run.start);
        let end = u32::from(run.end);
        while j < b.len() && b[j].end < run.start {
            j += 1;
        }
        let mut k = j;
        while start <= end && k < b.len() && u32::from(b[k].start) <= end {
            let cut_start = u32::from(b[k].start);
            let cut_end = u32::from(b[k].end);
            if cut_start > start {
                out.push(Run {
                    start: start as u16,
                    end: (cut_start - 1) as u16,
                });
            }
            start = start.max(cut_end + 1);
            k += 1;
        }
        if start <= end {
            out.push(Run {
                start: start as u16,
                end: end as u16,
            });
        }
    }
    out
}
