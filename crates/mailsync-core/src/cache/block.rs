//! Time-ordered, size-bounded record blocks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::BlockRecord;
use crate::config::SyncConfig;
use crate::model::{DateRange, MessageUid};

/// Identifier of a block, unique within a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a block stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    /// Message headers.
    Header,
    /// Message bodies.
    Body,
}

impl BlockType {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Body => "body",
        }
    }
}

/// Summary of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Block id.
    pub id: BlockId,
    /// Header or body.
    pub block_type: BlockType,
    /// Position among the folder's blocks of this type, oldest first.
    pub sequence_index: usize,
    /// Number of records.
    pub record_count: usize,
    /// Estimated size in bytes.
    pub approx_bytes: usize,
    /// Date of the oldest record.
    pub oldest: DateTime<Utc>,
    /// Date of the newest record.
    pub newest: DateTime<Utc>,
}

impl BlockInfo {
    /// Time span the block covers, as a half-open range.
    #[must_use]
    pub fn span(&self) -> DateRange {
        block_span(self.oldest, self.newest)
    }
}

fn block_span(oldest: DateTime<Utc>, newest: DateTime<Utc>) -> DateRange {
    let end = newest
        .checked_add_signed(chrono::Duration::milliseconds(1))
        .unwrap_or(newest);
    DateRange::new(oldest, end)
}

#[derive(Debug, Clone)]
pub(crate) struct Block<R> {
    pub(crate) id: BlockId,
    /// Sorted by `(date, uid)`.
    pub(crate) records: Vec<R>,
    pub(crate) approx_bytes: usize,
}

impl<R: BlockRecord> Block<R> {
    pub(crate) fn new(id: BlockId, mut records: Vec<R>, config: &SyncConfig) -> Self {
        records.sort_by_key(|r| (r.date(), r.uid()));
        let approx_bytes = records.iter().map(|r| r.size_estimate(config)).sum();
        Self {
            id,
            records,
            approx_bytes,
        }
    }

    pub(crate) fn oldest(&self) -> DateTime<Utc> {
        self.records.first().map_or(DateTime::<Utc>::MAX_UTC, BlockRecord::date)
    }

    pub(crate) fn newest(&self) -> DateTime<Utc> {
        self.records.last().map_or(DateTime::<Utc>::MIN_UTC, BlockRecord::date)
    }

    pub(crate) fn span(&self) -> DateRange {
        block_span(self.oldest(), self.newest())
    }

    pub(crate) fn info(&self, block_type: BlockType, sequence_index: usize) -> BlockInfo {
        BlockInfo {
            id: self.id,
            block_type,
            sequence_index,
            record_count: self.records.len(),
            approx_bytes: self.approx_bytes,
            oldest: self.oldest(),
            newest: self.newest(),
        }
    }

    fn insert(&mut self, record: R, config: &SyncConfig) {
        let key = (record.date(), record.uid());
        let idx = self.records.partition_point(|r| (r.date(), r.uid()) < key);
        self.approx_bytes += record.size_estimate(config);
        self.records.insert(idx, record);
    }

    fn remove(&mut self, uid: MessageUid, config: &SyncConfig) -> Option<R> {
        let idx = self.records.iter().position(|r| r.uid() == uid)?;
        let record = self.records.remove(idx);
        self.approx_bytes = self.approx_bytes.saturating_sub(record.size_estimate(config));
        Some(record)
    }

    fn is_oversized(&self, config: &SyncConfig) -> bool {
        self.records.len() >= 2
            && (self.records.len() > config.block_max_records
                || self.approx_bytes > config.block_target_bytes)
    }

    /// Seals the older half (by size) and returns the newer half as a new block.
    fn split_off_newer(&mut self, id: BlockId, config: &SyncConfig) -> Self {
        let half = self.approx_bytes / 2;
        let mut acc = 0;
        let mut at = self.records.len() / 2;
        for (idx, record) in self.records.iter().enumerate() {
            acc += record.size_estimate(config);
            if acc >= half {
                at = idx + 1;
                break;
            }
        }
        let at = at.clamp(1, self.records.len() - 1);
        let newer = self.records.split_off(at);
        self.approx_bytes = self.records.iter().map(|r| r.size_estimate(config)).sum();
        Self::new(id, newer, config)
    }
}

/// Block ids touched by an insert.
#[derive(Debug, Default)]
pub(crate) struct InsertEffect {
    pub(crate) touched: Vec<BlockId>,
    pub(crate) created: Vec<BlockId>,
    pub(crate) removed: Vec<BlockId>,
}

/// All blocks of one type for one folder, oldest first.
#[derive(Debug)]
pub(crate) struct BlockList<R> {
    block_type: BlockType,
    blocks: Vec<Block<R>>,
    index: HashMap<MessageUid, BlockId>,
}

impl<R: BlockRecord> BlockList<R> {
    pub(crate) fn new(block_type: BlockType) -> Self {
        Self {
            block_type,
            blocks: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Rebuilds a list from loaded blocks.
    pub(crate) fn from_blocks(block_type: BlockType, mut blocks: Vec<Block<R>>) -> Self {
        blocks.retain(|b| !b.records.is_empty());
        blocks.sort_by_key(|b| (b.oldest(), b.id));
        let index = blocks
            .iter()
            .flat_map(|b| b.records.iter().map(|r| (r.uid(), b.id)))
            .collect();
        Self {
            block_type,
            blocks,
            index,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn blocks(&self) -> &[Block<R>] {
        &self.blocks
    }

    pub(crate) fn block(&self, id: BlockId) -> Option<&Block<R>> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub(crate) fn infos(&self) -> Vec<BlockInfo> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(idx, b)| b.info(self.block_type, idx))
            .collect()
    }

    pub(crate) fn get(&self, uid: MessageUid) -> Option<&R> {
        let id = self.index.get(&uid)?;
        self.block(*id)?.records.iter().find(|r| r.uid() == uid)
    }

    pub(crate) fn records_in(&self, range: DateRange) -> impl Iterator<Item = &R> {
        self.blocks
            .iter()
            .filter(move |b| b.oldest() < range.end && b.newest() >= range.start)
            .flat_map(|b| b.records.iter())
            .filter(move |r| range.contains(r.date()))
    }

    /// Places a record into the block covering its date (or the nearest
    /// block), replacing any record with the same uid, and splits the
    /// block if it grew past the target size.
    pub(crate) fn insert(
        &mut self,
        record: R,
        config: &SyncConfig,
        next_id: &mut impl FnMut() -> BlockId,
    ) -> InsertEffect {
        let mut effect = InsertEffect::default();
        let uid = record.uid();

        if let Some(previous) = self.index.remove(&uid) {
            if let Some(pos) = self.position(previous) {
                self.blocks[pos].remove(uid, config);
                if self.blocks[pos].records.is_empty() {
                    self.blocks.remove(pos);
                    effect.removed.push(previous);
                } else {
                    effect.touched.push(previous);
                }
            }
        }

        let pos = match self.target_position(record.date()) {
            Some(pos) => pos,
            None => {
                let id = next_id();
                self.blocks.push(Block::new(id, Vec::new(), config));
                effect.created.push(id);
                0
            }
        };
        let id = self.blocks[pos].id;
        self.blocks[pos].insert(record, config);
        self.index.insert(uid, id);
        if !effect.created.contains(&id) {
            effect.touched.push(id);
        }

        if self.blocks[pos].is_oversized(config) {
            let new_id = next_id();
            let newer = self.blocks[pos].split_off_newer(new_id, config);
            for r in &newer.records {
                self.index.insert(r.uid(), new_id);
            }
            tracing::trace!(block = %id, new_block = %new_id, kind = self.block_type.as_str(), "Split block");
            self.blocks.insert(pos + 1, newer);
            effect.created.push(new_id);
        }
        effect
    }

    /// Removes every block `settled` accepts, then the oldest blocks until
    /// at most `cap` remain. Removed blocks come back oldest first within
    /// each of the two passes.
    pub(crate) fn purge_to(
        &mut self,
        cap: usize,
        mut settled: impl FnMut(DateRange) -> bool,
    ) -> Vec<Block<R>> {
        let (mut removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.blocks)
            .into_iter()
            .partition(|b| settled(b.span()));
        self.blocks = kept;
        let excess = self.blocks.len().saturating_sub(cap);
        removed.extend(self.blocks.drain(..excess));
        for block in &removed {
            for r in &block.records {
                self.index.remove(&r.uid());
            }
        }
        removed
    }

    pub(crate) fn clear(&mut self) -> Vec<BlockId> {
        self.index.clear();
        self.blocks.drain(..).map(|b| b.id).collect()
    }

    fn position(&self, id: BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == id)
    }

    fn target_position(&self, date: DateTime<Utc>) -> Option<usize> {
        let last = self.blocks.len().checked_sub(1)?;
        let after = self.blocks.partition_point(|b| b.newest() < date);
        if after > last {
            return Some(last);
        }
        if after == 0 || self.blocks[after].oldest() <= date {
            return Some(after);
        }
        // Between two blocks: join the closer one.
        let gap_older = date - self.blocks[after - 1].newest();
        let gap_newer = self.blocks[after].oldest() - date;
        Some(if gap_older <= gap_newer { after - 1 } else { after })
    }
}
