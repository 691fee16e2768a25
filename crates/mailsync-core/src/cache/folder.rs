//! Per-folder block cache.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use super::accuracy::{AccuracyRange, AccuracyRanges};
use super::block::{Block, BlockId, BlockInfo, BlockList, BlockType, InsertEffect};
use super::model::{CachedBody, CachedHeader};
use crate::config::SharedConfig;
use crate::model::{DateRange, FolderId, MessageUid};

/// Blocks written or removed since the last [`FolderBlockCache::take_changes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheChanges {
    /// Blocks whose contents changed.
    pub dirty: BTreeSet<(BlockType, BlockId)>,
    /// Blocks that no longer exist.
    pub removed: BTreeSet<(BlockType, BlockId)>,
    /// Whether the accuracy ranges changed.
    pub accuracy: bool,
}

impl CacheChanges {
    /// Whether there is nothing to write.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty() && self.removed.is_empty() && !self.accuracy
    }

    fn merge(&mut self, other: Self) {
        for key in other.removed {
            self.dirty.remove(&key);
            self.removed.insert(key);
        }
        for key in other.dirty {
            if !self.removed.contains(&key) {
                self.dirty.insert(key);
            }
        }
        self.accuracy |= other.accuracy;
    }
}

/// What a purge evaluation removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Removed header blocks.
    pub header_blocks: Vec<BlockId>,
    /// Removed body blocks.
    pub body_blocks: Vec<BlockId>,
}

impl PurgeReport {
    /// Total number of removed blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.header_blocks.len() + self.body_blocks.len()
    }

    /// Whether nothing was removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Header and body blocks plus accuracy ranges of one folder.
pub struct FolderBlockCache {
    folder: FolderId,
    config: SharedConfig,
    headers: BlockList<CachedHeader>,
    bodies: BlockList<CachedBody>,
    accuracy: AccuracyRanges,
    next_block_id: u64,
    new_body_blocks: u32,
    purge_queued: bool,
    changes: CacheChanges,
}

impl FolderBlockCache {
    /// Creates an empty cache for a folder.
    #[must_use]
    pub fn new(folder: FolderId, config: SharedConfig) -> Self {
        Self {
            folder,
            config,
            headers: BlockList::new(BlockType::Header),
            bodies: BlockList::new(BlockType::Body),
            accuracy: AccuracyRanges::default(),
            next_block_id: 1,
            new_body_blocks: 0,
            purge_queued: false,
            changes: CacheChanges::default(),
        }
    }

    pub(crate) fn from_parts(
        folder: FolderId,
        config: SharedConfig,
        headers: Vec<Block<CachedHeader>>,
        bodies: Vec<Block<CachedBody>>,
        accuracy: Vec<AccuracyRange>,
    ) -> Self {
        let next_block_id = headers
            .iter()
            .map(|b| b.id.0)
            .chain(bodies.iter().map(|b| b.id.0))
            .max()
            .unwrap_or(0)
            + 1;
        let mut cache = Self {
            headers: BlockList::from_blocks(BlockType::Header, headers),
            bodies: BlockList::from_blocks(BlockType::Body, bodies),
            accuracy: AccuracyRanges::from_ranges(accuracy),
            next_block_id,
            ..Self::new(folder, config)
        };
        cache.queue_purge_if_over_cap();
        cache
    }

    /// Folder this cache belongs to.
    #[must_use]
    pub const fn folder(&self) -> &FolderId {
        &self.folder
    }

    /// Adds or replaces a header.
    pub fn add_header(&mut self, header: CachedHeader) {
        let config = self.config.current();
        let effect = {
            let mut next = id_source(&mut self.next_block_id);
            self.headers.insert(header, &config, &mut next)
        };
        self.note_effect(BlockType::Header, effect);
        self.queue_purge_if_over_cap();
    }

    /// Adds or replaces a body.
    ///
    /// Every `purge_every_n_new_body_blocks` new body blocks a purge is
    /// queued; it runs when the owner calls [`FolderBlockCache::purge`].
    pub fn add_body(&mut self, body: CachedBody) {
        let config = self.config.current();
        let effect = {
            let mut next = id_source(&mut self.next_block_id);
            self.bodies.insert(body, &config, &mut next)
        };
        let created = u32::try_from(effect.created.len()).unwrap_or(u32::MAX);
        self.note_effect(BlockType::Body, effect);

        self.new_body_blocks = self.new_body_blocks.saturating_add(created);
        let cadence = config.purge_every_n_new_body_blocks.max(1);
        if self.new_body_blocks >= cadence {
            self.new_body_blocks = 0;
            if !self.purge_queued {
                tracing::debug!(folder = %self.folder, "Queueing block purge");
            }
            self.purge_queued = true;
        }
        self.queue_purge_if_over_cap();
    }

    /// Whether a purge evaluation is waiting to run.
    #[must_use]
    pub const fn purge_queued(&self) -> bool {
        self.purge_queued
    }

    /// Evaluates the purge policy for both block types.
    ///
    /// Every settled block goes: one whose whole span is covered by
    /// accuracy ranges last synced longer than `purge_only_after_unsynced`
    /// ago. If a type still has more blocks than the hard cap, its oldest
    /// blocks go too, regardless of age. Purged header spans lose their
    /// accuracy coverage.
    pub fn purge(&mut self, now: DateTime<Utc>) -> PurgeReport {
        let config = self.config.current();
        let cap = config.purge_hard_max_blocks;
        let min_age = config.purge_only_after_unsynced;
        self.purge_queued = false;

        let accuracy = &self.accuracy;
        let settled = |span: DateRange| accuracy.covers(span, |r| r.age(now) > min_age);
        let removed_headers = self.headers.purge_to(cap, settled);
        let removed_bodies = self.bodies.purge_to(cap, settled);

        let mut report = PurgeReport::default();
        for block in removed_headers {
            self.accuracy.clip(block.span());
            self.changes.accuracy = true;
            self.forget(BlockType::Header, block.id);
            report.header_blocks.push(block.id);
        }
        for block in removed_bodies {
            self.forget(BlockType::Body, block.id);
            report.body_blocks.push(block.id);
        }

        if !report.is_empty() {
            tracing::info!(
                folder = %self.folder,
                headers = report.header_blocks.len(),
                bodies = report.body_blocks.len(),
                "Purged cache blocks"
            );
        }
        report
    }

    /// Records that `range` was fully synchronized at `at`.
    pub fn note_synced(&mut self, range: DateRange, at: DateTime<Utc>) {
        self.accuracy.note_synced(range, at);
        self.changes.accuracy = true;
    }

    /// Whether a sync pass over `range` has to talk to the server.
    #[must_use]
    pub fn needs_refresh(&self, range: DateRange, now: DateTime<Utc>) -> bool {
        let thresh = self.config.current().refresh_thresh;
        self.accuracy.needs_refresh(range, now, thresh)
    }

    /// Accuracy ranges, oldest span first.
    #[must_use]
    pub fn accuracy_ranges(&self) -> &[AccuracyRange] {
        self.accuracy.as_slice()
    }

    /// Cached header by uid.
    #[must_use]
    pub fn header(&self, uid: MessageUid) -> Option<&CachedHeader> {
        self.headers.get(uid)
    }

    /// Cached body by uid.
    #[must_use]
    pub fn body(&self, uid: MessageUid) -> Option<&CachedBody> {
        self.bodies.get(uid)
    }

    /// Cached headers dated inside `range`, newest first.
    #[must_use]
    pub fn headers_in(&self, range: DateRange) -> Vec<&CachedHeader> {
        let mut headers: Vec<_> = self.headers.records_in(range).collect();
        headers.reverse();
        headers
    }

    /// Summaries of the blocks of one type, oldest first.
    #[must_use]
    pub fn block_infos(&self, block_type: BlockType) -> Vec<BlockInfo> {
        match block_type {
            BlockType::Header => self.headers.infos(),
            BlockType::Body => self.bodies.infos(),
        }
    }

    /// Number of blocks of one type.
    #[must_use]
    pub fn block_count(&self, block_type: BlockType) -> usize {
        match block_type {
            BlockType::Header => self.headers.len(),
            BlockType::Body => self.bodies.len(),
        }
    }

    /// Drops every block and all accuracy coverage.
    pub fn clear(&mut self) {
        for id in self.headers.clear() {
            self.forget(BlockType::Header, id);
        }
        for id in self.bodies.clear() {
            self.forget(BlockType::Body, id);
        }
        self.accuracy.clear();
        self.changes.accuracy = true;
        self.new_body_blocks = 0;
        self.purge_queued = false;
    }

    /// Hands out the pending changes for persisting.
    pub fn take_changes(&mut self) -> CacheChanges {
        std::mem::take(&mut self.changes)
    }

    /// Puts back changes that could not be persisted.
    pub fn restore_changes(&mut self, changes: CacheChanges) {
        let newer = std::mem::replace(&mut self.changes, changes);
        self.changes.merge(newer);
    }

    pub(crate) fn header_block(&self, id: BlockId) -> Option<&Block<CachedHeader>> {
        self.headers.block(id)
    }

    pub(crate) fn body_block(&self, id: BlockId) -> Option<&Block<CachedBody>> {
        self.bodies.block(id)
    }

    fn note_effect(&mut self, block_type: BlockType, effect: InsertEffect) {
        for id in effect.removed {
            self.forget(block_type, id);
        }
        for id in effect.touched.into_iter().chain(effect.created) {
            self.changes.dirty.insert((block_type, id));
        }
    }

    fn forget(&mut self, block_type: BlockType, id: BlockId) {
        self.changes.dirty.remove(&(block_type, id));
        self.changes.removed.insert((block_type, id));
    }

    fn queue_purge_if_over_cap(&mut self) {
        let cap = self.config.current().purge_hard_max_blocks;
        if self.headers.len() > cap || self.bodies.len() > cap {
            self.purge_queued = true;
        }
    }
}

fn id_source(next: &mut u64) -> impl FnMut() -> BlockId + '_ {
    move || {
        let id = BlockId(*next);
        *next += 1;
        id
    }
}

impl std::fmt::Debug for FolderBlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderBlockCache")
            .field("folder", &self.folder)
            .field("header_blocks", &self.headers.len())
            .field("body_blocks", &self.bodies.len())
            .field("accuracy_ranges", &self.accuracy.as_slice().len())
            .field("purge_queued", &self.purge_queued)
            .finish_non_exhaustive()
    }
}
