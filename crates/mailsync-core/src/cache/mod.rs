//! Folder block cache.
//!
//! Synchronized headers and bodies are kept in discrete, time-ordered blocks
//! per folder, alongside accuracy ranges recording which time spans are
//! known to be complete. A purge policy bounds the number of blocks.

mod accuracy;
mod block;
mod folder;
mod model;
mod repository;

pub use accuracy::{AccuracyRange, AccuracyRanges};
pub use block::{BlockId, BlockInfo, BlockType};
pub use folder::{CacheChanges, FolderBlockCache, PurgeReport};
pub use model::{BlockRecord, CachedBody, CachedHeader};
pub use repository::BlockRepository;
