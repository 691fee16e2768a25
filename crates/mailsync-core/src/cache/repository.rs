//! Block cache storage repository.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use super::accuracy::AccuracyRange;
use super::block::{Block, BlockId, BlockType};
use super::folder::{CacheChanges, FolderBlockCache};
use super::model::{BlockRecord, CachedBody, CachedHeader};
use crate::config::SharedConfig;
use crate::model::FolderId;
use crate::{AccountId, Result};

/// Repository persisting folder block caches of one account.
pub struct BlockRepository {
    account_id: AccountId,
    pool: SqlitePool,
}

impl BlockRepository {
    /// Create a new repository with the given database path.
    ///
    /// Creates the database and tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(account_id: AccountId, database_path: &str) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let repo = Self { account_id, pool };
        repo.initialize().await?;
        Ok(repo)
    }

    /// Create an in-memory repository for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory(account_id: AccountId) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let repo = Self { account_id, pool };
        repo.initialize().await?;
        Ok(repo)
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS cache_blocks (
                account_id INTEGER NOT NULL,
                folder_path TEXT NOT NULL,
                block_type TEXT NOT NULL,
                block_id INTEGER NOT NULL,
                record_count INTEGER NOT NULL,
                approx_bytes INTEGER NOT NULL,
                oldest TEXT NOT NULL,
                newest TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY(account_id, folder_path, block_type, block_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS accuracy_ranges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                folder_path TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                last_synced_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_accuracy_folder
            ON accuracy_ranges(account_id, folder_path)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Writes the cache's pending changes in one transaction.
    ///
    /// On failure the changes are handed back to the cache so the next
    /// save retries them.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or a database query fails.
    pub async fn save(&self, cache: &mut FolderBlockCache) -> Result<()> {
        let changes = cache.take_changes();
        if changes.is_empty() {
            return Ok(());
        }
        if let Err(err) = self.write(cache, &changes).await {
            tracing::warn!(folder = %cache.folder(), ?err, "Could not persist cache blocks");
            cache.restore_changes(changes);
            return Err(err);
        }
        tracing::debug!(
            folder = %cache.folder(),
            dirty = changes.dirty.len(),
            removed = changes.removed.len(),
            "Persisted cache blocks"
        );
        Ok(())
    }

    async fn write(&self, cache: &FolderBlockCache, changes: &CacheChanges) -> Result<()> {
        let folder = cache.folder().as_str();
        let mut tx = self.pool.begin().await?;

        for (block_type, id) in &changes.removed {
            sqlx::query(
                r"
                DELETE FROM cache_blocks
                WHERE account_id = ? AND folder_path = ? AND block_type = ? AND block_id = ?
                ",
            )
            .bind(self.account_id.0)
            .bind(folder)
            .bind(block_type.as_str())
            .bind(block_id(*id))
            .execute(&mut *tx)
            .await?;
        }

        for (block_type, id) in &changes.dirty {
            let row = match block_type {
                BlockType::Header => cache.header_block(*id).map(BlockRow::from_block),
                BlockType::Body => cache.body_block(*id).map(BlockRow::from_block),
            };
            let Some(row) = row.transpose()? else {
                continue;
            };
            sqlx::query(
                r"
                INSERT INTO cache_blocks
                    (account_id, folder_path, block_type, block_id, record_count,
                     approx_bytes, oldest, newest, payload)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(account_id, folder_path, block_type, block_id) DO UPDATE SET
                    record_count = excluded.record_count,
                    approx_bytes = excluded.approx_bytes,
                    oldest = excluded.oldest,
                    newest = excluded.newest,
                    payload = excluded.payload
                ",
            )
            .bind(self.account_id.0)
            .bind(folder)
            .bind(block_type.as_str())
            .bind(block_id(*id))
            .bind(row.record_count)
            .bind(row.approx_bytes)
            .bind(row.oldest.to_rfc3339())
            .bind(row.newest.to_rfc3339())
            .bind(row.payload)
            .execute(&mut *tx)
            .await?;
        }

        if changes.accuracy {
            sqlx::query(r"DELETE FROM accuracy_ranges WHERE account_id = ? AND folder_path = ?")
                .bind(self.account_id.0)
                .bind(folder)
                .execute(&mut *tx)
                .await?;
            for range in cache.accuracy_ranges() {
                sqlx::query(
                    r"
                    INSERT INTO accuracy_ranges
                        (account_id, folder_path, start_time, end_time, last_synced_at)
                    VALUES (?, ?, ?, ?, ?)
                    ",
                )
                .bind(self.account_id.0)
                .bind(folder)
                .bind(range.start.to_rfc3339())
                .bind(range.end.to_rfc3339())
                .bind(range.last_synced_at.to_rfc3339())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Loads a folder's cache; an unknown folder yields an empty cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or a block payload is
    /// unreadable.
    pub async fn load(&self, folder: &FolderId, config: SharedConfig) -> Result<FolderBlockCache> {
        let rows = sqlx::query(
            r"
            SELECT block_type, block_id, payload
            FROM cache_blocks
            WHERE account_id = ? AND folder_path = ?
            ORDER BY block_id ASC
            ",
        )
        .bind(self.account_id.0)
        .bind(folder.as_str())
        .fetch_all(&self.pool)
        .await?;

        let snapshot = config.current();
        let mut headers: Vec<Block<CachedHeader>> = Vec::new();
        let mut bodies: Vec<Block<CachedBody>> = Vec::new();
        for row in &rows {
            let kind: String = row.get("block_type");
            let id = BlockId(u64::try_from(row.get::<i64, _>("block_id")).unwrap_or_default());
            let payload: String = row.get("payload");
            match kind.as_str() {
                "header" => headers.push(Block::new(id, serde_json::from_str(&payload)?, &snapshot)),
                "body" => bodies.push(Block::new(id, serde_json::from_str(&payload)?, &snapshot)),
                other => tracing::warn!(folder = %folder, kind = other, "Skipping unknown block type"),
            }
        }

        let rows = sqlx::query(
            r"
            SELECT start_time, end_time, last_synced_at
            FROM accuracy_ranges
            WHERE account_id = ? AND folder_path = ?
            ",
        )
        .bind(self.account_id.0)
        .bind(folder.as_str())
        .fetch_all(&self.pool)
        .await?;

        let ranges = rows
            .iter()
            .filter_map(|row| {
                Some(AccuracyRange {
                    start: parse_time(row.get("start_time"))?,
                    end: parse_time(row.get("end_time"))?,
                    last_synced_at: parse_time(row.get("last_synced_at"))?,
                })
            })
            .collect();

        tracing::debug!(
            folder = %folder,
            header_blocks = headers.len(),
            body_blocks = bodies.len(),
            "Loaded folder cache"
        );
        Ok(FolderBlockCache::from_parts(
            folder.clone(),
            config,
            headers,
            bodies,
            ranges,
        ))
    }

    /// Deletes everything stored for a folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn clear_folder(&self, folder: &FolderId) -> Result<()> {
        sqlx::query(r"DELETE FROM cache_blocks WHERE account_id = ? AND folder_path = ?")
            .bind(self.account_id.0)
            .bind(folder.as_str())
            .execute(&self.pool)
            .await?;

        sqlx::query(r"DELETE FROM accuracy_ranges WHERE account_id = ? AND folder_path = ?")
            .bind(self.account_id.0)
            .bind(folder.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Folders with stored blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn folders(&self) -> Result<Vec<FolderId>> {
        let rows = sqlx::query(
            r"
            SELECT DISTINCT folder_path
            FROM cache_blocks
            WHERE account_id = ?
            ORDER BY folder_path ASC
            ",
        )
        .bind(self.account_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| FolderId::new(row.get::<String, _>("folder_path")))
            .collect())
    }
}

struct BlockRow {
    record_count: i64,
    approx_bytes: i64,
    oldest: DateTime<Utc>,
    newest: DateTime<Utc>,
    payload: String,
}

impl BlockRow {
    fn from_block<R: BlockRecord>(block: &Block<R>) -> Result<Self> {
        Ok(Self {
            record_count: i64::try_from(block.records.len()).unwrap_or(i64::MAX),
            approx_bytes: i64::try_from(block.approx_bytes).unwrap_or(i64::MAX),
            oldest: block.oldest(),
            newest: block.newest(),
            payload: serde_json::to_string(&block.records)?,
        })
    }
}

fn block_id(id: BlockId) -> i64 {
    i64::try_from(id.0).unwrap_or(i64::MAX)
}

fn parse_time(value: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
