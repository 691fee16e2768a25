//! Sync, purge and retry tunables.
//!
//! All knobs live in one [`SyncConfig`] value that is handed to each
//! component at construction through a [`SharedConfig`]. Components take a
//! snapshot per decision, so swapping the whole configuration at runtime
//! (for tuning or from tests) takes effect without restarting anything.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Tunable parameters for sync, purge and retry policy.
///
/// The defaults are aimed at resource-constrained mobile devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// A synchronized range older than this is refreshed, otherwise skipped.
    #[serde(with = "duration_ms")]
    pub refresh_thresh: Duration,
    /// Queue a purge every time this many new body blocks were created.
    pub purge_every_n_new_body_blocks: u32,
    /// Blocks are only age-eligible for purging once their accuracy ranges
    /// have gone this long without a sync.
    #[serde(with = "duration_ms")]
    pub purge_only_after_unsynced: Duration,
    /// Absolute maximum number of blocks per folder and block type.
    pub purge_hard_max_blocks: usize,
    /// How many days back the first sync pass looks.
    pub initial_sync_days: f64,
    /// Upper bound for a grown sync window.
    pub max_sync_days: f64,
    /// Bisection never shrinks a window below this.
    pub min_sync_window_days: f64,
    /// Furthest back in time we are willing to sync.
    pub oldest_sync_date: DateTime<Utc>,
    /// Number of headers a sync pass tries to gather before stopping.
    pub initial_fill_size: usize,
    /// Bisection targets this many messages per window.
    pub bisect_date_at_n_messages: u32,
    /// More messages than this in one window triggers a bisection.
    pub too_many_messages: u32,
    /// Window growth factor after a window came back empty.
    pub time_scale_factor_on_no_messages: f64,
    /// Fixed size estimate of one cached header record.
    pub header_est_size_bytes: usize,
    /// Target byte size of one block before it is split.
    pub block_target_bytes: usize,
    /// Target record count of one block before it is split.
    pub block_max_records: usize,
    /// Try count at which a mutation job is given up on.
    pub max_op_try_count: u32,
    /// Try count increment applied on unexpected errors.
    pub op_unknown_error_try_increment: u32,
    /// Delay before a deferred job is retried.
    #[serde(with = "duration_ms")]
    pub deferred_op_delay: Duration,
    /// Minimum interval between folder list syncs.
    #[serde(with = "duration_ms")]
    pub sync_folder_list_every: Duration,
    /// Delay before the first reconnect attempt; doubles per failure.
    #[serde(with = "duration_ms")]
    pub backoff_base_delay: Duration,
    /// Upper bound of the reconnect delay.
    #[serde(with = "duration_ms")]
    pub backoff_max_delay: Duration,
    /// Consecutive failures after which automatic reconnects stop.
    pub backoff_max_failures: u32,
    /// Upper bound for a single connect attempt.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            refresh_thresh: HOUR,
            purge_every_n_new_body_blocks: 4,
            purge_only_after_unsynced: DAY * 14,
            purge_hard_max_blocks: 128,
            initial_sync_days: 3.0,
            max_sync_days: 30.0 * 365.0,
            min_sync_window_days: 1.0 / 24.0,
            oldest_sync_date: Utc
                .with_ymd_and_hms(1990, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(DateTime::UNIX_EPOCH),
            initial_fill_size: 15,
            bisect_date_at_n_messages: 50,
            too_many_messages: 2000,
            time_scale_factor_on_no_messages: 1.6,
            header_est_size_bytes: 430,
            block_target_bytes: 96 * 1024,
            block_max_records: 256,
            max_op_try_count: 10,
            op_unknown_error_try_increment: 5,
            deferred_op_delay: Duration::from_secs(30),
            sync_folder_list_every: DAY,
            backoff_base_delay: Duration::from_millis(800),
            backoff_max_delay: Duration::from_secs(30),
            backoff_max_failures: 3,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Default location of the config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform has no config directory.
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("mailsync").join("sync.json"))
            .ok_or_else(|| Error::Config("no config directory on this platform".into()))
    }

    /// Loads a config file; fields missing from the file keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Loads a config file, falling back to defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(?path, "No sync config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Writes the config as pretty JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Returns a copy with the given overrides applied.
    #[must_use]
    pub fn with_overrides(&self, overrides: &SyncOverrides) -> Self {
        let mut config = self.clone();
        overrides.apply_to(&mut config);
        config
    }

    /// Whether the folder list is due for a resync.
    #[must_use]
    pub fn folder_list_sync_due(
        &self,
        last_synced: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        last_synced.is_none_or(|last| {
            (now - last).to_std().unwrap_or(Duration::ZERO) >= self.sync_folder_list_every
        })
    }
}

/// Partial set of tunables; only the fields that are set get applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOverrides {
    /// See [`SyncConfig::refresh_thresh`].
    #[serde(with = "opt_duration_ms")]
    pub refresh_thresh: Option<Duration>,
    /// See [`SyncConfig::purge_every_n_new_body_blocks`].
    pub purge_every_n_new_body_blocks: Option<u32>,
    /// See [`SyncConfig::purge_only_after_unsynced`].
    #[serde(with = "opt_duration_ms")]
    pub purge_only_after_unsynced: Option<Duration>,
    /// See [`SyncConfig::purge_hard_max_blocks`].
    pub purge_hard_max_blocks: Option<usize>,
    /// See [`SyncConfig::initial_sync_days`].
    pub initial_sync_days: Option<f64>,
    /// See [`SyncConfig::max_sync_days`].
    pub max_sync_days: Option<f64>,
    /// See [`SyncConfig::min_sync_window_days`].
    pub min_sync_window_days: Option<f64>,
    /// See [`SyncConfig::oldest_sync_date`].
    pub oldest_sync_date: Option<DateTime<Utc>>,
    /// See [`SyncConfig::initial_fill_size`].
    pub initial_fill_size: Option<usize>,
    /// See [`SyncConfig::bisect_date_at_n_messages`].
    pub bisect_date_at_n_messages: Option<u32>,
    /// See [`SyncConfig::too_many_messages`].
    pub too_many_messages: Option<u32>,
    /// See [`SyncConfig::time_scale_factor_on_no_messages`].
    pub time_scale_factor_on_no_messages: Option<f64>,
    /// See [`SyncConfig::header_est_size_bytes`].
    pub header_est_size_bytes: Option<usize>,
    /// See [`SyncConfig::block_target_bytes`].
    pub block_target_bytes: Option<usize>,
    /// See [`SyncConfig::block_max_records`].
    pub block_max_records: Option<usize>,
    /// See [`SyncConfig::max_op_try_count`].
    pub max_op_try_count: Option<u32>,
    /// See [`SyncConfig::op_unknown_error_try_increment`].
    pub op_unknown_error_try_increment: Option<u32>,
    /// See [`SyncConfig::deferred_op_delay`].
    #[serde(with = "opt_duration_ms")]
    pub deferred_op_delay: Option<Duration>,
    /// See [`SyncConfig::sync_folder_list_every`].
    #[serde(with = "opt_duration_ms")]
    pub sync_folder_list_every: Option<Duration>,
    /// See [`SyncConfig::backoff_base_delay`].
    #[serde(with = "opt_duration_ms")]
    pub backoff_base_delay: Option<Duration>,
    /// See [`SyncConfig::backoff_max_delay`].
    #[serde(with = "opt_duration_ms")]
    pub backoff_max_delay: Option<Duration>,
    /// See [`SyncConfig::backoff_max_failures`].
    pub backoff_max_failures: Option<u32>,
    /// See [`SyncConfig::connect_timeout`].
    #[serde(with = "opt_duration_ms")]
    pub connect_timeout: Option<Duration>,
}

impl SyncOverrides {
    fn apply_to(&self, config: &mut SyncConfig) {
        macro_rules! apply {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = self.$field { config.$field = value; })*
            };
        }
        apply!(
            refresh_thresh,
            purge_every_n_new_body_blocks,
            purge_only_after_unsynced,
            purge_hard_max_blocks,
            initial_sync_days,
            max_sync_days,
            min_sync_window_days,
            oldest_sync_date,
            initial_fill_size,
            bisect_date_at_n_messages,
            too_many_messages,
            time_scale_factor_on_no_messages,
            header_est_size_bytes,
            block_target_bytes,
            block_max_records,
            max_op_try_count,
            op_unknown_error_try_increment,
            deferred_op_delay,
            sync_folder_list_every,
            backoff_base_delay,
            backoff_max_delay,
            backoff_max_failures,
            connect_timeout,
        );
    }
}

/// Cloneable handle to the live configuration.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<SyncConfig>>>,
}

impl SharedConfig {
    /// Wraps a configuration.
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn current(&self) -> Arc<SyncConfig> {
        Arc::clone(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replaces the whole configuration.
    pub fn replace(&self, config: SyncConfig) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        tracing::debug!("Sync configuration replaced");
    }

    /// Replaces the configuration with the current one plus overrides.
    pub fn apply(&self, overrides: &SyncOverrides) {
        let next = self.current().with_overrides(overrides);
        self.replace(next);
    }
}

impl From<SyncConfig> for SharedConfig {
    fn from(config: SyncConfig) -> Self {
        Self::new(config)
    }
}

/// Serde helpers storing durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)] // Required by serde with= signature
    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)] // Required by serde with= signature
    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => {
                serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.max_op_try_count, 10);
        assert_eq!(config.op_unknown_error_try_increment, 5);
        assert_eq!(config.deferred_op_delay, Duration::from_secs(30));
        assert_eq!(config.purge_hard_max_blocks, 128);
        assert_eq!(config.oldest_sync_date.to_rfc3339(), "1990-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_overrides_only_touch_set_fields() {
        let base = SyncConfig::default();
        let overrides = SyncOverrides {
            too_many_messages: Some(10),
            refresh_thresh: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let config = base.with_overrides(&overrides);
        assert_eq!(config.too_many_messages, 10);
        assert_eq!(config.refresh_thresh, Duration::from_secs(5));
        assert_eq!(config.bisect_date_at_n_messages, base.bisect_date_at_n_messages);
    }

    #[test]
    fn test_overrides_cover_window_and_connection_limits() {
        let oldest = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let overrides = SyncOverrides {
            max_sync_days: Some(90.0),
            min_sync_window_days: Some(0.5),
            oldest_sync_date: Some(oldest),
            sync_folder_list_every: Some(HOUR),
            backoff_max_delay: Some(Duration::from_secs(5)),
            connect_timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        let config = SyncConfig::default().with_overrides(&overrides);
        assert_eq!(config.max_sync_days, 90.0);
        assert_eq!(config.min_sync_window_days, 0.5);
        assert_eq!(config.oldest_sync_date, oldest);
        assert_eq!(config.sync_folder_list_every, HOUR);
        assert_eq!(config.backoff_max_delay, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));

        let json = serde_json::to_string(&overrides).unwrap();
        assert_eq!(serde_json::from_str::<SyncOverrides>(&json).unwrap(), overrides);
    }

    #[test]
    fn test_shared_config_replace_is_visible_to_clones() {
        let shared = SharedConfig::new(SyncConfig::default());
        let other = shared.clone();
        let before = other.current();

        shared.apply(&SyncOverrides {
            max_op_try_count: Some(3),
            ..Default::default()
        });

        assert_eq!(before.max_op_try_count, 10);
        assert_eq!(other.current().max_op_try_count, 3);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"deferred_op_delay": 1500, "initial_sync_days": 7.0}"#)
                .unwrap();
        assert_eq!(config.deferred_op_delay, Duration::from_millis(1500));
        assert_eq!(config.initial_sync_days, 7.0);
        assert_eq!(config.initial_fill_size, 15);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("mailsync-config-{}", std::process::id()));
        let path = dir.join("sync.json");
        let config = SyncConfig {
            purge_hard_max_blocks: 7,
            ..SyncConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(SyncConfig::load(&path).unwrap(), config);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_folder_list_sync_due() {
        let config = SyncConfig::default();
        let now = Utc::now();
        assert!(config.folder_list_sync_due(None, now));
        assert!(!config.folder_list_sync_due(Some(now - chrono::Duration::hours(2)), now));
        assert!(config.folder_list_sync_due(Some(now - chrono::Duration::days(2)), now));
    }
}
