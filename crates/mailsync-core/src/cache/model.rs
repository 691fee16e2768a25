//! Cached record models.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::model::MessageUid;

/// A record that lives in a cache block.
pub trait BlockRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Message uid; unique within a folder.
    fn uid(&self) -> MessageUid;

    /// Message date; blocks are ordered by it.
    fn date(&self) -> DateTime<Utc>;

    /// Bytes the record is assumed to take up in its block.
    fn size_estimate(&self, config: &SyncConfig) -> usize;
}

/// Synchronized message header, as shown in message lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedHeader {
    /// Message UID.
    pub uid: MessageUid,
    /// Message date.
    pub date: DateTime<Utc>,
    /// Sender name.
    pub from_name: String,
    /// Sender email.
    pub from_email: String,
    /// Message subject.
    pub subject: String,
    /// Message snippet (preview text).
    pub snippet: String,
    /// Whether the message has been read.
    pub is_read: bool,
    /// Whether the message is flagged/starred.
    pub is_flagged: bool,
    /// Whether the message has attachments.
    pub has_attachments: bool,
}

impl BlockRecord for CachedHeader {
    fn uid(&self) -> MessageUid {
        self.uid
    }

    fn date(&self) -> DateTime<Utc> {
        self.date
    }

    fn size_estimate(&self, config: &SyncConfig) -> usize {
        config.header_est_size_bytes
    }
}

/// Synchronized message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedBody {
    /// Message UID.
    pub uid: MessageUid,
    /// Message date (same as the owning header's).
    pub date: DateTime<Utc>,
    /// Plain text body.
    pub body_text: Option<String>,
    /// HTML body.
    pub body_html: Option<String>,
    /// Serialized attachments info (JSON).
    pub attachments_json: Option<String>,
}

impl CachedBody {
    /// Actual size of the body parts.
    #[must_use]
    pub fn measured_size(&self) -> usize {
        [&self.body_text, &self.body_html, &self.attachments_json]
            .into_iter()
            .flatten()
            .map(String::len)
            .sum()
    }
}

impl BlockRecord for CachedBody {
    fn uid(&self) -> MessageUid {
        self.uid
    }

    fn date(&self) -> DateTime<Utc> {
        self.date
    }

    fn size_estimate(&self, _config: &SyncConfig) -> usize {
        self.measured_size()
    }
}
