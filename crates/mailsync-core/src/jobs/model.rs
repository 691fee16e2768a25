//! Mutation job data model and retry policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::error::ProtocolErrorKind;
use crate::model::{FolderId, MessageUid};

/// Unique identifier of a mutation job within an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of mutation to apply on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationType {
    /// Set the seen flag.
    MarkRead,
    /// Clear the seen flag.
    MarkUnread,
    /// Set the flagged/starred flag.
    Flag,
    /// Clear the flagged/starred flag.
    Unflag,
    /// Delete messages.
    Delete,
    /// Move messages to another folder.
    Move {
        /// Destination folder.
        target_folder: FolderId,
    },
    /// Download full message bodies.
    Download,
    /// Append a locally composed message (e.g. to the sent folder).
    Append,
    /// Remove every message of the folder.
    PurgeFolder,
}

impl OperationType {
    /// Short name used in logs and the outcome log.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MarkRead => "mark_read",
            Self::MarkUnread => "mark_unread",
            Self::Flag => "flag",
            Self::Unflag => "unflag",
            Self::Delete => "delete",
            Self::Move { .. } => "move",
            Self::Download => "download",
            Self::Append => "append",
            Self::PurgeFolder => "purge_folder",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to run.
    Pending,
    /// Handed to the server; an interrupted run leaves this state on disk.
    Running,
    /// Parked until `deferred_until`.
    Deferred,
    /// Applied successfully.
    Done,
    /// Given up on.
    Failed,
}

impl JobStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Deferred => "deferred",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// How a job failure feeds into the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobErrorClass {
    /// Target temporarily unavailable: defer without consuming a try.
    ResourceUnavailable,
    /// Expected, transient: retry, consuming one try.
    Transient,
    /// Not understood: retry, consuming the larger unknown-error increment.
    Unexpected,
    /// Will never succeed: fail now.
    Terminal,
}

/// Explicit error classification table for mutation jobs.
///
/// Every kind a protocol client may report is listed per operation; kinds
/// the table does not know (`Other`) count as unexpected.
#[must_use]
pub fn classify_job_error(op: &OperationType, kind: &ProtocolErrorKind) -> JobErrorClass {
    use JobErrorClass::{ResourceUnavailable, Terminal, Transient, Unexpected};
    use OperationType as Op;
    use ProtocolErrorKind as Kind;

    match (op, kind) {
        (_, Kind::FolderUnavailable) => ResourceUnavailable,
        (_, Kind::ConnectionLost | Kind::Timeout) => Transient,
        // A busy server during an upload is as good as a folder we cannot
        // write to right now.
        (Op::Append, Kind::ServerBusy) => ResourceUnavailable,
        (_, Kind::ServerBusy) => Transient,
        (
            Op::MarkRead
            | Op::MarkUnread
            | Op::Flag
            | Op::Unflag
            | Op::Delete
            | Op::Move { .. }
            | Op::Download,
            Kind::MessageNotFound,
        ) => Terminal,
        (Op::Append | Op::PurgeFolder, Kind::MessageNotFound)
        | (_, Kind::ProtocolViolation | Kind::Other(_)) => Unexpected,
    }
}

/// A durable, user-requested mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationJob {
    /// Job identifier.
    pub id: JobId,
    /// What to do.
    pub op: OperationType,
    /// Folder the targets live in; jobs of one folder run in enqueue order.
    pub folder: FolderId,
    /// Messages to operate on.
    pub target_ids: Vec<MessageUid>,
    /// Tries consumed so far.
    pub try_count: u32,
    /// Lifecycle state.
    pub status: JobStatus,
    /// When a deferred job becomes runnable again.
    pub deferred_until: Option<DateTime<Utc>>,
    /// Most recent failure, for diagnostics.
    pub last_error: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
}

impl MutationJob {
    /// Creates a pending job.
    #[must_use]
    pub fn new(
        id: JobId,
        op: OperationType,
        folder: FolderId,
        target_ids: Vec<MessageUid>,
    ) -> Self {
        Self {
            id,
            op,
            folder,
            target_ids,
            try_count: 0,
            status: JobStatus::Pending,
            deferred_until: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Ordering scope: jobs sharing a scope run strictly in enqueue order.
    #[must_use]
    pub const fn scope(&self) -> &FolderId {
        &self.folder
    }

    /// Applies a failed run to the job and returns its next status.
    ///
    /// Deferral keeps the try count; transient errors consume one try,
    /// unexpected ones the configured larger increment. Reaching the try
    /// ceiling fails the job.
    pub fn note_failure(
        &mut self,
        class: JobErrorClass,
        reason: impl Into<String>,
        config: &SyncConfig,
        now: DateTime<Utc>,
    ) -> JobStatus {
        self.last_error = Some(reason.into());
        self.deferred_until = None;
        self.status = match class {
            JobErrorClass::ResourceUnavailable => {
                self.deferred_until = chrono::Duration::from_std(config.deferred_op_delay)
                    .ok()
                    .map(|delay| now + delay);
                JobStatus::Deferred
            }
            JobErrorClass::Transient => self.consume_tries(1, config),
            JobErrorClass::Unexpected => {
                self.consume_tries(config.op_unknown_error_try_increment, config)
            }
            JobErrorClass::Terminal => JobStatus::Failed,
        };
        self.status
    }

    /// Picks a job back up after the process died while it was running.
    pub fn recover_interrupted(&mut self, config: &SyncConfig) {
        if self.status == JobStatus::Running {
            self.last_error = Some("interrupted".into());
            self.status = self.consume_tries(1, config);
        }
    }

    fn consume_tries(&mut self, increment: u32, config: &SyncConfig) -> JobStatus {
        self.try_count = self.try_count.saturating_add(increment);
        if self.try_count >= config.max_op_try_count {
            JobStatus::Failed
        } else {
            JobStatus::Pending
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn job() -> MutationJob {
        MutationJob::new(JobId(1), OperationType::MarkRead, FolderId::new("INBOX"), vec![3, 1, 2])
    }

    #[test]
    fn test_transient_failure_near_ceiling_fails() {
        let config = SyncConfig::default();
        let mut job = job();
        job.try_count = config.max_op_try_count - 1;
        let status = job.note_failure(JobErrorClass::Transient, "timeout", &config, Utc::now());
        assert_eq!(status, JobStatus::Failed);
    }

    #[test]
    fn test_transient_failure_recovers_to_pending() {
        let config = SyncConfig::default();
        let mut job = job();
        let status = job.note_failure(JobErrorClass::Transient, "timeout", &config, Utc::now());
        assert_eq!(status, JobStatus::Pending);
        assert_eq!(job.try_count, 1);
        assert_eq!(job.target_ids, vec![3, 1, 2]);
    }

    #[test]
    fn test_unexpected_costs_more_than_transient() {
        let config = SyncConfig::default();
        let mut transient = job();
        let mut unexpected = job();
        transient.note_failure(JobErrorClass::Transient, "x", &config, Utc::now());
        unexpected.note_failure(JobErrorClass::Unexpected, "x", &config, Utc::now());
        assert!(unexpected.try_count > transient.try_count);
    }

    #[test]
    fn test_deferral_keeps_try_count() {
        let config = SyncConfig::default();
        let mut job = job();
        job.try_count = 4;
        let now = Utc::now();
        let status = job.note_failure(JobErrorClass::ResourceUnavailable, "busy", &config, now);
        assert_eq!(status, JobStatus::Deferred);
        assert_eq!(job.try_count, 4);
        assert_eq!(job.deferred_until, Some(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_interrupted_run_consumes_a_try() {
        let config = SyncConfig::default();
        let mut job = job();
        job.status = JobStatus::Running;
        job.recover_interrupted(&config);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.try_count, 1);
    }

    #[test]
    fn test_classification_table() {
        let mv = OperationType::Move {
            target_folder: FolderId::new("Archive"),
        };
        assert_eq!(
            classify_job_error(&mv, &ProtocolErrorKind::FolderUnavailable),
            JobErrorClass::ResourceUnavailable
        );
        assert_eq!(
            classify_job_error(&OperationType::Delete, &ProtocolErrorKind::ConnectionLost),
            JobErrorClass::Transient
        );
        assert_eq!(
            classify_job_error(&OperationType::Download, &ProtocolErrorKind::MessageNotFound),
            JobErrorClass::Terminal
        );
        assert_eq!(
            classify_job_error(&OperationType::Append, &ProtocolErrorKind::ServerBusy),
            JobErrorClass::ResourceUnavailable
        );
        assert_eq!(
            classify_job_error(&OperationType::Flag, &ProtocolErrorKind::Other("??".into())),
            JobErrorClass::Unexpected
        );
    }

    #[test]
    fn test_serde_round_trip_keeps_operation_payload() {
        let mut job = job();
        job.op = OperationType::Move {
            target_folder: FolderId::new("Archive"),
        };
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains(r#""type":"move""#));
        let back: MutationJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
