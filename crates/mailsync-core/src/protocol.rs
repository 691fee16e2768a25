//! Capabilities the core requires from a protocol-specific client.
//!
//! A POP3 or IMAP backend plugs into [`crate::IncomingAccount`] by
//! implementing [`ProtocolClient`]; the core never sees wire formats,
//! handshakes or authentication mechanics.

use std::future::Future;

use crate::cache::{CachedBody, CachedHeader};
use crate::error::{ConnectError, ConnectErrorKind, ProtocolError};
use crate::jobs::{JobErrorClass, MutationJob, OperationType, classify_job_error};
use crate::model::{AccountId, DateRange, FolderId};

/// A live, authenticated protocol connection.
pub trait Connection: Send + 'static {
    /// Whether the transport has gone away underneath us.
    fn is_disconnected(&self) -> bool;

    /// Graceful logout/close.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    /// Forced teardown without talking to the server.
    fn die(&mut self);
}

/// Parameters of one time-window sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// Folder to query.
    pub folder: FolderId,
    /// Time span to query.
    pub range: DateRange,
    /// If the server reports more than this many messages, the client may
    /// skip fetching them; the core is going to bisect anyway.
    pub max_messages: u32,
}

/// What the server told us about one time window.
#[derive(Debug, Clone, Default)]
pub struct SyncBatch {
    /// Number of messages the server reports inside the window.
    pub reported_count: u32,
    /// Fetched headers (may be empty when the count was too high).
    pub headers: Vec<CachedHeader>,
    /// Fetched bodies, for protocols that download them eagerly.
    pub bodies: Vec<CachedBody>,
}

/// Protocol-specific half of an incoming account.
pub trait ProtocolClient: Send + Sync + 'static {
    /// Connection type produced by [`ProtocolClient::connect`].
    type Connection: Connection;

    /// Opens and authenticates a new connection.
    fn connect(
        &self,
        label: &str,
    ) -> impl Future<Output = Result<Self::Connection, ConnectError>> + Send;

    /// Queries one time window of a folder.
    fn issue_sync_request(
        &self,
        conn: &mut Self::Connection,
        request: &SyncRequest,
    ) -> impl Future<Output = Result<SyncBatch, ProtocolError>> + Send;

    /// Applies one mutation job on the server.
    fn perform_mutation(
        &self,
        conn: &mut Self::Connection,
        job: &MutationJob,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// Maps a failure of `op` onto the job retry policy.
    fn classify_error(&self, op: &OperationType, err: &ProtocolError) -> JobErrorClass {
        classify_job_error(op, &err.kind)
    }
}

/// Which side of the account a problem concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Receiving mail.
    Incoming,
    /// Sending mail.
    Outgoing,
}

/// Receives user-actionable account problems (e.g. bad credentials).
pub trait ProblemReporter: Send + Sync + 'static {
    /// Called once per classified user-actionable connect failure.
    fn report_account_problem(
        &self,
        account: AccountId,
        kind: ConnectErrorKind,
        direction: Direction,
    );
}

/// Reporter that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl ProblemReporter for NoopReporter {
    fn report_account_problem(
        &self,
        account: AccountId,
        kind: ConnectErrorKind,
        direction: Direction,
    ) {
        tracing::info!(%account, kind = kind.name(), ?direction, "Account problem");
    }
}
