//! Incoming mail account: connection broker, job driver and folder caches.
//!
//! [`IncomingAccount`] is protocol-agnostic. A POP3 or IMAP backend supplies
//! a [`ProtocolClient`]; the account routes every network exchange through
//! its single [`ConnectionBroker`] and keeps synchronized data in one
//! [`FolderBlockCache`] per folder.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::broker::{BrokerStatus, ConnectionBroker, ConnectionLease};
use crate::cache::{BlockRepository, CachedHeader, FolderBlockCache};
use crate::config::SharedConfig;
use crate::error::{Error, ProtocolErrorKind, Result};
use crate::jobs::{JobDriver, JobTicket, MutationJob, MutationStore, OperationType};
use crate::model::{AccountId, DateRange, FolderId, MessageUid};
use crate::protocol::{ProblemReporter, ProtocolClient, SyncRequest};
use crate::window::{SyncWindow, WindowAction, days_between, next_window};

type SharedCache = Arc<Mutex<FolderBlockCache>>;

/// What a [`IncomingAccount::sync_folder`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// The newest window was still accurate; nothing was requested.
    pub skipped: bool,
    /// Sync requests sent to the server.
    pub requests: u32,
    /// Windows thrown away because they held too many messages.
    pub bisections: u32,
    /// Headers written to the cache.
    pub headers: usize,
    /// Bodies written to the cache.
    pub bodies: usize,
    /// The pass reached the oldest permitted sync date.
    pub reached_beginning: bool,
    /// Start of the oldest window covered by this pass.
    pub synced_since: Option<DateTime<Utc>>,
}

/// Protocol-agnostic core of an incoming mail account.
pub struct IncomingAccount<C: ProtocolClient, S: MutationStore> {
    id: AccountId,
    client: Arc<C>,
    config: SharedConfig,
    broker: ConnectionBroker<C>,
    driver: JobDriver,
    store: Arc<S>,
    repository: Option<Arc<BlockRepository>>,
    folders: Mutex<HashMap<FolderId, SharedCache>>,
    folder_list_synced_at: Mutex<Option<DateTime<Utc>>>,
    purge_tx: mpsc::UnboundedSender<SharedCache>,
    purge_worker: JoinHandle<()>,
}

impl<C: ProtocolClient, S: MutationStore> IncomingAccount<C, S> {
    /// Starts an account whose folder caches live in memory only.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted mutation jobs cannot be loaded.
    pub async fn new(
        id: AccountId,
        client: Arc<C>,
        store: Arc<S>,
        reporter: Arc<dyn ProblemReporter>,
        config: SharedConfig,
    ) -> Result<Self> {
        Self::start(id, client, store, None, reporter, config).await
    }

    /// Starts an account whose folder caches are persisted in `repository`.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted mutation jobs cannot be loaded.
    pub async fn with_repository(
        id: AccountId,
        client: Arc<C>,
        store: Arc<S>,
        repository: BlockRepository,
        reporter: Arc<dyn ProblemReporter>,
        config: SharedConfig,
    ) -> Result<Self> {
        Self::start(id, client, store, Some(Arc::new(repository)), reporter, config).await
    }

    async fn start(
        id: AccountId,
        client: Arc<C>,
        store: Arc<S>,
        repository: Option<Arc<BlockRepository>>,
        reporter: Arc<dyn ProblemReporter>,
        config: SharedConfig,
    ) -> Result<Self> {
        let broker = ConnectionBroker::spawn(id, Arc::clone(&client), reporter, config.clone());
        let driver = match JobDriver::spawn(
            id,
            broker.clone(),
            Arc::clone(&client),
            Arc::clone(&store),
            config.clone(),
        )
        .await
        {
            Ok(driver) => driver,
            Err(err) => {
                broker.shutdown().await;
                return Err(err);
            }
        };

        let (purge_tx, purge_rx) = mpsc::unbounded_channel();
        let purge_worker = tokio::spawn(run_purges(id, purge_rx, repository.clone()));
        tracing::info!(account = %id, persistent = repository.is_some(), "Incoming account started");

        Ok(Self {
            id,
            client,
            config,
            broker,
            driver,
            store,
            repository,
            folders: Mutex::new(HashMap::new()),
            folder_list_synced_at: Mutex::new(None),
            purge_tx,
            purge_worker,
        })
    }

    /// Account id.
    #[must_use]
    pub const fn id(&self) -> AccountId {
        self.id
    }

    /// Live configuration; changes apply to the next decision.
    #[must_use]
    pub const fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// The mutation store backing the job driver.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Leases the account's connection, queued behind earlier requesters.
    ///
    /// # Errors
    ///
    /// Returns the connect error, or [`Error::Shutdown`].
    pub async fn with_connection(&self, label: &str) -> Result<ConnectionLease<C::Connection>> {
        self.broker.with_connection(label).await
    }

    /// Re-authenticates from scratch to validate the credentials.
    ///
    /// # Errors
    ///
    /// Returns the connect error, or [`Error::Shutdown`].
    pub async fn check_account(&self) -> Result<()> {
        self.broker.check_account().await
    }

    /// Broker bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] after shutdown.
    pub async fn connection_status(&self) -> Result<BrokerStatus> {
        self.broker.status().await
    }

    /// Durably queues a mutation for the server.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the job could not be persisted, or
    /// [`Error::Shutdown`].
    pub async fn queue_mutation(
        &self,
        op: OperationType,
        folder: FolderId,
        targets: Vec<MessageUid>,
    ) -> Result<JobTicket> {
        self.driver.enqueue(op, folder, targets).await
    }

    /// Jobs still waiting to be applied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] after shutdown.
    pub async fn pending_mutations(&self) -> Result<Vec<MutationJob>> {
        self.driver.jobs().await
    }

    /// Synchronizes the newest messages of a folder up to `end`.
    ///
    /// Starting with the initial window ending at `end`, windows are
    /// requested further and further back, each sized by the window sizer,
    /// until `initial_fill_size` headers were seen or the oldest sync date
    /// is reached. Windows that are still accurate are not requested. The
    /// whole pass is skipped when the newest window is accurate.
    ///
    /// # Errors
    ///
    /// Returns the connect or protocol error that ended the pass; windows
    /// processed before it stay cached.
    pub async fn sync_folder(
        &self,
        folder: &FolderId,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<SyncReport> {
        let config = self.config.current();
        let cache = self.folder_cache(folder).await?;
        let mut window = SyncWindow::initial(end, &config);
        let mut report = SyncReport::default();

        if !cache.lock().await.needs_refresh(window.range(), now) {
            tracing::debug!(account = %self.id, %folder, "Folder still accurate, skipping sync");
            report.skipped = true;
            return Ok(report);
        }

        let mut lease = self
            .broker
            .with_connection(&format!("sync:{folder}"))
            .await?;
        let mut seen = 0;

        let result = loop {
            if window.days <= 0.0 {
                report.reached_beginning = true;
                break Ok(());
            }

            let accurate = !cache.lock().await.needs_refresh(window.range(), now);
            let next_days = if accurate {
                let cached = cache.lock().await.headers_in(window.range()).len();
                seen += cached;
                window.days
            } else {
                let request = SyncRequest {
                    folder: folder.clone(),
                    range: window.range(),
                    max_messages: config.too_many_messages,
                };
                report.requests += 1;
                let batch = match self.client.issue_sync_request(&mut *lease, &request).await {
                    Ok(batch) => batch,
                    Err(err) => {
                        if err.kind == ProtocolErrorKind::ConnectionLost {
                            lease.discard();
                        }
                        break Err(Error::Protocol(err));
                    }
                };

                let advice = next_window(&config, window, batch.reported_count);
                if advice.action == WindowAction::Bisect {
                    report.bisections += 1;
                    window = SyncWindow::new(window.end, advice.days);
                    continue;
                }

                let mut guard = cache.lock().await;
                seen += batch.headers.len();
                report.headers += batch.headers.len();
                report.bodies += batch.bodies.len();
                for header in batch.headers {
                    guard.add_header(header);
                }
                for body in batch.bodies {
                    guard.add_body(body);
                }
                guard.note_synced(window.range(), now);
                advice.days
            };

            report.synced_since = Some(window.start());
            if window.start() <= config.oldest_sync_date {
                report.reached_beginning = true;
                break Ok(());
            }
            if seen >= config.initial_fill_size {
                break Ok(());
            }
            window = window.older(next_days);
            // Never step past the oldest permitted date.
            window.days = window
                .days
                .min(days_between(config.oldest_sync_date, window.end));
        };
        drop(lease);

        self.persist(folder, &cache).await;
        tracing::info!(
            account = %self.id,
            %folder,
            requests = report.requests,
            bisections = report.bisections,
            headers = report.headers,
            reached_beginning = report.reached_beginning,
            ok = result.is_ok(),
            "Sync pass finished"
        );
        result.map(|()| report)
    }

    /// Cached headers of a folder dated inside `range`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder's cache cannot be loaded.
    pub async fn cached_headers(
        &self,
        folder: &FolderId,
        range: DateRange,
    ) -> Result<Vec<CachedHeader>> {
        let cache = self.folder_cache(folder).await?;
        let guard = cache.lock().await;
        Ok(guard.headers_in(range).into_iter().cloned().collect())
    }

    /// Shared handle to a folder's cache, loading it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted cache cannot be loaded.
    pub async fn folder_cache(&self, folder: &FolderId) -> Result<SharedCache> {
        let mut folders = self.folders.lock().await;
        if let Some(cache) = folders.get(folder) {
            return Ok(Arc::clone(cache));
        }
        let cache = match &self.repository {
            Some(repo) => repo.load(folder, self.config.clone()).await?,
            None => FolderBlockCache::new(folder.clone(), self.config.clone()),
        };
        let purge_queued = cache.purge_queued();
        let cache = Arc::new(Mutex::new(cache));
        folders.insert(folder.clone(), Arc::clone(&cache));
        if purge_queued {
            let _ = self.purge_tx.send(Arc::clone(&cache));
        }
        Ok(cache)
    }

    /// Drops a folder's cache, e.g. after the folder was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted data cannot be deleted.
    pub async fn forget_folder(&self, folder: &FolderId) -> Result<()> {
        if let Some(cache) = self.folders.lock().await.remove(folder) {
            cache.lock().await.clear();
        }
        if let Some(repo) = &self.repository {
            repo.clear_folder(folder).await?;
        }
        tracing::info!(account = %self.id, %folder, "Forgot folder");
        Ok(())
    }

    /// Whether the folder list should be synchronized again.
    pub async fn folder_list_sync_due(&self, now: DateTime<Utc>) -> bool {
        let last = *self.folder_list_synced_at.lock().await;
        self.config.current().folder_list_sync_due(last, now)
    }

    /// Records a completed folder list sync.
    pub async fn note_folder_list_synced(&self, at: DateTime<Utc>) {
        *self.folder_list_synced_at.lock().await = Some(at);
    }

    /// Stops the job driver, the broker and the purge worker.
    ///
    /// Pending timers are cancelled, the connection is torn down and every
    /// waiter fails with [`Error::Shutdown`]. Idempotent.
    pub async fn shutdown(&self) {
        tracing::info!(account = %self.id, "Shutting down incoming account");
        self.driver.shutdown().await;
        self.broker.shutdown().await;
        self.purge_worker.abort();
    }

    async fn persist(&self, folder: &FolderId, cache: &SharedCache) {
        let mut guard = cache.lock().await;
        if let Some(repo) = &self.repository {
            if let Err(err) = repo.save(&mut guard).await {
                tracing::warn!(account = %self.id, %folder, ?err, "Could not persist folder cache");
            }
        }
        if guard.purge_queued() {
            let _ = self.purge_tx.send(Arc::clone(cache));
        }
    }
}

impl<C: ProtocolClient, S: MutationStore> Drop for IncomingAccount<C, S> {
    fn drop(&mut self) {
        self.purge_worker.abort();
    }
}

impl<C: ProtocolClient, S: MutationStore> std::fmt::Debug for IncomingAccount<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingAccount")
            .field("id", &self.id)
            .field("broker", &self.broker)
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}

/// Runs queued purge evaluations off the sync path.
async fn run_purges(
    account: AccountId,
    mut rx: mpsc::UnboundedReceiver<SharedCache>,
    repository: Option<Arc<BlockRepository>>,
) {
    while let Some(cache) = rx.recv().await {
        let mut guard = cache.lock().await;
        if !guard.purge_queued() {
            continue;
        }
        let report = guard.purge(Utc::now());
        if report.is_empty() {
            continue;
        }
        if let Some(repo) = &repository {
            if let Err(err) = repo.save(&mut guard).await {
                tracing::warn!(%account, folder = %guard.folder(), ?err, "Could not persist purge");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::config::SyncConfig;
    use crate::error::ProtocolError;
    use crate::jobs::JobId;
    use crate::protocol::{NoopReporter, SyncBatch};
    use crate::testing::{MemoryStore, MockClient};

    fn end() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn inbox() -> FolderId {
        FolderId::new("INBOX")
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn header_at(date: DateTime<Utc>) -> CachedHeader {
        CachedHeader {
            uid: (date.timestamp() / 60) as u32,
            date,
            from_name: "Cy".into(),
            from_email: "cy@example.com".into(),
            subject: "hello".into(),
            snippet: String::new(),
            is_read: false,
            is_flagged: false,
            has_attachments: false,
        }
    }

    /// `count` headers spread evenly across the requested window.
    fn batch(range: DateRange, count: i32) -> SyncBatch {
        let step = (range.end - range.start) / (count + 1);
        SyncBatch {
            reported_count: count.unsigned_abs(),
            headers: (1..=count).map(|i| header_at(range.start + step * i)).collect(),
            bodies: Vec::new(),
        }
    }

    async fn account(
        config: SyncConfig,
    ) -> (IncomingAccount<MockClient, MemoryStore>, Arc<MockClient>) {
        let client = Arc::new(MockClient::new());
        let account = IncomingAccount::new(
            AccountId(1),
            Arc::clone(&client),
            Arc::new(MemoryStore::default()),
            Arc::new(NoopReporter),
            SharedConfig::new(config),
        )
        .await
        .unwrap();
        (account, client)
    }

    #[tokio::test]
    async fn test_sync_fills_then_skips_accurate_folder() {
        let (account, client) = account(SyncConfig::default()).await;
        client.set_sync_handler(|req| Ok(batch(req.range, 10)));

        let report = account.sync_folder(&inbox(), end(), end()).await.unwrap();
        assert_eq!(report.requests, 2);
        assert_eq!(report.headers, 20);
        assert!(!report.reached_beginning);
        assert_eq!(report.synced_since, Some(end() - Duration::days(6)));

        let requests = client.sync_requests();
        assert_eq!(requests[0].range.end, end());
        assert_eq!(requests[1].range.end, requests[0].range.start);

        let again = account
            .sync_folder(&inbox(), end(), end() + Duration::minutes(5))
            .await
            .unwrap();
        assert!(again.skipped);
        assert_eq!(client.sync_requests().len(), 2);

        let cached = account
            .cached_headers(&inbox(), DateRange::new(end() - Duration::days(6), end()))
            .await
            .unwrap();
        assert_eq!(cached.len(), 20);
        assert!(cached[0].date > cached[19].date);
    }

    #[tokio::test]
    async fn test_dense_window_is_bisected() {
        let (account, client) = account(SyncConfig::default()).await;
        client.set_sync_handler(|req| {
            if req.range.end - req.range.start > Duration::days(1) {
                Ok(SyncBatch {
                    reported_count: 5000,
                    ..SyncBatch::default()
                })
            } else {
                Ok(batch(req.range, 20))
            }
        });

        let report = account.sync_folder(&inbox(), end(), end()).await.unwrap();
        assert_eq!(report.bisections, 1);
        assert_eq!(report.requests, 2);
        assert_eq!(report.headers, 20);

        let requests = client.sync_requests();
        assert_eq!(requests[1].range.end, end());
        assert!(requests[1].range.end - requests[1].range.start <= Duration::hours(1));
        assert_eq!(requests[1].max_messages, 2000);
    }

    #[tokio::test]
    async fn test_empty_folder_grows_to_oldest_date() {
        let config = SyncConfig {
            oldest_sync_date: end() - Duration::days(10),
            ..SyncConfig::default()
        };
        let (account, client) = account(config).await;

        let report = account.sync_folder(&inbox(), end(), end()).await.unwrap();
        assert_eq!(report.requests, 3);
        assert!(report.reached_beginning);
        assert_eq!(report.synced_since, Some(end() - Duration::days(10)));

        let requests = client.sync_requests();
        assert_eq!(requests[2].range.start, end() - Duration::days(10));

        let cache = account.folder_cache(&inbox()).await.unwrap();
        let whole = DateRange::new(end() - Duration::days(10), end());
        assert!(!cache.lock().await.needs_refresh(whole, end()));
    }

    #[tokio::test]
    async fn test_lost_connection_fails_pass_and_reconnects() {
        let (account, client) = account(SyncConfig::default()).await;
        client.set_sync_handler(|_| {
            Err(ProtocolError::new(ProtocolErrorKind::ConnectionLost, "eof"))
        });

        let err = account.sync_folder(&inbox(), end(), end()).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let lease = account.with_connection("probe").await.unwrap();
        assert_eq!(lease.id, 2);
        assert_eq!(client.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_forget_folder_drops_cached_data() {
        let (account, client) = account(SyncConfig::default()).await;
        client.set_sync_handler(|req| Ok(batch(req.range, 20)));
        account.sync_folder(&inbox(), end(), end()).await.unwrap();

        account.forget_folder(&inbox()).await.unwrap();
        let range = DateRange::new(end() - Duration::days(3), end());
        assert!(account.cached_headers(&inbox(), range).await.unwrap().is_empty());

        let report = account.sync_folder(&inbox(), end(), end()).await.unwrap();
        assert!(!report.skipped);
    }

    #[tokio::test]
    async fn test_persistent_account_saves_synced_blocks() {
        let client = Arc::new(MockClient::new());
        client.set_sync_handler(|req| Ok(batch(req.range, 20)));
        let account = IncomingAccount::with_repository(
            AccountId(3),
            Arc::clone(&client),
            Arc::new(MemoryStore::default()),
            BlockRepository::in_memory(AccountId(3)).await.unwrap(),
            Arc::new(NoopReporter),
            SharedConfig::default(),
        )
        .await
        .unwrap();

        account.sync_folder(&inbox(), end(), end()).await.unwrap();
        let cache = account.folder_cache(&inbox()).await.unwrap();
        assert!(cache.lock().await.take_changes().is_empty());
    }

    #[tokio::test]
    async fn test_mutations_and_shutdown() {
        let (account, client) = account(SyncConfig::default()).await;
        let ticket = account
            .queue_mutation(OperationType::MarkRead, inbox(), vec![4, 5])
            .await
            .unwrap();
        ticket.outcome().await.unwrap();
        assert_eq!(client.performed(), vec![(JobId(1), vec![4, 5])]);
        assert!(account.pending_mutations().await.unwrap().is_empty());

        account.shutdown().await;
        account.shutdown().await;
        assert!(account.with_connection("late").await.unwrap_err().is_shutdown());
        assert!(
            account
                .queue_mutation(OperationType::Flag, inbox(), vec![1])
                .await
                .unwrap_err()
                .is_shutdown()
        );
    }

    #[tokio::test]
    async fn test_folder_list_sync_interval() {
        let (account, _client) = account(SyncConfig::default()).await;
        assert!(account.folder_list_sync_due(end()).await);
        account.note_folder_list_synced(end()).await;
        assert!(!account.folder_list_sync_due(end() + Duration::hours(1)).await);
        assert!(account.folder_list_sync_due(end() + Duration::days(2)).await);
    }
}
