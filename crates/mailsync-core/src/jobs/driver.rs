//! Drains the durable mutation queue through the connection broker.
//!
//! One worker task owns the queue. Jobs of one folder run strictly in
//! enqueue order; since the broker hands out a single connection, jobs run
//! one at a time. Every state change is written to the [`MutationStore`]
//! before the in-memory queue reflects it.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::model::{JobErrorClass, JobId, JobStatus, MutationJob, OperationType};
use super::store::MutationStore;
use crate::broker::ConnectionBroker;
use crate::config::{SharedConfig, SyncConfig};
use crate::error::{Error, ProtocolErrorKind, Result};
use crate::model::{AccountId, FolderId, MessageUid};
use crate::protocol::ProtocolClient;

/// Completion handle for an enqueued job.
#[derive(Debug)]
pub struct JobTicket {
    id: JobId,
    rx: oneshot::Receiver<Result<()>>,
}

impl JobTicket {
    /// Id of the job.
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Waits until the job is done or permanently failed.
    ///
    /// # Errors
    ///
    /// [`Error::JobFailed`] if the job was given up on, [`Error::Shutdown`]
    /// if the driver stopped first (the job stays queued on disk).
    pub async fn outcome(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(Error::Shutdown))
    }
}

enum Command {
    Enqueue {
        op: OperationType,
        folder: FolderId,
        targets: Vec<MessageUid>,
        reply: oneshot::Sender<Result<JobTicket>>,
    },
    Jobs {
        reply: oneshot::Sender<Vec<MutationJob>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to an account's job driver.
#[derive(Clone)]
pub struct JobDriver {
    account: AccountId,
    tx: mpsc::UnboundedSender<Command>,
    stop: Arc<watch::Sender<bool>>,
}

impl JobDriver {
    /// Loads persisted jobs and starts draining them.
    ///
    /// A job found `Running` was interrupted by an unclean shutdown: it
    /// resumes as pending with one try consumed. Jobs found `Done` or
    /// `Failed` only had their removal interrupted and are not re-run.
    /// New ids continue past the highest id the store has ever held.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted jobs cannot be loaded.
    pub async fn spawn<C, S>(
        account: AccountId,
        broker: ConnectionBroker<C>,
        client: Arc<C>,
        store: Arc<S>,
        config: SharedConfig,
    ) -> Result<Self>
    where
        C: ProtocolClient,
        S: MutationStore,
    {
        let snapshot = config.current();
        let mut entries = VecDeque::new();
        let mut next_id = store.last_job_id().await?.map_or(1, |id| id.0 + 1);

        for mut job in store.load_all().await? {
            next_id = next_id.max(job.id.0 + 1);
            let finished = match job.status {
                JobStatus::Done => Some(Finished::Done),
                JobStatus::Failed => Some(Finished::Failed {
                    reason: job.last_error.clone().unwrap_or_default(),
                    recorded: true,
                }),
                JobStatus::Running => {
                    job.recover_interrupted(&snapshot);
                    if job.status == JobStatus::Failed {
                        Some(Finished::Failed {
                            reason: "interrupted too often".into(),
                            recorded: false,
                        })
                    } else {
                        if let Err(err) = store.put(&job).await {
                            tracing::warn!(%account, job = %job.id, ?err, "Could not persist recovered job");
                        }
                        None
                    }
                }
                JobStatus::Pending | JobStatus::Deferred => None,
            };
            let ready_at = job.deferred_until.map(|at| {
                Instant::now() + (at - Utc::now()).to_std().unwrap_or_default()
            });
            entries.push_back(Entry {
                job,
                waiter: None,
                ready_at,
                finished,
            });
        }
        tracing::info!(%account, resumed = entries.len(), "Starting job driver");

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);
        let worker = Worker {
            account,
            broker,
            client,
            store,
            config,
            entries,
            next_id,
            hold_until: None,
            stop: stop_rx,
            stopping: false,
            shutdown_replies: Vec::new(),
        };
        tokio::spawn(worker.run(rx));

        Ok(Self {
            account,
            tx,
            stop: Arc::new(stop),
        })
    }

    /// Account this driver serves.
    #[must_use]
    pub const fn account(&self) -> AccountId {
        self.account
    }

    /// Durably queues a mutation.
    ///
    /// Returns once the job is persisted. May wait for the job currently
    /// talking to the server to finish.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the job could not be persisted, or
    /// [`Error::Shutdown`] if the driver is gone.
    pub async fn enqueue(
        &self,
        op: OperationType,
        folder: FolderId,
        targets: Vec<MessageUid>,
    ) -> Result<JobTicket> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Enqueue {
                op,
                folder,
                targets,
                reply,
            })
            .map_err(|_| Error::Shutdown)?;
        rx.await.unwrap_or(Err(Error::Shutdown))
    }

    /// Snapshot of the active queue in enqueue order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the driver is gone.
    pub async fn jobs(&self) -> Result<Vec<MutationJob>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Jobs { reply })
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Stops draining, cancels the deferral timer and fails every
    /// outstanding ticket with [`Error::Shutdown`]. Idempotent.
    ///
    /// Durable job state is left alone so the queue resumes on restart.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Whether the driver worker has stopped.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for JobDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDriver")
            .field("account", &self.account)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

/// Terminal outcome whose removal from the store is still outstanding.
enum Finished {
    Done,
    Failed { reason: String, recorded: bool },
}

struct Entry {
    job: MutationJob,
    waiter: Option<oneshot::Sender<Result<()>>>,
    ready_at: Option<Instant>,
    finished: Option<Finished>,
}

impl Entry {
    fn is_ready(&self, now: Instant) -> bool {
        self.ready_at.is_none_or(|at| at <= now)
    }
}

enum Outcome {
    Done,
    Failed {
        class: JobErrorClass,
        reason: String,
        connection: bool,
    },
    Interrupted,
}

struct Worker<C: ProtocolClient, S: MutationStore> {
    account: AccountId,
    broker: ConnectionBroker<C>,
    client: Arc<C>,
    store: Arc<S>,
    config: SharedConfig,
    entries: VecDeque<Entry>,
    next_id: i64,
    /// Set after a connect failure; no job runs before it passes.
    hold_until: Option<Instant>,
    stop: watch::Receiver<bool>,
    stopping: bool,
    shutdown_replies: Vec<oneshot::Sender<()>>,
}

impl<C: ProtocolClient, S: MutationStore> Worker<C, S> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            loop {
                match rx.try_recv() {
                    Ok(command) => self.handle(command).await,
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.stopping = true;
                        break;
                    }
                }
            }
            if self.stopping {
                break;
            }

            let now = Instant::now();
            if let Some(idx) = self.next_action(now) {
                self.step(idx).await;
                continue;
            }

            let command = match self.next_wake(now) {
                Some(at) => tokio::select! {
                    command = rx.recv() => command,
                    () = tokio::time::sleep_until(at) => continue,
                },
                None => rx.recv().await,
            };
            match command {
                Some(command) => self.handle(command).await,
                None => break,
            }
        }
        self.stop_with(rx);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { reply, .. } if self.stopping => {
                let _ = reply.send(Err(Error::Shutdown));
            }
            Command::Enqueue {
                op,
                folder,
                targets,
                reply,
            } => {
                let id = JobId(self.next_id);
                self.next_id += 1;
                let job = MutationJob::new(id, op, folder, targets);
                if let Err(err) = self.store.put(&job).await {
                    tracing::error!(account = %self.account, job = %id, ?err, "Could not persist new job");
                    let _ = reply.send(Err(err));
                    return;
                }
                tracing::debug!(account = %self.account, job = %id, op = %job.op, folder = %job.folder, "Job queued");
                let (waiter, rx) = oneshot::channel();
                self.entries.push_back(Entry {
                    job,
                    waiter: Some(waiter),
                    ready_at: None,
                    finished: None,
                });
                let _ = reply.send(Ok(JobTicket { id, rx }));
            }
            Command::Jobs { reply } => {
                let _ = reply.send(self.entries.iter().map(|e| e.job.clone()).collect());
            }
            Command::Shutdown { reply } => {
                self.stopping = true;
                self.shutdown_replies.push(reply);
            }
        }
    }

    /// First entry that can make progress now.
    ///
    /// A job that is not ready (deferred or backing off after a storage
    /// failure) blocks every later job of its folder.
    fn next_action(&self, now: Instant) -> Option<usize> {
        let held = self.hold_until.is_some_and(|at| at > now);
        let mut blocked: HashSet<&FolderId> = HashSet::new();

        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.finished.is_some() {
                if entry.is_ready(now) {
                    return Some(idx);
                }
                continue;
            }
            let scope = entry.job.scope();
            if blocked.contains(scope) {
                continue;
            }
            if held || !entry.is_ready(now) {
                blocked.insert(scope);
                continue;
            }
            return Some(idx);
        }
        None
    }

    fn next_wake(&self, now: Instant) -> Option<Instant> {
        self.entries
            .iter()
            .filter_map(|entry| entry.ready_at)
            .chain(self.hold_until)
            .filter(|at| *at > now)
            .min()
    }

    async fn step(&mut self, idx: usize) {
        if self.entries[idx].finished.is_some() {
            self.settle(idx).await;
        } else {
            self.execute(idx).await;
        }
    }

    async fn execute(&mut self, idx: usize) {
        let config = self.config.current();
        let previous = self.entries[idx].job.clone();

        let mut running = previous.clone();
        running.status = JobStatus::Running;
        running.deferred_until = None;
        if let Err(err) = self.store.put(&running).await {
            tracing::error!(account = %self.account, job = %running.id, ?err, "Could not persist job start");
            self.entries[idx].ready_at = Some(Instant::now() + config.deferred_op_delay);
            return;
        }
        self.entries[idx].job = running.clone();
        self.entries[idx].ready_at = None;

        tracing::debug!(
            account = %self.account,
            job = %running.id,
            op = %running.op,
            attempt = running.try_count + 1,
            "Running job"
        );
        let attempt = perform(
            self.broker.clone(),
            Arc::clone(&self.client),
            running.clone(),
        );
        let outcome = tokio::select! {
            outcome = attempt => outcome,
            () = stop_requested(&mut self.stop) => {
                // Durable state stays `Running`; a restart retries with a try consumed.
                self.stopping = true;
                return;
            }
        };

        match outcome {
            Outcome::Done => {
                tracing::info!(account = %self.account, job = %running.id, op = %running.op, "Job done");
                let entry = &mut self.entries[idx];
                entry.job.status = JobStatus::Done;
                entry.finished = Some(Finished::Done);
                self.settle(idx).await;
            }
            Outcome::Interrupted => {
                let entry = &mut self.entries[idx];
                entry.job = previous;
                entry.ready_at = Some(Instant::now() + config.deferred_op_delay);
            }
            Outcome::Failed {
                class,
                reason,
                connection,
            } => {
                if connection {
                    self.hold_until = Some(Instant::now() + config.deferred_op_delay);
                }
                self.note_failure(idx, previous, class, reason, &config).await;
            }
        }
    }

    async fn note_failure(
        &mut self,
        idx: usize,
        previous: MutationJob,
        class: JobErrorClass,
        reason: String,
        config: &SyncConfig,
    ) {
        let mut next = self.entries[idx].job.clone();
        let status = next.note_failure(class, reason.clone(), config, Utc::now());
        if class == JobErrorClass::Unexpected {
            tracing::warn!(account = %self.account, job = %next.id, op = %next.op, %reason, "Unexpected job error");
        } else {
            tracing::debug!(account = %self.account, job = %next.id, ?class, ?status, %reason, "Job attempt failed");
        }

        if status == JobStatus::Failed {
            tracing::warn!(account = %self.account, job = %next.id, op = %next.op, tries = next.try_count, %reason, "Giving up on job");
            let entry = &mut self.entries[idx];
            entry.job = next;
            entry.finished = Some(Finished::Failed {
                reason,
                recorded: false,
            });
            self.settle(idx).await;
            return;
        }

        let entry = &mut self.entries[idx];
        match self.store.put(&next).await {
            Ok(()) => {
                entry.ready_at = (status == JobStatus::Deferred)
                    .then(|| Instant::now() + config.deferred_op_delay);
                entry.job = next;
            }
            Err(err) => {
                tracing::error!(account = %self.account, job = %next.id, ?err, "Could not persist job failure");
                entry.job = previous;
                entry.ready_at = Some(Instant::now() + config.deferred_op_delay);
            }
        }
    }

    /// Makes a terminal outcome durable and removes the job.
    ///
    /// On storage failure the job stays queued as finished (never re-run)
    /// and settling is retried after the deferral delay.
    async fn settle(&mut self, idx: usize) {
        let delay = self.config.current().deferred_op_delay;
        let entry = &mut self.entries[idx];

        if let Some(Finished::Failed { reason, recorded }) = entry.finished.as_mut() {
            if !*recorded {
                if let Err(err) = self.store.record_failure(&entry.job, reason).await {
                    tracing::error!(account = %self.account, job = %entry.job.id, ?err, "Could not record job failure");
                    entry.ready_at = Some(Instant::now() + delay);
                    return;
                }
                *recorded = true;
            }
        }

        if let Err(err) = self.store.delete(entry.job.id).await {
            tracing::error!(account = %self.account, job = %entry.job.id, ?err, "Could not remove finished job");
            // Best effort: a durable terminal status keeps a restart from re-running it.
            if let Err(err) = self.store.put(&entry.job).await {
                tracing::debug!(account = %self.account, job = %entry.job.id, ?err, "Terminal status not persisted either");
            }
            entry.ready_at = Some(Instant::now() + delay);
            return;
        }

        let Some(entry) = self.entries.remove(idx) else {
            return;
        };
        let result = match entry.finished {
            Some(Finished::Failed { reason, .. }) => Err(Error::JobFailed {
                id: entry.job.id,
                reason,
            }),
            _ => Ok(()),
        };
        if let Some(waiter) = entry.waiter {
            let _ = waiter.send(result);
        }
    }

    fn stop_with(&mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        rx.close();
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::Enqueue { reply, .. } => {
                    let _ = reply.send(Err(Error::Shutdown));
                }
                Command::Jobs { reply } => {
                    let _ = reply.send(self.entries.iter().map(|e| e.job.clone()).collect());
                }
                Command::Shutdown { reply } => self.shutdown_replies.push(reply),
            }
        }

        let outstanding = self.entries.len();
        for entry in self.entries.drain(..) {
            if let Some(waiter) = entry.waiter {
                let _ = waiter.send(Err(Error::Shutdown));
            }
        }
        tracing::info!(account = %self.account, outstanding, "Job driver stopped");
        for reply in self.shutdown_replies.drain(..) {
            let _ = reply.send(());
        }
    }
}

/// Resolves once shutdown was requested or every driver handle is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

/// One attempt at a job: lease the connection, apply, classify.
async fn perform<C: ProtocolClient>(
    broker: ConnectionBroker<C>,
    client: Arc<C>,
    job: MutationJob,
) -> Outcome {
    let label = format!("job:{}:{}", job.op, job.id);
    let mut lease = match broker.with_connection(&label).await {
        Ok(lease) => lease,
        Err(Error::Shutdown) => return Outcome::Interrupted,
        Err(Error::Connect(err)) => {
            // Unreachable servers defer the job; hard connect failures cost a try.
            let class = if err.reachable {
                JobErrorClass::ResourceUnavailable
            } else {
                JobErrorClass::Transient
            };
            return Outcome::Failed {
                class,
                reason: err.to_string(),
                connection: true,
            };
        }
        Err(err) => {
            return Outcome::Failed {
                class: JobErrorClass::Unexpected,
                reason: err.to_string(),
                connection: true,
            };
        }
    };

    match client.perform_mutation(&mut lease, &job).await {
        Ok(()) => Outcome::Done,
        Err(err) => {
            if err.kind == ProtocolErrorKind::ConnectionLost {
                lease.discard();
            }
            Outcome::Failed {
                class: client.classify_error(&job.op, &err),
                reason: err.to_string(),
                connection: false,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::SyncConfig;
    use crate::error::{ConnectError, ProtocolError};
    use crate::protocol::NoopReporter;
    use crate::testing::{MemoryStore, MockClient};

    struct Harness {
        client: Arc<MockClient>,
        store: Arc<MemoryStore>,
        broker: ConnectionBroker<MockClient>,
        driver: JobDriver,
    }

    async fn harness_with(store: MemoryStore) -> Harness {
        let config = SharedConfig::new(SyncConfig::default());
        let client = Arc::new(MockClient::new());
        let store = Arc::new(store);
        let broker = ConnectionBroker::spawn(
            AccountId(1),
            Arc::clone(&client),
            Arc::new(NoopReporter),
            config.clone(),
        );
        let driver = JobDriver::spawn(
            AccountId(1),
            broker.clone(),
            Arc::clone(&client),
            Arc::clone(&store),
            config,
        )
        .await
        .unwrap();
        Harness {
            client,
            store,
            broker,
            driver,
        }
    }

    async fn harness() -> Harness {
        harness_with(MemoryStore::default()).await
    }

    fn inbox() -> FolderId {
        FolderId::new("INBOX")
    }

    fn not_available() -> ProtocolError {
        ProtocolError::new(ProtocolErrorKind::FolderUnavailable, "folder busy")
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_and_is_removed() {
        let h = harness().await;
        let ticket = h
            .driver
            .enqueue(OperationType::MarkRead, inbox(), vec![4, 2])
            .await
            .unwrap();
        let id = ticket.id();
        ticket.outcome().await.unwrap();

        assert_eq!(h.client.performed(), vec![(id, vec![4, 2])]);
        assert!(h.store.jobs().is_empty());
        assert!(h.driver.jobs().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_job_blocks_its_folder_only() {
        let h = harness().await;
        h.client.push_mutation_result(Err(not_available()));

        let a = h.driver.enqueue(OperationType::Flag, inbox(), vec![1]).await.unwrap();
        let b = h.driver.enqueue(OperationType::Delete, inbox(), vec![2]).await.unwrap();
        let c = h
            .driver
            .enqueue(OperationType::MarkRead, FolderId::new("Sent"), vec![3])
            .await
            .unwrap();
        let (a_id, b_id, c_id) = (a.id(), b.id(), c.id());

        c.outcome().await.unwrap();
        let queued = h.driver.jobs().await.unwrap();
        assert_eq!(queued[0].status, JobStatus::Deferred);
        assert_eq!(queued[0].try_count, 0);

        a.outcome().await.unwrap();
        b.outcome().await.unwrap();
        let order: Vec<_> = h.client.performed().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![c_id, a_id, b_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let h = harness().await;
        h.client.push_mutation_result(Err(ProtocolError::new(
            ProtocolErrorKind::ConnectionLost,
            "reset",
        )));
        let ticket = h.driver.enqueue(OperationType::Unflag, inbox(), vec![9]).await.unwrap();
        ticket.outcome().await.unwrap();

        assert_eq!(h.client.performed().len(), 1);
        // The connection that dropped was not handed out again.
        assert!(h.client.was_killed(1));
        assert_eq!(h.client.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_is_recorded() {
        let h = harness().await;
        h.client.push_mutation_result(Err(ProtocolError::new(
            ProtocolErrorKind::MessageNotFound,
            "gone",
        )));
        let ticket = h.driver.enqueue(OperationType::Download, inbox(), vec![5]).await.unwrap();
        let id = ticket.id();

        let err = ticket.outcome().await.unwrap_err();
        assert!(matches!(err, Error::JobFailed { id: failed, .. } if failed == id));
        assert!(h.store.jobs().is_empty());
        assert_eq!(h.store.failures().len(), 1);
        assert_eq!(h.store.failures()[0].0.id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_errors_exhaust_tries_quickly() {
        let h = harness().await;
        for _ in 0..2 {
            h.client.push_mutation_result(Err(ProtocolError::new(
                ProtocolErrorKind::Other("weird".into()),
                "??",
            )));
        }
        let ticket = h.driver.enqueue(OperationType::Append, inbox(), vec![]).await.unwrap();
        assert!(matches!(ticket.outcome().await, Err(Error::JobFailed { .. })));
        assert!(h.client.performed().is_empty());
        assert_eq!(h.store.failures()[0].0.try_count, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_job_resumes_with_try_consumed() {
        let store = MemoryStore::default();
        let mut job = MutationJob::new(JobId(7), OperationType::Delete, inbox(), vec![1, 2]);
        job.status = JobStatus::Running;
        store.seed(job);

        let h = harness_with(store).await;
        let ticket = h.driver.enqueue(OperationType::Flag, inbox(), vec![3]).await.unwrap();
        assert_eq!(ticket.id(), JobId(8));
        ticket.outcome().await.unwrap();

        let performed = h.client.performed();
        assert_eq!(performed[0], (JobId(7), vec![1, 2]));
        assert_eq!(performed[1].0, JobId(8));
        assert!(h.store.jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_job_on_disk_is_not_rerun() {
        let store = MemoryStore::default();
        let mut job = MutationJob::new(JobId(3), OperationType::Delete, inbox(), vec![1]);
        job.status = JobStatus::Done;
        store.seed(job);

        let h = harness_with(store).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.client.performed().is_empty());
        assert!(h.store.jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_removal_never_reruns_job() {
        let h = harness().await;
        h.store.fail_deletes(true);
        let ticket = h.driver.enqueue(OperationType::MarkRead, inbox(), vec![1]).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.client.performed().len(), 1);
        assert_eq!(h.store.jobs()[0].status, JobStatus::Done);

        h.store.fail_deletes(false);
        ticket.outcome().await.unwrap();
        assert_eq!(h.client.performed().len(), 1);
        assert!(h.store.jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_continue_past_failed_jobs_after_restart() {
        let store = MemoryStore::default();
        let failed = MutationJob::new(JobId(7), OperationType::Flag, inbox(), vec![1]);
        store.record_failure(&failed, "message-not-found").await.unwrap();
        assert!(store.jobs().is_empty());

        let h = harness_with(store).await;
        let ticket = h.driver.enqueue(OperationType::Flag, inbox(), vec![2]).await.unwrap();
        assert_eq!(ticket.id(), JobId(8));
        ticket.outcome().await.unwrap();
        assert_eq!(h.store.failures()[0].0.id, JobId(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_surfaces_storage_failure() {
        let h = harness().await;
        h.store.fail_puts(true);
        let result = h.driver.enqueue(OperationType::Flag, inbox(), vec![1]).await;
        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(h.driver.jobs().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_holds_queue_then_recovers() {
        let h = harness().await;
        h.client
            .push_connect_result(Err(ConnectError::auth_rejected("bad password")));
        let ticket = h.driver.enqueue(OperationType::Flag, inbox(), vec![1]).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let queued = h.driver.jobs().await.unwrap();
        assert_eq!(queued[0].try_count, 1);
        assert_eq!(queued[0].status, JobStatus::Pending);
        assert!(h.client.performed().is_empty());

        ticket.outcome().await.unwrap();
        assert_eq!(h.client.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_defers_without_consuming_tries() {
        let h = harness().await;
        for _ in 0..100 {
            h.client
                .push_connect_result(Err(ConnectError::unreachable("no route to host")));
        }
        let _ticket = h.driver.enqueue(OperationType::Flag, inbox(), vec![1]).await.unwrap();

        tokio::time::sleep(Duration::from_secs(700)).await;
        assert!(h.client.connect_count() >= 20);
        let queued = h.driver.jobs().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].try_count, 0);
        assert!(matches!(
            queued[0].status,
            JobStatus::Pending | JobStatus::Deferred
        ));
        assert!(h.store.failures().is_empty());
        assert!(h.client.performed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_tickets_and_keeps_jobs() {
        let h = harness().await;
        h.client.push_mutation_result(Err(not_available()));
        let ticket = h.driver.enqueue(OperationType::Flag, inbox(), vec![1]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        h.driver.shutdown().await;
        h.driver.shutdown().await;
        assert!(matches!(ticket.outcome().await, Err(Error::Shutdown)));
        assert!(h.driver.is_shut_down());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.client.performed().is_empty());
        assert_eq!(h.store.jobs().len(), 1);
        assert!(matches!(
            h.driver.enqueue(OperationType::Flag, inbox(), vec![2]).await,
            Err(Error::Shutdown)
        ));
        h.broker.shutdown().await;
    }
}
