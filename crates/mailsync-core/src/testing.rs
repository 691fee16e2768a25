//! Scripted protocol client for unit tests.

#![allow(clippy::unwrap_used)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{ConnectError, ConnectErrorKind, Error, ProtocolError};
use crate::jobs::{JobId, MutationJob, MutationStore};
use crate::model::AccountId;
use crate::protocol::{
    Connection, Direction, ProblemReporter, ProtocolClient, SyncBatch, SyncRequest,
};

type SyncHandler = Box<dyn Fn(&SyncRequest) -> Result<SyncBatch, ProtocolError> + Send + Sync>;

#[derive(Default)]
struct Events {
    disconnected: Vec<usize>,
    killed: Vec<usize>,
    performed: Vec<(JobId, Vec<u32>)>,
    sync_requests: Vec<SyncRequest>,
}

pub struct MockConnection {
    pub id: usize,
    transport_down: AtomicBool,
    events: Arc<Mutex<Events>>,
}

impl MockConnection {
    /// Simulates the server hanging up.
    pub fn drop_transport(&self) {
        self.transport_down.store(true, Ordering::SeqCst);
    }
}

impl Connection for MockConnection {
    fn is_disconnected(&self) -> bool {
        self.transport_down.load(Ordering::SeqCst)
    }

    async fn disconnect(&mut self) {
        self.transport_down.store(true, Ordering::SeqCst);
        self.events.lock().unwrap().disconnected.push(self.id);
    }

    fn die(&mut self) {
        self.transport_down.store(true, Ordering::SeqCst);
        self.events.lock().unwrap().killed.push(self.id);
    }
}

pub struct MockClient {
    connects: AtomicUsize,
    connect_results: Mutex<VecDeque<Result<(), ConnectError>>>,
    mutation_results: Mutex<VecDeque<Result<(), ProtocolError>>>,
    sync_handler: Mutex<Option<SyncHandler>>,
    events: Arc<Mutex<Events>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            connect_results: Mutex::new(VecDeque::new()),
            mutation_results: Mutex::new(VecDeque::new()),
            sync_handler: Mutex::new(None),
            events: Arc::new(Mutex::new(Events::default())),
        }
    }

    /// Scripts the next connect outcome; unscripted connects succeed.
    pub fn push_connect_result(&self, result: Result<(), ConnectError>) {
        self.connect_results.lock().unwrap().push_back(result);
    }

    /// Scripts the next mutation outcome; unscripted mutations succeed.
    pub fn push_mutation_result(&self, result: Result<(), ProtocolError>) {
        self.mutation_results.lock().unwrap().push_back(result);
    }

    pub fn set_sync_handler<F>(&self, handler: F)
    where
        F: Fn(&SyncRequest) -> Result<SyncBatch, ProtocolError> + Send + Sync + 'static,
    {
        *self.sync_handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn was_disconnected(&self, id: usize) -> bool {
        self.events.lock().unwrap().disconnected.contains(&id)
    }

    pub fn was_killed(&self, id: usize) -> bool {
        self.events.lock().unwrap().killed.contains(&id)
    }

    pub fn performed(&self) -> Vec<(JobId, Vec<u32>)> {
        self.events.lock().unwrap().performed.clone()
    }

    pub fn sync_requests(&self) -> Vec<SyncRequest> {
        self.events.lock().unwrap().sync_requests.clone()
    }

    /// A connection that did not go through `connect`.
    pub fn detached_connection(&self, id: usize) -> MockConnection {
        MockConnection {
            id,
            transport_down: AtomicBool::new(false),
            events: Arc::clone(&self.events),
        }
    }
}

impl ProtocolClient for MockClient {
    type Connection = MockConnection;

    async fn connect(&self, _label: &str) -> Result<MockConnection, ConnectError> {
        let id = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self.connect_results.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(()))?;
        Ok(self.detached_connection(id))
    }

    async fn issue_sync_request(
        &self,
        _conn: &mut MockConnection,
        request: &SyncRequest,
    ) -> Result<SyncBatch, ProtocolError> {
        self.events
            .lock()
            .unwrap()
            .sync_requests
            .push(request.clone());
        match self.sync_handler.lock().unwrap().as_ref() {
            Some(handler) => handler(request),
            None => Ok(SyncBatch::default()),
        }
    }

    async fn perform_mutation(
        &self,
        _conn: &mut MockConnection,
        job: &MutationJob,
    ) -> Result<(), ProtocolError> {
        let scripted = self.mutation_results.lock().unwrap().pop_front();
        let result = scripted.unwrap_or(Ok(()));
        if result.is_ok() {
            self.events
                .lock()
                .unwrap()
                .performed
                .push((job.id, job.target_ids.clone()));
        }
        result
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    problems: Mutex<Vec<(AccountId, ConnectErrorKind, Direction)>>,
}

impl RecordingReporter {
    pub fn problems(&self) -> Vec<(AccountId, ConnectErrorKind, Direction)> {
        self.problems.lock().unwrap().clone()
    }
}

impl ProblemReporter for RecordingReporter {
    fn report_account_problem(
        &self,
        account: AccountId,
        kind: ConnectErrorKind,
        direction: Direction,
    ) {
        self.problems.lock().unwrap().push((account, kind, direction));
    }
}

/// In-memory [`MutationStore`] whose writes can be made to fail.
#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<BTreeMap<JobId, MutationJob>>,
    failures: Mutex<Vec<(MutationJob, String)>>,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
    last_id: AtomicI64,
}

impl MemoryStore {
    pub fn seed(&self, job: MutationJob) {
        self.last_id.fetch_max(job.id.0, Ordering::SeqCst);
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn jobs(&self) -> Vec<MutationJob> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    pub fn failures(&self) -> Vec<(MutationJob, String)> {
        self.failures.lock().unwrap().clone()
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

impl MutationStore for MemoryStore {
    async fn put(&self, job: &MutationJob) -> crate::Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(Error::Storage(sqlx::Error::PoolTimedOut));
        }
        self.seed(job.clone());
        Ok(())
    }

    async fn delete(&self, id: JobId) -> crate::Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::Storage(sqlx::Error::PoolTimedOut));
        }
        self.jobs.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn load_all(&self) -> crate::Result<Vec<MutationJob>> {
        Ok(self.jobs())
    }

    async fn record_failure(&self, job: &MutationJob, reason: &str) -> crate::Result<()> {
        self.failures
            .lock()
            .unwrap()
            .push((job.clone(), reason.to_string()));
        self.last_id.fetch_max(job.id.0, Ordering::SeqCst);
        Ok(())
    }

    async fn last_job_id(&self) -> crate::Result<Option<JobId>> {
        let last = self.last_id.load(Ordering::SeqCst);
        Ok((last > 0).then_some(JobId(last)))
    }
}
