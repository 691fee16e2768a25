//! Single-connection broker for one account.
//!
//! The servers we talk to tolerate one client per mailbox, so every network
//! exchange of an account goes through one [`ConnectionBroker`]. A dedicated
//! worker task owns the connection slot and a FIFO of waiters; requesters get
//! a [`ConnectionLease`] which hands the connection back when dropped.
//!
//! ```ignore
//! let mut lease = broker.with_connection("sync INBOX").await?;
//! client.issue_sync_request(&mut lease, &request).await?;
//! drop(lease); // next requester is serviced
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::backoff::{BackoffEndpoint, EndpointState};
use crate::config::SharedConfig;
use crate::error::{ConnectError, Error, Result};
use crate::model::AccountId;
use crate::protocol::{Connection, Direction, ProblemReporter, ProtocolClient};

/// Lifecycle of the account's connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection was ever made, or it was torn down for good.
    #[default]
    Absent,
    /// A connect attempt is in flight.
    Connecting,
    /// A connection exists (idle in the slot or out on lease).
    Live,
    /// The last connection dropped or the last attempt failed.
    Disconnected,
}

/// Snapshot of the broker's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerStatus {
    /// Connection slot state.
    pub state: ConnectionState,
    /// Whether the connection is currently leased out.
    pub leased: bool,
    /// Requesters waiting for their turn.
    pub queued: usize,
    /// Connect attempts made so far.
    pub connect_attempts: u64,
    /// Backoff endpoint state.
    pub backoff: EndpointState,
    /// Consecutive connect failures.
    pub consecutive_failures: u32,
}

enum Command<T: Connection> {
    Acquire {
        label: String,
        reply: oneshot::Sender<Result<ConnectionLease<T>>>,
    },
    CheckAccount {
        reply: oneshot::Sender<Result<()>>,
    },
    Release {
        conn: T,
        discard: bool,
    },
    RetryConnect,
    Status {
        reply: oneshot::Sender<BrokerStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Waiter<T: Connection> {
    Acquire {
        label: String,
        reply: oneshot::Sender<Result<ConnectionLease<T>>>,
    },
    Check {
        reply: oneshot::Sender<Result<()>>,
    },
}

impl<T: Connection> Waiter<T> {
    fn fail(self, err: Error) {
        match self {
            Self::Acquire { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::Check { reply } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Exclusive use of the account connection.
///
/// Dereferences to the connection. Dropping the lease returns the connection
/// to the broker, which then services the next requester; this happens on
/// every path out of the requester, including early returns and errors.
pub struct ConnectionLease<T: Connection> {
    conn: Option<T>,
    label: String,
    discard: bool,
    tx: mpsc::UnboundedSender<Command<T>>,
}

impl<T: Connection> ConnectionLease<T> {
    /// Label the lease was requested with.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Tells the broker not to reuse this connection after release.
    ///
    /// Use it when the exchange left the connection in an unknown state.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<T: Connection> Deref for ConnectionLease<T> {
    type Target = T;

    #[allow(clippy::expect_used)] // only taken in Drop
    fn deref(&self) -> &T {
        self.conn.as_ref().expect("lease holds a connection until dropped")
    }
}

impl<T: Connection> DerefMut for ConnectionLease<T> {
    #[allow(clippy::expect_used)] // only taken in Drop
    fn deref_mut(&mut self) -> &mut T {
        self.conn.as_mut().expect("lease holds a connection until dropped")
    }
}

impl<T: Connection> Drop for ConnectionLease<T> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let release = Command::Release {
            conn,
            discard: self.discard,
        };
        if let Err(mpsc::error::SendError(Command::Release { mut conn, .. })) =
            self.tx.send(release)
        {
            // Broker is gone; nobody will reuse the connection.
            conn.die();
        }
    }
}

impl<T: Connection> std::fmt::Debug for ConnectionLease<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("label", &self.label)
            .field("discard", &self.discard)
            .finish_non_exhaustive()
    }
}

/// Handle to an account's connection broker.
pub struct ConnectionBroker<C: ProtocolClient> {
    account: AccountId,
    tx: mpsc::UnboundedSender<Command<C::Connection>>,
}

impl<C: ProtocolClient> Clone for ConnectionBroker<C> {
    fn clone(&self) -> Self {
        Self {
            account: self.account,
            tx: self.tx.clone(),
        }
    }
}

impl<C: ProtocolClient> ConnectionBroker<C> {
    /// Starts the broker worker for an account.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(
        account: AccountId,
        client: Arc<C>,
        reporter: Arc<dyn ProblemReporter>,
        config: SharedConfig,
    ) -> Self {
        Self::spawn_with_connection(account, client, reporter, config, None)
    }

    /// Starts the broker with an already established connection, e.g. the
    /// one left over from validating a freshly created account.
    #[must_use]
    pub fn spawn_with_connection(
        account: AccountId,
        client: Arc<C>,
        reporter: Arc<dyn ProblemReporter>,
        config: SharedConfig,
        existing: Option<C::Connection>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = if existing.is_some() {
            ConnectionState::Live
        } else {
            ConnectionState::Absent
        };
        let worker = Worker {
            account,
            backoff: BackoffEndpoint::new(format!("incoming:{account}"), config.clone()),
            client,
            reporter,
            config,
            tx: tx.downgrade(),
            conn: existing,
            state,
            leased: false,
            queue: VecDeque::new(),
            connect_attempts: 0,
        };
        tokio::spawn(worker.run(rx));
        Self { account, tx }
    }

    /// Account this broker serves.
    #[must_use]
    pub const fn account(&self) -> AccountId {
        self.account
    }

    /// Queues a request for the connection.
    ///
    /// The request is enqueued before this returns, so submission order is
    /// call order. The returned future resolves once every earlier requester
    /// has released the connection and a live connection is available, or
    /// with the connect error if establishing one failed.
    pub fn with_connection(
        &self,
        label: &str,
    ) -> impl Future<Output = Result<ConnectionLease<C::Connection>>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .tx
            .send(Command::Acquire {
                label: label.to_string(),
                reply,
            })
            .is_ok();
        async move {
            if !sent {
                return Err(Error::Shutdown);
            }
            rx.await.unwrap_or(Err(Error::Shutdown))
        }
    }

    /// Drops any existing connection and authenticates from scratch.
    ///
    /// # Errors
    ///
    /// Returns the connect error if the credentials (or server) fail.
    pub async fn check_account(&self) -> Result<()> {
        tracing::info!(account = %self.account, "Checking account");
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::CheckAccount { reply })
            .map_err(|_| Error::Shutdown)?;
        let result = rx.await.unwrap_or(Err(Error::Shutdown));
        tracing::info!(account = %self.account, ok = result.is_ok(), "Account check done");
        result
    }

    /// Current broker bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the broker is gone.
    pub async fn status(&self) -> Result<BrokerStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply })
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Tears down the connection, cancels retries and fails all waiters.
    ///
    /// Idempotent. A connection that is out on lease is torn down when its
    /// lease is dropped.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Whether the broker worker has stopped.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<C: ProtocolClient> std::fmt::Debug for ConnectionBroker<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBroker")
            .field("account", &self.account)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

struct Worker<C: ProtocolClient> {
    account: AccountId,
    client: Arc<C>,
    reporter: Arc<dyn ProblemReporter>,
    config: SharedConfig,
    backoff: BackoffEndpoint,
    tx: mpsc::WeakUnboundedSender<Command<C::Connection>>,
    conn: Option<C::Connection>,
    state: ConnectionState,
    leased: bool,
    queue: VecDeque<Waiter<C::Connection>>,
    connect_attempts: u64,
}

impl<C: ProtocolClient> Worker<C> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command<C::Connection>>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Acquire { label, reply } => {
                    self.queue.push_back(Waiter::Acquire { label, reply });
                }
                Command::CheckAccount { reply } => {
                    self.queue.push_back(Waiter::Check { reply });
                }
                Command::Release { conn, discard } => self.on_release(conn, discard),
                Command::RetryConnect => self.on_retry().await,
                Command::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                Command::Shutdown { reply } => {
                    self.shutdown(&mut rx);
                    let _ = reply.send(());
                    return;
                }
            }
            self.drain().await;
        }
        self.shutdown(&mut rx);
    }

    fn status(&self) -> BrokerStatus {
        BrokerStatus {
            state: self.state,
            leased: self.leased,
            queued: self.queue.len(),
            connect_attempts: self.connect_attempts,
            backoff: self.backoff.state(),
            consecutive_failures: self.backoff.consecutive_failures(),
        }
    }

    /// Services waiters in order until the connection is out on lease.
    async fn drain(&mut self) {
        while !self.leased {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            match waiter {
                Waiter::Acquire { label, reply } => self.service_acquire(label, reply).await,
                Waiter::Check { reply } => self.service_check(reply).await,
            }
        }
    }

    async fn service_acquire(
        &mut self,
        label: String,
        reply: oneshot::Sender<Result<ConnectionLease<C::Connection>>>,
    ) {
        if reply.is_closed() {
            tracing::trace!(account = %self.account, label, "Requester went away");
            return;
        }

        let conn = match self.conn.take() {
            Some(conn) if !conn.is_disconnected() => conn,
            stale => {
                if stale.is_some() {
                    tracing::debug!(account = %self.account, "Connection dropped, reconnecting");
                    self.state = ConnectionState::Disconnected;
                }
                match self.connect(&label).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = reply.send(Err(err.clone().into()));
                        self.fail_queued(&err);
                        return;
                    }
                }
            }
        };

        let Some(tx) = self.tx.upgrade() else {
            self.conn = Some(conn);
            let _ = reply.send(Err(Error::Shutdown));
            return;
        };
        tracing::trace!(account = %self.account, label, "Leasing connection");
        self.leased = true;
        let lease = ConnectionLease {
            conn: Some(conn),
            label,
            discard: false,
            tx,
        };
        // A requester that vanished meanwhile drops the lease, which
        // releases the connection again.
        let _ = reply.send(Ok(lease));
    }

    async fn service_check(&mut self, reply: oneshot::Sender<Result<()>>) {
        if let Some(mut conn) = self.conn.take() {
            if !conn.is_disconnected() {
                conn.disconnect().await;
            }
            self.state = ConnectionState::Disconnected;
        }
        match self.connect("checkAccount").await {
            Ok(conn) => {
                self.conn = Some(conn);
                let _ = reply.send(Ok(()));
            }
            Err(err) => {
                let _ = reply.send(Err(err.clone().into()));
                self.fail_queued(&err);
            }
        }
    }

    fn on_release(&mut self, mut conn: C::Connection, discard: bool) {
        self.leased = false;
        if discard {
            tracing::debug!(account = %self.account, "Discarding released connection");
            conn.die();
            self.state = ConnectionState::Disconnected;
        } else if conn.is_disconnected() {
            self.state = ConnectionState::Disconnected;
        } else {
            self.conn = Some(conn);
            self.state = ConnectionState::Live;
        }
    }

    async fn on_retry(&mut self) {
        if self.leased || self.conn.is_some() {
            return;
        }
        if self.backoff.state() == EndpointState::Shutdown {
            return;
        }
        if let Ok(conn) = self.connect("backoff-retry").await {
            self.conn = Some(conn);
        }
    }

    async fn connect(&mut self, label: &str) -> std::result::Result<C::Connection, ConnectError> {
        self.state = ConnectionState::Connecting;
        self.connect_attempts += 1;
        tracing::info!(account = %self.account, label, attempt = self.connect_attempts, "Creating connection");

        let timeout = self.config.current().connect_timeout;
        let result = match tokio::time::timeout(timeout, self.client.connect(label)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::timeout(format!("no connection after {timeout:?}"))),
        };

        match result {
            Ok(conn) => {
                self.backoff.note_connect_success();
                self.state = ConnectionState::Live;
                Ok(conn)
            }
            Err(err) => {
                tracing::warn!(account = %self.account, label, ?err, "Connect error");
                self.state = ConnectionState::Disconnected;

                if err.report_problem {
                    self.reporter
                        .report_account_problem(self.account, err.kind, Direction::Incoming);
                }

                if err.retry && self.backoff.note_connect_failure_maybe_retry(err.reachable) {
                    let tx = self.tx.clone();
                    self.backoff.schedule_connect_attempt(move || {
                        if let Some(tx) = tx.upgrade() {
                            let _ = tx.send(Command::RetryConnect);
                        }
                    });
                } else {
                    self.backoff.note_broken_connection();
                }
                Err(err)
            }
        }
    }

    fn fail_queued(&mut self, err: &ConnectError) {
        for waiter in self.queue.drain(..) {
            waiter.fail(Error::Connect(err.clone()));
        }
    }

    fn shutdown(&mut self, rx: &mut mpsc::UnboundedReceiver<Command<C::Connection>>) {
        tracing::info!(account = %self.account, "Broker shutting down");
        self.backoff.shutdown();
        if let Some(mut conn) = self.conn.take() {
            conn.die();
        }
        self.state = ConnectionState::Absent;
        for waiter in self.queue.drain(..) {
            waiter.fail(Error::Shutdown);
        }

        rx.close();
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::Acquire { reply, .. } => {
                    let _ = reply.send(Err(Error::Shutdown));
                }
                Command::CheckAccount { reply } => {
                    let _ = reply.send(Err(Error::Shutdown));
                }
                Command::Release { mut conn, .. } => conn.die(),
                Command::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                Command::Shutdown { reply } => {
                    let _ = reply.send(());
                }
                Command::RetryConnect => {}
            }
        }
    }
}
