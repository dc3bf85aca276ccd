//! Composition root: shared coordination state, the connection registry,
//! and the listener loops.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use harbor_proto::diag::{
    ConnectionInfo, IntentInfo, ListenerInfo, LockInfo, NotificationWaitInfo, TransactionDetails,
};
use harbor_storage::Storage;
use harbor_types::{ArchiveError, ConnectionId, ServerConfig, TimeRange};

use crate::intent::IntentTracker;
use crate::locker::ArchiveLocker;
use crate::notify::{NotificationDispatch, QueuedNotification};
use crate::transaction::{Transaction, TxnSlot};
use crate::{connection, diagnostics};

/// Out-of-band message to a connection task.
#[derive(Debug)]
pub enum Push {
    Notification(QueuedNotification),
    IntentHit { key: String, range: TimeRange },
    /// Asks the task to shut the connection down (diagnostics
    /// `close_connection`, server shutdown).
    Close,
}

impl Push {
    fn describe(&self) -> &'static str {
        match self {
            Push::Notification(_) => "notification",
            Push::IntentHit { .. } => "intent hit",
            Push::Close => "close",
        }
    }
}

struct ConnectionEntry {
    name: String,
    txn: TxnSlot,
    push: mpsc::UnboundedSender<Push>,
}

struct ControllerInner {
    storage: Storage,
    locker: ArchiveLocker,
    intents: IntentTracker,
    dispatch: NotificationDispatch,
    registry: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    next_connection: AtomicU64,
    read_timeout: Duration,
    diagnostics_timeout: Duration,
}

/// Shared server state. Cheap to clone; one per process.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    pub fn new(config: &ServerConfig) -> Result<Controller, ArchiveError> {
        let storage = Storage::open(config.root.clone())?;
        Ok(Controller {
            inner: Arc::new(ControllerInner {
                storage,
                locker: ArchiveLocker::new(),
                intents: IntentTracker::new(),
                dispatch: NotificationDispatch::new(),
                registry: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
                read_timeout: config.read_timeout(),
                diagnostics_timeout: config.diagnostics_timeout(),
            }),
        })
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.inner.read_timeout
    }

    #[must_use]
    pub fn diagnostics_timeout(&self) -> Duration {
        self.inner.diagnostics_timeout
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    #[must_use]
    pub fn dispatch(&self) -> &NotificationDispatch {
        &self.inner.dispatch
    }

    /// Registers a handshaken connection, returning its id, transaction
    /// slot, and the receiving end of its push channel.
    pub fn register(&self, name: &str) -> (ConnectionId, TxnSlot, mpsc::UnboundedReceiver<Push>) {
        let id = ConnectionId(self.inner.next_connection.fetch_add(1, Ordering::Relaxed));
        let txn: TxnSlot = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.registry.lock().insert(
            id,
            ConnectionEntry {
                name: name.to_string(),
                txn: Arc::clone(&txn),
                push: tx,
            },
        );
        info!(%id, name, "connection registered");
        (id, txn, rx)
    }

    /// Removes a connection and releases everything it held outside its
    /// transaction: declared intents, listener registrations, and pending
    /// acknowledgments (implicit ack).
    pub fn deregister(&self, id: ConnectionId) {
        self.inner.registry.lock().remove(&id);
        self.inner.intents.disconnect(id);
        self.inner.dispatch.disconnect(id);
        info!(%id, "connection deregistered");
    }

    /// Opens a transaction for `origin`, publishing it into the
    /// connection's registry slot.
    pub fn begin_transaction(
        &self,
        origin: ConnectionId,
        write: bool,
    ) -> Result<Transaction, ArchiveError> {
        let slot = {
            let registry = self.inner.registry.lock();
            let entry = registry
                .get(&origin)
                .ok_or(ArchiveError::TransactionRequired)?;
            Arc::clone(&entry.txn)
        };
        Transaction::begin(
            origin,
            write,
            self.inner.storage.clone(),
            self.inner.locker.clone(),
            self.inner.intents.clone(),
            self.inner.dispatch.clone(),
            slot,
        )
    }

    /// Enqueues an out-of-band message on a connection's push channel.
    /// Returns false if the connection is gone.
    pub fn push(&self, target: ConnectionId, message: Push) -> bool {
        let registry = self.inner.registry.lock();
        let Some(entry) = registry.get(&target) else {
            return false;
        };
        let kind = message.describe();
        if entry.push.send(message).is_err() {
            debug!(%target, kind, "push channel closed");
            return false;
        }
        true
    }

    /// The status string reported in denial replies: the blocker's
    /// transaction status, or a placeholder when it has none.
    #[must_use]
    pub fn status_of(&self, origin: ConnectionId) -> String {
        let registry = self.inner.registry.lock();
        match registry.get(&origin) {
            Some(entry) => match entry.txn.lock().as_ref() {
                Some(shared) => shared.status.clone(),
                None => "idle".to_string(),
            },
            None => "disconnected".to_string(),
        }
    }

    /// Signals one connection's task to close. Diagnostics only.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        self.push(id, Push::Close)
    }

    fn close_all(&self) {
        let targets: Vec<ConnectionId> = self.inner.registry.lock().keys().copied().collect();
        for id in targets {
            self.close_connection(id);
        }
    }

    #[must_use]
    pub fn connections_snapshot(&self) -> Vec<ConnectionInfo> {
        let registry = self.inner.registry.lock();
        let mut out: Vec<ConnectionInfo> = registry
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                id: id.0,
                name: entry.name.clone(),
                transaction_status: entry.txn.lock().as_ref().map(|t| t.status.clone()),
            })
            .collect();
        out.sort_by_key(|c| c.id);
        out
    }

    #[must_use]
    pub fn locks_snapshot(&self) -> Vec<LockInfo> {
        self.inner.locker.snapshot()
    }

    #[must_use]
    pub fn intents_snapshot(&self) -> Vec<IntentInfo> {
        self.inner.intents.snapshot()
    }

    #[must_use]
    pub fn listeners_snapshot(&self) -> Vec<ListenerInfo> {
        self.inner.dispatch.listeners_snapshot()
    }

    #[must_use]
    pub fn notification_wait_snapshot(&self) -> Vec<NotificationWaitInfo> {
        self.inner.dispatch.wait_snapshot()
    }

    #[must_use]
    pub fn transaction_details(&self, id: ConnectionId) -> Option<TransactionDetails> {
        let registry = self.inner.registry.lock();
        let entry = registry.get(&id)?;
        let txn = entry.txn.lock();
        let shared = txn.as_ref()?;
        Some(TransactionDetails {
            connection: id.0,
            write: shared.write,
            generation: shared.generation.0,
            status: shared.status.clone(),
            elapsed_secs: shared.started.elapsed().as_secs_f64(),
            locks_held: shared.locks_held,
            queued_notifications: shared.queued_notifications,
        })
    }
}

/// A started server: bound addresses plus the accept-loop tasks.
pub struct RunningServer {
    controller: Controller,
    client_addr: SocketAddr,
    diagnostics_addr: SocketAddr,
    accept_tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    #[must_use]
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    #[must_use]
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    #[must_use]
    pub fn diagnostics_addr(&self) -> SocketAddr {
        self.diagnostics_addr
    }

    /// Stops accepting and asks every live connection to close.
    pub fn shutdown(self) {
        for task in &self.accept_tasks {
            task.abort();
        }
        self.controller.close_all();
    }
}

/// Binds both listeners and spawns the accept loops. Addresses with port 0
/// get an ephemeral port; the bound addresses are reported back.
pub async fn start(config: &ServerConfig) -> anyhow::Result<RunningServer> {
    let controller = Controller::new(config)?;

    let client_listener = TcpListener::bind(&config.listen_addr).await?;
    let client_addr = client_listener.local_addr()?;
    let diagnostics_listener = TcpListener::bind(&config.diagnostics_addr).await?;
    let diagnostics_addr = diagnostics_listener.local_addr()?;
    info!(%client_addr, %diagnostics_addr, root = %config.root.display(), "archive server listening");

    let accept_controller = controller.clone();
    let client_task = tokio::spawn(async move {
        loop {
            match client_listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "client connection accepted");
                    let controller = accept_controller.clone();
                    tokio::spawn(connection::serve(controller, stream));
                }
                Err(err) => {
                    warn!(%err, "client accept failed");
                }
            }
        }
    });

    let diag_controller = controller.clone();
    let diagnostics_task = tokio::spawn(async move {
        loop {
            match diagnostics_listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "diagnostics connection accepted");
                    let controller = diag_controller.clone();
                    tokio::spawn(diagnostics::serve(controller, stream));
                }
                Err(err) => {
                    warn!(%err, "diagnostics accept failed");
                }
            }
        }
    });

    Ok(RunningServer {
        controller,
        client_addr,
        diagnostics_addr,
        accept_tasks: vec![client_task, diagnostics_task],
    })
}

/// Runs the server until ctrl-c.
pub async fn run(config: &ServerConfig) -> anyhow::Result<()> {
    let server = start(config).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    server.shutdown();
    Ok(())
}
