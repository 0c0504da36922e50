// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! Transaction table
//!
//! Correlates every asynchronous request/response pair between the daemon,
//! the kernel and the IPCP workers. `begin` draws a fresh id from a monotonic
//! generator and hands back a promise; the response handler matches the id,
//! finishes the transaction and wakes the originator. A reaper purges
//! transactions that outlive their deadline, and any response arriving for a
//! purged id is dropped with a warning.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::IpcmError;
use crate::events::{AppChannel, FlowRequest};
use crate::registry::{AppName, IpcpHandle, Neighbor};

/// Correlation id of a transaction.
pub type Tid = u32;

/// Default deadline for any operation against the kernel or a worker.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

/// Typed payload delivered on successful completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    /// Plain success, no payload
    Done,
    /// New IPCP created
    IpcpId(IpcpHandle),
    /// Neighbors returned by a successful enrollment
    Neighbors(Vec<Neighbor>),
    /// Serialised RIB dump
    Rib(String),
    /// Port id of an allocated flow
    Port(i32),
}

/// Terminal result observed by the originator of a transaction.
pub type TxResult = Result<TxOutcome, IpcmError>;

/// Kind tag plus the request echo the response handler needs when building
/// the outcome for the upstream requester.
#[derive(Debug)]
pub enum TransactionKind {
    IpcpCreate { handle: IpcpHandle },
    IpcpDestroy { handle: IpcpHandle },
    /// Fire-and-forget kernel call issued during cleanup
    Syscall { handle: Option<IpcpHandle> },
    Assign { handle: IpcpHandle },
    /// Registration of an ordinary application through a slave IPCP
    RegisterApp {
        slave: IpcpHandle,
        app: AppName,
        dif_name: String,
        pid: u32,
        reply: Option<AppChannel>,
    },
    /// Registration of one IPCP in an underlying DIF
    RegisterIpcp {
        slave: IpcpHandle,
        ipcp: IpcpHandle,
        dif_name: String,
    },
    UnregisterApp {
        slave: IpcpHandle,
        app: AppName,
        /// False for manager-initiated cleanup, which must stay silent
        notify: bool,
        reply: Option<AppChannel>,
    },
    UnregisterIpcp {
        slave: IpcpHandle,
        ipcp: IpcpHandle,
        dif_name: String,
    },
    Enroll { handle: IpcpHandle },
    Disconnect { handle: IpcpHandle, neighbor: AppName },
    Allocate {
        handle: IpcpHandle,
        req: FlowRequest,
        reply: Option<AppChannel>,
    },
    /// Remote flow request waiting for the local application's verdict
    RemoteAllocate { handle: IpcpHandle, req: FlowRequest },
    Deallocate {
        handle: IpcpHandle,
        port_id: i32,
        notify: bool,
        reply: Option<AppChannel>,
    },
    QueryRib { handle: IpcpHandle },
    UpdateConfig { handle: IpcpHandle },
    SelectPolicySet { handle: IpcpHandle },
    SetPolicySetParam { handle: IpcpHandle },
    PluginLoad { handle: IpcpHandle },
}

impl TransactionKind {
    /// The IPCP this transaction is bound to, for per-IPCP cancellation.
    pub fn ipcp(&self) -> Option<IpcpHandle> {
        match self {
            TransactionKind::IpcpCreate { handle }
            | TransactionKind::IpcpDestroy { handle }
            | TransactionKind::Assign { handle }
            | TransactionKind::Enroll { handle }
            | TransactionKind::Disconnect { handle, .. }
            | TransactionKind::Allocate { handle, .. }
            | TransactionKind::RemoteAllocate { handle, .. }
            | TransactionKind::Deallocate { handle, .. }
            | TransactionKind::QueryRib { handle }
            | TransactionKind::UpdateConfig { handle }
            | TransactionKind::SelectPolicySet { handle }
            | TransactionKind::SetPolicySetParam { handle }
            | TransactionKind::PluginLoad { handle } => Some(*handle),
            TransactionKind::RegisterApp { slave, .. }
            | TransactionKind::RegisterIpcp { slave, .. }
            | TransactionKind::UnregisterApp { slave, .. }
            | TransactionKind::UnregisterIpcp { slave, .. } => Some(*slave),
            TransactionKind::Syscall { handle } => *handle,
        }
    }
}

/// Snapshot of a pending transaction, as returned by
/// [`TransactionTable::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionInfo {
    pub tid: Tid,
    pub ipcp: Option<IpcpHandle>,
    pub deadline: Instant,
}

/// In-flight state of one transaction.
#[derive(Debug)]
pub struct Transaction {
    pub tid: Tid,
    pub kind: TransactionKind,
    pub deadline: Instant,
    sender: oneshot::Sender<TxResult>,
}

impl Transaction {
    /// Delivers the terminal result to the originator. The waiter may have
    /// gone away already, which is fine.
    pub fn finish(self, result: TxResult) {
        let _ = self.sender.send(result);
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<HashMap<Tid, Transaction>>,
    next_tid: AtomicU32,
}

/// The transaction table. Cheap to clone; all clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct TransactionTable {
    inner: Arc<Inner>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a transaction and returns its id plus the originator's promise.
    pub fn begin(&self, kind: TransactionKind, timeout: Duration) -> (Tid, Promise) {
        let tid = self.inner.next_tid.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        let trans = Transaction {
            tid,
            kind,
            deadline: Instant::now() + timeout,
            sender: tx,
        };
        self.inner
            .entries
            .lock()
            .expect("transaction table lock poisoned")
            .insert(tid, trans);
        (
            tid,
            Promise {
                tid,
                rx,
                table: self.clone(),
            },
        )
    }

    /// Removes and returns the transaction, handing its request echo to the
    /// response handler. `None` means the transaction was already finalised
    /// (or never existed) and the response must be dropped.
    pub fn take(&self, tid: Tid) -> Option<Transaction> {
        self.inner
            .entries
            .lock()
            .expect("transaction table lock poisoned")
            .remove(&tid)
    }

    /// Finishes a transaction with `result`. A second completion for the same
    /// id fails with `AlreadyFinalised`.
    pub fn complete(&self, tid: Tid, result: TxResult) -> Result<(), IpcmError> {
        match self.take(tid) {
            Some(trans) => {
                trans.finish(result);
                Ok(())
            }
            None => Err(IpcmError::AlreadyFinalised(tid)),
        }
    }

    /// Aborts a transaction with the given error.
    pub fn abort(&self, tid: Tid, reason: IpcmError) -> Result<(), IpcmError> {
        self.complete(tid, Err(reason))
    }

    /// Cancels every transaction bound to `ipcp`.
    pub fn cancel_all_for(&self, ipcp: IpcpHandle) {
        let cancelled = self.drain(|t| t.kind.ipcp() == Some(ipcp));
        for trans in cancelled {
            debug!(tid = trans.tid, %ipcp, "cancelling transaction for destroyed IPCP");
            trans.finish(Err(IpcmError::Cancelled));
        }
    }

    /// Cancels every outstanding transaction (daemon shutdown).
    pub fn cancel_all(&self) {
        for trans in self.drain(|_| true) {
            trans.finish(Err(IpcmError::Cancelled));
        }
    }

    /// Finds the pending create transaction for `ipcp_id`. The
    /// daemon-initialised notification pairs with create-IPCP by ipcp id
    /// rather than by transaction id.
    pub fn pending_create_for(&self, ipcp_id: u16) -> Option<Tid> {
        let entries = self
            .inner
            .entries
            .lock()
            .expect("transaction table lock poisoned");
        entries
            .values()
            .find(|t| matches!(&t.kind, TransactionKind::IpcpCreate { handle } if handle.id == ipcp_id))
            .map(|t| t.tid)
    }

    /// Looks up the in-flight state of a transaction without removing it.
    pub fn lookup(&self, tid: Tid) -> Option<TransactionInfo> {
        self.inner
            .entries
            .lock()
            .expect("transaction table lock poisoned")
            .get(&tid)
            .map(|t| TransactionInfo {
                tid: t.tid,
                ipcp: t.kind.ipcp(),
                deadline: t.deadline,
            })
    }

    /// The IPCP a pending transaction is bound to, without removing it.
    pub fn ipcp_of(&self, tid: Tid) -> Option<IpcpHandle> {
        self.inner
            .entries
            .lock()
            .expect("transaction table lock poisoned")
            .get(&tid)
            .and_then(|t| t.kind.ipcp())
    }

    /// Number of in-flight transactions.
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .expect("transaction table lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aborts every transaction whose deadline has passed.
    pub fn expire_due(&self) {
        let now = Instant::now();
        for trans in self.drain(|t| t.deadline <= now) {
            warn!(tid = trans.tid, "transaction deadline elapsed, aborting");
            trans.finish(Err(IpcmError::Timeout));
        }
    }

    /// Periodically purges expired transactions until cancelled.
    pub async fn run_reaper(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(100)) => self.expire_due(),
            }
        }
    }

    fn drain(&self, mut pred: impl FnMut(&Transaction) -> bool) -> Vec<Transaction> {
        let mut entries = self
            .inner
            .entries
            .lock()
            .expect("transaction table lock poisoned");
        let tids: Vec<Tid> = entries
            .values()
            .filter(|t| pred(t))
            .map(|t| t.tid)
            .collect();
        tids.into_iter().filter_map(|tid| entries.remove(&tid)).collect()
    }
}

/// The originator's half of a transaction.
///
/// Exactly one terminal result is observed: success, failure, timeout or
/// cancellation.
#[derive(Debug)]
pub struct Promise {
    tid: Tid,
    rx: oneshot::Receiver<TxResult>,
    table: TransactionTable,
}

impl Promise {
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Waits for the terminal result.
    pub async fn wait(self) -> TxResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(IpcmError::Cancelled),
        }
    }

    /// Waits up to `dur`. Returns `None` when the transaction is still
    /// pending; the transaction itself stays alive.
    pub async fn timed_wait(&mut self, dur: Duration) -> Option<TxResult> {
        match tokio::time::timeout(dur, &mut self.rx).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(_)) => Some(Err(IpcmError::Cancelled)),
            Err(_) => None,
        }
    }

    /// Cancels the transaction and wakes the waiter with `Cancelled`.
    pub fn cancel(&self) {
        let _ = self.table.abort(self.tid, IpcmError::Cancelled);
    }
}
