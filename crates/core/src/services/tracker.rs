//! Transaction tracker - lifecycle state machine for one submitted call.
//!
//! The tracker sequences the asynchronous steps of a transaction (wallet
//! signing, then mining) and notifies observers once per state entry.
//!
//! # Architecture
//!
//! ```text
//! send() ──START──▶ ┌──────────────┐ ──▶ observers (exactly once per entry)
//!        ──SIGNED─▶ │ tracker task │ ──▶ watch::Sender<TransactionSnapshot>
//!        ──MINED──▶ │  (one queue) │
//! set_observers() ▶ └──────────────┘
//! ```
//!
//! Transitions and observer replacement travel through the same command
//! queue, so a replaced callback never fires and no transition falls between
//! two registrations. Dropping a `send` future mid-flight fails its cycle
//! with [`TransactionError::Cancelled`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::{TrackerError, TransactionError, TransactionResult, TransactionStage};
use crate::metrics::record_transaction_transition;
use crate::models::{TransactionReceipt, TransactionState, TxHash};
use crate::ports::SubmittedTransaction;

// =============================================================================
// Configuration
// =============================================================================

/// Tracker configuration. Timeouts are disabled by default.
#[derive(Debug, Clone, Default)]
pub struct TrackerConfig {
    /// Maximum time the wallet may take to sign and submit.
    pub signing_timeout: Option<Duration>,
    /// Maximum time a submitted transaction may take to be mined.
    pub mining_timeout: Option<Duration>,
}

// =============================================================================
// Observers
// =============================================================================

pub type StateCallback = Arc<dyn Fn() + Send + Sync>;
pub type MiningCallback = Arc<dyn Fn(&dyn SubmittedTransaction) + Send + Sync>;
pub type MinedCallback = Arc<dyn Fn(&TransactionReceipt, &dyn SubmittedTransaction) + Send + Sync>;
pub type FailedCallback = Arc<dyn Fn(&TransactionError) + Send + Sync>;

/// Per-state callbacks. Unset states are silent.
///
/// Callbacks run on the tracker task and must not block.
#[derive(Clone, Default)]
pub struct Observers {
    on_idle: Option<StateCallback>,
    on_pending: Option<StateCallback>,
    on_mining: Option<MiningCallback>,
    on_mined: Option<MinedCallback>,
    on_failed: Option<FailedCallback>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_idle(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_idle = Some(Arc::new(f));
        self
    }

    pub fn on_pending(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_pending = Some(Arc::new(f));
        self
    }

    pub fn on_mining(mut self, f: impl Fn(&dyn SubmittedTransaction) + Send + Sync + 'static) -> Self {
        self.on_mining = Some(Arc::new(f));
        self
    }

    pub fn on_mined(
        mut self,
        f: impl Fn(&TransactionReceipt, &dyn SubmittedTransaction) + Send + Sync + 'static,
    ) -> Self {
        self.on_mined = Some(Arc::new(f));
        self
    }

    pub fn on_failed(mut self, f: impl Fn(&TransactionError) + Send + Sync + 'static) -> Self {
        self.on_failed = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("on_idle", &self.on_idle.is_some())
            .field("on_pending", &self.on_pending.is_some())
            .field("on_mining", &self.on_mining.is_some())
            .field("on_mined", &self.on_mined.is_some())
            .field("on_failed", &self.on_failed.is_some())
            .finish()
    }
}

// =============================================================================
// Transaction record
// =============================================================================

/// Point-in-time view of the tracked transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionSnapshot {
    pub state: TransactionState,
    /// Set once signing succeeded (Mining, Mined).
    pub transaction_hash: Option<TxHash>,
    /// Set only in Mined.
    pub receipt: Option<TransactionReceipt>,
    /// Set only in Failed.
    pub error: Option<TransactionError>,
}

#[derive(Debug, Default)]
struct Transaction {
    state: TransactionState,
    handle: Option<Arc<dyn SubmittedTransaction>>,
    receipt: Option<TransactionReceipt>,
    error: Option<TransactionError>,
}

impl Transaction {
    fn snapshot(&self) -> TransactionSnapshot {
        TransactionSnapshot {
            state: self.state,
            transaction_hash: self.handle.as_ref().map(|h| h.hash()),
            receipt: self.receipt.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug)]
enum TransactionEvent {
    /// Begin cycle `cycle`. Cycle numbers are unique per tracker.
    Start { cycle: u64 },
    Signed(Arc<dyn SubmittedTransaction>),
    Mined {
        receipt: TransactionReceipt,
        handle: Arc<dyn SubmittedTransaction>,
    },
    Failed(TransactionError),
    Reset,
}

impl TransactionEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Signed(_) => "signed",
            Self::Mined { .. } => "mined",
            Self::Failed(_) => "failed",
            Self::Reset => "reset",
        }
    }
}

/// Transition table. `None` means the event is ignored in `state`.
fn next_state(state: TransactionState, event: &TransactionEvent) -> Option<TransactionState> {
    use TransactionState::*;

    match (state, event) {
        (Idle | Mined | Failed, TransactionEvent::Start { .. }) => Some(Pending),
        (Pending, TransactionEvent::Signed(_)) => Some(Mining),
        (Pending | Mining, TransactionEvent::Failed(_)) => Some(Failed),
        (Mining, TransactionEvent::Mined { .. }) => Some(Mined),
        (Mined | Failed, TransactionEvent::Reset) => Some(Idle),
        _ => None,
    }
}

// =============================================================================
// Tracker task
// =============================================================================

/// Outcome of a dispatched event: the new state, or the unchanged state
/// when the event was ignored.
type Applied = Result<TransactionState, TransactionState>;

enum Command {
    SetObservers(Observers),
    Dispatch {
        event: TransactionEvent,
        ack: oneshot::Sender<Applied>,
    },
    /// Fail `cycle` if it is still the running one.
    Cancel { cycle: u64 },
}

struct TrackerTask {
    observers: Observers,
    transaction: Transaction,
    /// Cycle that produced `transaction`.
    cycle: u64,
    snapshot_tx: watch::Sender<TransactionSnapshot>,
}

impl TrackerTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::SetObservers(observers) => {
                    debug!(?observers, "Observers replaced");
                    self.observers = observers;
                }
                Command::Dispatch { event, ack } => {
                    let applied = self.apply(event);
                    // The sender may have been cancelled; the transition stands.
                    let _ = ack.send(applied);
                }
                Command::Cancel { cycle } => {
                    if cycle == self.cycle && self.transaction.state.is_in_flight() {
                        self.apply(TransactionEvent::Failed(TransactionError::Cancelled));
                    } else {
                        debug!(cycle, "Cancelled cycle already settled");
                    }
                }
            }
        }
        debug!("Transaction tracker stopped");
    }

    fn apply(&mut self, event: TransactionEvent) -> Applied {
        let current = self.transaction.state;
        let Some(next) = next_state(current, &event) else {
            debug!(state = %current, event = event.name(), "Ignoring event not valid for state");
            return Err(current);
        };

        match event {
            TransactionEvent::Start { cycle } => {
                self.transaction = Transaction::default();
                self.cycle = cycle;
            }
            TransactionEvent::Reset => {
                self.transaction = Transaction::default();
            }
            TransactionEvent::Signed(handle) => {
                self.transaction.handle = Some(handle);
            }
            TransactionEvent::Mined { receipt, handle } => {
                self.transaction.receipt = Some(receipt);
                self.transaction.handle = Some(handle);
            }
            TransactionEvent::Failed(error) => {
                self.transaction.error = Some(error);
            }
        }
        self.transaction.state = next;

        match (next, &self.transaction.error) {
            (TransactionState::Failed, Some(error)) => {
                warn!(from = %current, error = %error, "❌ Transaction failed");
            }
            (TransactionState::Mined, _) => info!(from = %current, "✅ Transaction mined"),
            _ => debug!(from = %current, to = %next, "Transaction state changed"),
        }

        record_transaction_transition(next);
        self.snapshot_tx.send_replace(self.transaction.snapshot());
        self.notify();
        Ok(next)
    }

    fn notify(&self) {
        let tx = &self.transaction;
        let observers = &self.observers;

        match tx.state {
            TransactionState::Idle => {
                if let Some(cb) = &observers.on_idle {
                    cb();
                }
            }
            TransactionState::Pending => {
                if let Some(cb) = &observers.on_pending {
                    cb();
                }
            }
            TransactionState::Mining => {
                if let (Some(cb), Some(handle)) = (&observers.on_mining, &tx.handle) {
                    cb(handle.as_ref());
                }
            }
            TransactionState::Mined => {
                if let (Some(cb), Some(receipt), Some(handle)) =
                    (&observers.on_mined, &tx.receipt, &tx.handle)
                {
                    cb(receipt, handle.as_ref());
                }
            }
            TransactionState::Failed => {
                if let (Some(cb), Some(error)) = (&observers.on_failed, &tx.error) {
                    cb(error);
                }
            }
        }
    }
}

// =============================================================================
// TransactionTracker
// =============================================================================

/// Handle to a transaction tracker.
///
/// Clones share the same state machine. The tracker task stops once every
/// clone is dropped.
#[derive(Clone)]
pub struct TransactionTracker {
    config: TrackerConfig,
    commands: mpsc::UnboundedSender<Command>,
    snapshot_rx: watch::Receiver<TransactionSnapshot>,
    cycles: Arc<AtomicU64>,
}

impl TransactionTracker {
    /// Start a tracker in `Idle` on the current tokio runtime.
    pub fn spawn(config: TrackerConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(TransactionSnapshot::default());

        let task = TrackerTask {
            observers: Observers::default(),
            transaction: Transaction::default(),
            cycle: 0,
            snapshot_tx,
        };
        tokio::spawn(task.run(command_rx).instrument(info_span!("tracker")));

        Self {
            config,
            commands,
            snapshot_rx,
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the whole observer table.
    ///
    /// Takes effect for every transition dispatched after this call.
    pub fn set_observers(&self, observers: Observers) -> Result<(), TrackerError> {
        self.commands
            .send(Command::SetObservers(observers))
            .map_err(|_| TrackerError::Closed)
    }

    pub fn state(&self) -> TransactionState {
        self.snapshot_rx.borrow().state
    }

    pub fn snapshot(&self) -> TransactionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver updated on every transition.
    pub fn watch_state(&self) -> watch::Receiver<TransactionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Drive one transaction from signing request to `Mined` or `Failed`.
    ///
    /// `request` asks the wallet to sign and submit. Its failure, a failed
    /// confirmation, or a timeout moves the machine to `Failed` and is
    /// reported to observers only; `send` still returns `Ok(())`.
    ///
    /// Returns [`TrackerError::InFlight`] without calling `request` when
    /// another transaction is pending or mining.
    ///
    /// If the returned future is dropped before the transaction settles, the
    /// cycle moves to `Failed` with [`TransactionError::Cancelled`].
    pub async fn send<F, Fut, H>(&self, request: F) -> Result<(), TrackerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TransactionResult<H>>,
        H: SubmittedTransaction + 'static,
    {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let mut guard = CycleGuard {
            commands: &self.commands,
            cycle,
            armed: true,
        };

        if let Err(state) = self.dispatch(TransactionEvent::Start { cycle }).await? {
            guard.armed = false;
            return Err(TrackerError::InFlight(state));
        }

        let signed = with_timeout(self.config.signing_timeout, TransactionStage::Signing, request()).await;
        let handle: Arc<dyn SubmittedTransaction> = match signed {
            Ok(handle) => Arc::new(handle),
            Err(error) => {
                self.dispatch(TransactionEvent::Failed(error)).await?;
                guard.armed = false;
                return Ok(());
            }
        };

        debug!(hash = %handle.hash(), "Transaction signed");
        self.dispatch(TransactionEvent::Signed(handle.clone())).await?;

        let event = match with_timeout(self.config.mining_timeout, TransactionStage::Mining, handle.wait()).await
        {
            Ok(receipt) => TransactionEvent::Mined { receipt, handle },
            Err(error) => TransactionEvent::Failed(error),
        };
        self.dispatch(event).await?;
        guard.armed = false;

        Ok(())
    }

    /// Return a settled (`Mined` or `Failed`) machine to `Idle`.
    ///
    /// A no-op in `Idle`; rejected while a transaction is in flight.
    pub async fn reset(&self) -> Result<(), TrackerError> {
        match self.dispatch(TransactionEvent::Reset).await? {
            Err(state) if state.is_in_flight() => Err(TrackerError::InFlight(state)),
            _ => Ok(()),
        }
    }

    async fn dispatch(&self, event: TransactionEvent) -> Result<Applied, TrackerError> {
        let (ack, applied) = oneshot::channel();
        self.commands
            .send(Command::Dispatch { event, ack })
            .map_err(|_| TrackerError::Closed)?;
        applied.await.map_err(|_| TrackerError::Closed)
    }
}

impl fmt::Debug for TransactionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionTracker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Cancels its cycle when dropped while armed.
///
/// The cancel is a no-op on the tracker task if the cycle already settled or
/// a later cycle started.
struct CycleGuard<'a> {
    commands: &'a mpsc::UnboundedSender<Command>,
    cycle: u64,
    armed: bool,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(cycle = self.cycle, "send dropped before the transaction settled");
            let _ = self.commands.send(Command::Cancel { cycle: self.cycle });
        }
    }
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    stage: TransactionStage,
    fut: impl Future<Output = TransactionResult<T>>,
) -> TransactionResult<T> {
    let Some(limit) = limit else {
        return fut.await;
    };

    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransactionError::Timeout {
            stage,
            elapsed_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

// =============================================================================
// Tests
// =============================================================================
