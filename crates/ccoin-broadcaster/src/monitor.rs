//! Settlement broadcast monitor.

use crate::RejectClass;
use bitcoin::{Transaction, Txid};
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;

/// Submits raw transactions to the underlying node.
#[async_trait::async_trait]
pub trait BroadcastBackend: Send + Sync {
    /// Submits raw transaction bytes. A rejection carries the node's
    /// rejection message; transport failures should be mapped to a
    /// transient-classified message by the implementation.
    async fn broadcast_transaction(&self, raw_tx: &[u8]) -> Result<(), String>;
}

/// Command for the settlement monitor.
#[derive(Debug)]
pub enum MonitorCommand {
    /// Broadcast a settlement transaction and track it to resolution.
    Submit(Transaction),
    /// These transactions were seen as zero-conf by the blockchain
    /// connection; any of them still pending are resolved as broadcast.
    ZcReceived(Vec<Txid>),
    /// These transactions were invalidated by the connection.
    ZcInvalidated(Vec<Txid>),
    /// Stop the monitor loop.
    Shutdown,
}

/// Broadcast lifecycle outcome, emitted once per submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastEvent {
    /// The transaction reached the network.
    Broadcast(Txid),
    /// The node reported a possible double-spend; needs external review.
    Conflicted(Txid),
    /// Terminal rejection; the transaction was dropped from the pool.
    Failed { txid: Txid, reason: String },
    /// A pending transaction was invalidated by the connection.
    Invalidated(Txid),
}

#[derive(Debug)]
struct PendingTx {
    raw_tx: Vec<u8>,
}

/// Tracks the broadcast lifecycle of settlement transactions.
///
/// Submitted transactions stay in the pending pool until the connection
/// reports them as zero-conf (success), they are invalidated, or the node
/// rejects them terminally. The rebroadcast timer only exists while the
/// pool is non-empty, so an idle monitor never wakes up.
pub struct SettlementMonitor {
    backend: Arc<dyn BroadcastBackend>,
    command_receiver: UnboundedReceiver<MonitorCommand>,
    event_sender: UnboundedSender<BroadcastEvent>,
    /// Pending transactions in submission order.
    pending: IndexMap<Txid, PendingTx>,
    rebroadcast_interval: Duration,
}

impl SettlementMonitor {
    /// Constructs a monitor, returning its command sender and outcome event
    /// receiver.
    pub fn new(
        backend: Arc<dyn BroadcastBackend>,
        rebroadcast_interval: Duration,
    ) -> (
        Self,
        UnboundedSender<MonitorCommand>,
        UnboundedReceiver<BroadcastEvent>,
    ) {
        let (command_sender, command_receiver) = unbounded_channel();
        let (event_sender, event_receiver) = unbounded_channel();
        (
            Self {
                backend,
                command_receiver,
                event_sender,
                pending: IndexMap::new(),
                rebroadcast_interval,
            },
            command_sender,
            event_receiver,
        )
    }

    /// The monitor loop. Terminates on [`MonitorCommand::Shutdown`] or when
    /// every command sender has been dropped.
    pub async fn run(mut self) {
        loop {
            if self.pending.is_empty() {
                // No timer while idle.
                match self.command_receiver.recv().await {
                    Some(command) => {
                        if self.handle_command(command).await {
                            return;
                        }
                    }
                    None => return,
                }
                continue;
            }

            // Pool turned non-empty, arm the rebroadcast timer. It is
            // dropped again as soon as the pool drains.
            let mut rebroadcast_timer = tokio::time::interval_at(
                tokio::time::Instant::now() + self.rebroadcast_interval,
                self.rebroadcast_interval,
            );
            rebroadcast_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!("Rebroadcast timer armed");

            while !self.pending.is_empty() {
                tokio::select! {
                    maybe_command = self.command_receiver.recv() => {
                        match maybe_command {
                            Some(command) => {
                                if self.handle_command(command).await {
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                    _ = rebroadcast_timer.tick() => {
                        self.rebroadcast_pending().await;
                    }
                }
            }
            tracing::debug!("Pending pool drained, rebroadcast timer disarmed");
        }
    }

    /// Returns `true` when the monitor should shut down.
    async fn handle_command(&mut self, command: MonitorCommand) -> bool {
        match command {
            MonitorCommand::Submit(transaction) => {
                let txid = transaction.compute_txid();
                if self.pending.contains_key(&txid) {
                    tracing::debug!(%txid, "Transaction already pending, ignoring submit");
                    return false;
                }
                let raw_tx = bitcoin::consensus::serialize(&transaction);
                if self.try_broadcast(txid, &raw_tx).await {
                    self.pending.insert(txid, PendingTx { raw_tx });
                }
                false
            }
            MonitorCommand::ZcReceived(txids) => {
                for txid in txids {
                    if self.pending.shift_remove(&txid).is_some() {
                        tracing::debug!(%txid, "Pending transaction seen as zero-conf");
                        self.emit(BroadcastEvent::Broadcast(txid));
                    }
                }
                false
            }
            MonitorCommand::ZcInvalidated(txids) => {
                for txid in txids {
                    if self.pending.shift_remove(&txid).is_some() {
                        tracing::warn!(%txid, "Pending transaction invalidated");
                        self.emit(BroadcastEvent::Invalidated(txid));
                    }
                }
                false
            }
            MonitorCommand::Shutdown => {
                tracing::debug!(
                    pending = self.pending.len(),
                    "Settlement monitor shutting down"
                );
                true
            }
        }
    }

    /// Resubmits every still-pending transaction once.
    async fn rebroadcast_pending(&mut self) {
        let txids = self.pending.keys().copied().collect::<Vec<_>>();
        for txid in txids {
            let Some(pending) = self.pending.get(&txid) else {
                continue;
            };
            let raw_tx = pending.raw_tx.clone();
            if !self.try_broadcast(txid, &raw_tx).await {
                self.pending.shift_remove(&txid);
            }
        }
    }

    /// Submits once and resolves the outcome. Returns `true` if the
    /// transaction should stay in (or enter) the pending pool.
    async fn try_broadcast(&mut self, txid: Txid, raw_tx: &[u8]) -> bool {
        match self.backend.broadcast_transaction(raw_tx).await {
            Ok(()) => {
                // Accepted; stays pending until seen as zero-conf.
                tracing::debug!(%txid, "Broadcast accepted");
                true
            }
            Err(reason) => match RejectClass::classify(&reason) {
                RejectClass::AlreadyBroadcast => {
                    tracing::debug!(%txid, "Transaction already in mempool");
                    self.emit(BroadcastEvent::Broadcast(txid));
                    false
                }
                RejectClass::Conflict => {
                    tracing::warn!(%txid, reason, "Broadcast conflict");
                    self.emit(BroadcastEvent::Conflicted(txid));
                    false
                }
                RejectClass::Transient => {
                    tracing::debug!(%txid, reason, "Transient broadcast failure, will retry");
                    true
                }
                RejectClass::Fatal => {
                    tracing::error!(%txid, reason, "Broadcast failed");
                    self.emit(BroadcastEvent::Failed { txid, reason });
                    false
                }
            },
        }
    }

    fn emit(&self, event: BroadcastEvent) {
        if self.event_sender.send(event).is_err() {
            tracing::debug!("Broadcast event receiver dropped");
        }
    }
}
