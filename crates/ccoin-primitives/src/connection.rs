//! Blockchain-connection abstraction consumed by the tracker.
//!
//! Transport, retry and reconnection are the connection implementation's
//! responsibility; the tracker only reacts to [`ChainNotification`] values
//! and pulls transaction data through [`ChainConnection`].

use bitcoin::{ScriptBuf, Transaction, Txid};

/// Connection error type.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Transaction {0} not found")]
    TxNotFound(Txid),
    #[error("Connection is offline")]
    Offline,
    #[error("Backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Connectivity state reported by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Online,
    Offline,
}

/// A confirmed transaction together with its position in the chain.
#[derive(Debug, Clone)]
pub struct ConfirmedTx {
    /// Height of the confirming block.
    pub height: u32,
    /// Index of the transaction within its block.
    pub tx_index: u32,
    pub tx: Transaction,
}

/// An unconfirmed transaction delivered by the connection.
///
/// The `id` is the connection's monotonically increasing zero-conf sequence
/// number; invalidations reference it.
#[derive(Debug, Clone)]
pub struct ZcEntry {
    pub id: u64,
    pub tx: Transaction,
}

/// Asynchronous notification from the blockchain connection.
///
/// The connection may deliver these from any of its I/O threads; they are
/// funneled onto a single dispatch queue before touching tracker state.
#[derive(Debug)]
pub enum ChainNotification {
    /// The chain's best block changed. `branch_height` is the height of the
    /// fork point; a value below the processed height signals a reorg.
    NewBlock { height: u32, branch_height: u32 },
    /// New unconfirmed transactions arrived.
    ZcReceived(Vec<ZcEntry>),
    /// Previously delivered unconfirmed transactions were invalidated.
    ZcInvalidated(Vec<u64>),
    /// The connection re-synced its registered address set.
    Refresh,
    /// Connectivity changed.
    StateChanged(ChainState),
    /// Stop the dispatch worker; queued notifications after this are dropped.
    Shutdown,
}

/// Interface the tracker requires from its blockchain indexer.
#[async_trait::async_trait]
pub trait ChainConnection: Send + Sync {
    /// Current best block height.
    async fn best_height(&self) -> Result<u32, ConnectionError>;

    /// Registers scripts for targeted notification delivery.
    async fn register_addresses(&self, scripts: Vec<ScriptBuf>) -> Result<(), ConnectionError>;

    /// Batched transaction fetch by hash set.
    async fn get_transactions(&self, txids: &[Txid])
        -> Result<Vec<Transaction>, ConnectionError>;

    /// Confirmed transactions affecting registered addresses within
    /// `from..=to`, in ascending `(height, tx_index)` order.
    async fn confirmed_txs_in_range(
        &self,
        from: u32,
        to: u32,
    ) -> Result<Vec<ConfirmedTx>, ConnectionError>;
}
