//! # Colored Coin Tracker
//!
//! Maintains a consistent, incrementally updated view of a colored-coin
//! asset's UTXO set and ownership graph: confirmed history, zero-confirmation
//! transactions, reorganizations and revocations.
//!
//! ## Concurrency model
//!
//! The tracker holds no internal locks for its update logic. All mutating
//! calls are funneled through [`TrackerWorker`], a single task consuming a
//! FIFO notification queue, so updates are serialized by construction no
//! matter how many threads the blockchain connection delivers callbacks on.
//! Readers obtain whole immutable snapshots through [`TrackerHandle`] with a
//! single publication-cell load and never block the update path.
//!
//! ## Update discipline
//!
//! Every update cycle clones the published snapshot, applies the entire
//! batch to that working copy in chain order, and publishes the result only
//! if the whole batch succeeded. A mid-batch failure discards the working
//! copy and leaves the previous snapshot live.

mod tracker;
mod worker;


pub use self::tracker::{ColoredCoinTracker, SpendableOutpoint, TrackerHandle, ZC_HEIGHT};
pub use self::worker::{TrackerEventSender, TrackerWorker};

use ccoin_primitives::{ConnectionError, StateError};

/// Tracker error type.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// Configuration setters are only legal before `go_online`.
    #[error("Tracker is already online")]
    AlreadyOnline,
    #[error("Tracker is not online")]
    NotOnline,
    #[error("coins_per_share must be a positive integer, got {0}")]
    InvalidCoinsPerShare(u64),
    #[error("At least one origin address is required to go online")]
    NoOriginAddresses,
    #[error("Transaction {0} not present in prefetched batch")]
    MissingPrevTx(bitcoin::Txid),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    State(#[from] StateError),
}
