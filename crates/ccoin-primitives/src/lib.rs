//! # Colored Coin Primitives
//!
//! Value types shared by the colored-coin tracking engine and its
//! serialization/distribution layers: interned byte arenas, outpoints, the
//! UTXO set and its address back-reference index, the two snapshot
//! structures, the snapshot publication cell and the blockchain-connection
//! abstraction.
//!
//! Snapshots are immutable once published. The tracker builds a fresh
//! snapshot in isolation and swaps it in wholesale, so a reader always
//! observes a fully consistent state through a single [`Publication::load`].

mod connection;
mod intern;
mod publish;
#[cfg(test)]
mod tests;

pub use self::connection::{
    ChainConnection, ChainNotification, ChainState, ConfirmedTx, ConnectionError, ZcEntry,
};
pub use self::intern::{AddrHandle, AddrInterner, Interners, TxHandle, TxInterner};
pub use self::publish::Publication;

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Errors indicating a violated snapshot invariant.
///
/// These are logic defects, not recoverable runtime conditions: the batch
/// that triggered one is discarded and the previously published snapshot
/// stays live.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Duplicate outpoint {0:?}:{1} in UTXO set")]
    DuplicateOutpoint(TxHandle, u32),
    #[error("Duplicate back-reference {1:?}:{2} for address {0:?}")]
    DuplicateBackRef(AddrHandle, TxHandle, u32),
    #[error("Missing back-reference {1:?}:{2} for address {0:?}")]
    MissingBackRef(AddrHandle, TxHandle, u32),
    #[error("Back-reference {1:?}:{2} of address {0:?} has no UTXO entry")]
    DanglingBackRef(AddrHandle, TxHandle, u32),
}

/// Identifies one output position, `(tx hash, output index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutPointRef {
    pub tx: TxHandle,
    pub index: u32,
}

/// One spendable colored-coin-bearing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcOutpoint {
    /// Colored value carried by this output, in satoshi-equivalent units.
    pub value: u64,
    /// Output index within its transaction.
    pub index: u32,
    /// Handle of the transaction hash.
    pub tx: TxHandle,
    /// Handle of the owning script.
    pub addr: AddrHandle,
}

impl CcOutpoint {
    /// The `(tx, index)` position of this outpoint.
    pub fn out_ref(&self) -> OutPointRef {
        OutPointRef {
            tx: self.tx,
            index: self.index,
        }
    }
}

impl PartialOrd for CcOutpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CcOutpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.out_ref().cmp(&other.out_ref())
    }
}

/// The set of unspent colored outputs, grouped by transaction hash.
///
/// Invariant: a `(tx, index)` pair appears at most once.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CcUtxoSet {
    by_tx: HashMap<TxHandle, BTreeMap<u32, CcOutpoint>>,
}

impl CcUtxoSet {
    /// Inserts an outpoint, failing on a duplicate `(tx, index)` pair.
    pub fn insert(&mut self, outpoint: CcOutpoint) -> Result<(), StateError> {
        let entry = self.by_tx.entry(outpoint.tx).or_default();
        if entry.contains_key(&outpoint.index) {
            return Err(StateError::DuplicateOutpoint(outpoint.tx, outpoint.index));
        }
        entry.insert(outpoint.index, outpoint);
        Ok(())
    }

    /// Removes and returns the outpoint at `(tx, index)`, if present.
    pub fn remove(&mut self, tx: TxHandle, index: u32) -> Option<CcOutpoint> {
        let entry = self.by_tx.get_mut(&tx)?;
        let removed = entry.remove(&index);
        if entry.is_empty() {
            self.by_tx.remove(&tx);
        }
        removed
    }

    /// Returns the outpoint at `(tx, index)`, if present.
    pub fn get(&self, tx: TxHandle, index: u32) -> Option<&CcOutpoint> {
        self.by_tx.get(&tx).and_then(|outputs| outputs.get(&index))
    }

    /// Returns `true` if `(tx, index)` is present.
    pub fn contains(&self, tx: TxHandle, index: u32) -> bool {
        self.get(tx, index).is_some()
    }

    /// Iterates over all outpoints.
    pub fn iter(&self) -> impl Iterator<Item = &CcOutpoint> {
        self.by_tx.values().flat_map(|outputs| outputs.values())
    }

    /// Iterates over `(tx, outputs)` groups.
    pub fn tx_groups(&self) -> impl Iterator<Item = (TxHandle, &BTreeMap<u32, CcOutpoint>)> {
        self.by_tx.iter().map(|(tx, outputs)| (*tx, outputs))
    }

    /// Total number of outpoints.
    pub fn len(&self) -> usize {
        self.by_tx.values().map(BTreeMap::len).sum()
    }

    /// Returns `true` if the set holds no outpoints.
    pub fn is_empty(&self) -> bool {
        self.by_tx.is_empty()
    }

    /// Sum of colored value across all outpoints.
    pub fn total_value(&self) -> u64 {
        self.iter().map(|outpoint| outpoint.value).sum()
    }
}

/// Address-to-outpoints back-reference index.
///
/// Holds positions only; ownership of the outpoints stays with [`CcUtxoSet`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScrAddrCcSet {
    by_addr: HashMap<AddrHandle, BTreeSet<OutPointRef>>,
}

impl ScrAddrCcSet {
    /// Records that `addr` owns the outpoint at `out_ref`.
    pub fn add(&mut self, addr: AddrHandle, out_ref: OutPointRef) -> Result<(), StateError> {
        if !self.by_addr.entry(addr).or_default().insert(out_ref) {
            return Err(StateError::DuplicateBackRef(addr, out_ref.tx, out_ref.index));
        }
        Ok(())
    }

    /// Removes the back-reference of `addr` to `out_ref`.
    pub fn remove(&mut self, addr: AddrHandle, out_ref: OutPointRef) -> Result<(), StateError> {
        let Some(refs) = self.by_addr.get_mut(&addr) else {
            return Err(StateError::MissingBackRef(addr, out_ref.tx, out_ref.index));
        };
        if !refs.remove(&out_ref) {
            return Err(StateError::MissingBackRef(addr, out_ref.tx, out_ref.index));
        }
        if refs.is_empty() {
            self.by_addr.remove(&addr);
        }
        Ok(())
    }

    /// Positions owned by `addr`.
    pub fn outpoints_for(&self, addr: AddrHandle) -> Option<&BTreeSet<OutPointRef>> {
        self.by_addr.get(&addr)
    }

    /// Iterates over `(addr, positions)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (AddrHandle, &BTreeSet<OutPointRef>)> {
        self.by_addr.iter().map(|(addr, refs)| (*addr, refs))
    }

    /// Number of addresses with at least one outpoint.
    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    /// Returns `true` if no address owns any outpoint.
    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }
}

/// UTXO set plus its address index, mutated in lock-step.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CcCoinSet {
    pub utxo_set: CcUtxoSet,
    pub scr_addr_set: ScrAddrCcSet,
}

impl CcCoinSet {
    /// Adds a colored outpoint to both the UTXO set and the address index.
    pub fn add_outpoint(&mut self, outpoint: CcOutpoint) -> Result<(), StateError> {
        self.utxo_set.insert(outpoint)?;
        self.scr_addr_set.add(outpoint.addr, outpoint.out_ref())
    }

    /// Spends the outpoint at `(tx, index)`, removing it from both sides.
    ///
    /// Returns `Ok(None)` if the position is not tracked.
    pub fn spend_outpoint(
        &mut self,
        tx: TxHandle,
        index: u32,
    ) -> Result<Option<CcOutpoint>, StateError> {
        match self.utxo_set.remove(tx, index) {
            Some(outpoint) => {
                self.scr_addr_set.remove(outpoint.addr, outpoint.out_ref())?;
                Ok(Some(outpoint))
            }
            None => Ok(None),
        }
    }

    /// Colored value of the output at `(tx, index)`, if tracked.
    pub fn value_of(&self, tx: TxHandle, index: u32) -> Option<u64> {
        self.utxo_set.get(tx, index).map(|outpoint| outpoint.value)
    }

    /// Outpoints currently owned by `addr`.
    pub fn outpoints_for(&self, addr: AddrHandle) -> Vec<CcOutpoint> {
        let Some(refs) = self.scr_addr_set.outpoints_for(addr) else {
            return Vec::new();
        };
        refs.iter()
            .filter_map(|out_ref| self.utxo_set.get(out_ref.tx, out_ref.index))
            .copied()
            .collect()
    }

    /// Verifies that the UTXO set and the address index agree exactly.
    pub fn check_consistency(&self) -> Result<(), StateError> {
        for (addr, refs) in self.scr_addr_set.iter() {
            for out_ref in refs {
                match self.utxo_set.get(out_ref.tx, out_ref.index) {
                    Some(outpoint) if outpoint.addr == addr => {}
                    _ => return Err(StateError::DanglingBackRef(addr, out_ref.tx, out_ref.index)),
                }
            }
        }
        for outpoint in self.utxo_set.iter() {
            let present = self
                .scr_addr_set
                .outpoints_for(outpoint.addr)
                .is_some_and(|refs| refs.contains(&outpoint.out_ref()));
            if !present {
                return Err(StateError::MissingBackRef(
                    outpoint.addr,
                    outpoint.tx,
                    outpoint.index,
                ));
            }
        }
        Ok(())
    }
}

/// Set of `(tx, index)` positions, grouped by transaction hash.
///
/// Used for the confirmed transaction history and for zero-conf
/// spent-output tracking.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OutPointsSet {
    by_tx: HashMap<TxHandle, BTreeSet<u32>>,
}

impl OutPointsSet {
    /// Inserts a position, returning `false` if it was already present.
    pub fn insert(&mut self, tx: TxHandle, index: u32) -> bool {
        self.by_tx.entry(tx).or_default().insert(index)
    }

    /// Returns `true` if the position is present.
    pub fn contains(&self, tx: TxHandle, index: u32) -> bool {
        self.by_tx
            .get(&tx)
            .is_some_and(|indices| indices.contains(&index))
    }

    /// Returns `true` if any position of `tx` is present.
    pub fn contains_tx(&self, tx: TxHandle) -> bool {
        self.by_tx.contains_key(&tx)
    }

    /// Iterates over `(tx, indices)` groups.
    pub fn iter(&self) -> impl Iterator<Item = (TxHandle, &BTreeSet<u32>)> {
        self.by_tx.iter().map(|(tx, indices)| (*tx, indices))
    }

    /// Total number of positions.
    pub fn len(&self) -> usize {
        self.by_tx.values().map(BTreeSet::len).sum()
    }

    /// Returns `true` if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.by_tx.is_empty()
    }
}

/// Confirmed-chain snapshot of the tracked asset.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ColoredCoinSnapshot {
    /// UTXO set and address index as of the snapshot's height.
    pub coins: CcCoinSet,
    /// Revoked address -> height at which the revocation confirmed.
    pub revoked_addresses: HashMap<AddrHandle, u32>,
    /// Every `(tx, index)` ever seen carrying color.
    pub tx_history: OutPointsSet,
}

impl ColoredCoinSnapshot {
    /// Returns `true` if `addr` has been revoked.
    pub fn is_revoked(&self, addr: AddrHandle) -> bool {
        self.revoked_addresses.contains_key(&addr)
    }
}

/// Zero-confirmation snapshot layered on top of the confirmed snapshot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ColoredCoinZcSnapshot {
    /// Outputs created by unconfirmed transactions.
    pub coins: CcCoinSet,
    /// Outputs consumed by unconfirmed transactions: confirmed outputs as
    /// well as outputs created earlier in this layer.
    pub spent_outputs: OutPointsSet,
}
