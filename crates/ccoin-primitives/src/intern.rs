//! Interned byte arenas for transaction hashes and script bytes.
//!
//! Many outpoints reference the same transaction hash or the same script, so
//! both are stored exactly once in an append-only arena and referenced by a
//! small integer handle. Snapshots store handles only, which makes them cheap
//! to copy for the copy-on-write update cycle.

use bitcoin::{Script, ScriptBuf, Txid};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Handle of an interned transaction hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxHandle(pub u32);

/// Handle of an interned script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddrHandle(pub u32);

/// Append-only arena of distinct transaction hashes.
#[derive(Debug, Default)]
pub struct TxInterner {
    hashes: Vec<Txid>,
    index: HashMap<Txid, TxHandle>,
}

impl TxInterner {
    /// Interns `txid`, returning the existing handle if it was seen before.
    pub fn intern(&mut self, txid: Txid) -> TxHandle {
        if let Some(handle) = self.index.get(&txid) {
            return *handle;
        }
        let handle = TxHandle(self.hashes.len() as u32);
        self.hashes.push(txid);
        self.index.insert(txid, handle);
        handle
    }

    /// Returns the handle of `txid` if it has been interned.
    pub fn get(&self, txid: &Txid) -> Option<TxHandle> {
        self.index.get(txid).copied()
    }

    /// Resolves a handle back to the transaction hash.
    ///
    /// Handles are only minted by [`Self::intern`], so every handle passed in
    /// is in range.
    pub fn resolve(&self, handle: TxHandle) -> Txid {
        self.hashes[handle.0 as usize]
    }

    /// Number of distinct hashes in the arena.
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Returns `true` if the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Append-only arena of distinct scripts (address identities).
#[derive(Debug, Default)]
pub struct AddrInterner {
    scripts: Vec<ScriptBuf>,
    index: HashMap<ScriptBuf, AddrHandle>,
}

impl AddrInterner {
    /// Interns `script`, returning the existing handle if it was seen before.
    pub fn intern(&mut self, script: &Script) -> AddrHandle {
        if let Some(handle) = self.index.get(script) {
            return *handle;
        }
        let handle = AddrHandle(self.scripts.len() as u32);
        self.scripts.push(script.to_owned());
        self.index.insert(script.to_owned(), handle);
        handle
    }

    /// Returns the handle of `script` if it has been interned.
    pub fn get(&self, script: &Script) -> Option<AddrHandle> {
        self.index.get(script).copied()
    }

    /// Resolves a handle back to the script bytes.
    pub fn resolve(&self, handle: AddrHandle) -> &Script {
        &self.scripts[handle.0 as usize]
    }

    /// Number of distinct scripts in the arena.
    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    /// Returns `true` if the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// Shared pair of arenas backing one tracker and every snapshot it publishes.
///
/// The tracker's dispatch task is the only writer; concurrent readers resolve
/// handles under a read lock.
#[derive(Debug, Default)]
pub struct Interners {
    tx: RwLock<TxInterner>,
    addr: RwLock<AddrInterner>,
}

impl Interners {
    /// Constructs an empty arena pair.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a transaction hash.
    pub fn intern_tx(&self, txid: Txid) -> TxHandle {
        self.tx.write().intern(txid)
    }

    /// Interns a script.
    pub fn intern_addr(&self, script: &Script) -> AddrHandle {
        self.addr.write().intern(script)
    }

    /// Looks up the handle of a transaction hash without interning it.
    pub fn lookup_tx(&self, txid: &Txid) -> Option<TxHandle> {
        self.tx.read().get(txid)
    }

    /// Looks up the handle of a script without interning it.
    pub fn lookup_addr(&self, script: &Script) -> Option<AddrHandle> {
        self.addr.read().get(script)
    }

    /// Resolves a transaction handle to its hash.
    pub fn resolve_tx(&self, handle: TxHandle) -> Txid {
        self.tx.read().resolve(handle)
    }

    /// Resolves an address handle to its script bytes.
    pub fn resolve_addr(&self, handle: AddrHandle) -> ScriptBuf {
        self.addr.read().resolve(handle).to_owned()
    }
}
