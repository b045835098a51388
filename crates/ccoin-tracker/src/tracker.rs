//! The colored-coin tracking engine.

use crate::TrackerError;
use bitcoin::{ScriptBuf, Transaction, Txid};
use ccoin_primitives::{
    AddrHandle, CcOutpoint, ChainConnection, ChainState, ColoredCoinSnapshot,
    ColoredCoinZcSnapshot, ConfirmedTx, Interners, OutPointRef, Publication, ZcEntry,
};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

/// Pseudo-height denoting the zero-confirmation layer in value queries.
pub const ZC_HEIGHT: u32 = u32::MAX;

/// A spendable colored outpoint resolved to concrete chain types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendableOutpoint {
    pub txid: Txid,
    pub vout: u32,
    /// Colored value in satoshi-equivalent units.
    pub value: u64,
}

/// Read-only surface of a tracker, cheap to clone and safe to use from any
/// thread. Backed by the publication cells; reads never block updates.
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    coins_per_share: u64,
    interners: Arc<Interners>,
    snapshot_cell: Arc<Publication<ColoredCoinSnapshot>>,
    zc_cell: Arc<Publication<ColoredCoinZcSnapshot>>,
}

impl TrackerHandle {
    /// The currently published confirmed snapshot.
    pub fn snapshot(&self) -> Arc<ColoredCoinSnapshot> {
        self.snapshot_cell.load()
    }

    /// The currently published zero-confirmation snapshot.
    pub fn zc_snapshot(&self) -> Arc<ColoredCoinZcSnapshot> {
        self.zc_cell.load()
    }

    /// Watch channel bumped on every confirmed-snapshot publish.
    pub fn subscribe_snapshot(&self) -> watch::Receiver<u64> {
        self.snapshot_cell.subscribe()
    }

    /// Watch channel bumped on every zero-conf-snapshot publish.
    pub fn subscribe_zc_snapshot(&self) -> watch::Receiver<u64> {
        self.zc_cell.subscribe()
    }

    /// The arenas backing snapshots published by this tracker.
    pub fn interners(&self) -> &Arc<Interners> {
        &self.interners
    }

    /// The configured denomination factor of the tracked asset.
    pub fn coins_per_share(&self) -> u64 {
        self.coins_per_share
    }

    /// Colored value of the output at `(txid, vout)`.
    ///
    /// `height` selects the layer: [`ZC_HEIGHT`] consults the zero-conf
    /// layer only, any other value checks confirmed first, then zero-conf.
    pub fn get_cc_output_value(&self, txid: &Txid, vout: u32, height: u32) -> Option<u64> {
        let tx = self.interners.lookup_tx(txid)?;
        if height == ZC_HEIGHT {
            return self.zc_snapshot().coins.value_of(tx, vout);
        }
        self.snapshot()
            .coins
            .value_of(tx, vout)
            .or_else(|| self.zc_snapshot().coins.value_of(tx, vout))
    }

    /// Unspent colored outpoints owned by `script`.
    ///
    /// With `include_zc`, zero-conf spends are subtracted and zero-conf
    /// creations added on top of the confirmed state. Revoked addresses own
    /// nothing spendable.
    pub fn get_spendable_outpoints_for_address(
        &self,
        script: &ScriptBuf,
        include_zc: bool,
    ) -> Vec<SpendableOutpoint> {
        let Some(addr) = self.interners.lookup_addr(script) else {
            return Vec::new();
        };
        let snapshot = self.snapshot();
        if snapshot.is_revoked(addr) {
            return Vec::new();
        }

        let zc_snapshot = self.zc_snapshot();
        let mut spendable = Vec::new();

        for outpoint in snapshot.coins.outpoints_for(addr) {
            if include_zc && zc_snapshot.spent_outputs.contains(outpoint.tx, outpoint.index) {
                continue;
            }
            spendable.push(self.resolve(&outpoint));
        }

        if include_zc {
            for outpoint in zc_snapshot.coins.outpoints_for(addr) {
                spendable.push(self.resolve(&outpoint));
            }
        }

        spendable
    }

    /// Confirmed colored balance of `script`.
    pub fn confirmed_balance(&self, script: &ScriptBuf) -> u64 {
        self.get_spendable_outpoints_for_address(script, false)
            .iter()
            .map(|outpoint| outpoint.value)
            .sum()
    }

    /// Colored balance of `script` including the zero-conf layer.
    pub fn total_balance(&self, script: &ScriptBuf) -> u64 {
        self.get_spendable_outpoints_for_address(script, true)
            .iter()
            .map(|outpoint| outpoint.value)
            .sum()
    }

    /// Union balance over a set of addresses.
    pub fn balance_for_addresses(&self, scripts: &[ScriptBuf], include_zc: bool) -> u64 {
        let unique = scripts.iter().collect::<HashSet<_>>();
        unique
            .into_iter()
            .map(|script| {
                self.get_spendable_outpoints_for_address(script, include_zc)
                    .iter()
                    .map(|outpoint| outpoint.value)
                    .sum::<u64>()
            })
            .sum()
    }

    fn resolve(&self, outpoint: &CcOutpoint) -> SpendableOutpoint {
        SpendableOutpoint {
            txid: self.interners.resolve_tx(outpoint.tx),
            vout: outpoint.index,
            value: outpoint.value,
        }
    }
}

/// A zero-conf transaction retained for replay after purges and reorgs.
#[derive(Debug, Clone)]
struct PooledZcTx {
    id: u64,
    tx: Transaction,
}

/// Tracks one colored coin, defined by its origin addresses, revocation
/// addresses and `coins_per_share` denomination factor.
pub struct ColoredCoinTracker {
    connection: Arc<dyn ChainConnection>,
    coins_per_share: u64,
    origin_addresses: HashSet<ScriptBuf>,
    revocation_addresses: HashSet<ScriptBuf>,
    start_height: u32,
    /// Height the next confirmed scan starts from (inclusive).
    scan_from: u32,
    processed_height: u32,
    processed_zc_index: u64,
    online: bool,
    suspended: bool,
    /// Zero-conf transactions in arrival order, keyed by txid.
    zc_pool: IndexMap<Txid, PooledZcTx>,
    /// Addresses already registered with the connection for targeted
    /// notification delivery. Grows as coloring spreads to new addresses.
    registered_addrs: HashSet<AddrHandle>,
    interners: Arc<Interners>,
    snapshot_cell: Arc<Publication<ColoredCoinSnapshot>>,
    zc_cell: Arc<Publication<ColoredCoinZcSnapshot>>,
}

impl ColoredCoinTracker {
    /// Constructs a tracker in its configuration phase.
    pub fn new(
        connection: Arc<dyn ChainConnection>,
        coins_per_share: u64,
    ) -> Result<Self, TrackerError> {
        if coins_per_share == 0 {
            return Err(TrackerError::InvalidCoinsPerShare(coins_per_share));
        }
        Ok(Self {
            connection,
            coins_per_share,
            origin_addresses: HashSet::new(),
            revocation_addresses: HashSet::new(),
            start_height: 0,
            scan_from: 0,
            processed_height: 0,
            processed_zc_index: 0,
            online: false,
            suspended: false,
            zc_pool: IndexMap::new(),
            registered_addrs: HashSet::new(),
            interners: Arc::new(Interners::new()),
            snapshot_cell: Arc::new(Publication::default()),
            zc_cell: Arc::new(Publication::default()),
        })
    }

    /// Adds an origin (minting) address. Only legal before [`Self::go_online`].
    pub fn add_origin_address(&mut self, script: ScriptBuf) -> Result<(), TrackerError> {
        self.ensure_config_phase()?;
        self.origin_addresses.insert(script);
        Ok(())
    }

    /// Adds a revocation address. Only legal before [`Self::go_online`].
    pub fn add_revocation_address(&mut self, script: ScriptBuf) -> Result<(), TrackerError> {
        self.ensure_config_phase()?;
        self.revocation_addresses.insert(script);
        Ok(())
    }

    /// Overrides the scan start height. Only legal before [`Self::go_online`].
    pub fn set_start_height(&mut self, height: u32) -> Result<(), TrackerError> {
        self.ensure_config_phase()?;
        self.start_height = height;
        Ok(())
    }

    /// Returns a cloneable read-only handle.
    pub fn handle(&self) -> TrackerHandle {
        TrackerHandle {
            coins_per_share: self.coins_per_share,
            interners: self.interners.clone(),
            snapshot_cell: self.snapshot_cell.clone(),
            zc_cell: self.zc_cell.clone(),
        }
    }

    /// The currently published confirmed snapshot.
    pub fn snapshot(&self) -> Arc<ColoredCoinSnapshot> {
        self.snapshot_cell.load()
    }

    /// The currently published zero-confirmation snapshot.
    pub fn zc_snapshot(&self) -> Arc<ColoredCoinZcSnapshot> {
        self.zc_cell.load()
    }

    /// Highest confirmed height applied to the published snapshot.
    pub fn processed_height(&self) -> u32 {
        self.processed_height
    }

    /// Transitions from configuration to active monitoring: registers the
    /// configured addresses, performs the initial scan up to the current best
    /// height and publishes the resulting snapshot.
    ///
    /// A second call is a logic error, not a silent no-op.
    pub async fn go_online(&mut self) -> Result<(), TrackerError> {
        if self.online {
            return Err(TrackerError::AlreadyOnline);
        }
        if self.origin_addresses.is_empty() {
            return Err(TrackerError::NoOriginAddresses);
        }

        let watched = self
            .origin_addresses
            .iter()
            .chain(self.revocation_addresses.iter())
            .cloned()
            .collect::<Vec<_>>();
        self.connection.register_addresses(watched).await?;

        self.online = true;
        self.scan_from = self.start_height;
        self.processed_height = self.start_height;

        tracing::info!(
            start_height = self.start_height,
            origin_addresses = self.origin_addresses.len(),
            revocation_addresses = self.revocation_addresses.len(),
            "Tracker going online, starting initial scan"
        );

        self.update().await
    }

    /// Advances the confirmed snapshot to the connection's best height.
    pub async fn update(&mut self) -> Result<(), TrackerError> {
        if !self.online {
            return Err(TrackerError::NotOnline);
        }
        if self.suspended {
            tracing::debug!("Connection offline, skipping confirmed update");
            return Ok(());
        }

        let best_height = self.connection.best_height().await?;
        let from = self.scan_from;
        if best_height < from {
            return Ok(());
        }

        let batch = self
            .connection
            .confirmed_txs_in_range(from, best_height)
            .await?;

        // Work on a clone of the published snapshot; readers keep seeing the
        // previous state until the whole batch has been applied.
        let mut working = (*self.snapshot_cell.load()).clone();
        self.process_tx_batch(&mut working, &batch).await?;
        working.coins.check_consistency()?;

        // Coloring may have reached addresses the connection is not yet
        // delivering notifications for; extend the registration before the
        // new snapshot becomes visible.
        let newly_tracked = working
            .coins
            .scr_addr_set
            .iter()
            .map(|(addr, _)| addr)
            .filter(|addr| !self.registered_addrs.contains(addr))
            .collect::<Vec<_>>();
        if !newly_tracked.is_empty() {
            let scripts = newly_tracked
                .iter()
                .map(|addr| self.interners.resolve_addr(*addr))
                .collect::<Vec<_>>();
            self.connection.register_addresses(scripts).await?;
            self.registered_addrs.extend(newly_tracked);
        }

        tracing::debug!(
            from,
            to = best_height,
            transactions = batch.len(),
            utxos = working.coins.utxo_set.len(),
            "Confirmed update applied"
        );

        self.snapshot_cell.publish(working);
        self.scan_from = best_height + 1;
        self.processed_height = best_height;
        Ok(())
    }

    /// Applies newly arrived zero-conf transactions on top of the confirmed
    /// snapshot. Conflicting double-spends are skipped and reported via the
    /// returned list.
    pub async fn zc_update(&mut self, entries: Vec<ZcEntry>) -> Result<Vec<Txid>, TrackerError> {
        if !self.online {
            return Err(TrackerError::NotOnline);
        }
        if self.suspended {
            tracing::debug!("Connection offline, skipping zero-conf update");
            return Ok(Vec::new());
        }

        let confirmed = self.snapshot_cell.load();
        let mut working = (*self.zc_cell.load()).clone();
        let mut conflicts = Vec::new();

        let prev_txs = self
            .prefetch_prev_txs(entries.iter().map(|entry| &entry.tx))
            .await?;

        for entry in entries {
            let txid = entry.tx.compute_txid();
            if self.zc_pool.contains_key(&txid) {
                tracing::debug!(%txid, "Zero-conf transaction already pooled");
                continue;
            }
            if entry.id > self.processed_zc_index {
                self.processed_zc_index = entry.id;
            }

            match self.apply_zc_tx(&confirmed, &mut working, &entry.tx, &prev_txs)? {
                ZcOutcome::Applied => {
                    self.zc_pool.insert(
                        txid,
                        PooledZcTx {
                            id: entry.id,
                            tx: entry.tx,
                        },
                    );
                }
                ZcOutcome::Conflict(out_ref) => {
                    tracing::warn!(
                        %txid,
                        spent_tx = ?out_ref.tx,
                        spent_index = out_ref.index,
                        "Zero-conf double-spend rejected"
                    );
                    conflicts.push(txid);
                }
                ZcOutcome::Unrelated => {}
            }
        }

        working.coins.check_consistency()?;
        self.zc_cell.publish(working);
        Ok(conflicts)
    }

    /// Removes zero-conf entries that have since confirmed or were
    /// invalidated, then rebuilds the zero-conf snapshot from the survivors.
    pub async fn purge_zc(&mut self) -> Result<(), TrackerError> {
        if !self.online {
            return Err(TrackerError::NotOnline);
        }

        let confirmed = self.snapshot_cell.load();
        let before = self.zc_pool.len();
        let interners = &self.interners;
        self.zc_pool.retain(|txid, _| {
            let confirmed_now = interners
                .lookup_tx(txid)
                .is_some_and(|tx| confirmed.tx_history.contains_tx(tx));
            !confirmed_now
        });

        if self.zc_pool.len() != before {
            tracing::debug!(
                purged = before - self.zc_pool.len(),
                remaining = self.zc_pool.len(),
                "Purged confirmed zero-conf entries"
            );
        }

        self.rebuild_zc().await
    }

    /// Drops invalidated zero-conf transactions and rebuilds the layer.
    pub async fn invalidate_zc(&mut self, ids: Vec<u64>) -> Result<Vec<Txid>, TrackerError> {
        if !self.online {
            return Err(TrackerError::NotOnline);
        }

        let ids = ids.into_iter().collect::<HashSet<_>>();
        let mut dropped = Vec::new();
        self.zc_pool.retain(|txid, pooled| {
            if ids.contains(&pooled.id) {
                dropped.push(*txid);
                false
            } else {
                true
            }
        });

        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "Invalidated zero-conf entries");
            self.rebuild_zc().await?;
        }
        Ok(dropped)
    }

    /// Handles a chain reorganization.
    ///
    /// Zero-conf state is presumptively invalid after any reorg and is
    /// discarded and replayed. A hard reorg additionally resets the confirmed
    /// snapshot and replays the scan from the start height.
    pub async fn reorg(&mut self, hard: bool) -> Result<(), TrackerError> {
        if !self.online {
            return Err(TrackerError::NotOnline);
        }

        tracing::info!(hard, processed_height = self.processed_height, "Handling reorg");

        if hard {
            self.snapshot_cell.publish(ColoredCoinSnapshot::default());
            self.scan_from = self.start_height;
            self.processed_height = self.start_height;
            self.update().await?;
        }

        self.rebuild_zc().await
    }

    /// Marks the connection online/offline. Updates are suspended while
    /// offline; coming back online triggers a catch-up cycle.
    pub async fn set_chain_state(&mut self, state: ChainState) -> Result<(), TrackerError> {
        match state {
            ChainState::Offline => {
                tracing::warn!("Blockchain connection lost, suspending updates");
                self.suspended = true;
                Ok(())
            }
            ChainState::Online => {
                let was_suspended = self.suspended;
                self.suspended = false;
                if was_suspended && self.online {
                    tracing::info!("Blockchain connection restored, catching up");
                    self.update().await?;
                    self.purge_zc().await?;
                }
                Ok(())
            }
        }
    }

    fn ensure_config_phase(&self) -> Result<(), TrackerError> {
        if self.online {
            return Err(TrackerError::AlreadyOnline);
        }
        Ok(())
    }

    /// Applies a batch of confirmed transactions to `working`, in the chain
    /// order the connection delivered them.
    async fn process_tx_batch(
        &self,
        working: &mut ColoredCoinSnapshot,
        batch: &[ConfirmedTx],
    ) -> Result<(), TrackerError> {
        let prev_txs = self
            .prefetch_prev_txs(batch.iter().map(|confirmed| &confirmed.tx))
            .await?;

        for confirmed in batch {
            self.apply_confirmed_tx(working, &confirmed.tx, confirmed.height, &prev_txs)?;
        }
        Ok(())
    }

    /// Fetches, in one batched request, every previous transaction referenced
    /// by the inputs of `txs` that is not part of the batch itself.
    async fn prefetch_prev_txs(
        &self,
        txs: impl Iterator<Item = &Transaction> + Clone,
    ) -> Result<HashMap<Txid, Transaction>, TrackerError> {
        let batch_txids = txs
            .clone()
            .map(|tx| tx.compute_txid())
            .collect::<HashSet<_>>();

        let mut wanted = HashSet::new();
        for tx in txs.clone() {
            for input in &tx.input {
                let prev = input.previous_output;
                if prev.is_null() || batch_txids.contains(&prev.txid) {
                    continue;
                }
                wanted.insert(prev.txid);
            }
        }

        let mut prev_txs = txs
            .map(|tx| (tx.compute_txid(), tx.clone()))
            .collect::<HashMap<_, _>>();

        if !wanted.is_empty() {
            let wanted = wanted.into_iter().collect::<Vec<_>>();
            let fetched = self.connection.get_transactions(&wanted).await?;
            for tx in fetched {
                prev_txs.insert(tx.compute_txid(), tx);
            }
        }

        Ok(prev_txs)
    }

    fn apply_confirmed_tx(
        &self,
        working: &mut ColoredCoinSnapshot,
        tx: &Transaction,
        height: u32,
        prev_txs: &HashMap<Txid, Transaction>,
    ) -> Result<(), TrackerError> {
        let mut colored_in = 0u64;
        let mut spent = Vec::new();
        let mut revocation_spenders = Vec::new();

        for input in &tx.input {
            let prev = input.previous_output;
            if prev.is_null() {
                continue;
            }

            let tracked = self
                .interners
                .lookup_tx(&prev.txid)
                .and_then(|handle| working.coins.utxo_set.get(handle, prev.vout).copied());

            if let Some(outpoint) = tracked {
                let spender = self.interners.resolve_addr(outpoint.addr);
                if self.revocation_addresses.contains(&spender) {
                    revocation_spenders.push(outpoint.addr);
                } else if !working.is_revoked(outpoint.addr) {
                    colored_in += outpoint.value;
                }
                spent.push(outpoint.out_ref());
                continue;
            }

            // Untracked input: resolve the spent output to check whether it
            // belongs to an origin or revocation address.
            let Some(spent_output) = lookup_prev_output(prev_txs, &prev.txid, prev.vout) else {
                return Err(TrackerError::MissingPrevTx(prev.txid));
            };
            let script = &spent_output.script_pubkey;
            if self.revocation_addresses.contains(script) {
                revocation_spenders.push(self.interners.intern_addr(script));
            } else if self.origin_addresses.contains(script) {
                let addr = self.interners.intern_addr(script);
                if !working.is_revoked(addr) {
                    colored_in += spent_output.value.to_sat();
                }
            }
        }

        // Consumed outpoints leave the UTXO set in every case.
        for out_ref in &spent {
            working.coins.spend_outpoint(out_ref.tx, out_ref.index)?;
        }

        if !revocation_spenders.is_empty() {
            let txid = tx.compute_txid();
            for addr in revocation_spenders {
                working.revoked_addresses.entry(addr).or_insert(height);
            }
            tracing::info!(%txid, height, "Revocation spend processed, color not propagated");
            return Ok(());
        }

        if colored_in == 0 {
            return Ok(());
        }

        let tx_handle = self.interners.intern_tx(tx.compute_txid());
        for allocation in self.allocate_outputs(tx, colored_in) {
            let outpoint = CcOutpoint {
                value: allocation.value,
                index: allocation.vout,
                tx: tx_handle,
                addr: self.interners.intern_addr(&allocation.script),
            };
            working.coins.add_outpoint(outpoint)?;
            working.tx_history.insert(tx_handle, allocation.vout);
        }

        Ok(())
    }

    fn apply_zc_tx(
        &self,
        confirmed: &ColoredCoinSnapshot,
        working: &mut ColoredCoinZcSnapshot,
        tx: &Transaction,
        prev_txs: &HashMap<Txid, Transaction>,
    ) -> Result<ZcOutcome, TrackerError> {
        let mut colored_in = 0u64;
        let mut spent_zc = Vec::new();
        let mut spent_confirmed = Vec::new();
        let mut revokes = false;

        // Classify every input before mutating anything, so a conflicting
        // transaction is rejected as a whole.
        for input in &tx.input {
            let prev = input.previous_output;
            if prev.is_null() {
                continue;
            }
            let Some(handle) = self.interners.lookup_tx(&prev.txid) else {
                if let Some(outcome) =
                    self.classify_untracked_zc_input(confirmed, prev_txs, &prev.txid, prev.vout)?
                {
                    match outcome {
                        UntrackedInput::Origin(value) => colored_in += value,
                        UntrackedInput::Revocation => revokes = true,
                    }
                }
                continue;
            };

            if let Some(outpoint) = working.coins.utxo_set.get(handle, prev.vout) {
                let spender = self.interners.resolve_addr(outpoint.addr);
                if self.revocation_addresses.contains(&spender) {
                    revokes = true;
                } else if !confirmed.is_revoked(outpoint.addr) {
                    colored_in += outpoint.value;
                }
                spent_zc.push(outpoint.out_ref());
            } else if let Some(outpoint) = confirmed.coins.utxo_set.get(handle, prev.vout) {
                let out_ref = outpoint.out_ref();
                if working.spent_outputs.contains(out_ref.tx, out_ref.index) {
                    return Ok(ZcOutcome::Conflict(out_ref));
                }
                let spender = self.interners.resolve_addr(outpoint.addr);
                if self.revocation_addresses.contains(&spender) {
                    revokes = true;
                } else if !confirmed.is_revoked(outpoint.addr) {
                    colored_in += outpoint.value;
                }
                spent_confirmed.push(out_ref);
            } else if working.spent_outputs.contains(handle, prev.vout) {
                // Neither set holds the output but this layer already
                // consumed it, so it was created and spent unconfirmed; a
                // second spend is a conflict just like the confirmed case.
                return Ok(ZcOutcome::Conflict(OutPointRef {
                    tx: handle,
                    index: prev.vout,
                }));
            } else if let Some(outcome) =
                self.classify_untracked_zc_input(confirmed, prev_txs, &prev.txid, prev.vout)?
            {
                match outcome {
                    UntrackedInput::Origin(value) => colored_in += value,
                    UntrackedInput::Revocation => revokes = true,
                }
            }
        }

        if colored_in == 0 && spent_zc.is_empty() && spent_confirmed.is_empty() && !revokes {
            return Ok(ZcOutcome::Unrelated);
        }

        for out_ref in &spent_zc {
            working.coins.spend_outpoint(out_ref.tx, out_ref.index)?;
            working.spent_outputs.insert(out_ref.tx, out_ref.index);
        }
        for out_ref in &spent_confirmed {
            working.spent_outputs.insert(out_ref.tx, out_ref.index);
        }

        // Revocation heights are only recorded on confirmation; an
        // unconfirmed revocation spend just stops color propagation.
        if revokes || colored_in == 0 {
            return Ok(ZcOutcome::Applied);
        }

        let tx_handle = self.interners.intern_tx(tx.compute_txid());
        for allocation in self.allocate_outputs(tx, colored_in) {
            working.coins.add_outpoint(CcOutpoint {
                value: allocation.value,
                index: allocation.vout,
                tx: tx_handle,
                addr: self.interners.intern_addr(&allocation.script),
            })?;
        }

        Ok(ZcOutcome::Applied)
    }

    fn classify_untracked_zc_input(
        &self,
        confirmed: &ColoredCoinSnapshot,
        prev_txs: &HashMap<Txid, Transaction>,
        prev_txid: &Txid,
        vout: u32,
    ) -> Result<Option<UntrackedInput>, TrackerError> {
        let Some(spent_output) = lookup_prev_output(prev_txs, prev_txid, vout) else {
            return Err(TrackerError::MissingPrevTx(*prev_txid));
        };
        let script = &spent_output.script_pubkey;
        if self.revocation_addresses.contains(script) {
            return Ok(Some(UntrackedInput::Revocation));
        }
        if self.origin_addresses.contains(script) {
            let revoked = self
                .interners
                .lookup_addr(script)
                .is_some_and(|addr| confirmed.is_revoked(addr));
            if !revoked {
                return Ok(Some(UntrackedInput::Origin(spent_output.value.to_sat())));
            }
        }
        Ok(None)
    }

    /// Distributes `colored_in` over the transaction's outputs in index
    /// order. Each output absorbs up to its face value; the recorded colored
    /// value is rounded down to `coins_per_share` granularity.
    fn allocate_outputs(&self, tx: &Transaction, colored_in: u64) -> Vec<OutputAllocation> {
        let mut remaining = colored_in;
        let mut allocations = Vec::new();

        for (vout, output) in tx.output.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let absorbed = output.value.to_sat().min(remaining);
            let granular = absorbed - absorbed % self.coins_per_share;
            if granular > 0 {
                allocations.push(OutputAllocation {
                    vout: vout as u32,
                    value: granular,
                    script: output.script_pubkey.clone(),
                });
            }
            remaining -= absorbed;
        }

        allocations
    }

    /// Rebuilds the zero-conf snapshot by replaying the pool in arrival
    /// order against the current confirmed snapshot. Entries that became
    /// conflicting are dropped from the pool.
    ///
    /// The stale layer is retracted before the replay starts, and the pool
    /// is only rewritten once the replay has succeeded: a failed rebuild
    /// leaves readers with an empty zero-conf layer and keeps every pooled
    /// entry for the next attempt.
    async fn rebuild_zc(&mut self) -> Result<(), TrackerError> {
        self.zc_cell.publish(ColoredCoinZcSnapshot::default());

        let confirmed = self.snapshot_cell.load();
        let mut working = ColoredCoinZcSnapshot::default();

        let prev_txs = self
            .prefetch_prev_txs(self.zc_pool.values().map(|pooled| &pooled.tx))
            .await?;

        let mut surviving = IndexMap::new();
        for (txid, pooled) in &self.zc_pool {
            match self.apply_zc_tx(&confirmed, &mut working, &pooled.tx, &prev_txs)? {
                ZcOutcome::Applied => {
                    surviving.insert(*txid, pooled.clone());
                }
                ZcOutcome::Conflict(_) => {
                    tracing::warn!(%txid, "Dropping conflicting zero-conf entry during replay");
                }
                ZcOutcome::Unrelated => {}
            }
        }

        working.coins.check_consistency()?;
        self.zc_pool = surviving;
        self.zc_cell.publish(working);
        Ok(())
    }
}

#[derive(Debug)]
enum ZcOutcome {
    Applied,
    Conflict(OutPointRef),
    /// The transaction neither spends nor creates colored value.
    Unrelated,
}

#[derive(Debug)]
enum UntrackedInput {
    Origin(u64),
    Revocation,
}

#[derive(Debug)]
struct OutputAllocation {
    vout: u32,
    value: u64,
    script: ScriptBuf,
}

fn lookup_prev_output<'a>(
    prev_txs: &'a HashMap<Txid, Transaction>,
    txid: &Txid,
    vout: u32,
) -> Option<&'a bitcoin::TxOut> {
    prev_txs.get(txid).and_then(|tx| tx.output.get(vout as usize))
}
