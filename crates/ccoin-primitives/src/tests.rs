use super::*;
use bitcoin::hashes::Hash;
use bitcoin::{ScriptBuf, Txid};

fn txid(n: u8) -> Txid {
    Txid::from_byte_array([n; 32])
}

fn script(n: u8) -> ScriptBuf {
    ScriptBuf::from_bytes(vec![0x00, 0x14, n])
}

fn outpoint(interners: &Interners, tx: u8, index: u32, addr: u8, value: u64) -> CcOutpoint {
    CcOutpoint {
        value,
        index,
        tx: interners.intern_tx(txid(tx)),
        addr: interners.intern_addr(&script(addr)),
    }
}

#[test]
fn interner_deduplicates_and_resolves() {
    let interners = Interners::new();

    let a = interners.intern_tx(txid(1));
    let b = interners.intern_tx(txid(2));
    let a_again = interners.intern_tx(txid(1));

    assert_eq!(a, a_again);
    assert_ne!(a, b);
    assert_eq!(interners.resolve_tx(a), txid(1));
    assert_eq!(interners.resolve_tx(b), txid(2));
    assert_eq!(interners.lookup_tx(&txid(1)), Some(a));
    assert_eq!(interners.lookup_tx(&txid(9)), None);

    let s1 = interners.intern_addr(&script(1));
    let s1_again = interners.intern_addr(&script(1));
    assert_eq!(s1, s1_again);
    assert_eq!(interners.resolve_addr(s1), script(1));
}

#[test]
fn utxo_set_rejects_duplicate_outpoint() {
    let interners = Interners::new();
    let op = outpoint(&interners, 1, 0, 1, 100);

    let mut utxo_set = CcUtxoSet::default();
    utxo_set.insert(op).unwrap();

    assert_eq!(
        utxo_set.insert(op),
        Err(StateError::DuplicateOutpoint(op.tx, 0))
    );
    assert_eq!(utxo_set.len(), 1);
}

#[test]
fn utxo_set_remove_clears_empty_groups() {
    let interners = Interners::new();
    let op = outpoint(&interners, 1, 3, 1, 100);

    let mut utxo_set = CcUtxoSet::default();
    utxo_set.insert(op).unwrap();

    assert_eq!(utxo_set.remove(op.tx, 3), Some(op));
    assert!(utxo_set.is_empty());
    assert_eq!(utxo_set.remove(op.tx, 3), None);
}

#[test]
fn scr_addr_set_tracks_membership() {
    let interners = Interners::new();
    let op = outpoint(&interners, 1, 0, 1, 100);

    let mut addr_set = ScrAddrCcSet::default();
    addr_set.add(op.addr, op.out_ref()).unwrap();

    assert_eq!(
        addr_set.add(op.addr, op.out_ref()),
        Err(StateError::DuplicateBackRef(op.addr, op.tx, 0))
    );

    addr_set.remove(op.addr, op.out_ref()).unwrap();
    assert!(addr_set.is_empty());
    assert_eq!(
        addr_set.remove(op.addr, op.out_ref()),
        Err(StateError::MissingBackRef(op.addr, op.tx, 0))
    );
}

#[test]
fn coin_set_keeps_both_sides_in_lock_step() {
    let interners = Interners::new();
    let op1 = outpoint(&interners, 1, 0, 1, 100);
    let op2 = outpoint(&interners, 1, 1, 2, 50);

    let mut coins = CcCoinSet::default();
    coins.add_outpoint(op1).unwrap();
    coins.add_outpoint(op2).unwrap();
    coins.check_consistency().unwrap();

    assert_eq!(coins.value_of(op1.tx, 0), Some(100));
    assert_eq!(coins.outpoints_for(op1.addr), vec![op1]);

    let spent = coins.spend_outpoint(op1.tx, 0).unwrap();
    assert_eq!(spent, Some(op1));
    coins.check_consistency().unwrap();

    assert!(coins.outpoints_for(op1.addr).is_empty());
    assert_eq!(coins.utxo_set.total_value(), 50);

    // Unknown position is not an error.
    assert_eq!(coins.spend_outpoint(op1.tx, 7).unwrap(), None);
}

#[test]
fn coin_set_consistency_detects_divergence() {
    let interners = Interners::new();
    let op = outpoint(&interners, 1, 0, 1, 100);

    // Back-reference without a UTXO entry.
    let mut coins = CcCoinSet::default();
    coins.scr_addr_set.add(op.addr, op.out_ref()).unwrap();
    assert_eq!(
        coins.check_consistency(),
        Err(StateError::DanglingBackRef(op.addr, op.tx, 0))
    );

    // UTXO entry without a back-reference.
    let mut coins = CcCoinSet::default();
    coins.utxo_set.insert(op).unwrap();
    assert_eq!(
        coins.check_consistency(),
        Err(StateError::MissingBackRef(op.addr, op.tx, 0))
    );
}

#[test]
fn outpoints_set_insert_is_idempotent() {
    let interners = Interners::new();
    let tx = interners.intern_tx(txid(1));

    let mut set = OutPointsSet::default();
    assert!(set.insert(tx, 0));
    assert!(!set.insert(tx, 0));
    assert!(set.insert(tx, 1));

    assert!(set.contains(tx, 0));
    assert!(set.contains_tx(tx));
    assert!(!set.contains(tx, 2));
    assert_eq!(set.len(), 2);
}

#[test]
fn publication_swaps_wholesale_and_signals() {
    let publication = Publication::new(0u32);
    let mut watcher = publication.subscribe();

    let before = publication.load();
    publication.publish(7);
    let after = publication.load();

    assert_eq!(*before, 0);
    assert_eq!(*after, 7);
    assert_eq!(publication.version(), 1);
    assert!(watcher.has_changed().unwrap());
}
