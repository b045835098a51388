//! # Colored Coin Snapshot Codec
//!
//! Deterministic, lossless conversion between the in-memory snapshot
//! structures and a compact binary format, used for on-disk persistence and
//! for shipping snapshots to remote tracker clients.
//!
//! Layout: 5 magic bytes, a little-endian `u16` format version and a kind
//! byte, followed by the snapshot sections. Transaction hashes are raw 32
//! bytes, scripts are length-prefixed, counts use Bitcoin-style compact-size
//! integers. Entries are written in lexicographic hash/script order so equal
//! snapshots always produce identical bytes.
//!
//! Deserialization is validating: duplicate outpoints, back-references that
//! disagree with the UTXO set, trailing bytes and unknown magic/version all
//! fail with an explicit [`CodecError`] instead of yielding a partially
//! populated snapshot. Hashes and scripts are interned into the reader's
//! arena, restoring the in-memory sharing discipline.

mod serialize;

use self::serialize::{
    read_bytes, read_compact_size, read_u32, read_u64, write_bytes, write_compact_size, write_u32,
    write_u64,
};
use bitcoin::hashes::Hash;
use bitcoin::{ScriptBuf, Txid};
use ccoin_primitives::{
    CcCoinSet, CcOutpoint, ColoredCoinSnapshot, ColoredCoinZcSnapshot, Interners, OutPointRef,
    OutPointsSet, StateError,
};
use std::collections::BTreeSet;
use std::io::{Cursor, Read, Write};
use std::path::Path;

const SNAPSHOT_MAGIC_BYTES: [u8; 5] = [b'c', b'c', b's', b'n', 0xff];
const SNAPSHOT_VERSION: u16 = 1;

const KIND_CONFIRMED: u8 = 1;
const KIND_ZERO_CONF: u8 = 2;

/// Consensus scripts never exceed this; used to bound untrusted length fields.
const MAX_SCRIPT_LEN: u64 = 10_000;

/// Snapshot codec error type.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid snapshot magic bytes (expected: {SNAPSHOT_MAGIC_BYTES:?}, got: {0:?})")]
    BadMagic([u8; 5]),
    #[error("Unsupported snapshot version: {0}")]
    UnsupportedVersion(u16),
    #[error("Wrong snapshot kind (expected: {expected}, got: {got})")]
    WrongKind { expected: u8, got: u8 },
    #[error("Trailing bytes after snapshot payload")]
    TrailingBytes,
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Serializes a confirmed snapshot.
pub fn serialize_snapshot(
    snapshot: &ColoredCoinSnapshot,
    interners: &Interners,
) -> Result<Vec<u8>, CodecError> {
    let mut data = Vec::new();
    write_header(&mut data, KIND_CONFIRMED)?;
    write_coin_set(&mut data, &snapshot.coins, interners)?;

    let mut revoked = snapshot
        .revoked_addresses
        .iter()
        .map(|(addr, height)| (interners.resolve_addr(*addr), *height))
        .collect::<Vec<_>>();
    revoked.sort_by(|(a, _), (b, _)| a.cmp(b));
    write_compact_size(&mut data, revoked.len() as u64)?;
    for (script, height) in revoked {
        write_bytes(&mut data, script.as_bytes())?;
        write_u32(&mut data, height)?;
    }

    write_outpoints_set(&mut data, &snapshot.tx_history, interners)?;
    Ok(data)
}

/// Deserializes a confirmed snapshot, interning into the caller's arena.
pub fn deserialize_snapshot(
    bytes: &[u8],
    interners: &Interners,
) -> Result<ColoredCoinSnapshot, CodecError> {
    let mut reader = Cursor::new(bytes);
    read_header(&mut reader, KIND_CONFIRMED)?;
    let coins = read_coin_set(&mut reader, interners)?;

    let mut revoked_addresses = std::collections::HashMap::new();
    let revoked_count = read_compact_size(&mut reader)?;
    for _ in 0..revoked_count {
        let script = ScriptBuf::from_bytes(read_bytes(&mut reader, MAX_SCRIPT_LEN)?);
        let height = read_u32(&mut reader)?;
        revoked_addresses.insert(interners.intern_addr(&script), height);
    }

    let tx_history = read_outpoints_set(&mut reader, interners)?;
    ensure_fully_consumed(&reader)?;

    Ok(ColoredCoinSnapshot {
        coins,
        revoked_addresses,
        tx_history,
    })
}

/// Serializes a zero-confirmation snapshot.
pub fn serialize_zc_snapshot(
    snapshot: &ColoredCoinZcSnapshot,
    interners: &Interners,
) -> Result<Vec<u8>, CodecError> {
    let mut data = Vec::new();
    write_header(&mut data, KIND_ZERO_CONF)?;
    write_coin_set(&mut data, &snapshot.coins, interners)?;
    write_outpoints_set(&mut data, &snapshot.spent_outputs, interners)?;
    Ok(data)
}

/// Deserializes a zero-confirmation snapshot.
pub fn deserialize_zc_snapshot(
    bytes: &[u8],
    interners: &Interners,
) -> Result<ColoredCoinZcSnapshot, CodecError> {
    let mut reader = Cursor::new(bytes);
    read_header(&mut reader, KIND_ZERO_CONF)?;
    let coins = read_coin_set(&mut reader, interners)?;
    let spent_outputs = read_outpoints_set(&mut reader, interners)?;
    ensure_fully_consumed(&reader)?;

    Ok(ColoredCoinZcSnapshot {
        coins,
        spent_outputs,
    })
}

/// Writes a serialized confirmed snapshot to `path`.
///
/// The file carries the format header but no tracker configuration; callers
/// are responsible for knowing which coin a persisted file belongs to.
pub fn save_snapshot(
    path: &Path,
    snapshot: &ColoredCoinSnapshot,
    interners: &Interners,
) -> Result<(), CodecError> {
    let data = serialize_snapshot(snapshot, interners)?;
    std::fs::write(path, &data)?;
    tracing::debug!(path = %path.display(), bytes = data.len(), "Persisted snapshot");
    Ok(())
}

/// Reads a confirmed snapshot from `path`.
pub fn load_snapshot(path: &Path, interners: &Interners) -> Result<ColoredCoinSnapshot, CodecError> {
    let data = std::fs::read(path)?;
    deserialize_snapshot(&data, interners)
}

fn write_header<W: Write>(writer: &mut W, kind: u8) -> Result<(), CodecError> {
    writer.write_all(&SNAPSHOT_MAGIC_BYTES)?;
    writer.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
    writer.write_all(&[kind])?;
    Ok(())
}

fn read_header<R: Read>(reader: &mut R, expected_kind: u8) -> Result<(), CodecError> {
    let mut magic = [0u8; 5];
    reader.read_exact(&mut magic)?;
    if magic != SNAPSHOT_MAGIC_BYTES {
        return Err(CodecError::BadMagic(magic));
    }

    let mut version_bytes = [0u8; 2];
    reader.read_exact(&mut version_bytes)?;
    let version = u16::from_le_bytes(version_bytes);
    if version != SNAPSHOT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let mut kind = [0u8; 1];
    reader.read_exact(&mut kind)?;
    if kind[0] != expected_kind {
        return Err(CodecError::WrongKind {
            expected: expected_kind,
            got: kind[0],
        });
    }
    Ok(())
}

fn write_coin_set<W: Write>(
    writer: &mut W,
    coins: &CcCoinSet,
    interners: &Interners,
) -> Result<(), CodecError> {
    let mut groups = coins
        .utxo_set
        .tx_groups()
        .map(|(tx, outputs)| (interners.resolve_tx(tx), outputs))
        .collect::<Vec<_>>();
    groups.sort_by_key(|(txid, _)| *txid);

    write_compact_size(writer, groups.len() as u64)?;
    for (txid, outputs) in groups {
        writer.write_all(&txid.to_byte_array())?;
        write_compact_size(writer, outputs.len() as u64)?;
        for (vout, outpoint) in outputs {
            write_compact_size(writer, u64::from(*vout))?;
            write_u64(writer, outpoint.value)?;
            write_bytes(writer, interners.resolve_addr(outpoint.addr).as_bytes())?;
        }
    }

    let mut addrs = coins
        .scr_addr_set
        .iter()
        .map(|(addr, refs)| (interners.resolve_addr(addr), refs))
        .collect::<Vec<_>>();
    addrs.sort_by(|(a, _), (b, _)| a.cmp(b));

    write_compact_size(writer, addrs.len() as u64)?;
    for (script, refs) in addrs {
        write_bytes(writer, script.as_bytes())?;
        write_compact_size(writer, refs.len() as u64)?;
        for out_ref in refs {
            writer.write_all(&interners.resolve_tx(out_ref.tx).to_byte_array())?;
            write_compact_size(writer, u64::from(out_ref.index))?;
        }
    }

    Ok(())
}

fn read_coin_set<R: Read>(reader: &mut R, interners: &Interners) -> Result<CcCoinSet, CodecError> {
    let mut coins = CcCoinSet::default();

    let group_count = read_compact_size(reader)?;
    for _ in 0..group_count {
        let tx = interners.intern_tx(read_txid(reader)?);
        let output_count = read_compact_size(reader)?;
        for _ in 0..output_count {
            let index = read_compact_size(reader)? as u32;
            let value = read_u64(reader)?;
            let script = ScriptBuf::from_bytes(read_bytes(reader, MAX_SCRIPT_LEN)?);
            let addr = interners.intern_addr(&script);
            // Insert into the UTXO set only; back-references are read from
            // their own section and then checked for agreement.
            coins.utxo_set.insert(CcOutpoint {
                value,
                index,
                tx,
                addr,
            })?;
        }
    }

    let addr_count = read_compact_size(reader)?;
    for _ in 0..addr_count {
        let script = ScriptBuf::from_bytes(read_bytes(reader, MAX_SCRIPT_LEN)?);
        let addr = interners.intern_addr(&script);
        let ref_count = read_compact_size(reader)?;
        for _ in 0..ref_count {
            let tx = interners.intern_tx(read_txid(reader)?);
            let index = read_compact_size(reader)? as u32;
            coins.scr_addr_set.add(addr, OutPointRef { tx, index })?;
        }
    }

    coins.check_consistency()?;
    Ok(coins)
}

fn write_outpoints_set<W: Write>(
    writer: &mut W,
    set: &OutPointsSet,
    interners: &Interners,
) -> Result<(), CodecError> {
    let mut groups: Vec<(Txid, &BTreeSet<u32>)> = set
        .iter()
        .map(|(tx, indices)| (interners.resolve_tx(tx), indices))
        .collect();
    groups.sort_by_key(|(txid, _)| *txid);

    write_compact_size(writer, groups.len() as u64)?;
    for (txid, indices) in groups {
        writer.write_all(&txid.to_byte_array())?;
        write_compact_size(writer, indices.len() as u64)?;
        for index in indices {
            write_compact_size(writer, u64::from(*index))?;
        }
    }
    Ok(())
}

fn read_outpoints_set<R: Read>(
    reader: &mut R,
    interners: &Interners,
) -> Result<OutPointsSet, CodecError> {
    let mut set = OutPointsSet::default();
    let group_count = read_compact_size(reader)?;
    for _ in 0..group_count {
        let tx = interners.intern_tx(read_txid(reader)?);
        let index_count = read_compact_size(reader)?;
        for _ in 0..index_count {
            let index = read_compact_size(reader)? as u32;
            if !set.insert(tx, index) {
                return Err(CodecError::State(StateError::DuplicateOutpoint(tx, index)));
            }
        }
    }
    Ok(set)
}

fn read_txid<R: Read>(reader: &mut R) -> Result<Txid, CodecError> {
    let mut bytes = [0u8; 32];
    reader.read_exact(&mut bytes)?;
    Ok(Txid::from_byte_array(bytes))
}

fn ensure_fully_consumed(reader: &Cursor<&[u8]>) -> Result<(), CodecError> {
    if reader.position() != reader.get_ref().len() as u64 {
        return Err(CodecError::TrailingBytes);
    }
    Ok(())
}
