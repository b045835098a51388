//! Wire messages and the length-prefixed frame codec.
//!
//! Every message travels as a `u32` little-endian payload length followed by
//! the `bincode`-encoded message body. Addresses are transmitted in their
//! human-readable display encoding and validated server-side.

use crate::NetworkError;
use bitcoin::address::{Address, AddressType, NetworkUnchecked};
use bitcoin::ScriptBuf;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Upper bound on a single frame's payload, large enough for a serialized
/// snapshot of a heavily used asset.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Upper bound on `coins_per_share` (one full coin in satoshis).
pub const MAX_COINS_PER_SHARE: u64 = 100_000_000;

/// Tracker configuration as transmitted by a registering client.
///
/// Byte-identical keys denote the same tracker; the server deduplicates on
/// this exact value, which is why both address lists must arrive sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackerKey {
    pub coins_per_share: u64,
    pub origin_addresses: Vec<String>,
    pub revoked_addresses: Vec<String>,
}

/// A registration key rejection reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("coins_per_share {0} outside (0, {MAX_COINS_PER_SHARE}]")]
    CoinsPerShareOutOfRange(u64),
    #[error("Origin address list is empty")]
    NoOriginAddresses,
    #[error("Address list is not strictly sorted")]
    UnsortedAddresses,
    #[error("Malformed address: {0}")]
    MalformedAddress(String),
    #[error("Address {0} is for a different network")]
    WrongNetwork(String),
    #[error("Address {0} is not pay-to-witness-pubkey-hash")]
    UnsupportedAddressType(String),
}

/// A [`TrackerKey`] whose addresses have been decoded into scripts.
#[derive(Debug, Clone)]
pub struct ValidatedTrackerKey {
    pub coins_per_share: u64,
    pub origin_scripts: Vec<ScriptBuf>,
    pub revocation_scripts: Vec<ScriptBuf>,
}

impl TrackerKey {
    /// Validates the key against `network` and decodes its addresses.
    ///
    /// Accepted keys have `coins_per_share` in `(0, MAX_COINS_PER_SHARE]`, a
    /// non-empty origin list, both lists strictly sorted, and every address
    /// decoding to a P2WPKH script for `network`.
    pub fn validate(&self, network: bitcoin::Network) -> Result<ValidatedTrackerKey, KeyError> {
        if self.coins_per_share == 0 || self.coins_per_share > MAX_COINS_PER_SHARE {
            return Err(KeyError::CoinsPerShareOutOfRange(self.coins_per_share));
        }
        if self.origin_addresses.is_empty() {
            return Err(KeyError::NoOriginAddresses);
        }
        if !is_strictly_sorted(&self.origin_addresses)
            || !is_strictly_sorted(&self.revoked_addresses)
        {
            return Err(KeyError::UnsortedAddresses);
        }

        Ok(ValidatedTrackerKey {
            coins_per_share: self.coins_per_share,
            origin_scripts: decode_addresses(&self.origin_addresses, network)?,
            revocation_scripts: decode_addresses(&self.revoked_addresses, network)?,
        })
    }
}

fn is_strictly_sorted(addresses: &[String]) -> bool {
    addresses.windows(2).all(|pair| pair[0] < pair[1])
}

fn decode_addresses(
    addresses: &[String],
    network: bitcoin::Network,
) -> Result<Vec<ScriptBuf>, KeyError> {
    addresses
        .iter()
        .map(|encoded| {
            let address = encoded
                .parse::<Address<NetworkUnchecked>>()
                .map_err(|_| KeyError::MalformedAddress(encoded.clone()))?
                .require_network(network)
                .map_err(|_| KeyError::WrongNetwork(encoded.clone()))?;
            if address.address_type() != Some(AddressType::P2wpkh) {
                return Err(KeyError::UnsupportedAddressType(encoded.clone()));
            }
            Ok(address.script_pubkey())
        })
        .collect()
}

/// Client-to-server message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Register interest in the tracker identified by `key`. Snapshot pushes
    /// for it are tagged with the client-chosen `id`.
    RegisterTracker { id: u64, key: TrackerKey },
}

/// Server-to-client message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Full confirmed snapshot in the serialized cache format.
    UpdateCcSnapshot { id: u64, data: Vec<u8> },
    /// Full zero-confirmation snapshot in the serialized cache format.
    UpdateCcZcSnapshot { id: u64, data: Vec<u8> },
}

/// Encodes `message` into a length-prefixed frame ready to write out.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, NetworkError> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::OversizedFrame(payload.len()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Frame stream decoder.
///
/// Used to turn a byte stream into wire messages.
#[derive(Debug)]
pub struct FrameDecoder {
    unparsed: Vec<u8>,
}

impl FrameDecoder {
    /// Constructs a new [`FrameDecoder`].
    pub fn new(capacity: usize) -> Self {
        Self {
            unparsed: Vec::with_capacity(capacity),
        }
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next message.
    ///
    /// Returns [`None`] if no complete frame is buffered yet.
    pub fn decode_next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, NetworkError> {
        if self.unparsed.len() < 4 {
            return Ok(None);
        }
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&self.unparsed[..4]);
        let payload_len = u32::from_le_bytes(length_bytes) as usize;
        if payload_len > MAX_FRAME_SIZE {
            return Err(NetworkError::OversizedFrame(payload_len));
        }
        if self.unparsed.len() < 4 + payload_len {
            return Ok(None);
        }
        let message = bincode::deserialize(&self.unparsed[4..4 + payload_len])?;
        self.unparsed.drain(..4 + payload_len);
        Ok(Some(message))
    }
}
