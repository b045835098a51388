//! # Tracker Distribution Layer
//!
//! Lets a single authoritative tracker process serve its snapshots to many
//! remote consumers, so each consumer needs neither its own blockchain
//! connection nor a full UTXO scan of its own.
//!
//! A client registers with the exact configuration a local tracker would
//! need ([`TrackerKey`]); the server deduplicates byte-identical keys onto
//! one shared tracker and pushes full serialized snapshots to every client
//! registered against it whenever they change. All server state is owned by
//! a single processor task; connection reader and writer tasks only move
//! frames.

mod client;
mod message;
mod server;

#[cfg(test)]
mod tests;

pub use self::client::ColoredCoinTrackerClient;
pub use self::message::{
    encode_frame, FrameDecoder, KeyError, Request, Response, TrackerKey, ValidatedTrackerKey,
    MAX_COINS_PER_SHARE, MAX_FRAME_SIZE,
};
pub use self::server::{
    ClientId, ConnectionCloser, Event, FrameSender, LocalTrackerProvider, NewClient,
    TrackerProvider, TrackerServer,
};

/// Distribution layer error type.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Configuration setters and registration are only legal before
    /// `go_online`.
    #[error("Client is already online")]
    AlreadyOnline,
    #[error("Frame payload of {0} bytes exceeds the maximum frame size")]
    OversizedFrame(usize),
    #[error("Connection closed by the remote peer")]
    ConnectionClosed,
    #[error("Event stream closed unexpectedly")]
    EventStreamClosed,
    #[error("Invalid tracker key: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("Wire encoding error: {0}")]
    Wire(#[from] bincode::Error),
    #[error(transparent)]
    Codec(#[from] ccoin_snapshot::CodecError),
    #[error(transparent)]
    Tracker(#[from] ccoin_tracker::TrackerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
