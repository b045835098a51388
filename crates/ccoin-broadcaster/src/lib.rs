//! # Settlement Transaction Broadcaster
//!
//! Tracks the broadcast lifecycle of settlement transactions independently
//! of color tracking: submits them to a node backend, classifies rejection
//! messages, rebroadcasts pending transactions on a timer, and resolves
//! them when the blockchain connection reports them as zero-conf or
//! invalidated.

mod classify;
mod monitor;


pub use self::classify::RejectClass;
pub use self::monitor::{BroadcastBackend, BroadcastEvent, MonitorCommand, SettlementMonitor};
