//! Broadcast rejection classification.

/// Classification of a node's broadcast rejection message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectClass {
    /// The transaction is effectively broadcast already.
    AlreadyBroadcast,
    /// Possible double-spend; needs external adjudication.
    Conflict,
    /// Temporary condition; retry on the next timer tick.
    Transient,
    /// Unknown rejection; the transaction is dropped.
    Fatal,
}

impl RejectClass {
    /// Classifies a node rejection message by its known signatures.
    ///
    /// Matching is case-insensitive substring search, since nodes wrap these
    /// phrases in varying amounts of context.
    pub fn classify(reason: &str) -> Self {
        let reason = reason.to_ascii_lowercase();
        if reason.contains("already in mempool") {
            Self::AlreadyBroadcast
        } else if reason.contains("already known") || reason.contains("mempool conflict") {
            Self::Conflict
        } else if reason.contains("mempool full") || reason.contains("broadcast timed out") {
            Self::Transient
        } else {
            Self::Fatal
        }
    }
}
