//! Dispatch worker funneling blockchain notifications into the tracker.

use crate::ColoredCoinTracker;
use ccoin_primitives::ChainNotification;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Queue endpoint handed to the blockchain connection; its callbacks push
/// notifications here from whatever I/O thread they run on.
pub type TrackerEventSender = UnboundedSender<ChainNotification>;

/// Owns the tracker and serially dispatches queued notifications into it.
///
/// This is the sole caller of the tracker's mutating operations, so updates
/// are never concurrent regardless of how many threads the connection layer
/// uses. Dropping every sender, or an explicit
/// [`ChainNotification::Shutdown`], terminates the loop; notifications still
/// queued at that point are dropped.
pub struct TrackerWorker {
    tracker: ColoredCoinTracker,
    notification_receiver: UnboundedReceiver<ChainNotification>,
}

impl TrackerWorker {
    /// Constructs a worker around an online tracker, returning the sender the
    /// connection should deliver notifications to.
    pub fn new(tracker: ColoredCoinTracker) -> (Self, TrackerEventSender) {
        let (notification_sender, notification_receiver) = unbounded_channel();
        (
            Self {
                tracker,
                notification_receiver,
            },
            notification_sender,
        )
    }

    /// Read-only handle of the owned tracker.
    pub fn tracker_handle(&self) -> crate::TrackerHandle {
        self.tracker.handle()
    }

    /// Processes notifications in strict arrival order until shutdown.
    pub async fn run(mut self) {
        while let Some(notification) = self.notification_receiver.recv().await {
            if matches!(notification, ChainNotification::Shutdown) {
                tracing::debug!("Tracker worker shutting down");
                return;
            }
            if let Err(err) = self.process_notification(notification).await {
                // A failed cycle leaves the previously published snapshot
                // live; the next notification retries from the watermark.
                tracing::error!(?err, "Failed to process chain notification, continuing...");
            }
        }
    }

    async fn process_notification(
        &mut self,
        notification: ChainNotification,
    ) -> Result<(), crate::TrackerError> {
        match notification {
            ChainNotification::NewBlock {
                height,
                branch_height,
            } => {
                if branch_height < self.tracker.processed_height() {
                    // Confirmed history above the branch point is invalid.
                    self.tracker.reorg(true).await?;
                } else if height <= self.tracker.processed_height() {
                    // Best block replaced without receding past our
                    // watermark; only zero-conf state needs replaying.
                    self.tracker.reorg(false).await?;
                }
                self.tracker.update().await?;
                self.tracker.purge_zc().await
            }
            ChainNotification::ZcReceived(entries) => {
                self.tracker.zc_update(entries).await.map(|conflicts| {
                    if !conflicts.is_empty() {
                        tracing::warn!(?conflicts, "Zero-conf conflicts detected");
                    }
                })
            }
            ChainNotification::ZcInvalidated(ids) => {
                self.tracker.invalidate_zc(ids).await.map(|_| ())
            }
            ChainNotification::Refresh => {
                self.tracker.update().await?;
                self.tracker.purge_zc().await
            }
            ChainNotification::StateChanged(state) => self.tracker.set_chain_state(state).await,
            ChainNotification::Shutdown => Ok(()),
        }
    }
}
