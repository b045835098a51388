//! Remote tracker client backed by server-pushed snapshots.

use crate::message::{encode_frame, FrameDecoder, Request, Response, TrackerKey};
use crate::server::{write_frame, ConnectionCloser};
use crate::NetworkError;
use ccoin_primitives::{ColoredCoinSnapshot, ColoredCoinZcSnapshot, Interners, Publication};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// One tracker per connection, so a fixed registration id suffices.
const REGISTRATION_ID: u64 = 1;

/// A tracker with the local tracker's configuration contract but backed by
/// network-delivered snapshots instead of local computation.
///
/// Addresses are configured in their display encoding, exactly as they go
/// over the wire. Incoming snapshots are deserialized into this client's own
/// arena and published through the same publication cells a local tracker
/// uses, so readers cannot tell the two apart.
pub struct ColoredCoinTrackerClient {
    network: bitcoin::Network,
    coins_per_share: u64,
    origin_addresses: Vec<String>,
    revoked_addresses: Vec<String>,
    online: bool,
    interners: Arc<Interners>,
    snapshot_cell: Arc<Publication<ColoredCoinSnapshot>>,
    zc_cell: Arc<Publication<ColoredCoinZcSnapshot>>,
}

impl ColoredCoinTrackerClient {
    /// Constructs a client in its configuration phase.
    pub fn new(network: bitcoin::Network, coins_per_share: u64) -> Self {
        Self {
            network,
            coins_per_share,
            origin_addresses: Vec::new(),
            revoked_addresses: Vec::new(),
            online: false,
            interners: Arc::new(Interners::new()),
            snapshot_cell: Arc::new(Publication::default()),
            zc_cell: Arc::new(Publication::default()),
        }
    }

    /// Adds an origin address. Only legal before [`Self::go_online`].
    pub fn add_origin_address(&mut self, address: String) -> Result<(), NetworkError> {
        self.ensure_config_phase()?;
        self.origin_addresses.push(address);
        Ok(())
    }

    /// Adds a revocation address. Only legal before [`Self::go_online`].
    pub fn add_revocation_address(&mut self, address: String) -> Result<(), NetworkError> {
        self.ensure_config_phase()?;
        self.revoked_addresses.push(address);
        Ok(())
    }

    /// Registers with the tracker server over `stream` and starts consuming
    /// snapshot pushes. The returned closer terminates the read loop and
    /// drops the connection.
    ///
    /// The key is validated locally before sending: the server drops invalid
    /// registrations without a reply, so failing fast here is the only
    /// feedback a misconfigured client gets.
    pub async fn go_online(&mut self, stream: TcpStream) -> Result<ConnectionCloser, NetworkError> {
        if self.online {
            return Err(NetworkError::AlreadyOnline);
        }

        self.origin_addresses.sort();
        self.origin_addresses.dedup();
        self.revoked_addresses.sort();
        self.revoked_addresses.dedup();

        let key = TrackerKey {
            coins_per_share: self.coins_per_share,
            origin_addresses: self.origin_addresses.clone(),
            revoked_addresses: self.revoked_addresses.clone(),
        };
        key.validate(self.network)?;

        let frame = encode_frame(&Request::RegisterTracker {
            id: REGISTRATION_ID,
            key,
        })?;

        let (readable, writable) = stream.into_split();
        write_frame(&writable, &frame).await?;

        self.online = true;

        tracing::info!(
            coins_per_share = self.coins_per_share,
            origin_addresses = self.origin_addresses.len(),
            "Tracker client registered, awaiting snapshot pushes"
        );

        let (disconnect_sender, disconnect_receiver) = watch::channel(());
        let interners = self.interners.clone();
        let snapshot_cell = self.snapshot_cell.clone();
        let zc_cell = self.zc_cell.clone();
        tokio::spawn(async move {
            // The write half is kept alive for the lifetime of the read
            // loop; dropping it would half-close the connection.
            let _writable = writable;
            if let Err(err) =
                read_snapshot_pushes(readable, disconnect_receiver, interners, snapshot_cell, zc_cell)
                    .await
            {
                tracing::error!(%err, "Tracker client read loop terminated");
            }
        });

        Ok(ConnectionCloser {
            sender: disconnect_sender,
        })
    }

    /// The currently published confirmed snapshot.
    pub fn snapshot(&self) -> Arc<ColoredCoinSnapshot> {
        self.snapshot_cell.load()
    }

    /// The currently published zero-confirmation snapshot.
    pub fn zc_snapshot(&self) -> Arc<ColoredCoinZcSnapshot> {
        self.zc_cell.load()
    }

    /// Watch channel bumped on every confirmed-snapshot push.
    pub fn subscribe_snapshot(&self) -> watch::Receiver<u64> {
        self.snapshot_cell.subscribe()
    }

    /// Watch channel bumped on every zero-conf-snapshot push.
    pub fn subscribe_zc_snapshot(&self) -> watch::Receiver<u64> {
        self.zc_cell.subscribe()
    }

    /// The arena backing this client's snapshots.
    pub fn interners(&self) -> &Arc<Interners> {
        &self.interners
    }

    /// The configured denomination factor.
    pub fn coins_per_share(&self) -> u64 {
        self.coins_per_share
    }

    fn ensure_config_phase(&self) -> Result<(), NetworkError> {
        if self.online {
            return Err(NetworkError::AlreadyOnline);
        }
        Ok(())
    }
}

async fn read_snapshot_pushes(
    readable: tokio::net::tcp::OwnedReadHalf,
    mut disconnect_receiver: watch::Receiver<()>,
    interners: Arc<Interners>,
    snapshot_cell: Arc<Publication<ColoredCoinSnapshot>>,
    zc_cell: Arc<Publication<ColoredCoinZcSnapshot>>,
) -> Result<(), NetworkError> {
    let mut decoder = FrameDecoder::new(READ_BUFFER_SIZE);

    tokio::pin! {
        let disconnect_signal_fired = disconnect_receiver.changed();
    }

    loop {
        tokio::select! {
            _ = &mut disconnect_signal_fired => {
                tracing::trace!("Stopping the tracker client read loop");
                return Ok(());
            }
            result = readable.readable() => {
                result?;

                let mut read_buffer = vec![0u8; READ_BUFFER_SIZE];

                match readable.as_ref().try_read(&mut read_buffer) {
                    Ok(0) => return Err(NetworkError::ConnectionClosed),
                    Ok(n) => {
                        decoder.input(&read_buffer[..n]);
                        while let Some(response) = decoder.decode_next::<Response>()? {
                            apply_snapshot_push(response, &interners, &snapshot_cell, &zc_cell)?;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

fn apply_snapshot_push(
    response: Response,
    interners: &Interners,
    snapshot_cell: &Publication<ColoredCoinSnapshot>,
    zc_cell: &Publication<ColoredCoinZcSnapshot>,
) -> Result<(), NetworkError> {
    match response {
        Response::UpdateCcSnapshot { id, data } => {
            if id != REGISTRATION_ID {
                tracing::warn!(id, "Ignoring snapshot push for unknown registration");
                return Ok(());
            }
            let snapshot = ccoin_snapshot::deserialize_snapshot(&data, interners)?;
            tracing::debug!(
                utxos = snapshot.coins.utxo_set.len(),
                "Applied confirmed snapshot push"
            );
            snapshot_cell.publish(snapshot);
        }
        Response::UpdateCcZcSnapshot { id, data } => {
            if id != REGISTRATION_ID {
                tracing::warn!(id, "Ignoring snapshot push for unknown registration");
                return Ok(());
            }
            let snapshot = ccoin_snapshot::deserialize_zc_snapshot(&data, interners)?;
            zc_cell.publish(snapshot);
        }
    }
    Ok(())
}
