//! Tracker server: serves snapshots of authoritative trackers to remote
//! clients over a framed TCP protocol.

use crate::message::{
    encode_frame, FrameDecoder, Request, Response, TrackerKey, ValidatedTrackerKey,
};
use crate::NetworkError;
use ccoin_primitives::ChainConnection;
use ccoin_tracker::{ColoredCoinTracker, TrackerEventSender, TrackerHandle, TrackerWorker};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Identifies one connected client.
pub type ClientId = SocketAddr;

/// Channel for sending encoded frames to a client.
pub type FrameSender = UnboundedSender<Vec<u8>>;

/// A handle to signal termination of a client connection.
#[derive(Debug)]
pub struct ConnectionCloser {
    pub(crate) sender: watch::Sender<()>,
}

impl ConnectionCloser {
    /// Consumes this [`ConnectionCloser`], sending a termination signal for
    /// the connection's reader and writer tasks.
    pub fn terminate(self) {
        if let Err(err) = self.sender.send(()) {
            tracing::warn!("Failed to send disconnect signal: {err}");
        }
    }
}

/// An accepted client connection.
#[derive(Debug)]
pub struct NewClient {
    /// The identifier of the connected client.
    pub client_addr: ClientId,
    /// Channel for sending frames to the client over this connection.
    pub writer: FrameSender,
    /// Handle to close the connection.
    pub closer: ConnectionCloser,
}

/// Server event, processed serially by [`TrackerServer::run`].
#[derive(Debug)]
pub enum Event {
    /// A new TCP stream was accepted.
    NewClient(NewClient),
    /// A client connection was closed, either properly or abruptly.
    Disconnect {
        client_addr: ClientId,
        reason: NetworkError,
    },
    /// A decoded request arrived from the client.
    ClientRequest { from: ClientId, request: Request },
    /// A tracker published a new confirmed snapshot.
    SnapshotChanged { key: TrackerKey },
    /// A tracker published a new zero-conf snapshot.
    ZcSnapshotChanged { key: TrackerKey },
}

/// Creates the authoritative tracker behind a validated registration key.
#[async_trait::async_trait]
pub trait TrackerProvider: Send + Sync {
    async fn create_tracker(
        &self,
        key: &ValidatedTrackerKey,
    ) -> Result<TrackerHandle, NetworkError>;
}

/// [`TrackerProvider`] running full local trackers against one blockchain
/// connection.
///
/// Each created tracker gets its own dispatch worker; the worker's
/// notification sender is handed to the embedder over the registration
/// channel so it can be wired into the connection's callback delivery.
pub struct LocalTrackerProvider {
    connection: Arc<dyn ChainConnection>,
    start_height: u32,
    worker_registration_sender: UnboundedSender<TrackerEventSender>,
}

impl LocalTrackerProvider {
    /// Constructs the provider together with the receiver of newly created
    /// tracker notification queues.
    pub fn new(
        connection: Arc<dyn ChainConnection>,
        start_height: u32,
    ) -> (Self, UnboundedReceiver<TrackerEventSender>) {
        let (worker_registration_sender, worker_registration_receiver) = unbounded_channel();
        (
            Self {
                connection,
                start_height,
                worker_registration_sender,
            },
            worker_registration_receiver,
        )
    }
}

#[async_trait::async_trait]
impl TrackerProvider for LocalTrackerProvider {
    async fn create_tracker(
        &self,
        key: &ValidatedTrackerKey,
    ) -> Result<TrackerHandle, NetworkError> {
        let mut tracker = ColoredCoinTracker::new(self.connection.clone(), key.coins_per_share)?;
        for script in &key.origin_scripts {
            tracker.add_origin_address(script.clone())?;
        }
        for script in &key.revocation_scripts {
            tracker.add_revocation_address(script.clone())?;
        }
        tracker.set_start_height(self.start_height)?;
        tracker.go_online().await?;

        let (worker, notification_sender) = TrackerWorker::new(tracker);
        let handle = worker.tracker_handle();
        self.worker_registration_sender
            .send(notification_sender)
            .map_err(|_| NetworkError::EventStreamClosed)?;
        tokio::spawn(worker.run());
        Ok(handle)
    }
}

struct SharedTracker {
    handle: TrackerHandle,
    /// `(client, registration id)` pairs receiving this tracker's snapshots.
    subscribers: Vec<(ClientId, u64)>,
}

struct ClientState {
    writer: FrameSender,
    closer: Option<ConnectionCloser>,
}

/// Serves tracker snapshots to registered clients.
///
/// All state lives on this single processor task; connection reader and
/// writer tasks only shuttle frames to and from the event queue. Trackers
/// are deduplicated by the exact registration key, so any number of clients
/// submitting byte-identical keys share one underlying tracker.
pub struct TrackerServer {
    network: bitcoin::Network,
    provider: Arc<dyn TrackerProvider>,
    event_sender: UnboundedSender<Event>,
    event_receiver: UnboundedReceiver<Event>,
    trackers: HashMap<TrackerKey, SharedTracker>,
    clients: HashMap<ClientId, ClientState>,
}

impl TrackerServer {
    /// Constructs a new instance of [`TrackerServer`].
    pub fn new(network: bitcoin::Network, provider: Arc<dyn TrackerProvider>) -> Self {
        let (event_sender, event_receiver) = unbounded_channel();
        Self {
            network,
            provider,
            event_sender,
            event_receiver,
            trackers: HashMap::new(),
            clients: HashMap::new(),
        }
    }

    /// A sender feeding this server's event queue.
    pub fn event_sender(&self) -> UnboundedSender<Event> {
        self.event_sender.clone()
    }

    /// Spawns the accept loop for `listener`, feeding accepted connections
    /// into this server's event queue.
    pub fn spawn_listener(&self, listener: TcpListener) {
        let event_sender = self.event_sender.clone();
        tokio::spawn(accept_loop(listener, event_sender));
    }

    /// The main loop for processing server events.
    ///
    /// Runs until every event sender (including the listener and all
    /// connection tasks) has been dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.event_receiver.recv().await {
            self.handle_event(event).await;
        }
        tracing::debug!("Tracker server event stream closed, shutting down");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::NewClient(NewClient {
                client_addr,
                writer,
                closer,
            }) => {
                tracing::debug!(%client_addr, "New client connection");
                self.clients.insert(
                    client_addr,
                    ClientState {
                        writer,
                        closer: Some(closer),
                    },
                );
            }
            Event::Disconnect {
                client_addr,
                reason,
            } => {
                tracing::debug!(%client_addr, %reason, "Client disconnected");
                if let Some(mut client) = self.clients.remove(&client_addr) {
                    if let Some(closer) = client.closer.take() {
                        closer.terminate();
                    }
                }
                for tracker in self.trackers.values_mut() {
                    tracker
                        .subscribers
                        .retain(|(subscriber, _)| *subscriber != client_addr);
                }
            }
            Event::ClientRequest { from, request } => match request {
                Request::RegisterTracker { id, key } => {
                    self.handle_registration(from, id, key).await;
                }
            },
            Event::SnapshotChanged { key } => self.broadcast_snapshot(&key, false),
            Event::ZcSnapshotChanged { key } => self.broadcast_snapshot(&key, true),
        }
    }

    async fn handle_registration(&mut self, from: ClientId, id: u64, key: TrackerKey) {
        let validated = match key.validate(self.network) {
            Ok(validated) => validated,
            Err(err) => {
                // The protocol carries no rejection reply; the request is
                // dropped here and only logged server-side.
                tracing::warn!(%from, %err, "Dropping invalid tracker registration");
                return;
            }
        };

        if !self.trackers.contains_key(&key) {
            match self.provider.create_tracker(&validated).await {
                Ok(handle) => {
                    self.spawn_snapshot_forwarders(&key, &handle);
                    tracing::info!(
                        coins_per_share = key.coins_per_share,
                        origin_addresses = key.origin_addresses.len(),
                        "Created tracker for new registration key"
                    );
                    self.trackers.insert(
                        key.clone(),
                        SharedTracker {
                            handle,
                            subscribers: Vec::new(),
                        },
                    );
                }
                Err(err) => {
                    tracing::error!(%from, %err, "Failed to create tracker");
                    return;
                }
            }
        }

        if let Some(tracker) = self.trackers.get_mut(&key) {
            tracker.subscribers.push((from, id));
            let handle = tracker.handle.clone();
            if let Err(err) = self.push_current_snapshots(&handle, from, id) {
                tracing::error!(%from, %err, "Failed to push initial snapshots");
            }
        }
    }

    /// Forwards the tracker's snapshot publication signals into the event
    /// queue, where they trigger a serialize-once fan-out.
    fn spawn_snapshot_forwarders(&self, key: &TrackerKey, handle: &TrackerHandle) {
        let mut snapshot_watch = handle.subscribe_snapshot();
        let event_sender = self.event_sender.clone();
        let snapshot_key = key.clone();
        tokio::spawn(async move {
            while snapshot_watch.changed().await.is_ok() {
                let event = Event::SnapshotChanged {
                    key: snapshot_key.clone(),
                };
                if event_sender.send(event).is_err() {
                    return;
                }
            }
        });

        let mut zc_watch = handle.subscribe_zc_snapshot();
        let event_sender = self.event_sender.clone();
        let zc_key = key.clone();
        tokio::spawn(async move {
            while zc_watch.changed().await.is_ok() {
                let event = Event::ZcSnapshotChanged { key: zc_key.clone() };
                if event_sender.send(event).is_err() {
                    return;
                }
            }
        });
    }

    /// Serializes the tracker's current snapshot once and sends it to every
    /// subscriber of `key`.
    fn broadcast_snapshot(&self, key: &TrackerKey, zero_conf: bool) {
        let Some(tracker) = self.trackers.get(key) else {
            return;
        };
        let serialized = if zero_conf {
            ccoin_snapshot::serialize_zc_snapshot(
                &tracker.handle.zc_snapshot(),
                tracker.handle.interners(),
            )
        } else {
            ccoin_snapshot::serialize_snapshot(
                &tracker.handle.snapshot(),
                tracker.handle.interners(),
            )
        };
        let data = match serialized {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(%err, zero_conf, "Failed to serialize snapshot for broadcast");
                return;
            }
        };

        for (client_addr, id) in &tracker.subscribers {
            let response = if zero_conf {
                Response::UpdateCcZcSnapshot {
                    id: *id,
                    data: data.clone(),
                }
            } else {
                Response::UpdateCcSnapshot {
                    id: *id,
                    data: data.clone(),
                }
            };
            if let Err(err) = self.send_to(*client_addr, &response) {
                tracing::warn!(%client_addr, %err, "Failed to queue snapshot push");
            }
        }
    }

    /// Sends the tracker's current snapshots to one newly registered
    /// subscriber.
    fn push_current_snapshots(
        &self,
        handle: &TrackerHandle,
        client_addr: ClientId,
        id: u64,
    ) -> Result<(), NetworkError> {
        let data = ccoin_snapshot::serialize_snapshot(&handle.snapshot(), handle.interners())?;
        self.send_to(client_addr, &Response::UpdateCcSnapshot { id, data })?;
        let data = ccoin_snapshot::serialize_zc_snapshot(&handle.zc_snapshot(), handle.interners())?;
        self.send_to(client_addr, &Response::UpdateCcZcSnapshot { id, data })
    }

    fn send_to(&self, client_addr: ClientId, response: &Response) -> Result<(), NetworkError> {
        let Some(client) = self.clients.get(&client_addr) else {
            return Ok(());
        };
        let frame = encode_frame(response)?;
        // A dead writer surfaces as a Disconnect event from the writer task.
        let _ = client.writer.send(frame);
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, event_sender: UnboundedSender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, client_addr)) => {
                tracing::debug!(%client_addr, "Accepted inbound connection");
                if let Err(err) = spawn_client_io(stream, client_addr, event_sender.clone()) {
                    tracing::warn!(%client_addr, %err, "Failed to set up client connection");
                }
            }
            Err(err) => {
                tracing::error!(%err, "Failed to accept inbound connection");
                return;
            }
        }
    }
}

/// Sets up the reader and writer tasks for an accepted client stream and
/// announces it to the processor.
fn spawn_client_io(
    stream: TcpStream,
    client_addr: ClientId,
    event_sender: UnboundedSender<Event>,
) -> Result<(), NetworkError> {
    let (frame_sender, frame_receiver) = unbounded_channel();
    let (disconnect_sender, disconnect_receiver) = watch::channel(());

    event_sender
        .send(Event::NewClient(NewClient {
            client_addr,
            writer: frame_sender,
            closer: ConnectionCloser {
                sender: disconnect_sender,
            },
        }))
        .map_err(|_| NetworkError::EventStreamClosed)?;

    let (readable, writable) = stream.into_split();

    tokio::spawn({
        let event_sender = event_sender.clone();
        let disconnect_receiver = disconnect_receiver.clone();
        async move {
            if let Err(err) = read_client_frames(
                client_addr,
                readable,
                event_sender.clone(),
                disconnect_receiver,
            )
            .await
            {
                let _ = event_sender.send(Event::Disconnect {
                    client_addr,
                    reason: err,
                });
            }
        }
    });

    tokio::spawn(async move {
        if let Err(err) =
            write_client_frames(client_addr, writable, frame_receiver, disconnect_receiver).await
        {
            let _ = event_sender.send(Event::Disconnect {
                client_addr,
                reason: err,
            });
        }
    });

    Ok(())
}

async fn read_client_frames(
    client_addr: ClientId,
    readable: tokio::net::tcp::OwnedReadHalf,
    event_sender: UnboundedSender<Event>,
    mut disconnect_receiver: watch::Receiver<()>,
) -> Result<(), NetworkError> {
    let mut decoder = FrameDecoder::new(READ_BUFFER_SIZE);

    tokio::pin! {
        let disconnect_signal_fired = disconnect_receiver.changed();
    }

    loop {
        tokio::select! {
            _ = &mut disconnect_signal_fired => {
                tracing::trace!(%client_addr, "Stopping the client reader task");
                return Ok(());
            }
            result = readable.readable() => {
                result?;

                let mut read_buffer = vec![0u8; READ_BUFFER_SIZE];

                // Try to read data, this may still fail with `WouldBlock`
                // if the readiness event is a false positive.
                match readable.as_ref().try_read(&mut read_buffer) {
                    Ok(0) => return Err(NetworkError::ConnectionClosed),
                    Ok(n) => {
                        decoder.input(&read_buffer[..n]);
                        while let Some(request) = decoder.decode_next::<Request>()? {
                            event_sender
                                .send(Event::ClientRequest { from: client_addr, request })
                                .map_err(|_| NetworkError::EventStreamClosed)?;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

async fn write_client_frames(
    client_addr: ClientId,
    writable: tokio::net::tcp::OwnedWriteHalf,
    mut frame_receiver: UnboundedReceiver<Vec<u8>>,
    mut disconnect_receiver: watch::Receiver<()>,
) -> Result<(), NetworkError> {
    tokio::pin! {
        let disconnect_signal_fired = disconnect_receiver.changed();
    }

    loop {
        tokio::select! {
            _ = &mut disconnect_signal_fired => {
                tracing::trace!(%client_addr, "Stopping the client writer task");
                return Ok(());
            }
            maybe_frame = frame_receiver.recv() => {
                let Some(frame) = maybe_frame else {
                    return Ok(());
                };
                write_frame(&writable, &frame).await?;
                tracing::trace!(to = %client_addr, "=> {} bytes sent successfully", frame.len());
            }
        }
    }
}

/// Writes one whole frame, retrying on false-positive writability.
pub(crate) async fn write_frame(
    writable: &tokio::net::tcp::OwnedWriteHalf,
    frame: &[u8],
) -> Result<(), NetworkError> {
    let mut written = 0;
    while written < frame.len() {
        writable.writable().await?;
        match writable.as_ref().try_write(&frame[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
