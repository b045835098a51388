use crate::server::ConnectionCloser;
use crate::{
    encode_frame, ColoredCoinTrackerClient, Event, FrameDecoder, KeyError, NetworkError,
    NewClient, Request, Response, TrackerKey, TrackerProvider, TrackerServer, ValidatedTrackerKey,
    MAX_FRAME_SIZE,
};
use bitcoin::hashes::Hash;
use bitcoin::{Address, Network, PubkeyHash, ScriptBuf, WPubkeyHash};
use ccoin_primitives::{
    ChainConnection, ColoredCoinSnapshot, ConfirmedTx, ConnectionError, Interners,
};
use ccoin_tracker::{ColoredCoinTracker, TrackerHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::watch;

fn p2wpkh_address(n: u8) -> String {
    let script = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([n; 20]));
    Address::from_script(&script, Network::Bitcoin)
        .unwrap()
        .to_string()
}

fn p2pkh_address(n: u8) -> String {
    let script = ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([n; 20]));
    Address::from_script(&script, Network::Bitcoin)
        .unwrap()
        .to_string()
}

fn sorted(mut addresses: Vec<String>) -> Vec<String> {
    addresses.sort();
    addresses
}

fn valid_key() -> TrackerKey {
    TrackerKey {
        coins_per_share: 1_000_000,
        origin_addresses: sorted(vec![p2wpkh_address(1), p2wpkh_address(2)]),
        revoked_addresses: sorted(vec![p2wpkh_address(9)]),
    }
}

#[test]
fn frame_round_trip_with_partial_input() {
    let request = Request::RegisterTracker {
        id: 42,
        key: valid_key(),
    };
    let frame = encode_frame(&request).unwrap();

    let mut decoder = FrameDecoder::new(64);
    let (first, second) = frame.split_at(frame.len() / 2);

    decoder.input(first);
    assert!(decoder.decode_next::<Request>().unwrap().is_none());

    decoder.input(second);
    assert_eq!(decoder.decode_next::<Request>().unwrap(), Some(request));
    assert!(decoder.decode_next::<Request>().unwrap().is_none());
}

#[test]
fn two_frames_in_one_buffer_decode_separately() {
    let first = Request::RegisterTracker {
        id: 1,
        key: valid_key(),
    };
    let second = Request::RegisterTracker {
        id: 2,
        key: valid_key(),
    };

    let mut buffer = encode_frame(&first).unwrap();
    buffer.extend_from_slice(&encode_frame(&second).unwrap());

    let mut decoder = FrameDecoder::new(64);
    decoder.input(&buffer);
    assert_eq!(decoder.decode_next::<Request>().unwrap(), Some(first));
    assert_eq!(decoder.decode_next::<Request>().unwrap(), Some(second));
    assert!(decoder.decode_next::<Request>().unwrap().is_none());
}

#[test]
fn oversized_frame_length_is_rejected() {
    let mut decoder = FrameDecoder::new(64);
    decoder.input(&((MAX_FRAME_SIZE as u32 + 1).to_le_bytes()));
    assert!(matches!(
        decoder.decode_next::<Request>(),
        Err(NetworkError::OversizedFrame(_))
    ));
}

#[test]
fn key_validation_matrix() {
    let network = Network::Bitcoin;

    assert!(valid_key().validate(network).is_ok());

    let mut key = valid_key();
    key.coins_per_share = 0;
    assert!(matches!(
        key.validate(network),
        Err(KeyError::CoinsPerShareOutOfRange(0))
    ));

    let mut key = valid_key();
    key.coins_per_share = 100_000_001;
    assert!(matches!(
        key.validate(network),
        Err(KeyError::CoinsPerShareOutOfRange(100_000_001))
    ));

    let mut key = valid_key();
    key.origin_addresses.clear();
    assert!(matches!(
        key.validate(network),
        Err(KeyError::NoOriginAddresses)
    ));

    let mut key = valid_key();
    key.origin_addresses.reverse();
    assert!(matches!(
        key.validate(network),
        Err(KeyError::UnsortedAddresses)
    ));

    // Strictly sorted means duplicates are rejected too.
    let mut key = valid_key();
    let duplicate = key.origin_addresses[0].clone();
    key.origin_addresses.insert(0, duplicate);
    assert!(matches!(
        key.validate(network),
        Err(KeyError::UnsortedAddresses)
    ));

    let mut key = valid_key();
    key.revoked_addresses = vec!["not an address".to_string()];
    assert!(matches!(
        key.validate(network),
        Err(KeyError::MalformedAddress(_))
    ));

    let mut key = valid_key();
    key.origin_addresses = vec![p2pkh_address(3)];
    assert!(matches!(
        key.validate(network),
        Err(KeyError::UnsupportedAddressType(_))
    ));

    let mut key = valid_key();
    key.origin_addresses = sorted(vec![{
        let script = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([5; 20]));
        Address::from_script(&script, Network::Testnet)
            .unwrap()
            .to_string()
    }]);
    assert!(matches!(
        key.validate(network),
        Err(KeyError::WrongNetwork(_))
    ));
}

/// Chain backend with no transactions at all; good enough for trackers that
/// only ever see empty scan ranges.
struct StubChain;

#[async_trait::async_trait]
impl ChainConnection for StubChain {
    async fn best_height(&self) -> Result<u32, ConnectionError> {
        Ok(0)
    }

    async fn register_addresses(
        &self,
        _scripts: Vec<bitcoin::ScriptBuf>,
    ) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn get_transactions(
        &self,
        _txids: &[bitcoin::Txid],
    ) -> Result<Vec<bitcoin::Transaction>, ConnectionError> {
        Ok(Vec::new())
    }

    async fn confirmed_txs_in_range(
        &self,
        _from: u32,
        _to: u32,
    ) -> Result<Vec<ConfirmedTx>, ConnectionError> {
        Ok(Vec::new())
    }
}

struct CountingProvider {
    created: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl TrackerProvider for CountingProvider {
    async fn create_tracker(
        &self,
        key: &ValidatedTrackerKey,
    ) -> Result<TrackerHandle, NetworkError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut tracker = ColoredCoinTracker::new(Arc::new(StubChain), key.coins_per_share)?;
        for script in &key.origin_scripts {
            tracker.add_origin_address(script.clone())?;
        }
        for script in &key.revocation_scripts {
            tracker.add_revocation_address(script.clone())?;
        }
        tracker.go_online().await?;
        Ok(tracker.handle())
    }
}

fn fake_client(addr: &str) -> (NewClient, UnboundedReceiver<Vec<u8>>) {
    let (writer, frame_receiver) = unbounded_channel();
    let (disconnect_sender, _) = watch::channel(());
    (
        NewClient {
            client_addr: addr.parse().unwrap(),
            writer,
            closer: ConnectionCloser {
                sender: disconnect_sender,
            },
        },
        frame_receiver,
    )
}

async fn next_response(frame_receiver: &mut UnboundedReceiver<Vec<u8>>) -> Response {
    let frame = tokio::time::timeout(Duration::from_secs(5), frame_receiver.recv())
        .await
        .expect("timed out waiting for server push")
        .expect("writer channel closed");
    let mut decoder = FrameDecoder::new(frame.len());
    decoder.input(&frame);
    decoder
        .decode_next::<Response>()
        .unwrap()
        .expect("frame should hold a whole response")
}

#[tokio::test]
async fn identical_keys_share_one_tracker() {
    let created = Arc::new(AtomicUsize::new(0));
    let server = TrackerServer::new(
        Network::Bitcoin,
        Arc::new(CountingProvider {
            created: created.clone(),
        }),
    );
    let events = server.event_sender();
    tokio::spawn(server.run());

    let (first_client, mut first_frames) = fake_client("127.0.0.1:10001");
    let first_addr = first_client.client_addr;
    let (second_client, mut second_frames) = fake_client("127.0.0.1:10002");
    let second_addr = second_client.client_addr;

    events.send(Event::NewClient(first_client)).unwrap();
    events.send(Event::NewClient(second_client)).unwrap();

    events
        .send(Event::ClientRequest {
            from: first_addr,
            request: Request::RegisterTracker {
                id: 7,
                key: valid_key(),
            },
        })
        .unwrap();
    events
        .send(Event::ClientRequest {
            from: second_addr,
            request: Request::RegisterTracker {
                id: 9,
                key: valid_key(),
            },
        })
        .unwrap();

    // Both subscribers receive their initial confirmed + zero-conf pushes,
    // tagged with their own registration id.
    let interners = Interners::new();
    match next_response(&mut first_frames).await {
        Response::UpdateCcSnapshot { id, data } => {
            assert_eq!(id, 7);
            ccoin_snapshot::deserialize_snapshot(&data, &interners).unwrap();
        }
        other => panic!("Unexpected first push: {other:?}"),
    }
    assert!(matches!(
        next_response(&mut first_frames).await,
        Response::UpdateCcZcSnapshot { id: 7, .. }
    ));
    assert!(matches!(
        next_response(&mut second_frames).await,
        Response::UpdateCcSnapshot { id: 9, .. }
    ));

    assert_eq!(created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_registration_is_dropped_without_reply() {
    let created = Arc::new(AtomicUsize::new(0));
    let server = TrackerServer::new(
        Network::Bitcoin,
        Arc::new(CountingProvider {
            created: created.clone(),
        }),
    );
    let events = server.event_sender();
    tokio::spawn(server.run());

    let (client, mut frames) = fake_client("127.0.0.1:10003");
    let client_addr = client.client_addr;
    events.send(Event::NewClient(client)).unwrap();

    let mut invalid = valid_key();
    invalid.coins_per_share = 0;
    events
        .send(Event::ClientRequest {
            from: client_addr,
            request: Request::RegisterTracker {
                id: 1,
                key: invalid,
            },
        })
        .unwrap();

    // The server stays alive and the next valid registration goes through;
    // the very first push the client sees belongs to it.
    events
        .send(Event::ClientRequest {
            from: client_addr,
            request: Request::RegisterTracker {
                id: 2,
                key: valid_key(),
            },
        })
        .unwrap();

    assert!(matches!(
        next_response(&mut frames).await,
        Response::UpdateCcSnapshot { id: 2, .. }
    ));
    assert_eq!(created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn client_receives_initial_snapshot_over_tcp() {
    let created = Arc::new(AtomicUsize::new(0));
    let server = TrackerServer::new(
        Network::Bitcoin,
        Arc::new(CountingProvider {
            created: created.clone(),
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    server.spawn_listener(listener);
    tokio::spawn(server.run());

    let mut client = ColoredCoinTrackerClient::new(Network::Bitcoin, 1_000_000);
    client.add_origin_address(p2wpkh_address(1)).unwrap();
    client.add_origin_address(p2wpkh_address(2)).unwrap();
    let mut snapshot_watch = client.subscribe_snapshot();

    let stream = TcpStream::connect(server_addr).await.unwrap();
    let _closer = client.go_online(stream).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), snapshot_watch.changed())
        .await
        .expect("timed out waiting for snapshot push")
        .unwrap();

    assert!(client.snapshot().coins.utxo_set.is_empty());
    assert_eq!(created.load(Ordering::SeqCst), 1);

    assert!(matches!(
        client.add_origin_address(p2wpkh_address(3)),
        Err(NetworkError::AlreadyOnline)
    ));
}

#[tokio::test]
async fn terminating_the_client_stops_snapshot_consumption() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    let mut client = ColoredCoinTrackerClient::new(Network::Bitcoin, 1_000_000);
    client.add_origin_address(p2wpkh_address(1)).unwrap();
    let mut snapshot_watch = client.subscribe_snapshot();

    let stream = TcpStream::connect(server_addr).await.unwrap();
    let closer = client.go_online(stream).await.unwrap();
    let (mut server_side, _) = listener.accept().await.unwrap();

    // Hand-rolled server side: push one snapshot, which the client applies.
    let interners = Interners::new();
    let data =
        ccoin_snapshot::serialize_snapshot(&ColoredCoinSnapshot::default(), &interners).unwrap();
    let push = encode_frame(&Response::UpdateCcSnapshot {
        id: 1,
        data: data.clone(),
    })
    .unwrap();
    server_side.write_all(&push).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), snapshot_watch.changed())
        .await
        .expect("timed out waiting for snapshot push")
        .unwrap();

    // After termination further pushes are never applied.
    closer.terminate();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let push = encode_frame(&Response::UpdateCcSnapshot { id: 1, data }).unwrap();
    let _ = server_side.write_all(&push).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!snapshot_watch.has_changed().unwrap());
}

#[tokio::test]
async fn client_validates_key_before_sending() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    let mut client = ColoredCoinTrackerClient::new(Network::Bitcoin, 0);
    client.add_origin_address(p2wpkh_address(1)).unwrap();

    let stream = TcpStream::connect(server_addr).await.unwrap();
    assert!(matches!(
        client.go_online(stream).await,
        Err(NetworkError::InvalidKey(
            KeyError::CoinsPerShareOutOfRange(0)
        ))
    ));
}
