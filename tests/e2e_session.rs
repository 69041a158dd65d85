//! End-to-end collector tests over real TCP.
//!
//! Each test starts a dispatcher on an ephemeral loopback port with its own
//! SQLite file, drives it with device clients (or hand-rolled peers) and
//! inspects the database after a graceful shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use telemetry::crypto::{KeyPair, KeySize};
use telemetry::protocol::{FrameStream, HandshakeStep, Initiator, Marker, SecureChannel};
use telemetry::{
    ChannelReadings, Config, DeviceClient, DeviceConfig, DeviceId, Dispatcher, ShutdownHandle,
    Storage, TelemetryError, TelemetryPayload,
};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

struct Collector {
    _dir: TempDir,
    database: PathBuf,
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    task: JoinHandle<telemetry::Result<()>>,
}

impl Collector {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(tune: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let database = dir.path().join("telemetry.db");

        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.storage.database = database.clone();
        config.retention.enabled = false;
        tune(&mut config);

        let mut rng = ChaCha8Rng::seed_from_u64(1024);
        let pair = KeyPair::generate_with(&mut rng, KeySize::DEFAULT).unwrap();

        let dispatcher = Dispatcher::new(Arc::new(config)).with_keypair(Arc::new(pair));
        let shutdown = dispatcher.shutdown_handle();
        let task = tokio::spawn(dispatcher.run());
        let addr = tokio::time::timeout(Duration::from_secs(10), shutdown.ready())
            .await
            .unwrap()
            .unwrap();

        Self {
            _dir: dir,
            database,
            addr,
            shutdown,
            task,
        }
    }

    fn device(&self, country: &str, city: &str) -> DeviceConfig {
        DeviceConfig {
            server: self.addr.ip().to_string(),
            port: self.addr.port(),
            country: country.to_string(),
            city: city.to_string(),
            ..DeviceConfig::default()
        }
    }

    /// Stop the collector (draining writes) and open its database.
    async fn stop(self) -> (TempDir, Storage) {
        self.shutdown.shutdown().await;
        tokio::time::timeout(Duration::from_secs(15), self.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let storage = Storage::open(&self.database).await.unwrap();
        (self._dir, storage)
    }
}

fn payload(start: i64, samples: i64) -> TelemetryPayload {
    (0..samples)
        .map(|i| {
            (
                start + i * 60,
                ChannelReadings {
                    pressure: 1013.0 + i as f64,
                    temperature: 20.0,
                    humidity: 40.0,
                    light: 300.0,
                },
            )
        })
        .collect()
}

async fn secure_channel(addr: SocketAddr) -> SecureChannel<TcpStream> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut frames = FrameStream::new(stream);
    let keys = Initiator::new().run(&mut frames).await.unwrap();
    SecureChannel::new(frames, keys)
}

/// Unconfigured device reporting IT/Rome gets a fresh id and its data is
/// stored under that id.
#[tokio::test]
async fn test_sentinel_device_is_provisioned() {
    let collector = Collector::start().await;
    let mut client = DeviceClient::new(collector.device("IT", "Rome"));

    let report = client.upload(&payload(1_700_000_000, 2)).await.unwrap();
    assert!(report.reassigned);
    assert!(!report.provisioning_pending);
    assert!(!report.device_id.is_sentinel());
    assert_eq!(report.device_id.to_string().len(), 10);
    assert_eq!(client.config().device_id, report.device_id);

    let (_dir, storage) = collector.stop().await;
    let devices = storage.devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_id, report.device_id.as_i64());
    assert_eq!(devices[0].country, "IT");
    assert_eq!(devices[0].city, "Rome");

    assert_eq!(
        storage
            .recordings_for_device(report.device_id)
            .await
            .unwrap()
            .len(),
        2
    );
    assert!(storage
        .recordings_for_device(DeviceId::SENTINEL)
        .await
        .unwrap()
        .is_empty());
}

/// A provisioned device uploads without the identity sub-protocol.
#[tokio::test]
async fn test_recognized_device_skips_provisioning() {
    let collector = Collector::start().await;
    let mut client = DeviceClient::new(collector.device("IT", "Milan"));

    let first = client.upload(&payload(1_700_000_000, 3)).await.unwrap();
    let second = client.upload(&payload(1_700_010_000, 3)).await.unwrap();

    assert!(first.reassigned);
    assert!(!second.reassigned);
    assert_eq!(first.device_id, second.device_id);

    let (_dir, storage) = collector.stop().await;
    assert_eq!(storage.devices().await.unwrap().len(), 1);
    assert_eq!(
        storage
            .recordings_for_device(first.device_id)
            .await
            .unwrap()
            .len(),
        6
    );
}

/// An unknown (non-sentinel) id at a known location adopts the stored id.
#[tokio::test]
async fn test_unknown_id_adopts_location_id() {
    let collector = Collector::start().await;

    let mut original = DeviceClient::new(collector.device("IT", "Rome"));
    let assigned = original.upload(&payload(1_700_000_000, 1)).await.unwrap();

    let stranger_config = collector
        .device("IT", "Rome")
        .with_device_id(DeviceId::new(1234567890).unwrap());
    let mut stranger = DeviceClient::new(stranger_config);
    let report = stranger.upload(&payload(1_700_000_600, 1)).await.unwrap();

    assert!(report.reassigned);
    assert_eq!(report.device_id, assigned.device_id);

    let (_dir, storage) = collector.stop().await;
    assert_eq!(storage.devices().await.unwrap().len(), 1);
}

/// Many devices at once, distinct locations, distinct ids.
#[tokio::test]
async fn test_concurrent_sessions() {
    let collector = Collector::start().await;

    let mut uploads = Vec::new();
    for city in ["Rome", "Milan", "Naples", "Turin", "Palermo"] {
        let mut client = DeviceClient::new(collector.device("IT", city));
        uploads.push(tokio::spawn(async move {
            client.upload(&payload(1_700_000_000, 5)).await
        }));
    }

    let mut ids = Vec::new();
    for upload in uploads {
        ids.push(upload.await.unwrap().unwrap().device_id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);

    let (_dir, storage) = collector.stop().await;
    assert_eq!(storage.devices().await.unwrap().len(), 5);
    for id in ids {
        assert_eq!(storage.recordings_for_device(id).await.unwrap().len(), 5);
    }
}

/// Undecodable payload: negative ack, nothing provisioned or stored.
#[tokio::test]
async fn test_malformed_payload_is_rejected() {
    let collector = Collector::start().await;

    let mut channel = secure_channel(collector.addr).await;
    channel.send(b"0000000000").await.unwrap();
    channel.expect_marker(Marker::Ack, "id ack").await.unwrap();
    channel.send(b"{\"not\": \"a payload\"").await.unwrap();
    channel.expect_marker(Marker::Nack, "nack").await.unwrap();

    let (_dir, storage) = collector.stop().await;
    assert!(storage.devices().await.unwrap().is_empty());
}

/// Identifier that is not exactly ten digits: negative ack.
#[tokio::test]
async fn test_malformed_device_id_is_rejected() {
    let collector = Collector::start().await;

    let mut channel = secure_channel(collector.addr).await;
    channel.send(b"12345").await.unwrap();
    channel.expect_marker(Marker::Nack, "nack").await.unwrap();

    collector.stop().await;
}

/// A peer that never speaks does not delay anyone else.
#[tokio::test]
async fn test_silent_peer_is_isolated() {
    let collector = Collector::start_with(|c| c.server.read_timeout_secs = 30).await;

    let mut silent = TcpStream::connect(collector.addr).await.unwrap();
    let mut client = DeviceClient::new(collector.device("FR", "Lyon"));
    let report = tokio::time::timeout(
        Duration::from_secs(10),
        client.upload(&payload(1_700_000_000, 1)),
    )
    .await
    .expect("upload must not wait for the silent peer")
    .unwrap();
    assert!(report.reassigned);

    // garbage in place of the handshake acknowledgement
    silent.write_all(b"hello\r\n").await.unwrap();

    let (_dir, storage) = collector.stop().await;
    assert_eq!(storage.devices().await.unwrap().len(), 1);
}

/// Responder stalls after key-size negotiation: the device times out with
/// no key established.
#[tokio::test]
async fn test_stalled_responder_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let stalled = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut frames = FrameStream::new(stream);
        frames.send_marker(Marker::HandshakeRequest).await.unwrap();
        frames.expect_marker(Marker::Ack, "ack").await.unwrap();
        frames.send(b"1024").await.unwrap();
        frames.expect_marker(Marker::Ack, "ack").await.unwrap();
        // hold the connection open without sending the public key
        let _ = frames.recv("anything").await;
    });

    let config = DeviceConfig {
        server: addr.ip().to_string(),
        port: addr.port(),
        read_timeout_secs: 1,
        ..DeviceConfig::default()
    };
    let mut client = DeviceClient::new(config);
    let err = client
        .upload(&payload(1_700_000_000, 1))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TelemetryError::Handshake {
            step: HandshakeStep::ExchangePubkey,
            ..
        }
    ));
    assert!(client.config().device_id.is_sentinel());
    stalled.await.unwrap();
}

/// After shutdown the dispatcher has returned and no longer serves.
#[tokio::test]
async fn test_shutdown_stops_serving() {
    let collector = Collector::start().await;
    let addr = collector.addr;
    let shutdown = collector.shutdown.clone();

    collector.stop().await;
    assert!(shutdown.is_requested());
    assert_eq!(shutdown.local_addr(), None);

    let mut client = DeviceClient::new(DeviceConfig {
        server: addr.ip().to_string(),
        port: addr.port(),
        read_timeout_secs: 1,
        ..DeviceConfig::default()
    });
    assert!(client.upload(&payload(1_700_000_000, 1)).await.is_err());
}
