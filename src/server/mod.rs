//! Telemetry collector: connection dispatcher and device sessions.
//!
//! The [`Dispatcher`] accepts TCP connections and runs one
//! [`DeviceSession`] per connection as its own task, next to the retention
//! job. A failing or stalled peer only ever affects its own task.
//!
//! # Lifecycle
//!
//! ```text
//! start: key pair ─► open storage ─► bind ─┬─► accept loop ─► drain sessions ─► drain writes
//!            ▲                             │
//!            └──── backoff on failure ◄────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use telemetry::{Config, Dispatcher};
//!
//! let dispatcher = Dispatcher::new(Arc::new(Config::default()));
//! let shutdown = dispatcher.shutdown_handle();
//! tokio::spawn(async move { tokio::signal::ctrl_c().await.ok(); shutdown.shutdown().await });
//! dispatcher.run().await?;
//! ```

mod identity;
mod session;
mod writes;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use identity::{resolve_location, LocationLocks};
pub use session::{DeviceSession, SessionContext, SessionOutcome};
pub use writes::WriteTracker;

use crate::config::Config;
use crate::crypto::KeyPair;
use crate::error::{Result, TelemetryError};
use crate::protocol::Responder;
use crate::retention::RetentionEngine;
use crate::storage::Storage;

/// Requests and observes dispatcher shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownState>,
}

#[derive(Debug)]
struct ShutdownState {
    requested: AtomicBool,
    signal: watch::Sender<bool>,
    bound: watch::Sender<Option<SocketAddr>>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (signal, _) = watch::channel(false);
        let (bound, _) = watch::channel(None);
        Self {
            inner: Arc::new(ShutdownState {
                requested: AtomicBool::new(false),
                signal,
                bound,
            }),
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Receiver that turns `true` on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.signal.subscribe()
    }

    /// Address the listener is bound to, once it is.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound.borrow()
    }

    /// Wait until the listener is bound (or shutdown is requested first).
    pub async fn ready(&self) -> Option<SocketAddr> {
        let mut bound = self.inner.bound.subscribe();
        let mut signal = self.subscribe();
        loop {
            if let Some(addr) = *bound.borrow_and_update() {
                return Some(addr);
            }
            if self.is_requested() {
                return None;
            }
            tokio::select! {
                changed = bound.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                },
                _ = signal.changed() => {},
            }
        }
    }

    /// Stop the dispatcher: set the flag, cancel retention and wake the
    /// accept loop with a loopback connection.
    pub async fn shutdown(&self) {
        if self.inner.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutdown requested");
        self.inner.signal.send_replace(true);

        if let Some(addr) = self.local_addr() {
            let target = SocketAddr::new(loopback_for(addr.ip()), addr.port());
            if let Err(e) = TcpStream::connect(target).await {
                debug!(%target, "wake-up connection failed: {}", e);
            }
        }
    }

    fn set_bound(&self, addr: Option<SocketAddr>) {
        self.inner.bound.send_replace(addr);
    }
}

fn loopback_for(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}

/// Accepts device connections and supervises sessions and retention.
pub struct Dispatcher {
    config: Arc<Config>,
    keypair: Option<Arc<KeyPair>>,
    shutdown: ShutdownHandle,
}

struct Running {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
}

impl Dispatcher {
    /// Create a dispatcher; nothing is opened until [`Dispatcher::run`].
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            keypair: None,
            shutdown: ShutdownHandle::new(),
        }
    }

    /// Use an existing key pair instead of generating one at startup.
    pub fn with_keypair(mut self, keypair: Arc<KeyPair>) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Handle for stopping this dispatcher from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Start (retrying with backoff) and serve until shutdown.
    pub async fn run(self) -> Result<()> {
        let retry = self.config.server.startup_retry();
        let mut stop = self.shutdown.subscribe();

        loop {
            if self.shutdown.is_requested() {
                return Ok(());
            }

            // Key generation can take seconds; a shutdown meanwhile drops the
            // half-started state, listener included.
            let started = tokio::select! {
                started = self.start() => started,
                _ = stop.wait_for(|&requested| requested) => {
                    self.shutdown.set_bound(None);
                    info!("shutdown during startup");
                    return Ok(());
                },
            };

            match started {
                Ok(running) if self.shutdown.is_requested() => {
                    drop(running);
                    self.shutdown.set_bound(None);
                    return Ok(());
                },
                Ok(running) => return self.serve(running).await,
                Err(e) => {
                    error!("startup failed, retrying in {}s: {}", retry.as_secs(), e);
                    tokio::select! {
                        () = tokio::time::sleep(retry) => {},
                        _ = stop.wait_for(|&requested| requested) => {},
                    }
                },
            }
        }
    }

    async fn start(&self) -> Result<Running> {
        let keypair = match &self.keypair {
            Some(keypair) => Arc::clone(keypair),
            None => {
                let size = self.config.server.key_size()?;
                info!(bits = size.bits(), "generating collector key pair");
                let pair = tokio::task::spawn_blocking(move || KeyPair::generate(size))
                    .await
                    .map_err(|e| TelemetryError::Server(format!("key generation task: {e}")))??;
                Arc::new(pair)
            },
        };

        let storage = Storage::open(&self.config.storage.database).await?;

        let addr = self.config.server.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TelemetryError::Server(format!("Failed to bind TCP to {}: {}", addr, e)))?;
        let local = listener.local_addr()?;
        self.shutdown.set_bound(Some(local));
        info!(%local, "collector listening");

        let ctx = SessionContext {
            responder: Responder::new(keypair),
            storage,
            locks: LocationLocks::new(),
            writes: WriteTracker::new(),
            read_timeout: self.config.server.read_timeout(),
            max_frame_bytes: self.config.server.max_frame_bytes,
        };

        Ok(Running {
            listener,
            ctx: Arc::new(ctx),
        })
    }

    async fn serve(self, running: Running) -> Result<()> {
        let Running { listener, ctx } = running;

        let retention = self.config.retention.enabled.then(|| {
            let engine = RetentionEngine::new(ctx.storage.clone(), &self.config.retention)
                .with_cancel(self.shutdown.subscribe());
            tokio::spawn(engine.run().instrument(info_span!("retention")))
        });

        let mut stop = self.shutdown.subscribe();
        let mut sessions = JoinSet::new();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = stop.wait_for(|&requested| requested) => break,
            };
            if self.shutdown.is_requested() {
                break;
            }

            match accepted {
                Ok((stream, peer)) => {
                    let span = info_span!("session", id = %Uuid::new_v4(), %peer);
                    sessions.spawn(handle(Arc::clone(&ctx), stream).instrument(span));
                },
                Err(e) => warn!("accept failed: {}", e),
            }

            while let Some(result) = sessions.try_join_next() {
                if let Err(e) = result {
                    error!("session task failed: {}", e);
                }
            }
            ctx.writes.reap();
        }

        drop(listener);
        self.shutdown.set_bound(None);
        info!(sessions = sessions.len(), "collector stopping");

        while let Some(result) = sessions.join_next().await {
            if let Err(e) = result {
                error!("session task failed: {}", e);
            }
        }
        if let Some(task) = retention {
            if let Err(e) = task.await {
                error!("retention task failed: {}", e);
            }
        }
        let drained = ctx.writes.drain().await;
        info!(drained, "collector stopped");
        Ok(())
    }
}

async fn handle(ctx: Arc<SessionContext>, stream: TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed: {}", e);
    }

    match DeviceSession::new(ctx).run(stream).await {
        Ok(outcome) => info!(?outcome, "session finished"),
        Err(e) => warn!("session aborted: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_for_unspecified() {
        assert_eq!(
            loopback_for(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
        assert_eq!(
            loopback_for(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        );
        let lan = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(loopback_for(lan), lan);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_returns() {
        let dispatcher = Dispatcher::new(Arc::new(Config::default()));
        let handle = dispatcher.shutdown_handle();
        handle.shutdown().await;

        assert!(handle.is_requested());
        assert!(dispatcher.run().await.is_ok());
        assert_eq!(handle.ready().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_during_key_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.database = dir.path().join("t.db");
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.server.key_size = 2048;
        config.retention.enabled = false;

        let dispatcher = Dispatcher::new(Arc::new(config));
        let handle = dispatcher.shutdown_handle();
        let task = tokio::spawn(dispatcher.run());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.shutdown().await;

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("dispatcher must stop while still starting")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(handle.local_addr(), None);
    }

    #[tokio::test]
    async fn test_shutdown_without_wakeup_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.database = dir.path().join("t.db");
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.retention.enabled = false;

        let pair = KeyPair::generate(crate::crypto::KeySize::new(521).unwrap()).unwrap();
        let dispatcher = Dispatcher::new(Arc::new(config)).with_keypair(Arc::new(pair));
        let handle = dispatcher.shutdown_handle();
        let task = tokio::spawn(dispatcher.run());
        handle.ready().await.unwrap();

        // flag and signal only, as if the loopback connection never arrived
        handle.inner.requested.store(true, Ordering::SeqCst);
        handle.inner.signal.send_replace(true);

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("accept loop must observe the shutdown signal")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_startup_failure_backs_off_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        // a directory cannot be opened as a database
        config.storage.database = dir.path().to_path_buf();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.server.startup_retry_secs = 3600;

        let pair = KeyPair::generate(crate::crypto::KeySize::new(521).unwrap()).unwrap();
        let dispatcher = Dispatcher::new(Arc::new(config)).with_keypair(Arc::new(pair));
        let handle = dispatcher.shutdown_handle();
        let task = tokio::spawn(dispatcher.run());

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(handle.local_addr(), None);

        handle.shutdown().await;
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
