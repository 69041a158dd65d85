//! Mutual key-establishment handshake.
//!
//! Both roles walk the same [`HandshakeStep`] sequence. A run either returns
//! complete [`EstablishedKeys`] or fails; on failure the partially built key
//! material is dropped (and zeroized), a negative ack is attempted and the
//! error names the step that failed.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::frame::FrameStream;
use super::message::{preview, Marker};
use super::HandshakeStep;
use crate::crypto::{
    encrypt_session_key, import_public_pem, open_str, seal_str, KeyPair, KeySize, RsaPublicKey,
    SessionKey,
};
use crate::error::{Result, TelemetryError};

/// Key material held by both ends after a successful handshake.
#[derive(Debug)]
pub struct EstablishedKeys {
    session_key: SessionKey,
    peer_public: RsaPublicKey,
    key_size: KeySize,
}

impl EstablishedKeys {
    /// Shared symmetric key.
    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    /// The other endpoint's RSA public key.
    pub fn peer_public(&self) -> &RsaPublicKey {
        &self.peer_public
    }

    /// Negotiated RSA modulus size.
    pub fn key_size(&self) -> KeySize {
        self.key_size
    }
}

/// Collector side of the handshake.
#[derive(Debug, Clone)]
pub struct Responder {
    keypair: Arc<KeyPair>,
}

impl Responder {
    /// Use the collector's long-lived key pair.
    pub fn new(keypair: Arc<KeyPair>) -> Self {
        Self { keypair }
    }

    /// Drive the handshake from the listening side.
    pub async fn run<S>(&self, frames: &mut FrameStream<S>) -> Result<EstablishedKeys>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut step = HandshakeStep::AwaitRequest;
        match self.exchange(frames, &mut step).await {
            Ok(keys) => {
                debug!(key_size = %keys.key_size, "handshake complete");
                Ok(keys)
            },
            Err(e) => Err(abort(frames, step, e).await),
        }
    }

    async fn exchange<S>(
        &self,
        frames: &mut FrameStream<S>,
        step: &mut HandshakeStep,
    ) -> Result<EstablishedKeys>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        frames.send_marker(Marker::HandshakeRequest).await?;
        frames
            .expect_marker(Marker::Ack, "handshake acknowledgement")
            .await?;

        *step = HandshakeStep::NegotiateKeySize;
        let key_size = self.keypair.size();
        frames.send(key_size.to_string().as_bytes()).await?;
        frames
            .expect_marker(Marker::Ack, "key size acknowledgement")
            .await?;

        *step = HandshakeStep::ExchangePubkey;
        let pem = self.keypair.public_pem()?;
        frames.send(pem.as_bytes()).await?;
        let wire = frames.recv("encrypted session key").await?;

        *step = HandshakeStep::ConfirmKey;
        let session_key = self.keypair.decrypt_session_key(&wire)?;
        frames.send_marker(Marker::Ack).await?;

        *step = HandshakeStep::ExchangeInitiatorPubkey;
        let sealed = frames.recv("initiator public key").await?;
        let peer_pem = open_str(&session_key, &sealed)?;
        let peer_public = import_public_pem(&peer_pem)?;

        *step = HandshakeStep::Complete;
        frames.send_marker(Marker::Ack).await?;

        Ok(EstablishedKeys {
            session_key,
            peer_public,
            key_size,
        })
    }
}

/// Device side of the handshake.
#[derive(Debug, Clone)]
pub struct Initiator {
    accepted_sizes: Vec<KeySize>,
}

impl Default for Initiator {
    fn default() -> Self {
        Self::new()
    }
}

impl Initiator {
    /// Accept every supported key size.
    pub fn new() -> Self {
        Self {
            accepted_sizes: KeySize::SUPPORTED
                .iter()
                .filter_map(|&bits| KeySize::new(bits).ok())
                .collect(),
        }
    }

    /// Restrict the key sizes this device agrees to.
    pub fn with_accepted_sizes(mut self, sizes: impl IntoIterator<Item = KeySize>) -> Self {
        self.accepted_sizes = sizes.into_iter().collect();
        self
    }

    /// Drive the handshake from the connecting side.
    pub async fn run<S>(&self, frames: &mut FrameStream<S>) -> Result<EstablishedKeys>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut step = HandshakeStep::AwaitRequest;
        match self.exchange(frames, &mut step).await {
            Ok(keys) => {
                debug!(key_size = %keys.key_size, "handshake complete");
                Ok(keys)
            },
            Err(e) => Err(abort(frames, step, e).await),
        }
    }

    async fn exchange<S>(
        &self,
        frames: &mut FrameStream<S>,
        step: &mut HandshakeStep,
    ) -> Result<EstablishedKeys>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        frames
            .expect_marker(Marker::HandshakeRequest, "handshake request")
            .await?;
        frames.send_marker(Marker::Ack).await?;

        *step = HandshakeStep::NegotiateKeySize;
        let offer = frames.recv("key size offer").await?;
        let key_size = self.accept_size(&offer)?;
        frames.send_marker(Marker::Ack).await?;

        *step = HandshakeStep::ExchangePubkey;
        let pem = frames.recv("responder public key").await?;
        let pem = std::str::from_utf8(&pem)
            .map_err(|_| TelemetryError::Protocol("public key is not UTF-8".to_string()))?;
        let peer_public = import_public_pem(pem)?;
        let session_key = SessionKey::generate();
        let wire = encrypt_session_key(&peer_public, &session_key)?;
        frames.send(&wire).await?;

        *step = HandshakeStep::ConfirmKey;
        frames
            .expect_marker(Marker::Ack, "session key confirmation")
            .await?;

        *step = HandshakeStep::ExchangeInitiatorPubkey;
        let own = KeyPair::generate(key_size)?;
        let own_pem = own.public_pem()?;
        frames.send(&seal_str(&session_key, &own_pem)).await?;

        *step = HandshakeStep::Complete;
        frames
            .expect_marker(Marker::Ack, "handshake completion")
            .await?;

        Ok(EstablishedKeys {
            session_key,
            peer_public,
            key_size,
        })
    }

    fn accept_size(&self, offer: &[u8]) -> Result<KeySize> {
        let size = std::str::from_utf8(offer)
            .ok()
            .and_then(|s| s.parse::<KeySize>().ok())
            .ok_or_else(|| {
                TelemetryError::Protocol(format!("unsupported key size {:?}", preview(offer)))
            })?;

        if self.accepted_sizes.contains(&size) {
            Ok(size)
        } else {
            Err(TelemetryError::Protocol(format!(
                "key size {size} not accepted"
            )))
        }
    }
}

async fn abort<S>(frames: &mut FrameStream<S>, step: HandshakeStep, err: TelemetryError) -> TelemetryError
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(?step, error = %err, "handshake aborted");
    frames.send_nack_best_effort().await;
    TelemetryError::Handshake {
        step,
        reason: err.to_string(),
    }
}
