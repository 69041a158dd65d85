//! Encrypted message channel used after the handshake.

use tokio::io::{AsyncRead, AsyncWrite};

use super::frame::FrameStream;
use super::handshake::EstablishedKeys;
use super::message::Marker;
use crate::crypto::{open, open_str, seal};
use crate::error::Result;

/// Frame stream where every unit is sealed under the session key.
#[derive(Debug)]
pub struct SecureChannel<S> {
    frames: FrameStream<S>,
    keys: EstablishedKeys,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream that has completed the handshake.
    pub fn new(frames: FrameStream<S>, keys: EstablishedKeys) -> Self {
        Self { frames, keys }
    }

    /// Keys negotiated for this connection.
    pub fn keys(&self) -> &EstablishedKeys {
        &self.keys
    }

    /// Seal and send one message.
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<()> {
        let envelope = seal(self.keys.session_key(), plaintext);
        self.frames.send(&envelope).await
    }

    /// Seal and send a marker.
    pub async fn send_marker(&mut self, marker: Marker) -> Result<()> {
        self.send(marker.as_bytes()).await
    }

    /// Send a sealed negative ack, ignoring failures.
    pub async fn send_nack_best_effort(&mut self) {
        if let Err(e) = self.send_marker(Marker::Nack).await {
            tracing::debug!("could not deliver negative ack: {}", e);
        }
    }

    /// Receive and open one message.
    pub async fn recv(&mut self, what: &'static str) -> Result<Vec<u8>> {
        let envelope = self.frames.recv(what).await?;
        Ok(open(self.keys.session_key(), &envelope)?)
    }

    /// Receive and open a UTF-8 message.
    pub async fn recv_str(&mut self, what: &'static str) -> Result<String> {
        let envelope = self.frames.recv(what).await?;
        Ok(open_str(self.keys.session_key(), &envelope)?)
    }

    /// Receive a sealed marker and require it to be `marker`.
    pub async fn expect_marker(&mut self, marker: Marker, what: &'static str) -> Result<()> {
        let body = self.recv(what).await?;
        marker.expect(&body)
    }

    /// Shut down the write half.
    pub async fn close(mut self) {
        self.frames.close().await;
    }
}
