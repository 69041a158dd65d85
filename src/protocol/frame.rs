//! Terminator-delimited frame transport.
//!
//! Every transmitted unit is `payload ‖ "\r\n"`. Reads accumulate into a
//! buffer until the terminator shows up, so a frame split across TCP segments
//! is reassembled and bytes that arrive after a terminator are kept for the
//! next read.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Marker, DEFAULT_READ_TIMEOUT, FRAME_TERMINATOR, MAX_FRAME_BYTES};
use crate::error::{Result, TelemetryError};

/// Framed, timeout-bounded view over a byte stream.
#[derive(Debug)]
pub struct FrameStream<S> {
    stream: S,
    buf: BytesMut,
    read_timeout: Duration,
    max_frame_bytes: usize,
}

impl<S> FrameStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream with default limits.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(1024),
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    /// Set the per-read deadline.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the largest accepted frame (terminator excluded).
    pub fn with_max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit;
        self
    }

    /// Per-read deadline.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Write one frame and flush it.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.windows(FRAME_TERMINATOR.len()).any(|w| w == FRAME_TERMINATOR) {
            return Err(TelemetryError::Protocol(
                "payload contains the frame terminator".to_string(),
            ));
        }

        self.stream.write_all(payload).await?;
        self.stream.write_all(FRAME_TERMINATOR).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send a bare protocol marker.
    pub async fn send_marker(&mut self, marker: Marker) -> Result<()> {
        self.send(marker.as_bytes()).await
    }

    /// Send a negative ack, ignoring failures (the peer may be gone).
    pub async fn send_nack_best_effort(&mut self) {
        if let Err(e) = self.send_marker(Marker::Nack).await {
            tracing::debug!("could not deliver negative ack: {}", e);
        }
    }

    /// Receive one frame; `what` names the awaited message for errors.
    pub async fn recv(&mut self, what: &'static str) -> Result<Bytes> {
        match tokio::time::timeout(self.read_timeout, self.read_frame()).await {
            Ok(frame) => frame,
            Err(_) => Err(TelemetryError::Timeout(what)),
        }
    }

    /// Receive a frame and require it to be `marker`.
    pub async fn expect_marker(&mut self, marker: Marker, what: &'static str) -> Result<()> {
        let frame = self.recv(what).await?;
        marker.expect(&frame)
    }

    async fn read_frame(&mut self) -> Result<Bytes> {
        loop {
            if let Some(pos) = find_terminator(&self.buf) {
                if pos > self.max_frame_bytes {
                    return Err(TelemetryError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
                let frame = self.buf.split_to(pos).freeze();
                self.buf.advance(FRAME_TERMINATOR.len());
                return Ok(frame);
            }

            // Without a terminator, anything beyond limit + one terminator byte
            // can never complete a legal frame.
            if self.buf.len() > self.max_frame_bytes + 1 {
                return Err(TelemetryError::FrameTooLarge {
                    limit: self.max_frame_bytes,
                });
            }

            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(TelemetryError::ConnectionClosed);
            }
        }
    }

    /// Flush and shut down the write half.
    pub async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("error closing stream: {}", e);
        }
    }

    /// Unwrap the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_TERMINATOR.len())
        .position(|w| w == FRAME_TERMINATOR)
}
