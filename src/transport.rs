//! The WebSocket transport: connects to the reference endpoint and frames
//! payloads with a 3-byte big-endian length prefix, independent of
//! whatever is carried inside (handshake bytes or Noise-encrypted application
//! frames).

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use http::Uri;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    tungstenite::{client::IntoClientRequest, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::error::TransportError;

/// Frame payloads larger than this are rejected rather than sent or
/// accepted; the length prefix is 3 bytes, so `2^24 - 1` is the largest
/// representable payload.
pub const MAX_FRAME_LEN: usize = 0x00FF_FFFF;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Builds a 3-byte-length-prefixed frame around `payload` without sending
/// it, so callers can prepend out-of-band bytes (the handshake prologue)
/// ahead of the first frame.
pub fn frame_payload(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge);
    }
    let mut framed = Vec::with_capacity(3 + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// Strips a single 3-byte length-prefixed frame from a complete WebSocket
/// message, validating that the declared length matches exactly what
/// follows. Used during the handshake, before either peer's Noise
/// transport is established and [`FrameAccumulator`] comes into play.
pub fn unwrap_single_frame(message: &[u8]) -> Result<Vec<u8>, TransportError> {
    if message.len() < 3 {
        return Err(TransportError::InvalidFrame("missing 3-byte prefix"));
    }
    let expected_len =
        ((message[0] as usize) << 16) | ((message[1] as usize) << 8) | message[2] as usize;
    let payload = &message[3..];
    if payload.len() != expected_len {
        return Err(TransportError::InvalidFrame("length prefix mismatch"));
    }
    Ok(payload.to_vec())
}

/// A framed WebSocket connection to the reference endpoint.
pub struct WsTransport {
    stream: WsStream,
}

impl WsTransport {
    /// Connects to `url`, setting the `Origin` and `Sec-WebSocket-Extensions`
    /// headers the reference client sends, and bounding the whole TCP/TLS+
    /// WebSocket upgrade by `connect_timeout`.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        let uri: Uri = url
            .parse()
            .map_err(|error: http::uri::InvalidUri| TransportError::InvalidUrl(error.to_string()))?;
        let mut request = uri
            .into_client_request()
            .map_err(TransportError::Connect)?;

        let origin = "https://web.whatsapp.com"
            .parse()
            .map_err(|error: http::header::InvalidHeaderValue| TransportError::InvalidUrl(error.to_string()))?;
        request.headers_mut().insert("Origin", origin);

        let extensions = "permessage-deflate; client_max_window_bits"
            .parse()
            .map_err(|error: http::header::InvalidHeaderValue| TransportError::InvalidUrl(error.to_string()))?;
        request.headers_mut().insert("Sec-WebSocket-Extensions", extensions);

        let (stream, _response) = tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| TransportError::ConnectTimeout)?
            .map_err(TransportError::Connect)?;

        Ok(Self { stream })
    }

    /// Sends one length-prefixed frame.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let framed = frame_payload(payload)?;
        self.send_raw(&framed).await
    }

    /// Sends `bytes` as a single WebSocket binary message, unmodified.
    /// Used for the handshake's first outgoing message, which prepends the
    /// Noise prologue ahead of the first length-prefixed frame.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream
            .send(Message::Binary(bytes.to_vec()))
            .await
            .map_err(TransportError::WebSocket)
    }

    /// Reads the next frame, transparently answering pings and ignoring
    /// pongs/text frames the reference server doesn't send in practice.
    /// A single WebSocket message may be split into more than one
    /// length-prefixed frame, so this can return several frames' worth of
    /// buffered data in one call is handled by [`FrameAccumulator`]
    /// upstream; this method returns exactly one WebSocket message's raw
    /// bytes.
    pub async fn next_message(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(error)) => return Err(TransportError::WebSocket(error)),
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(bytes)),
                Some(Ok(Message::Ping(payload))) => {
                    self.stream
                        .send(Message::Pong(payload))
                        .await
                        .map_err(TransportError::WebSocket)?;
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Text(_))) | Some(Ok(Message::Frame(_))) => {
                    continue;
                }
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.stream
            .close(None)
            .await
            .map_err(TransportError::WebSocket)
    }
}

/// Accumulates raw WebSocket message bytes and splits them into
/// length-prefixed application frames, since the server may coalesce
/// several frames into one WebSocket message or split one frame across
/// several messages.
#[derive(Default)]
pub struct FrameAccumulator {
    buffer: Vec<u8>,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds newly received bytes in and drains every complete frame now
    /// available.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if self.buffer.len() < 3 {
                break;
            }
            let len = ((self.buffer[0] as usize) << 16)
                | ((self.buffer[1] as usize) << 8)
                | self.buffer[2] as usize;
            if len > MAX_FRAME_LEN {
                return Err(TransportError::FrameTooLarge);
            }
            if self.buffer.len() < 3 + len {
                break;
            }
            let frame = self.buffer[3..3 + len].to_vec();
            self.buffer.drain(..3 + len);
            frames.push(frame);
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn accumulator_yields_nothing_on_partial_header() {
        let mut acc = FrameAccumulator::new();
        let frames = acc.push(&[0x00, 0x01]).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn accumulator_splits_multiple_frames_in_one_chunk() {
        let mut chunk = frame_bytes(b"first");
        chunk.extend(frame_bytes(b"second"));

        let mut acc = FrameAccumulator::new();
        let frames = acc.push(&chunk).unwrap();
        assert_eq!(frames, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn accumulator_reassembles_a_frame_split_across_chunks() {
        let whole = frame_bytes(b"reassembled payload");
        let mut acc = FrameAccumulator::new();

        let (first_half, second_half) = whole.split_at(5);
        assert!(acc.push(first_half).unwrap().is_empty());
        let frames = acc.push(second_half).unwrap();
        assert_eq!(frames, vec![b"reassembled payload".to_vec()]);
    }

    #[test]
    fn max_frame_length_boundary_is_accepted() {
        let payload = vec![0_u8; MAX_FRAME_LEN];
        let chunk = frame_bytes(&payload);
        let mut acc = FrameAccumulator::new();
        let frames = acc.push(&chunk).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), MAX_FRAME_LEN);
    }

    #[test]
    fn over_max_frame_length_is_rejected() {
        // Craft a header claiming one byte over the limit without actually
        // allocating the payload; the accumulator must reject based on the
        // header alone.
        let mut header = Vec::new();
        let len = MAX_FRAME_LEN + 1;
        header.extend_from_slice(&(len as u32).to_be_bytes()[1..]);

        let mut acc = FrameAccumulator::new();
        assert!(matches!(acc.push(&header), Err(TransportError::FrameTooLarge)));
    }
}
