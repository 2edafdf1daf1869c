use thiserror::Error;

use crate::{binary_node::BinaryNodeError, crypto::CryptoError, noise::NoiseError};

/// Errors for websocket transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to connect transport: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("connect_timeout elapsed before the websocket upgrade completed")]
    ConnectTimeout,
    #[error("invalid websocket request: {0}")]
    InvalidRequest(#[from] http::Error),
    #[error("invalid websocket url or header: {0}")]
    InvalidUrl(String),
    #[error("invalid framed payload: {0}")]
    InvalidFrame(&'static str),
    #[error("payload exceeds max 24-bit frame size")]
    FrameTooLarge,
    #[error("transport closed by peer")]
    Closed,
}

/// Errors for the Noise handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Noise(#[from] NoiseError),
    #[error("handshake proto decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("handshake payload encode failed: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("missing handshake field: {0}")]
    MissingField(&'static str),
    #[error("invalid handshake key length for {0}")]
    InvalidKeyLength(&'static str),
}

/// The error kind taxonomy from the protocol's own error model, independent
/// of which Rust type produced the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaErrorKind {
    /// Socket closed cleanly. Fatal for the session.
    ConnectionClosed,
    /// Keep-alive staleness detected. Fatal; embedder may reconnect.
    ConnectionLost,
    /// Session replaced by another device login elsewhere. Fatal.
    ConnectionReplaced,
    /// Per-request or QR-exhaustion timeout. Local to the call.
    Timeout,
    /// User logout or server-side credential revocation. Fatal.
    LoggedOut,
    /// Post-pair-success reconnect signal. Fatal; reconnect with new creds.
    RestartRequired,
    /// Noise/AEAD failure. Fatal.
    BadSession,
    /// Legacy client used against a multi-device account. Fatal.
    MultideviceMismatch,
    /// Inbound node carried an error child or non-2xx status code.
    NodeError,
}

impl WaErrorKind {
    /// Numeric status code mirroring the protocol's own error codes.
    pub const fn status_code(self) -> u32 {
        match self {
            Self::ConnectionClosed => 428,
            Self::ConnectionLost => 408,
            Self::ConnectionReplaced => 440,
            Self::Timeout => 408,
            Self::LoggedOut => 401,
            Self::RestartRequired => 515,
            Self::BadSession => 500,
            Self::MultideviceMismatch => 411,
            Self::NodeError => 0,
        }
    }
}

/// Top-level error returned to embedders from the connection core.
#[derive(Debug, Error)]
pub enum WaError {
    #[error("{kind:?} ({status_code})")]
    Taxonomy {
        kind: WaErrorKind,
        status_code: u32,
    },
    #[error("node error: code={code:?} text={text:?}")]
    NodeError { code: Option<u32>, text: Option<String> },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Noise(#[from] NoiseError),
    #[error(transparent)]
    BinaryNode(#[from] BinaryNodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

impl WaError {
    /// Builds a taxonomy error for a given kind.
    pub fn kind(kind: WaErrorKind) -> Self {
        Self::Taxonomy {
            kind,
            status_code: kind.status_code(),
        }
    }

    /// Returns the taxonomy kind for this error, if it maps to one.
    pub fn as_kind(&self) -> Option<WaErrorKind> {
        match self {
            Self::Taxonomy { kind, .. } => Some(*kind),
            Self::Transport(_) => Some(WaErrorKind::ConnectionClosed),
            Self::Noise(_) | Self::Handshake(HandshakeError::Noise(_)) => {
                Some(WaErrorKind::BadSession)
            }
            _ => None,
        }
    }
}
