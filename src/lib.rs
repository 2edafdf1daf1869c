//! Connection and protocol core for a WhatsApp Web companion client: the
//! Noise handshake, the binary node wire codec, request correlation, QR
//! pairing, and the connection state machine that ties them together.
//!
//! This crate owns the wire protocol and nothing above it: no persistence
//! backend, no HTTP surface, no chat/business logic. Embedders supply a
//! [`creds::CredentialStore`] and drive the connection through
//! [`connection::ConnectionHandle`].

pub mod binary_node;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod creds;
pub mod crypto;
pub mod error;
pub mod eventbus;
pub mod handshake;
pub mod keepalive;
pub mod noise;
pub mod prekey;
pub mod qr;
pub mod transport;
pub mod version;

pub use config::WaClientConfig;
pub use connection::{spawn, ConnectionHandle};
pub use creds::{AuthenticationCreds, CredentialStore, MeInfo};
pub use error::{WaError, WaErrorKind};
pub use eventbus::{ConnectionStatus, ConnectionUpdate, CredsUpdate, EventBus};
pub use handshake::ClientIdentity;
