//! Wire-format messages for the Noise handshake envelope.
//!
//! These are hand-authored `prost::Message` implementations rather than
//! `.proto`-generated code: the handshake envelope is three small,
//! stable messages, and deriving them directly avoids a build-time
//! `protoc` dependency for a surface this small.

/// One arm of the Noise XX handshake envelope.
///
/// Exactly one of `client_hello`, `server_hello`, `client_finish` is set
/// in a given message, mirroring the discriminated union the reference
/// client sends over the wire.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct HandshakeMessage {
    #[prost(message, optional, tag = "1")]
    pub client_hello: Option<ClientHello>,
    #[prost(message, optional, tag = "2")]
    pub server_hello: Option<ServerHello>,
    #[prost(message, optional, tag = "3")]
    pub client_finish: Option<ClientFinish>,
}

/// First handshake message: `-> e`.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ClientHello {
    #[prost(bytes = "vec", tag = "1")]
    pub ephemeral: Vec<u8>,
}

/// Second handshake message: `<- e, ee, s, es`.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ServerHello {
    #[prost(bytes = "vec", tag = "1")]
    pub ephemeral: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub r#static: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

/// Third handshake message: `-> s, se`.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ClientFinish {
    #[prost(bytes = "vec", tag = "1")]
    pub r#static: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}
