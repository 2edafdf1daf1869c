//! Drives the three-message Noise_XX handshake over a [`WsTransport`],
//! producing an established [`Transport`] plus the client payload
//! exchanged during the handshake (QR reference, pairing, or login jid).

use prost::Message as _;
use waproto::{ClientFinish, ClientHello, HandshakeMessage};

use crate::{
    crypto::KeyPair,
    error::HandshakeError,
    noise::{HandshakeState, Transport},
    transport::{frame_payload, unwrap_single_frame, WsTransport},
};

/// Matches the reference client's Noise prologue: protocol name marker
/// plus the two-byte major/minor wire version.
pub fn build_prologue(wire_major: u8, wire_minor: u8) -> Vec<u8> {
    vec![b'W', b'A', wire_major, wire_minor]
}

/// Static identity material the client presents during the handshake.
pub struct ClientIdentity {
    pub noise_static: KeyPair,
}

/// Outcome of a successful handshake: the transport ready for application
/// frames, plus whatever payload the server included in its finish
/// message (used by the caller to detect QR-pairing vs. restored-session
/// flows).
pub struct HandshakeOutcome {
    pub transport: Transport,
    pub server_payload: Vec<u8>,
}

/// Runs the client side of the Noise_XX handshake: send client hello,
/// receive+verify server hello, send client finish.
pub async fn do_handshake(
    socket: &mut WsTransport,
    identity: &ClientIdentity,
    client_payload: Vec<u8>,
    prologue: &[u8],
) -> Result<HandshakeOutcome, HandshakeError> {
    let mut state = HandshakeState::new(prologue);
    let ephemeral = crate::crypto::generate_keypair();

    state.mix_hash(&ephemeral.public);
    state.mark_ephemeral_sent();

    let client_hello = HandshakeMessage {
        client_hello: Some(ClientHello {
            ephemeral: ephemeral.public.to_vec(),
        }),
        server_hello: None,
        client_finish: None,
    };
    // The prologue precedes only the first frame, not the protobuf payload
    // itself: it is raw bytes the server consumes before the first
    // length-prefixed frame header.
    let mut first_message = prologue.to_vec();
    first_message.extend_from_slice(&frame_payload(&client_hello.encode_to_vec())?);
    socket.send_raw(&first_message).await?;

    let raw = socket
        .next_message()
        .await?
        .ok_or(HandshakeError::MissingField("server hello message"))?;
    let payload = unwrap_single_frame(&raw)?;
    let server_message =
        HandshakeMessage::decode(payload.as_slice()).map_err(HandshakeError::Decode)?;
    let server_hello = server_message
        .server_hello
        .ok_or(HandshakeError::MissingField("server_hello"))?;

    if server_hello.ephemeral.len() != 32 {
        return Err(HandshakeError::InvalidKeyLength("server_hello.ephemeral"));
    }
    let mut server_ephemeral = [0_u8; 32];
    server_ephemeral.copy_from_slice(&server_hello.ephemeral);

    state.mix_hash(&server_ephemeral);
    let dh_ee = ephemeral.diffie_hellman(&server_ephemeral);
    state.mix_into_key(&dh_ee)?;

    let server_static = state.decrypt_and_hash(&server_hello.r#static)?;
    if server_static.len() != 32 {
        return Err(HandshakeError::InvalidKeyLength("server_hello.static"));
    }
    let mut server_static_key = [0_u8; 32];
    server_static_key.copy_from_slice(&server_static);

    let dh_es = ephemeral.diffie_hellman(&server_static_key);
    state.mix_into_key(&dh_es)?;

    let server_payload = state.decrypt_and_hash(&server_hello.payload)?;

    let encrypted_static = state.encrypt_and_hash(&identity.noise_static.public)?;
    let dh_se = identity.noise_static.diffie_hellman(&server_ephemeral);
    state.mix_into_key(&dh_se)?;

    let encrypted_payload = state.encrypt_and_hash(&client_payload)?;
    state.mark_handshake_processed();

    let client_finish = HandshakeMessage {
        client_hello: None,
        server_hello: None,
        client_finish: Some(ClientFinish {
            r#static: encrypted_static,
            payload: encrypted_payload,
        }),
    };
    socket.send_frame(&client_finish.encode_to_vec()).await?;

    Ok(HandshakeOutcome {
        transport: state.finish(),
        server_payload,
    })
}
