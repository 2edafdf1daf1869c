//! The connection state machine: a single actor task owns the socket, the
//! Noise transport, and the correlator/keep-alive/pairing state, exactly as
//! described for the concurrency model this core targets. Embedders talk to
//! it through a [`ConnectionHandle`], never touching the actor directly,
//! mirroring the handle-plus-background-task shape used elsewhere for
//! long-lived connections.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::Instant as TokioInstant,
};

use crate::{
    binary_node::{self, BinaryNode, NodeContent},
    config::WaClientConfig,
    correlator::Correlator,
    creds::{AuthenticationCreds, CredentialStore, MeInfo},
    crypto::{signal_public_key, verify_message},
    error::{WaError, WaErrorKind},
    eventbus::{ConnectionStatus, ConnectionUpdate, CredsUpdate, EventBus, LastDisconnect},
    handshake::{build_prologue, do_handshake, ClientIdentity},
    keepalive::{build_ping_node, evaluate_tick, KeepAliveTick},
    prekey::{build_upload_node, top_up_if_below_threshold, MIN_PREKEY_COUNT},
    qr::{build_qr_string, QrRefSchedule},
    transport::{FrameAccumulator, WsTransport},
};

/// The state machine's own phase. Mirrors the progression the protocol
/// itself goes through; most transitions are driven by which stanza just
/// arrived rather than by this enum, but it's kept explicit per the design
/// note that favors a named state over scattered listener flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActorState {
    Connecting,
    Handshaking,
    Registering,
    LoggingIn,
    Active,
    Closing,
    Closed,
}

/// Commands an embedder sends to a running [`ConnectionActor`] through its
/// handle.
enum ConnectionCommand {
    Query {
        node: BinaryNode,
        timeout: Option<Duration>,
        respond_to: oneshot::Sender<Result<BinaryNode, WaError>>,
    },
    SendNode {
        node: BinaryNode,
    },
    Logout {
        respond_to: oneshot::Sender<Result<(), WaError>>,
    },
    Shutdown,
}

/// An embedder-facing reference to a running connection. Cloning shares the
/// same underlying actor; dropping every clone does not itself terminate the
/// actor (call [`ConnectionHandle::shutdown`] for that).
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<ConnectionCommand>,
}

impl ConnectionHandle {
    /// Sends `node`, stamping it with a fresh tag if it doesn't carry one,
    /// and awaits the matching reply.
    pub async fn query(&self, node: BinaryNode, timeout: Option<Duration>) -> Result<BinaryNode, WaError> {
        let (respond_to, rx) = oneshot::channel();
        self.commands
            .send(ConnectionCommand::Query { node, timeout, respond_to })
            .await
            .map_err(|_| WaError::kind(WaErrorKind::ConnectionClosed))?;
        rx.await.unwrap_or_else(|_| Err(WaError::kind(WaErrorKind::ConnectionClosed)))
    }

    /// Sends `node` without waiting for a reply.
    pub async fn send_node(&self, node: BinaryNode) -> Result<(), WaError> {
        self.commands
            .send(ConnectionCommand::SendNode { node })
            .await
            .map_err(|_| WaError::kind(WaErrorKind::ConnectionClosed))
    }

    /// Requests logout: sends the companion-device removal stanza, then
    /// terminates the connection with [`WaErrorKind::LoggedOut`].
    pub async fn logout(&self) -> Result<(), WaError> {
        let (respond_to, rx) = oneshot::channel();
        self.commands
            .send(ConnectionCommand::Logout { respond_to })
            .await
            .map_err(|_| WaError::kind(WaErrorKind::ConnectionClosed))?;
        rx.await.unwrap_or_else(|_| Err(WaError::kind(WaErrorKind::ConnectionClosed)))
    }

    /// Tears the connection down without a logout handshake.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(ConnectionCommand::Shutdown).await;
    }
}

/// Spawns the connection actor, returning a handle to it and the task's
/// [`JoinHandle`] (awaiting the latter resolves once the connection has
/// fully terminated).
pub fn spawn(
    config: WaClientConfig,
    identity: ClientIdentity,
    creds: AuthenticationCreds,
    store: Arc<dyn CredentialStore>,
    events: EventBus,
) -> (ConnectionHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::channel(32);
    let (outbound_tx, outbound_rx) = mpsc::channel(32);

    let correlator = Arc::new(Mutex::new(Correlator::new(
        outbound_tx.clone(),
        Some(config.default_query_timeout),
    )));

    let actor = ConnectionActor {
        config: Arc::new(config),
        identity: Arc::new(identity),
        store,
        creds: Arc::new(Mutex::new(creds)),
        events: Arc::new(Mutex::new(events)),
        correlator,
        outbound_tx,
        outbound_rx,
        commands_rx,
        socket: None,
        transport: None,
        frame_acc: FrameAccumulator::new(),
        state: ActorState::Connecting,
        qr_schedule: None,
        qr_deadline: None,
        awaiting_restart: false,
        last_frame_at: std::time::Instant::now(),
    };

    let join = tokio::spawn(actor.run());
    (ConnectionHandle { commands: commands_tx }, join)
}

enum QrRotation {
    Emitted(Duration),
    Exhausted,
}

struct ConnectionActor {
    config: Arc<WaClientConfig>,
    identity: Arc<ClientIdentity>,
    store: Arc<dyn CredentialStore>,
    creds: Arc<Mutex<AuthenticationCreds>>,
    events: Arc<Mutex<EventBus>>,
    correlator: Arc<Mutex<Correlator>>,
    outbound_tx: mpsc::Sender<BinaryNode>,
    outbound_rx: mpsc::Receiver<BinaryNode>,
    commands_rx: mpsc::Receiver<ConnectionCommand>,
    socket: Option<WsTransport>,
    transport: Option<crate::noise::Transport>,
    frame_acc: FrameAccumulator,
    state: ActorState,
    qr_schedule: Option<QrRefSchedule>,
    qr_deadline: Option<TokioInstant>,
    awaiting_restart: bool,
    last_frame_at: std::time::Instant,
}

impl ConnectionActor {
    async fn run(mut self) {
        self.emit_connection_update(ConnectionUpdate {
            connection: Some(ConnectionStatus::Connecting),
            ..Default::default()
        })
        .await;

        let mut socket = match WsTransport::connect(&self.config.ws_url, self.config.connect_timeout).await {
            Ok(socket) => socket,
            Err(error) => {
                self.end(WaError::from(error)).await;
                return;
            }
        };

        self.state = ActorState::Handshaking;

        let creds_snapshot = self.creds.lock().await.clone();
        let client_payload = build_client_payload_node(&creds_snapshot, &self.config);
        let prologue = build_prologue(self.config.wire_version.0, self.config.wire_version.1);

        let outcome = match do_handshake(
            &mut socket,
            &self.identity,
            binary_node::encode(&client_payload),
            &prologue,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                self.end(WaError::from(error)).await;
                return;
            }
        };

        tracing::debug!(
            server_payload_len = outcome.server_payload.len(),
            "noise handshake completed"
        );

        self.socket = Some(socket);
        self.transport = Some(outcome.transport);
        self.last_frame_at = std::time::Instant::now();
        self.state = if creds_snapshot.me.is_some() {
            ActorState::LoggingIn
        } else {
            ActorState::Registering
        };

        self.main_loop().await;
    }

    async fn main_loop(&mut self) {
        let mut keep_alive = tokio::time::interval(self.config.keep_alive_interval);
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let qr_wait = tokio::time::sleep_until(
                self.qr_deadline
                    .unwrap_or_else(|| TokioInstant::now() + Duration::from_secs(3600)),
            );

            tokio::select! {
                maybe_node = self.outbound_rx.recv() => {
                    let Some(node) = maybe_node else {
                        // Every sender is the actor's own clones; this is
                        // unreachable in practice, but treat it as a close.
                        self.end(WaError::kind(WaErrorKind::ConnectionClosed)).await;
                        return;
                    };
                    if let Err(error) = self.write_node(node).await {
                        self.end(error).await;
                        return;
                    }
                }

                result = read_one_message(self.socket.as_mut(), &mut self.frame_acc, self.transport.as_mut()) => {
                    match result {
                        Ok(Some(nodes)) => {
                            for node in nodes {
                                self.last_frame_at = std::time::Instant::now();
                                if let Some(reason) = self.handle_inbound(node).await {
                                    self.end(reason).await;
                                    return;
                                }
                            }
                        }
                        Ok(None) => {
                            self.end(WaError::kind(WaErrorKind::ConnectionClosed)).await;
                            return;
                        }
                        Err(error) => {
                            self.end(error).await;
                            return;
                        }
                    }
                }

                _ = keep_alive.tick() => {
                    let since_last_frame = self.last_frame_at.elapsed();
                    match evaluate_tick(self.config.keep_alive_interval, since_last_frame) {
                        KeepAliveTick::Stale => {
                            self.end(WaError::kind(WaErrorKind::ConnectionLost)).await;
                            return;
                        }
                        KeepAliveTick::SendPing => {
                            let _ = self.outbound_tx.send(build_ping_node()).await;
                        }
                    }
                }

                _ = qr_wait, if self.qr_deadline.is_some() => {
                    match self.rotate_qr().await {
                        QrRotation::Emitted(ttl) => {
                            self.qr_deadline = Some(TokioInstant::now() + ttl);
                        }
                        QrRotation::Exhausted => {
                            self.end(WaError::kind(WaErrorKind::Timeout)).await;
                            return;
                        }
                    }
                }

                command = self.commands_rx.recv() => {
                    let Some(command) = command else {
                        self.end(WaError::kind(WaErrorKind::ConnectionClosed)).await;
                        return;
                    };
                    if self.handle_command(command).await {
                        return;
                    }
                }
            }
        }
    }

    async fn write_node(&mut self, node: BinaryNode) -> Result<(), WaError> {
        tracing::trace!(tag = %node.tag, "sending node");
        let encoded = binary_node::encode(&node);
        let ciphertext = self
            .transport
            .as_mut()
            .expect("transport established before the main loop runs")
            .encrypt(&encoded)?;
        self.socket
            .as_mut()
            .expect("socket established before the main loop runs")
            .send_frame(&ciphertext)
            .await?;
        Ok(())
    }

    async fn handle_inbound(&mut self, node: BinaryNode) -> Option<WaError> {
        {
            let mut correlator = self.correlator.lock().await;
            correlator.route_inbound(&node);
        }

        match node.tag.as_str() {
            "iq" if is_set(&node) && node.child("pair-device").is_some() => {
                self.handle_pair_device(&node).await;
                None
            }
            "iq" if node.child("pair-success").is_some() => {
                self.handle_pair_success(&node).await;
                None
            }
            "success" => {
                self.state = ActorState::Active;
                self.handle_success();
                None
            }
            "ib" if node.child("offline").is_some() => {
                self.emit_connection_update(ConnectionUpdate {
                    received_pending_notifications: Some(true),
                    ..Default::default()
                })
                .await;
                None
            }
            "stream:error" => Some(self.classify_stream_error(&node)),
            "failure" => Some(WaError::kind(WaErrorKind::BadSession)),
            "xmlstreamend" => Some(WaError::kind(WaErrorKind::ConnectionClosed)),
            _ => None,
        }
    }

    /// Non-515 codes fall back to `BadSession`: the reference client treats
    /// almost every other `stream:error` as unrecoverable for this session,
    /// and without a documented meaning for each code, over-distinguishing
    /// them here would just be guessing.
    fn classify_stream_error(&self, node: &BinaryNode) -> WaError {
        match node.attrs.get("code").and_then(|code| code.parse::<u32>().ok()) {
            Some(515) if self.awaiting_restart => WaError::kind(WaErrorKind::RestartRequired),
            Some(440) => WaError::kind(WaErrorKind::ConnectionReplaced),
            Some(401) => WaError::kind(WaErrorKind::LoggedOut),
            Some(411) => WaError::kind(WaErrorKind::MultideviceMismatch),
            _ => WaError::kind(WaErrorKind::BadSession),
        }
    }

    async fn handle_pair_device(&mut self, node: &BinaryNode) {
        if let Some(id) = node.attrs.get("id").cloned() {
            let reply = BinaryNode::new("iq").with_attr("id", id).with_attr("type", "result");
            let _ = self.outbound_tx.send(reply).await;
        }

        let Some(pair_device) = node.child("pair-device") else {
            return;
        };

        let refs: Vec<String> = match &pair_device.content {
            Some(NodeContent::Nodes(children)) => children
                .iter()
                .filter(|child| child.tag == "ref")
                .filter_map(|child| match &child.content {
                    Some(NodeContent::Bytes(bytes)) => String::from_utf8(bytes.clone()).ok(),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        if refs.is_empty() {
            tracing::warn!("pair-device stanza carried no usable refs");
            return;
        }

        self.qr_schedule = Some(QrRefSchedule::new(refs));
        match self.rotate_qr().await {
            QrRotation::Emitted(ttl) => {
                self.qr_deadline = Some(TokioInstant::now() + ttl);
            }
            QrRotation::Exhausted => unreachable!("schedule was just populated with at least one ref"),
        }
    }

    async fn rotate_qr(&mut self) -> QrRotation {
        let Some((reference, ttl)) = self.qr_schedule.as_mut().and_then(QrRefSchedule::next_ref) else {
            return QrRotation::Exhausted;
        };

        let qr_string = {
            let creds = self.creds.lock().await;
            build_qr_string(
                &reference,
                &self.identity.noise_static.public,
                &creds.signed_identity_key.public,
                &creds.adv_secret_key,
            )
        };

        self.emit_connection_update(ConnectionUpdate {
            qr: Some(qr_string),
            ..Default::default()
        })
        .await;

        QrRotation::Emitted(ttl)
    }

    async fn handle_pair_success(&mut self, node: &BinaryNode) {
        let Some(pair_success) = node.child("pair-success") else {
            return;
        };

        let device_jid = pair_success.attrs.get("jid").cloned().unwrap_or_default();
        let business_name = pair_success.attrs.get("biz_name").cloned();

        if let Some(NodeContent::Bytes(signature)) =
            pair_success.child("device-identity").and_then(|child| child.content.clone())
        {
            let verified = {
                let creds = self.creds.lock().await;
                verify_message(creds.signed_identity_key.public, device_jid.as_bytes(), &signature)
            };
            if !verified {
                tracing::warn!("pair-success device-identity signature did not verify");
            }
        }

        {
            let mut creds = self.creds.lock().await;
            creds.me = Some(MeInfo { jid: device_jid, name: business_name });
            if let Err(error) = self.store.save_creds(&creds).await {
                tracing::warn!(%error, "failed to persist credentials after pairing");
            }
        }

        // creds.update must be observed before connection.update{isNewLogin}.
        self.emit_creds_update(CredsUpdate { fields_changed: vec!["me".to_string()] }).await;

        if let Some(id) = node.attrs.get("id").cloned() {
            let ack = BinaryNode::new("iq").with_attr("id", id).with_attr("type", "result");
            let _ = self.outbound_tx.send(ack).await;
        }

        self.emit_connection_update(ConnectionUpdate {
            is_new_login: Some(true),
            qr: None,
            ..Default::default()
        })
        .await;

        self.qr_schedule = None;
        self.qr_deadline = None;
        self.awaiting_restart = true;
    }

    /// Queries the pre-key count, tops the pool up if needed, and flips the
    /// session active. Spawned rather than awaited inline: it needs a
    /// round-trip reply, and this actor is the only reader of the socket
    /// that reply arrives on, so waiting for it here would starve the very
    /// read loop the reply depends on.
    fn handle_success(&self) {
        let correlator = self.correlator.clone();
        let events = self.events.clone();
        let creds = self.creds.clone();
        let store = self.store.clone();
        let outbound_tx = self.outbound_tx.clone();

        tokio::spawn(async move {
            let default_timeout = correlator.lock().await.default_query_timeout;
            let count_query = BinaryNode::new("iq")
                .with_attr("type", "get")
                .with_attr("xmlns", "encrypt")
                .with_children(vec![BinaryNode::new("count")]);

            let uploaded_count = match run_query(&correlator, &outbound_tx, count_query, default_timeout).await {
                Ok(reply) => reply
                    .child("count")
                    .and_then(|count| count.attrs.get("value"))
                    .and_then(|value| value.parse::<u32>().ok())
                    .unwrap_or(0),
                Err(error) => {
                    tracing::warn!(%error, "prekey count query failed after success, skipping top-up");
                    MIN_PREKEY_COUNT
                }
            };

            let mut creds_guard = creds.lock().await;
            match top_up_if_below_threshold(store.as_ref(), &mut creds_guard, uploaded_count).await {
                Ok(Some(keys)) => {
                    let upload_node = build_upload_node(&creds_guard, &keys);
                    drop(creds_guard);
                    let _ = outbound_tx.send(upload_node).await;
                }
                Ok(None) => drop(creds_guard),
                Err(error) => {
                    tracing::warn!(%error, "prekey top-up failed");
                    drop(creds_guard);
                }
            }

            let passive_active = BinaryNode::new("iq")
                .with_attr("type", "set")
                .with_attr("xmlns", "passive")
                .with_children(vec![BinaryNode::new("active")]);
            let _ = outbound_tx.send(passive_active).await;

            events.lock().await.emit_connection_update(ConnectionUpdate {
                connection: Some(ConnectionStatus::Open),
                ..Default::default()
            });
        });
    }

    async fn handle_command(&mut self, command: ConnectionCommand) -> bool {
        match command {
            ConnectionCommand::Query { node, timeout, respond_to } => {
                let correlator = self.correlator.clone();
                let outbound_tx = self.outbound_tx.clone();
                let effective_timeout = timeout.or(Some(self.config.default_query_timeout));
                tokio::spawn(async move {
                    let result = run_query(&correlator, &outbound_tx, node, effective_timeout).await;
                    let _ = respond_to.send(result);
                });
                false
            }
            ConnectionCommand::SendNode { node } => {
                let _ = self.outbound_tx.send(node).await;
                false
            }
            ConnectionCommand::Logout { respond_to } => {
                let logout_node = BinaryNode::new("iq")
                    .with_attr("type", "set")
                    .with_attr("xmlns", "md")
                    .with_children(vec![BinaryNode::new("remove-companion-device")]);
                let sent = self.outbound_tx.send(logout_node).await.is_ok();
                let _ = respond_to.send(if sent {
                    Ok(())
                } else {
                    Err(WaError::kind(WaErrorKind::ConnectionClosed))
                });
                self.end(WaError::kind(WaErrorKind::LoggedOut)).await;
                true
            }
            ConnectionCommand::Shutdown => {
                self.end(WaError::kind(WaErrorKind::ConnectionClosed)).await;
                true
            }
        }
    }

    /// The single termination path: closes the socket if open, emits the
    /// final `connection.update{close}`, clears connection-update
    /// subscribers, and fails every pending query. Idempotent.
    async fn end(&mut self, error: WaError) {
        if self.state == ActorState::Closed {
            return;
        }
        self.state = ActorState::Closing;

        let kind = error.as_kind().unwrap_or(WaErrorKind::ConnectionClosed);
        let message = error.to_string();

        if let Some(socket) = self.socket.as_mut() {
            let _ = socket.close().await;
        }

        self.emit_connection_update(ConnectionUpdate {
            connection: Some(ConnectionStatus::Close),
            last_disconnect: Some(LastDisconnect { error: message, date_unix_millis: unix_millis_now() }),
            ..Default::default()
        })
        .await;

        self.events.lock().await.clear_connection_update_listeners();
        self.correlator.lock().await.fail_all_pending(|| WaError::kind(kind));

        self.state = ActorState::Closed;
        tracing::info!(?kind, "connection terminated");
    }

    async fn emit_connection_update(&self, update: ConnectionUpdate) {
        self.events.lock().await.emit_connection_update(update);
    }

    async fn emit_creds_update(&self, update: CredsUpdate) {
        self.events.lock().await.emit_creds_update(update);
    }
}

fn is_set(node: &BinaryNode) -> bool {
    node.attrs.get("type").map(String::as_str) == Some("set")
}

fn unix_millis_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// Reads exactly one WebSocket message and decrypts/decodes every complete
/// frame it yields. A free function (rather than a method) so it can borrow
/// `socket`/`transport` independently of the rest of `self` inside the main
/// loop's `select!`.
async fn read_one_message(
    socket: Option<&mut WsTransport>,
    frame_acc: &mut FrameAccumulator,
    transport: Option<&mut crate::noise::Transport>,
) -> Result<Option<Vec<BinaryNode>>, WaError> {
    let socket = socket.expect("socket established before the main loop runs");
    let transport = transport.expect("transport established before the main loop runs");

    let Some(raw) = socket.next_message().await? else {
        return Ok(None);
    };

    let frames = frame_acc.push(&raw)?;
    let mut nodes = Vec::with_capacity(frames.len());
    for frame in frames {
        let plaintext = transport.decrypt(&frame)?;
        nodes.push(binary_node::decode(&plaintext)?);
    }
    Ok(Some(nodes))
}

/// Stamps a tag, registers a waiter, sends the node through `outbound_tx`,
/// and awaits the reply or timeout. A free function rather than a method on
/// the locked [`Correlator`] so the lock is never held across the wait: it's
/// only taken for the brief synchronous setup and, on timeout, to remove the
/// now-dead waiter.
async fn run_query(
    correlator: &Arc<Mutex<Correlator>>,
    outbound_tx: &mpsc::Sender<BinaryNode>,
    mut node: BinaryNode,
    timeout: Option<Duration>,
) -> Result<BinaryNode, WaError> {
    let (tag, rx) = {
        let mut guard = correlator.lock().await;
        let tag = guard.stamp_tag(&mut node);
        let rx = guard.register_waiter(&tag);
        (tag, rx)
    };

    if outbound_tx.send(node).await.is_err() {
        correlator.lock().await.remove_pending(&tag);
        return Err(WaError::kind(WaErrorKind::ConnectionClosed));
    }

    let outcome = match timeout {
        Some(duration) => match tokio::time::timeout(duration, rx).await {
            Ok(received) => received,
            Err(_) => {
                correlator.lock().await.remove_pending(&tag);
                return Err(WaError::kind(WaErrorKind::Timeout));
            }
        },
        None => rx.await,
    };

    outcome.unwrap_or_else(|_| Err(WaError::kind(WaErrorKind::ConnectionClosed)))
}

/// Builds the Noise `clientFinish` payload: a login node for a session with
/// stored credentials, a registration node (carrying the identity key
/// bundle) for a fresh pairing.
fn build_client_payload_node(creds: &AuthenticationCreds, config: &WaClientConfig) -> BinaryNode {
    let version = format!(
        "{}.{}.{}.{}",
        config.wa_web_version.major,
        config.wa_web_version.minor,
        config.wa_web_version.patch,
        config.wa_web_version.build
    );

    match &creds.me {
        Some(me) => BinaryNode::new("login")
            .with_attr("jid", me.jid.clone())
            .with_attr("version", version)
            .with_attr("registration_id", creds.registration_id.to_string()),
        None => BinaryNode::new("registration")
            .with_attr("version", version)
            .with_attr("registration_id", creds.registration_id.to_string())
            .with_bytes(signal_public_key(&creds.signed_identity_key.public).to_vec()),
    }
}
