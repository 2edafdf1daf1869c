//! Synchronous named-event fan-out: `on`/`off`/`emit`, dispatched on the
//! calling execution context. Handlers must not block; the core relies on
//! this for its own `connection.update`/`creds.update` notifications.

use std::collections::HashMap;

pub type ListenerId = u64;

/// A partial update to connection status. Only the fields relevant to the
/// triggering event are set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionUpdate {
    pub connection: Option<ConnectionStatus>,
    pub qr: Option<String>,
    pub is_new_login: Option<bool>,
    pub received_pending_notifications: Option<bool>,
    pub last_disconnect: Option<LastDisconnect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastDisconnect {
    pub error: String,
    pub date_unix_millis: u64,
}

struct Listener<T> {
    id: ListenerId,
    handler: Box<dyn FnMut(&T) + Send>,
}

/// A single named event's listener list.
struct Topic<T> {
    listeners: Vec<Listener<T>>,
}

impl<T> Default for Topic<T> {
    fn default() -> Self {
        Self { listeners: Vec::new() }
    }
}

impl<T> Topic<T> {
    fn on(&mut self, id: ListenerId, handler: Box<dyn FnMut(&T) + Send>) {
        self.listeners.push(Listener { id, handler });
    }

    fn off(&mut self, id: ListenerId) {
        self.listeners.retain(|listener| listener.id != id);
    }

    fn emit(&mut self, event: &T) {
        for listener in &mut self.listeners {
            (listener.handler)(event);
        }
    }

    fn clear(&mut self) {
        self.listeners.clear();
    }
}

/// The core's event bus. Only `connection.update` and `creds.update` are
/// well-known, typed topics; anything else (feature-layer events) lives
/// outside this core.
pub struct EventBus {
    next_id: ListenerId,
    connection_update: Topic<ConnectionUpdate>,
    creds_update: Topic<CredsUpdate>,
}

/// Partial credential update, emitted whenever the credential store's
/// authoritative state changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CredsUpdate {
    pub fields_changed: Vec<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            connection_update: Topic::default(),
            creds_update: Topic::default(),
        }
    }

    fn allocate_id(&mut self) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn on_connection_update(
        &mut self,
        handler: impl FnMut(&ConnectionUpdate) + Send + 'static,
    ) -> ListenerId {
        let id = self.allocate_id();
        self.connection_update.on(id, Box::new(handler));
        id
    }

    pub fn off_connection_update(&mut self, id: ListenerId) {
        self.connection_update.off(id);
    }

    pub fn emit_connection_update(&mut self, update: ConnectionUpdate) {
        self.connection_update.emit(&update);
    }

    pub fn on_creds_update(&mut self, handler: impl FnMut(&CredsUpdate) + Send + 'static) -> ListenerId {
        let id = self.allocate_id();
        self.creds_update.on(id, Box::new(handler));
        id
    }

    pub fn off_creds_update(&mut self, id: ListenerId) {
        self.creds_update.off(id);
    }

    pub fn emit_creds_update(&mut self, update: CredsUpdate) {
        self.creds_update.emit(&update);
    }

    /// Clears every `connection.update` subscriber. Called once the final
    /// `connection.update{connection:'close'}` has been emitted during
    /// termination.
    pub fn clear_connection_update_listeners(&mut self) {
        self.connection_update.clear();
    }
}
