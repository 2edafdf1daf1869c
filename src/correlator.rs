//! Request/response correlation and pattern-based dispatch: turns decoded
//! [`BinaryNode`]s arriving on the single inbound stream into resolved
//! `query` futures and fanned-out subscription callbacks.
//!
//! The correlator does not own the socket; it holds an outbound channel to
//! whatever owns the Noise transport (the connection actor) and is driven
//! by that actor's single-threaded event loop, matching the concurrency
//! model described for the connection core: one logical execution context,
//! no interleaving between inbound routing and outbound sends.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use base64::Engine;
use rand_core::{OsRng, RngCore};
use tokio::sync::{mpsc, oneshot};

use crate::{
    binary_node::BinaryNode,
    error::{WaError, WaErrorKind},
};

/// Generates unique message tags: a per-connection random prefix
/// (uniqueness across reconnections) followed by a monotonically
/// increasing epoch counter.
pub struct MessageTagGenerator {
    prefix: String,
    epoch: u64,
}

impl MessageTagGenerator {
    pub fn new() -> Self {
        let mut raw = [0_u8; 9];
        OsRng.fill_bytes(&mut raw);
        let prefix = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw);
        Self { prefix, epoch: 0 }
    }

    pub fn next_tag(&mut self) -> String {
        self.epoch += 1;
        format!("{}.{}", self.prefix, self.epoch)
    }
}

impl Default for MessageTagGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub type SubscriptionId = u64;

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: Box<dyn FnMut(&BinaryNode) -> bool + Send>,
}

/// Routes inbound nodes to tag-keyed request waiters first, then to
/// pattern-matched subscriptions, and tracks outstanding `query` calls.
pub struct Correlator {
    tag_gen: MessageTagGenerator,
    outbound: mpsc::Sender<BinaryNode>,
    pending: HashMap<String, oneshot::Sender<Result<BinaryNode, WaError>>>,
    subscriptions: Vec<Subscription>,
    next_subscription_id: SubscriptionId,
    pub default_query_timeout: Option<Duration>,
}

impl Correlator {
    pub fn new(outbound: mpsc::Sender<BinaryNode>, default_query_timeout: Option<Duration>) -> Self {
        Self {
            tag_gen: MessageTagGenerator::new(),
            outbound,
            pending: HashMap::new(),
            subscriptions: Vec::new(),
            next_subscription_id: 0,
            default_query_timeout,
        }
    }

    /// Assigns an `id` attribute to `node` if it does not already have one,
    /// returning the tag either way.
    pub fn stamp_tag(&mut self, node: &mut BinaryNode) -> String {
        if let Some(existing) = node.attrs.get("id") {
            return existing.clone();
        }
        let tag = self.tag_gen.next_tag();
        node.attrs.insert("id".to_string(), tag.clone());
        tag
    }

    /// Registers a pattern-based subscription. Patterns are composed as
    /// described in [`derive_pattern_keys`]; registration order determines
    /// fan-out order for a single node.
    pub fn subscribe(
        &mut self,
        pattern: impl Into<String>,
        handler: impl FnMut(&BinaryNode) -> bool + Send + 'static,
    ) -> SubscriptionId {
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        self.subscriptions.push(Subscription {
            id,
            pattern: pattern.into(),
            handler: Box::new(handler),
        });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscriptions.retain(|sub| sub.id != id);
    }

    /// Registers a waiter for `tag` without sending anything. `query`
    /// builds on this; exposed separately so callers (and tests) can
    /// stamp, register, and send as distinct steps.
    pub fn register_waiter(&mut self, tag: &str) -> oneshot::Receiver<Result<BinaryNode, WaError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(tag.to_string(), tx);
        rx
    }

    /// Stamps, registers a waiter, sends `node`, and awaits the matching
    /// reply (by `id`), the configured timeout, or channel closure meaning
    /// the connection terminated.
    pub async fn query(
        &mut self,
        mut node: BinaryNode,
        timeout: Option<Duration>,
    ) -> Result<BinaryNode, WaError> {
        let tag = self.stamp_tag(&mut node);
        let rx = self.register_waiter(&tag);

        if self.outbound.send(node).await.is_err() {
            self.pending.remove(&tag);
            return Err(WaError::kind(WaErrorKind::ConnectionClosed));
        }

        let effective_timeout = timeout.or(self.default_query_timeout);
        let outcome = match effective_timeout {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.remove(&tag);
                    return Err(WaError::kind(WaErrorKind::Timeout));
                }
            },
            None => rx.await,
        };

        outcome.unwrap_or_else(|_| Err(WaError::kind(WaErrorKind::ConnectionClosed)))
    }

    /// Routes one decoded inbound node: tag match first (waking a `query`
    /// waiter), then every matching pattern subscription in registration
    /// order. Returns whether any waiter or subscription handled it.
    pub fn route_inbound(&mut self, node: &BinaryNode) -> bool {
        let mut handled = false;

        if let Some(id) = node.attrs.get("id") {
            if let Some(sender) = self.pending.remove(id) {
                let _ = sender.send(assert_node_error_free(node));
                handled = true;
            }
        }

        let keys = derive_pattern_keys(node);
        for subscription in &mut self.subscriptions {
            if keys.contains(&subscription.pattern) && (subscription.handler)(node) {
                handled = true;
            }
        }

        handled
    }

    /// Fails every outstanding `query` with an error built from `make_err`,
    /// called once per pending request. Used on connection termination.
    pub fn fail_all_pending(&mut self, mut make_err: impl FnMut() -> WaError) {
        for (_, sender) in self.pending.drain() {
            let _ = sender.send(Err(make_err()));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drops a waiter without resolving it. Used to reap a tag after its
    /// caller has already timed out, so a late reply finds nothing to land
    /// on rather than resurrecting a waiter the caller stopped polling.
    pub fn remove_pending(&mut self, tag: &str) {
        self.pending.remove(tag);
    }
}

/// Checks a tag-matched `iq` reply for an embedded protocol error: an
/// `error` child, or a `code` attribute outside the 2xx range. Anything
/// else resolves as a successful node, per the reference client's
/// `assertNodeErrorFree`.
fn assert_node_error_free(node: &BinaryNode) -> Result<BinaryNode, WaError> {
    if node.tag != "iq" {
        return Ok(node.clone());
    }

    if let Some(error_child) = node.child("error") {
        let code = error_child.attrs.get("code").and_then(|raw| raw.parse().ok());
        let text = error_child.attrs.get("text").cloned();
        return Err(WaError::NodeError { code, text });
    }

    let is_error_type = node.attrs.get("type").map(String::as_str) == Some("error");
    match node.attrs.get("code").and_then(|raw| raw.parse::<u32>().ok()) {
        Some(code) if is_error_type || !(200..300).contains(&code) => {
            Err(WaError::NodeError { code: Some(code), text: None })
        }
        None if is_error_type => Err(WaError::NodeError { code: None, text: None }),
        _ => Ok(node.clone()),
    }
}

/// Derives the set of pattern keys an inbound node can be matched under:
/// `CB:l0,k:v,l2` → `CB:l0,k:v` → `CB:l0,k` → `CB:l0,,l2` → `CB:l0`, for
/// `l0` the node's tag, `l2` its first child's tag (if any), and `(k,v)`
/// each of its attributes.
pub fn derive_pattern_keys(node: &BinaryNode) -> HashSet<String> {
    let l0 = &node.tag;
    let l2 = first_child_tag(node);
    let mut keys = HashSet::new();
    keys.insert(format!("CB:{l0}"));

    if let Some(l2) = &l2 {
        keys.insert(format!("CB:{l0},,{l2}"));
    }

    for (k, v) in &node.attrs {
        keys.insert(format!("CB:{l0},{k}:{v}"));
        if let Some(l2) = &l2 {
            keys.insert(format!("CB:{l0},{k}:{v},{l2}"));
        }
        keys.insert(format!("CB:{l0},{k}"));
    }

    keys
}

fn first_child_tag(node: &BinaryNode) -> Option<String> {
    match &node.content {
        Some(crate::binary_node::NodeContent::Nodes(children)) => {
            children.first().map(|child| child.tag.clone())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn make_channel() -> (mpsc::Sender<BinaryNode>, mpsc::Receiver<BinaryNode>) {
        mpsc::channel(8)
    }

    #[test]
    fn tag_generation_is_unique_across_many_calls() {
        let mut gen = MessageTagGenerator::new();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(gen.next_tag()));
        }
    }

    #[test]
    fn pattern_keys_match_spec_example() {
        let node = BinaryNode::new("iq")
            .with_attr("type", "get")
            .with_attr("xmlns", "w:p")
            .with_children(vec![BinaryNode::new("ping")]);

        let keys = derive_pattern_keys(&node);
        assert!(keys.contains("CB:iq,type:get,ping"));
        assert!(keys.contains("CB:iq,type:get"));
        assert!(keys.contains("CB:iq,type"));
        assert!(keys.contains("CB:iq,,ping"));
        assert!(keys.contains("CB:iq"));
    }

    #[test]
    fn tag_match_resolves_waiter_and_pattern_subscriptions_both_fire() {
        let (tx, _rx) = make_channel();
        let mut correlator = Correlator::new(tx, None);
        let fired = Arc::new(Mutex::new(false));
        let fired_clone = fired.clone();
        correlator.subscribe("CB:iq,type:result", move |_| {
            *fired_clone.lock().unwrap() = true;
            true
        });

        let mut node = BinaryNode::new("iq").with_attr("type", "get");
        let tag = correlator.stamp_tag(&mut node);
        let mut rx = correlator.register_waiter(&tag);

        let reply = BinaryNode::new("iq")
            .with_attr("id", tag.as_str())
            .with_attr("type", "result");
        assert!(correlator.route_inbound(&reply));

        let resolved = rx.try_recv().unwrap().unwrap();
        assert_eq!(resolved.attrs.get("type").unwrap(), "result");
        assert!(*fired.lock().unwrap());
    }

    #[test]
    fn tag_match_with_error_child_resolves_waiter_with_node_error() {
        let (tx, _rx) = make_channel();
        let mut correlator = Correlator::new(tx, None);

        let mut node = BinaryNode::new("iq").with_attr("type", "get");
        let tag = correlator.stamp_tag(&mut node);
        let mut rx = correlator.register_waiter(&tag);

        let reply = BinaryNode::new("iq").with_attr("id", tag.as_str()).with_attr("type", "error").with_children(vec![
            BinaryNode::new("error").with_attr("code", "401").with_attr("text", "not-authorized"),
        ]);
        assert!(correlator.route_inbound(&reply));

        let resolved = rx.try_recv().unwrap();
        assert!(matches!(
            resolved,
            Err(WaError::NodeError { code: Some(401), text: Some(ref text) }) if text == "not-authorized"
        ));
    }

    #[test]
    fn tag_match_with_non_2xx_code_attr_resolves_waiter_with_node_error() {
        let (tx, _rx) = make_channel();
        let mut correlator = Correlator::new(tx, None);

        let mut node = BinaryNode::new("iq").with_attr("type", "get");
        let tag = correlator.stamp_tag(&mut node);
        let mut rx = correlator.register_waiter(&tag);

        let reply = BinaryNode::new("iq").with_attr("id", tag.as_str()).with_attr("code", "404");
        assert!(correlator.route_inbound(&reply));

        let resolved = rx.try_recv().unwrap();
        assert!(matches!(resolved, Err(WaError::NodeError { code: Some(404), .. })));
    }

    #[tokio::test]
    async fn query_times_out_and_drops_late_response() {
        let (tx, mut rx) = make_channel();
        let mut correlator = Correlator::new(tx, None);

        let outgoing = BinaryNode::new("iq").with_attr("type", "get");
        let result = tokio::time::timeout(
            Duration::from_millis(500),
            correlator.query(outgoing, Some(Duration::from_millis(20))),
        )
        .await
        .unwrap();

        assert!(matches!(
            result,
            Err(WaError::Taxonomy { kind: WaErrorKind::Timeout, .. })
        ));
        assert_eq!(correlator.pending_count(), 0);

        let sent = rx.recv().await.unwrap();
        let tag = sent.attrs.get("id").unwrap().clone();
        // A late response for the now-expired tag has nowhere to land.
        let late_reply = BinaryNode::new("iq").with_attr("id", tag.as_str());
        assert!(!correlator.route_inbound(&late_reply));
    }

    #[test]
    fn subscription_registered_after_the_fact_does_not_fire_retroactively() {
        let (tx, _rx) = make_channel();
        let mut correlator = Correlator::new(tx, None);

        let node = BinaryNode::new("presence").with_attr("type", "available");
        assert!(!correlator.route_inbound(&node));

        let fired = Arc::new(Mutex::new(false));
        let fired_clone = fired.clone();
        correlator.subscribe("CB:presence,type:available", move |_| {
            *fired_clone.lock().unwrap() = true;
            true
        });
        assert!(!*fired.lock().unwrap());
    }

    #[test]
    fn multiple_subscriptions_fire_in_registration_order() {
        let (tx, _rx) = make_channel();
        let mut correlator = Correlator::new(tx, None);
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = order.clone();
        correlator.subscribe("CB:presence", move |_| {
            order_a.lock().unwrap().push("broad");
            true
        });
        let order_b = order.clone();
        correlator.subscribe("CB:presence,type:available", move |_| {
            order_b.lock().unwrap().push("specific");
            true
        });

        let node = BinaryNode::new("presence").with_attr("type", "available");
        assert!(correlator.route_inbound(&node));
        assert_eq!(*order.lock().unwrap(), vec!["broad", "specific"]);
    }
}
