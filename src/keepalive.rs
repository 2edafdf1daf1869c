//! Keep-alive scheduling: after the handshake completes, periodically
//! checks for staleness and pings the server to keep the session alive.

use std::time::Duration;

use crate::binary_node::BinaryNode;

/// Builds the `iq type=get xmlns=w:p` ping node sent on every keep-alive
/// tick.
pub fn build_ping_node() -> BinaryNode {
    BinaryNode::new("iq")
        .with_attr("type", "get")
        .with_attr("xmlns", "w:p")
        .with_children(vec![BinaryNode::new("ping")])
}

/// Outcome of one keep-alive tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveTick {
    /// The connection is stale; the caller must terminate with
    /// `ConnectionLost`.
    Stale,
    /// Still healthy; a ping should be sent.
    SendPing,
}

/// Evaluates one keep-alive tick given the interval, the grace period, and
/// how long it has been since the last frame was received (updated by
/// Noise on every decoded frame, not only pong replies).
pub fn evaluate_tick(keep_alive_interval: Duration, since_last_frame: Duration) -> KeepAliveTick {
    let staleness_threshold = keep_alive_interval + Duration::from_secs(5);
    if since_last_frame > staleness_threshold {
        KeepAliveTick::Stale
    } else {
        KeepAliveTick::SendPing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(30);

    #[test]
    fn tick_just_under_threshold_sends_ping() {
        // 30s interval + 5s grace = 35s threshold; at T+34999ms we're still
        // healthy.
        let tick = evaluate_tick(INTERVAL, Duration::from_millis(34_999));
        assert_eq!(tick, KeepAliveTick::SendPing);
    }

    #[test]
    fn tick_just_over_threshold_is_stale() {
        // At T+35001ms the connection is stale and must terminate.
        let tick = evaluate_tick(INTERVAL, Duration::from_millis(35_001));
        assert_eq!(tick, KeepAliveTick::Stale);
    }

    #[test]
    fn ping_node_matches_expected_shape() {
        let node = build_ping_node();
        assert_eq!(node.tag, "iq");
        assert_eq!(node.attrs.get("type").unwrap(), "get");
        assert_eq!(node.attrs.get("xmlns").unwrap(), "w:p");
        assert_eq!(node.child("ping").unwrap().tag, "ping");
    }
}
