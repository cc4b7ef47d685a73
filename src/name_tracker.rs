//! Arbitrary-lifecycle name tracking, a thin façade over peer state
//! subscriptions.
//!
//! Consumers that care about more than owner loss subscribe here and receive
//! every state transition of a name, plus one deferred notification of the
//! current state right after subscribing. The dedup key is the handler
//! `Arc` itself: re-adding the same handler is a no-op.

use std::sync::Arc;

use crate::peer::{Peers, StateHandler};

/// Subscribe `handler` to every state transition of `name`. Returns the
/// subscription id; re-adding an identical handler returns the existing id.
pub fn track(peers: &Arc<Peers>, name: &str, handler: StateHandler) -> u64 {
    peers.subscribe_state(name, handler)
}

/// Detach a subscription. The slot is nilled in place, so a handler may
/// remove itself from within its own callback. Returns whether anything was
/// removed.
pub fn untrack(peers: &Arc<Peers>, name: &str, id: u64) -> bool {
    peers.unsubscribe_state(name, id)
}
