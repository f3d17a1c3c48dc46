//! Out-of-process debugging of running nets.
//!
//! A [`DebugSession`] couples a net built from a [`NetFactory`] to an
//! external debugger UI over a framed TCP protocol: the client can start,
//! stop, pause and reload the net, set breakpoints, and observe the set of
//! active states as it changes. The session instruments the engine through
//! its observer hooks and never blocks it; session failures terminate the
//! session only.

pub mod protocol;
pub mod session;

pub use protocol::PROTOCOL_VERSION;
pub use session::{DebugSession, NetFactory};

use crate::net::Net;
use sha1::{Digest, Sha1};
use std::fmt::Write as _;

/// Computes the hex SHA-1 identity of the net's structure: every action in
/// insertion order with its name and token threshold, and every outgoing
/// transition with its endpoints and evaluation delay. Two nets built the
/// same way have the same hash, which the `hello` handshake compares
/// against the client's.
pub fn structural_hash(net: &Net) -> String {
    let mut hasher = Sha1::new();
    net.inner().visit_structure(|action, transitions| {
        hasher.update(action.id().as_u64().to_le_bytes());
        hasher.update(action.name().as_bytes());
        hasher.update([0]);
        hasher.update((action.required_tokens().get() as u64).to_le_bytes());
        for transition in transitions {
            hasher.update(transition.id().as_u64().to_le_bytes());
            hasher.update(transition.previous().as_u64().to_le_bytes());
            hasher.update(transition.next().as_u64().to_le_bytes());
            let delay_ns =
                u64::try_from(transition.delay_between_evaluation().as_nanos()).unwrap_or(u64::MAX);
            hasher.update(delay_ns.to_le_bytes());
        }
    });

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
