//! Caller/receiver resolution.
//!
//! Random mode breaks the symmetry with a total order over transport
//! ids, which needs no coordination. Direct mode follows human intent:
//! whoever initiated the invitation is the caller, regardless of how the
//! ids sort, so roles stay stable across reconnects. The initiator flag
//! is mandatory for Direct sessions; there is deliberately no id-based
//! fallback for them.

use crate::types::{CallRole, TransportId};

/// Resolves the offer initiator for a session
pub struct RoleResolver;

impl RoleResolver {
    /// Random mode: the lexicographically lower transport id calls
    #[must_use]
    pub fn resolve_random(local: &TransportId, remote: &TransportId) -> CallRole {
        if local < remote {
            CallRole::Caller
        } else {
            CallRole::Receiver
        }
    }

    /// Direct mode: the invitation initiator calls
    #[must_use]
    pub fn resolve_direct(initiated_locally: bool) -> CallRole {
        if initiated_locally {
            CallRole::Caller
        } else {
            CallRole::Receiver
        }
    }
}
