//! Error taxonomy shared by Host and Runner (spec.md §7).
//!
//! This enumerates *kinds*, not every concrete failure; each binary crate
//! wraps these in its own `thiserror` type with the extra context (request
//! path, entity id) needed for its own `IntoResponse` mapping.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed submission or unknown target. Surfaced as 4xx, never persisted.
    Validation,
    /// No node fits the request. Surfaced as 409; task row is not created.
    ResourceExhaustion,
    /// Runner unreachable or rejected the dispatch. Task becomes `failed`.
    Dispatch,
    /// Detected by the runner monitor; non-terminal tasks become `lost`.
    RunnerDeath,
    /// WebSocket tunnel dropped; local sockets closed with `ERROR`.
    TunnelTransport,
    /// CAS miss on a status update; current state is returned to the caller.
    StateConflict,
    /// Duplicate task id, corrupted vault, or similar: the component should
    /// exit for supervisory restart rather than limp along.
    FatalInvariant,
}

impl ErrorKind {
    /// Default HTTP status for this kind, used by both Host and Runner
    /// `IntoResponse` impls so the mapping stays in one place.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::ResourceExhaustion => 409,
            ErrorKind::Dispatch => 502,
            ErrorKind::RunnerDeath => 410,
            ErrorKind::TunnelTransport => 502,
            ErrorKind::StateConflict => 409,
            ErrorKind::FatalInvariant => 500,
        }
    }
}
