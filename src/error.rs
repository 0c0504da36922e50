// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! Error types for the IPC manager daemon
//!
//! This module provides typed errors for every component of the daemon,
//! replacing string-based errors with structured error types.

use thiserror::Error;

/// Main error type for IPC manager operations.
///
/// Every orchestrator operation resolves its promise with either a typed
/// outcome or one of these kinds. Peer failures are surfaced verbatim;
/// enrollment errors collapse to `AuthenticationFailed` for the caller while
/// the concrete reason is preserved in the logs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpcmError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation not allowed in state {state}: {operation}")]
    WrongState { operation: String, state: String },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid DIF template: {0}")]
    TemplateInvalid(String),

    #[error("No IPCP assigned to DIF: {0}")]
    NoSuchDif(String),

    #[error("Not registered: {0}")]
    NotRegistered(String),

    #[error("No such neighbor: {0}")]
    NoSuchNeighbor(String),

    #[error("IPCP type not supported: {0}")]
    TypeUnsupported(String),

    #[error("Failed to spawn IPCP worker: {0}")]
    WorkerSpawnFailed(String),

    #[error("Unknown component path: {0}")]
    UnknownPath(String),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transaction {0} already finalised")]
    AlreadyFinalised(u32),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Peer returned error code {0}")]
    PeerFailure(i32),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IpcmError {
    /// Builds a `WrongState` error for `operation` attempted against a record
    /// whose lifecycle state renders it invalid.
    pub fn wrong_state(operation: &str, state: impl std::fmt::Display) -> Self {
        IpcmError::WrongState {
            operation: operation.to_string(),
            state: state.to_string(),
        }
    }
}

/// Errors raised while loading DIF templates from disk.
///
/// These never cross the orchestrator boundary: a template that fails to load
/// is logged and ignored by the watcher, and an assign-to-DIF against a
/// missing template surfaces as [`IpcmError::TemplateInvalid`].
#[derive(Error, Debug)]
pub enum TemplateLoadError {
    #[error("I/O error reading template: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse template JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors raised by the wire codecs (CDAP frames, auth option blobs).
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),
}

impl From<postcard::Error> for WireError {
    fn from(e: postcard::Error) -> Self {
        WireError::Decode(e.to_string())
    }
}

impl From<prost::DecodeError> for WireError {
    fn from(e: prost::DecodeError) -> Self {
        WireError::Decode(e.to_string())
    }
}

impl From<WireError> for IpcmError {
    fn from(e: WireError) -> Self {
        IpcmError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_state_display() {
        let err = IpcmError::wrong_state("assign-to-dif", "Created");
        assert_eq!(
            err.to_string(),
            "Operation not allowed in state Created: assign-to-dif"
        );
    }

    #[test]
    fn test_peer_failure_display() {
        assert_eq!(
            IpcmError::PeerFailure(-7).to_string(),
            "Peer returned error code -7"
        );
    }
}
