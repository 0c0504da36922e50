// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! Core library of the ipcmd daemon.
//!
//! ipcmd is the user-space control plane of a RINA stack: it creates and
//! destroys IPC processes, drives them through DIF assignment, registration
//! and enrollment, brokers application registrations and flow allocations,
//! and reacts to kernel and worker events asynchronously. The kernel side
//! and the per-IPCP user workers are opaque peers behind a command/event
//! channel pair.

// Public module declarations
pub mod auth;
pub mod cdap;
pub mod config;
pub mod error;
pub mod events;
pub mod flows;
pub mod kernel;
pub mod manager;
pub mod mobility;
pub mod procmon;
pub mod registry;
pub mod templates;
pub mod transactions;

// Re-export commonly used types
pub use auth::{AuthPolicy, AuthStatus, Authenticator, SessionKey, SshRsaAuthOptions};
pub use cdap::{CdapMessage, CdapOpCode, CdapValue};
pub use config::{CliArgs, DaemonConfig};
pub use error::{IpcmError, TemplateLoadError, WireError};
pub use events::{
    AppChannel, AppNotice, Event, EventReceiver, EventSender, FlowRequest, MediaReport,
};
pub use flows::{AppRegistration, FlowManager};
pub use kernel::{KernelHandle, KernelRequest};
pub use manager::IpcManager;
pub use mobility::{HandoverTarget, MobilityConfig, MobilityManager};
pub use procmon::{PidTracker, ProcessMonitor};
pub use registry::{
    AppName, FlowInfo, FlowSpec, IpcpHandle, IpcpRegistry, IpcpState, IpcpSummary, IpcpType,
    Neighbor,
};
pub use templates::{AuthProfile, DifConfig, DifInfo, DifTemplate, DifTemplateManager, PolicyConfig};
pub use transactions::{Promise, Tid, TransactionKind, TransactionTable, TxOutcome, TxResult};
