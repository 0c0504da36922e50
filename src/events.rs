// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! Unified event stream
//!
//! Every asynchronous stimulus the daemon reacts to arrives as one typed
//! value on a single ordered channel: kernel and IPCP worker notifications,
//! application requests, the OS-process monitor and internal timers all feed
//! the same stream, which the dispatcher drains single-threadedly.

use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::registry::{AppName, FlowSpec, Neighbor};
use crate::transactions::Tid;

/// Sender half of the unified event stream.
pub type EventSender = mpsc::UnboundedSender<Event>;
/// Receiver half of the unified event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Creates the unified event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Channel over which the daemon notifies one application.
pub type AppChannel = mpsc::UnboundedSender<AppNotice>;

/// Notifications delivered to applications. An application always receives a
/// terminal notification for every request it made, positive or negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppNotice {
    /// Result of a registration request
    RegistrationResult {
        app: AppName,
        dif_name: String,
        ok: bool,
    },
    /// Result of an unregistration request
    UnregistrationResult { app: AppName, ok: bool },
    /// Result of a flow allocation; `port_id` is -1 on failure
    FlowAllocated { port_id: i32, dif_name: Option<String> },
    /// A remote peer asks this application to accept a flow
    FlowRequestArrived {
        seq: Tid,
        local_app: AppName,
        remote_app: AppName,
        spec: FlowSpec,
        dif_name: String,
    },
    /// A flow was deallocated, locally or by the remote peer
    FlowDeallocated { port_id: i32, code: i32 },
}

/// One application-visible flow request travelling through the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRequest {
    pub local_app: AppName,
    pub remote_app: AppName,
    pub spec: FlowSpec,
    /// DIF pinned by the requester, if any
    pub dif_name: Option<String>,
    /// Requesting process, for liveness tracking
    pub pid: u32,
    /// Port id; assigned by the daemon for local requests, carried by the
    /// event for remote ones
    pub port_id: i32,
}

/// Base station visible in a media report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseStationInfo {
    /// Address of the base-station IPCP
    pub ipcp_address: String,
    pub signal_strength: i32,
}

/// Per-DIF slice of a media report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaDifInfo {
    pub available_bs_ipcps: Vec<BaseStationInfo>,
}

/// Report from a wireless shim IPCP describing reachable access points.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaReport {
    /// Id of the reporting shim IPCP
    pub ipcp_id: u16,
    /// DIFs within range, with the base stations reachable in each
    pub available_difs: HashMap<String, MediaDifInfo>,
}

/// Everything that can arrive on the unified event stream.
#[derive(Debug)]
pub enum Event {
    // --- kernel / IPCP worker responses, matched by transaction id ---
    CreateIpcpResponse { tid: Tid, result: i32 },
    DestroyIpcpResponse { tid: Tid, result: i32 },
    AssignToDifResponse { tid: Tid, result: i32 },
    UpdateDifConfigResponse { tid: Tid, result: i32 },
    RegisterAppResponse { tid: Tid, result: i32 },
    UnregisterAppResponse { tid: Tid, result: i32 },
    AllocateFlowResult { tid: Tid, result: i32, port_id: i32 },
    DeallocateFlowResponse { tid: Tid, result: i32 },
    EnrollResponse {
        tid: Tid,
        result: i32,
        neighbors: Vec<Neighbor>,
    },
    DisconnectNeighborResponse { tid: Tid, result: i32 },
    QueryRibResponse { tid: Tid, result: i32, rib: String },
    SelectPolicySetResponse { tid: Tid, result: i32 },
    SetPolicySetParamResponse { tid: Tid, result: i32 },
    PluginLoadResponse { tid: Tid, result: i32 },

    // --- unsolicited kernel / IPCP worker notifications ---
    /// The user worker for `ipcp_id` finished initialising; pairs with the
    /// create-IPCP transaction by ipcp id
    IpcpDaemonInitialized { ipcp_id: u16, pid: u32 },
    /// A flow was deallocated by the remote peer
    FlowDeallocated { ipcp_id: u16, port_id: i32, code: i32 },
    /// A remote application requests a flow towards a local one
    RemoteFlowRequest { ipcp_id: u16, req: FlowRequest },
    /// CDAP frame forwarded by an IPCP from an N-1 flow (authentication)
    ForwardedCdapResponse {
        ipcp_id: u16,
        port_id: i32,
        frame: Vec<u8>,
    },
    /// Media report from a wireless shim
    MediaReport(MediaReport),

    // --- application requests ---
    AppRegister {
        app: AppName,
        dif_name: Option<String>,
        pid: u32,
        reply: AppChannel,
    },
    AppUnregister {
        app: AppName,
        dif_name: String,
        pid: u32,
        /// Sequence number; zero signals manager-initiated cleanup, which
        /// must not notify the originator
        seq: u32,
        reply: Option<AppChannel>,
    },
    AppAllocateFlow { req: FlowRequest, reply: AppChannel },
    /// Application verdict on a remote flow request previously forwarded to it
    AppFlowResponse {
        seq: Tid,
        accept: bool,
        pid: u32,
        notify_source: bool,
    },
    AppDeallocateFlow {
        port_id: i32,
        pid: u32,
        /// Zero signals manager-initiated cleanup, which must not notify the
        /// originator
        seq: u32,
        reply: Option<AppChannel>,
    },

    // --- OS process monitor ---
    ProcessFinalized { pid: u32 },
}
