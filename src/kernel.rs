// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! Command surface towards the kernel and the per-IPCP user workers
//!
//! The kernel side of the stack is an opaque peer: it consumes the commands
//! below and emits the events of [`crate::events`]. Requests that expect a
//! reply carry the transaction id the response must echo. The daemon never
//! blocks on this channel; ordering per transaction id is preserved because
//! every response is routed through the transaction table.

use tokio::sync::mpsc;

use crate::events::FlowRequest;
use crate::registry::{AppName, IpcpType};
use crate::templates::{DifConfig, DifInfo};
use crate::transactions::Tid;

/// Commands issued by the daemon towards the kernel/IPCP peer.
#[derive(Debug)]
pub enum KernelRequest {
    CreateIpcp {
        tid: Tid,
        ipcp_id: u16,
        name: AppName,
        ipcp_type: IpcpType,
    },
    DestroyIpcp { tid: Tid, ipcp_id: u16 },
    AssignToDif {
        tid: Tid,
        ipcp_id: u16,
        dif_info: DifInfo,
    },
    UpdateDifConfig {
        tid: Tid,
        ipcp_id: u16,
        config: DifConfig,
    },
    RegisterApp {
        tid: Tid,
        ipcp_id: u16,
        app: AppName,
        /// Id of the registering IPCP, or 0 when the registrant is an
        /// ordinary application
        reg_ipcp_id: u16,
    },
    UnregisterApp {
        tid: Tid,
        ipcp_id: u16,
        app: AppName,
    },
    /// Tells an IPCP that it has been (un)registered in a supporting DIF
    NotifyRegistration {
        ipcp_id: u16,
        dif_name: String,
        registered: bool,
    },
    AllocateFlow {
        tid: Tid,
        ipcp_id: u16,
        req: FlowRequest,
    },
    /// Verdict for a remote flow request; no reply expected
    AllocateFlowResponse {
        ipcp_id: u16,
        port_id: i32,
        result: i32,
        notify_source: bool,
        /// IPCP id of the accepting process, 0 for an application
        acceptor_ipcp_id: u16,
    },
    DeallocateFlow {
        tid: Tid,
        ipcp_id: u16,
        port_id: i32,
    },
    Enroll {
        tid: Tid,
        ipcp_id: u16,
        dif_name: String,
        supporting_dif_name: String,
        neighbor: AppName,
        /// Expected upper-layer neighbor to disconnect from after a prepared
        /// handover, if any
        disc_neighbor: Option<AppName>,
        prepare_handover: bool,
    },
    DisconnectNeighbor {
        tid: Tid,
        ipcp_id: u16,
        neighbor: AppName,
    },
    QueryRib {
        tid: Tid,
        ipcp_id: u16,
        object_class: String,
        object_name: String,
    },
    SelectPolicySet {
        tid: Tid,
        ipcp_id: u16,
        path: String,
        name: String,
    },
    SetPolicySetParam {
        tid: Tid,
        ipcp_id: u16,
        path: String,
        name: String,
        value: String,
    },
    PluginLoad {
        tid: Tid,
        ipcp_id: u16,
        plugin: String,
        load: bool,
    },
    /// CDAP frame to push onto an N-1 flow (authentication objects)
    SendCdap {
        ipcp_id: u16,
        port_id: i32,
        frame: Vec<u8>,
    },
}

/// Handle used by the daemon to issue commands to the peer.
///
/// The channel is unbounded so commands can be issued while the per-record
/// lock is held without suspending.
#[derive(Debug, Clone)]
pub struct KernelHandle {
    tx: mpsc::UnboundedSender<KernelRequest>,
}

impl KernelHandle {
    pub fn new(tx: mpsc::UnboundedSender<KernelRequest>) -> Self {
        Self { tx }
    }

    /// Creates a connected handle/receiver pair.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<KernelRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Sends one command. A closed peer is reported, not fatal: the
    /// transaction reaper will time the operation out.
    pub fn send(&self, req: KernelRequest) {
        if self.tx.send(req).is_err() {
            tracing::warn!("kernel peer channel closed, dropping command");
        }
    }
}
