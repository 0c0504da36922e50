// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! IPCP orchestrator
//!
//! The operation layer of the daemon. Every public operation follows the same
//! pattern: validate inputs, select the target IPCP, open a transaction,
//! issue the kernel command carrying the transaction id and hand the caller a
//! promise. The response handlers match the id, mutate the registry under the
//! per-record write lock, complete the promise with a typed result and drop
//! the transaction.
//!
//! Lock order is registry-map, then record, then transaction table. Commands
//! are issued under the record lock only; the dispatcher never holds the map
//! lock while talking to the kernel.

use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{Authenticator, SessionKey};
use crate::cdap::CdapMessage;
use crate::error::IpcmError;
use crate::events::{Event, EventReceiver, MediaReport};
use crate::flows::FlowManager;
use crate::kernel::{KernelHandle, KernelRequest};
use crate::procmon::PidTracker;
use crate::registry::{
    AppName, IpcpHandle, IpcpRegistry, IpcpState, IpcpSummary, IpcpType, Neighbor,
};
use crate::templates::{DifConfig, DifInfo, DifTemplateManager};
use crate::transactions::{
    Promise, Tid, Transaction, TransactionKind, TransactionTable, TxOutcome, DEFAULT_TIMEOUT,
};

/// Result code used by workers to report an enrollment rejected by the
/// authentication policy.
const ENROLL_AUTH_FAILED: i32 = -2;

/// Root context of the daemon. One instance is shared by the dispatcher, the
/// addons and the monitors; there is no process-wide mutable state anywhere
/// else.
pub struct IpcManager {
    pub registry: IpcpRegistry,
    pub transactions: TransactionTable,
    pub templates: DifTemplateManager,
    pub flows: FlowManager,
    pub auth: Arc<Authenticator>,
    pub pids: PidTracker,
    pub(crate) kernel: KernelHandle,
    media_tx: Mutex<Option<mpsc::UnboundedSender<MediaReport>>>,
    cleanup_slots: Arc<Semaphore>,
}

impl IpcManager {
    pub fn new(kernel: KernelHandle) -> Arc<Self> {
        Arc::new(Self {
            registry: IpcpRegistry::new(),
            transactions: TransactionTable::new(),
            templates: DifTemplateManager::new(),
            flows: FlowManager::new(),
            auth: Arc::new(Authenticator::new(kernel.clone())),
            pids: PidTracker::default(),
            kernel,
            media_tx: Mutex::new(None),
            cleanup_slots: Arc::new(Semaphore::new(4)),
        })
    }

    // ---- queries ----------------------------------------------------------

    pub async fn list_ipcps(&self) -> Vec<IpcpSummary> {
        self.registry.list().await
    }

    /// IPCP types this daemon can create.
    pub fn list_ipcp_types(&self) -> Vec<String> {
        IpcpType::ALL.iter().map(|t| t.to_string()).collect()
    }

    pub async fn ipcp_exists(&self, id: u16) -> bool {
        self.registry.find_by_id(id).await.is_some()
    }

    // ---- lifecycle operations --------------------------------------------

    /// Creates an IPCP and spawns its user worker. The promise resolves with
    /// the new id once both the kernel and the worker have reported ready.
    pub async fn create_ipcp(
        &self,
        name: AppName,
        ipcp_type: IpcpType,
    ) -> Result<Promise, IpcmError> {
        let entry = self.registry.create(name.clone(), ipcp_type).await?;
        let handle = entry.handle;
        let (tid, promise) = self
            .transactions
            .begin(TransactionKind::IpcpCreate { handle }, DEFAULT_TIMEOUT);

        let record = entry.record.write().await;
        self.kernel.send(KernelRequest::CreateIpcp {
            tid,
            ipcp_id: handle.id,
            name,
            ipcp_type,
        });
        drop(record);

        info!(ipcp = %handle, %ipcp_type, "creating IPCP");
        Ok(promise)
    }

    /// Destroys an IPCP, cancelling everything still in flight against it.
    pub async fn destroy_ipcp(&self, ipcp_id: u16) -> Result<Promise, IpcmError> {
        let entry = self
            .registry
            .find_by_id(ipcp_id)
            .await
            .ok_or_else(|| IpcmError::NotFound(format!("ipcp-{}", ipcp_id)))?;
        let handle = entry.handle;

        self.transactions.cancel_all_for(handle);
        let (tid, promise) = self
            .transactions
            .begin(TransactionKind::IpcpDestroy { handle }, DEFAULT_TIMEOUT);
        self.kernel.send(KernelRequest::DestroyIpcp { tid, ipcp_id });
        Ok(promise)
    }

    /// Assigns an IPCP to a DIF using the named template.
    ///
    /// The template is resolved and validated before any kernel command is
    /// issued; the synthesised configuration travels with the command, so
    /// later template removal cannot affect the assignment.
    pub async fn assign_to_dif(
        &self,
        ipcp_id: u16,
        template_name: &str,
        dif_name: &str,
    ) -> Result<Promise, IpcmError> {
        let entry = self
            .registry
            .find_by_id(ipcp_id)
            .await
            .ok_or_else(|| IpcmError::NotFound(format!("ipcp-{}", ipcp_id)))?;
        let handle = entry.handle;

        let template = self
            .templates
            .get(template_name)
            .await
            .ok_or_else(|| IpcmError::TemplateInvalid(format!("no template {:?}", template_name)))?;

        let mut record = entry.record.write().await;

        // Normal IPCPs derive their own address from the template's static
        // address list; a template without one cannot configure this IPCP.
        let address = if record.ipcp_type == IpcpType::Normal {
            template.lookup_ipcp_address(&record.name).ok_or_else(|| {
                IpcmError::TemplateInvalid(format!(
                    "template {:?} has no static address for {}",
                    template_name, record.name
                ))
            })?
        } else {
            0
        };

        let dif_info = DifInfo {
            dif_name: dif_name.to_string(),
            dif_type: record.ipcp_type.to_string(),
            config: DifConfig {
                address,
                data_transfer_constants: template.data_transfer_constants.clone(),
                qos_cubes: template.qos_cubes.clone(),
                efcp_policy_set: template.efcp_policy_set.clone(),
                rmt_policy_set: template.rmt_policy_set.clone(),
                pft_policy_set: template.pft_policy_set.clone(),
                fa_policy_set: template.fa_policy_set.clone(),
                routing_policy_set: template.routing_policy_set.clone(),
                pff_generator_policy_set: template.pff_generator_policy_set.clone(),
                nsm_policy_set: template.nsm_policy_set.clone(),
                address_prefixes: template.address_prefixes.clone(),
                known_ipcp_addresses: template.known_ipcp_addresses.clone(),
                enrollment_task: template.enrollment_task.clone(),
                security_manager: template.security_manager.clone(),
                parameters: template.config_parameters.clone(),
            },
        };

        record.begin_assign(dif_name)?;
        let (tid, promise) = self
            .transactions
            .begin(TransactionKind::Assign { handle }, DEFAULT_TIMEOUT);
        self.kernel.send(KernelRequest::AssignToDif {
            tid,
            ipcp_id,
            dif_info,
        });
        drop(record);

        info!(ipcp = %handle, dif = dif_name, template = template_name, "assigning IPCP to DIF");
        Ok(promise)
    }

    /// Registers one IPCP in an underlying DIF. Two steps: command the N-1
    /// IPCP first, then notify the registering IPCP on success.
    pub async fn register_at_dif(
        &self,
        ipcp_id: u16,
        dif_name: &str,
    ) -> Result<Promise, IpcmError> {
        let entry = self
            .registry
            .find_by_id(ipcp_id)
            .await
            .ok_or_else(|| IpcmError::NotFound(format!("ipcp-{}", ipcp_id)))?;
        let slave = self
            .registry
            .find_by_dif(dif_name)
            .await
            .ok_or_else(|| IpcmError::NoSuchDif(dif_name.to_string()))?;

        let app = entry.record.read().await.name.clone();
        let (tid, promise) = self.transactions.begin(
            TransactionKind::RegisterIpcp {
                slave: slave.handle,
                ipcp: entry.handle,
                dif_name: dif_name.to_string(),
            },
            DEFAULT_TIMEOUT,
        );

        let record = slave.record.write().await;
        self.kernel.send(KernelRequest::RegisterApp {
            tid,
            ipcp_id: slave.handle.id,
            app,
            reg_ipcp_id: entry.handle.id,
        });
        drop(record);
        Ok(promise)
    }

    /// Unregisters one IPCP from an underlying DIF, mirroring
    /// [`register_at_dif`].
    pub async fn unregister_from_dif(
        &self,
        ipcp_id: u16,
        dif_name: &str,
    ) -> Result<Promise, IpcmError> {
        let entry = self
            .registry
            .find_by_id(ipcp_id)
            .await
            .ok_or_else(|| IpcmError::NotFound(format!("ipcp-{}", ipcp_id)))?;
        let slave = self
            .registry
            .find_by_dif(dif_name)
            .await
            .ok_or_else(|| IpcmError::NoSuchDif(dif_name.to_string()))?;

        let app = entry.record.read().await.name.clone();
        if !slave.record.read().await.is_registered(&app) {
            return Err(IpcmError::NotRegistered(app.to_string()));
        }

        let (tid, promise) = self.transactions.begin(
            TransactionKind::UnregisterIpcp {
                slave: slave.handle,
                ipcp: entry.handle,
                dif_name: dif_name.to_string(),
            },
            DEFAULT_TIMEOUT,
        );

        let record = slave.record.write().await;
        self.kernel.send(KernelRequest::UnregisterApp {
            tid,
            ipcp_id: slave.handle.id,
            app,
        });
        drop(record);
        Ok(promise)
    }

    /// Enrolls an IPCP with a neighbor in `dif_name`, reachable through
    /// `supporting_dif`. Passing `disc_neighbor` asks the peer to
    /// pre-provision state for an imminent handover.
    pub async fn enroll(
        &self,
        ipcp_id: u16,
        dif_name: &str,
        supporting_dif: &str,
        neighbor: AppName,
        disc_neighbor: Option<AppName>,
    ) -> Result<Promise, IpcmError> {
        let entry = self
            .registry
            .find_by_id(ipcp_id)
            .await
            .ok_or_else(|| IpcmError::NotFound(format!("ipcp-{}", ipcp_id)))?;
        let handle = entry.handle;

        let record = entry.record.write().await;
        if record.state != IpcpState::Assigned {
            return Err(IpcmError::wrong_state("enroll", record.state));
        }

        let (tid, promise) = self
            .transactions
            .begin(TransactionKind::Enroll { handle }, DEFAULT_TIMEOUT);
        self.kernel.send(KernelRequest::Enroll {
            tid,
            ipcp_id,
            dif_name: dif_name.to_string(),
            supporting_dif_name: supporting_dif.to_string(),
            neighbor: neighbor.clone(),
            prepare_handover: disc_neighbor.is_some(),
            disc_neighbor,
        });
        drop(record);

        info!(ipcp = %handle, dif = dif_name, supporting = supporting_dif,
              neighbor = %neighbor, "enrolling IPCP");
        Ok(promise)
    }

    /// Tells an IPCP to drop the application connection and all N-1 flows to
    /// a neighbor.
    pub async fn disconnect_neighbor(
        &self,
        ipcp_id: u16,
        neighbor: AppName,
    ) -> Result<Promise, IpcmError> {
        let entry = self
            .registry
            .find_by_id(ipcp_id)
            .await
            .ok_or_else(|| IpcmError::NotFound(format!("ipcp-{}", ipcp_id)))?;
        let handle = entry.handle;

        let record = entry.record.write().await;
        if !record.has_neighbor(&neighbor) {
            return Err(IpcmError::NoSuchNeighbor(neighbor.to_string()));
        }

        let (tid, promise) = self.transactions.begin(
            TransactionKind::Disconnect {
                handle,
                neighbor: neighbor.clone(),
            },
            DEFAULT_TIMEOUT,
        );
        self.kernel.send(KernelRequest::DisconnectNeighbor {
            tid,
            ipcp_id,
            neighbor,
        });
        drop(record);
        Ok(promise)
    }

    /// Retrieves a textual dump of (a subset of) the IPCP's RIB.
    pub async fn query_rib(
        &self,
        ipcp_id: u16,
        object_class: &str,
        object_name: &str,
    ) -> Result<Promise, IpcmError> {
        let entry = self
            .registry
            .find_by_id(ipcp_id)
            .await
            .ok_or_else(|| IpcmError::NotFound(format!("ipcp-{}", ipcp_id)))?;

        let (tid, promise) = self.transactions.begin(
            TransactionKind::QueryRib {
                handle: entry.handle,
            },
            DEFAULT_TIMEOUT,
        );
        self.kernel.send(KernelRequest::QueryRib {
            tid,
            ipcp_id,
            object_class: object_class.to_string(),
            object_name: object_name.to_string(),
        });
        Ok(promise)
    }

    /// Pushes a new configuration to an assigned IPCP. DIF membership does
    /// not change.
    pub async fn update_dif_config(
        &self,
        ipcp_id: u16,
        config: DifConfig,
    ) -> Result<Promise, IpcmError> {
        let entry = self
            .registry
            .find_by_id(ipcp_id)
            .await
            .ok_or_else(|| IpcmError::NotFound(format!("ipcp-{}", ipcp_id)))?;
        let handle = entry.handle;

        let record = entry.record.write().await;
        if record.state != IpcpState::Assigned {
            return Err(IpcmError::wrong_state("update-dif-config", record.state));
        }
        let (tid, promise) = self
            .transactions
            .begin(TransactionKind::UpdateConfig { handle }, DEFAULT_TIMEOUT);
        self.kernel.send(KernelRequest::UpdateDifConfig {
            tid,
            ipcp_id,
            config,
        });
        drop(record);
        Ok(promise)
    }

    /// Selects a policy set for a subcomponent of the IPCP.
    pub async fn select_policy_set(
        &self,
        ipcp_id: u16,
        path: &str,
        name: &str,
    ) -> Result<Promise, IpcmError> {
        if path.is_empty() {
            return Err(IpcmError::UnknownPath(path.to_string()));
        }
        let entry = self
            .registry
            .find_by_id(ipcp_id)
            .await
            .ok_or_else(|| IpcmError::NotFound(format!("ipcp-{}", ipcp_id)))?;

        let (tid, promise) = self.transactions.begin(
            TransactionKind::SelectPolicySet {
                handle: entry.handle,
            },
            DEFAULT_TIMEOUT,
        );
        self.kernel.send(KernelRequest::SelectPolicySet {
            tid,
            ipcp_id,
            path: path.to_string(),
            name: name.to_string(),
        });
        Ok(promise)
    }

    /// Sets one parameter of a policy set.
    pub async fn set_policy_set_param(
        &self,
        ipcp_id: u16,
        path: &str,
        name: &str,
        value: &str,
    ) -> Result<Promise, IpcmError> {
        if path.is_empty() {
            return Err(IpcmError::UnknownPath(path.to_string()));
        }
        let entry = self
            .registry
            .find_by_id(ipcp_id)
            .await
            .ok_or_else(|| IpcmError::NotFound(format!("ipcp-{}", ipcp_id)))?;

        let (tid, promise) = self.transactions.begin(
            TransactionKind::SetPolicySetParam {
                handle: entry.handle,
            },
            DEFAULT_TIMEOUT,
        );
        self.kernel.send(KernelRequest::SetPolicySetParam {
            tid,
            ipcp_id,
            path: path.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        });
        Ok(promise)
    }

    /// Loads or unloads a policy plugin in an IPCP.
    pub async fn plugin_load(
        &self,
        ipcp_id: u16,
        plugin: &str,
        load: bool,
    ) -> Result<Promise, IpcmError> {
        let entry = self
            .registry
            .find_by_id(ipcp_id)
            .await
            .ok_or_else(|| IpcmError::NotFound(format!("ipcp-{}", ipcp_id)))?;

        let (tid, promise) = self.transactions.begin(
            TransactionKind::PluginLoad {
                handle: entry.handle,
            },
            DEFAULT_TIMEOUT,
        );
        self.kernel.send(KernelRequest::PluginLoad {
            tid,
            ipcp_id,
            plugin: plugin.to_string(),
            load,
        });
        Ok(promise)
    }

    // ---- dispatcher -------------------------------------------------------

    /// Drains the unified event stream until the stop token fires, then
    /// cancels every outstanding transaction.
    pub async fn run(self: Arc<Self>, mut events: EventReceiver, cancel: CancellationToken) {
        info!("dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ev = events.recv() => match ev {
                    Some(ev) => self.dispatch(ev).await,
                    None => break,
                },
            }
        }
        self.transactions.cancel_all();
        info!("dispatcher stopped");
    }

    /// Routes one event to its handler.
    pub async fn dispatch(self: &Arc<Self>, event: Event) {
        match event {
            Event::CreateIpcpResponse { tid, result } => {
                self.handle_create_response(tid, result).await
            }
            Event::IpcpDaemonInitialized { ipcp_id, pid } => {
                self.handle_daemon_initialized(ipcp_id, pid).await
            }
            Event::DestroyIpcpResponse { tid, result } => {
                self.handle_destroy_response(tid, result).await
            }
            Event::AssignToDifResponse { tid, result } => {
                self.handle_assign_response(tid, result).await
            }
            Event::UpdateDifConfigResponse { tid, result } => {
                self.complete_simple(tid, result);
            }
            Event::RegisterAppResponse { tid, result } => {
                self.handle_register_response(tid, result).await
            }
            Event::UnregisterAppResponse { tid, result } => {
                self.handle_unregister_response(tid, result).await
            }
            Event::EnrollResponse {
                tid,
                result,
                neighbors,
            } => self.handle_enroll_response(tid, result, neighbors).await,
            Event::DisconnectNeighborResponse { tid, result } => {
                self.handle_disconnect_response(tid, result).await
            }
            Event::QueryRibResponse { tid, result, rib } => {
                let Some(trans) = self.take_or_warn(tid) else { return };
                if result == 0 {
                    trans.finish(Ok(TxOutcome::Rib(rib)));
                } else {
                    trans.finish(Err(IpcmError::PeerFailure(result)));
                }
            }
            Event::SelectPolicySetResponse { tid, result }
            | Event::SetPolicySetParamResponse { tid, result } => {
                let Some(trans) = self.take_or_warn(tid) else { return };
                if result == 0 {
                    trans.finish(Ok(TxOutcome::Done));
                } else {
                    // The worker rejects these when the component path does
                    // not resolve.
                    trans.finish(Err(IpcmError::UnknownPath(format!("peer code {}", result))));
                }
            }
            Event::PluginLoadResponse { tid, result } => {
                let Some(trans) = self.take_or_warn(tid) else { return };
                if result == 0 {
                    trans.finish(Ok(TxOutcome::Done));
                } else {
                    trans.finish(Err(IpcmError::PluginNotFound(format!(
                        "peer code {}",
                        result
                    ))));
                }
            }
            Event::AllocateFlowResult {
                tid,
                result,
                port_id,
            } => self.handle_allocate_flow_result(tid, result, port_id).await,
            Event::DeallocateFlowResponse { tid, result } => {
                self.handle_deallocate_flow_response(tid, result).await
            }
            Event::FlowDeallocated {
                ipcp_id,
                port_id,
                code,
            } => self.handle_flow_deallocated(ipcp_id, port_id, code).await,
            Event::RemoteFlowRequest { ipcp_id, req } => {
                self.handle_remote_flow_request(ipcp_id, req).await
            }
            Event::ForwardedCdapResponse {
                ipcp_id,
                port_id,
                frame,
            } => self.handle_forwarded_cdap(ipcp_id, port_id, &frame),
            Event::MediaReport(report) => self.forward_media_report(report),
            Event::AppRegister {
                app,
                dif_name,
                pid,
                reply,
            } => self.handle_app_register(app, dif_name, pid, reply).await,
            Event::AppUnregister {
                app,
                dif_name,
                pid,
                seq,
                reply,
            } => {
                self.handle_app_unregister(app, &dif_name, pid, seq, reply)
                    .await
            }
            Event::AppAllocateFlow { req, reply } => {
                self.handle_app_allocate_flow(req, reply).await
            }
            Event::AppFlowResponse {
                seq,
                accept,
                pid,
                notify_source,
            } => {
                self.handle_app_flow_response(seq, accept, pid, notify_source)
                    .await
            }
            Event::AppDeallocateFlow {
                port_id,
                pid,
                seq,
                reply,
            } => {
                self.handle_app_deallocate_flow(port_id, pid, seq, reply)
                    .await
            }
            Event::ProcessFinalized { pid } => {
                // Cleanup scans walk every record; run them off the
                // dispatcher, bounded by the worker-pool semaphore.
                let mgr = Arc::clone(self);
                let slots = Arc::clone(&self.cleanup_slots);
                tokio::spawn(async move {
                    let _permit = slots.acquire().await;
                    mgr.os_process_finalized(pid).await;
                });
            }
        }
    }

    // ---- response handlers ------------------------------------------------

    async fn handle_create_response(&self, tid: Tid, result: i32) {
        if result != 0 {
            let Some(trans) = self.take_or_warn(tid) else { return };
            if let TransactionKind::IpcpCreate { handle } = trans.kind {
                let _ = self.registry.destroy(handle).await;
                error!(ipcp = %handle, code = result, "kernel failed to create IPCP");
            }
            trans.finish(Err(IpcmError::WorkerSpawnFailed(format!(
                "kernel error code {}",
                result
            ))));
            return;
        }

        let Some(handle) = self.ipcp_of(tid) else {
            warn!(tid, "dropping create-IPCP response for unknown transaction");
            return;
        };
        let Some(entry) = self.registry.get(handle).await else {
            let _ = self.transactions.abort(tid, IpcmError::NotFound(handle.to_string()));
            return;
        };

        let mut record = entry.record.write().await;
        if record.set_kernel_ready() {
            drop(record);
            self.finish_initialized(tid, handle);
        }
    }

    async fn handle_daemon_initialized(&self, ipcp_id: u16, pid: u32) {
        let Some(entry) = self.registry.find_by_id(ipcp_id).await else {
            warn!(ipcp_id, "daemon-initialised for unknown IPCP, dropping");
            return;
        };

        let mut record = entry.record.write().await;
        let became_ready = record.set_userspace_ready(pid);
        drop(record);
        self.pids.watch(pid);

        if became_ready {
            if let Some(tid) = self.transactions.pending_create_for(ipcp_id) {
                self.finish_initialized(tid, entry.handle);
            }
        }
    }

    /// Completes a create transaction for a freshly initialised IPCP.
    fn finish_initialized(&self, tid: Tid, handle: IpcpHandle) {
        if self
            .transactions
            .complete(tid, Ok(TxOutcome::IpcpId(handle)))
            .is_ok()
        {
            info!(ipcp = %handle, "IPCP initialised");
        }
    }

    async fn handle_destroy_response(&self, tid: Tid, result: i32) {
        let Some(trans) = self.take_or_warn(tid) else { return };
        let handle = match &trans.kind {
            TransactionKind::IpcpDestroy { handle } => Some(*handle),
            TransactionKind::Syscall { handle } => *handle,
            _ => None,
        };

        if let Some(handle) = handle {
            // The record goes regardless of the kernel's verdict; the kernel
            // side is gone or never existed.
            if let Some(entry) = self.registry.get(handle).await {
                let record = entry.record.read().await;
                if let Some(pid) = record.pid {
                    self.pids.unwatch(pid);
                }
            }
            let _ = self.registry.destroy(handle).await;
        }

        if result == 0 {
            trans.finish(Ok(TxOutcome::Done));
        } else {
            trans.finish(Err(IpcmError::PeerFailure(result)));
        }
    }

    async fn handle_assign_response(&self, tid: Tid, result: i32) {
        let Some(trans) = self.take_or_warn(tid) else { return };
        let TransactionKind::Assign { handle } = trans.kind else {
            warn!(tid, "assign response for transaction of wrong kind");
            return;
        };

        let Some(entry) = self.registry.get(handle).await else {
            trans.finish(Err(IpcmError::NotFound(handle.to_string())));
            return;
        };

        let mut record = entry.record.write().await;
        if let Err(e) = record.finish_assign(result == 0) {
            warn!(ipcp = %handle, error = %e, "assign result against unexpected state");
        }
        let dif = record.dif_name.clone();
        drop(record);

        if result == 0 {
            info!(ipcp = %handle, dif = dif.as_deref().unwrap_or(""), "IPCP assigned to DIF");
            trans.finish(Ok(TxOutcome::Done));
        } else {
            trans.finish(Err(IpcmError::PeerFailure(result)));
        }
    }

    async fn handle_register_response(&self, tid: Tid, result: i32) {
        let Some(trans) = self.take_or_warn(tid) else { return };
        match trans.kind {
            TransactionKind::RegisterIpcp {
                slave,
                ipcp,
                ref dif_name,
            } => {
                if result != 0 {
                    trans.finish(Err(IpcmError::PeerFailure(result)));
                    return;
                }
                let Some(ipcp_entry) = self.registry.get(ipcp).await else {
                    trans.finish(Err(IpcmError::NotFound(ipcp.to_string())));
                    return;
                };
                let app = ipcp_entry.record.read().await.name.clone();
                if let Some(slave_entry) = self.registry.get(slave).await {
                    slave_entry.record.write().await.add_registered_app(app);
                }
                // Second step: tell the registered IPCP about its new
                // supporting DIF.
                self.kernel.send(KernelRequest::NotifyRegistration {
                    ipcp_id: ipcp.id,
                    dif_name: dif_name.clone(),
                    registered: true,
                });
                trans.finish(Ok(TxOutcome::Done));
            }
            TransactionKind::RegisterApp { .. } => {
                self.finish_app_registration(trans, result).await;
            }
            _ => warn!(tid, "register response for transaction of wrong kind"),
        }
    }

    async fn handle_unregister_response(&self, tid: Tid, result: i32) {
        let Some(trans) = self.take_or_warn(tid) else { return };
        match trans.kind {
            TransactionKind::UnregisterIpcp {
                slave,
                ipcp,
                ref dif_name,
            } => {
                if result != 0 {
                    trans.finish(Err(IpcmError::PeerFailure(result)));
                    return;
                }
                if let Some(ipcp_entry) = self.registry.get(ipcp).await {
                    let app = ipcp_entry.record.read().await.name.clone();
                    if let Some(slave_entry) = self.registry.get(slave).await {
                        slave_entry.record.write().await.remove_registered_app(&app);
                    }
                }
                self.kernel.send(KernelRequest::NotifyRegistration {
                    ipcp_id: ipcp.id,
                    dif_name: dif_name.clone(),
                    registered: false,
                });
                trans.finish(Ok(TxOutcome::Done));
            }
            TransactionKind::UnregisterApp { .. } => {
                self.finish_app_unregistration(trans, result).await;
            }
            _ => warn!(tid, "unregister response for transaction of wrong kind"),
        }
    }

    async fn handle_enroll_response(&self, tid: Tid, result: i32, neighbors: Vec<Neighbor>) {
        let Some(trans) = self.take_or_warn(tid) else { return };
        let TransactionKind::Enroll { handle } = trans.kind else {
            warn!(tid, "enroll response for transaction of wrong kind");
            return;
        };

        if result != 0 {
            let err = if result == ENROLL_AUTH_FAILED {
                IpcmError::AuthenticationFailed(format!("peer code {}", result))
            } else {
                IpcmError::PeerFailure(result)
            };
            warn!(ipcp = %handle, code = result, "enrollment failed");
            trans.finish(Err(err));
            return;
        }

        if let Some(entry) = self.registry.get(handle).await {
            entry.record.write().await.add_neighbors(&neighbors);
        }
        info!(ipcp = %handle, count = neighbors.len(), "enrollment complete");
        trans.finish(Ok(TxOutcome::Neighbors(neighbors)));
    }

    async fn handle_disconnect_response(&self, tid: Tid, result: i32) {
        let Some(trans) = self.take_or_warn(tid) else { return };
        let TransactionKind::Disconnect { handle, ref neighbor } = trans.kind else {
            warn!(tid, "disconnect response for transaction of wrong kind");
            return;
        };

        if result == 0 {
            if let Some(entry) = self.registry.get(handle).await {
                entry.record.write().await.remove_neighbor(neighbor);
            }
            trans.finish(Ok(TxOutcome::Done));
        } else {
            trans.finish(Err(IpcmError::PeerFailure(result)));
        }
    }

    fn handle_forwarded_cdap(&self, ipcp_id: u16, port_id: i32, frame: &[u8]) {
        let key = SessionKey { ipcp_id, port_id };
        match CdapMessage::from_frame(frame) {
            Ok(msg) => {
                let status = self.auth.process_incoming(key, &msg);
                debug!(ipcp_id, port_id, ?status, "processed authentication message");
            }
            Err(e) => warn!(ipcp_id, port_id, error = %e, "undecodable CDAP frame, dropping"),
        }
    }

    fn forward_media_report(&self, report: MediaReport) {
        let guard = self.media_tx.lock().expect("media sink lock poisoned");
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(report);
        } else {
            debug!("media report with no mobility manager attached, dropping");
        }
    }

    /// Hands out the media-report stream consumed by the mobility manager.
    pub fn subscribe_media(&self) -> mpsc::UnboundedReceiver<MediaReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.media_tx.lock().expect("media sink lock poisoned") = Some(tx);
        rx
    }

    // ---- process-exit cleanup --------------------------------------------

    /// Reacts to the death of an OS process: synthesises unregistrations and
    /// deallocations for everything the process owned, then destroys its
    /// IPCP if the process was a user worker. Per-record errors are swallowed
    /// so one bad record cannot stall the sweep.
    pub async fn os_process_finalized(&self, pid: u32) {
        debug!(pid, "running cleanup for finalised OS process");
        self.pids.unwatch(pid);

        self.cleanup_registrations_for_pid(pid).await;
        self.cleanup_flows_for_pid(pid).await;

        if let Some(handle) = self.registry.exists_by_pid(pid).await {
            error!(ipcp = %handle, pid, "IPCP user worker exited unexpectedly");
            self.transactions.cancel_all_for(handle);
            let (tid, _promise) = self.transactions.begin(
                TransactionKind::Syscall {
                    handle: Some(handle),
                },
                DEFAULT_TIMEOUT,
            );
            self.kernel.send(KernelRequest::DestroyIpcp {
                tid,
                ipcp_id: handle.id,
            });
        }
    }

    // ---- helpers ----------------------------------------------------------

    /// Removes the transaction for a response, logging stale correlation ids.
    pub(crate) fn take_or_warn(&self, tid: Tid) -> Option<Transaction> {
        let trans = self.transactions.take(tid);
        if trans.is_none() {
            warn!(tid, "response for unknown or finalised transaction, dropping");
        }
        trans
    }

    fn complete_simple(&self, tid: Tid, result: i32) {
        let Some(trans) = self.take_or_warn(tid) else { return };
        if result == 0 {
            trans.finish(Ok(TxOutcome::Done));
        } else {
            trans.finish(Err(IpcmError::PeerFailure(result)));
        }
    }

    fn ipcp_of(&self, tid: Tid) -> Option<IpcpHandle> {
        self.transactions.ipcp_of(tid)
    }
}
