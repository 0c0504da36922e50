// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! Application registration and flow allocation
//!
//! Maps application names to DIFs, drives registration and unregistration
//! through the serving IPCP, and coordinates the three-party flow-allocation
//! dance between the requesting application, the local IPCP and the remote
//! peer. Applications always receive a terminal notification, positive or
//! negative; cleanup runs with sequence number zero, which keeps the daemon
//! silent towards the (dead) originator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::auth::SessionKey;
use crate::error::IpcmError;
use crate::events::{AppChannel, AppNotice, FlowRequest};
use crate::kernel::KernelRequest;
use crate::manager::IpcManager;
use crate::registry::{AppName, FlowInfo, IpcpEntry, IpcpState, IpcpType};
use crate::transactions::{Tid, Transaction, TransactionKind, TxOutcome, DEFAULT_TIMEOUT};

/// One application registered through this daemon.
#[derive(Debug, Clone)]
pub struct AppRegistration {
    pub app: AppName,
    /// DIF the application is bound to
    pub dif_name: String,
    /// Process id, for liveness tracking
    pub pid: u32,
    /// Channel used to notify the application
    pub channel: AppChannel,
}

/// Application-to-DIF bookkeeping plus the process-wide port-id space.
#[derive(Debug, Default)]
pub struct FlowManager {
    /// Live registrations, keyed by encoded application name
    registrations: Mutex<HashMap<String, AppRegistration>>,
    /// Preferred DIF per application, loaded from the map file at startup
    static_mappings: Mutex<HashMap<String, String>>,
    next_port: AtomicI32,
}

impl FlowManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the application-to-DIF mappings read from the map file.
    pub fn load_mappings(&self, mappings: HashMap<String, String>) {
        let mut map = self.static_mappings.lock().expect("mapping lock poisoned");
        *map = mappings;
    }

    /// DIF an application should be served by: its live registration first,
    /// the static map second.
    pub fn mapping_for(&self, app: &AppName) -> Option<String> {
        let key = app.encode();
        if let Some(reg) = self
            .registrations
            .lock()
            .expect("registration lock poisoned")
            .get(&key)
        {
            return Some(reg.dif_name.clone());
        }
        self.static_mappings
            .lock()
            .expect("mapping lock poisoned")
            .get(&key)
            .cloned()
    }

    pub fn record_registration(&self, reg: AppRegistration) {
        self.registrations
            .lock()
            .expect("registration lock poisoned")
            .insert(reg.app.encode(), reg);
    }

    pub fn remove_registration(&self, app: &AppName) -> Option<AppRegistration> {
        self.registrations
            .lock()
            .expect("registration lock poisoned")
            .remove(&app.encode())
    }

    pub fn registration(&self, app: &AppName) -> Option<AppRegistration> {
        self.registrations
            .lock()
            .expect("registration lock poisoned")
            .get(&app.encode())
            .cloned()
    }

    /// Registrations held by a given OS process.
    pub fn registrations_for_pid(&self, pid: u32) -> Vec<AppRegistration> {
        self.registrations
            .lock()
            .expect("registration lock poisoned")
            .values()
            .filter(|r| r.pid == pid)
            .cloned()
            .collect()
    }

    pub fn registration_count(&self) -> usize {
        self.registrations
            .lock()
            .expect("registration lock poisoned")
            .len()
    }

    /// Draws a fresh system-wide port id.
    pub fn allocate_port(&self) -> i32 {
        self.next_port.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn notify(channel: &AppChannel, notice: AppNotice) {
    // The application may already be gone; nothing to do then.
    let _ = channel.send(notice);
}

impl IpcManager {
    /// Picks an IPCP to serve a registration or flow request: the pinned DIF
    /// when one is given, otherwise any assigned IPCP, preferring `normal`.
    async fn select_serving_ipcp(&self, dif_name: Option<&str>) -> Option<Arc<IpcpEntry>> {
        if let Some(dif) = dif_name {
            return self.registry.find_by_dif(dif).await;
        }
        let mut fallback = None;
        for entry in self.registry.snapshot().await {
            let record = entry.record.read().await;
            if record.state != IpcpState::Assigned {
                continue;
            }
            if record.ipcp_type == IpcpType::Normal {
                drop(record);
                return Some(entry);
            }
            if fallback.is_none() {
                drop(record);
                fallback = Some(entry);
            }
        }
        fallback
    }

    // ---- application registration ----------------------------------------

    pub(crate) async fn handle_app_register(
        &self,
        app: AppName,
        dif_name: Option<String>,
        pid: u32,
        reply: AppChannel,
    ) {
        let pinned = dif_name.or_else(|| self.flows.mapping_for(&app));
        let Some(slave) = self.select_serving_ipcp(pinned.as_deref()).await else {
            warn!(%app, dif = pinned.as_deref().unwrap_or("<any>"),
                  "no IPCP available to register application");
            notify(
                &reply,
                AppNotice::RegistrationResult {
                    app,
                    dif_name: pinned.unwrap_or_default(),
                    ok: false,
                },
            );
            return;
        };

        let record = slave.record.write().await;
        let actual_dif = record.dif_name.clone().unwrap_or_default();
        let (tid, _promise) = self.transactions.begin(
            TransactionKind::RegisterApp {
                slave: slave.handle,
                app: app.clone(),
                dif_name: actual_dif,
                pid,
                reply: Some(reply),
            },
            DEFAULT_TIMEOUT,
        );
        self.kernel.send(KernelRequest::RegisterApp {
            tid,
            ipcp_id: slave.handle.id,
            app,
            reg_ipcp_id: 0,
        });
        drop(record);
    }

    pub(crate) async fn finish_app_registration(&self, trans: Transaction, result: i32) {
        let TransactionKind::RegisterApp {
            slave,
            ref app,
            ref dif_name,
            pid,
            ref reply,
        } = trans.kind
        else {
            return;
        };
        let app = app.clone();
        let dif_name = dif_name.clone();
        let reply = reply.clone();

        if result != 0 {
            warn!(%app, dif = %dif_name, code = result, "application registration rejected");
            if let Some(reply) = &reply {
                notify(
                    reply,
                    AppNotice::RegistrationResult {
                        app,
                        dif_name,
                        ok: false,
                    },
                );
            }
            trans.finish(Err(IpcmError::PeerFailure(result)));
            return;
        }

        if let Some(entry) = self.registry.get(slave).await {
            entry.record.write().await.add_registered_app(app.clone());
        }
        if let Some(reply) = &reply {
            self.flows.record_registration(AppRegistration {
                app: app.clone(),
                dif_name: dif_name.clone(),
                pid,
                channel: reply.clone(),
            });
            self.pids.watch(pid);
            notify(
                reply,
                AppNotice::RegistrationResult {
                    app: app.clone(),
                    dif_name,
                    ok: true,
                },
            );
        }
        info!(%app, "application registered");
        trans.finish(Ok(TxOutcome::Done));
    }

    pub(crate) async fn handle_app_unregister(
        &self,
        app: AppName,
        dif_name: &str,
        _pid: u32,
        seq: u32,
        reply: Option<AppChannel>,
    ) {
        let notify_app = seq != 0;
        let Some(slave) = self.registry.find_by_dif(dif_name).await else {
            warn!(%app, dif = dif_name, "unregistration against unknown DIF");
            if notify_app {
                if let Some(reply) = &reply {
                    notify(reply, AppNotice::UnregistrationResult { app, ok: false });
                }
            }
            return;
        };

        if !slave.record.read().await.is_registered(&app) {
            warn!(%app, dif = dif_name, "application is not registered");
            if notify_app {
                if let Some(reply) = &reply {
                    notify(reply, AppNotice::UnregistrationResult { app, ok: false });
                }
            }
            return;
        }

        let record = slave.record.write().await;
        let (tid, _promise) = self.transactions.begin(
            TransactionKind::UnregisterApp {
                slave: slave.handle,
                app: app.clone(),
                notify: notify_app,
                reply,
            },
            DEFAULT_TIMEOUT,
        );
        self.kernel.send(KernelRequest::UnregisterApp {
            tid,
            ipcp_id: slave.handle.id,
            app,
        });
        drop(record);
    }

    pub(crate) async fn finish_app_unregistration(&self, trans: Transaction, result: i32) {
        let TransactionKind::UnregisterApp {
            slave,
            ref app,
            notify: notify_app,
            ref reply,
        } = trans.kind
        else {
            return;
        };
        let app = app.clone();
        let reply = reply.clone();

        if result == 0 {
            if let Some(entry) = self.registry.get(slave).await {
                entry.record.write().await.remove_registered_app(&app);
            }
            self.flows.remove_registration(&app);
            if notify_app {
                if let Some(reply) = &reply {
                    notify(reply, AppNotice::UnregistrationResult { app: app.clone(), ok: true });
                }
            }
            info!(%app, "application unregistered");
            trans.finish(Ok(TxOutcome::Done));
        } else {
            if notify_app {
                if let Some(reply) = &reply {
                    notify(reply, AppNotice::UnregistrationResult { app, ok: false });
                }
            }
            trans.finish(Err(IpcmError::PeerFailure(result)));
        }
    }

    // ---- flow allocation ---------------------------------------------------

    pub(crate) async fn handle_app_allocate_flow(&self, mut req: FlowRequest, reply: AppChannel) {
        let pinned = req
            .dif_name
            .clone()
            .or_else(|| self.flows.mapping_for(&req.local_app));
        let Some(ipcp) = self.select_serving_ipcp(pinned.as_deref()).await else {
            warn!(local = %req.local_app, remote = %req.remote_app,
                  "no IPCP available to serve flow allocation");
            notify(
                &reply,
                AppNotice::FlowAllocated {
                    port_id: -1,
                    dif_name: None,
                },
            );
            return;
        };

        let record = ipcp.record.write().await;
        req.port_id = self.flows.allocate_port();
        req.dif_name = record.dif_name.clone();
        let (tid, _promise) = self.transactions.begin(
            TransactionKind::Allocate {
                handle: ipcp.handle,
                req: req.clone(),
                reply: Some(reply),
            },
            DEFAULT_TIMEOUT,
        );
        self.kernel.send(KernelRequest::AllocateFlow {
            tid,
            ipcp_id: ipcp.handle.id,
            req,
        });
        drop(record);
    }

    pub(crate) async fn handle_allocate_flow_result(&self, tid: Tid, result: i32, port_id: i32) {
        let Some(trans) = self.take_or_warn(tid) else { return };
        let TransactionKind::Allocate {
            handle,
            ref req,
            ref reply,
        } = trans.kind
        else {
            warn!(tid, "allocate-flow result for transaction of wrong kind");
            return;
        };
        let req = req.clone();
        let reply = reply.clone();

        if result != 0 {
            warn!(local = %req.local_app, remote = %req.remote_app, code = result,
                  "flow allocation failed");
            if let Some(reply) = &reply {
                notify(
                    reply,
                    AppNotice::FlowAllocated {
                        port_id: -1,
                        dif_name: None,
                    },
                );
            }
            trans.finish(Err(IpcmError::PeerFailure(result)));
            return;
        }

        let port = if port_id > 0 { port_id } else { req.port_id };
        if let Some(entry) = self.registry.get(handle).await {
            let mut record = entry.record.write().await;
            record.flows.push(FlowInfo {
                port_id: port,
                fd: None,
                ipcp_id: handle.id,
                local_app: req.local_app.clone(),
                remote_app: req.remote_app.clone(),
                dif_name: req.dif_name.clone().unwrap_or_default(),
                spec: req.spec.clone(),
                pid: req.pid,
            });
        }
        self.pids.watch(req.pid);
        if let Some(reply) = &reply {
            notify(
                reply,
                AppNotice::FlowAllocated {
                    port_id: port,
                    dif_name: req.dif_name.clone(),
                },
            );
        }
        info!(local = %req.local_app, remote = %req.remote_app, port, "flow allocated");
        trans.finish(Ok(TxOutcome::Port(port)));
    }

    /// A remote peer wants a flow towards a locally registered application:
    /// ask the application and relay the verdict.
    pub(crate) async fn handle_remote_flow_request(&self, ipcp_id: u16, req: FlowRequest) {
        let Some(entry) = self.registry.find_by_id(ipcp_id).await else {
            warn!(ipcp_id, "remote flow request from unknown IPCP, dropping");
            return;
        };

        let Some(reg) = self.flows.registration(&req.local_app) else {
            warn!(local = %req.local_app, "remote flow request for unregistered application");
            self.kernel.send(KernelRequest::AllocateFlowResponse {
                ipcp_id,
                port_id: req.port_id,
                result: -1,
                notify_source: true,
                acceptor_ipcp_id: 0,
            });
            return;
        };

        let (tid, _promise) = self.transactions.begin(
            TransactionKind::RemoteAllocate {
                handle: entry.handle,
                req: req.clone(),
            },
            DEFAULT_TIMEOUT,
        );
        notify(
            &reg.channel,
            AppNotice::FlowRequestArrived {
                seq: tid,
                local_app: req.local_app,
                remote_app: req.remote_app,
                spec: req.spec,
                dif_name: req.dif_name.unwrap_or_default(),
            },
        );
    }

    /// The local application's verdict on a remote flow request.
    pub(crate) async fn handle_app_flow_response(
        &self,
        seq: Tid,
        accept: bool,
        pid: u32,
        notify_source: bool,
    ) {
        let Some(trans) = self.take_or_warn(seq) else { return };
        let TransactionKind::RemoteAllocate { handle, ref req } = trans.kind else {
            warn!(seq, "flow response for transaction of wrong kind");
            return;
        };
        let req = req.clone();

        self.kernel.send(KernelRequest::AllocateFlowResponse {
            ipcp_id: handle.id,
            port_id: req.port_id,
            result: if accept { 0 } else { -1 },
            notify_source,
            acceptor_ipcp_id: 0,
        });

        if !accept {
            debug!(local = %req.local_app, remote = %req.remote_app, "flow rejected by application");
            trans.finish(Err(IpcmError::PeerFailure(-1)));
            return;
        }

        if let Some(entry) = self.registry.get(handle).await {
            let mut record = entry.record.write().await;
            record.flows.push(FlowInfo {
                port_id: req.port_id,
                fd: None,
                ipcp_id: handle.id,
                local_app: req.local_app.clone(),
                remote_app: req.remote_app.clone(),
                dif_name: req.dif_name.clone().unwrap_or_default(),
                spec: req.spec.clone(),
                pid,
            });
        }
        self.pids.watch(pid);
        trans.finish(Ok(TxOutcome::Port(req.port_id)));
    }

    // ---- flow deallocation -------------------------------------------------

    pub(crate) async fn handle_app_deallocate_flow(
        &self,
        port_id: i32,
        _pid: u32,
        seq: u32,
        reply: Option<AppChannel>,
    ) {
        let notify_app = seq != 0;
        let Some(entry) = self.registry.find_by_port(port_id).await else {
            warn!(port_id, "deallocation request for unknown port");
            if notify_app {
                if let Some(reply) = &reply {
                    notify(reply, AppNotice::FlowDeallocated { port_id, code: -1 });
                }
            }
            return;
        };

        let record = entry.record.write().await;
        let (tid, _promise) = self.transactions.begin(
            TransactionKind::Deallocate {
                handle: entry.handle,
                port_id,
                notify: notify_app,
                reply,
            },
            DEFAULT_TIMEOUT,
        );
        self.kernel.send(KernelRequest::DeallocateFlow {
            tid,
            ipcp_id: entry.handle.id,
            port_id,
        });
        drop(record);
    }

    pub(crate) async fn handle_deallocate_flow_response(&self, tid: Tid, result: i32) {
        let Some(trans) = self.take_or_warn(tid) else { return };
        let TransactionKind::Deallocate {
            handle,
            port_id,
            notify: notify_app,
            ref reply,
        } = trans.kind
        else {
            warn!(tid, "deallocate response for transaction of wrong kind");
            return;
        };
        let reply = reply.clone();

        if result != 0 {
            if notify_app {
                if let Some(reply) = &reply {
                    notify(reply, AppNotice::FlowDeallocated { port_id, code: result });
                }
            }
            trans.finish(Err(IpcmError::PeerFailure(result)));
            return;
        }

        if let Some(entry) = self.registry.get(handle).await {
            entry.record.write().await.take_flow(port_id);
        }
        self.auth.flow_deallocated(SessionKey {
            ipcp_id: handle.id,
            port_id,
        });
        if notify_app {
            if let Some(reply) = &reply {
                notify(reply, AppNotice::FlowDeallocated { port_id, code: 0 });
            }
        }
        debug!(port_id, "flow deallocated");
        trans.finish(Ok(TxOutcome::Done));
    }

    /// Unsolicited notification: the remote side deallocated a flow. The
    /// security context keyed by this port never outlives it.
    pub(crate) async fn handle_flow_deallocated(&self, ipcp_id: u16, port_id: i32, code: i32) {
        self.auth.flow_deallocated(SessionKey { ipcp_id, port_id });

        let Some(entry) = self.registry.find_by_id(ipcp_id).await else {
            warn!(ipcp_id, port_id, "flow-deallocated from unknown IPCP");
            return;
        };

        let flow = entry.record.write().await.take_flow(port_id);
        let Some(flow) = flow else {
            warn!(ipcp_id, port_id, "flow-deallocated for unknown port");
            return;
        };

        if let Some(reg) = self.flows.registration(&flow.local_app) {
            notify(&reg.channel, AppNotice::FlowDeallocated { port_id, code });
        }
        info!(port_id, code, "flow deallocated by remote peer");
    }

    // ---- process-exit cleanup ----------------------------------------------

    /// Unregisters everything the dead process had registered, silently.
    pub(crate) async fn cleanup_registrations_for_pid(&self, pid: u32) {
        for reg in self.flows.registrations_for_pid(pid) {
            debug!(app = %reg.app, pid, "cleaning up registration of finalised process");
            self.handle_app_unregister(reg.app.clone(), &reg.dif_name, pid, 0, None)
                .await;
        }
    }

    /// Deallocates every flow the dead process was holding, silently.
    pub(crate) async fn cleanup_flows_for_pid(&self, pid: u32) {
        let mut ports = Vec::new();
        for entry in self.registry.snapshot().await {
            let record = entry.record.read().await;
            for flow in record.flows.iter().filter(|f| f.pid == pid) {
                ports.push(flow.port_id);
            }
        }
        for port_id in ports {
            debug!(port_id, pid, "cleaning up flow of finalised process");
            self.handle_app_deallocate_flow(port_id, pid, 0, None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn app(n: &str) -> AppName {
        AppName::new(n, "1")
    }

    fn channel() -> AppChannel {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn test_port_ids_are_unique_and_monotonic() {
        let fm = FlowManager::new();
        let a = fm.allocate_port();
        let b = fm.allocate_port();
        assert!(a >= 1);
        assert!(b > a);
    }

    #[test]
    fn test_static_mapping_lookup() {
        let fm = FlowManager::new();
        let mut map = HashMap::new();
        map.insert(app("X").encode(), "d".to_string());
        fm.load_mappings(map);

        assert_eq!(fm.mapping_for(&app("X")), Some("d".to_string()));
        assert_eq!(fm.mapping_for(&app("Y")), None);
    }

    #[test]
    fn test_registration_overrides_static_mapping() {
        let fm = FlowManager::new();
        let mut map = HashMap::new();
        map.insert(app("X").encode(), "static-dif".to_string());
        fm.load_mappings(map);

        fm.record_registration(AppRegistration {
            app: app("X"),
            dif_name: "live-dif".to_string(),
            pid: 10,
            channel: channel(),
        });
        assert_eq!(fm.mapping_for(&app("X")), Some("live-dif".to_string()));

        fm.remove_registration(&app("X"));
        assert_eq!(fm.mapping_for(&app("X")), Some("static-dif".to_string()));
    }

    #[test]
    fn test_registrations_for_pid() {
        let fm = FlowManager::new();
        for (name, pid) in [("a", 1u32), ("b", 1), ("c", 2)] {
            fm.record_registration(AppRegistration {
                app: app(name),
                dif_name: "d".to_string(),
                pid,
                channel: channel(),
            });
        }
        assert_eq!(fm.registrations_for_pid(1).len(), 2);
        assert_eq!(fm.registrations_for_pid(2).len(), 1);
        assert_eq!(fm.registrations_for_pid(3).len(), 0);
    }
}
