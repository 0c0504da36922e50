// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! Integration test: application registration, flow allocation and
//! process-exit cleanup through the real dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ipcmd::auth::SessionKey;
use ipcmd::events::{event_channel, AppNotice, Event, EventSender, FlowRequest};
use ipcmd::kernel::{KernelHandle, KernelRequest};
use ipcmd::manager::IpcManager;
use ipcmd::registry::{AppName, FlowSpec, IpcpType};
use ipcmd::templates::{AuthProfile, DifTemplate, KnownIpcpAddress, PolicyConfig};
use ipcmd::transactions::TxOutcome;

fn spawn_ack_kernel(mut rx: mpsc::UnboundedReceiver<KernelRequest>, events: EventSender) {
    tokio::spawn(async move {
        let mut next_pid = 8000u32;
        while let Some(req) = rx.recv().await {
            match req {
                KernelRequest::CreateIpcp { tid, ipcp_id, .. } => {
                    next_pid += 1;
                    let _ = events.send(Event::CreateIpcpResponse { tid, result: 0 });
                    let _ = events.send(Event::IpcpDaemonInitialized {
                        ipcp_id,
                        pid: next_pid,
                    });
                }
                KernelRequest::AssignToDif { tid, .. } => {
                    let _ = events.send(Event::AssignToDifResponse { tid, result: 0 });
                }
                KernelRequest::RegisterApp { tid, .. } => {
                    let _ = events.send(Event::RegisterAppResponse { tid, result: 0 });
                }
                KernelRequest::UnregisterApp { tid, .. } => {
                    let _ = events.send(Event::UnregisterAppResponse { tid, result: 0 });
                }
                KernelRequest::AllocateFlow { tid, req, .. } => {
                    let _ = events.send(Event::AllocateFlowResult {
                        tid,
                        result: 0,
                        port_id: req.port_id,
                    });
                }
                KernelRequest::DeallocateFlow { tid, .. } => {
                    let _ = events.send(Event::DeallocateFlowResponse { tid, result: 0 });
                }
                KernelRequest::DestroyIpcp { tid, .. } => {
                    let _ = events.send(Event::DestroyIpcpResponse { tid, result: 0 });
                }
                _ => {}
            }
        }
    });
}

struct Harness {
    manager: Arc<IpcManager>,
    events: EventSender,
    cancel: CancellationToken,
}

impl Harness {
    async fn start() -> Self {
        let (kernel, kernel_rx) = KernelHandle::channel();
        let (event_tx, event_rx) = event_channel();
        let manager = IpcManager::new(kernel);
        let cancel = CancellationToken::new();

        spawn_ack_kernel(kernel_rx, event_tx.clone());
        tokio::spawn(manager.clone().run(event_rx, cancel.clone()));
        Self {
            manager,
            events: event_tx,
            cancel,
        }
    }

    /// Creates a normal IPCP and assigns it to `dif_name`.
    async fn normal_ipcp_in_dif(&self, name: &str, dif_name: &str) -> u16 {
        let promise = self
            .manager
            .create_ipcp(AppName::new(name, "1"), IpcpType::Normal)
            .await
            .unwrap();
        let TxOutcome::IpcpId(handle) = promise.wait().await.unwrap() else {
            panic!("expected an id");
        };

        let mut template = DifTemplate {
            dif_type: "normal".to_string(),
            ..Default::default()
        };
        template.known_ipcp_addresses.push(KnownIpcpAddress {
            ap_name: name.to_string(),
            ap_instance: String::new(),
            address: 21,
        });
        let template_name = format!("{}.dif", dif_name);
        self.manager.templates.add(&template_name, template).await;

        self.manager
            .assign_to_dif(handle.id, &template_name, dif_name)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        handle.id
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn recv_notice(rx: &mut mpsc::UnboundedReceiver<AppNotice>) -> AppNotice {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for app notification")
        .expect("app channel closed")
}

/// Polls `cond` until it holds, failing the test after two seconds.
async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if cond().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within bounded time");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_local_flow_allocation_without_prior_mapping() {
    let h = Harness::start().await;
    let ipcp_id = h.normal_ipcp_in_dif("k.1", "dif0").await;

    let (app_tx, mut app_rx) = mpsc::unbounded_channel();
    let req = FlowRequest {
        local_app: AppName::new("A", "1"),
        remote_app: AppName::new("B", "1"),
        spec: FlowSpec::default(),
        dif_name: None,
        pid: 900,
        port_id: 0,
    };
    h.events
        .send(Event::AppAllocateFlow { req, reply: app_tx })
        .unwrap();

    let AppNotice::FlowAllocated { port_id, dif_name } = recv_notice(&mut app_rx).await else {
        panic!("expected a flow allocation result");
    };
    assert!(port_id > 0);
    assert_eq!(dif_name.as_deref(), Some("dif0"));

    // Exactly one IPCP owns the port, and the descriptor names both ends.
    let owner = h.manager.registry.find_by_port(port_id).await.unwrap();
    assert_eq!(owner.handle.id, ipcp_id);
    let record = owner.record.read().await;
    let flow = record.flow_by_port(port_id).unwrap();
    assert_eq!(flow.local_app, AppName::new("A", "1"));
    assert_eq!(flow.remote_app, AppName::new("B", "1"));

    h.stop();
}

#[tokio::test]
async fn test_allocation_with_no_ipcp_notifies_failure() {
    let h = Harness::start().await;

    let (app_tx, mut app_rx) = mpsc::unbounded_channel();
    h.events
        .send(Event::AppAllocateFlow {
            req: FlowRequest {
                local_app: AppName::new("A", "1"),
                remote_app: AppName::new("B", "1"),
                spec: FlowSpec::default(),
                dif_name: None,
                pid: 900,
                port_id: 0,
            },
            reply: app_tx,
        })
        .unwrap();

    let AppNotice::FlowAllocated { port_id, .. } = recv_notice(&mut app_rx).await else {
        panic!("expected a flow allocation result");
    };
    assert_eq!(port_id, -1);

    h.stop();
}

#[tokio::test]
async fn test_register_then_unregister_restores_ipcp_state() {
    let h = Harness::start().await;
    let ipcp_id = h.normal_ipcp_in_dif("k.1", "dif0").await;
    let app = AppName::new("X", "1");

    let (app_tx, mut app_rx) = mpsc::unbounded_channel();
    h.events
        .send(Event::AppRegister {
            app: app.clone(),
            dif_name: Some("dif0".to_string()),
            pid: 4242,
            reply: app_tx.clone(),
        })
        .unwrap();
    let AppNotice::RegistrationResult { ok, .. } = recv_notice(&mut app_rx).await else {
        panic!("expected a registration result");
    };
    assert!(ok);

    let entry = h.manager.registry.find_by_id(ipcp_id).await.unwrap();
    assert!(entry.record.read().await.is_registered(&app));
    assert_eq!(h.manager.flows.registration_count(), 1);

    h.events
        .send(Event::AppUnregister {
            app: app.clone(),
            dif_name: "dif0".to_string(),
            pid: 4242,
            seq: 9,
            reply: Some(app_tx),
        })
        .unwrap();
    let AppNotice::UnregistrationResult { ok, .. } = recv_notice(&mut app_rx).await else {
        panic!("expected an unregistration result");
    };
    assert!(ok);

    // The registered-applications set is back to where it started.
    assert!(!entry.record.read().await.is_registered(&app));
    assert_eq!(h.manager.flows.registration_count(), 0);

    h.stop();
}

#[tokio::test]
async fn test_remote_flow_request_round_trip() {
    let h = Harness::start().await;
    let ipcp_id = h.normal_ipcp_in_dif("k.1", "dif0").await;
    let app = AppName::new("X", "1");

    // Register the callee so the daemon can reach it.
    let (app_tx, mut app_rx) = mpsc::unbounded_channel();
    h.events
        .send(Event::AppRegister {
            app: app.clone(),
            dif_name: Some("dif0".to_string()),
            pid: 4242,
            reply: app_tx,
        })
        .unwrap();
    recv_notice(&mut app_rx).await;

    // A peer asks for a flow towards it.
    h.events
        .send(Event::RemoteFlowRequest {
            ipcp_id,
            req: FlowRequest {
                local_app: app.clone(),
                remote_app: AppName::new("peer-app", "1"),
                spec: FlowSpec::default(),
                dif_name: Some("dif0".to_string()),
                pid: 0,
                port_id: 33,
            },
        })
        .unwrap();

    let AppNotice::FlowRequestArrived { seq, remote_app, .. } = recv_notice(&mut app_rx).await
    else {
        panic!("expected an arriving flow request");
    };
    assert_eq!(remote_app, AppName::new("peer-app", "1"));

    // The application accepts; the flow lands in the IPCP record.
    h.events
        .send(Event::AppFlowResponse {
            seq,
            accept: true,
            pid: 4242,
            notify_source: true,
        })
        .unwrap();

    wait_until(|| {
        let manager = h.manager.clone();
        async move { manager.registry.find_by_port(33).await.is_some() }
    })
    .await;

    h.stop();
}

#[tokio::test]
async fn test_process_exit_cleans_registrations_and_flows() {
    let h = Harness::start().await;
    let ipcp_id = h.normal_ipcp_in_dif("k.1", "d").await;
    let app = AppName::new("X", "1");

    let (app_tx, mut app_rx) = mpsc::unbounded_channel();
    h.events
        .send(Event::AppRegister {
            app: app.clone(),
            dif_name: Some("d".to_string()),
            pid: 4242,
            reply: app_tx.clone(),
        })
        .unwrap();
    recv_notice(&mut app_rx).await;

    h.events
        .send(Event::AppAllocateFlow {
            req: FlowRequest {
                local_app: app.clone(),
                remote_app: AppName::new("Y", "1"),
                spec: FlowSpec::default(),
                dif_name: Some("d".to_string()),
                pid: 4242,
                port_id: 0,
            },
            reply: app_tx,
        })
        .unwrap();
    let AppNotice::FlowAllocated { port_id, .. } = recv_notice(&mut app_rx).await else {
        panic!("expected a flow allocation result");
    };
    assert!(port_id > 0);

    // The process dies; within bounded time nothing of it remains.
    h.events.send(Event::ProcessFinalized { pid: 4242 }).unwrap();

    wait_until(|| {
        let manager = h.manager.clone();
        let app = app.clone();
        async move {
            manager.registry.find_by_registered_app(&app).await.is_none()
                && manager.registry.find_by_port(port_id).await.is_none()
                && manager.flows.registration_count() == 0
        }
    })
    .await;

    let entry = h.manager.registry.find_by_id(ipcp_id).await.unwrap();
    assert!(entry.record.read().await.flows.is_empty());

    h.stop();
}

#[tokio::test]
async fn test_flow_deallocated_by_peer_destroys_security_context() {
    let h = Harness::start().await;
    let ipcp_id = h.normal_ipcp_in_dif("k.1", "d").await;

    // A security context keyed by an N-1 port of this IPCP.
    let key = SessionKey {
        ipcp_id,
        port_id: 61,
    };
    let mut profile = AuthProfile::default();
    profile.auth_policy = PolicyConfig::new("PSOC_authentication-none", "1");
    h.manager.auth.get_policy(key, &profile).unwrap();
    assert!(h.manager.auth.has_context(key));

    // The peer deallocates the flow; the context must not outlive it.
    h.events
        .send(Event::FlowDeallocated {
            ipcp_id,
            port_id: 61,
            code: 0,
        })
        .unwrap();

    wait_until(|| {
        let manager = h.manager.clone();
        async move { !manager.auth.has_context(key) }
    })
    .await;

    h.stop();
}
