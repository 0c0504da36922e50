// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! Integration test: IPCP lifecycle against a scripted kernel peer
//!
//! Drives create / assign / enroll / query-rib / destroy through the real
//! dispatcher, with a task standing in for the kernel and the IPCP workers.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ipcmd::events::{event_channel, Event, EventSender};
use ipcmd::kernel::{KernelHandle, KernelRequest};
use ipcmd::manager::IpcManager;
use ipcmd::registry::{AppName, IpcpState, IpcpType, Neighbor};
use ipcmd::templates::{DifTemplate, KnownIpcpAddress};
use ipcmd::transactions::TxOutcome;
use ipcmd::IpcmError;

/// Kernel stand-in that acknowledges every command. Enrollment succeeds
/// unless the target DIF is `"locked.DIF"`, which fails authentication.
fn spawn_ack_kernel(mut rx: mpsc::UnboundedReceiver<KernelRequest>, events: EventSender) {
    tokio::spawn(async move {
        let mut next_pid = 5000u32;
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
                KernelRequest::DestroyIpcp { tid, .. } => {
                    let _ = events.send(Event::DestroyIpcpResponse { tid, result: 0 });
                }
                KernelRequest::AssignToDif { tid, .. } => {
                    let _ = events.send(Event::AssignToDifResponse { tid, result: 0 });
                }
                KernelRequest::Enroll {
                    tid,
                    dif_name,
                    supporting_dif_name,
                    neighbor,
                    ..
                } => {
                    if dif_name == "locked.DIF" {
                        let _ = events.send(Event::EnrollResponse {
                            tid,
                            result: -2,
                            neighbors: vec![],
                        });
                    } else {
                        let _ = events.send(Event::EnrollResponse {
                            tid,
                            result: 0,
                            neighbors: vec![Neighbor {
                                name: neighbor,
                                supporting_dif_name,
                            }],
                        });
                    }
                }
                KernelRequest::DisconnectNeighbor { tid, .. } => {
                    let _ = events.send(Event::DisconnectNeighborResponse { tid, result: 0 });
                }
                KernelRequest::QueryRib { tid, .. } => {
                    let _ = events.send(Event::QueryRibResponse {
                        tid,
                        result: 0,
                        rib: "Name: /dif/management; Class: DIFManagement; Instance: 1\n\
                              Value: assigned\n"
                            .to_string(),
                    });
                }
                _ => {}
            }
        }
    });
}

struct Harness {
    manager: Arc<IpcManager>,
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
        Self { manager, cancel }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

fn normal_template_with_address(ap_name: &str, address: u32) -> DifTemplate {
    let mut template = DifTemplate {
        dif_type: "normal".to_string(),
        ..Default::default()
    };
    template.known_ipcp_addresses.push(KnownIpcpAddress {
        ap_name: ap_name.to_string(),
        ap_instance: String::new(),
        address,
    });
    template
}

#[tokio::test]
async fn test_create_assign_and_list() {
    let h = Harness::start().await;

    let promise = h
        .manager
        .create_ipcp(AppName::new("a.1", "1"), IpcpType::Normal)
        .await
        .unwrap();
    let outcome = promise.wait().await.unwrap();
    let TxOutcome::IpcpId(handle) = outcome else {
        panic!("unexpected outcome {:?}", outcome);
    };

    h.manager
        .templates
        .add("normal.dif", normal_template_with_address("a.1", 42))
        .await;

    let promise = h
        .manager
        .assign_to_dif(handle.id, "normal.dif", "dif0")
        .await
        .unwrap();
    assert_eq!(promise.wait().await.unwrap(), TxOutcome::Done);

    let listed = h.manager.list_ipcps().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].dif_name.as_deref(), Some("dif0"));
    assert_eq!(listed[0].state, IpcpState::Assigned);

    h.stop();
}

#[tokio::test]
async fn test_assign_with_unknown_template_issues_no_command() {
    // No responder here on purpose: the kernel receiver is held so the test
    // can prove nothing was sent.
    let (kernel, mut kernel_rx) = KernelHandle::channel();
    let (event_tx, event_rx) = event_channel();
    let manager = IpcManager::new(kernel);
    let cancel = CancellationToken::new();
    tokio::spawn(manager.clone().run(event_rx, cancel.clone()));

    let promise = manager
        .create_ipcp(AppName::new("b.1", "1"), IpcpType::Normal)
        .await
        .unwrap();
    // Complete the create by hand.
    let KernelRequest::CreateIpcp { tid, ipcp_id, .. } = kernel_rx.recv().await.unwrap() else {
        panic!("expected create command");
    };
    event_tx
        .send(Event::CreateIpcpResponse { tid, result: 0 })
        .unwrap();
    event_tx
        .send(Event::IpcpDaemonInitialized { ipcp_id, pid: 77 })
        .unwrap();
    promise.wait().await.unwrap();

    let err = manager
        .assign_to_dif(ipcp_id, "missing.dif", "dif0")
        .await
        .unwrap_err();
    assert!(matches!(err, IpcmError::TemplateInvalid(_)));

    // The failed validation must not have reached the kernel.
    assert!(kernel_rx.try_recv().is_err());
    cancel.cancel();
}

#[tokio::test]
async fn test_assign_requires_initialized_state() {
    // The kernel acknowledges creation, but the user worker never reports
    // in, so the record stays in Created.
    let (kernel, mut kernel_rx) = KernelHandle::channel();
    let (event_tx, event_rx) = event_channel();
    let manager = IpcManager::new(kernel);
    let cancel = CancellationToken::new();
    tokio::spawn(manager.clone().run(event_rx, cancel.clone()));

    let _promise = manager
        .create_ipcp(AppName::new("c.1", "1"), IpcpType::Normal)
        .await
        .unwrap();
    let KernelRequest::CreateIpcp { tid, ipcp_id, .. } = kernel_rx.recv().await.unwrap() else {
        panic!("expected create command");
    };
    event_tx
        .send(Event::CreateIpcpResponse { tid, result: 0 })
        .unwrap();
    tokio::task::yield_now().await;

    manager
        .templates
        .add("normal.dif", normal_template_with_address("c.1", 7))
        .await;

    // Give the dispatcher time to apply the kernel-ready flag; the record
    // must still reject the assignment.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let err = manager
        .assign_to_dif(ipcp_id, "normal.dif", "dif0")
        .await
        .unwrap_err();
    assert!(matches!(err, IpcmError::WrongState { .. }));
    cancel.cancel();
}

#[tokio::test]
async fn test_create_then_destroy_leaves_registry_unchanged() {
    let h = Harness::start().await;

    let promise = h
        .manager
        .create_ipcp(AppName::new("gone.1", "1"), IpcpType::ShimDummy)
        .await
        .unwrap();
    let TxOutcome::IpcpId(handle) = promise.wait().await.unwrap() else {
        panic!("expected an id");
    };

    let promise = h.manager.destroy_ipcp(handle.id).await.unwrap();
    assert_eq!(promise.wait().await.unwrap(), TxOutcome::Done);
    assert!(h.manager.list_ipcps().await.is_empty());

    h.stop();
}

#[tokio::test]
async fn test_enroll_records_neighbors() {
    let h = Harness::start().await;

    let promise = h
        .manager
        .create_ipcp(AppName::new("m.1", "1"), IpcpType::Normal)
        .await
        .unwrap();
    let TxOutcome::IpcpId(handle) = promise.wait().await.unwrap() else {
        panic!("expected an id");
    };
    h.manager
        .templates
        .add("normal.dif", normal_template_with_address("m.1", 11))
        .await;
    h.manager
        .assign_to_dif(handle.id, "normal.dif", "mobile.DIF")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let neighbor = AppName::new("peer.1", "1");
    let promise = h
        .manager
        .enroll(handle.id, "mobile.DIF", "wifi.DIF", neighbor.clone(), None)
        .await
        .unwrap();
    let TxOutcome::Neighbors(neighbors) = promise.wait().await.unwrap() else {
        panic!("expected neighbors");
    };
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].name, neighbor);

    // Enrollment into the locked DIF collapses to AuthenticationFailed.
    let promise = h
        .manager
        .enroll(handle.id, "locked.DIF", "wifi.DIF", neighbor.clone(), None)
        .await
        .unwrap();
    assert!(matches!(
        promise.wait().await.unwrap_err(),
        IpcmError::AuthenticationFailed(_)
    ));

    // Disconnecting from a neighbor we never met is rejected up front.
    let err = h
        .manager
        .disconnect_neighbor(handle.id, AppName::new("stranger.1", "1"))
        .await
        .unwrap_err();
    assert!(matches!(err, IpcmError::NoSuchNeighbor(_)));

    // Disconnecting the enrolled one removes it.
    h.manager
        .disconnect_neighbor(handle.id, neighbor)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    h.stop();
}

#[tokio::test]
async fn test_unknown_correlation_id_is_dropped() {
    let (kernel, _kernel_rx) = KernelHandle::channel();
    let (event_tx, event_rx) = event_channel();
    let manager = IpcManager::new(kernel);
    let cancel = CancellationToken::new();
    tokio::spawn(manager.clone().run(event_rx, cancel.clone()));

    // Nobody ever opened transaction 4242; the response is logged and
    // dropped, and the dispatcher keeps running.
    event_tx
        .send(Event::AssignToDifResponse {
            tid: 4242,
            result: 0,
        })
        .unwrap();
    event_tx
        .send(Event::QueryRibResponse {
            tid: 4243,
            result: 0,
            rib: String::new(),
        })
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(manager.transactions.is_empty());
    assert!(manager.list_ipcps().await.is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn test_query_rib_dump_format() {
    let h = Harness::start().await;

    let promise = h
        .manager
        .create_ipcp(AppName::new("q.1", "1"), IpcpType::ShimDummy)
        .await
        .unwrap();
    let TxOutcome::IpcpId(handle) = promise.wait().await.unwrap() else {
        panic!("expected an id");
    };

    let promise = h.manager.query_rib(handle.id, "", "").await.unwrap();
    let TxOutcome::Rib(text) = promise.wait().await.unwrap() else {
        panic!("expected a rib dump");
    };

    let name = text.find("Name:").expect("Name: prefix");
    let class = text.find("Class:").expect("Class: prefix");
    let instance = text.find("Instance:").expect("Instance: prefix");
    let value = text.find("Value:").expect("Value: prefix");
    assert!(name < class && class < instance && instance < value);

    h.stop();
}
