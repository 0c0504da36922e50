// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! Integration test: scripted handover between two wireless attachments.
//!
//! Shim A starts attached to "irati"; a media report triggers the mobility
//! manager, which enrolls shim B into "pristine", re-homes the mobile DIF
//! through it, waits out the disconnect interval and tears down the old
//! path. Afterwards the mobile IPCP has exactly one N-1 neighbor, reachable
//! via shim B.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ipcmd::events::{
    event_channel, BaseStationInfo, Event, EventSender, MediaDifInfo, MediaReport,
};
use ipcmd::kernel::{KernelHandle, KernelRequest};
use ipcmd::manager::IpcManager;
use ipcmd::mobility::{HandoverTarget, MobilityConfig, MobilityManager};
use ipcmd::registry::{AppName, IpcpType, Neighbor};
use ipcmd::templates::{DifTemplate, KnownIpcpAddress};
use ipcmd::transactions::TxOutcome;

fn spawn_ack_kernel(mut rx: mpsc::UnboundedReceiver<KernelRequest>, events: EventSender) {
    tokio::spawn(async move {
        let mut next_pid = 6000u32;
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
                KernelRequest::Enroll {
                    tid,
                    supporting_dif_name,
                    neighbor,
                    ..
                } => {
                    let _ = events.send(Event::EnrollResponse {
                        tid,
                        result: 0,
                        neighbors: vec![Neighbor {
                            name: neighbor,
                            supporting_dif_name,
                        }],
                    });
                }
                KernelRequest::DisconnectNeighbor { tid, .. } => {
                    let _ = events.send(Event::DisconnectNeighborResponse { tid, result: 0 });
                }
                _ => {}
            }
        }
    });
}

async fn ipcp(manager: &Arc<IpcManager>, name: &str, t: IpcpType, dif: &str) -> u16 {
    let promise = manager
        .create_ipcp(AppName::new(name, "1"), t)
        .await
        .unwrap();
    let TxOutcome::IpcpId(handle) = promise.wait().await.unwrap() else {
        panic!("expected an id");
    };

    let mut template = DifTemplate::default();
    if t == IpcpType::Normal {
        template.dif_type = "normal".to_string();
        template.known_ipcp_addresses.push(KnownIpcpAddress {
            ap_name: name.to_string(),
            ap_instance: String::new(),
            address: 30 + handle.id as u32,
        });
    } else {
        template.dif_type = t.to_string();
    }
    let template_name = format!("{}.dif", name);
    manager.templates.add(&template_name, template).await;

    manager
        .assign_to_dif(handle.id, &template_name, dif)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    handle.id
}

fn media_report(reporter: u16) -> MediaReport {
    let mut available_difs = HashMap::new();
    for (dif, ap) in [("irati", "ap-sta1"), ("pristine", "ap-sta2")] {
        available_difs.insert(
            dif.to_string(),
            MediaDifInfo {
                available_bs_ipcps: vec![BaseStationInfo {
                    ipcp_address: ap.to_string(),
                    signal_strength: -42,
                }],
            },
        );
    }
    MediaReport {
        ipcp_id: reporter,
        available_difs,
    }
}

#[tokio::test]
async fn test_handover_moves_mobile_dif_to_second_shim() {
    let (kernel, kernel_rx) = KernelHandle::channel();
    let (event_tx, event_rx) = event_channel();
    let manager = IpcManager::new(kernel);
    let cancel = CancellationToken::new();

    spawn_ack_kernel(kernel_rx, event_tx.clone());
    tokio::spawn(manager.clone().run(event_rx, cancel.clone()));

    let shim_a = ipcp(&manager, "wifi-a", IpcpType::ShimWifiStation, "irati").await;
    let shim_b = ipcp(&manager, "wifi-b", IpcpType::ShimWifiStation, "pristine").await;
    let mobile = ipcp(&manager, "ue.mobile", IpcpType::Normal, "mobile.DIF").await;

    let cfg = MobilityConfig {
        wifi_shim_ids: vec![shim_a, shim_b],
        internet_ipcp_id: None,
        targets: vec![
            HandoverTarget {
                shim_dif: "irati".to_string(),
                mobile_ipcp_id: mobile,
                mobile_dif: "mobile.DIF".to_string(),
                mobile_neighbor: "ap1.mobile".to_string(),
                internet_dif: None,
                internet_neighbor: None,
            },
            HandoverTarget {
                shim_dif: "pristine".to_string(),
                mobile_ipcp_id: mobile,
                mobile_dif: "mobile.DIF".to_string(),
                mobile_neighbor: "ap2.mobile".to_string(),
                internet_dif: None,
                internet_neighbor: None,
            },
        ],
        disc_wait_ms: 40,
        hand_period_ms: 250,
        bootstrap_wait_ms: 30,
    };

    let media_rx = manager.subscribe_media();
    let mobman = MobilityManager::new(manager.clone(), cfg);
    tokio::spawn(mobman.run(media_rx, cancel.clone()));

    // The wireless shim reports both DIFs within range.
    event_tx
        .send(Event::MediaReport(media_report(shim_a)))
        .unwrap();

    // First the initial attachment to "irati" via ap1...
    wait_until(|| {
        let manager = manager.clone();
        async move {
            let entry = manager.registry.find_by_id(mobile).await.unwrap();
            let record = entry.record.read().await;
            record.has_neighbor(&AppName::new("ap1.mobile", "1"))
        }
    })
    .await;

    // ...then, one handover period later, the move to "pristine" via ap2,
    // with the old path gone.
    wait_until(|| {
        let manager = manager.clone();
        async move {
            let entry = manager.registry.find_by_id(mobile).await.unwrap();
            let record = entry.record.read().await;
            record.neighbors.len() == 1
                && record.has_neighbor(&AppName::new("ap2.mobile", "1"))
        }
    })
    .await;

    // The old shim dropped its AP; the new one holds the attachment.
    let a = manager.registry.find_by_id(shim_a).await.unwrap();
    assert!(!a.record.read().await.has_neighbor(&AppName::new("ap-sta1", "")));
    let b = manager.registry.find_by_id(shim_b).await.unwrap();
    assert!(b.record.read().await.has_neighbor(&AppName::new("ap-sta2", "")));

    cancel.cancel();
}

/// Polls `cond` until it holds, failing the test after five seconds.
async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
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
