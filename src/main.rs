// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ipcmd::config::{self, CliArgs, DaemonConfig};
use ipcmd::events::{event_channel, Event, EventSender};
use ipcmd::kernel::{KernelHandle, KernelRequest};
use ipcmd::manager::IpcManager;
use ipcmd::mobility::MobilityManager;
use ipcmd::procmon::ProcessMonitor;
use ipcmd::registry::Neighbor;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    let config = match DaemonConfig::from_cli(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ipcmd: {}", e);
            std::process::exit(1);
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (kernel, kernel_rx) = KernelHandle::channel();
    let (event_tx, event_rx) = event_channel();
    let manager = IpcManager::new(kernel);
    let cancel = CancellationToken::new();

    if let Some(path) = &config.app_map_file {
        match config::load_app_map(path) {
            Ok(map) => manager.flows.load_mappings(map),
            Err(e) => {
                eprintln!("ipcmd: {}", e);
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = manager.templates.load_directory(&config.template_dir).await {
        warn!(dir = %config.template_dir.display(), error = %e,
              "could not load DIF templates; the watcher will retry");
    }
    {
        let mgr = manager.clone();
        let dir = config.template_dir.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { mgr.templates.run_watcher(dir, cancel).await });
    }

    {
        let table = manager.transactions.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { table.run_reaper(cancel).await });
    }

    // Process-exit notifications. The platform subscription (netlink process
    // connector) feeds this channel; it stays empty when unavailable.
    let (_exit_tx, exit_rx) = mpsc::unbounded_channel::<u32>();
    tokio::spawn(
        ProcessMonitor::new(exit_rx, manager.pids.clone(), event_tx.clone()).run(cancel.clone()),
    );

    // Without a RINA-enabled kernel the daemon talks to a loopback peer that
    // acknowledges every command, so the control paths stay exercisable.
    tokio::spawn(run_loopback_peer(kernel_rx, event_tx.clone(), cancel.clone()));

    if let Some(mobility_cfg) = config.mobility.clone() {
        let media = manager.subscribe_media();
        let mobman = MobilityManager::new(manager.clone(), mobility_cfg);
        tokio::spawn(mobman.run(media, cancel.clone()));
    }

    let dispatcher = tokio::spawn(manager.clone().run(event_rx, cancel.clone()));
    info!("ipcmd started");

    if tokio::signal::ctrl_c().await.is_err() {
        warn!("cannot listen for SIGINT, shutting down");
    }
    info!("stop requested, cancelling outstanding work");
    cancel.cancel();
    let _ = dispatcher.await;
}

/// Stand-in kernel/IPCP peer: acknowledges every command with a success
/// response so the daemon can run on machines without a RINA stack.
async fn run_loopback_peer(
    mut rx: mpsc::UnboundedReceiver<KernelRequest>,
    events: EventSender,
    cancel: CancellationToken,
) {
    let mut next_pid = 1000u32;
    loop {
        let req = tokio::select! {
            _ = cancel.cancelled() => break,
            req = rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };

        let reply = match req {
            KernelRequest::CreateIpcp { tid, ipcp_id, .. } => {
                next_pid += 1;
                let _ = events.send(Event::CreateIpcpResponse { tid, result: 0 });
                Some(Event::IpcpDaemonInitialized {
                    ipcp_id,
                    pid: next_pid,
                })
            }
            KernelRequest::DestroyIpcp { tid, .. } => {
                Some(Event::DestroyIpcpResponse { tid, result: 0 })
            }
            KernelRequest::AssignToDif { tid, .. } => {
                Some(Event::AssignToDifResponse { tid, result: 0 })
            }
            KernelRequest::UpdateDifConfig { tid, .. } => {
                Some(Event::UpdateDifConfigResponse { tid, result: 0 })
            }
            KernelRequest::RegisterApp { tid, .. } => {
                Some(Event::RegisterAppResponse { tid, result: 0 })
            }
            KernelRequest::UnregisterApp { tid, .. } => {
                Some(Event::UnregisterAppResponse { tid, result: 0 })
            }
            KernelRequest::AllocateFlow { tid, req, .. } => Some(Event::AllocateFlowResult {
                tid,
                result: 0,
                port_id: req.port_id,
            }),
            KernelRequest::DeallocateFlow { tid, .. } => {
                Some(Event::DeallocateFlowResponse { tid, result: 0 })
            }
            KernelRequest::Enroll {
                tid,
                neighbor,
                supporting_dif_name,
                ..
            } => Some(Event::EnrollResponse {
                tid,
                result: 0,
                neighbors: vec![Neighbor {
                    name: neighbor,
                    supporting_dif_name,
                }],
            }),
            KernelRequest::DisconnectNeighbor { tid, .. } => {
                Some(Event::DisconnectNeighborResponse { tid, result: 0 })
            }
            KernelRequest::QueryRib { tid, .. } => Some(Event::QueryRibResponse {
                tid,
                result: 0,
                rib: "Name: /difmanagement; Class: DIFManagement; Instance: 1\nValue: loopback\n"
                    .to_string(),
            }),
            KernelRequest::SelectPolicySet { tid, .. } => {
                Some(Event::SelectPolicySetResponse { tid, result: 0 })
            }
            KernelRequest::SetPolicySetParam { tid, .. } => {
                Some(Event::SetPolicySetParamResponse { tid, result: 0 })
            }
            KernelRequest::PluginLoad { tid, .. } => {
                Some(Event::PluginLoadResponse { tid, result: 0 })
            }
            KernelRequest::NotifyRegistration { .. }
            | KernelRequest::AllocateFlowResponse { .. }
            | KernelRequest::SendCdap { .. } => None,
        };

        if let Some(event) = reply {
            let _ = events.send(event);
        }
    }
}
