// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! Mobility manager
//!
//! Scripted handover policy for a mobile node roaming between wireless
//! N-1 DIFs. Media reports from the wireless shims keep a picture of the
//! access points in range; on every handover period the manager enrolls the
//! idle shim into the next DIF of its round-robin list, re-homes the upper
//! DIFs through it, waits for traffic to migrate and then tears down the old
//! path in reverse order. Failures reschedule the step after a fixed backoff.
//! One handover runs at a time.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::IpcmError;
use crate::events::MediaReport;
use crate::manager::IpcManager;
use crate::registry::AppName;

pub const DEFAULT_DISC_WAIT_TIME_MS: u64 = 5_000;
pub const DEFAULT_HANDOVER_PERIOD_MS: u64 = 60_000;
pub const DEFAULT_BOOTSTRAP_WAIT_TIME_MS: u64 = 20_000;
/// Backoff after a failed initialisation step.
pub const INIT_RETRY_MS: u64 = 1_000;
/// Backoff after a failed handover.
pub const HANDOVER_RETRY_MS: u64 = 5_000;

/// One attachment the round-robin can move to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoverTarget {
    /// Wireless N-1 DIF to attach the idle shim to
    pub shim_dif: String,
    /// Upper mobile IPCP re-homed through the fresh shim
    pub mobile_ipcp_id: u16,
    pub mobile_dif: String,
    /// Expected upper-layer neighbor at this attachment
    pub mobile_neighbor: String,
    /// Internet-layer hop, present when the scenario also changes provider
    pub internet_dif: Option<String>,
    pub internet_neighbor: Option<String>,
}

/// Static configuration of the mobility manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MobilityConfig {
    /// Ids of the two wireless shim IPCPs that alternate attachments
    pub wifi_shim_ids: Vec<u16>,
    /// Internet-layer IPCP, when provider hops are part of the scenario
    pub internet_ipcp_id: Option<u16>,
    /// Round-robin attachment list
    pub targets: Vec<HandoverTarget>,
    pub disc_wait_ms: u64,
    pub hand_period_ms: u64,
    pub bootstrap_wait_ms: u64,
}

impl Default for MobilityConfig {
    fn default() -> Self {
        Self {
            wifi_shim_ids: Vec::new(),
            internet_ipcp_id: None,
            targets: Vec::new(),
            disc_wait_ms: DEFAULT_DISC_WAIT_TIME_MS,
            hand_period_ms: DEFAULT_HANDOVER_PERIOD_MS,
            bootstrap_wait_ms: DEFAULT_BOOTSTRAP_WAIT_TIME_MS,
        }
    }
}

/// Where the mobile node is currently attached.
#[derive(Debug, Clone)]
struct Attachment {
    shim_id: u16,
    shim_dif: String,
    /// Base-station IPCP we enrolled the shim with
    bs_address: String,
    mobile_ipcp_id: u16,
    mobile_neighbor: AppName,
    internet_neighbor: Option<AppName>,
}

#[derive(Debug, Default)]
struct HandoverState {
    last_report: Option<MediaReport>,
    current: Option<Attachment>,
    next_index: usize,
}

/// Outcome of one timer step, deciding the next delay.
enum StepOutcome {
    /// No media report yet
    Idle,
    Ok,
    InitFailed,
    HandoverFailed,
}

/// The manager itself. The state mutex is held across a whole handover, so
/// concurrent handovers serialise.
pub struct MobilityManager {
    manager: Arc<IpcManager>,
    cfg: MobilityConfig,
    state: Mutex<HandoverState>,
}

impl MobilityManager {
    pub fn new(manager: Arc<IpcManager>, cfg: MobilityConfig) -> Arc<Self> {
        info!(
            period_ms = cfg.hand_period_ms,
            disc_wait_ms = cfg.disc_wait_ms,
            targets = cfg.targets.len(),
            "mobility manager created"
        );
        Arc::new(Self {
            manager,
            cfg,
            state: Mutex::new(HandoverState::default()),
        })
    }

    /// Consumes media reports and drives the bootstrap/handover schedule
    /// until cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut media: mpsc::UnboundedReceiver<MediaReport>,
        cancel: CancellationToken,
    ) {
        let mut deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.cfg.bootstrap_wait_ms);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                report = media.recv() => match report {
                    Some(report) => self.store_report(report).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    let delay_ms = match self.step().await {
                        StepOutcome::Idle => self.cfg.bootstrap_wait_ms,
                        StepOutcome::Ok => self.cfg.hand_period_ms,
                        StepOutcome::InitFailed => INIT_RETRY_MS,
                        StepOutcome::HandoverFailed => HANDOVER_RETRY_MS,
                    };
                    deadline = tokio::time::Instant::now() + Duration::from_millis(delay_ms);
                }
            }
        }
        debug!("mobility manager stopped");
    }

    /// Remembers the latest media report.
    pub async fn store_report(&self, report: MediaReport) {
        debug!(difs = report.available_difs.len(), "received media report");
        self.state.lock().await.last_report = Some(report);
    }

    async fn step(&self) -> StepOutcome {
        let mut state = self.state.lock().await;
        if state.last_report.is_none() {
            return StepOutcome::Idle;
        }
        if state.current.is_none() {
            match self.initialize(&mut state).await {
                Ok(()) => StepOutcome::Ok,
                Err(e) => {
                    warn!(error = %e, "mobility initialisation failed, retrying");
                    StepOutcome::InitFailed
                }
            }
        } else {
            match self.execute_handover(&mut state).await {
                Ok(()) => StepOutcome::Ok,
                Err(e) => {
                    warn!(error = %e, "handover failed, retrying");
                    StepOutcome::HandoverFailed
                }
            }
        }
    }

    /// First attachment: enroll a shim and the mobile DIF through it.
    async fn initialize(&self, state: &mut HandoverState) -> Result<(), IpcmError> {
        let target = self
            .cfg
            .targets
            .first()
            .ok_or_else(|| IpcmError::Internal("no handover targets configured".to_string()))?
            .clone();
        let shim_id = *self
            .cfg
            .wifi_shim_ids
            .first()
            .ok_or_else(|| IpcmError::Internal("no wireless shims configured".to_string()))?;

        let bs_address = base_station_for(state, &target.shim_dif)?;
        let bs_neighbor = AppName::new(&bs_address, "");

        self.manager
            .enroll(shim_id, &target.shim_dif, "", bs_neighbor, None)
            .await?
            .wait()
            .await?;

        let mobile_neighbor = AppName::new(&target.mobile_neighbor, "1");
        self.manager
            .enroll(
                target.mobile_ipcp_id,
                &target.mobile_dif,
                &target.shim_dif,
                mobile_neighbor.clone(),
                None,
            )
            .await?
            .wait()
            .await?;

        info!(dif = %target.shim_dif, shim = shim_id, "initial wireless attachment complete");
        state.current = Some(Attachment {
            shim_id,
            shim_dif: target.shim_dif.clone(),
            bs_address,
            mobile_ipcp_id: target.mobile_ipcp_id,
            mobile_neighbor,
            internet_neighbor: None,
        });
        state.next_index = 1 % self.cfg.targets.len().max(1);
        Ok(())
    }

    /// One scripted handover: enroll the new path, wait for traffic to
    /// migrate, disconnect the old path in reverse order.
    async fn execute_handover(&self, state: &mut HandoverState) -> Result<(), IpcmError> {
        let old = state
            .current
            .clone()
            .ok_or_else(|| IpcmError::Internal("handover without attachment".to_string()))?;
        if self.cfg.targets.is_empty() {
            return Err(IpcmError::Internal("no handover targets configured".to_string()));
        }
        let target = self.cfg.targets[state.next_index % self.cfg.targets.len()].clone();

        // 1. Choose the new attachment from the media report.
        let bs_address = base_station_for(state, &target.shim_dif)?;
        let bs_neighbor = AppName::new(&bs_address, "");
        let enroll_shim = self.idle_shim(old.shim_id)?;

        // 2. Enroll the idle shim to the new DIF/AP.
        self.manager
            .enroll(enroll_shim, &target.shim_dif, "", bs_neighbor, None)
            .await?
            .wait()
            .await?;

        // 3. Enroll the mobile DIF through the fresh shim, telling the peer
        //    which neighbor is about to go away.
        let mobile_neighbor = AppName::new(&target.mobile_neighbor, "1");
        self.manager
            .enroll(
                target.mobile_ipcp_id,
                &target.mobile_dif,
                &target.shim_dif,
                mobile_neighbor.clone(),
                Some(old.mobile_neighbor.clone()),
            )
            .await?
            .wait()
            .await?;

        // 4. Provider hop, when the scenario changes the internet path too.
        let mut internet_neighbor = None;
        if let (Some(internet_ipcp), Some(internet_dif), Some(neighbor)) = (
            self.cfg.internet_ipcp_id,
            target.internet_dif.as_deref(),
            target.internet_neighbor.as_deref(),
        ) {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            let neighbor = AppName::new(neighbor, "1");
            self.manager
                .enroll(
                    internet_ipcp,
                    internet_dif,
                    &target.mobile_dif,
                    neighbor.clone(),
                    old.internet_neighbor.clone(),
                )
                .await?
                .wait()
                .await?;
            internet_neighbor = Some(neighbor);
        }

        // 5. Multihomed now; let traffic migrate.
        tokio::time::sleep(Duration::from_millis(self.cfg.disc_wait_ms)).await;

        // 6. Break the old path, internet first, then mobile, then shim.
        if let (Some(internet_ipcp), Some(old_neighbor)) =
            (self.cfg.internet_ipcp_id, old.internet_neighbor.clone())
        {
            self.disconnect_quietly(internet_ipcp, old_neighbor).await;
        }
        self.disconnect_quietly(old.mobile_ipcp_id, old.mobile_neighbor.clone())
            .await;
        self.disconnect_quietly(old.shim_id, AppName::new(&old.bs_address, ""))
            .await;

        info!(from = %old.shim_dif, to = %target.shim_dif, "handover done");
        state.current = Some(Attachment {
            shim_id: enroll_shim,
            shim_dif: target.shim_dif.clone(),
            bs_address,
            mobile_ipcp_id: target.mobile_ipcp_id,
            mobile_neighbor,
            internet_neighbor,
        });
        state.next_index = (state.next_index + 1) % self.cfg.targets.len();
        Ok(())
    }

    /// The wireless shim not carrying the current attachment.
    fn idle_shim(&self, active: u16) -> Result<u16, IpcmError> {
        self.cfg
            .wifi_shim_ids
            .iter()
            .copied()
            .find(|id| *id != active)
            .ok_or_else(|| IpcmError::Internal("no idle wireless shim available".to_string()))
    }

    /// Disconnect step of the teardown; failures are logged, not fatal, so
    /// the rest of the teardown still runs.
    async fn disconnect_quietly(&self, ipcp_id: u16, neighbor: AppName) {
        let result = match self.manager.disconnect_neighbor(ipcp_id, neighbor.clone()).await {
            Ok(promise) => promise.wait().await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(ipcp_id, neighbor = %neighbor, error = %e,
                  "problems disconnecting from old neighbor");
        }
    }
}

/// First base station in range for `dif`, from the newest media report.
fn base_station_for(state: &HandoverState, dif: &str) -> Result<String, IpcmError> {
    let report = state
        .last_report
        .as_ref()
        .ok_or_else(|| IpcmError::Internal("no media report yet".to_string()))?;
    report
        .available_difs
        .get(dif)
        .and_then(|info| info.available_bs_ipcps.first())
        .map(|bs| bs.ipcp_address.clone())
        .ok_or_else(|| IpcmError::NotFound(format!("no members of DIF {:?} within range", dif)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BaseStationInfo, MediaDifInfo};

    #[test]
    fn test_base_station_lookup() {
        let mut report = MediaReport::default();
        report.available_difs.insert(
            "pristine".to_string(),
            MediaDifInfo {
                available_bs_ipcps: vec![BaseStationInfo {
                    ipcp_address: "ap1.mobile".to_string(),
                    signal_strength: -40,
                }],
            },
        );
        let state = HandoverState {
            last_report: Some(report),
            ..Default::default()
        };

        assert_eq!(
            base_station_for(&state, "pristine").unwrap(),
            "ap1.mobile".to_string()
        );
        assert!(matches!(
            base_station_for(&state, "irati"),
            Err(IpcmError::NotFound(_))
        ));
    }

    #[test]
    fn test_default_config_values() {
        let cfg = MobilityConfig::default();
        assert_eq!(cfg.disc_wait_ms, 5_000);
        assert_eq!(cfg.hand_period_ms, 60_000);
        assert_eq!(cfg.bootstrap_wait_ms, 20_000);
    }
}
