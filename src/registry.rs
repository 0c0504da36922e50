// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! IPC Process registry
//!
//! Tracks every IPCP in the system: identity, DIF membership, registered
//! applications, allocated flows and neighbors. The registry owns the records;
//! everything else refers to them through `(id, generation)` handles that are
//! revalidated on every asynchronous response, so a handle left over from a
//! destroyed IPCP can never touch a recycled slot.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::IpcmError;

/// Application process naming tuple (APN/API/AEN/AEI).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppName {
    pub process_name: String,
    #[serde(default)]
    pub process_instance: String,
    #[serde(default)]
    pub entity_name: String,
    #[serde(default)]
    pub entity_instance: String,
}

impl AppName {
    pub fn new(process_name: &str, process_instance: &str) -> Self {
        Self {
            process_name: process_name.to_string(),
            process_instance: process_instance.to_string(),
            entity_name: String::new(),
            entity_instance: String::new(),
        }
    }

    /// Encoded form used as a map key: `AP-name|AP-instance|AE-name|AE-instance`.
    pub fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.process_name, self.process_instance, self.entity_name, self.entity_instance
        )
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.process_name, self.process_instance)
    }
}

impl FromStr for AppName {
    type Err = IpcmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('|');
        let process_name = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| IpcmError::Protocol(format!("empty application name: {:?}", s)))?
            .to_string();
        Ok(Self {
            process_name,
            process_instance: parts.next().unwrap_or("").to_string(),
            entity_name: parts.next().unwrap_or("").to_string(),
            entity_instance: parts.next().unwrap_or("").to_string(),
        })
    }
}

/// Type tag of an IPC Process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IpcpType {
    ShimEthernet,
    ShimWifiStation,
    ShimWifiAp,
    ShimTcpUdp,
    ShimDummy,
    ShimHv,
    Normal,
}

impl IpcpType {
    /// All IPCP types this daemon knows how to drive.
    pub const ALL: [IpcpType; 7] = [
        IpcpType::ShimEthernet,
        IpcpType::ShimWifiStation,
        IpcpType::ShimWifiAp,
        IpcpType::ShimTcpUdp,
        IpcpType::ShimDummy,
        IpcpType::ShimHv,
        IpcpType::Normal,
    ];
}

impl fmt::Display for IpcpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IpcpType::ShimEthernet => "shim-ethernet",
            IpcpType::ShimWifiStation => "shim-wifi-station",
            IpcpType::ShimWifiAp => "shim-wifi-ap",
            IpcpType::ShimTcpUdp => "shim-tcp-udp",
            IpcpType::ShimDummy => "shim-dummy",
            IpcpType::ShimHv => "shim-hv",
            IpcpType::Normal => "normal",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for IpcpType {
    type Err = IpcmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shim-ethernet" => Ok(IpcpType::ShimEthernet),
            "shim-wifi-station" => Ok(IpcpType::ShimWifiStation),
            "shim-wifi-ap" => Ok(IpcpType::ShimWifiAp),
            "shim-tcp-udp" => Ok(IpcpType::ShimTcpUdp),
            "shim-dummy" => Ok(IpcpType::ShimDummy),
            "shim-hv" => Ok(IpcpType::ShimHv),
            "normal" => Ok(IpcpType::Normal),
            _ => Err(IpcmError::TypeUnsupported(s.to_string())),
        }
    }
}

/// Characteristics requested for a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSpec {
    /// Loss-free delivery required
    pub reliable: bool,
    /// In-order delivery required
    pub in_order: bool,
    /// Maximum allowable gap in SDUs (-1 = any)
    pub max_sdu_gap: i32,
    /// Average bandwidth in bytes/s (0 = don't care)
    pub average_bandwidth: u64,
    /// Maximum delay in microseconds (0 = don't care)
    pub delay: u32,
    /// Maximum jitter in microseconds (0 = don't care)
    pub jitter: u32,
}

/// A flow allocated through an IPCP, co-owned by the record and the
/// transaction that allocated it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowInfo {
    /// System-wide unique port id
    pub port_id: i32,
    /// File descriptor backing the flow, where applicable
    pub fd: Option<i32>,
    /// Id of the local IPCP providing the flow
    pub ipcp_id: u16,
    pub local_app: AppName,
    pub remote_app: AppName,
    pub dif_name: String,
    pub spec: FlowSpec,
    /// OS process holding the local end, for liveness tracking
    pub pid: u32,
}

/// A neighbor this IPCP has enrolled with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    pub name: AppName,
    pub supporting_dif_name: String,
}

/// Lifecycle state of an IPCP record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcpState {
    /// Id allocated, user worker spawned
    Created,
    /// Both kernel and userspace parts reported ready
    Initialized,
    /// An assign-to-DIF request is in flight
    AssignInFlight,
    /// Member of a DIF
    Assigned,
}

impl fmt::Display for IpcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IpcpState::Created => "Created",
            IpcpState::Initialized => "Initialized",
            IpcpState::AssignInFlight => "AssignInFlight",
            IpcpState::Assigned => "Assigned",
        };
        write!(f, "{}", s)
    }
}

/// Handle to a registry slot: dense id plus the slot generation at the time
/// the handle was issued. Stale handles fail revalidation instead of touching
/// a recycled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpcpHandle {
    pub id: u16,
    pub r#gen: u32,
}

impl fmt::Display for IpcpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ipcp-{}", self.id)
    }
}

/// Mutable state of a single IPCP, guarded by the per-record lock.
#[derive(Debug)]
pub struct IpcpRecord {
    pub name: AppName,
    pub ipcp_type: IpcpType,
    /// Empty until the IPCP has been assigned to a DIF
    pub dif_name: Option<String>,
    pub state: IpcpState,
    pub kernel_ready: bool,
    pub userspace_ready: bool,
    /// Pid of the user worker process, known once it reports in
    pub pid: Option<u32>,
    pub registered_apps: Vec<AppName>,
    pub flows: Vec<FlowInfo>,
    pub neighbors: Vec<Neighbor>,
    /// DIF name carried by the in-flight assign request
    pending_dif: Option<String>,
}

impl IpcpRecord {
    fn new(name: AppName, ipcp_type: IpcpType) -> Self {
        Self {
            name,
            ipcp_type,
            dif_name: None,
            state: IpcpState::Created,
            kernel_ready: false,
            userspace_ready: false,
            pid: None,
            registered_apps: Vec::new(),
            flows: Vec::new(),
            neighbors: Vec::new(),
            pending_dif: None,
        }
    }

    /// Marks the kernel side ready; returns true if the record just became
    /// `Initialized`.
    pub fn set_kernel_ready(&mut self) -> bool {
        self.kernel_ready = true;
        self.maybe_initialize()
    }

    /// Marks the userspace worker ready; returns true if the record just
    /// became `Initialized`.
    pub fn set_userspace_ready(&mut self, pid: u32) -> bool {
        self.userspace_ready = true;
        self.pid = Some(pid);
        self.maybe_initialize()
    }

    fn maybe_initialize(&mut self) -> bool {
        if self.state == IpcpState::Created && self.kernel_ready && self.userspace_ready {
            self.state = IpcpState::Initialized;
            return true;
        }
        false
    }

    /// Starts an assign-to-DIF operation.
    pub fn begin_assign(&mut self, dif_name: &str) -> Result<(), IpcmError> {
        if self.state != IpcpState::Initialized {
            return Err(IpcmError::wrong_state("assign-to-dif", self.state));
        }
        self.state = IpcpState::AssignInFlight;
        self.pending_dif = Some(dif_name.to_string());
        Ok(())
    }

    /// Applies the result of an assign-to-DIF operation.
    pub fn finish_assign(&mut self, success: bool) -> Result<(), IpcmError> {
        if self.state != IpcpState::AssignInFlight {
            return Err(IpcmError::wrong_state("assign-to-dif-result", self.state));
        }
        if success {
            self.dif_name = self.pending_dif.take();
            self.state = IpcpState::Assigned;
        } else {
            self.pending_dif = None;
            self.state = IpcpState::Initialized;
        }
        Ok(())
    }

    /// Folds the neighbor list from a successful enrollment into the record.
    pub fn add_neighbors(&mut self, neighbors: &[Neighbor]) {
        for n in neighbors {
            if !self.neighbors.iter().any(|x| x.name == n.name) {
                self.neighbors.push(n.clone());
            }
        }
    }

    pub fn has_neighbor(&self, name: &AppName) -> bool {
        self.neighbors.iter().any(|n| &n.name == name)
    }

    pub fn remove_neighbor(&mut self, name: &AppName) {
        self.neighbors.retain(|n| &n.name != name);
    }

    pub fn is_registered(&self, app: &AppName) -> bool {
        self.registered_apps.iter().any(|a| a == app)
    }

    pub fn add_registered_app(&mut self, app: AppName) {
        if !self.is_registered(&app) {
            self.registered_apps.push(app);
        }
    }

    pub fn remove_registered_app(&mut self, app: &AppName) {
        self.registered_apps.retain(|a| a != app);
    }

    pub fn flow_by_port(&self, port_id: i32) -> Option<&FlowInfo> {
        self.flows.iter().find(|f| f.port_id == port_id)
    }

    /// Removes and returns the flow bound to `port_id`.
    pub fn take_flow(&mut self, port_id: i32) -> Option<FlowInfo> {
        let idx = self.flows.iter().position(|f| f.port_id == port_id)?;
        Some(self.flows.remove(idx))
    }
}

/// One IPCP held by the registry: the handle plus the lock-guarded record.
#[derive(Debug)]
pub struct IpcpEntry {
    pub handle: IpcpHandle,
    pub record: RwLock<IpcpRecord>,
}

/// Line item returned by [`IpcpRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcpSummary {
    pub id: u16,
    pub name: AppName,
    pub ipcp_type: IpcpType,
    pub dif_name: Option<String>,
    pub state: IpcpState,
}

#[derive(Debug, Default)]
struct Slot {
    r#gen: u32,
    entry: Option<Arc<IpcpEntry>>,
}

/// The registry proper.
///
/// The slot vector is guarded by its own reader/writer lock which only
/// protects the id-to-record map; per-record state has its own lock. Lookups
/// take the map lock in read mode and clone out the `Arc`, so no caller ever
/// holds the map lock while waiting on a record.
#[derive(Debug, Default)]
pub struct IpcpRegistry {
    slots: RwLock<Vec<Slot>>,
}

impl IpcpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new record in state `Created`, reusing the lowest free slot.
    pub async fn create(
        &self,
        name: AppName,
        ipcp_type: IpcpType,
    ) -> Result<Arc<IpcpEntry>, IpcmError> {
        let mut slots = self.slots.write().await;

        for slot in slots.iter() {
            if let Some(entry) = &slot.entry {
                let record = entry.record.read().await;
                if record.name == name {
                    return Err(IpcmError::AlreadyExists(name.to_string()));
                }
            }
        }

        let idx = match slots.iter().position(|s| s.entry.is_none()) {
            Some(idx) => idx,
            None => {
                slots.push(Slot::default());
                slots.len() - 1
            }
        };

        let slot = &mut slots[idx];
        slot.r#gen += 1;
        let handle = IpcpHandle {
            id: idx as u16,
            r#gen: slot.r#gen,
        };
        let entry = Arc::new(IpcpEntry {
            handle,
            record: RwLock::new(IpcpRecord::new(name, ipcp_type)),
        });
        slot.entry = Some(entry.clone());
        Ok(entry)
    }

    /// Drops the record behind `handle`. Stale generations are rejected.
    pub async fn destroy(&self, handle: IpcpHandle) -> Result<(), IpcmError> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(handle.id as usize)
            .ok_or_else(|| IpcmError::NotFound(handle.to_string()))?;
        if slot.r#gen != handle.r#gen || slot.entry.is_none() {
            return Err(IpcmError::NotFound(handle.to_string()));
        }
        slot.entry = None;
        Ok(())
    }

    /// Revalidates a handle and returns the live entry, if any.
    pub async fn get(&self, handle: IpcpHandle) -> Option<Arc<IpcpEntry>> {
        let slots = self.slots.read().await;
        let slot = slots.get(handle.id as usize)?;
        if slot.r#gen != handle.r#gen {
            return None;
        }
        slot.entry.clone()
    }

    /// Finds the live entry with the given id, regardless of generation.
    pub async fn find_by_id(&self, id: u16) -> Option<Arc<IpcpEntry>> {
        let slots = self.slots.read().await;
        slots.get(id as usize)?.entry.clone()
    }

    /// Returns any IPCP assigned to `dif_name`, preferring type `normal`.
    pub async fn find_by_dif(&self, dif_name: &str) -> Option<Arc<IpcpEntry>> {
        let candidates = self.snapshot().await;
        let mut fallback = None;
        for entry in candidates {
            let record = entry.record.read().await;
            if record.dif_name.as_deref() == Some(dif_name) {
                if record.ipcp_type == IpcpType::Normal {
                    drop(record);
                    return Some(entry);
                }
                if fallback.is_none() {
                    drop(record);
                    fallback = Some(entry);
                }
            }
        }
        fallback
    }

    /// Finds the IPCP holding a registration for `app`.
    pub async fn find_by_registered_app(&self, app: &AppName) -> Option<Arc<IpcpEntry>> {
        for entry in self.snapshot().await {
            let record = entry.record.read().await;
            if record.is_registered(app) {
                drop(record);
                return Some(entry);
            }
        }
        None
    }

    /// Finds the IPCP owning the flow with `port_id`.
    pub async fn find_by_port(&self, port_id: i32) -> Option<Arc<IpcpEntry>> {
        for entry in self.snapshot().await {
            let record = entry.record.read().await;
            if record.flow_by_port(port_id).is_some() {
                drop(record);
                return Some(entry);
            }
        }
        None
    }

    /// Returns the handle of the IPCP whose user worker has pid `pid`.
    pub async fn exists_by_pid(&self, pid: u32) -> Option<IpcpHandle> {
        for entry in self.snapshot().await {
            let record = entry.record.read().await;
            if record.pid == Some(pid) {
                return Some(entry.handle);
            }
        }
        None
    }

    /// Summaries of all live IPCPs.
    pub async fn list(&self) -> Vec<IpcpSummary> {
        let mut out = Vec::new();
        for entry in self.snapshot().await {
            let record = entry.record.read().await;
            out.push(IpcpSummary {
                id: entry.handle.id,
                name: record.name.clone(),
                ipcp_type: record.ipcp_type,
                dif_name: record.dif_name.clone(),
                state: record.state,
            });
        }
        out
    }

    /// Names of the DIFs local IPCPs are assigned to.
    pub async fn local_dif_names(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for entry in self.snapshot().await {
            let record = entry.record.read().await;
            if let Some(dif) = &record.dif_name {
                if !out.contains(dif) {
                    out.push(dif.clone());
                }
            }
        }
        out
    }

    /// Clones out the live entries under a short map read lock.
    pub async fn snapshot(&self) -> Vec<Arc<IpcpEntry>> {
        let slots = self.slots.read().await;
        slots.iter().filter_map(|s| s.entry.clone()).collect()
    }
}
