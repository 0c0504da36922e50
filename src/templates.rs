// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! DIF template manager
//!
//! Templates are UTF-8 JSON files in a configured directory, keyed by their
//! filename. A file named `default.dif` seeds every other template: fields
//! that are empty or zero in a child are filled from the default on load.
//! A watcher task keeps the store in sync with the directory, dropping
//! deleted templates and ignoring partial or corrupt files.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TemplateLoadError;
use crate::registry::AppName;

/// Filename of the template merged into every other template.
pub const DEFAULT_TEMPLATE_NAME: &str = "default.dif";

/// A named policy set plus its parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicyConfig {
    pub name: String,
    pub version: String,
    pub parameters: BTreeMap<String, String>,
}

impl PolicyConfig {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            parameters: BTreeMap::new(),
        }
    }

    /// True when the policy set has not been selected at all.
    pub fn is_unset(&self) -> bool {
        self.name.is_empty()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(|s| s.as_str())
    }
}

/// EFCP data-transfer constants of a DIF.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataTransferConstants {
    pub address_length: u32,
    pub cep_id_length: u32,
    pub port_id_length: u32,
    pub qos_id_length: u32,
    pub sequence_number_length: u32,
    pub ctrl_sequence_number_length: u32,
    pub length_length: u32,
    pub rate_length: u32,
    pub frame_length: u32,
    pub max_pdu_size: u32,
    pub max_pdu_lifetime: u32,
    pub dif_integrity: bool,
}

impl DataTransferConstants {
    pub fn is_unset(&self) -> bool {
        *self == Self::default()
    }
}

/// Window and rate based flow-control knobs of a DTCP instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FlowControlConfig {
    pub window_based: bool,
    pub initial_credit: u32,
    pub rate_based: bool,
    pub sending_rate: u32,
    pub time_period: u32,
}

/// Retransmission-control knobs of a DTCP instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RtxControlConfig {
    pub max_time_to_retry: u32,
    pub data_rxms_nmax: u32,
    pub initial_rtx_time: u32,
}

/// DTCP side of a QoS cube's EFCP policies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DtcpConfig {
    pub dtcp_policy_set: PolicyConfig,
    pub flow_control: bool,
    pub flow_control_config: FlowControlConfig,
    pub rtx_control: bool,
    pub rtx_control_config: RtxControlConfig,
}

/// EFCP policies of a QoS cube.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EfcpPolicies {
    pub dtp_policy_set: PolicyConfig,
    pub dtcp_present: bool,
    pub dtcp_configuration: DtcpConfig,
    pub initial_a_timer: u32,
    pub seq_num_rollover_threshold: u64,
}

/// A quality-of-service cube selectable by flow requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QosCube {
    pub id: u32,
    pub name: String,
    pub partial_delivery: bool,
    pub ordered_delivery: bool,
    pub max_allowable_gap: i32,
    pub average_bandwidth: u64,
    pub delay: u32,
    pub jitter: u32,
    pub efcp_policies: EfcpPolicies,
}

/// Address prefix delegated to an organization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AddressPrefix {
    pub address_prefix: u32,
    pub organization: String,
}

/// Statically configured address of a known IPCP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KnownIpcpAddress {
    pub ap_name: String,
    pub ap_instance: String,
    pub address: u32,
}

/// Authentication and SDU-protection profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthProfile {
    pub auth_policy: PolicyConfig,
    pub encrypt_policy: PolicyConfig,
    pub crc_policy: PolicyConfig,
    pub ttl_policy: PolicyConfig,
}

impl AuthProfile {
    pub fn is_unset(&self) -> bool {
        self.auth_policy.is_unset()
    }
}

/// Security-manager section of a template: a default profile plus per
/// supporting-DIF overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityManagerConfig {
    pub policy_set: PolicyConfig,
    pub default_auth_profile: AuthProfile,
    pub specific_auth_profiles: BTreeMap<String, AuthProfile>,
}

impl SecurityManagerConfig {
    pub fn is_unset(&self) -> bool {
        self.policy_set.is_unset() && self.default_auth_profile.is_unset()
    }

    /// Profile to use when enrolling over `supporting_dif`.
    pub fn profile_for(&self, supporting_dif: &str) -> &AuthProfile {
        self.specific_auth_profiles
            .get(supporting_dif)
            .unwrap_or(&self.default_auth_profile)
    }
}

/// A name-keyed bundle of everything a new IPCP needs on assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DifTemplate {
    /// Template name; the filename, not part of the JSON body.
    #[serde(skip)]
    pub name: String,
    pub dif_type: String,
    pub data_transfer_constants: DataTransferConstants,
    pub qos_cubes: Vec<QosCube>,
    pub efcp_policy_set: PolicyConfig,
    pub rmt_policy_set: PolicyConfig,
    pub pft_policy_set: PolicyConfig,
    pub fa_policy_set: PolicyConfig,
    pub routing_policy_set: PolicyConfig,
    pub pff_generator_policy_set: PolicyConfig,
    pub nsm_policy_set: PolicyConfig,
    pub address_prefixes: Vec<AddressPrefix>,
    pub known_ipcp_addresses: Vec<KnownIpcpAddress>,
    pub enrollment_task: PolicyConfig,
    pub security_manager: SecurityManagerConfig,
    pub config_parameters: BTreeMap<String, String>,
}

impl DifTemplate {
    /// Looks up the static address configured for `ipcp_name`.
    pub fn lookup_ipcp_address(&self, ipcp_name: &AppName) -> Option<u32> {
        self.known_ipcp_addresses
            .iter()
            .find(|k| {
                k.ap_name == ipcp_name.process_name
                    && (k.ap_instance.is_empty() || k.ap_instance == ipcp_name.process_instance)
            })
            .map(|k| k.address)
    }

    /// Fills fields that are empty or zero in `self` from `default`.
    fn augment_from(&mut self, default: &DifTemplate) {
        if self.data_transfer_constants.is_unset() {
            self.data_transfer_constants = default.data_transfer_constants.clone();
        }
        if self.qos_cubes.is_empty() {
            self.qos_cubes = default.qos_cubes.clone();
        }
        if self.efcp_policy_set.is_unset() {
            self.efcp_policy_set = default.efcp_policy_set.clone();
        }
        if self.rmt_policy_set.is_unset() {
            self.rmt_policy_set = default.rmt_policy_set.clone();
        }
        if self.pft_policy_set.is_unset() {
            self.pft_policy_set = default.pft_policy_set.clone();
        }
        if self.fa_policy_set.is_unset() {
            self.fa_policy_set = default.fa_policy_set.clone();
        }
        if self.routing_policy_set.is_unset() {
            self.routing_policy_set = default.routing_policy_set.clone();
        }
        if self.pff_generator_policy_set.is_unset() {
            self.pff_generator_policy_set = default.pff_generator_policy_set.clone();
        }
        if self.nsm_policy_set.is_unset() {
            self.nsm_policy_set = default.nsm_policy_set.clone();
        }
        if self.address_prefixes.is_empty() {
            self.address_prefixes = default.address_prefixes.clone();
        }
        if self.known_ipcp_addresses.is_empty() {
            self.known_ipcp_addresses = default.known_ipcp_addresses.clone();
        }
        if self.enrollment_task.is_unset() {
            self.enrollment_task = default.enrollment_task.clone();
        }
        if self.security_manager.is_unset() {
            self.security_manager = default.security_manager.clone();
        }
        if self.config_parameters.is_empty() {
            self.config_parameters = default.config_parameters.clone();
        }
    }
}

/// Configuration bundle synthesised from a template for one assign-to-DIF.
///
/// A copy travels with the assign command, so removing the template later
/// does not retroactively invalidate an assigned IPCP.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DifConfig {
    /// Address of this IPCP inside the DIF (0 for shims)
    pub address: u32,
    pub data_transfer_constants: DataTransferConstants,
    pub qos_cubes: Vec<QosCube>,
    pub efcp_policy_set: PolicyConfig,
    pub rmt_policy_set: PolicyConfig,
    pub pft_policy_set: PolicyConfig,
    pub fa_policy_set: PolicyConfig,
    pub routing_policy_set: PolicyConfig,
    pub pff_generator_policy_set: PolicyConfig,
    pub nsm_policy_set: PolicyConfig,
    pub address_prefixes: Vec<AddressPrefix>,
    pub known_ipcp_addresses: Vec<KnownIpcpAddress>,
    pub enrollment_task: PolicyConfig,
    pub security_manager: SecurityManagerConfig,
    pub parameters: BTreeMap<String, String>,
}

/// Full information for assigning an IPCP to a DIF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DifInfo {
    pub dif_name: String,
    pub dif_type: String,
    pub config: DifConfig,
}

/// The template store plus its directory watcher.
#[derive(Debug, Default)]
pub struct DifTemplateManager {
    templates: RwLock<HashMap<String, DifTemplate>>,
    default_template: RwLock<Option<DifTemplate>>,
}

impl DifTemplateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the template called `name`.
    pub async fn get(&self, name: &str) -> Option<DifTemplate> {
        self.templates.read().await.get(name).cloned()
    }

    /// Adds or replaces a template, reapplying the default merge.
    ///
    /// Adding the default template re-augments every stored template, only
    /// filling fields that are still empty.
    pub async fn add(&self, name: &str, mut template: DifTemplate) {
        template.name = name.to_string();

        if name == DEFAULT_TEMPLATE_NAME {
            let mut templates = self.templates.write().await;
            for t in templates.values_mut() {
                t.augment_from(&template);
            }
            templates.insert(name.to_string(), template.clone());
            *self.default_template.write().await = Some(template);
        } else {
            if let Some(default) = self.default_template.read().await.as_ref() {
                template.augment_from(default);
            }
            self.templates.write().await.insert(name.to_string(), template);
        }
        info!(template = name, "added DIF template");
    }

    /// Removes a template by name. Assigned IPCPs are unaffected.
    pub async fn remove(&self, name: &str) {
        if self.templates.write().await.remove(name).is_some() {
            info!(template = name, "removed DIF template");
        }
        if name == DEFAULT_TEMPLATE_NAME {
            warn!("default DIF template removed");
            *self.default_template.write().await = None;
        }
    }

    /// Names of all stored templates.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Parses every template in `dir`, loading the default first so the merge
    /// applies to all siblings.
    pub async fn load_directory(&self, dir: &Path) -> Result<(), TemplateLoadError> {
        let mut names: Vec<PathBuf> = Vec::new();
        let mut rd = tokio::fs::read_dir(dir).await?;
        while let Some(dent) = rd.next_entry().await? {
            if dent.file_type().await?.is_file() {
                names.push(dent.path());
            }
        }
        names.sort_by_key(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n != DEFAULT_TEMPLATE_NAME)
                .unwrap_or(true)
        });

        for path in names {
            let Some(name) = template_name(&path) else {
                continue;
            };
            match parse_template_file(&path).await {
                Ok(template) => self.add(&name, template).await,
                Err(e) => warn!(file = %path.display(), error = %e, "skipping unreadable DIF template"),
            }
        }
        Ok(())
    }

    /// Watches `dir` until cancelled, reloading templates whose files change
    /// and dropping templates whose files disappear.
    pub async fn run_watcher(&self, dir: PathBuf, cancel: CancellationToken) {
        let mut seen: HashMap<String, SystemTime> = HashMap::new();
        debug!(dir = %dir.display(), "DIF template monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
            }

            let mut current: HashMap<String, (PathBuf, SystemTime)> = HashMap::new();
            let Ok(mut rd) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(dent)) = rd.next_entry().await {
                let path = dent.path();
                let Some(name) = template_name(&path) else {
                    continue;
                };
                let Ok(meta) = dent.metadata().await else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                current.insert(name, (path, mtime));
            }

            for (name, (path, mtime)) in &current {
                if seen.get(name) != Some(mtime) {
                    match parse_template_file(path).await {
                        Ok(template) => {
                            self.add(name, template).await;
                            seen.insert(name.clone(), *mtime);
                        }
                        Err(e) => {
                            warn!(file = %path.display(), error = %e,
                                  "ignoring partial or corrupt DIF template");
                        }
                    }
                }
            }

            let gone: Vec<String> = seen
                .keys()
                .filter(|name| !current.contains_key(*name))
                .cloned()
                .collect();
            for name in gone {
                seen.remove(&name);
                self.remove(&name).await;
            }
        }

        debug!("DIF template monitor stopped");
    }
}

/// Template name for a directory entry, or `None` for editor temp files.
fn template_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.contains(".swp") || name.contains(".swx") || name.contains('~') {
        return None;
    }
    Some(name.to_string())
}

async fn parse_template_file(path: &Path) -> Result<DifTemplate, TemplateLoadError> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&contents)?)
}
