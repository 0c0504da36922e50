// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! Daemon configuration
//!
//! Supports both command-line arguments and a TOML configuration file.
//! Also loads the optional application-to-DIF map, a JSON file keyed by
//! encoded application names.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::mobility::MobilityConfig;

/// Directory scanned for DIF templates when none is configured.
pub const DEFAULT_TEMPLATE_DIR: &str = "/etc/ipcmd/dif-templates";

/// Command-line arguments for the daemon
#[derive(Parser, Debug)]
#[command(name = "ipcmd")]
#[command(about = "RINA IPC manager daemon", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file (overrides other arguments)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory holding the DIF templates
    #[arg(long, value_name = "DIR")]
    pub template_dir: Option<PathBuf>,

    /// JSON file mapping encoded application names to DIF names
    #[arg(long, value_name = "FILE")]
    pub app_map: Option<PathBuf>,

    /// Log filter, e.g. "info" or "ipcmd=debug"
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub daemon: DaemonSection,
    pub mobility: Option<MobilityConfig>,
}

/// Daemon section of the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub template_dir: PathBuf,
    pub app_map_file: Option<PathBuf>,
    pub log_level: String,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            template_dir: PathBuf::from(DEFAULT_TEMPLATE_DIR),
            app_map_file: None,
            log_level: "info".to_string(),
        }
    }
}

/// Unified configuration after parsing CLI or file
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub template_dir: PathBuf,
    pub app_map_file: Option<PathBuf>,
    pub log_level: String,
    pub mobility: Option<MobilityConfig>,
}

impl DaemonConfig {
    /// Creates configuration from command-line arguments
    pub fn from_cli(args: CliArgs) -> Result<Self, String> {
        let mut config = match args.config {
            Some(path) => Self::from_file(&path)?,
            None => Self {
                template_dir: PathBuf::from(DEFAULT_TEMPLATE_DIR),
                app_map_file: None,
                log_level: "info".to_string(),
                mobility: None,
            },
        };

        // CLI flags win over the file.
        if let Some(dir) = args.template_dir {
            config.template_dir = dir;
        }
        if let Some(map) = args.app_map {
            config.app_map_file = Some(map);
        }
        if let Some(level) = args.log_level {
            config.log_level = level;
        }
        Ok(config)
    }

    /// Loads configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self, String> {
        let contents =
            fs::read_to_string(path).map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: TomlConfig =
            toml::from_str(&contents).map_err(|e| format!("Failed to parse TOML config: {}", e))?;

        Ok(Self {
            template_dir: config.daemon.template_dir,
            app_map_file: config.daemon.app_map_file,
            log_level: config.daemon.log_level,
            mobility: config.mobility,
        })
    }
}

/// Loads the application-to-DIF map file: JSON object from encoded
/// application name (`AP-name|AP-instance|AE-name|AE-instance`) to DIF name.
pub fn load_app_map(path: &PathBuf) -> Result<HashMap<String, String>, String> {
    let contents =
        fs::read_to_string(path).map_err(|e| format!("Failed to read app map file: {}", e))?;
    serde_json::from_str(&contents).map_err(|e| format!("Failed to parse app map JSON: {}", e))
}
