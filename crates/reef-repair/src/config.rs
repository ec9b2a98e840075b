//! TOML configuration for repair coordination.
//!
//! When no config file is provided, [`RepairConfig::auto_detect`] probes the
//! system RAM via `/proc/meminfo` and sizes the repair memory budget from it.

use std::path::Path;

use serde::Deserialize;

use crate::error::RepairError;

/// Memory budget used when nothing is configured and RAM cannot be probed.
const DEFAULT_MAX_REPAIR_MEMORY: u64 = 256 * 1024 * 1024;

/// Share of system RAM given to repair when auto-detecting.
const AUTO_MEMORY_DIVISOR: u64 = 10;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Repair tuning.
    pub repair: RepairSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[repair]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RepairSection {
    /// Memory budget shared by concurrently running range repairs
    /// (e.g. `"256MB"`, `"2GB"`, or raw bytes).
    pub max_memory: Option<String>,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl RepairConfig {
    /// Load config from a TOML file, or auto-detect if no path given.
    pub fn load(path: Option<&Path>) -> Result<Self, RepairError> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                Self::from_toml(&content)
            }
            None => Ok(Self::auto_detect()),
        }
    }

    /// Parse and validate config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, RepairError> {
        let config: RepairConfig = toml::from_str(s)?;
        if let Some(raw) = config.repair.max_memory.as_deref() {
            parse_size(raw)?;
        }
        Ok(config)
    }

    /// Build a config sized to the machine: a tenth of system RAM.
    pub fn auto_detect() -> Self {
        let mut config = Self::default();
        if let Some(ram) = detect_total_ram() {
            config.repair.max_memory = Some((ram / AUTO_MEMORY_DIVISOR).to_string());
        }
        config
    }

    /// Effective repair memory budget in bytes. Defaults to 256 MB.
    pub fn max_repair_memory_bytes(&self) -> u64 {
        self.repair
            .max_memory
            .as_deref()
            .and_then(|s| parse_size(s).ok())
            .unwrap_or(DEFAULT_MAX_REPAIR_MEMORY)
    }
}

/// Parse a human-readable size into bytes.
///
/// Supports: `"2GB"`, `"256MB"`, `"512KB"`, `"1048576"` (raw bytes).
fn parse_size(s: &str) -> Result<u64, RepairError> {
    let s = s.trim();
    let (num, multiplier) = if let Some(num) = s.strip_suffix("GB") {
        (num, 1_073_741_824)
    } else if let Some(num) = s.strip_suffix("MB") {
        (num, 1_048_576)
    } else if let Some(num) = s.strip_suffix("KB") {
        (num, 1_024)
    } else {
        (s, 1)
    };
    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| RepairError::Config(format!("invalid size: {s:?}")))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| RepairError::Config(format!("size out of range: {s:?}")))
}

/// Detect total system RAM in bytes by reading `/proc/meminfo`.
///
/// Returns `None` on non-Linux platforms or if the file cannot be read.
fn detect_total_ram() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}
