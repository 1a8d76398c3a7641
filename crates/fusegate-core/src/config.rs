// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount configuration

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BridgeResult;

/// Environment variable that forces per-call dispatch logging on
pub const DEBUG_ENV: &str = "FUSEGATE_DEBUG";

/// Default filesystem name reported to the kernel
pub const DEFAULT_FSNAME: &str = "fusegate";

/// Everything a mount needs besides its handlers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub mount_point: PathBuf,
    /// Log every dispatched call at INFO instead of TRACE
    pub debug: bool,
    /// Extra transport options, in order (`allow_other`, `fsname=...`)
    pub options: Vec<String>,
    /// How long the kernel may cache attributes
    pub attr_ttl_ms: u64,
    /// How long the kernel may cache name lookups
    pub entry_ttl_ms: u64,
    /// Threads carrying kernel requests into the bridge; 0 keeps them on
    /// the session thread
    pub workers: usize,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::new(),
            debug: false,
            options: Vec::new(),
            attr_ttl_ms: 10_000,
            entry_ttl_ms: 10_000,
            workers: 4,
        }
    }
}

impl MountConfig {
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
            ..Self::default()
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> BridgeResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply `FUSEGATE_DEBUG=1|true` on top of the loaded values
    pub fn apply_env(mut self) -> Self {
        if std::env::var(DEBUG_ENV)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
        {
            self.debug = true;
        }
        self
    }

    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(self.attr_ttl_ms)
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_millis(self.entry_ttl_ms)
    }
}
