/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Service configuration.
//!
//! The allocator reads one YAML file; every key is optional and falls back
//! to the default shown here:
//! ```yaml
//! keepalive_sweep_secs: 30
//! allocation_period_secs: 5
//! bmp_period_secs: 10
//! recheck_period_secs: 15
//! consolidation_period_secs: 3600
//! importance_span: 10000
//! allocation_retry_window_secs: 3600
//! default_keepalive_secs: 60
//! min_keepalive_secs: 30
//! max_keepalive_secs: 300
//! worker_threads: 4
//! priority_scale:
//!   size: 1.0
//!   dimensions: 1.5
//!   specific_board: 65.0
//! bmp:
//!   power_attempts: 2
//!   fpga_attempts: 3
//!   timeout_ms: 500
//!   power_on_timeout_ms: 10000
//!   retries: 3
//!   blacklist_sync: true
//!   dummy: false
//! ```
//!
//! Machine definitions live in a separate JSON file; see [`machine`].

pub mod machine;

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use spalloc_comms::transceiver::udp::TransceiverConfig;
use tracing::{debug, info};

use crate::bmp::BmpSettings;
use crate::jobs::{JobPolicy, PriorityScale};

// ── Sections ──────────────────────────────────────────────────────────────────

/// The `bmp:` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BmpConfig {
    pub power_attempts: u32,
    pub fpga_attempts: u32,
    /// Per-packet reply deadline.
    pub timeout_ms: u64,
    pub power_on_timeout_ms: u64,
    /// Packet-level attempts inside the transceiver.
    pub retries: u32,
    pub blacklist_sync: bool,
    /// Talk to in-memory boards instead of real BMPs.
    pub dummy: bool,
}

impl Default for BmpConfig {
    fn default() -> Self {
        Self {
            power_attempts: 2,
            fpga_attempts: 3,
            timeout_ms: 500,
            power_on_timeout_ms: 10_000,
            retries: 3,
            blacklist_sync: true,
            dummy: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    pub keepalive_sweep_secs: u64,
    pub allocation_period_secs: u64,
    pub bmp_period_secs: u64,
    pub recheck_period_secs: u64,
    pub consolidation_period_secs: u64,
    pub importance_span: i64,
    pub allocation_retry_window_secs: i64,
    pub default_keepalive_secs: i64,
    pub min_keepalive_secs: i64,
    pub max_keepalive_secs: i64,
    /// BMPs driven in parallel.
    pub worker_threads: usize,
    pub priority_scale: PriorityScale,
    pub bmp: BmpConfig,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            keepalive_sweep_secs: 30,
            allocation_period_secs: 5,
            bmp_period_secs: 10,
            recheck_period_secs: 15,
            consolidation_period_secs: 3600,
            importance_span: 10_000,
            allocation_retry_window_secs: 3600,
            default_keepalive_secs: 60,
            min_keepalive_secs: 30,
            max_keepalive_secs: 300,
            worker_threads: 4,
            priority_scale: PriorityScale::default(),
            bmp: BmpConfig::default(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl AllocatorConfig {
    /// Parse and validate the YAML file at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid YAML, or
    /// holds values that make no sense together.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading allocator configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;

        // An empty document means "all defaults".
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?
        };
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        debug!(?config, "allocator configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("keepalive_sweep_secs", self.keepalive_sweep_secs),
            ("allocation_period_secs", self.allocation_period_secs),
            ("bmp_period_secs", self.bmp_period_secs),
            ("recheck_period_secs", self.recheck_period_secs),
            ("consolidation_period_secs", self.consolidation_period_secs),
        ];
        for (name, value) in periods {
            if value == 0 {
                bail!("{name} must be positive");
            }
        }
        if self.min_keepalive_secs <= 0 || self.min_keepalive_secs > self.max_keepalive_secs {
            bail!(
                "keepalive bounds {}..{} are not a valid range",
                self.min_keepalive_secs,
                self.max_keepalive_secs
            );
        }
        if self.importance_span < 0 {
            bail!("importance_span must not be negative");
        }
        if self.worker_threads == 0 {
            bail!("worker_threads must be positive");
        }
        if self.bmp.power_attempts == 0 || self.bmp.retries == 0 {
            bail!("bmp.power_attempts and bmp.retries must be positive");
        }
        Ok(())
    }

    // ── Derived settings ──────────────────────────────────────────────────────

    pub fn job_policy(&self) -> JobPolicy {
        JobPolicy {
            importance_span: self.importance_span,
            allocation_retry_window: chrono::Duration::seconds(self.allocation_retry_window_secs),
            default_keepalive: chrono::Duration::seconds(self.default_keepalive_secs),
            min_keepalive: chrono::Duration::seconds(self.min_keepalive_secs),
            max_keepalive: chrono::Duration::seconds(self.max_keepalive_secs),
            priority_scale: self.priority_scale,
        }
    }

    pub fn bmp_settings(&self) -> BmpSettings {
        BmpSettings {
            power_attempts: self.bmp.power_attempts,
            fpga_attempts: self.bmp.fpga_attempts,
            blacklist_sync: self.bmp.blacklist_sync,
            parallelism: self.worker_threads,
        }
    }

    pub fn transceiver_config(&self) -> TransceiverConfig {
        TransceiverConfig {
            timeout: Duration::from_millis(self.bmp.timeout_ms),
            power_on_timeout: Duration::from_millis(self.bmp.power_on_timeout_ms),
            retries: self.bmp.retries,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
