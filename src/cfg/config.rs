// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// The `cwmp.*` configuration surface of the session engine.
///
/// Field names mirror the flat dotted keys delivered by the local cache
/// (`cwmp.gpvBatchSize`, …); the same values can be loaded from a YAML file
/// under a `cwmp:` table.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CwmpConfig {
    /// Commit rounds (read + update pairs) allowed per cycle.
    pub max_commit_iterations: u32,
    /// Total RPCs allowed per session.
    pub max_rpc_count: u32,
    /// Seconds before a pending Download operation times out.
    pub download_timeout: u64,
    /// Synthesize a successful TransferComplete when a download times out.
    pub download_success_on_timeout: bool,
    /// Maximum parameters per GPV/SPV/GPA/SPA request.
    pub gpv_batch_size: usize,
    /// Depth from which the GPN planner weighs single-hop against deep
    /// discovery.
    pub gpn_next_level: usize,
    /// Never emit a root-level GetParameterNames.
    pub skip_root_gpn: bool,
    /// Bypass writability checks when planning mutations.
    pub skip_writable_check: bool,
    /// Keep milliseconds when formatting xsd:dateTime values for SPV.
    pub datetime_milliseconds: bool,
    /// Emit booleans as `true`/`false` rather than `1`/`0`.
    pub boolean_literal: bool,
    /// Path prefixes reported by the CPE that the host wants ignored.
    pub ignored_paths: Vec<String>,
}

impl Default for CwmpConfig {
    fn default() -> Self {
        Self {
            max_commit_iterations: 32,
            max_rpc_count: 255,
            download_timeout: 3600,
            download_success_on_timeout: false,
            gpv_batch_size: 32,
            gpn_next_level: 0,
            skip_root_gpn: false,
            skip_writable_check: false,
            datetime_milliseconds: false,
            boolean_literal: true,
            ignored_paths: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug)]
struct ConfigFile {
    cwmp: CwmpConfig,
}

impl CwmpConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let file: ConfigFile =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        let mut cfg = file.cwmp;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Builds the configuration from the flat `cwmp.*` key/value map the
    /// local cache hands out. Unknown keys are ignored so hosts can carry
    /// settings for other components in the same table.
    pub fn from_kv(map: &HashMap<String, String>) -> Result<Self> {
        let mut cfg = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "cwmp.maxCommitIterations" => {
                    cfg.max_commit_iterations = parse(key, value)?;
                },
                "cwmp.maxRpcCount" => cfg.max_rpc_count = parse(key, value)?,
                "cwmp.downloadTimeout" => cfg.download_timeout = parse(key, value)?,
                "cwmp.downloadSuccessOnTimeout" => {
                    cfg.download_success_on_timeout = parse_bool(key, value)?;
                },
                "cwmp.gpvBatchSize" => cfg.gpv_batch_size = parse(key, value)?,
                "cwmp.gpnNextLevel" => cfg.gpn_next_level = parse(key, value)?,
                "cwmp.skipRootGpn" => cfg.skip_root_gpn = parse_bool(key, value)?,
                "cwmp.skipWritableCheck" => {
                    cfg.skip_writable_check = parse_bool(key, value)?;
                },
                "cwmp.datetimeMilliseconds" => {
                    cfg.datetime_milliseconds = parse_bool(key, value)?;
                },
                "cwmp.booleanLiteral" => cfg.boolean_literal = parse_bool(key, value)?,
                "cwmp.ignoredPaths" => {
                    cfg.ignored_paths = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                },
                _ => {},
            }
        }
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.max_commit_iterations >= 1,
            "cwmp.maxCommitIterations must be >= 1"
        );
        ensure!(
            (1..=255).contains(&self.max_rpc_count),
            "cwmp.maxRpcCount must be in 1..=255"
        );
        ensure!(self.gpv_batch_size >= 1, "cwmp.gpvBatchSize must be >= 1");
        Ok(())
    }

    /// Iteration quota of one cycle; a commit round costs two iterations
    /// (read phase, update phase).
    pub fn max_iterations(&self) -> u32 {
        self.max_commit_iterations * 2
    }

    /// True when the host blacklisted this parameter path.
    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignored_paths
            .iter()
            .any(|prefix| path == prefix || path.starts_with(&format!("{prefix}.")))
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid value {value:?} for {key}"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => anyhow::bail!("invalid boolean {other:?} for {key}"),
    }
}

/// Resolves a possibly relative config path against the working directory.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };
    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}
