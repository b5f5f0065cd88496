// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The local-cache seam: configuration, user provision scripts, and virtual
//! parameter names are owned by the host process and read through this
//! trait. The in-memory implementation backs tests and single-process
//! deployments.

use std::collections::{HashMap, HashSet};

use anyhow::{Result, ensure};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cfg::CwmpConfig;

/// Read-mostly, process-global store the engine consults for configuration
/// and script metadata.
///
/// `snapshot` returns an opaque revision token; the other calls are
/// answered as of that token so one session observes one consistent cache
/// generation even while the host reloads scripts.
#[async_trait]
pub trait LocalCache: Send + Sync {
    /// Current cache generation token.
    async fn snapshot(&self) -> Result<String>;

    /// Resolved `cwmp.*` configuration as of `snapshot`.
    async fn config(&self, snapshot: &str) -> Result<CwmpConfig>;

    /// Names of user-defined provision scripts as of `snapshot`.
    async fn provisions(&self, snapshot: &str) -> Result<HashSet<String>>;

    /// Names of virtual parameters as of `snapshot`.
    async fn virtual_parameters(&self, snapshot: &str) -> Result<HashSet<String>>;
}

/// In-memory [`LocalCache`]. Mutations bump the generation counter; reads
/// validate the caller's token so a stale session is told to refresh.
#[derive(Debug, Default)]
pub struct MemoryCache {
    config: DashMap<String, String>,
    provisions: DashMap<String, String>,
    virtual_parameters: DashMap<String, String>,
    generation: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_config_key(&self, key: impl Into<String>, value: impl Into<String>) {
        self.config.insert(key.into(), value.into());
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn put_provision(&self, name: impl Into<String>, script: impl Into<String>) {
        self.provisions.insert(name.into(), script.into());
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn put_virtual_parameter(
        &self,
        name: impl Into<String>,
        script: impl Into<String>,
    ) {
        self.virtual_parameters.insert(name.into(), script.into());
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn check_token(&self, token: &str) -> Result<()> {
        let current = self.generation.load(Ordering::SeqCst).to_string();
        ensure!(
            token == current,
            "stale cache snapshot {token:?}, current is {current:?}"
        );
        Ok(())
    }
}

#[async_trait]
impl LocalCache for MemoryCache {
    async fn snapshot(&self) -> Result<String> {
        Ok(self.generation.load(Ordering::SeqCst).to_string())
    }

    async fn config(&self, snapshot: &str) -> Result<CwmpConfig> {
        self.check_token(snapshot)?;
        let map: HashMap<String, String> = self
            .config
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        CwmpConfig::from_kv(&map)
    }

    async fn provisions(&self, snapshot: &str) -> Result<HashSet<String>> {
        self.check_token(snapshot)?;
        Ok(self.provisions.iter().map(|e| e.key().clone()).collect())
    }

    async fn virtual_parameters(&self, snapshot: &str) -> Result<HashSet<String>> {
        self.check_token(snapshot)?;
        Ok(self
            .virtual_parameters
            .iter()
            .map(|e| e.key().clone())
            .collect())
    }
}
