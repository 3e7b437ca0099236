//! Durable route and process registry.
//!
//! Two JSON maps live under the config directory: `routes.json`
//! (`host → port`) and `processes.json` (`projectRoot → record`). Every
//! write goes through a sibling `.tmp` file followed by an atomic rename,
//! so the files on disk are always the previous or the new committed
//! state. Every mutation re-loads the file first; an internal async mutex
//! sequences mutations across concurrent connection handlers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::devproc;

/// A `host → port` mapping served by the proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub host: String,
    pub port: u16,
}

/// Registry record for a running dev server, keyed by project root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub project_root: PathBuf,
    pub pid: i32,
    pub host: String,
    pub port: u16,
    pub started_at: DateTime<Utc>,
}

impl ProcessRecord {
    /// A record is live iff its PID exists; anything else is stale.
    pub fn is_live(&self) -> bool {
        devproc::is_alive(self.pid)
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    routes_path: PathBuf,
    processes_path: PathBuf,
    domain_suffix: String,
    /// Suffixes that are valid route keys as-is (the hosts-file synced
    /// set); everything else gets the domain suffix appended.
    extra_suffixes: Vec<String>,
    /// Serializes load→mutate→rename sequences across handler tasks.
    write_guard: Arc<Mutex<()>>,
}

impl Registry {
    pub fn new(config: &Config) -> Self {
        Self {
            routes_path: config.routes_path(),
            processes_path: config.processes_path(),
            domain_suffix: config.domain_suffix().to_string(),
            extra_suffixes: config.hosts_file_suffixes().to_vec(),
            write_guard: Arc::new(Mutex::new(())),
        }
    }

    /// Append the domain suffix unless the host already carries it or one
    /// of the hosts-file suffixes.
    pub fn normalize_host(&self, host: &str) -> String {
        if host.ends_with(&self.domain_suffix)
            || self
                .extra_suffixes
                .iter()
                .any(|suffix| host.ends_with(suffix.as_str()))
        {
            host.to_string()
        } else {
            format!("{host}{}", self.domain_suffix)
        }
    }

    /// Load `routes.json`. Missing or empty file is an empty map; legacy
    /// un-suffixed keys are normalized in place (persisted by the next
    /// save).
    pub async fn load_routes(&self) -> Result<BTreeMap<String, u16>> {
        let raw: BTreeMap<String, u16> = load_map(&self.routes_path).await?;
        Ok(raw
            .into_iter()
            .map(|(host, port)| (self.normalize_host(&host), port))
            .collect())
    }

    async fn save_routes(&self, routes: &BTreeMap<String, u16>) -> Result<()> {
        save_map(&self.routes_path, routes).await
    }

    pub async fn upsert_route(&self, host: &str, port: u16) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let mut routes = self.load_routes().await?;
        routes.insert(self.normalize_host(host), port);
        self.save_routes(&routes).await
    }

    /// The port mapped to `host`, if any.
    pub async fn get_route(&self, host: &str) -> Result<Option<u16>> {
        let routes = self.load_routes().await?;
        Ok(routes.get(&self.normalize_host(host)).copied())
    }

    pub async fn list_routes(&self) -> Result<Vec<Route>> {
        let routes = self.load_routes().await?;
        Ok(routes
            .into_iter()
            .map(|(host, port)| Route { host, port })
            .collect())
    }

    /// Drop every route. Routes are otherwise never deleted, only parked.
    pub async fn clear_routes(&self) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        self.save_routes(&BTreeMap::new()).await
    }

    async fn load_processes(&self) -> Result<BTreeMap<PathBuf, ProcessRecord>> {
        load_map(&self.processes_path).await
    }

    async fn save_processes(&self, processes: &BTreeMap<PathBuf, ProcessRecord>) -> Result<()> {
        save_map(&self.processes_path, processes).await
    }

    pub async fn set_process(&self, record: ProcessRecord) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let mut processes = self.load_processes().await?;
        processes.insert(record.project_root.clone(), record);
        self.save_processes(&processes).await
    }

    pub async fn get_process(&self, project_root: &Path) -> Result<Option<ProcessRecord>> {
        let processes = self.load_processes().await?;
        Ok(processes.get(project_root).cloned())
    }

    pub async fn clear_process(&self, project_root: &Path) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let mut processes = self.load_processes().await?;
        processes.remove(project_root);
        self.save_processes(&processes).await
    }

    pub async fn list_processes(&self) -> Result<Vec<ProcessRecord>> {
        let processes = self.load_processes().await?;
        Ok(processes.into_values().collect())
    }

    /// Remove records whose PID no longer exists. Persists once, and only
    /// when something was removed. Returns the number removed.
    pub async fn cleanup_stale_processes(&self) -> Result<usize> {
        let _guard = self.write_guard.lock().await;
        let mut processes = self.load_processes().await?;
        let before = processes.len();
        processes.retain(|_, record| record.is_live());
        let removed = before - processes.len();

        if removed > 0 {
            self.save_processes(&processes).await?;
        }
        Ok(removed)
    }
}

/// Read a JSON object file into a map. Missing file and empty file are the
/// empty map; a parse failure surfaces without touching the file.
async fn load_map<K, V>(path: &Path) -> Result<BTreeMap<K, V>>
where
    K: Ord + for<'de> Deserialize<'de>,
    V: for<'de> Deserialize<'de>,
{
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };

    if data.is_empty() {
        return Ok(BTreeMap::new());
    }

    serde_json::from_slice(&data).with_context(|| format!("failed to parse {}", path.display()))
}

/// Write a map as 2-space-indented JSON through a sibling `.tmp` file and
/// an atomic rename. On rename failure the temp file is removed
/// best-effort.
async fn save_map<K, V>(path: &Path, map: &BTreeMap<K, V>) -> Result<()>
where
    K: Ord + Serialize,
    V: Serialize,
{
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let data = serde_json::to_vec_pretty(map).context("failed to serialize registry map")?;

    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);

    tokio::fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;

    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err).with_context(|| format!("failed to rename {} into place", tmp_path.display()));
    }

    Ok(())
}
