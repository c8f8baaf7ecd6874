//! Per-project `.ddash.json` config.
//!
//! Only `domains` feeds the proxy. The other typed fields describe the sandbox
//! and are written back as loaded; keys outside this struct are not kept.

use crate::error::{CliError, Result};
use ddash_proxy::Decision;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;

/// Schema version written into newly created configs.
const CONFIG_VERSION: &str = "1";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub isolation: String,
    #[serde(default)]
    pub allow_net: Vec<String>,
    #[serde(default)]
    pub allow_read: Vec<String>,
    #[serde(default)]
    pub allow_write: Vec<String>,
    /// Domain -> decision token (`allow`, `deny`, `always`, `never`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub domains: BTreeMap<String, String>,
}

impl ProjectConfig {
    /// Fresh config stamped with the current time.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: CONFIG_VERSION.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            isolation: "default".to_string(),
            ..Default::default()
        }
    }

    /// Load the config at `path`. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No project config at {}", path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(CliError::ReadConfig {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| CliError::ParseConfig {
                path: path.to_path_buf(),
                source: e,
            })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        std::fs::write(path, json).map_err(|e| CliError::WriteConfig {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Domain tokens in the shape the proxy takes.
    pub fn domain_tokens(&self) -> HashMap<String, String> {
        self.domains
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Record `always`/`never` decisions, overwriting older entries.
    ///
    /// Session-only decisions are ignored. Returns how many entries changed.
    pub fn merge_persistent(&mut self, decisions: &HashMap<String, Decision>) -> usize {
        let mut changed = 0;
        for (domain, decision) in decisions {
            if !decision.is_persistent() {
                continue;
            }
            let token = decision.as_str().to_string();
            if self.domains.get(domain) != Some(&token) {
                self.domains.insert(domain.clone(), token);
                changed += 1;
            }
        }
        changed
    }
}

/// Project name for a new config: the directory holding it.
pub fn project_name(config_path: &Path) -> String {
    let dir = match config_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_default(),
    };
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string())
}
