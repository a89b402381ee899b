//! Node configuration stored at `<node>/config.json`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

const CONFIG_FILE: &str = "config.json";

/// How the relation resolver treats a URI nothing can resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    /// Fail the batch with `RelationUnresolved`
    #[default]
    Strict,
    /// Store an external reference placeholder and continue
    Lenient,
}

/// Tunables for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Allow commits that carry no revisions.
    pub allow_empty_commits: bool,
    pub resolution_mode: ResolutionMode,
    /// Re-commit entities whose external references have become resolvable
    /// at the end of every ingest.
    pub reconcile_provisional: bool,
    /// Concurrent datasource fetches while resolving relations.
    pub fetch_concurrency: usize,
    /// Entries in the block read cache.
    pub block_cache_capacity: usize,
    /// Largest block the importer accepts, in bytes.
    pub max_block_size: usize,
    /// Size of the in-process pipe behind a streamed export.
    pub export_buffer_size: usize,
    pub list_page_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            allow_empty_commits: false,
            resolution_mode: ResolutionMode::Strict,
            reconcile_provisional: true,
            fetch_concurrency: 8,
            block_cache_capacity: 4096,
            max_block_size: 8 * 1024 * 1024,
            export_buffer_size: 64 * 1024,
            list_page_size: 100,
        }
    }
}

impl NodeConfig {
    /// Load from a node directory; a missing file yields the defaults.
    pub fn load(node_path: &Path) -> Result<Self> {
        let config_path = node_path.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        serde_json::from_str(&data)
            .map_err(|e| Error::Decoding(format!("Failed to parse {:?}: {}", config_path, e)))
    }

    /// Save into a node directory, replacing any previous file atomically.
    pub fn save(&self, node_path: &Path) -> Result<()> {
        let config_path = node_path.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self).map_err(|e| Error::Encoding(e.to_string()))?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }
}
