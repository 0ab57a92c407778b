//! Server configuration and node inventory loading.

use std::path::{Path, PathBuf};

use atelier_core::error::{CoreError, CoreResult};
use atelier_core::types::NodeConfig;
use serde::Deserialize;

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development; override via
/// environment variables in production.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Path to the node inventory YAML (default: `config/nodes.yaml`).
    pub nodes_config_path: PathBuf,
    /// Directory holding workflow templates (default: `templates/workflows`).
    pub templates_dir: PathBuf,
    /// Seconds between health-probe ticks (default: `10`).
    pub probe_interval_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var               | Default                |
    /// |-----------------------|------------------------|
    /// | `HOST`                | `0.0.0.0`              |
    /// | `PORT`                | `3000`                 |
    /// | `CORS_ORIGINS`        | `http://localhost:5173`|
    /// | `REQUEST_TIMEOUT_SECS`| `30`                   |
    /// | `NODES_CONFIG`        | `config/nodes.yaml`    |
    /// | `TEMPLATES_DIR`       | `templates/workflows`  |
    /// | `PROBE_INTERVAL_SECS` | `10`                   |
    pub fn from_env() -> CoreResult<Self> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .map_err(|_| CoreError::Config("PORT must be a valid u16".into()))?;

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .map_err(|_| CoreError::Config("REQUEST_TIMEOUT_SECS must be a valid u64".into()))?;

        let nodes_config_path =
            PathBuf::from(std::env::var("NODES_CONFIG").unwrap_or_else(|_| "config/nodes.yaml".into()));

        let templates_dir = PathBuf::from(
            std::env::var("TEMPLATES_DIR").unwrap_or_else(|_| "templates/workflows".into()),
        );

        let probe_interval_secs: u64 = std::env::var("PROBE_INTERVAL_SECS")
            .unwrap_or_else(|_| "10".into())
            .parse()
            .map_err(|_| CoreError::Config("PROBE_INTERVAL_SECS must be a valid u64".into()))?;

        Ok(Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            nodes_config_path,
            templates_dir,
            probe_interval_secs,
        })
    }
}

#[derive(Debug, Deserialize)]
struct NodeInventory {
    nodes: Vec<NodeConfig>,
}

/// Parse the declarative node inventory.
///
/// Missing required fields surface as a [`CoreError::Config`]; capability
/// vocabulary checks happen in the registry's `load`.
pub fn load_node_inventory(path: &Path) -> CoreResult<Vec<NodeConfig>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        CoreError::Config(format!("cannot read node inventory {}: {e}", path.display()))
    })?;
    let inventory: NodeInventory = serde_yaml::from_str(&raw)
        .map_err(|e| CoreError::Config(format!("invalid node inventory: {e}")))?;
    Ok(inventory.nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inventory_parses_and_defaults_optional_fields() {
        let dir = std::env::temp_dir().join(format!("atelier-inv-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("nodes.yaml");
        std::fs::write(
            &path,
            r#"
nodes:
  - id: gpu-1
    name: "RTX 4090"
    vram_gb: 24
    tier: quality
    host: 10.0.0.5
    port: 8188
    capabilities: [sdxl, sd15, upscale]
    max_resolution: 2048
    max_batch: 4
  - id: gpu-2
    name: "RTX 3060"
    vram_gb: 12
    tier: draft
    host: 10.0.0.6
    port: 8188
    capabilities: [sd15]
"#,
        )
        .unwrap();

        let nodes = load_node_inventory(&path).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, "gpu-1");
        assert!(nodes[0].capabilities.contains("upscale"));
        // Optional fields fall back to defaults.
        assert_eq!(nodes[1].max_resolution, 1024);
        assert_eq!(nodes[1].max_batch, 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_required_field_is_a_config_error() {
        let dir = std::env::temp_dir().join(format!("atelier-inv-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("nodes.yaml");
        std::fs::write(&path, "nodes:\n  - id: gpu-1\n    name: incomplete\n").unwrap();
        assert!(matches!(
            load_node_inventory(&path),
            Err(CoreError::Config(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_is_a_config_error() {
        assert!(matches!(
            load_node_inventory(Path::new("/definitely/not/here.yaml")),
            Err(CoreError::Config(_))
        ));
    }
}
