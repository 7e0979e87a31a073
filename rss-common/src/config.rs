//! The configuration surface from §6, loaded from a TOML file with `RSS_*`
//! environment variable overrides, mirroring the config-file-plus-env
//! pattern used by the rest of this corpus.

use crate::error::RssError;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_block_size() -> u64 {
    256 * 1024
}
fn default_max_request_size() -> u64 {
    16 * 1024 * 1024
}
fn default_max_flying_package_num() -> u32 {
    32
}
fn default_memory_threshold() -> u64 {
    512 * 1024 * 1024
}
fn default_writer_buffer_spill() -> u64 {
    64 * 1024 * 1024
}
fn default_writer_type() -> String {
    "auto".to_string()
}
fn default_bypass_threshold() -> u32 {
    200
}
fn default_partition_count_per_worker() -> u32 {
    2
}
fn default_read_io_threads() -> u32 {
    4
}
fn default_read_max_size() -> u64 {
    32 * 1024 * 1024
}
fn default_read_merge_size() -> u64 {
    2 * 1024 * 1024
}
fn default_true() -> bool {
    true
}
fn default_service_manager_type() -> String {
    "master".to_string()
}
fn default_app_storage_retention_millis() -> u64 {
    24 * 60 * 60 * 1000
}
fn default_app_obj_retention_millis() -> u64 {
    60 * 60 * 1000
}
fn default_base_connections() -> u32 {
    32
}
fn default_total_connections() -> u32 {
    64
}
fn default_dumper_threads() -> u32 {
    4
}
fn default_dumper_queue_size() -> u32 {
    256
}
fn default_netty_worker_threads() -> u32 {
    8
}
fn default_network_timeout_millis() -> u64 {
    10_000
}
fn default_network_retries() -> u32 {
    3
}
fn default_input_ready_query_interval_millis() -> u64 {
    500
}
fn default_input_ready_max_wait_millis() -> u64 {
    5 * 60 * 1000
}
fn default_min_server_count() -> u32 {
    1
}
fn default_max_server_count() -> u32 {
    64
}
fn default_memory_control_size_threshold() -> u64 {
    64 * 1024 * 1024
}
fn default_memory_low_water_pct() -> f64 {
    0.75
}
fn default_blocks_per_flush() -> u32 {
    64
}
fn default_partition_idle_millis() -> u64 {
    30_000
}

/// Top-level configuration, shared by Master, Worker, and Client binaries.
/// Each subsection only applies to the component that reads it, but the
/// struct is shared so a single TOML file can configure a whole cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RssConfig {
    pub datacenter: String,
    pub cluster: String,
    pub root_dir: String,

    #[serde(default = "default_block_size")]
    pub block_size: u64,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: u64,
    #[serde(default = "default_max_flying_package_num")]
    pub max_flying_package_num: u32,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: u64,
    #[serde(default = "default_writer_buffer_spill")]
    pub writer_buffer_spill: u64,
    #[serde(default = "default_writer_type")]
    pub writer_type: String,
    #[serde(default = "default_bypass_threshold")]
    pub bypass_threshold: u32,
    #[serde(default = "default_partition_count_per_worker")]
    pub partition_count_per_shuffle_worker: u32,

    #[serde(default = "default_read_io_threads")]
    pub read_io_threads: u32,
    #[serde(default = "default_read_max_size")]
    pub read_max_size: u64,
    #[serde(default = "default_read_merge_size")]
    pub read_merge_size: u64,
    #[serde(default = "default_input_ready_query_interval_millis")]
    pub input_ready_query_interval_millis: u64,
    #[serde(default = "default_input_ready_max_wait_millis")]
    pub input_ready_max_wait_millis: u64,

    #[serde(default = "default_true")]
    pub delete_shuffle_dir: bool,
    #[serde(default = "default_service_manager_type")]
    pub service_manager_type: String,

    #[serde(default = "default_app_storage_retention_millis")]
    pub app_storage_retention_millis: u64,
    #[serde(default = "default_app_obj_retention_millis")]
    pub app_obj_retention_millis: u64,

    #[serde(default = "default_base_connections")]
    pub base_connections: u32,
    #[serde(default = "default_total_connections")]
    pub total_connections: u32,

    #[serde(default = "default_dumper_threads")]
    pub dumper_threads: u32,
    #[serde(default = "default_dumper_queue_size")]
    pub dumper_queue_size: u32,

    #[serde(default = "default_netty_worker_threads")]
    pub netty_worker_threads: u32,
    #[serde(default = "default_network_timeout_millis")]
    pub network_timeout_millis: u64,
    #[serde(default = "default_network_retries")]
    pub network_retries: u32,

    #[serde(default = "default_min_server_count")]
    pub min_server_count: u32,
    #[serde(default = "default_max_server_count")]
    pub max_server_count: u32,

    #[serde(default = "default_memory_control_size_threshold")]
    pub memory_control_size_threshold: u64,
    #[serde(default = "default_memory_low_water_pct")]
    pub memory_low_water_pct: f64,
    #[serde(default = "default_blocks_per_flush")]
    pub blocks_per_flush: u32,
    #[serde(default = "default_partition_idle_millis")]
    pub partition_idle_millis: u64,
}

impl RssConfig {
    /// Load from a TOML file, then apply `RSS_*` environment overrides for a
    /// handful of deployment-varying fields (host/port wiring lives in the
    /// binaries' CLI args, not here).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RssError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| RssError::ConfigError {
            message: format!("failed to read config file {}: {e}", path.as_ref().display()),
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, RssError> {
        let mut config: RssConfig = toml::from_str(text).map_err(|e| RssError::ConfigError {
            message: format!("invalid config: {e}"),
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RSS_ROOT_DIR") {
            self.root_dir = v;
        }
        if let Ok(v) = std::env::var("RSS_CLUSTER") {
            self.cluster = v;
        }
        if let Ok(v) = std::env::var("RSS_DATACENTER") {
            self.datacenter = v;
        }
    }

    fn validate(&self) -> Result<(), RssError> {
        if self.datacenter.is_empty() || self.cluster.is_empty() {
            return Err(RssError::ConfigError {
                message: "datacenter and cluster must be non-empty".to_string(),
            });
        }
        if self.min_server_count == 0 {
            return Err(RssError::ConfigError {
                message: "minServerCount must be >= 1".to_string(),
            });
        }
        if self.max_server_count < self.min_server_count {
            return Err(RssError::ConfigError {
                message: "maxServerCount must be >= minServerCount".to_string(),
            });
        }
        if self.memory_low_water_pct <= 0.0 || self.memory_low_water_pct >= 1.0 {
            return Err(RssError::ConfigError {
                message: "memoryLowWaterPct must be in (0, 1)".to_string(),
            });
        }
        if !["auto", "bypass", "unsafe", "sort"].contains(&self.writer_type.as_str()) {
            return Err(RssError::ConfigError {
                message: format!("unknown writerType '{}'", self.writer_type),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
        datacenter = "dc1"
        cluster = "prod"
        root_dir = "/rss-root"
        "#
    }

    #[test]
    fn parse_applies_defaults() {
        let cfg = RssConfig::parse(minimal_toml()).unwrap();
        assert_eq!(cfg.block_size, default_block_size());
        assert_eq!(cfg.writer_type, "auto");
        assert_eq!(cfg.dumper_threads, 4);
    }

    #[test]
    fn parse_rejects_empty_cluster() {
        let text = r#"
        datacenter = "dc1"
        cluster = ""
        root_dir = "/rss-root"
        "#;
        assert!(RssConfig::parse(text).is_err());
    }

    #[test]
    fn parse_rejects_inverted_server_count_bounds() {
        let text = r#"
        datacenter = "dc1"
        cluster = "prod"
        root_dir = "/rss-root"
        min_server_count = 10
        max_server_count = 2
        "#;
        assert!(RssConfig::parse(text).is_err());
    }

    #[test]
    fn parse_rejects_unknown_writer_type() {
        let text = r#"
        datacenter = "dc1"
        cluster = "prod"
        root_dir = "/rss-root"
        writer_type = "quantum"
        "#;
        assert!(RssConfig::parse(text).is_err());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rss.toml");
        std::fs::write(&path, minimal_toml()).unwrap();
        let cfg = RssConfig::load(&path).unwrap();
        assert_eq!(cfg.cluster, "prod");
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = RssConfig::load("/nonexistent/path/rss.toml").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
