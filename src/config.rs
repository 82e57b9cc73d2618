use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use sysinfo::System;

use crate::constants::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-operator ceiling for single-node execution.
    pub memory_limit_bytes: usize,
    /// Per-operator ceiling when the engine runs one partition of a sharded query.
    pub sharded_memory_limit_bytes: usize,
    pub sharded: bool,
    /// When set, derives the ceiling from physical memory instead.
    pub memory_limit_percent: Option<f64>,
    pub temp_directory: PathBuf,
    pub io_buffer_size_kb: usize,
    /// Most runs read at once by one merge; more runs are merged in passes.
    pub merge_fan_in: usize,
    /// Assumed document size when deciding whether `$sort` + `$limit` can use a
    /// bounded top-k heap. A limit whose estimate exceeds the ceiling falls back
    /// to the spilling sort.
    pub top_k_document_estimate_bytes: usize,
    pub parallel_sort: bool,
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_MB * BYTES_PER_MB,
            sharded_memory_limit_bytes: DEFAULT_SHARDED_MEMORY_LIMIT_MB * BYTES_PER_MB,
            sharded: false,
            memory_limit_percent: None,
            temp_directory: std::env::temp_dir().join(TEMP_DIR_NAME),
            io_buffer_size_kb: DEFAULT_IO_BUFFER_SIZE_KB,
            merge_fan_in: DEFAULT_MERGE_FAN_IN,
            top_k_document_estimate_bytes: DEFAULT_TOP_K_DOCUMENT_ESTIMATE_BYTES,
            parallel_sort: true,
            verbose: false,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_limit_bytes < MIN_MEMORY_LIMIT_BYTES
            || self.sharded_memory_limit_bytes < MIN_MEMORY_LIMIT_BYTES
        {
            return Err(anyhow::anyhow!(
                "Memory limits must be at least {} bytes",
                MIN_MEMORY_LIMIT_BYTES
            ));
        }

        if let Some(percent) = self.memory_limit_percent {
            if !(MIN_MEMORY_LIMIT_PERCENT..=MAX_MEMORY_LIMIT_PERCENT).contains(&percent) {
                return Err(anyhow::anyhow!(
                    "Memory limit percent must be between {} and {}",
                    MIN_MEMORY_LIMIT_PERCENT,
                    MAX_MEMORY_LIMIT_PERCENT
                ));
            }
        }

        if self.io_buffer_size_kb < MIN_IO_BUFFER_SIZE_KB
            || self.io_buffer_size_kb > MAX_IO_BUFFER_SIZE_KB
        {
            return Err(anyhow::anyhow!(
                "I/O buffer size must be between {} and {} KB",
                MIN_IO_BUFFER_SIZE_KB,
                MAX_IO_BUFFER_SIZE_KB
            ));
        }

        if self.merge_fan_in < MIN_MERGE_FAN_IN {
            return Err(anyhow::anyhow!(
                "Merge fan-in must be at least {} runs",
                MIN_MERGE_FAN_IN
            ));
        }

        if self.top_k_document_estimate_bytes < MIN_TOP_K_DOCUMENT_ESTIMATE_BYTES {
            return Err(anyhow::anyhow!(
                "Top-k document estimate must be at least {} byte",
                MIN_TOP_K_DOCUMENT_ESTIMATE_BYTES
            ));
        }

        Ok(())
    }

    /// The ceiling each stateful operator of a query gets.
    pub fn memory_limit(&self) -> usize {
        if let Some(percent) = self.memory_limit_percent {
            let total = total_system_memory() as f64;
            return ((total * percent / PERCENT_100) as usize).max(MIN_MEMORY_LIMIT_BYTES);
        }

        if self.sharded {
            self.sharded_memory_limit_bytes
        } else {
            self.memory_limit_bytes
        }
    }

    pub fn io_buffer_size_bytes(&self) -> usize {
        self.io_buffer_size_kb * BYTES_PER_KB
    }
}

pub fn total_system_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_limits() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.memory_limit(), 100 * 1024 * 1024);

        let sharded = EngineConfig {
            sharded: true,
            ..EngineConfig::default()
        };
        assert_eq!(sharded.memory_limit(), 200 * 1024 * 1024);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();

        config.memory_limit_bytes = 10;
        assert!(config.validate().is_err());

        config.memory_limit_bytes = 1024 * 1024;
        config.memory_limit_percent = Some(95.0);
        assert!(config.validate().is_err());

        config.memory_limit_percent = Some(0.5);
        assert!(config.validate().is_err());

        config.memory_limit_percent = None;
        config.io_buffer_size_kb = 1;
        assert!(config.validate().is_err());

        config.io_buffer_size_kb = 64;
        config.merge_fan_in = 1;
        assert!(config.validate().is_err());

        config.merge_fan_in = DEFAULT_MERGE_FAN_IN;
        config.top_k_document_estimate_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_percent_limit_uses_system_memory() {
        let config = EngineConfig {
            memory_limit_percent: Some(10.0),
            ..EngineConfig::default()
        };
        assert!(config.memory_limit() >= MIN_MEMORY_LIMIT_BYTES);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.json");

        let config = EngineConfig {
            memory_limit_bytes: 4 * 1024 * 1024,
            sharded: true,
            ..EngineConfig::default()
        };
        config.to_file(&path).unwrap();

        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded.memory_limit_bytes, 4 * 1024 * 1024);
        assert!(loaded.sharded);

        std::fs::write(&path, r#"{"memory_limit_bytes": 2048}"#).unwrap();
        let partial = EngineConfig::from_file(&path).unwrap();
        assert_eq!(partial.memory_limit_bytes, 2048);
        assert_eq!(partial.io_buffer_size_kb, DEFAULT_IO_BUFFER_SIZE_KB);
    }
}
