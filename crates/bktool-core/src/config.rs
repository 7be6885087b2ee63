use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BkError, BkResult};
use crate::types::FailurePolicy;

/// Top-level tool configuration (loaded from bktool.toml or a JSON file)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BktoolConfig {
    /// Absolute source directories to back up
    pub directories: Vec<PathBuf>,
    /// Root under which backup runs are written (default: home directory)
    pub destination: PathBuf,
    /// Namespace each run under `backup-<timestamp>` (default: true)
    pub timestamped: bool,
    pub crypto: CryptoConfig,
    pub run: RunConfig,
    pub log: LogConfig,
}

/// Key derivation and cipher framing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 32768 = 32 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
    /// Plaintext bytes per encrypted chunk (default: 64 KiB)
    pub chunk_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Abort a source tree on its first failing entry instead of skipping it
    pub fail_fast: bool,
    /// Copy uid/gid onto replicated entries
    pub preserve_ownership: bool,
    /// Worker threads across top-level sources (0 = cpu_count, 1 = sequential)
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for BktoolConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            destination: PathBuf::from("~"),
            timestamped: true,
            crypto: CryptoConfig::default(),
            run: RunConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 32 * 1024,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            chunk_size: 64 * 1024,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            preserve_ownership: true,
            workers: 1,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl RunConfig {
    pub fn failure_policy(&self) -> FailurePolicy {
        if self.fail_fast {
            FailurePolicy::FailFast
        } else {
            FailurePolicy::BestEffort
        }
    }
}

impl BktoolConfig {
    /// Load a config file. `.json` files are parsed as JSON, anything else as TOML.
    pub fn load(path: &Path) -> BkResult<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BkError::NotFound(path.to_path_buf()))
            }
            Err(e) => return Err(BkError::io(path, e)),
        };

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        };
        parsed.map_err(|message| BkError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    pub fn from_json_str(content: &str) -> Result<Self, String> {
        serde_json::from_str(content).map_err(|e| e.to_string())
    }

    /// See [`validate_source_dirs`].
    pub fn validate_sources(&self) -> BkResult<()> {
        validate_source_dirs(&self.directories)
    }
}

/// Sources must be absolute paths with distinct UTF-8 final components,
/// since each lands at `<run root>/<name>` and the name is recorded as text.
pub fn validate_source_dirs(dirs: &[PathBuf]) -> BkResult<()> {
    if dirs.is_empty() {
        return Err(BkError::Config("no source directories configured".into()));
    }
    let mut seen = std::collections::HashSet::new();
    for dir in dirs {
        if !dir.is_absolute() {
            return Err(BkError::Config(format!(
                "source directory must be absolute: {}",
                dir.display()
            )));
        }
        let name = dir.file_name().ok_or_else(|| {
            BkError::Config(format!("source directory has no name: {}", dir.display()))
        })?;
        let name = name.to_str().ok_or_else(|| {
            BkError::Config(format!(
                "source directory name is not valid UTF-8: {}",
                dir.display()
            ))
        })?;
        if !seen.insert(name) {
            return Err(BkError::Config(format!(
                "two sources share the name {:?}; they would collide in the backup",
                name
            )));
        }
    }
    Ok(())
}
