//! Run configuration, read from `codemod.toml` in the target directory by default.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::io::sandbox::Capability;

pub const CONFIG_FILE_NAME: &str = "codemod.toml";

/// Smallest address-space limit a worker process can start under.
const MIN_MEMORY_LIMIT_BYTES: u64 = 64 * 1024 * 1024;

/// Run configuration (TOML).
///
/// Edited by humans, so every field has a default and missing fields fall
/// back to it. CLI flags override individual fields after loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Number of worker slots.
    pub pool_size: usize,

    /// A busy slot silent for longer than this is replaced.
    pub hang_threshold_ms: u64,

    /// Interval between hang scans.
    pub tick_interval_ms: u64,

    /// Only files with one of these extensions are transformed (empty = all).
    pub extensions: Vec<String>,

    /// Case files are written below this directory, relative to the target.
    pub case_dir: PathBuf,

    pub worker: WorkerConfig,
    pub sandbox: SandboxConfig,
    pub command: CommandConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// One OS thread per slot. Workers share the coordinator's address
    /// space, so `sandbox.memory_limit_bytes` does not apply.
    Thread,
    /// One `codemod-runner worker` child process per slot.
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub kind: WorkerKind,
    /// Stack size of worker threads.
    pub stack_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            kind: WorkerKind::Process,
            stack_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Instruction budget per file; `None` disables it.
    pub fuel: Option<u64>,
    /// Largest body a transformation may report.
    pub max_report_bytes: usize,
    /// Address-space limit of each worker process; 0 disables it.
    pub memory_limit_bytes: u64,
    /// Host operations granted to transformations.
    pub capabilities: Vec<Capability>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            fuel: Some(50_000_000),
            max_report_bytes: 16 * 1024 * 1024,
            memory_limit_bytes: 1024 * 1024 * 1024,
            capabilities: vec![Capability::Regex, Capability::Json, Capability::Path],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    /// Program and arguments for the command engine (e.g. `["sed","s/a/b/"]`).
    pub program: Vec<String>,
    pub timeout_secs: u64,
    /// Reject outputs larger than this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: Vec::new(),
            timeout_secs: 60,
            output_limit_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            hang_threshold_ms: 10_000,
            tick_interval_ms: 1_000,
            extensions: Vec::new(),
            case_dir: PathBuf::from(".codemod/cases"),
            worker: WorkerConfig::default(),
            sandbox: SandboxConfig::default(),
            command: CommandConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(anyhow!("pool_size must be > 0"));
        }
        if self.hang_threshold_ms == 0 {
            return Err(anyhow!("hang_threshold_ms must be > 0"));
        }
        if self.tick_interval_ms == 0 {
            return Err(anyhow!("tick_interval_ms must be > 0"));
        }
        if self.worker.stack_bytes < 64 * 1024 {
            return Err(anyhow!("worker.stack_bytes must be >= 65536"));
        }
        if self.sandbox.fuel == Some(0) {
            return Err(anyhow!("sandbox.fuel must be > 0 when set"));
        }
        if self.sandbox.max_report_bytes == 0 {
            return Err(anyhow!("sandbox.max_report_bytes must be > 0"));
        }
        let memory = self.sandbox.memory_limit_bytes;
        if memory != 0 && memory < MIN_MEMORY_LIMIT_BYTES {
            return Err(anyhow!(
                "sandbox.memory_limit_bytes must be 0 or >= {MIN_MEMORY_LIMIT_BYTES}"
            ));
        }
        if self.command.timeout_secs == 0 {
            return Err(anyhow!("command.timeout_secs must be > 0"));
        }
        if self.command.output_limit_bytes == 0 {
            return Err(anyhow!("command.output_limit_bytes must be > 0"));
        }
        if self
            .extensions
            .iter()
            .any(|ext| ext.is_empty() || ext.starts_with('.'))
        {
            return Err(anyhow!(
                "extensions must be non-empty and given without a leading dot"
            ));
        }
        if self.case_dir.as_os_str().is_empty() {
            return Err(anyhow!("case_dir must not be empty"));
        }
        Ok(())
    }
}

/// Default config location for a target: `codemod.toml` in the target
/// directory, or next to a target file.
pub fn default_config_path(target: &Path) -> PathBuf {
    let dir = if target.is_dir() {
        target
    } else {
        target.parent().unwrap_or(target)
    };
    dir.join(CONFIG_FILE_NAME)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    if !path.exists() {
        let cfg = RunConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/codemod.toml");
        let mut cfg = RunConfig::default();
        cfg.worker.kind = WorkerKind::Thread;
        cfg.sandbox.memory_limit_bytes = 0;
        cfg.extensions = vec!["ts".to_string(), "tsx".to_string()];
        cfg.command.program = vec!["sed".to_string(), "s/a/b/".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("codemod.toml");
        fs::write(
            &path,
            "pool_size = 2\n[sandbox]\ncapabilities = [\"regex\", \"log\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.pool_size, 2);
        assert_eq!(cfg.hang_threshold_ms, 10_000);
        assert_eq!(
            cfg.sandbox.capabilities,
            vec![Capability::Regex, Capability::Log]
        );
        assert_eq!(cfg.sandbox.fuel, Some(50_000_000));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = RunConfig::default();
        cfg.pool_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RunConfig::default();
        cfg.extensions = vec![".ts".to_string()];
        assert!(cfg.validate().is_err());

        let mut cfg = RunConfig::default();
        cfg.sandbox.fuel = Some(0);
        assert!(cfg.validate().is_err());

        let mut cfg = RunConfig::default();
        cfg.sandbox.max_report_bytes = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RunConfig::default();
        cfg.sandbox.memory_limit_bytes = 1024;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn defaults_bound_worker_memory() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.worker.kind, WorkerKind::Process);
        assert_eq!(cfg.sandbox.memory_limit_bytes, 1024 * 1024 * 1024);
        assert_eq!(cfg.sandbox.max_report_bytes, 16 * 1024 * 1024);
    }
}
