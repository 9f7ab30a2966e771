//! Capture configuration, optionally stored in `.junit-logging.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::MinLevel;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = ".junit-logging.toml";

/// Capture configuration (TOML).
///
/// Missing fields default to values that capture everything into a report
/// rooted at the working directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Whether the host was asked to produce a JUnit XML report. Capture is
    /// inert otherwise.
    pub enabled: bool,

    /// Minimum level retained in the report. `ASSERT` records are always kept.
    pub log_level: MinLevel,

    /// Source paths are rendered relative to this directory. Defaults to the
    /// working directory at run start.
    pub project_root: Option<PathBuf>,

    /// Upper bound on records buffered per run.
    pub max_records: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_level: MinLevel::Debug,
            project_root: None,
            max_records: 1_000_000,
        }
    }
}

impl CaptureConfig {
    /// Enable capture iff the host's JUnit XML report path is set.
    pub fn with_report(mut self, junit_xml: Option<&Path>) -> Self {
        self.enabled = junit_xml.is_some();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_records == 0 {
            return Err(anyhow!("max_records must be > 0"));
        }
        if self
            .project_root
            .as_ref()
            .is_some_and(|root| root.as_os_str().is_empty())
        {
            return Err(anyhow!("project_root must not be empty"));
        }
        Ok(())
    }

    /// Project root to render sources against.
    pub fn resolved_root(&self) -> Option<PathBuf> {
        self.project_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CaptureConfig::default()`.
pub fn load_config(path: &Path) -> Result<CaptureConfig> {
    if !path.exists() {
        let cfg = CaptureConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CaptureConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CaptureConfig) -> Result<()> {
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
