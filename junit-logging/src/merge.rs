//! Offline commands: render a capture dump and merge it into a report.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::coordinator::{Assembly, assemble};
use crate::core::render::RenderOptions;
use crate::core::resolver::validate_tree;
use crate::core::types::MinLevel;
use crate::io::report::merge_report_file;
use crate::io::run_state::load_dump;

/// Inputs shared by `render` and `merge`.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub capture: PathBuf,
    pub min_level: MinLevel,
    pub project_root: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub render: RenderConfig,
    pub report: PathBuf,
    /// Defaults to rewriting `report` in place.
    pub output: Option<PathBuf>,
}

impl MergeConfig {
    pub fn output_path(&self) -> &Path {
        self.output.as_deref().unwrap_or(&self.report)
    }
}

/// What a merge did, for the one-line CLI summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub output: PathBuf,
    pub tests: usize,
    pub records: usize,
    pub retained: usize,
    pub merged: usize,
    pub unmatched: Vec<String>,
}

impl fmt::Display for MergeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "merged logs into {}/{} testcases ({} of {} records kept) -> {}",
            self.merged,
            self.tests,
            self.retained,
            self.records,
            self.output.display()
        )?;
        if !self.unmatched.is_empty() {
            write!(f, "; {} unmatched", self.unmatched.len())?;
        }
        Ok(())
    }
}

/// Load the capture dump and render every test's fragment.
#[instrument(skip_all, fields(capture = %config.capture.display()))]
pub fn render_capture(config: &RenderConfig) -> Result<Assembly> {
    let dump = load_dump(&config.capture)?;
    let tree = dump.tree();
    for problem in validate_tree(&tree) {
        warn!(problem = %problem, "test tree inconsistent");
    }
    let options = RenderOptions {
        min_level: config.min_level,
        project_root: config.project_root.as_deref(),
    };
    Ok(assemble(&dump.records, &tree, options))
}

/// Render the capture dump and merge the fragments into the report.
#[instrument(skip_all, fields(report = %config.report.display()))]
pub fn merge_report(config: &MergeConfig) -> Result<MergeSummary> {
    let dump = load_dump(&config.render.capture)?;
    let tree = dump.tree();
    for problem in validate_tree(&tree) {
        warn!(problem = %problem, "test tree inconsistent");
    }
    let options = RenderOptions {
        min_level: config.render.min_level,
        project_root: config.render.project_root.as_deref(),
    };
    let assembly = assemble(&dump.records, &tree, options);

    let output = config.output_path();
    let outcome = merge_report_file(&config.report, output, &assembly.fragments)
        .with_context(|| format!("merge capture into {}", config.report.display()))?;
    for id in &outcome.unmatched {
        warn!(test = %id, "no testcase for captured logs");
    }
    debug!(merged = outcome.merged, "merge complete");

    Ok(MergeSummary {
        output: output.to_path_buf(),
        tests: tree.len(),
        records: dump.records.len(),
        retained: assembly.retained,
        merged: outcome.merged,
        unmatched: outcome.unmatched,
    })
}
