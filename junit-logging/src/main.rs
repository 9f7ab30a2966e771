//! `junit-logging` CLI: merge captured test logs into JUnit XML reports.
//!
//! A test run writes a capture dump (`capture.json`) next to its report; the
//! commands here render that dump and embed the per-test `<logs>` fragments.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use junit_logging::core::types::MinLevel;
use junit_logging::exit_codes;
use junit_logging::io::config::{CONFIG_FILE_NAME, CaptureConfig, load_config};
use junit_logging::logging;
use junit_logging::merge::{MergeConfig, RenderConfig, merge_report, render_capture};

#[derive(Parser)]
#[command(
    name = "junit-logging",
    version,
    about = "Embed captured test logs in JUnit XML reports"
)]
struct Cli {
    /// Config file (defaults to `.junit-logging.toml` in the working directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Merge a capture dump into a JUnit XML report.
    Merge {
        /// JUnit XML report to read.
        #[arg(long)]
        report: PathBuf,
        /// Write the merged report here instead of rewriting `--report`.
        #[arg(long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        render: RenderArgs,
    },
    /// Print the rendered `<logs>` fragment of every test as JSON.
    Render {
        #[command(flatten)]
        render: RenderArgs,
    },
}

#[derive(Args)]
struct RenderArgs {
    /// Capture dump written by the test run.
    #[arg(long)]
    capture: PathBuf,
    /// Minimum level kept: DEBUG|INFO|WARNING|ERROR|CRITICAL.
    #[arg(long)]
    log_level: Option<MinLevel>,
    /// Render source paths relative to this directory.
    #[arg(long)]
    root: Option<PathBuf>,
}

impl RenderArgs {
    fn resolve(self, cfg: &CaptureConfig) -> RenderConfig {
        let mut cfg = cfg.clone();
        if let Some(level) = self.log_level {
            cfg.log_level = level;
        }
        if let Some(root) = self.root {
            cfg.project_root = Some(root);
        }
        RenderConfig {
            capture: self.capture,
            min_level: cfg.log_level,
            project_root: cfg.resolved_root(),
        }
    }
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| Path::new(CONFIG_FILE_NAME).to_path_buf());
    let cfg = load_config(&config_path)?;

    match cli.command {
        Command::Merge {
            report,
            output,
            render,
        } => {
            let summary = merge_report(&MergeConfig {
                render: render.resolve(&cfg),
                report,
                output,
            })?;
            println!("{summary}");
        }
        Command::Render { render } => {
            let assembly = render_capture(&render.resolve(&cfg))?;
            println!("{}", serde_json::to_string_pretty(&assembly.fragments)?);
        }
    }
    Ok(())
}
