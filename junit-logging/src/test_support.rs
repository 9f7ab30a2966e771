//! Test-only builders for records, tests, reports, and a scripted host.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;

use crate::coordinator::{AssertionFailure, Coordinator, ReportFragments};
use crate::core::types::{
    Level, LogRecord, Phase, Scope, ScopeOwner, SourceLocation, TestNode, TestTree,
};
use crate::io::config::CaptureConfig;
use crate::io::run_state::{CaptureDump, Emission, write_dump};
use crate::io::sink::CaptureSlot;

/// Source file stamped on records built by [`record_at`] and [`emission`].
pub const FIXTURE_SOURCE: &str = "/workspace/conftest.py";

/// A test in `module`, inside `class` unless it is empty.
pub fn test_node(module: &str, class: &str, name: &str) -> TestNode {
    let classname = if class.is_empty() {
        module.to_string()
    } else {
        format!("{module}.{class}")
    };
    TestNode::new(classname, name, module)
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

/// A record captured `offset` microseconds into a fixed run, with
/// `seq = offset`.
pub fn record_at(
    offset: u64,
    level: Level,
    message: &str,
    phase: Phase,
    owner: ScopeOwner,
) -> LogRecord {
    let micros = i64::try_from(offset).unwrap_or(i64::MAX);
    LogRecord {
        seq: offset,
        timestamp: base_time() + Duration::microseconds(micros),
        level,
        source: SourceLocation::new(FIXTURE_SOURCE, u32::try_from(offset).unwrap_or(u32::MAX)),
        message: message.to_string(),
        phase,
        owner,
        module: None,
        fixture: None,
    }
}

pub fn emission(level: Level, message: &str) -> Emission {
    Emission {
        level,
        message: message.to_string(),
        source: SourceLocation::new(FIXTURE_SOURCE, 1),
    }
}

/// Route `tracing` events on this thread into `slot` until the guard drops.
pub fn capture_subscriber(slot: &CaptureSlot) -> DefaultGuard {
    tracing::subscriber::set_default(tracing_subscriber::registry().with(slot.layer()))
}

/// In-memory sink for this crate's own diagnostics.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Diagnostics {
    pub fn contents(&self) -> String {
        let buf = match self.buf.lock() {
            Ok(buf) => buf,
            Err(poisoned) => poisoned.into_inner(),
        };
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl io::Write for Diagnostics {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = match self.buf.lock() {
            Ok(buf) => buf,
            Err(poisoned) => poisoned.into_inner(),
        };
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Diagnostics {
    type Writer = Diagnostics;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Like [`capture_subscriber`], additionally writing every event as text
/// into `diagnostics`.
pub fn capture_with_diagnostics(slot: &CaptureSlot, diagnostics: &Diagnostics) -> DefaultGuard {
    let text = tracing_subscriber::fmt::layer()
        .with_writer(diagnostics.clone())
        .with_ansi(false)
        .without_time();
    tracing::subscriber::set_default(tracing_subscriber::registry().with(slot.layer()).with(text))
}

/// Config with capture enabled and sources relative to `/workspace`.
pub fn enabled_config() -> CaptureConfig {
    CaptureConfig {
        enabled: true,
        project_root: Some(PathBuf::from("/workspace")),
        ..CaptureConfig::default()
    }
}

/// Drives a [`Coordinator`] the way a test runner would, with `tracing`
/// routed into its capture on the current thread.
pub struct ScriptedHost {
    pub coordinator: Coordinator,
    pub session_id: String,
    tests: Vec<TestNode>,
    _subscriber: DefaultGuard,
}

impl ScriptedHost {
    pub fn start(session_id: &str, config: CaptureConfig) -> Self {
        let slot = CaptureSlot::new();
        let subscriber = capture_subscriber(&slot);
        let mut coordinator = Coordinator::new(config, slot);
        coordinator.on_run_start(session_id);
        Self {
            coordinator,
            session_id: session_id.to_string(),
            tests: Vec::new(),
            _subscriber: subscriber,
        }
    }

    pub fn begin_test(&mut self, test: &TestNode) {
        if !self.tests.iter().any(|seen| seen.id == test.id) {
            self.tests.push(test.clone());
        }
        self.coordinator.on_test_start(test);
    }

    pub fn end_test(&self, test: &TestNode) {
        self.coordinator.on_test_finish(&test.id);
    }

    /// Run `body` as the setup of `fixture_id`.
    pub fn setup(&self, fixture_id: &str, scope: Scope, body: impl FnOnce()) {
        self.coordinator.on_fixture_setup_start(fixture_id, scope);
        body();
        self.coordinator.on_fixture_setup_end(fixture_id);
    }

    /// Run `body` as the call of `test`.
    pub fn call(&self, test: &TestNode, body: impl FnOnce()) {
        self.coordinator.on_test_call_start(&test.id);
        body();
        self.coordinator.on_test_call_end(&test.id);
    }

    /// Run `body` as the teardown of `fixture_id`.
    pub fn teardown(&self, fixture_id: &str, body: impl FnOnce()) {
        self.coordinator.on_fixture_teardown_start(fixture_id);
        body();
        self.coordinator.on_fixture_teardown_end(fixture_id);
    }

    pub fn fail_assertion(&self, test: &TestNode, explanation: &str, line: u32) {
        let file = format!("/workspace/{}.py", test.module.replace('.', "/"));
        self.coordinator.on_assertion_failure(&AssertionFailure {
            test_id: test.id.clone(),
            explanation: explanation.to_string(),
            source: SourceLocation::new(file, line),
        });
    }

    /// Tree of every test begun so far, in order.
    pub fn tree(&self) -> TestTree {
        TestTree::from_tests(self.session_id.clone(), self.tests.iter().cloned())
    }

    pub fn assemble(mut self) -> ReportFragments {
        let tree = self.tree();
        self.coordinator.on_report_assemble(&tree)
    }
}

/// A minimal JUnit report with one self-closing `<testcase>` per test.
pub fn junit_report(tests: &[TestNode]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<testsuites>");
    xml.push_str(&format!(
        "<testsuite name=\"pytest\" errors=\"0\" failures=\"0\" tests=\"{}\">\n",
        tests.len()
    ));
    for test in tests {
        xml.push_str(&format!(
            "<testcase classname=\"{}\" name=\"{}\" time=\"0.001\" />\n",
            test.classname, test.name
        ));
    }
    xml.push_str("</testsuite></testsuites>\n");
    xml
}

/// Temp directory holding a report and a capture dump.
pub struct ReportWorkspace {
    temp: tempfile::TempDir,
}

impl ReportWorkspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: tempfile::tempdir().context("create temp workspace")?,
        })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn report_path(&self) -> PathBuf {
        self.path().join("junit.xml")
    }

    pub fn capture_path(&self) -> PathBuf {
        self.path().join("capture.json")
    }

    pub fn write_report(&self, xml: &str) -> Result<PathBuf> {
        let path = self.report_path();
        fs::write(&path, xml).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn write_capture(&self, dump: &CaptureDump) -> Result<PathBuf> {
        let path = self.capture_path();
        write_dump(&path, dump)?;
        Ok(path)
    }

    pub fn read(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
    }
}
