//! Shared deterministic types for the capture engine.
//!
//! These types define stable contracts between the sink, the resolver and the
//! renderer. They do not depend on external state and serialize the same way
//! across runs, so capture dumps written by one process can be merged by
//! another.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a captured record.
///
/// `Assert` sits outside the severity order: it is synthesized for assertion
/// failures and is retained at every threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Assert,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
            Level::Assert => "ASSERT",
        }
    }

    /// Position in the severity order, `None` for `Assert`.
    fn rank(self) -> Option<u8> {
        match self {
            Level::Debug => Some(0),
            Level::Info => Some(1),
            Level::Warning => Some(2),
            Level::Error => Some(3),
            Level::Critical => Some(4),
            Level::Assert => None,
        }
    }

    /// True if a record at this level survives filtering at `threshold`.
    pub fn retained_at(self, threshold: MinLevel) -> bool {
        match self.rank() {
            Some(rank) => rank >= threshold.rank(),
            None => true,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum retained level, as accepted on the command line and in config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MinLevel {
    #[default]
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl MinLevel {
    pub const ALL: [MinLevel; 5] = [
        MinLevel::Debug,
        MinLevel::Info,
        MinLevel::Warning,
        MinLevel::Error,
        MinLevel::Critical,
    ];

    fn rank(self) -> u8 {
        match self {
            MinLevel::Debug => 0,
            MinLevel::Info => 1,
            MinLevel::Warning => 2,
            MinLevel::Error => 3,
            MinLevel::Critical => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MinLevel::Debug => "DEBUG",
            MinLevel::Info => "INFO",
            MinLevel::Warning => "WARNING",
            MinLevel::Error => "ERROR",
            MinLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for MinLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MinLevel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        MinLevel::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| {
                format!("invalid log level '{raw}' (expected DEBUG|INFO|WARNING|ERROR|CRITICAL)")
            })
    }
}

/// Execution phase a record was captured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// A fixture's setup portion was executing.
    Setup,
    /// Test body, fixture teardown, and everything else.
    Test,
}

impl Phase {
    /// Value of the `step` attribute in the rendered report.
    pub fn as_step(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Test => "test",
        }
    }
}

/// Granularity at which a fixture instance is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Session,
    Module,
    Function,
}

/// The session, module, or test a record is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "lowercase")]
pub enum ScopeOwner {
    Session(String),
    Module(String),
    Function(String),
}

impl ScopeOwner {
    pub fn scope(&self) -> Scope {
        match self {
            ScopeOwner::Session(_) => Scope::Session,
            ScopeOwner::Module(_) => Scope::Module,
            ScopeOwner::Function(_) => Scope::Function,
        }
    }
}

impl fmt::Display for ScopeOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeOwner::Session(id) => write!(f, "session:{id}"),
            ScopeOwner::Module(id) => write!(f, "module:{id}"),
            ScopeOwner::Function(id) => write!(f, "function:{id}"),
        }
    }
}

/// File and line a record was emitted from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

/// One captured log line with its attribution tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Capture sequence number, strictly increasing within a run.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub source: SourceLocation,
    /// Fully formatted message, not yet escaped.
    pub message: String,
    pub phase: Phase,
    pub owner: ScopeOwner,
    /// Module context active at capture; used when `owner` cannot be resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Fixture whose setup or teardown was executing, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixture: Option<String>,
}

impl LogRecord {
    pub fn scope(&self) -> Scope {
        self.owner.scope()
    }
}

/// One collected test case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestNode {
    /// `classname.name`, matching the JUnit `<testcase>` attributes.
    pub id: String,
    pub classname: String,
    pub name: String,
    pub module: String,
}

impl TestNode {
    pub fn new(
        classname: impl Into<String>,
        name: impl Into<String>,
        module: impl Into<String>,
    ) -> Self {
        let classname = classname.into();
        let name = name.into();
        Self {
            id: testcase_id(&classname, &name),
            classname,
            name,
            module: module.into(),
        }
    }

    /// Build a node from a runner node id such as
    /// `tests/test_a.py::TestA::test_x[p]`.
    ///
    /// The file part becomes the dotted module path; any middle parts are
    /// class names appended to the classname.
    pub fn from_nodeid(nodeid: &str) -> Self {
        let mut parts: Vec<&str> = nodeid.split("::").collect();
        let file = parts.remove(0);
        let module = file
            .strip_suffix(".py")
            .unwrap_or(file)
            .replace(['/', '\\'], ".");
        let name = parts.pop().unwrap_or_default();
        let classname = std::iter::once(module.as_str())
            .chain(parts.iter().copied())
            .collect::<Vec<_>>()
            .join(".");
        if name.is_empty() {
            return Self::new("", module.clone(), module);
        }
        Self::new(classname, name, module)
    }

    /// Owners this test depends on, broadest first.
    pub fn owners(&self, session_id: &str) -> [ScopeOwner; 3] {
        [
            ScopeOwner::Session(session_id.to_string()),
            ScopeOwner::Module(self.module.clone()),
            ScopeOwner::Function(self.id.clone()),
        ]
    }
}

/// Identifier of a `<testcase>` element: `classname.name`, or `name` alone.
pub fn testcase_id(classname: &str, name: &str) -> String {
    if classname.is_empty() {
        name.to_string()
    } else {
        format!("{classname}.{name}")
    }
}

/// Tests grouped by module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleNode {
    pub id: String,
    pub tests: Vec<TestNode>,
}

/// Session containing modules containing tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTree {
    pub session_id: String,
    pub modules: Vec<ModuleNode>,
}

impl TestTree {
    /// Group tests by module, keeping first-seen module order and the
    /// collection order of tests within each module.
    pub fn from_tests(
        session_id: impl Into<String>,
        tests: impl IntoIterator<Item = TestNode>,
    ) -> Self {
        let mut modules: Vec<ModuleNode> = Vec::new();
        for test in tests {
            match modules.iter_mut().find(|module| module.id == test.module) {
                Some(module) => module.tests.push(test),
                None => modules.push(ModuleNode {
                    id: test.module.clone(),
                    tests: vec![test],
                }),
            }
        }
        Self {
            session_id: session_id.into(),
            modules,
        }
    }

    /// All tests in tree order.
    pub fn tests(&self) -> impl Iterator<Item = &TestNode> {
        self.modules.iter().flat_map(|module| module.tests.iter())
    }

    pub fn len(&self) -> usize {
        self.modules.iter().map(|module| module.tests.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
