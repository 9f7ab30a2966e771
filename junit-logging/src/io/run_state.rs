//! Per-run capture state and its on-disk dump.
//!
//! A [`RunState`] is created when a run starts and dropped once its report has
//! been assembled. It is shared between the coordinator, which mutates the
//! tagging state, and the capture layer, which appends records.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::tagger::{Mark, ScopeEntry, Tag, Tagger};
use crate::core::types::{Level, LogRecord, SourceLocation, TestNode, TestTree};

/// A log call before it is tagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission {
    pub level: Level,
    pub message: String,
    pub source: SourceLocation,
}

/// A fixture between the start of its setup and the end of its teardown.
#[derive(Debug, Clone)]
pub struct LiveFixture {
    pub entry: ScopeEntry,
    pub scope_mark: Mark,
    /// Set while setup is executing.
    pub setup_phase: Option<Mark>,
    /// Set while teardown is executing.
    pub teardown_phase: Option<Mark>,
}

/// Tagging state of one thread of execution.
#[derive(Debug)]
pub struct ExecutionContext {
    pub tagger: Tagger,
    pub live: HashMap<String, LiveFixture>,
    pub current_test: Option<TestNode>,
    /// Marks pushed by the running test call.
    pub call: Option<(Mark, Mark)>,
}

impl ExecutionContext {
    fn new(session_id: &str) -> Self {
        Self {
            tagger: Tagger::new(session_id),
            live: HashMap::new(),
            current_test: None,
            call: None,
        }
    }

    /// No test, fixture, or call is active on this context.
    pub fn is_idle(&self) -> bool {
        self.current_test.is_none()
            && self.call.is_none()
            && self.live.is_empty()
            && self.tagger.scope_depth() == 0
            && self.tagger.phase_depth() == 0
    }

    /// Module of the running test, if `test_id` is the running test.
    pub fn module_of(&self, test_id: &str) -> Option<String> {
        self.current_test
            .as_ref()
            .filter(|test| test.id == test_id)
            .map(|test| test.module.clone())
    }
}

/// In-memory state of one run.
#[derive(Debug)]
pub struct RunState {
    session_id: String,
    max_records: usize,
    next_seq: AtomicU64,
    overflow: AtomicU64,
    contexts: Mutex<HashMap<ThreadId, ExecutionContext>>,
    records: Mutex<Vec<LogRecord>>,
    tests: Mutex<Vec<TestNode>>,
}

impl RunState {
    pub fn new(session_id: impl Into<String>, max_records: usize) -> Self {
        Self {
            session_id: session_id.into(),
            max_records,
            next_seq: AtomicU64::new(0),
            overflow: AtomicU64::new(0),
            contexts: Mutex::new(HashMap::new()),
            records: Mutex::new(Vec::new()),
            tests: Mutex::new(Vec::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run `f` against the calling thread's execution context.
    ///
    /// `f` must not emit `tracing` events: the capture layer reads the same
    /// context and the lock is not reentrant.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut ExecutionContext) -> R) -> R {
        let mut contexts = lock(&self.contexts);
        let ctx = contexts
            .entry(thread::current().id())
            .or_insert_with(|| ExecutionContext::new(&self.session_id));
        f(ctx)
    }

    /// Current tag of the calling thread.
    ///
    /// A thread with nothing active of its own (for example one spawned by a
    /// test body) borrows the tag of the only context running a test. With
    /// zero or several such contexts the session tag applies.
    pub fn current_tag(&self) -> Tag {
        let contexts = lock(&self.contexts);
        let own = contexts
            .get(&thread::current().id())
            .filter(|ctx| !ctx.is_idle());
        if let Some(ctx) = own {
            return ctx.tagger.current();
        }
        let mut running = contexts.values().filter(|ctx| ctx.current_test.is_some());
        match (running.next(), running.next()) {
            (Some(ctx), None) => ctx.tagger.current(),
            _ => Tagger::new(self.session_id.as_str()).current(),
        }
    }

    /// Forget the calling thread's context once nothing is active on it.
    ///
    /// Returns `true` if an entry was removed.
    pub fn retire_idle_context(&self) -> bool {
        let mut contexts = lock(&self.contexts);
        let id = thread::current().id();
        if contexts.get(&id).is_some_and(ExecutionContext::is_idle) {
            contexts.remove(&id);
            return true;
        }
        false
    }

    /// Threads with tagging state in this run.
    pub fn context_count(&self) -> usize {
        lock(&self.contexts).len()
    }

    /// Tag `emission` with the calling thread's current tag and append it.
    pub fn capture(&self, emission: Emission) -> Option<u64> {
        let tag = self.current_tag();
        self.append(emission, tag)
    }

    /// Append `emission` with an explicit tag.
    ///
    /// Returns the record's sequence number, or `None` when the buffer is full.
    pub fn append(&self, emission: Emission, tag: Tag) -> Option<u64> {
        let mut records = lock(&self.records);
        if records.len() >= self.max_records {
            self.overflow.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        records.push(LogRecord {
            seq,
            timestamp: Utc::now(),
            level: emission.level,
            source: emission.source,
            message: emission.message,
            phase: tag.phase,
            owner: tag.owner,
            module: tag.module,
            fixture: tag.fixture,
        });
        Some(seq)
    }

    /// Remember `test` as seen in this run (first occurrence wins).
    pub fn note_test(&self, test: &TestNode) {
        let mut tests = lock(&self.tests);
        if !tests.iter().any(|seen| seen.id == test.id) {
            tests.push(test.clone());
        }
    }

    /// Tree of the tests seen so far.
    pub fn seen_tree(&self) -> TestTree {
        TestTree::from_tests(self.session_id.clone(), lock(&self.tests).clone())
    }

    pub fn record_count(&self) -> usize {
        lock(&self.records).len()
    }

    /// Records dropped because the buffer was full.
    pub fn overflow(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Copy of the records captured so far, in capture order.
    pub fn records(&self) -> Vec<LogRecord> {
        lock(&self.records).clone()
    }

    pub fn snapshot(&self) -> CaptureDump {
        CaptureDump {
            session_id: self.session_id.clone(),
            tests: lock(&self.tests).clone(),
            records: self.records(),
        }
    }
}

/// Poisoning only means another thread panicked mid-append; the data is
/// still a valid prefix of the run.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Serialized form of a run's captured state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureDump {
    pub session_id: String,
    pub tests: Vec<TestNode>,
    pub records: Vec<LogRecord>,
}

impl CaptureDump {
    pub fn tree(&self) -> TestTree {
        TestTree::from_tests(self.session_id.clone(), self.tests.iter().cloned())
    }
}

/// Load a capture dump from disk.
pub fn load_dump(path: &Path) -> Result<CaptureDump> {
    debug!(path = %path.display(), "loading capture dump");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read capture dump {}", path.display()))?;
    let dump: CaptureDump = serde_json::from_str(&contents)
        .with_context(|| format!("parse capture dump {}", path.display()))?;
    if let Some(pair) = dump.records.windows(2).find(|pair| pair[0].seq >= pair[1].seq) {
        bail!(
            "capture dump {} has records out of order (seq {} before {})",
            path.display(),
            pair[0].seq,
            pair[1].seq
        );
    }
    debug!(
        session_id = %dump.session_id,
        tests = dump.tests.len(),
        records = dump.records.len(),
        "capture dump loaded"
    );
    Ok(dump)
}

/// Atomically write a capture dump to disk (temp file + rename).
pub fn write_dump(path: &Path, dump: &CaptureDump) -> Result<()> {
    debug!(path = %path.display(), records = dump.records.len(), "writing capture dump");
    let mut buf = serde_json::to_string_pretty(dump)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("capture dump path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp capture dump {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace capture dump {}", path.display()))?;
    Ok(())
}
