//! Run lifecycle: turns host hooks into tagger transitions and, at the end of
//! the run, into per-test `<logs>` fragments.
//!
//! The coordinator is inert unless the configuration says a JUnit XML report
//! was requested. Failures never propagate to the host: a run whose capture
//! could not be installed simply produces no fragments.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::core::render::{RenderOptions, render_logs};
use crate::core::resolver::{Unresolved, distribute, scope_counts, validate_tree};
use crate::core::tagger::{ScopeEntry, Tag};
use crate::core::types::{
    Level, LogRecord, Phase, Scope, ScopeOwner, SourceLocation, TestNode, TestTree,
};
use crate::io::config::CaptureConfig;
use crate::io::run_state::{Emission, LiveFixture, RunState, write_dump};
use crate::io::sink::{CaptureSlot, Installed};

/// Test id to serialized `<logs>` fragment. Tests without retained records
/// are absent.
pub type ReportFragments = BTreeMap<String, String>;

/// A failed assertion reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionFailure {
    pub test_id: String,
    /// Human-readable explanation of the failed comparison.
    pub explanation: String,
    pub source: SourceLocation,
}

/// Fragments plus what was lost while producing them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assembly {
    pub fragments: ReportFragments,
    /// `<log>` elements written across all fragments.
    pub retained: usize,
    pub unresolved: Vec<Unresolved>,
    /// Records dropped because they could not be embedded in XML.
    pub render_failures: usize,
}

/// Distribute `records` onto `tree` and render every test's fragment.
pub fn assemble(records: &[LogRecord], tree: &TestTree, options: RenderOptions<'_>) -> Assembly {
    let distribution = distribute(records, tree);
    for unresolved in &distribution.unresolved {
        warn!(
            owner = %unresolved.owner,
            attached_to = %unresolved.attached_to,
            records = unresolved.records,
            "log owner not in test tree"
        );
    }

    let mut assembly = Assembly::default();
    for (test, test_records) in distribution.iter() {
        let rendered = render_logs(test_records, options);
        for failure in &rendered.failures {
            warn!(test = %test.id, seq = failure.seq, reason = %failure.reason, "log record dropped");
        }
        assembly.render_failures += rendered.failures.len();
        assembly.retained += rendered.retained;
        if let Some(fragment) = rendered.fragment {
            assembly.fragments.insert(test.id.clone(), fragment);
        }
    }
    assembly.unresolved = distribution.unresolved;
    debug!(
        tests = tree.len(),
        records = records.len(),
        scopes = ?scope_counts(records),
        fragments = assembly.fragments.len(),
        "fragments assembled"
    );
    assembly
}

/// Receives the host's lifecycle hooks for one run at a time.
#[derive(Debug)]
pub struct Coordinator {
    config: CaptureConfig,
    slot: CaptureSlot,
    run: Option<Arc<RunState>>,
    project_root: Option<PathBuf>,
}

impl Coordinator {
    pub fn new(config: CaptureConfig, slot: CaptureSlot) -> Self {
        Self {
            config,
            slot,
            run: None,
            project_root: None,
        }
    }

    /// The run being captured, if any.
    pub fn run(&self) -> Option<&Arc<RunState>> {
        self.run.as_ref()
    }

    pub fn is_capturing(&self) -> bool {
        self.run.is_some()
    }

    pub fn on_run_start(&mut self, session_id: &str) {
        if !self.config.enabled {
            debug!(session_id, "no junit report requested; capture inert");
            return;
        }
        if let Some(run) = &self.run {
            warn!(session_id, active = run.session_id(), "run already started; ignoring");
            return;
        }

        let run = Arc::new(RunState::new(session_id, self.config.max_records));
        match self.slot.install(&run) {
            Ok(Installed::Fresh) | Ok(Installed::AlreadyInstalled) => {
                self.project_root = self.config.resolved_root();
                self.run = Some(run);
                debug!(session_id, max_records = self.config.max_records, "capture installed");
            }
            Err(err) => {
                warn!(session_id, error = %err, "log capture unavailable; continuing without it");
            }
        }
    }

    /// `test` is about to run its setup, call, and teardown on this thread.
    pub fn on_test_start(&self, test: &TestNode) {
        let Some(run) = &self.run else {
            return;
        };
        run.note_test(test);
        run.with_context(|ctx| ctx.current_test = Some(test.clone()));
        debug!(test = %test.id, "test started");
    }

    pub fn on_test_finish(&self, test_id: &str) {
        let Some(run) = &self.run else {
            return;
        };
        let (stale_fixtures, open_phases) = run.with_context(|ctx| {
            if ctx.current_test.as_ref().is_some_and(|test| test.id == test_id) {
                ctx.current_test = None;
            }
            ctx.call = None;

            // Function fixtures never outlive their test.
            let owner = ScopeOwner::Function(test_id.to_string());
            let stale: Vec<String> = ctx
                .live
                .iter()
                .filter(|(_, live)| live.entry.owner == owner)
                .map(|(id, _)| id.clone())
                .collect();
            let lowest = stale
                .iter()
                .filter_map(|id| ctx.live.remove(id))
                .map(|live| live.scope_mark)
                .min_by_key(|mark| mark.depth());
            if let Some(mark) = lowest {
                ctx.tagger.leave_scope(mark);
            }
            (stale, ctx.tagger.clear_phases())
        });
        if !stale_fixtures.is_empty() || open_phases > 0 {
            warn!(
                test = test_id,
                fixtures = ?stale_fixtures,
                open_phases,
                "test finished with fixtures still active"
            );
        }
        let retired = run.retire_idle_context();
        debug!(test = test_id, retired, "test finished");
    }

    pub fn on_fixture_setup_start(&self, fixture_id: &str, scope: Scope) {
        let Some(run) = &self.run else {
            return;
        };
        let session_id = run.session_id();
        let replaced = run.with_context(|ctx| {
            let test = ctx.current_test.as_ref();
            let owner = match (scope, test) {
                (Scope::Module, Some(test)) => ScopeOwner::Module(test.module.clone()),
                (Scope::Function, Some(test)) => ScopeOwner::Function(test.id.clone()),
                (Scope::Session, _) | (_, None) => ScopeOwner::Session(session_id.to_string()),
            };
            let module = match owner {
                ScopeOwner::Session(_) => None,
                _ => test.map(|test| test.module.clone()),
            };
            let entry = ScopeEntry {
                owner,
                module,
                fixture: Some(fixture_id.to_string()),
            };
            let scope_mark = ctx.tagger.enter_scope(entry.clone());
            let setup = ctx.tagger.enter_phase(Phase::Setup);
            ctx.live
                .insert(
                    fixture_id.to_string(),
                    LiveFixture {
                        entry,
                        scope_mark,
                        setup_phase: Some(setup),
                        teardown_phase: None,
                    },
                )
                .is_some()
        });
        if replaced {
            warn!(fixture = fixture_id, "fixture set up again before its teardown");
        }
    }

    pub fn on_fixture_setup_end(&self, fixture_id: &str) {
        let Some(run) = &self.run else {
            return;
        };
        let known = run.with_context(|ctx| {
            let Some(live) = ctx.live.get_mut(fixture_id) else {
                return false;
            };
            if let Some(setup) = live.setup_phase.take() {
                ctx.tagger.leave_phase(setup);
            }
            true
        });
        if !known {
            warn!(fixture = fixture_id, "setup end for unknown fixture");
        }
    }

    pub fn on_test_call_start(&self, test_id: &str) {
        let Some(run) = &self.run else {
            return;
        };
        run.with_context(|ctx| {
            let entry = ScopeEntry {
                owner: ScopeOwner::Function(test_id.to_string()),
                module: ctx.module_of(test_id),
                fixture: None,
            };
            let scope = ctx.tagger.enter_scope(entry);
            let phase = ctx.tagger.enter_phase(Phase::Test);
            ctx.call = Some((scope, phase));
        });
    }

    pub fn on_test_call_end(&self, test_id: &str) {
        let Some(run) = &self.run else {
            return;
        };
        let stale = run.with_context(|ctx| {
            ctx.call.take().map(|(scope, phase)| {
                ctx.tagger.leave_phase(phase) + ctx.tagger.leave_scope(scope)
            })
        });
        match stale {
            None => warn!(test = test_id, "call end without call start"),
            Some(0) => {}
            Some(frames) => debug!(test = test_id, frames, "discarded stale frames after call"),
        }
    }

    pub fn on_fixture_teardown_start(&self, fixture_id: &str) {
        let Some(run) = &self.run else {
            return;
        };
        let discarded = run.with_context(|ctx| {
            let live = ctx.live.get_mut(fixture_id)?;
            if let Some(setup) = live.setup_phase.take() {
                ctx.tagger.leave_phase(setup);
            }
            let discarded = if ctx.tagger.scope_at(live.scope_mark) == Some(&live.entry) {
                ctx.tagger.retain_through(live.scope_mark)
            } else {
                live.scope_mark = ctx.tagger.enter_scope(live.entry.clone());
                0
            };
            live.teardown_phase = Some(ctx.tagger.enter_phase(Phase::Test));
            Some(discarded)
        });
        match discarded {
            None => warn!(fixture = fixture_id, "teardown of unknown fixture"),
            Some(0) => {}
            Some(frames) => debug!(fixture = fixture_id, frames, "teardown discarded inner scopes"),
        }
    }

    pub fn on_fixture_teardown_end(&self, fixture_id: &str) {
        let Some(run) = &self.run else {
            return;
        };
        let known = run.with_context(|ctx| {
            let Some(live) = ctx.live.remove(fixture_id) else {
                return false;
            };
            if let Some(teardown) = live.teardown_phase {
                ctx.tagger.leave_phase(teardown);
            }
            ctx.tagger.leave_scope(live.scope_mark);
            true
        });
        if !known {
            warn!(fixture = fixture_id, "teardown end for unknown fixture");
        }
    }

    /// Record `failure` as one `ASSERT` record owned by its test.
    pub fn on_assertion_failure(&self, failure: &AssertionFailure) {
        let Some(run) = &self.run else {
            return;
        };
        let module = run.with_context(|ctx| ctx.module_of(&failure.test_id));
        let tag = Tag {
            phase: Phase::Test,
            owner: ScopeOwner::Function(failure.test_id.clone()),
            module,
            fixture: None,
        };
        let emission = Emission {
            level: Level::Assert,
            message: failure.explanation.clone(),
            source: failure.source.clone(),
        };
        if run.append(emission, tag).is_none() {
            warn!(test = %failure.test_id, "assertion record dropped; buffer full");
        }
    }

    /// Capture a log call made outside `tracing`.
    pub fn capture(&self, emission: Emission) -> Option<u64> {
        self.run.as_ref()?.capture(emission)
    }

    /// End the run and render fragments for `tree`.
    pub fn on_report_assemble(&mut self, tree: &TestTree) -> ReportFragments {
        let Some(run) = self.finish() else {
            return ReportFragments::new();
        };
        for problem in validate_tree(tree) {
            warn!(problem = %problem, "test tree inconsistent");
        }
        self.render(&run, tree)
    }

    /// End an aborted run, rendering fragments for the tests seen so far.
    pub fn on_run_interrupted(&mut self) -> ReportFragments {
        let Some(run) = self.finish() else {
            return ReportFragments::new();
        };
        let tree = run.seen_tree();
        warn!(session_id = run.session_id(), tests = tree.len(), "run interrupted");
        self.render(&run, &tree)
    }

    /// Write the captured state so another process can merge it later.
    ///
    /// Returns `false` when nothing is being captured.
    pub fn flush_dump(&self, path: &Path) -> Result<bool> {
        let Some(run) = &self.run else {
            return Ok(false);
        };
        write_dump(path, &run.snapshot())?;
        Ok(true)
    }

    fn finish(&mut self) -> Option<Arc<RunState>> {
        let run = self.run.take()?;
        self.release(&run);
        if run.overflow() > 0 {
            warn!(
                dropped = run.overflow(),
                max_records = self.config.max_records,
                "record buffer full; later records dropped"
            );
        }
        Some(run)
    }

    fn render(&self, run: &RunState, tree: &TestTree) -> ReportFragments {
        let records = run.records();
        let options = RenderOptions {
            min_level: self.config.log_level,
            project_root: self.project_root.as_deref(),
        };
        assemble(&records, tree, options).fragments
    }

    fn release(&self, run: &Arc<RunState>) {
        if let Err(err) = self.slot.uninstall(run) {
            warn!(error = %err, "failed to uninstall log capture");
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(run) = self.run.take() {
            self.release(&run);
        }
    }
}
