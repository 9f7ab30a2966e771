//! Phase and scope stacks that decide how a captured record is tagged.
//!
//! Every enter returns a [`Mark`]; leaving truncates the stack back to that
//! mark. A frame left behind by a failed inner step is therefore discarded
//! together with the frame that encloses it, and the tag in force before the
//! enter is always restored.

use crate::core::types::{Phase, Scope, ScopeOwner};

/// Stack height captured by an enter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark(usize);

impl Mark {
    pub fn depth(self) -> usize {
        self.0
    }
}

/// One pushed scope: who owns records captured while it is on top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeEntry {
    pub owner: ScopeOwner,
    /// Module context, when known.
    pub module: Option<String>,
    /// Fixture that pushed the entry; `None` for test calls.
    pub fixture: Option<String>,
}

impl ScopeEntry {
    pub fn scope(&self) -> Scope {
        self.owner.scope()
    }
}

/// Tag stamped onto a record at capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub phase: Phase,
    pub owner: ScopeOwner,
    pub module: Option<String>,
    pub fixture: Option<String>,
}

/// Scope and phase stacks for one execution context.
#[derive(Debug, Clone)]
pub struct Tagger {
    session_id: String,
    scopes: Vec<ScopeEntry>,
    phases: Vec<Phase>,
}

impl Tagger {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            scopes: Vec::new(),
            phases: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current tag: top of each stack, or `(Test, Session)` when empty.
    pub fn current(&self) -> Tag {
        let phase = self.phases.last().copied().unwrap_or(Phase::Test);
        match self.scopes.last() {
            Some(entry) => Tag {
                phase,
                owner: entry.owner.clone(),
                module: entry.module.clone(),
                fixture: entry.fixture.clone(),
            },
            None => Tag {
                phase,
                owner: ScopeOwner::Session(self.session_id.clone()),
                module: None,
                fixture: None,
            },
        }
    }

    pub fn enter_scope(&mut self, entry: ScopeEntry) -> Mark {
        let mark = Mark(self.scopes.len());
        self.scopes.push(entry);
        mark
    }

    /// Pop the scope pushed at `mark` and anything stacked above it.
    ///
    /// Returns how many frames above the mark were discarded as stale.
    pub fn leave_scope(&mut self, mark: Mark) -> usize {
        truncate_to(&mut self.scopes, mark)
    }

    pub fn enter_phase(&mut self, phase: Phase) -> Mark {
        let mark = Mark(self.phases.len());
        self.phases.push(phase);
        mark
    }

    /// Pop the phase pushed at `mark` and anything stacked above it.
    pub fn leave_phase(&mut self, mark: Mark) -> usize {
        truncate_to(&mut self.phases, mark)
    }

    /// Keep the scope pushed at `mark` on top, discarding frames above it.
    pub fn retain_through(&mut self, mark: Mark) -> usize {
        let keep = mark.0 + 1;
        let discarded = self.scopes.len().saturating_sub(keep);
        self.scopes.truncate(keep);
        discarded
    }

    /// Drop every pushed phase; returns how many were left open.
    pub fn clear_phases(&mut self) -> usize {
        let open = self.phases.len();
        self.phases.clear();
        open
    }

    /// Scope entry stored at `mark`, if it is still on the stack.
    pub fn scope_at(&self, mark: Mark) -> Option<&ScopeEntry> {
        self.scopes.get(mark.0)
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn phase_depth(&self) -> usize {
        self.phases.len()
    }

    /// Guard that restores both stacks to their current height when dropped.
    pub fn guard(&mut self) -> TaggerGuard<'_> {
        let scopes = Mark(self.scopes.len());
        let phases = Mark(self.phases.len());
        TaggerGuard {
            tagger: self,
            scopes,
            phases,
        }
    }
}

fn truncate_to<T>(stack: &mut Vec<T>, mark: Mark) -> usize {
    if stack.len() <= mark.0 {
        return 0;
    }
    let stale = stack.len() - mark.0 - 1;
    stack.truncate(mark.0);
    stale
}

/// Scoped acquisition over a [`Tagger`]; see [`Tagger::guard`].
pub struct TaggerGuard<'a> {
    tagger: &'a mut Tagger,
    scopes: Mark,
    phases: Mark,
}

impl std::ops::Deref for TaggerGuard<'_> {
    type Target = Tagger;

    fn deref(&self) -> &Tagger {
        self.tagger
    }
}

impl std::ops::DerefMut for TaggerGuard<'_> {
    fn deref_mut(&mut self) -> &mut Tagger {
        self.tagger
    }
}

impl Drop for TaggerGuard<'_> {
    fn drop(&mut self) {
        self.tagger.scopes.truncate(self.scopes.0);
        self.tagger.phases.truncate(self.phases.0);
    }
}
