//! `tracing` layer that feeds events into the installed run.
//!
//! The layer itself is stateless: it looks up the run through a
//! [`CaptureSlot`]. Installing a run fills the slot, uninstalling empties it,
//! and an empty slot makes the layer inert, so the layer can stay in the
//! subscriber for the whole process.

use std::fmt::{self, Write};
use std::sync::{Arc, RwLock};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::core::types::{Level, SourceLocation};
use crate::error::CaptureError;
use crate::io::run_state::{Emission, RunState};

/// Events from this crate's own diagnostics are never captured.
const OWN_TARGET: &str = "junit_logging";

/// Field that promotes an `ERROR` event to `CRITICAL`; see [`crate::critical!`].
pub const CRITICAL_FIELD: &str = "critical";

/// Outcome of [`CaptureSlot::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installed {
    Fresh,
    AlreadyInstalled,
}

/// Shared handle through which capture layers find the active run.
#[derive(Debug, Clone, Default)]
pub struct CaptureSlot {
    run: Arc<RwLock<Option<Arc<RunState>>>>,
}

impl CaptureSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `run`. Installing the run already attached is a no-op.
    pub fn install(&self, run: &Arc<RunState>) -> Result<Installed, CaptureError> {
        let mut slot = self.run.write().map_err(|_| CaptureError::Poisoned)?;
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, run) => Ok(Installed::AlreadyInstalled),
            Some(current) => Err(CaptureError::SlotOccupied {
                session_id: current.session_id().to_string(),
            }),
            None => {
                *slot = Some(Arc::clone(run));
                Ok(Installed::Fresh)
            }
        }
    }

    /// Detach `run`. Returns `false` if it was not the installed run.
    pub fn uninstall(&self, run: &Arc<RunState>) -> Result<bool, CaptureError> {
        let mut slot = self.run.write().map_err(|_| CaptureError::Poisoned)?;
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, run) => {
                *slot = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// The installed run, if any.
    pub fn active(&self) -> Option<Arc<RunState>> {
        self.run.read().ok().and_then(|slot| slot.clone())
    }

    pub fn layer(&self) -> CaptureLayer {
        CaptureLayer { slot: self.clone() }
    }
}

/// Layer that turns every event into one record of the installed run.
#[derive(Debug, Clone)]
pub struct CaptureLayer {
    slot: CaptureSlot,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(run) = self.slot.active() else {
            return;
        };
        if event.metadata().target().starts_with(OWN_TARGET) {
            return;
        }
        run.capture(emission_from_event(event));
    }
}

/// Convert a `tracing` event into an untagged emission.
pub fn emission_from_event(event: &Event<'_>) -> Emission {
    let meta = event.metadata();
    let mut visitor = MessageVisitor::default();
    event.record(&mut visitor);

    let level = match *meta.level() {
        tracing::Level::TRACE | tracing::Level::DEBUG => Level::Debug,
        tracing::Level::INFO => Level::Info,
        tracing::Level::WARN => Level::Warning,
        tracing::Level::ERROR if visitor.critical => Level::Critical,
        tracing::Level::ERROR => Level::Error,
    };

    // Events bridged from the `log` facade carry their location as fields.
    let file = meta
        .file()
        .map(str::to_string)
        .or(visitor.log_file.take())
        .unwrap_or_else(|| meta.target().to_string());
    let line = meta.line().or(visitor.log_line).unwrap_or(0);

    Emission {
        level,
        message: visitor.finish(),
        source: SourceLocation::new(file, line),
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
    /// Non-message fields rendered as `key=value`.
    fields: String,
    critical: bool,
    log_file: Option<String>,
    log_line: Option<u32>,
}

impl MessageVisitor {
    fn push_field(&mut self, field: &Field, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        // Writing into a String cannot fail.
        let _ = write!(self.fields, "{}={}", field.name(), value);
    }

    fn finish(self) -> String {
        match (self.message, self.fields.is_empty()) {
            (Some(message), true) => message,
            (Some(message), false) => format!("{message} {}", self.fields),
            (None, _) => self.fields,
        }
    }
}

impl Visit for MessageVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == CRITICAL_FIELD {
            self.critical = value;
            return;
        }
        self.push_field(field, format_args!("{value}"));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "log.line" {
            self.log_line = u32::try_from(value).ok();
            return;
        }
        self.push_field(field, format_args!("{value}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "log.file" => self.log_file = Some(value.to_string()),
            "log.target" | "log.module_path" => {}
            _ => self.push_field(field, format_args!("{value:?}")),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = Some(format!("{value:?}")),
            "log.target" | "log.module_path" | "log.file" | "log.line" => {}
            _ => self.push_field(field, format_args!("{value:?}")),
        }
    }
}

/// Emit an event captured at `CRITICAL` level.
///
/// ```
/// junit_logging::critical!("database unreachable: {}", "timeout");
/// ```
#[macro_export]
macro_rules! critical {
    ($($arg:tt)+) => {
        $crate::__tracing::error!(critical = true, $($arg)+)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Phase, ScopeOwner};
    use tracing_subscriber::layer::SubscriberExt;

    fn captured(slot: &CaptureSlot, f: impl FnOnce()) {
        let subscriber = tracing_subscriber::registry().with(slot.layer());
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn events_become_records_with_fields() {
        let slot = CaptureSlot::new();
        let run = Arc::new(RunState::new("s", 100));
        slot.install(&run).expect("install");

        captured(&slot, || {
            tracing::warn!(target: "app", user = "ada", attempt = 3, "login failed");
        });

        let records = run.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, Level::Warning);
        assert_eq!(records[0].message, r#"login failed user="ada" attempt=3"#);
        assert_eq!(records[0].phase, Phase::Test);
        assert_eq!(records[0].owner, ScopeOwner::Session("s".to_string()));
        assert!(records[0].source.file.ends_with("sink.rs"));
        assert!(records[0].source.line > 0);
    }

    #[test]
    fn critical_field_promotes_error() {
        let slot = CaptureSlot::new();
        let run = Arc::new(RunState::new("s", 100));
        slot.install(&run).expect("install");

        captured(&slot, || {
            tracing::error!(target: "app", critical = true, "disk gone");
            tracing::error!(target: "app", "just an error");
        });

        let levels: Vec<Level> = run.records().iter().map(|r| r.level).collect();
        assert_eq!(levels, vec![Level::Critical, Level::Error]);
        assert_eq!(run.records()[0].message, "disk gone");
    }

    #[test]
    fn installing_twice_does_not_duplicate() {
        let slot = CaptureSlot::new();
        let run = Arc::new(RunState::new("s", 100));
        assert_eq!(slot.install(&run), Ok(Installed::Fresh));
        assert_eq!(slot.install(&run), Ok(Installed::AlreadyInstalled));

        captured(&slot, || tracing::info!(target: "app", "once"));
        assert_eq!(run.record_count(), 1);
    }

    #[test]
    fn second_run_cannot_take_occupied_slot() {
        let slot = CaptureSlot::new();
        let first = Arc::new(RunState::new("first", 100));
        let second = Arc::new(RunState::new("second", 100));
        slot.install(&first).expect("install");
        assert_eq!(
            slot.install(&second),
            Err(CaptureError::SlotOccupied {
                session_id: "first".to_string()
            })
        );
    }

    #[test]
    fn uninstalled_layer_is_inert() {
        let slot = CaptureSlot::new();
        let run = Arc::new(RunState::new("s", 100));
        slot.install(&run).expect("install");
        assert_eq!(slot.uninstall(&run), Ok(true));
        assert_eq!(slot.uninstall(&run), Ok(false));

        captured(&slot, || tracing::info!(target: "app", "ignored"));
        assert_eq!(run.record_count(), 0);
        assert!(slot.active().is_none());
    }

    #[test]
    fn own_diagnostics_are_not_captured() {
        let slot = CaptureSlot::new();
        let run = Arc::new(RunState::new("s", 100));
        slot.install(&run).expect("install");

        captured(&slot, || {
            tracing::warn!(target: "junit_logging::coordinator", "internal");
            tracing::info!(target: "app", "external");
        });

        let records = run.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "external");
    }
}
