//! Serialization of a test's records into a JUnit `<logs>` fragment.

use std::borrow::Cow;
use std::fmt::Write;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::core::types::{LogRecord, MinLevel};

/// Inputs that do not vary per record.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions<'a> {
    pub min_level: MinLevel,
    /// Source paths are rendered relative to this directory when possible.
    pub project_root: Option<&'a Path>,
}

/// A record that could not be embedded in XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderFailure {
    pub seq: u64,
    pub reason: String,
}

/// Rendered fragment for one test plus the records dropped on the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedLogs {
    /// `None` when no record was retained.
    pub fragment: Option<String>,
    pub retained: usize,
    pub failures: Vec<RenderFailure>,
}

/// Render `records` as `<logs><log .../>...</logs>`.
///
/// Records below `min_level` are skipped, except `ASSERT` records. A record
/// whose message or source cannot be represented in XML is dropped and
/// reported in `failures`; the rest of the test's records are still rendered.
pub fn render_logs(records: &[&LogRecord], options: RenderOptions<'_>) -> RenderedLogs {
    let mut body = String::new();
    let mut rendered = RenderedLogs::default();

    for record in records {
        if !record.level.retained_at(options.min_level) {
            continue;
        }
        match render_log(record, options.project_root) {
            Ok(element) => {
                body.push_str(&element);
                rendered.retained += 1;
            }
            Err(reason) => rendered.failures.push(RenderFailure {
                seq: record.seq,
                reason,
            }),
        }
    }

    if rendered.retained > 0 {
        rendered.fragment = Some(format!("<logs>{body}</logs>"));
    }
    rendered
}

/// Render a single `<log>` element.
pub fn render_log(record: &LogRecord, project_root: Option<&Path>) -> Result<String, String> {
    check_xml_chars(&record.message).map_err(|err| format!("message {err}"))?;
    let src = format!(
        "{}:{}",
        relative_source(&record.source.file, project_root),
        record.source.line
    );
    check_xml_chars(&src).map_err(|err| format!("source {err}"))?;

    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write!(
        out,
        r#"<log step="{}" ts="{}" level="{}" src="{}">{}</log>"#,
        record.phase.as_step(),
        format_timestamp(&record.timestamp),
        record.level.as_str(),
        escape(&src),
        escape(&record.message),
    );
    Ok(out)
}

/// Escape `&`, `<`, `>`, `"` and `'` for text nodes and attribute values.
///
/// `\r` is written as a character reference so that line-end normalization
/// in XML parsers does not rewrite it.
pub fn escape(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['&', '<', '>', '"', '\'', '\r']) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 16);
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '\r' => out.push_str("&#xD;"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// ISO-8601 with microseconds and an explicit `+00:00` offset.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Render `file` relative to `root`, or unchanged if it is not under `root`.
pub fn relative_source(file: &str, root: Option<&Path>) -> String {
    let path = Path::new(file);
    match root.and_then(|root| path.strip_prefix(root).ok()) {
        Some(relative) if !relative.as_os_str().is_empty() => {
            relative.to_string_lossy().replace('\\', "/")
        }
        _ => file.to_string(),
    }
}

/// Reject characters XML 1.0 cannot carry, even escaped.
fn check_xml_chars(raw: &str) -> Result<(), String> {
    match raw.chars().find(|ch| !is_xml_char(*ch)) {
        Some(ch) => Err(format!("contains U+{:04X}, not allowed in XML", ch as u32)),
        None => Ok(()),
    }
}

fn is_xml_char(ch: char) -> bool {
    matches!(
        ch,
        '\t' | '\n' | '\r' | '\u{20}'..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}'
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Level, Phase, ScopeOwner};
    use crate::test_support::record_at;

    fn options(min_level: MinLevel) -> RenderOptions<'static> {
        RenderOptions {
            min_level,
            project_root: Some(Path::new("/workspace")),
        }
    }

    fn session_record(seq: u64, level: Level, message: &str) -> LogRecord {
        record_at(
            seq,
            level,
            message,
            Phase::Test,
            ScopeOwner::Session("s".to_string()),
        )
    }

    #[test]
    fn renders_attributes_and_relative_source() {
        let mut record = session_record(1, Level::Info, "Test log message");
        record.source.file = "/workspace/tests/test_example.py".to_string();
        record.source.line = 42;
        let rendered = render_log(&record, Some(Path::new("/workspace"))).expect("render");
        assert_eq!(
            rendered,
            format!(
                r#"<log step="test" ts="{}" level="INFO" src="tests/test_example.py:42">Test log message</log>"#,
                format_timestamp(&record.timestamp)
            )
        );
    }

    #[test]
    fn escapes_markup_in_message() {
        assert_eq!(
            escape("Error: <value> should be > 5 & < 10"),
            "Error: &lt;value&gt; should be &gt; 5 &amp; &lt; 10"
        );
        assert_eq!(escape(r#"say "hi" it's"#), "say &quot;hi&quot; it&#x27;s");
        assert!(matches!(escape("plain"), Cow::Borrowed("plain")));
    }

    #[test]
    fn carriage_returns_survive_parsing() {
        let raw = "first\r\nsecond\rthird <end>";
        let record = session_record(1, Level::Info, raw);
        let fragment = render_logs(&[&record], options(MinLevel::Debug))
            .fragment
            .expect("fragment");
        assert!(fragment.contains("first&#xD;\nsecond&#xD;third"));

        let doc = roxmltree::Document::parse(&fragment).expect("parse fragment");
        let log = doc
            .descendants()
            .find(|node| node.has_tag_name("log"))
            .expect("log element");
        assert_eq!(log.text(), Some(raw));
    }

    #[test]
    fn timestamp_has_microseconds_and_offset() {
        let ts = DateTime::parse_from_rfc3339("2025-11-27T10:00:00.5Z")
            .expect("parse")
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(&ts), "2025-11-27T10:00:00.500000+00:00");
    }

    #[test]
    fn source_outside_root_is_kept_verbatim() {
        assert_eq!(
            relative_source("/opt/lib/site.py", Some(Path::new("/workspace"))),
            "/opt/lib/site.py"
        );
        assert_eq!(relative_source("src/lib.rs", None), "src/lib.rs");
        assert_eq!(
            relative_source("/workspace/tests with spaces/t-file.py", Some(Path::new("/workspace"))),
            "tests with spaces/t-file.py"
        );
    }

    #[test]
    fn threshold_drops_records_but_keeps_assert() {
        let debug = session_record(1, Level::Debug, "debug");
        let info = session_record(2, Level::Info, "info");
        let assert = session_record(3, Level::Assert, "assert x == 1");
        let records = vec![&debug, &info, &assert];

        let rendered = render_logs(&records, options(MinLevel::Critical));
        assert_eq!(rendered.retained, 1);
        let fragment = rendered.fragment.expect("fragment");
        assert!(fragment.contains(r#"level="ASSERT""#));
        assert!(!fragment.contains("info"));
    }

    #[test]
    fn raising_threshold_never_retains_more() {
        let levels = [
            Level::Debug,
            Level::Info,
            Level::Warning,
            Level::Error,
            Level::Critical,
            Level::Assert,
        ];
        let owned: Vec<LogRecord> = levels
            .iter()
            .enumerate()
            .map(|(idx, level)| session_record(idx as u64, *level, "m"))
            .collect();
        let records: Vec<&LogRecord> = owned.iter().collect();

        let counts: Vec<usize> = MinLevel::ALL
            .iter()
            .map(|level| render_logs(&records, options(*level)).retained)
            .collect();
        assert_eq!(counts, vec![6, 5, 4, 3, 2]);
    }

    #[test]
    fn empty_selection_renders_nothing() {
        let debug = session_record(1, Level::Debug, "debug");
        let rendered = render_logs(&[&debug], options(MinLevel::Info));
        assert_eq!(rendered, RenderedLogs::default());
    }

    #[test]
    fn invalid_character_drops_only_that_record() {
        let bad = session_record(1, Level::Info, "bell \u{7} rings");
        let good = session_record(2, Level::Info, "fine");
        let rendered = render_logs(&[&bad, &good], options(MinLevel::Debug));
        assert_eq!(rendered.retained, 1);
        assert_eq!(rendered.failures.len(), 1);
        assert_eq!(rendered.failures[0].seq, 1);
        assert!(rendered.failures[0].reason.contains("U+0007"));
        assert!(rendered.fragment.expect("fragment").contains("fine"));
    }

    #[test]
    fn escaped_message_parses_back_to_original() {
        let original = r#"<tag attr="v"> & 'quoted' >"#;
        let record = session_record(1, Level::Warning, original);
        let rendered = render_logs(&[&record], options(MinLevel::Debug));
        let fragment = rendered.fragment.expect("fragment");

        let doc = roxmltree::Document::parse(&fragment).expect("parse fragment");
        let log = doc
            .root_element()
            .children()
            .find(|node| node.has_tag_name("log"))
            .expect("log element");
        assert_eq!(log.text(), Some(original));
        assert_eq!(log.attribute("level"), Some("WARNING"));
        assert_eq!(log.attribute("step"), Some("test"));
    }
}
