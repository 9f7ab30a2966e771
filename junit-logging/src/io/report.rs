//! Insertion of rendered `<logs>` fragments into an existing JUnit report.
//!
//! The report is parsed only to locate `<testcase>` elements; everything
//! outside the insertion points is copied byte for byte.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::types::testcase_id;

/// Result of merging fragments into a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub xml: String,
    /// Number of `<testcase>` elements that received a fragment.
    pub merged: usize,
    /// Fragment ids that matched no `<testcase>`, sorted.
    pub unmatched: Vec<String>,
}

struct Edit {
    at: usize,
    /// Bytes of the original replaced at `at`.
    replace: usize,
    text: String,
}

/// Insert each fragment as the last child of the `<testcase>` whose
/// `classname.name` equals the fragment's key.
pub fn merge_into_report(xml: &str, fragments: &BTreeMap<String, String>) -> Result<MergeOutcome> {
    let doc = roxmltree::Document::parse(xml).map_err(|err| anyhow!("parse junit xml: {err}"))?;

    let mut edits = Vec::new();
    let mut matched = BTreeSet::new();
    for node in doc.descendants().filter(|node| node.has_tag_name("testcase")) {
        let id = testcase_id(
            node.attribute("classname").unwrap_or_default(),
            node.attribute("name").unwrap_or_default(),
        );
        let Some(fragment) = fragments.get(&id) else {
            continue;
        };
        edits.push(insertion(xml, node.range(), fragment)?);
        matched.insert(id);
    }

    let merged = edits.len();
    edits.sort_by_key(|edit| edit.at);
    let mut out = xml.to_string();
    for edit in edits.into_iter().rev() {
        out.replace_range(edit.at..edit.at + edit.replace, &edit.text);
    }

    let unmatched = fragments
        .keys()
        .filter(|id| !matched.contains(*id))
        .cloned()
        .collect();
    Ok(MergeOutcome {
        xml: out,
        merged,
        unmatched,
    })
}

fn insertion(xml: &str, range: std::ops::Range<usize>, fragment: &str) -> Result<Edit> {
    let element = &xml[range.clone()];
    if element.ends_with("/>") {
        let tag = element[1..]
            .split(|ch: char| ch.is_whitespace() || ch == '/' || ch == '>')
            .next()
            .unwrap_or("testcase");
        return Ok(Edit {
            at: range.end - 2,
            replace: 2,
            text: format!(">{fragment}</{tag}>"),
        });
    }
    let close = element
        .rfind("</")
        .ok_or_else(|| anyhow!("testcase element without closing tag at byte {}", range.start))?;
    Ok(Edit {
        at: range.start + close,
        replace: 0,
        text: fragment.to_string(),
    })
}

/// Merge fragments into the report at `report`, writing to `output`.
#[instrument(skip_all, fields(report = %report.display(), fragments = fragments.len()))]
pub fn merge_report_file(
    report: &Path,
    output: &Path,
    fragments: &BTreeMap<String, String>,
) -> Result<MergeOutcome> {
    let xml = fs::read_to_string(report).with_context(|| format!("read {}", report.display()))?;
    let outcome =
        merge_into_report(&xml, fragments).with_context(|| format!("merge {}", report.display()))?;
    write_atomic(output, &outcome.xml)?;
    debug!(merged = outcome.merged, unmatched = outcome.unmatched.len(), "report merged");
    Ok(outcome)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("xml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp report {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace report {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<testsuites><testsuite name="pytest" tests="3">
<testcase classname="tests.test_a.TestA" name="test_1" time="0.001" />
<testcase classname="tests.test_a.TestA" name="test_2" time="0.002"><failure message="boom">trace</failure></testcase>
<testcase classname="tests.test_b" name="test_3" time="0.003"/>
</testsuite></testsuites>
"#;

    fn fragments(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(id, frag)| (id.to_string(), frag.to_string()))
            .collect()
    }

    fn logs_of<'a>(doc: &'a roxmltree::Document<'a>, name: &str) -> Vec<&'a str> {
        doc.descendants()
            .filter(|node| node.has_tag_name("testcase") && node.attribute("name") == Some(name))
            .flat_map(|case| case.descendants().filter(|node| node.has_tag_name("log")))
            .filter_map(|log| log.text())
            .collect()
    }

    #[test]
    fn fragments_land_in_matching_testcases() {
        let frags = fragments(&[
            ("tests.test_a.TestA.test_1", "<logs><log>one</log></logs>"),
            ("tests.test_a.TestA.test_2", "<logs><log>two</log></logs>"),
        ]);
        let outcome = merge_into_report(REPORT, &frags).expect("merge");
        assert_eq!(outcome.merged, 2);
        assert!(outcome.unmatched.is_empty());

        let doc = roxmltree::Document::parse(&outcome.xml).expect("parse merged");
        assert_eq!(logs_of(&doc, "test_1"), vec!["one"]);
        assert_eq!(logs_of(&doc, "test_2"), vec!["two"]);
        assert!(logs_of(&doc, "test_3").is_empty());
    }

    #[test]
    fn logs_follow_existing_children() {
        let frags = fragments(&[("tests.test_a.TestA.test_2", "<logs><log>two</log></logs>")]);
        let outcome = merge_into_report(REPORT, &frags).expect("merge");
        assert!(
            outcome
                .xml
                .contains("<failure message=\"boom\">trace</failure><logs><log>two</log></logs></testcase>")
        );
    }

    #[test]
    fn self_closing_testcase_is_opened() {
        let frags = fragments(&[("tests.test_b.test_3", "<logs><log>three</log></logs>")]);
        let outcome = merge_into_report(REPORT, &frags).expect("merge");
        assert!(outcome.xml.contains(
            r#"<testcase classname="tests.test_b" name="test_3" time="0.003"><logs><log>three</log></logs></testcase>"#
        ));
    }

    #[test]
    fn unknown_ids_are_reported() {
        let frags = fragments(&[("tests.test_z.test_gone", "<logs/>")]);
        let outcome = merge_into_report(REPORT, &frags).expect("merge");
        assert_eq!(outcome.merged, 0);
        assert_eq!(outcome.unmatched, vec!["tests.test_z.test_gone".to_string()]);
        assert_eq!(outcome.xml, REPORT);
    }

    #[test]
    fn malformed_report_is_an_error() {
        let err = merge_into_report("<testsuite><testcase>", &BTreeMap::new()).expect_err("bad xml");
        assert!(err.to_string().contains("parse junit xml"));
    }

    #[test]
    fn merge_report_file_writes_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = temp.path().join("junit.xml");
        let output = temp.path().join("out").join("junit.xml");
        fs::write(&report, REPORT).expect("write report");

        let frags = fragments(&[("tests.test_b.test_3", "<logs><log>three</log></logs>")]);
        let outcome = merge_report_file(&report, &output, &frags).expect("merge");
        assert_eq!(outcome.merged, 1);
        let written = fs::read_to_string(&output).expect("read output");
        assert_eq!(written, outcome.xml);
    }
}
