//! Distribution of the run's tagged record stream onto the test tree.
//!
//! Each scope owner is indexed to the tests that depend on it once; records
//! are then walked a single time in capture order and pushed onto the list of
//! every dependent test. Session records fan out to every test, module records
//! to the tests of that module, function records to exactly one test.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::core::types::{LogRecord, Scope, ScopeOwner, TestNode, TestTree};

/// A record owner that did not match the tree, and where it was attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved {
    pub owner: ScopeOwner,
    /// Broadest enclosing known scope the records were attached to instead.
    pub attached_to: ScopeOwner,
    /// Number of records affected.
    pub records: usize,
}

/// Per-test ordered record subsequences.
#[derive(Debug)]
pub struct Distribution<'a> {
    tests: Vec<&'a TestNode>,
    per_test: Vec<Vec<&'a LogRecord>>,
    /// Owners that fell back to a broader scope, in first-seen order.
    pub unresolved: Vec<Unresolved>,
}

impl<'a> Distribution<'a> {
    /// Records for `test_id`, in capture order. Empty for unknown tests.
    pub fn records_for(&self, test_id: &str) -> &[&'a LogRecord] {
        self.tests
            .iter()
            .position(|test| test.id == test_id)
            .map(|idx| self.per_test[idx].as_slice())
            .unwrap_or(&[])
    }

    /// Iterate `(test, records)` in tree order.
    pub fn iter(&self) -> impl Iterator<Item = (&'a TestNode, &[&'a LogRecord])> + '_ {
        self.tests
            .iter()
            .copied()
            .zip(self.per_test.iter().map(Vec::as_slice))
    }
}

struct OwnerIndex<'a> {
    session_id: &'a str,
    all: Vec<usize>,
    modules: HashMap<&'a str, Vec<usize>>,
    tests: HashMap<&'a str, usize>,
}

impl<'a> OwnerIndex<'a> {
    fn build(tests: &[&'a TestNode], session_id: &'a str) -> Self {
        let mut modules: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut by_id = HashMap::new();
        for (idx, test) in tests.iter().enumerate() {
            modules.entry(test.module.as_str()).or_default().push(idx);
            by_id.insert(test.id.as_str(), idx);
        }
        Self {
            session_id,
            all: (0..tests.len()).collect(),
            modules,
            tests: by_id,
        }
    }

    fn module(&self, id: &str) -> Option<&[usize]> {
        self.modules.get(id).map(Vec::as_slice)
    }

    fn test(&self, id: &str) -> Option<&[usize]> {
        self.tests.get(id).map(std::slice::from_ref)
    }

    /// Dependent tests for the record's owner, plus the fallback owner when
    /// the exact owner is unknown.
    fn resolve(&self, record: &LogRecord) -> (&[usize], Option<ScopeOwner>) {
        match &record.owner {
            ScopeOwner::Session(id) if id == self.session_id => (self.all.as_slice(), None),
            ScopeOwner::Session(_) => (self.all.as_slice(), Some(self.session_owner())),
            ScopeOwner::Module(id) => match self.module(id) {
                Some(targets) => (targets, None),
                None => (self.all.as_slice(), Some(self.session_owner())),
            },
            ScopeOwner::Function(id) => match self.test(id) {
                Some(targets) => (targets, None),
                None => self.module_fallback(record.module.as_deref()),
            },
        }
    }

    fn module_fallback(&self, module: Option<&str>) -> (&[usize], Option<ScopeOwner>) {
        if let Some((id, targets)) = module.and_then(|id| self.module(id).map(|t| (id, t))) {
            return (targets, Some(ScopeOwner::Module(id.to_string())));
        }
        (self.all.as_slice(), Some(self.session_owner()))
    }

    fn session_owner(&self) -> ScopeOwner {
        ScopeOwner::Session(self.session_id.to_string())
    }
}

/// Compute every test's record subsequence.
///
/// Records are ordered by `(timestamp, seq)` before distribution, so each
/// per-test list comes out in global capture order without a per-test sort.
pub fn distribute<'a>(records: &'a [LogRecord], tree: &'a TestTree) -> Distribution<'a> {
    let tests: Vec<&TestNode> = tree.tests().collect();
    let index = OwnerIndex::build(&tests, &tree.session_id);

    let mut ordered: Vec<&LogRecord> = records.iter().collect();
    ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));

    let mut per_test: Vec<Vec<&LogRecord>> = vec![Vec::new(); tests.len()];
    let mut unresolved: Vec<Unresolved> = Vec::new();
    let mut unresolved_at: HashMap<ScopeOwner, usize> = HashMap::new();

    for record in ordered {
        let (targets, fallback) = index.resolve(record);
        for &idx in targets {
            per_test[idx].push(record);
        }
        if let Some(attached_to) = fallback {
            let slot = *unresolved_at
                .entry(record.owner.clone())
                .or_insert_with(|| {
                    unresolved.push(Unresolved {
                        owner: record.owner.clone(),
                        attached_to,
                        records: 0,
                    });
                    unresolved.len() - 1
                });
            unresolved[slot].records += 1;
        }
    }

    Distribution {
        tests,
        per_test,
        unresolved,
    }
}

/// Check the tree for ids that would make attribution ambiguous.
///
/// Returns one message per problem: duplicate test ids, and module ids that
/// collide with the session id.
pub fn validate_tree(tree: &TestTree) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for module in &tree.modules {
        if module.id == tree.session_id {
            errors.push(format!("module '{}' shares the session id", module.id));
        }
        for test in &module.tests {
            if test.module != module.id {
                errors.push(format!(
                    "test '{}' declares module '{}' but is listed under '{}'",
                    test.id, test.module, module.id
                ));
            }
            if !seen.insert(test.id.as_str()) {
                errors.push(format!("duplicate test id '{}'", test.id));
            }
        }
    }
    errors
}

/// Count records per scope, for diagnostics.
pub fn scope_counts(records: &[LogRecord]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        let key = match record.scope() {
            Scope::Session => "session",
            Scope::Module => "module",
            Scope::Function => "function",
        };
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Level, Phase};
    use crate::test_support::{record_at, test_node};

    fn messages(dist: &Distribution<'_>, test_id: &str) -> Vec<String> {
        dist.records_for(test_id)
            .iter()
            .map(|record| record.message.clone())
            .collect()
    }

    fn tree() -> TestTree {
        TestTree::from_tests(
            "session",
            vec![
                test_node("tests.test_a", "TestA", "test_1"),
                test_node("tests.test_a", "TestA", "test_2"),
                test_node("tests.test_b", "TestB", "test_3"),
            ],
        )
    }

    #[test]
    fn session_records_reach_every_test() {
        let records = vec![record_at(
            1,
            Level::Info,
            "boot",
            Phase::Setup,
            ScopeOwner::Session("session".to_string()),
        )];
        let tree = tree();
        let dist = distribute(&records, &tree);
        for test in tree.tests() {
            assert_eq!(messages(&dist, &test.id), vec!["boot"]);
        }
        assert!(dist.unresolved.is_empty());
    }

    #[test]
    fn module_records_stay_in_module() {
        let records = vec![record_at(
            1,
            Level::Info,
            "M",
            Phase::Setup,
            ScopeOwner::Module("tests.test_a".to_string()),
        )];
        let tree = tree();
        let dist = distribute(&records, &tree);
        assert_eq!(messages(&dist, "tests.test_a.TestA.test_1"), vec!["M"]);
        assert_eq!(messages(&dist, "tests.test_a.TestA.test_2"), vec!["M"]);
        assert!(messages(&dist, "tests.test_b.TestB.test_3").is_empty());
    }

    #[test]
    fn function_records_stay_in_their_test() {
        let records = vec![
            record_at(
                1,
                Level::Debug,
                "one",
                Phase::Test,
                ScopeOwner::Function("tests.test_a.TestA.test_1".to_string()),
            ),
            record_at(
                2,
                Level::Debug,
                "two",
                Phase::Test,
                ScopeOwner::Function("tests.test_a.TestA.test_2".to_string()),
            ),
        ];
        let tree = tree();
        let dist = distribute(&records, &tree);
        assert_eq!(messages(&dist, "tests.test_a.TestA.test_1"), vec!["one"]);
        assert_eq!(messages(&dist, "tests.test_a.TestA.test_2"), vec!["two"]);
    }

    #[test]
    fn mixed_scopes_keep_capture_order() {
        let t1 = "tests.test_a.TestA.test_1".to_string();
        let records = vec![
            record_at(1, Level::Info, "1", Phase::Setup, ScopeOwner::Session("session".into())),
            record_at(2, Level::Info, "2", Phase::Setup, ScopeOwner::Module("tests.test_a".into())),
            record_at(3, Level::Info, "3", Phase::Setup, ScopeOwner::Function(t1.clone())),
            record_at(4, Level::Debug, "4", Phase::Test, ScopeOwner::Function(t1.clone())),
            record_at(5, Level::Info, "5", Phase::Test, ScopeOwner::Function(t1.clone())),
        ];
        let tree = tree();
        let dist = distribute(&records, &tree);
        assert_eq!(messages(&dist, &t1), vec!["1", "2", "3", "4", "5"]);
    }

    #[test]
    fn equal_timestamps_fall_back_to_sequence() {
        let t1 = "tests.test_a.TestA.test_1".to_string();
        let owner = ScopeOwner::Function(t1.clone());
        let mut late = record_at(7, Level::Info, "late", Phase::Test, owner.clone());
        let mut early = record_at(3, Level::Info, "early", Phase::Test, owner);
        early.timestamp = late.timestamp;
        late.seq = 9;
        early.seq = 4;
        let records = vec![late, early];
        let tree = tree();
        let dist = distribute(&records, &tree);
        assert_eq!(messages(&dist, &t1), vec!["early", "late"]);
    }

    #[test]
    fn unknown_function_owner_falls_back_to_module() {
        let mut record = record_at(
            1,
            Level::Info,
            "param",
            Phase::Setup,
            ScopeOwner::Function("tests.test_a.TestA.test_gone[x]".to_string()),
        );
        record.module = Some("tests.test_a".to_string());
        let records = vec![record.clone(), record];
        let tree = tree();
        let dist = distribute(&records, &tree);

        assert_eq!(messages(&dist, "tests.test_a.TestA.test_1"), vec!["param", "param"]);
        assert!(messages(&dist, "tests.test_b.TestB.test_3").is_empty());
        assert_eq!(
            dist.unresolved,
            vec![Unresolved {
                owner: ScopeOwner::Function("tests.test_a.TestA.test_gone[x]".to_string()),
                attached_to: ScopeOwner::Module("tests.test_a".to_string()),
                records: 2,
            }]
        );
    }

    #[test]
    fn unknown_module_owner_falls_back_to_session() {
        let records = vec![record_at(
            1,
            Level::Info,
            "stray",
            Phase::Setup,
            ScopeOwner::Module("tests.test_missing".to_string()),
        )];
        let tree = tree();
        let dist = distribute(&records, &tree);
        for test in tree.tests() {
            assert_eq!(messages(&dist, &test.id), vec!["stray"]);
        }
        assert_eq!(
            dist.unresolved[0].attached_to,
            ScopeOwner::Session("session".to_string())
        );
    }

    #[test]
    fn validate_tree_reports_duplicates() {
        let tree = TestTree::from_tests(
            "s",
            vec![test_node("m", "C", "t"), test_node("m", "C", "t")],
        );
        let errors = validate_tree(&tree);
        assert!(errors.iter().any(|err| err.contains("duplicate test id")));
    }

    #[test]
    fn scope_counts_group_by_scope() {
        let records = vec![
            record_at(1, Level::Info, "a", Phase::Setup, ScopeOwner::Session("s".into())),
            record_at(2, Level::Info, "b", Phase::Test, ScopeOwner::Function("t".into())),
            record_at(3, Level::Info, "c", Phase::Test, ScopeOwner::Function("t".into())),
        ];
        let counts = scope_counts(&records);
        assert_eq!(counts.get("session"), Some(&1));
        assert_eq!(counts.get("function"), Some(&2));
        assert_eq!(counts.get("module"), None);
    }
}
