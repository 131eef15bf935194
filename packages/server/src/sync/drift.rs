//! Drift map: minimal rerun advice for changed paths.
//!
//! A declarative rule list maps path prefixes or globs onto the fixture
//! refresh commands, minimal tests and minimal gates a change to those
//! paths requires. `collect_rerun_advice` is a pure function of its
//! inputs so tooling can call it offline.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct DriftRule {
    /// Path prefix match; either this or `glob` must be set.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Glob match supporting `*` (any run) and `?` (one char).
    #[serde(default)]
    pub glob: Option<String>,
    #[serde(default)]
    pub fixture_refresh_commands: Vec<String>,
    #[serde(default)]
    pub minimal_tests: Vec<String>,
    #[serde(default)]
    pub minimal_gates: Vec<String>,
}

impl DriftRule {
    fn matches(&self, path: &str) -> bool {
        if let Some(prefix) = &self.prefix {
            if path.starts_with(prefix.as_str()) {
                return true;
            }
        }
        if let Some(glob) = &self.glob {
            if glob_match(glob, path) {
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DriftMap {
    #[serde(default)]
    pub rules: Vec<DriftRule>,
}

impl DriftMap {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// The advice envelope returned to tooling.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RerunAdvice {
    pub fixture_refresh_commands: Vec<String>,
    pub minimal_tests: Vec<String>,
    pub minimal_gates: Vec<String>,
}

impl RerunAdvice {
    pub fn is_empty(&self) -> bool {
        self.fixture_refresh_commands.is_empty()
            && self.minimal_tests.is_empty()
            && self.minimal_gates.is_empty()
    }
}

/// Union the advice of every rule matched by any changed path. Paths and
/// advice entries are deduplicated; rule order is preserved.
pub fn collect_rerun_advice(map: &DriftMap, changed_paths: &[String]) -> RerunAdvice {
    let mut seen_paths = std::collections::HashSet::new();
    let paths: Vec<&String> = changed_paths
        .iter()
        .filter(|p| !p.is_empty() && seen_paths.insert(p.as_str()))
        .collect();

    let mut advice = RerunAdvice::default();
    for rule in &map.rules {
        if paths.iter().any(|path| rule.matches(path)) {
            extend_dedup(&mut advice.fixture_refresh_commands, &rule.fixture_refresh_commands);
            extend_dedup(&mut advice.minimal_tests, &rule.minimal_tests);
            extend_dedup(&mut advice.minimal_gates, &rule.minimal_gates);
        }
    }
    advice
}

fn extend_dedup(target: &mut Vec<String>, items: &[String]) {
    for item in items {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

/// Minimal fnmatch: `*` matches any run of characters, `?` exactly one.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(pattern: &[u8], text: &[u8]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], text)
                    || (!text.is_empty() && inner(pattern, &text[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if p == t => inner(&pattern[1..], &text[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> DriftMap {
        DriftMap::from_json(
            r#"{
                "rules": [
                    {
                        "prefix": "migrations/",
                        "fixture_refresh_commands": ["make refresh-db-fixtures"],
                        "minimal_tests": ["cargo test -p engram-server --test queue_tests"],
                        "minimal_gates": ["schema-drift-check"]
                    },
                    {
                        "glob": "src/sync/handlers/*.rs",
                        "minimal_tests": ["cargo test -p engram-server handlers"],
                        "minimal_gates": ["contract-check"]
                    },
                    {
                        "glob": "schemas/*.schema.json",
                        "fixture_refresh_commands": ["make regen-contract-fixtures"],
                        "minimal_tests": ["cargo test -p engram-server payload"],
                        "minimal_gates": ["contract-check"]
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn prefix_rule_matches() {
        let advice = collect_rerun_advice(
            &sample_map(),
            &["migrations/0006_new_table.sql".to_string()],
        );
        assert_eq!(advice.fixture_refresh_commands, ["make refresh-db-fixtures"]);
        assert_eq!(advice.minimal_gates, ["schema-drift-check"]);
    }

    #[test]
    fn glob_rule_matches() {
        let advice = collect_rerun_advice(
            &sample_map(),
            &["src/sync/handlers/svn.rs".to_string()],
        );
        assert_eq!(advice.minimal_tests, ["cargo test -p engram-server handlers"]);
    }

    #[test]
    fn union_dedups_shared_gates() {
        let advice = collect_rerun_advice(
            &sample_map(),
            &[
                "src/sync/handlers/svn.rs".to_string(),
                "schemas/scm_sync_result_v2.schema.json".to_string(),
            ],
        );
        // contract-check appears in both matched rules exactly once.
        assert_eq!(advice.minimal_gates, ["contract-check"]);
        assert_eq!(advice.minimal_tests.len(), 2);
    }

    #[test]
    fn unmatched_paths_yield_no_advice() {
        let advice = collect_rerun_advice(&sample_map(), &["README.md".to_string()]);
        assert!(advice.is_empty());
    }

    #[test]
    fn duplicate_and_empty_paths_are_ignored() {
        let advice = collect_rerun_advice(
            &sample_map(),
            &[
                "migrations/a.sql".to_string(),
                "migrations/a.sql".to_string(),
                String::new(),
            ],
        );
        assert_eq!(advice.fixture_refresh_commands.len(), 1);
    }

    #[test]
    fn glob_matcher_semantics() {
        assert!(glob_match("src/*/mod.rs", "src/sync/mod.rs"));
        assert!(glob_match("*.sql", "0001_create.sql"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(!glob_match("src/*.rs", "src/sync/mod.go"));
    }
}
