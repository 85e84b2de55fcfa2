//! Problem store: loads immutable manifests and test bundles from disk,
//! caching parsed problems by file identity so stable content never reparses.

pub mod contracts;
mod model;

pub use model::Problem;
pub use model::RouteInfo;
pub use model::TestCase;

use model::RawCase;
use model::RawManifest;
use model::RawTests;

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::UNIX_EPOCH;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProblemError {
    #[error("invalid problem id: {0}")]
    InvalidId(String),
    #[error("problem not found: {0}")]
    NotFound(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Identity of the on-disk bundle, one entry per file. Changes to mtime or
/// size invalidate the cache entry.
type Fingerprint = Vec<(PathBuf, u128, u64)>;

#[derive(Clone)]
struct CacheEntry {
    fingerprint: Fingerprint,
    problem: Arc<Problem>,
}

pub struct ProblemStore {
    root: PathBuf,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl ProblemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Public tests only; hidden cases are stripped.
    pub fn get_for_run(&self, problem_id: &str) -> Result<Arc<Problem>, ProblemError> {
        let full = self.load(problem_id)?;
        let mut stripped = (*full).clone();
        stripped.hidden_tests.clear();
        Ok(Arc::new(stripped))
    }

    /// Public plus hidden tests.
    pub fn get_for_submit(&self, problem_id: &str) -> Result<Arc<Problem>, ProblemError> {
        self.load(problem_id)
    }

    /// Manifest-level routing data for the submission service.
    pub fn get_route_info(&self, problem_id: &str) -> Result<RouteInfo, ProblemError> {
        let problem = self.load(problem_id)?;
        Ok(RouteInfo {
            id: problem.id.clone(),
            requires_torch: problem.requires_torch,
        })
    }

    fn load(&self, problem_id: &str) -> Result<Arc<Problem>, ProblemError> {
        let dir = safe_problem_path(&self.root, problem_id)?;
        let manifest_path = dir.join("manifest.json");
        if !manifest_path.exists() {
            return Err(ProblemError::NotFound(problem_id.to_string()));
        }
        let public_path = dir.join("public_tests.json");
        let hidden_path = dir.join("hidden_tests.json");

        let fingerprint = fingerprint_files(&[&manifest_path, &public_path, &hidden_path]);
        {
            let cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(entry) = cache.get(problem_id)
                && entry.fingerprint == fingerprint
            {
                return Ok(Arc::clone(&entry.problem));
            }
        }

        let manifest: RawManifest = read_json(&manifest_path)?;
        let public_tests = load_tests(&public_path, false)?;
        let hidden_tests = load_tests(&hidden_path, true)?;

        let problem = Arc::new(Problem {
            id: manifest.id.unwrap_or_else(|| problem_id.to_string()),
            version: manifest
                .version
                .map(|value| match value {
                    serde_json::Value::String(text) => text,
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "v1".to_string()),
            runner: manifest.runner,
            requires_torch: manifest.requires_torch,
            time_limit_s: manifest.time_limit_s,
            memory_mb: manifest.memory_mb,
            comparison: manifest.comparison.unwrap_or_default(),
            public_tests,
            hidden_tests,
        });

        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.insert(
            problem_id.to_string(),
            CacheEntry {
                fingerprint,
                problem: Arc::clone(&problem),
            },
        );
        Ok(problem)
    }
}

/// Reject absolute ids and parent-directory segments before touching disk.
fn safe_problem_path(root: &Path, problem_id: &str) -> Result<PathBuf, ProblemError> {
    if problem_id.is_empty()
        || problem_id.starts_with('/')
        || problem_id.split('/').any(|segment| segment == "..")
    {
        return Err(ProblemError::InvalidId(problem_id.to_string()));
    }
    Ok(root.join(problem_id))
}

fn fingerprint_files(paths: &[&Path]) -> Fingerprint {
    paths
        .iter()
        .filter_map(|path| {
            let meta = std::fs::metadata(path).ok()?;
            let mtime_ns = meta
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |duration| duration.as_nanos());
            Some((path.to_path_buf(), mtime_ns, meta.len()))
        })
        .collect()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ProblemError> {
    let text = std::fs::read_to_string(path).map_err(|source| ProblemError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ProblemError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn load_tests(path: &Path, hidden_file: bool) -> Result<Vec<TestCase>, ProblemError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw: RawTests = read_json(path)?;
    Ok(raw
        .into_cases()
        .into_iter()
        .map(|case| case_from_raw(case, hidden_file))
        .collect())
}

fn case_from_raw(raw: RawCase, hidden_file: bool) -> TestCase {
    let input_code = match (raw.input_code, raw.inputs) {
        (Some(code), _) => code,
        (None, Some(inputs)) => inputs
            .into_iter()
            .map(|(name, value)| {
                let literal = match value {
                    serde_json::Value::String(text) => text,
                    other => other.to_string(),
                };
                format!("{name} = {literal}\n")
            })
            .collect(),
        (None, None) => String::new(),
    };

    let expected = parse_expected(raw.expected, raw.expected_is_code);

    TestCase {
        id: raw
            .id
            .map(|value| match value {
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            })
            .unwrap_or_default(),
        input_code,
        expected,
        hidden: hidden_file || raw.hidden,
        comparison: raw.comparison,
    }
}

/// `expected` strings are Python literals when flagged, JSON otherwise; in
/// both modes an unparseable string stays a string.
fn parse_expected(value: serde_json::Value, expected_is_code: bool) -> serde_json::Value {
    let serde_json::Value::String(text) = value else {
        return value;
    };
    if expected_is_code {
        return judge_vm::parse_python_literal(&text)
            .unwrap_or(serde_json::Value::String(text));
    }
    serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn write_problem(root: &Path, id: &str, manifest: &str, public: &str, hidden: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("manifest.json"), manifest).unwrap();
        std::fs::write(dir.join("public_tests.json"), public).unwrap();
        std::fs::write(dir.join("hidden_tests.json"), hidden).unwrap();
    }

    const MANIFEST: &str = r#"{
        "id": "course/ch1/add",
        "version": "v2",
        "runner": "add(a, b)",
        "requires_torch": false,
        "time_limit_s": 5,
        "memory_mb": 256,
        "comparison": {"type": "exact"}
    }"#;

    #[test]
    fn loads_manifest_and_both_test_files() {
        let tmp = tempfile::tempdir().unwrap();
        write_problem(
            tmp.path(),
            "course/ch1/add",
            MANIFEST,
            r#"{"version": 1, "cases": [{"id": "p1", "input_code": "a = 1\nb = 2", "expected": 3}]}"#,
            r#"{"version": 1, "cases": [{"id": "h1", "input_code": "a = 5\nb = 5", "expected": 10}]}"#,
        );
        let store = ProblemStore::new(tmp.path());

        let submit = store.get_for_submit("course/ch1/add").unwrap();
        assert_eq!(submit.time_limit_s, 5);
        assert_eq!(submit.public_tests.len(), 1);
        assert_eq!(submit.hidden_tests.len(), 1);
        assert!(submit.hidden_tests[0].hidden);

        let run = store.get_for_run("course/ch1/add").unwrap();
        assert_eq!(run.hidden_tests.len(), 0);
        assert_eq!(run.public_tests[0].expected, json!(3));
    }

    #[test]
    fn rejects_traversal_ids_before_touching_disk() {
        let store = ProblemStore::new("/nonexistent");
        for bad in ["/abs/path", "a/../b", ".."] {
            assert!(matches!(
                store.get_for_run(bad),
                Err(ProblemError::InvalidId(_))
            ));
        }
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ProblemStore::new(tmp.path());
        assert!(matches!(
            store.get_for_submit("course/ch1/absent"),
            Err(ProblemError::NotFound(_))
        ));
    }

    #[test]
    fn cache_survives_stable_files_and_invalidates_on_change() {
        let tmp = tempfile::tempdir().unwrap();
        write_problem(
            tmp.path(),
            "course/ch1/add",
            MANIFEST,
            r#"[{"id": "p1", "input_code": "a = 1\nb = 2", "expected": 3}]"#,
            "[]",
        );
        let store = ProblemStore::new(tmp.path());
        let first = store.get_for_submit("course/ch1/add").unwrap();
        let second = store.get_for_submit("course/ch1/add").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // Grow the file so size (and with it the fingerprint) changes.
        let public = tmp.path().join("course/ch1/add/public_tests.json");
        std::fs::write(
            &public,
            r#"[{"id": "p1", "input_code": "a = 7\nb = 2", "expected": 9}]   "#,
        )
        .unwrap();
        let third = store.get_for_submit("course/ch1/add").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.public_tests[0].expected, json!(9));
    }

    #[test]
    fn legacy_inputs_map_becomes_assignments() {
        let tmp = tempfile::tempdir().unwrap();
        write_problem(
            tmp.path(),
            "course/ch1/add",
            MANIFEST,
            r#"[{"id": "p1", "inputs": {"a": "1", "b": "2"}, "expected": 3}]"#,
            "[]",
        );
        let store = ProblemStore::new(tmp.path());
        let problem = store.get_for_submit("course/ch1/add").unwrap();
        let code = &problem.public_tests[0].input_code;
        assert!(code.contains("a = 1\n"), "{code}");
        assert!(code.contains("b = 2\n"), "{code}");
    }

    #[test]
    fn expected_strings_parse_as_json_or_literal() {
        assert_eq!(parse_expected(json!("[1, 2]"), false), json!([1, 2]));
        assert_eq!(parse_expected(json!("not json"), false), json!("not json"));
        assert_eq!(parse_expected(json!("(1, 2)"), true), json!([1, 2]));
        assert_eq!(parse_expected(json!(7), false), json!(7));
    }
}
