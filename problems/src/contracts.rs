//! Problem corpus contract validation.
//!
//! Operates on the raw bundle files rather than loaded problems so the
//! content pipeline can validate exactly what it wrote to disk.

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractIssue {
    pub file: PathBuf,
    pub case_id: Option<String>,
    pub message: String,
}

impl ContractIssue {
    pub fn render(&self) -> String {
        match &self.case_id {
            Some(case_id) => format!("{}: case={case_id}: {}", self.file.display(), self.message),
            None => format!("{}: {}", self.file.display(), self.message),
        }
    }
}

/// Validate every problem bundle under `problems_root`. Returns one issue per
/// violation; an empty list means the corpus satisfies all contracts.
pub fn validate_problem_contracts(problems_root: &Path) -> Vec<ContractIssue> {
    let mut issues = Vec::new();
    let mut problem_dirs = Vec::new();
    collect_problem_dirs(problems_root, &mut problem_dirs);
    problem_dirs.sort();

    for problem_dir in problem_dirs {
        validate_problem_dir(&problem_dir, &mut issues);
    }
    issues
}

fn collect_problem_dirs(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_problem_dirs(&path, out);
        } else if path.file_name().is_some_and(|name| name == "manifest.json") {
            out.push(dir.to_path_buf());
        }
    }
}

fn validate_problem_dir(problem_dir: &Path, issues: &mut Vec<ContractIssue>) {
    let manifest_path = problem_dir.join("manifest.json");
    let public_path = problem_dir.join("public_tests.json");
    let hidden_path = problem_dir.join("hidden_tests.json");

    if !public_path.exists() {
        issues.push(issue(&public_path, None, "missing public_tests.json"));
        return;
    }
    if !hidden_path.exists() {
        issues.push(issue(&hidden_path, None, "missing hidden_tests.json"));
        return;
    }

    let Some(manifest) = load_json(&manifest_path, issues) else {
        return;
    };
    check_positive_limit(&manifest, "time_limit_s", &manifest_path, issues);
    check_positive_limit(&manifest, "memory_mb", &manifest_path, issues);
    let runner = manifest
        .get("runner")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    if runner.trim().is_empty() {
        issues.push(issue(&manifest_path, None, "runner must be a non-empty string"));
        return;
    }
    if let Err(err) = judge_vm::Vm::new(false).check_runner(runner) {
        issues.push(issue(&manifest_path, None, &err.to_string()));
        return;
    }
    let runner_inputs = runner_input_names(runner);

    // Case ids must be unique across the whole problem, both files included.
    let mut seen_ids: BTreeSet<String> = BTreeSet::new();

    for (tests_path, hidden_file) in [(&public_path, false), (&hidden_path, true)] {
        let Some(tests_raw) = load_json(tests_path, issues) else {
            continue;
        };
        for (index, case) in iter_cases(&tests_raw).into_iter().enumerate() {
            let declared_id = case
                .get("id")
                .and_then(serde_json::Value::as_str)
                .filter(|id| !id.is_empty());
            let case_id =
                declared_id.map_or_else(|| format!("index-{index}"), ToString::to_string);

            if let Some(id) = declared_id
                && !seen_ids.insert(id.to_string())
            {
                issues.push(issue(tests_path, Some(&case_id), "duplicate case id"));
            }

            if let Some(comparison) = case.get("comparison")
                && !comparison.is_null()
                && let Err(err) =
                    serde_json::from_value::<judge_vm::Comparison>(comparison.clone())
            {
                issues.push(issue(
                    tests_path,
                    Some(&case_id),
                    &format!("invalid comparison override: {err}"),
                ));
            }

            if let Some(hidden) = case.get("hidden").and_then(serde_json::Value::as_bool)
                && hidden != hidden_file
            {
                let file_name = if hidden_file {
                    "hidden_tests.json"
                } else {
                    "public_tests.json"
                };
                issues.push(issue(
                    tests_path,
                    Some(&case_id),
                    &format!("hidden flag contradicts placement in {file_name}"),
                ));
            }

            if case.get("inputs").is_some() {
                issues.push(issue(
                    tests_path,
                    Some(&case_id),
                    "inputs format is not allowed; use input_code",
                ));
                continue;
            }

            let input_code = case
                .get("input_code")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            if input_code.trim().is_empty() {
                issues.push(issue(
                    tests_path,
                    Some(&case_id),
                    "input_code must be a non-empty string",
                ));
                continue;
            }

            let assigned = assigned_names(input_code);
            let missing: Vec<&str> = runner_inputs
                .iter()
                .filter(|name| !assigned.contains(name.as_str()))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                issues.push(issue(
                    tests_path,
                    Some(&case_id),
                    &format!("runner inputs missing from input_code: {}", missing.join(", ")),
                ));
            }
        }
    }
}

/// Limits default when absent, but a declared limit must be a positive
/// integer.
fn check_positive_limit(
    manifest: &serde_json::Value,
    key: &str,
    manifest_path: &Path,
    issues: &mut Vec<ContractIssue>,
) {
    let Some(value) = manifest.get(key) else {
        return;
    };
    if value.as_u64().is_none_or(|limit| limit == 0) {
        issues.push(issue(
            manifest_path,
            None,
            &format!("{key} must be a positive integer, got {value}"),
        ));
    }
}

fn issue(file: &Path, case_id: Option<&str>, message: &str) -> ContractIssue {
    ContractIssue {
        file: file.to_path_buf(),
        case_id: case_id.map(ToString::to_string),
        message: message.to_string(),
    }
}

fn load_json(path: &Path, issues: &mut Vec<ContractIssue>) -> Option<serde_json::Value> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            issues.push(issue(path, None, &format!("unreadable: {err}")));
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(err) => {
            issues.push(issue(path, None, &format!("invalid JSON: {err}")));
            None
        }
    }
}

fn iter_cases(tests_raw: &serde_json::Value) -> Vec<&serde_json::Map<String, serde_json::Value>> {
    let cases = match tests_raw {
        serde_json::Value::Object(map) => map.get("cases").and_then(serde_json::Value::as_array),
        serde_json::Value::Array(_) => tests_raw.as_array(),
        _ => None,
    };
    cases
        .map(|list| list.iter().filter_map(serde_json::Value::as_object).collect())
        .unwrap_or_default()
}

const KEYWORDS: [&str; 11] = [
    "True", "False", "None", "and", "or", "not", "if", "else", "in", "for", "lambda",
];

/// Free names referenced by the runner expression. For the common call form
/// `f(arg, ...)` the callee name is excluded: it is supplied by the
/// submission, not by the case.
fn runner_input_names(runner: &str) -> BTreeSet<String> {
    let trimmed = runner.trim();
    let scan_region = match trimmed.find('(') {
        Some(open)
            if trimmed.ends_with(')') && is_identifier(trimmed[..open].trim_end()) =>
        {
            &trimmed[open + 1..trimmed.len() - 1]
        }
        _ => trimmed,
    };
    identifiers(scan_region)
        .into_iter()
        .filter(|name| !KEYWORDS.contains(&name.as_str()))
        .collect()
}

/// Names assigned at the top level of a case's input code, including tuple
/// targets (`a, b = ...`).
fn assigned_names(input_code: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for line in input_code.lines() {
        let Some(eq) = find_assignment_eq(line) else {
            continue;
        };
        let lhs = &line[..eq];
        for target in lhs.split(',') {
            let target = target
                .trim()
                .trim_start_matches(['(', '['])
                .trim_end_matches([')', ']'])
                .trim();
            // Drop a trailing annotation (`x: int`).
            let target = target.split(':').next().unwrap_or(target).trim();
            if is_identifier(target) {
                names.insert(target.to_string());
            }
        }
    }
    names
}

/// Position of a plain `=` that is an assignment, not part of a comparison or
/// augmented operator.
fn find_assignment_eq(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    let mut depth = 0usize;
    for (index, &byte) in bytes.iter().enumerate() {
        match byte {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            b'=' if depth == 0 => {
                let next_is_eq = bytes.get(index + 1) == Some(&b'=');
                let prev = index.checked_sub(1).map(|i| bytes[i]);
                let prev_is_op =
                    matches!(prev, Some(b'=' | b'!' | b'<' | b'>' | b'+' | b'-' | b'*' | b'/' | b'%'));
                if !next_is_eq && !prev_is_op {
                    return Some(index);
                }
            }
            _ => {}
        }
    }
    None
}

fn identifiers(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            current.push(ch);
        } else {
            push_identifier(&mut names, &mut current);
        }
    }
    push_identifier(&mut names, &mut current);
    names
}

fn push_identifier(names: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        if !current.chars().next().is_some_and(|ch| ch.is_ascii_digit()) {
            names.push(current.clone());
        }
        current.clear();
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn runner_call_form_excludes_the_callee() {
        assert_eq!(runner_input_names("add(a, b)"), names(&["a", "b"]));
        assert_eq!(runner_input_names("solve(xs, k + 1)"), names(&["k", "xs"]));
        assert_eq!(runner_input_names("a + b"), names(&["a", "b"]));
    }

    #[test]
    fn assignments_cover_tuples_and_annotations() {
        let code = "a = 1\nb, c = 1, 2\nd: int = 4\nif a == 9:\n    pass\n";
        assert_eq!(assigned_names(code), names(&["a", "b", "c", "d"]));
    }

    #[test]
    fn valid_corpus_has_no_issues() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("course/ch1/add");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("manifest.json"),
            r#"{"id": "course/ch1/add", "runner": "add(a, b)"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("public_tests.json"),
            r#"{"cases": [{"id": "p1", "input_code": "a = 1\nb = 2", "expected": 3}]}"#,
        )
        .unwrap();
        std::fs::write(dir.join("hidden_tests.json"), r#"{"cases": []}"#).unwrap();

        assert_eq!(validate_problem_contracts(tmp.path()), Vec::new());
    }

    #[test]
    fn missing_runner_input_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("p");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("manifest.json"), r#"{"runner": "add(a, b)"}"#).unwrap();
        std::fs::write(
            dir.join("public_tests.json"),
            r#"{"cases": [{"id": "p1", "input_code": "a = 1", "expected": 1}]}"#,
        )
        .unwrap();
        std::fs::write(dir.join("hidden_tests.json"), "[]").unwrap();

        let issues = validate_problem_contracts(tmp.path());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].case_id.as_deref(), Some("p1"));
        assert!(issues[0].message.contains("missing from input_code: b"));
    }

    #[test]
    fn legacy_inputs_format_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("p");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("manifest.json"), r#"{"runner": "f(a)"}"#).unwrap();
        std::fs::write(
            dir.join("public_tests.json"),
            r#"{"cases": [{"id": "p1", "inputs": {"a": "1"}, "expected": 1}]}"#,
        )
        .unwrap();
        std::fs::write(dir.join("hidden_tests.json"), "[]").unwrap();

        let issues = validate_problem_contracts(tmp.path());
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("inputs format is not allowed"));
    }

    #[test]
    fn non_positive_limits_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("p");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("manifest.json"),
            r#"{"runner": "f(a)", "time_limit_s": 0, "memory_mb": -1}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("public_tests.json"),
            r#"{"cases": [{"id": "p1", "input_code": "a = 1", "expected": 1}]}"#,
        )
        .unwrap();
        std::fs::write(dir.join("hidden_tests.json"), "[]").unwrap();

        let issues = validate_problem_contracts(tmp.path());
        assert_eq!(issues.len(), 2);
        assert!(issues[0].message.contains("time_limit_s must be a positive integer"));
        assert!(issues[1].message.contains("memory_mb must be a positive integer"));
    }

    #[test]
    fn duplicate_case_ids_are_rejected_across_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("p");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("manifest.json"), r#"{"runner": "f(a)"}"#).unwrap();
        std::fs::write(
            dir.join("public_tests.json"),
            r#"{"cases": [
                {"id": "t1", "input_code": "a = 1", "expected": 1},
                {"id": "t1", "input_code": "a = 2", "expected": 2}
            ]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("hidden_tests.json"),
            r#"{"cases": [{"id": "t1", "input_code": "a = 3", "expected": 3, "hidden": true}]}"#,
        )
        .unwrap();

        let issues = validate_problem_contracts(tmp.path());
        // The first occurrence is fine; each later reuse is flagged.
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|issue| issue.message == "duplicate case id"));
        assert!(issues[1].file.ends_with("hidden_tests.json"));
    }

    #[test]
    fn malformed_comparison_override_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("p");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("manifest.json"), r#"{"runner": "f(a)"}"#).unwrap();
        std::fs::write(
            dir.join("public_tests.json"),
            r#"{"cases": [
                {"id": "t1", "input_code": "a = 1", "expected": 1,
                 "comparison": {"type": "roughly"}},
                {"id": "t2", "input_code": "a = 1", "expected": 1,
                 "comparison": {"type": "allclose", "rtol": 0.001}},
                {"id": "t3", "input_code": "a = 1", "expected": 1, "comparison": null}
            ]}"#,
        )
        .unwrap();
        std::fs::write(dir.join("hidden_tests.json"), "[]").unwrap();

        let issues = validate_problem_contracts(tmp.path());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].case_id.as_deref(), Some("t1"));
        assert!(issues[0].message.contains("invalid comparison override"));
    }

    #[test]
    fn hidden_flag_must_match_the_file_it_lives_in() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("p");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("manifest.json"), r#"{"runner": "f(a)"}"#).unwrap();
        std::fs::write(
            dir.join("public_tests.json"),
            r#"{"cases": [
                {"id": "t1", "input_code": "a = 1", "expected": 1, "hidden": true},
                {"id": "t2", "input_code": "a = 1", "expected": 1, "hidden": false},
                {"id": "t3", "input_code": "a = 1", "expected": 1}
            ]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("hidden_tests.json"),
            r#"{"cases": [{"id": "t4", "input_code": "a = 1", "expected": 1, "hidden": false}]}"#,
        )
        .unwrap();

        let issues = validate_problem_contracts(tmp.path());
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].case_id.as_deref(), Some("t1"));
        assert!(issues[0].message.contains("public_tests.json"));
        assert_eq!(issues[1].case_id.as_deref(), Some("t4"));
        assert!(issues[1].message.contains("hidden_tests.json"));
    }
}
