//! Generated test bundles must satisfy every corpus contract, and the loader
//! must read back exactly what the generator wrote.

use judge_problems::ProblemStore;
use judge_problems::contracts::validate_problem_contracts;
use serde_json::json;
use std::path::Path;

/// A miniature stand-in for the content pipeline's hidden-test generator:
/// one assignment block per case, expectations precomputed from the inputs.
fn generate_hidden_cases(count: usize) -> Vec<serde_json::Value> {
    (0..count)
        .map(|index| {
            let a = index as i64 + 1;
            let b = (index as i64 + 2) * 3;
            json!({
                "id": format!("hidden-{index}"),
                "input_code": format!("a = {a}\nb = {b}"),
                "expected": a + b,
                "hidden": true,
            })
        })
        .collect()
}

fn write_bundle(dir: &Path, hidden_cases: &[serde_json::Value]) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join("manifest.json"),
        serde_json::to_string_pretty(&json!({
            "id": "course/ch1/add",
            "version": "v1",
            "runner": "add(a, b)",
            "requires_torch": false,
            "time_limit_s": 5,
            "memory_mb": 256,
            "comparison": {"type": "exact"},
        }))
        .unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.join("public_tests.json"),
        serde_json::to_string_pretty(&json!({
            "version": 1,
            "cases": [
                {"id": "public-0", "input_code": "a = 1\nb = 2", "expected": 3},
            ],
        }))
        .unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.join("hidden_tests.json"),
        serde_json::to_string_pretty(&json!({"version": 1, "cases": hidden_cases})).unwrap(),
    )
    .unwrap();
}

#[test]
fn generated_bundles_are_a_contract_fixpoint() {
    let tmp = tempfile::tempdir().unwrap();
    let bundle_dir = tmp.path().join("course/ch1/add");
    write_bundle(&bundle_dir, &generate_hidden_cases(8));

    let issues = validate_problem_contracts(tmp.path());
    assert!(
        issues.is_empty(),
        "generated corpus violated contracts: {:?}",
        issues.iter().map(|issue| issue.render()).collect::<Vec<_>>()
    );
}

#[test]
fn generated_bundles_load_with_hidden_cases_intact() {
    let tmp = tempfile::tempdir().unwrap();
    let bundle_dir = tmp.path().join("course/ch1/add");
    write_bundle(&bundle_dir, &generate_hidden_cases(3));

    let store = ProblemStore::new(tmp.path());
    let problem = store.get_for_submit("course/ch1/add").unwrap();
    assert_eq!(problem.public_tests.len(), 1);
    assert_eq!(problem.hidden_tests.len(), 3);
    assert!(problem.hidden_tests.iter().all(|case| case.hidden));
    assert_eq!(problem.hidden_tests[0].expected, json!(7));

    let run_view = store.get_for_run("course/ch1/add").unwrap();
    assert!(run_view.hidden_tests.is_empty());
}
