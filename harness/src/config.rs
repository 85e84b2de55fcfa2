use judge_problems::Problem;
use judge_vm::Comparison;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Per-case entry of the test config handed to the harness.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaseConfig {
    pub id: String,
    pub input_code: String,
    pub expected: Value,
    #[serde(default)]
    pub expected_is_code: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub comparison: Option<Comparison>,
}

/// The complete harness input: runner expression, default comparison, and
/// the ordered case list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    pub runner: String,
    #[serde(default)]
    pub comparison: Comparison,
    #[serde(default)]
    pub requires_torch: bool,
    pub cases: Vec<CaseConfig>,
}

impl TestConfig {
    /// Flatten a loaded problem into harness input. Hidden cases are only
    /// included for full submissions.
    pub fn for_problem(problem: &Problem, include_hidden: bool) -> Self {
        let mut cases: Vec<CaseConfig> = Vec::new();
        let hidden_tests = if include_hidden {
            problem.hidden_tests.as_slice()
        } else {
            &[]
        };
        for case in problem.public_tests.iter().chain(hidden_tests) {
            cases.push(CaseConfig {
                id: case.id.clone(),
                input_code: case.input_code.clone(),
                expected: case.expected.clone(),
                expected_is_code: false,
                hidden: case.hidden,
                comparison: case.comparison,
            });
        }
        Self {
            runner: problem.runner.clone(),
            comparison: problem.comparison,
            requires_torch: problem.requires_torch,
            cases,
        }
    }
}
