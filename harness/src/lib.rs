//! The test harness: compiles a submission once, executes it against each
//! case in a fresh environment, compares outputs, and emits one record per
//! case.
//!
//! The same code serves two deployment shapes. The isolate executor runs the
//! `judge-harness` binary inside the sandbox, which reads its inputs from the
//! box directory; the warm executor calls [`run_cases`] in-process with the
//! config received over its job-start message, so no filesystem access is
//! needed at all.

mod config;
pub mod report;

pub use config::CaseConfig;
pub use config::TestConfig;
pub use report::DetailMode;

use judge_protocol::CaseRecord;
use judge_protocol::Verdict;
use judge_vm::Vm;

/// Record id used for pre-case failures (compile errors, invalid runner).
pub const SYNTHETIC_ERROR_ID: &str = "error";

/// Execute every case of `config` against `user_code`.
///
/// A submission or runner that fails to compile yields a single synthetic
/// `Runtime Error` record; per-case failures never abort the remaining
/// cases.
pub fn run_cases(config: &TestConfig, user_code: &str) -> Vec<CaseRecord> {
    let vm = Vm::new(config.requires_torch);
    run_cases_with(&vm, config, user_code)
}

/// Like [`run_cases`], against a caller-provided interpreter. The warm
/// executor's child builds its (tensor-preloaded) [`Vm`] before the job
/// arrives and passes it here.
pub fn run_cases_with(vm: &Vm, config: &TestConfig, user_code: &str) -> Vec<CaseRecord> {
    if let Err(err) = vm.check_runner(&config.runner) {
        return vec![synthetic_error(err.to_string())];
    }
    let submission = match vm.compile_submission(user_code) {
        Ok(submission) => submission,
        Err(err) => return vec![synthetic_error(err.message)],
    };

    config
        .cases
        .iter()
        .map(|case| run_one_case(vm, &submission, config, case))
        .collect()
}

fn run_one_case(
    vm: &Vm,
    submission: &judge_vm::CompiledSubmission,
    config: &TestConfig,
    case: &CaseConfig,
) -> CaseRecord {
    let comparison = case.comparison.unwrap_or(config.comparison);
    let expected = resolve_expected(case);
    let expected_repr = serde_json::to_string(&expected).unwrap_or_default();

    let outcome = vm.run_case(submission, &case.input_code, &config.runner);
    if let Some(error) = outcome.error {
        return CaseRecord {
            id: case.id.clone(),
            status: Verdict::RuntimeError,
            input: case.input_code.clone(),
            stdout: outcome.stdout,
            output: String::new(),
            expected: expected_repr,
            stderr: error.message,
            hidden: case.hidden,
        };
    }

    let matched = outcome
        .value
        .as_ref()
        .is_some_and(|actual| comparison.matches(actual, &expected));
    CaseRecord {
        id: case.id.clone(),
        status: if matched {
            Verdict::Accepted
        } else {
            Verdict::WrongAnswer
        },
        input: case.input_code.clone(),
        stdout: outcome.stdout,
        output: outcome.repr,
        expected: expected_repr,
        stderr: String::new(),
        hidden: case.hidden,
    }
}

/// `expected_is_code` expectations arrive as Python-literal strings when the
/// config was written by the content pipeline; an unparseable literal keeps
/// its string form.
fn resolve_expected(case: &CaseConfig) -> serde_json::Value {
    if case.expected_is_code
        && let serde_json::Value::String(text) = &case.expected
    {
        return judge_vm::parse_python_literal(text)
            .unwrap_or_else(|_| case.expected.clone());
    }
    case.expected.clone()
}

/// The single-record array shape used for pre-case failures.
pub fn synthetic_error(message: String) -> CaseRecord {
    CaseRecord {
        id: SYNTHETIC_ERROR_ID.to_string(),
        status: Verdict::RuntimeError,
        input: String::new(),
        stdout: String::new(),
        output: String::new(),
        expected: String::new(),
        stderr: message,
        hidden: false,
    }
}
