//! Embedded scripting backend for executing untrusted submissions.
//!
//! Submissions, per-case input code, and runner expressions are Starlark (a
//! Python dialect). The submission is compiled and evaluated once into a
//! frozen module; every test case then runs in a fresh environment seeded
//! with the frozen definitions, so cases cannot leak state into each other.
//! `print` output is captured per case, and runtime errors are formatted with
//! frames restricted to the user-owned synthetic filenames.

mod compare;
mod tensor;

pub use compare::Comparison;
pub use compare::allclose;

use std::cell::RefCell;

use starlark::PrintHandler;
use starlark::environment::FrozenModule;
use starlark::environment::Globals;
use starlark::environment::GlobalsBuilder;
use starlark::environment::Module;
use starlark::eval::Evaluator;
use starlark::syntax::AstModule;
use starlark::syntax::Dialect;
use starlark::values::Value;
use thiserror::Error;

/// Synthetic filename the submission is compiled under. Error frames in this
/// file are shown to the user.
pub const SOLUTION_FILENAME: &str = "solution.py";
/// Synthetic filename for per-case input code. Also user-visible.
pub const CASE_FILENAME: &str = "testcase.py";

const RUNNER_FILENAME: &str = "<runner>";
const LITERAL_FILENAME: &str = "<literal>";

#[derive(Debug, Error)]
pub enum VmError {
    #[error("invalid runner expression: {0}")]
    InvalidRunner(String),
    #[error("invalid literal: {0}")]
    InvalidLiteral(String),
}

/// A failure attributable to user-owned code, formatted for display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserError {
    pub message: String,
}

/// Outcome of executing one test case.
#[derive(Clone, Debug)]
pub struct CaseOutcome {
    /// Normalized return value of the runner expression, when it has a JSON
    /// form. Tensors and nested sequences arrive here as arrays.
    pub value: Option<serde_json::Value>,
    /// The value's display form, used for the per-case `output` field.
    pub repr: String,
    /// Captured `print` output.
    pub stdout: String,
    pub error: Option<UserError>,
}

impl CaseOutcome {
    fn failed(error: UserError, stdout: String) -> Self {
        Self {
            value: None,
            repr: String::new(),
            stdout,
            error: Some(error),
        }
    }
}

/// A submission compiled and evaluated once, ready for per-case reuse.
#[derive(Debug)]
pub struct CompiledSubmission {
    frozen: FrozenModule,
    source: String,
}

/// The interpreter configuration shared by every case of a job.
pub struct Vm {
    globals: Globals,
}

impl Vm {
    /// `preload_tensor` selects the heavy profile: the numeric builtin set is
    /// constructed up front so per-case environments only pay a name copy.
    pub fn new(preload_tensor: bool) -> Self {
        let globals = if preload_tensor {
            GlobalsBuilder::standard().with(tensor::tensor_globals).build()
        } else {
            GlobalsBuilder::standard().build()
        };
        Self { globals }
    }

    /// Parse the runner expression without evaluating it. A failure here is a
    /// problem-authoring bug, not a user error.
    pub fn check_runner(&self, runner_expr: &str) -> Result<(), VmError> {
        parse(RUNNER_FILENAME, runner_expr)
            .map(|_| ())
            .map_err(|err| VmError::InvalidRunner(err.to_string()))
    }

    /// Compile and evaluate the submission's module top level once.
    pub fn compile_submission(&self, source: &str) -> Result<CompiledSubmission, UserError> {
        let ast = parse(SOLUTION_FILENAME, source)
            .map_err(|err| format_user_error(&err, &[(SOLUTION_FILENAME, source)]))?;
        let module = Module::new();
        let quiet = CapturedPrints::default();
        {
            let mut eval = Evaluator::new(&module);
            eval.set_print_handler(&quiet);
            eval.eval_module(ast, &self.globals)
                .map_err(|err| format_user_error(&err, &[(SOLUTION_FILENAME, source)]))?;
        }
        let frozen = module.freeze().map_err(|err| UserError {
            message: err.err_msg.clone(),
        })?;
        Ok(CompiledSubmission {
            frozen,
            source: source.to_string(),
        })
    }

    /// Run one case: fresh environment, the submission's frozen names, the
    /// case's input assignments, then the runner expression.
    pub fn run_case(
        &self,
        submission: &CompiledSubmission,
        input_code: &str,
        runner_expr: &str,
    ) -> CaseOutcome {
        let sources = [
            (SOLUTION_FILENAME, submission.source.as_str()),
            (CASE_FILENAME, input_code),
        ];
        let prints = CapturedPrints::default();

        let module = Module::new();
        for name in submission.frozen.names() {
            if let Ok(Some(owned)) = submission.frozen.get_option(name.as_str()) {
                module.set(name.as_str(), owned.owned_value(module.frozen_heap()));
            }
        }

        let input_ast = match parse(CASE_FILENAME, input_code) {
            Ok(ast) => ast,
            Err(err) => {
                return CaseOutcome::failed(format_user_error(&err, &sources), prints.take());
            }
        };
        {
            let mut eval = Evaluator::new(&module);
            eval.set_print_handler(&prints);
            if let Err(err) = eval.eval_module(input_ast, &self.globals) {
                return CaseOutcome::failed(format_user_error(&err, &sources), prints.take());
            }
        }

        let runner_ast = match parse(RUNNER_FILENAME, runner_expr) {
            Ok(ast) => ast,
            Err(err) => {
                return CaseOutcome::failed(format_user_error(&err, &sources), prints.take());
            }
        };
        let mut eval = Evaluator::new(&module);
        eval.set_print_handler(&prints);
        match eval.eval_module(runner_ast, &self.globals) {
            Ok(value) => CaseOutcome {
                repr: value.to_repr(),
                value: normalize(value),
                stdout: prints.take(),
                error: None,
            },
            Err(err) => CaseOutcome::failed(format_user_error(&err, &sources), prints.take()),
        }
    }
}

/// Convert a runner return value to its JSON tree. Values with no JSON form
/// (functions, opaque natives) yield `None`; callers fall back to the repr.
fn normalize(value: Value) -> Option<serde_json::Value> {
    let text = value.to_json().ok()?;
    serde_json::from_str(&text).ok()
}

/// Evaluate a Python-style literal (`expected_is_code` expectations) into a
/// JSON tree.
pub fn parse_python_literal(text: &str) -> Result<serde_json::Value, VmError> {
    let ast = parse(LITERAL_FILENAME, text)
        .map_err(|err| VmError::InvalidLiteral(err.to_string()))?;
    let module = Module::new();
    let globals = Globals::standard();
    let quiet = CapturedPrints::default();
    let mut eval = Evaluator::new(&module);
    eval.set_print_handler(&quiet);
    let value = eval
        .eval_module(ast, &globals)
        .map_err(|err| VmError::InvalidLiteral(err.to_string()))?;
    let text = value
        .to_json()
        .map_err(|err| VmError::InvalidLiteral(err.to_string()))?;
    serde_json::from_str(&text).map_err(|err| VmError::InvalidLiteral(err.to_string()))
}

fn parse(filename: &str, content: &str) -> Result<AstModule, starlark::Error> {
    AstModule::parse(filename, content.to_string(), &Dialect::Extended)
}

/// Render an error the way the user should see it: the source line for spans
/// inside user-owned files, never interpreter internals or harness paths.
fn format_user_error(err: &starlark::Error, sources: &[(&str, &str)]) -> UserError {
    let message = err.kind().to_string();
    let Some(span) = err.span() else {
        return UserError { message };
    };
    let filename = span.filename();
    let Some((_, source)) = sources.iter().find(|(name, _)| *name == filename) else {
        return UserError { message };
    };
    let resolved = span.resolve_span();
    let line_number = resolved.begin.line + 1;
    let mut lines = vec![format!("Line {line_number}:")];
    if let Some(text) = source.lines().nth(resolved.begin.line) {
        let trimmed = text.trim_end();
        if !trimmed.is_empty() {
            lines.push(format!("    {trimmed}"));
        }
    }
    lines.push(message);
    UserError {
        message: lines.join("\n"),
    }
}

#[derive(Default)]
struct CapturedPrints(RefCell<String>);

impl CapturedPrints {
    fn take(&self) -> String {
        self.0.take()
    }
}

impl PrintHandler for CapturedPrints {
    fn println(&self, text: &str) -> Result<(), starlark::Error> {
        let mut buffer = self.0.borrow_mut();
        buffer.push_str(text);
        buffer.push('\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn compile(vm: &Vm, source: &str) -> CompiledSubmission {
        vm.compile_submission(source).unwrap()
    }

    #[test]
    fn add_case_returns_value_and_repr() {
        let vm = Vm::new(false);
        let submission = compile(&vm, "def add(a, b):\n    return a + b\n");
        let outcome = vm.run_case(&submission, "a = 1\nb = 2\n", "add(a, b)");
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.value, Some(json!(3)));
        assert_eq!(outcome.repr, "3");
    }

    #[test]
    fn cases_do_not_share_state() {
        let vm = Vm::new(false);
        let submission = compile(&vm, "def identity(v):\n    return v\n");
        let first = vm.run_case(&submission, "x = [1, 2]", "identity(x)");
        assert_eq!(first.error, None);
        assert_eq!(first.value, Some(json!([1, 2])));
        // `x` from the first case must not be visible in the second.
        let second = vm.run_case(&submission, "y = 0", "identity(x)");
        assert!(second.error.is_some());
    }

    #[test]
    fn print_output_is_captured_per_case() {
        let vm = Vm::new(false);
        let submission = compile(
            &vm,
            "def noisy(a):\n    print(\"working on\", a)\n    return a\n",
        );
        let outcome = vm.run_case(&submission, "a = 5", "noisy(a)");
        assert_eq!(outcome.stdout, "working on 5\n");
        assert_eq!(outcome.value, Some(json!(5)));
    }

    #[test]
    fn runtime_error_mentions_user_line_not_harness_internals() {
        let vm = Vm::new(false);
        let submission = compile(&vm, "def boom(a):\n    fail(\"bad input\")\n");
        let outcome = vm.run_case(&submission, "a = 1", "boom(a)");
        let error = outcome.error.unwrap();
        assert!(error.message.contains("Line 2"), "{}", error.message);
        assert!(error.message.contains("bad input"), "{}", error.message);
        assert!(!error.message.contains("<runner>"), "{}", error.message);
    }

    #[test]
    fn compile_error_is_a_user_error() {
        let vm = Vm::new(false);
        let err = vm.compile_submission("def broken(:\n").unwrap_err();
        assert!(!err.message.is_empty());
    }

    #[test]
    fn tensor_builtins_exist_only_when_preloaded() {
        let torch = Vm::new(true);
        let submission = compile(&torch, "def mm(a, b):\n    return matmul(a, b)\n");
        let outcome = torch.run_case(
            &submission,
            "a = [[1.0, 0.0], [0.0, 1.0]]\nb = [[3.0, 4.0], [5.0, 6.0]]",
            "mm(a, b)",
        );
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.value, Some(json!([[3.0, 4.0], [5.0, 6.0]])));

        // Without the preload the same submission fails, either at name
        // resolution or when the call is evaluated.
        let light = Vm::new(false);
        let failed = match light.compile_submission("def mm(a, b):\n    return matmul(a, b)\n") {
            Err(_) => true,
            Ok(submission) => light
                .run_case(&submission, "a = [[1.0]]\nb = [[1.0]]", "mm(a, b)")
                .error
                .is_some(),
        };
        assert!(failed);
    }

    #[test]
    fn literal_parsing_covers_python_shapes() {
        assert_eq!(parse_python_literal("(1, 2)").unwrap(), json!([1, 2]));
        assert_eq!(
            parse_python_literal("{'a': True, 'b': None}").unwrap(),
            json!({"a": true, "b": null})
        );
        assert_eq!(parse_python_literal("[1.5, 'x']").unwrap(), json!([1.5, "x"]));
        assert!(parse_python_literal("open('/etc/passwd')").is_err());
    }
}
