use judge_vm::Comparison;
use serde::Deserialize;
use serde_json::Value;

/// One test case, fully parsed. `expected` is always a JSON tree after
/// loading; `expected_is_code` inputs are evaluated as Python-style literals
/// at load time.
#[derive(Clone, Debug, PartialEq)]
pub struct TestCase {
    pub id: String,
    pub input_code: String,
    pub expected: Value,
    pub hidden: bool,
    pub comparison: Option<Comparison>,
}

/// Immutable problem definition: manifest plus its ordered test cases.
#[derive(Clone, Debug, PartialEq)]
pub struct Problem {
    pub id: String,
    pub version: String,
    pub runner: String,
    pub requires_torch: bool,
    pub time_limit_s: u64,
    pub memory_mb: u64,
    pub comparison: Comparison,
    pub public_tests: Vec<TestCase>,
    pub hidden_tests: Vec<TestCase>,
}

/// The subset of the manifest needed to route a submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteInfo {
    pub id: String,
    pub requires_torch: bool,
}

/// `manifest.json` on disk.
#[derive(Debug, Deserialize)]
pub(crate) struct RawManifest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub version: Option<Value>,
    #[serde(default)]
    pub runner: String,
    #[serde(default)]
    pub requires_torch: bool,
    #[serde(default = "default_time_limit")]
    pub time_limit_s: u64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default)]
    pub comparison: Option<Comparison>,
}

fn default_time_limit() -> u64 {
    10
}

fn default_memory_mb() -> u64 {
    1024
}

/// `public_tests.json` / `hidden_tests.json` on disk. Either a bare array of
/// cases or `{"version": ..., "cases": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawTests {
    Wrapped {
        #[serde(default)]
        cases: Vec<RawCase>,
    },
    Bare(Vec<RawCase>),
}

impl RawTests {
    pub fn into_cases(self) -> Vec<RawCase> {
        match self {
            RawTests::Wrapped { cases } => cases,
            RawTests::Bare(cases) => cases,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawCase {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub input_code: Option<String>,
    /// Legacy form: a map of free names to literal expressions, converted to
    /// assignment lines at load time.
    #[serde(default)]
    pub inputs: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub expected: Value,
    #[serde(default)]
    pub expected_is_code: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub comparison: Option<Comparison>,
}
