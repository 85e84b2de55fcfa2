use serde::Deserialize;
use serde::Serialize;

/// Terminal outcome reported to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "Accepted")]
    Accepted,
    #[serde(rename = "Wrong Answer")]
    WrongAnswer,
    #[serde(rename = "Runtime Error")]
    RuntimeError,
    #[serde(rename = "Time Limit Exceeded")]
    TimeLimitExceeded,
    #[serde(rename = "Memory Limit Exceeded")]
    MemoryLimitExceeded,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Accepted => "Accepted",
            Verdict::WrongAnswer => "Wrong Answer",
            Verdict::RuntimeError => "Runtime Error",
            Verdict::TimeLimitExceeded => "Time Limit Exceeded",
            Verdict::MemoryLimitExceeded => "Memory Limit Exceeded",
        }
    }

    pub fn is_accepted(self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// Who an error is attributed to. Internal errors are masked at the API
/// boundary; user errors are surfaced verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    User,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::User => "user",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(ErrorKind::User),
            "internal" => Some(ErrorKind::Internal),
            _ => None,
        }
    }
}

/// One per-case record as emitted by the harness on stdout.
///
/// The harness only produces `Accepted`, `Wrong Answer` and `Runtime Error`;
/// the limit verdicts are assigned by the executors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRecord {
    #[serde(default)]
    pub id: String,
    pub status: Verdict,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub expected: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub hidden: bool,
}

/// A case record shaped for persistence: hidden cases keep only their
/// identity and status, visible cases carry truncated detail fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizedCase {
    pub id: String,
    pub status: Verdict,
    pub hidden: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Pass/fail counts for a run, overall and split by case visibility.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub public_total: usize,
    pub public_passed: usize,
    pub hidden_total: usize,
    pub hidden_passed: usize,
}

/// What the worker persists for a finished job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub status: Verdict,
    pub summary: Summary,
    pub tests: Vec<SanitizedCase>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl RunResult {
    /// An error-shaped result with no per-case detail.
    pub fn from_error(
        status: Verdict,
        summary: Summary,
        error: String,
        error_kind: ErrorKind,
    ) -> Self {
        Self {
            status,
            summary,
            tests: Vec::new(),
            error: Some(error),
            error_kind: Some(error_kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn verdicts_serialize_as_display_strings() {
        let json = serde_json::to_string(&Verdict::TimeLimitExceeded).unwrap();
        assert_eq!(json, "\"Time Limit Exceeded\"");
        let parsed: Verdict = serde_json::from_str("\"Wrong Answer\"").unwrap();
        assert_eq!(parsed, Verdict::WrongAnswer);
    }

    #[test]
    fn hidden_sanitized_case_omits_detail_fields() {
        let case = SanitizedCase {
            id: "t1".to_string(),
            status: Verdict::Accepted,
            hidden: true,
            input: None,
            stdout: None,
            output: None,
            expected: None,
            stderr: None,
        };
        let value = serde_json::to_value(&case).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, ["id", "status", "hidden"]);
    }

    #[test]
    fn run_result_error_field_is_always_present() {
        let result = RunResult {
            status: Verdict::Accepted,
            summary: Summary::default(),
            tests: Vec::new(),
            error: None,
            error_kind: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.as_object().unwrap().contains_key("error"));
        assert!(!value.as_object().unwrap().contains_key("error_kind"));
    }
}
