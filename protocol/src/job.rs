use serde::Deserialize;
use serde::Serialize;

/// Lifecycle of a job row in the result store.
///
/// Transitions are enforced by the store's conditional updates; this enum
/// only names the states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Done,
        JobStatus::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "error" => Some(JobStatus::Error),
            _ => None,
        }
    }
}

/// Submission mode: `run` executes public tests and returns every case in
/// detail; `submit` executes public + hidden and returns only the first
/// failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Run,
    Submit,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Run => "run",
            JobKind::Submit => "submit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run" => Some(JobKind::Run),
            "submit" => Some(JobKind::Submit),
            _ => None,
        }
    }

    /// Hidden tests are only executed for full submissions.
    pub fn include_hidden(self) -> bool {
        matches!(self, JobKind::Submit)
    }
}

/// Worker class. `torch` workers carry the preloaded numeric runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Light,
    Torch,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Light => "light",
            Profile::Torch => "torch",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "light" => Some(Profile::Light),
            "torch" => Some(Profile::Torch),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_round_trips_through_strings() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("finished"), None);
    }

    #[test]
    fn only_submit_includes_hidden_tests() {
        assert!(JobKind::Submit.include_hidden());
        assert!(!JobKind::Run.include_hidden());
    }
}
