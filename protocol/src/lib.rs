//! Shared data model for the judge: verdicts, job states, run results, and
//! the queue wire format.
//!
//! This crate is intentionally dependency-light so every other crate can
//! depend on it without pulling in runtime machinery.

mod job;
mod result;
mod routing;

pub use job::JobKind;
pub use job::JobStatus;
pub use job::Profile;
pub use result::CaseRecord;
pub use result::ErrorKind;
pub use result::RunResult;
pub use result::SanitizedCase;
pub use result::Summary;
pub use result::Verdict;
pub use routing::RoutingError;
pub use routing::StreamRouting;

use serde::Deserialize;
use serde::Serialize;

/// A fully-validated queue entry, field-for-field what lands in the stream.
///
/// `created_at` is unix seconds; it encodes as a decimal string on the wire
/// and an empty string when absent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: String,
    pub problem_id: String,
    pub problem_key: String,
    pub profile: Profile,
    pub kind: JobKind,
    pub code: String,
    pub created_at: Option<i64>,
}
