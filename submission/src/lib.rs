//! Submission intake: validate the problem, admit under the backlog cap,
//! persist the job row, and enqueue.
//!
//! The order matters: the row is created before the stream entry so a
//! worker can always find it, and an enqueue failure finalizes the row as an
//! internal error so callers are never left polling a job nobody will run.

use judge_problems::ProblemError;
use judge_problems::ProblemStore;
use judge_protocol::JobKind;
use judge_protocol::JobRequest;
use judge_protocol::Profile;
use judge_protocol::StreamRouting;
use judge_queue::JobQueue;
use judge_state::ResultStore;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Invalid problem id")]
    InvalidProblem,
    #[error("Problem not found")]
    ProblemNotFound,
    #[error("Judge queue is full. Please retry.")]
    QueueFull,
    #[error("Judge queue unavailable")]
    QueueUnavailable,
    #[error("Judge storage unavailable")]
    StorageUnavailable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionAccepted {
    pub job_id: String,
    pub status: &'static str,
}

pub struct SubmissionService {
    queue: JobQueue,
    results: ResultStore,
    problems: ProblemStore,
    queue_maxlen: i64,
    routing: StreamRouting,
}

impl SubmissionService {
    pub fn new(
        queue: JobQueue,
        results: ResultStore,
        problems: ProblemStore,
        queue_maxlen: i64,
    ) -> Self {
        Self {
            queue,
            results,
            problems,
            queue_maxlen,
            routing: StreamRouting::default(),
        }
    }

    pub async fn submit(
        &self,
        problem_key: &str,
        kind: JobKind,
        code: &str,
    ) -> Result<SubmissionAccepted, SubmissionError> {
        let route = self
            .problems
            .get_route_info(problem_key)
            .map_err(|err| match err {
                ProblemError::InvalidId(_) => SubmissionError::InvalidProblem,
                _ => SubmissionError::ProblemNotFound,
            })?;
        let profile = if route.requires_torch {
            Profile::Torch
        } else {
            Profile::Light
        };
        let stream = self.routing.stream_for_profile(profile);
        let group = self
            .routing
            .group_for_stream(stream)
            .map_err(|_| SubmissionError::QueueUnavailable)?;

        if self.queue_maxlen > 0 {
            let backlog = self
                .queue
                .backlog(stream, group)
                .await
                .map_err(|_| SubmissionError::QueueUnavailable)?;
            if backlog >= self.queue_maxlen {
                return Err(SubmissionError::QueueFull);
            }
        }

        let job_id = Uuid::new_v4().to_string();
        let created_at = unix_now();
        self.results
            .create_job(&job_id, &route.id, profile, kind, created_at)
            .await
            .map_err(|_| SubmissionError::StorageUnavailable)?;

        let request = JobRequest {
            job_id: job_id.clone(),
            problem_id: route.id,
            problem_key: problem_key.to_string(),
            profile,
            kind,
            code: code.to_string(),
            created_at: Some(created_at),
        };
        if let Err(err) = self.queue.enqueue(stream, &request).await {
            error!("enqueue failed for job {job_id} on {stream}: {err}");
            self.persist_enqueue_failure(&job_id, stream).await;
            return Err(SubmissionError::QueueUnavailable);
        }

        Ok(SubmissionAccepted {
            job_id,
            status: "queued",
        })
    }

    async fn persist_enqueue_failure(&self, job_id: &str, stream: &str) {
        match self
            .results
            .mark_error(
                job_id,
                "Failed to enqueue job",
                None,
                judge_protocol::ErrorKind::Internal,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "failed to persist enqueue failure: row not updatable job_id={job_id} stream={stream}"
                );
            }
            Err(err) => {
                error!(
                    "failed to persist enqueue failure: job_id={job_id} stream={stream}: {err}"
                );
            }
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs() as i64)
}
