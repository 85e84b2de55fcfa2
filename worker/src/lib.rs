//! Worker dispatch loop: consumer-group reads plus periodic autoclaim, one
//! job at a time, with exactly-once verdict persistence through the result
//! store's conditional transitions.

mod entry;

pub use entry::ParsedEntry;
pub use entry::parse_entry;

use judge_config::Settings;
use judge_config::TorchExecutionMode;
use judge_executor::ChildCommand;
use judge_executor::IsolateConfig;
use judge_executor::IsolateExecutor;
use judge_executor::WarmConfig;
use judge_executor::WarmExecutor;
use judge_harness::DetailMode;
use judge_problems::ProblemStore;
use judge_protocol::ErrorKind;
use judge_protocol::JobKind;
use judge_protocol::Profile;
use judge_protocol::RunResult;
use judge_protocol::StreamRouting;
use judge_queue::JobQueue;
use judge_queue::StreamEntry;
use judge_state::ResultStore;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

const READ_BLOCK_MS: u64 = 5000;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid worker consumer name for sandbox box id: {0}")]
    InvalidConsumerName(String),
    #[error("worker index out of supported range (1-49): {0}")]
    IndexOutOfRange(String),
    #[error("unsupported stream for sandbox box mapping: {0}")]
    UnsupportedStream(String),
}

/// Sandbox box ids are derived from the worker index so concurrent workers
/// never share a box: `light` workers use 1..49, `torch` workers 51..99.
pub fn derive_box_id(stream: &str, consumer: &str) -> Result<u32, WorkerError> {
    let suffix = consumer.rsplit('-').next().unwrap_or_default();
    if suffix.is_empty() || !suffix.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(WorkerError::InvalidConsumerName(consumer.to_string()));
    }
    let index: u32 = suffix
        .parse()
        .map_err(|_| WorkerError::InvalidConsumerName(consumer.to_string()))?;
    if !(1..=49).contains(&index) {
        return Err(WorkerError::IndexOutOfRange(consumer.to_string()));
    }
    match stream {
        "queue:light" => Ok(index),
        "queue:torch" => Ok(50 + index),
        other => Err(WorkerError::UnsupportedStream(other.to_string())),
    }
}

enum JobExecutor {
    Isolate(IsolateExecutor),
    Warm(WarmExecutor),
}

pub struct WorkerArgs {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub reclaim_interval_s: u64,
}

pub struct Worker {
    settings: Settings,
    args: WorkerArgs,
    queue: JobQueue,
    results: ResultStore,
    problems: ProblemStore,
    executor: JobExecutor,
    profile: Profile,
}

impl Worker {
    pub async fn build(settings: Settings, args: WorkerArgs) -> anyhow::Result<Self> {
        let routing = StreamRouting::default();
        let profile = routing
            .profile_for_stream(&args.stream)
            .map_err(|_| WorkerError::UnsupportedStream(args.stream.clone()))?;
        let box_id = derive_box_id(&args.stream, &args.consumer)?;

        let queue = JobQueue::connect(&settings.redis_url).await?;
        let results = ResultStore::open(&settings.results_db).await?;
        let problems = ProblemStore::new(&settings.problems_root);
        let executor = build_executor(&settings, profile, box_id)?;

        Ok(Self {
            settings,
            args,
            queue,
            results,
            problems,
            executor,
            profile,
        })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        self.queue
            .ensure_group(&self.args.stream, &self.args.group)
            .await?;
        info!(
            stream = %self.args.stream,
            group = %self.args.group,
            consumer = %self.args.consumer,
            "worker started"
        );

        let reclaim_interval = Duration::from_secs(self.args.reclaim_interval_s.max(1));
        // Start with an immediate reclaim pass so a restarted worker picks
        // up its own abandoned deliveries right away.
        let mut last_reclaim: Option<Instant> = None;

        loop {
            if last_reclaim.is_none_or(|at| at.elapsed() >= reclaim_interval) {
                self.reclaim_pass().await;
                self.refresh_gauges().await;
                last_reclaim = Some(Instant::now());
            }

            match self
                .queue
                .read(&self.args.stream, &self.args.group, &self.args.consumer, READ_BLOCK_MS)
                .await
            {
                Ok(Some(stream_entry)) => self.process_entry(stream_entry).await,
                Ok(None) => {}
                Err(err) => {
                    warn!("queue read failed: {err}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn reclaim_pass(&mut self) {
        let reclaimed = match self
            .queue
            .autoclaim(
                &self.args.stream,
                &self.args.group,
                &self.args.consumer,
                self.settings.job_claim_idle_ms,
                self.settings.job_claim_count,
            )
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                warn!("autoclaim failed: {err}");
                return;
            }
        };
        for stream_entry in reclaimed {
            debug!(msg_id = %stream_entry.id, "processing reclaimed entry");
            self.process_entry(stream_entry).await;
        }
    }

    /// Process one delivery end to end. The entry is acknowledged only after
    /// a verdict is durably persisted (or when there is provably nothing to
    /// persist).
    async fn process_entry(&mut self, stream_entry: StreamEntry) {
        let msg_id = stream_entry.id.clone();
        let parsed = parse_entry(stream_entry);

        if parsed.job_id.is_empty() {
            // Nothing to report this against; drop it.
            debug!(%msg_id, "dropping entry without job id");
            self.ack(&msg_id).await;
            return;
        }

        let profile_label = parsed.profile_label.clone();
        let kind_label = parsed.kind_label.clone();
        judge_metrics::job_started(&profile_label, &kind_label);
        judge_metrics::observe_job_queue_wait(&profile_label, parsed.created_at, unix_now());
        let started = Instant::now();

        let (status_label, error_kind_label, should_ack) = self.execute_entry(&parsed).await;

        judge_metrics::observe_job_duration(&profile_label, started.elapsed().as_secs_f64());
        judge_metrics::job_finished(&profile_label, status_label, Some(error_kind_label));
        if should_ack {
            self.ack(&msg_id).await;
        }
    }

    /// Returns `(status, error_kind, should_ack)` for metrics and ack
    /// handling. `should_ack = false` leaves the delivery pending for a
    /// future autoclaim.
    async fn execute_entry(&mut self, parsed: &ParsedEntry) -> (&'static str, &'static str, bool) {
        let job_id = parsed.job_id.as_str();

        match self.results.mark_running(job_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id, "job already finalized, skipping");
                return ("skipped", "none", true);
            }
            Err(err) => {
                error!(job_id, "mark_running failed: {err}");
                return ("error", "internal", false);
            }
        }

        let Some(kind) = parsed.kind else {
            let detail = format!("Invalid job kind: {}", parsed.kind_label);
            return self.finalize_error(job_id, &detail, None, ErrorKind::Internal).await;
        };
        if parsed.problem_id.is_empty() {
            return self
                .finalize_error(job_id, "Queue entry missing problem id", None, ErrorKind::Internal)
                .await;
        }

        let problem = match kind {
            JobKind::Run => self.problems.get_for_run(&parsed.problem_id),
            JobKind::Submit => self.problems.get_for_submit(&parsed.problem_id),
        };
        let problem = match problem {
            Ok(problem) => problem,
            Err(err) => {
                let detail = format!("Failed to load problem {}: {err}", parsed.problem_id);
                return self.finalize_error(job_id, &detail, None, ErrorKind::Internal).await;
            }
        };

        let include_hidden = kind.include_hidden();
        let detail_mode = match kind {
            JobKind::Run => DetailMode::All,
            JobKind::Submit => DetailMode::FirstFailure,
        };
        let (result, recycle) = match &mut self.executor {
            JobExecutor::Isolate(isolate) => (
                isolate
                    .run_problem(&problem, &parsed.code, include_hidden, detail_mode)
                    .await,
                false,
            ),
            JobExecutor::Warm(warm) => {
                let result = warm
                    .run_problem(&problem, &parsed.code, include_hidden, detail_mode)
                    .await;
                (result, warm.needs_recycle())
            }
        };
        if recycle {
            self.recycle_warm_executor();
        }

        self.persist_result(job_id, result).await
    }

    async fn persist_result(
        &self,
        job_id: &str,
        result: RunResult,
    ) -> (&'static str, &'static str, bool) {
        let payload = match serde_json::to_value(&result) {
            Ok(payload) => payload,
            Err(err) => {
                let detail = format!("Unserializable run result: {err}");
                return self.finalize_error(job_id, &detail, None, ErrorKind::Internal).await;
            }
        };

        if let Some(error) = &result.error {
            let error_kind = result.error_kind.unwrap_or(ErrorKind::Internal);
            return self
                .finalize_error(job_id, error.as_str(), Some(&payload), error_kind)
                .await;
        }

        match self.results.mark_done(job_id, &payload).await {
            Ok(true) => ("done", "none", true),
            Ok(false) => {
                warn!(job_id, "done result not persisted: row already terminal");
                ("done", "none", true)
            }
            Err(err) => {
                error!(job_id, "mark_done failed: {err}");
                ("error", "internal", false)
            }
        }
    }

    async fn finalize_error(
        &self,
        job_id: &str,
        detail: &str,
        payload: Option<&serde_json::Value>,
        error_kind: ErrorKind,
    ) -> (&'static str, &'static str, bool) {
        match self.results.mark_error(job_id, detail, payload, error_kind).await {
            Ok(true) => ("error", error_kind.as_str(), true),
            Ok(false) => {
                warn!(job_id, "error result not persisted: row already terminal");
                ("error", error_kind.as_str(), true)
            }
            Err(err) => {
                error!(job_id, "mark_error failed: {err}");
                ("error", "internal", false)
            }
        }
    }

    fn recycle_warm_executor(&mut self) {
        info!("recycling warm executor after job budget");
        let box_id = match derive_box_id(&self.args.stream, &self.args.consumer) {
            Ok(box_id) => box_id,
            Err(err) => {
                error!("cannot rebuild warm executor: {err}");
                return;
            }
        };
        match build_executor(&self.settings, self.profile, box_id) {
            Ok(executor) => self.executor = executor,
            Err(err) => error!("failed to rebuild warm executor, keeping the old one: {err}"),
        }
    }

    async fn ack(&self, msg_id: &str) {
        match self
            .queue
            .ack_and_delete(&self.args.stream, &self.args.group, msg_id)
            .await
        {
            Ok((acked, deleted)) => {
                if acked == 0 || deleted == 0 {
                    debug!(msg_id, acked, deleted, "ack/delete touched no entry");
                }
            }
            Err(err) => warn!(msg_id, "ack_and_delete failed: {err}"),
        }
    }

    async fn refresh_gauges(&self) {
        if let Ok(length) = self.queue.stream_len(&self.args.stream).await {
            judge_metrics::set_stream_length(&self.args.stream, length);
        }
        if let Ok(Some(counters)) = self
            .queue
            .group_counters(&self.args.stream, &self.args.group)
            .await
        {
            judge_metrics::set_group_counters(
                &self.args.stream,
                &self.args.group,
                counters.pending,
                counters.lag,
            );
        }
        match self.results.count_by_status().await {
            Ok(counts) => {
                for status in judge_protocol::JobStatus::ALL {
                    let count = counts.get(status.as_str()).copied().unwrap_or(0);
                    judge_metrics::set_jobs_in_status(status.as_str(), count);
                }
            }
            Err(err) => debug!("status gauge refresh failed: {err}"),
        }
    }
}

fn build_executor(
    settings: &Settings,
    profile: Profile,
    box_id: u32,
) -> anyhow::Result<JobExecutor> {
    let warm = profile == Profile::Torch
        && settings.torch_execution_mode == TorchExecutionMode::WarmFork;
    if warm {
        let program = std::env::current_exe()?;
        // Torch workers preload the tensor runtime in the standby child.
        let args = vec!["warm-child".to_string(), "--preload-tensor".to_string()];
        let executor = WarmExecutor::new(
            WarmConfig {
                enable_no_new_privs: settings.warm_fork_enable_no_new_privs,
                enable_seccomp: settings.warm_fork_enable_seccomp,
                seccomp_fail_closed: settings.warm_fork_seccomp_fail_closed,
                clear_env: settings.warm_fork_clear_env,
                deny_filesystem: settings.warm_fork_deny_filesystem,
                allow_root: settings.warm_fork_allow_root,
                child_nofile: settings.warm_fork_child_nofile,
                enable_cgroup: settings.warm_fork_enable_cgroup,
                cgroup_root: settings.warm_fork_cgroup_root.clone(),
                max_jobs: settings.warm_fork_max_jobs,
                process_limit: settings.isolate_process_limit,
                fsize_kb: settings.isolate_fsize_kb,
                wall_time_extra_s: settings.isolate_wall_time_extra_s,
                timeout_grace_s: settings.isolate_timeout_grace_s,
            },
            ChildCommand { program, args },
            settings.max_output_chars,
        )?;
        return Ok(JobExecutor::Warm(executor));
    }

    let executor = IsolateExecutor::new(
        IsolateConfig {
            executable: settings.isolate_bin.clone(),
            box_id,
            use_cgroups: settings.isolate_use_cgroups,
            process_limit: settings.isolate_process_limit,
            wall_time_extra_s: settings.isolate_wall_time_extra_s,
            timeout_grace_s: settings.isolate_timeout_grace_s,
            fsize_kb: settings.isolate_fsize_kb,
        },
        settings.harness_bin.clone(),
        settings.runtime_dir.clone(),
        settings.max_output_chars,
    );
    Ok(JobExecutor::Isolate(executor))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn box_ids_partition_by_stream() {
        assert_eq!(derive_box_id("queue:light", "worker-1").unwrap(), 1);
        assert_eq!(derive_box_id("queue:light", "worker-49").unwrap(), 49);
        assert_eq!(derive_box_id("queue:torch", "worker-1").unwrap(), 51);
        assert_eq!(derive_box_id("queue:torch", "worker-49").unwrap(), 99);
    }

    #[test]
    fn bad_consumer_names_are_rejected() {
        assert!(matches!(
            derive_box_id("queue:light", "worker"),
            Err(WorkerError::InvalidConsumerName(_))
        ));
        assert!(matches!(
            derive_box_id("queue:light", "worker-abc"),
            Err(WorkerError::InvalidConsumerName(_))
        ));
        assert!(matches!(
            derive_box_id("queue:light", "worker-0"),
            Err(WorkerError::IndexOutOfRange(_))
        ));
        assert!(matches!(
            derive_box_id("queue:light", "worker-50"),
            Err(WorkerError::IndexOutOfRange(_))
        ));
        assert!(matches!(
            derive_box_id("queue:heavy", "worker-3"),
            Err(WorkerError::UnsupportedStream(_))
        ));
    }
}
