//! Warm executor: a pre-spawned runner child per job.
//!
//! The parent keeps one standby child (the worker binary re-invoked in
//! warm-child mode) spawned with a scrubbed environment and piped stdio, so
//! interpreter startup cost is paid before a job arrives. Per job the parent
//! creates the cgroup, writes the job-start message to the child's stdin,
//! waits with pidfd + poll under an output cap, kills the child's process
//! group at the deadline, and classifies the outcome. A replacement standby
//! is spawned after every job.

#[cfg(target_os = "linux")]
pub(crate) mod cgroup;
mod child;
pub(crate) mod rlimits;
#[cfg(target_os = "linux")]
pub(crate) mod seccomp;
pub(crate) mod spec;
mod wait;

pub use child::run_warm_child;
pub use spec::HardeningSpec;
pub use spec::INFRA_ERROR_MARKER;
pub use spec::ResourceLimits;
pub use spec::WarmJobSpec;

use judge_harness::DetailMode;
use judge_harness::TestConfig;
use judge_harness::report::error_summary;
use judge_harness::report::finish_run;
use judge_problems::Problem;
use judge_protocol::CaseRecord;
use judge_protocol::ErrorKind;
use judge_protocol::RunResult;
use judge_protocol::Summary;
use judge_protocol::Verdict;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;
use tracing::warn;
use wait::CaptureOutcome;
use wait::ExitStatus;

#[derive(Clone, Debug)]
pub struct WarmConfig {
    pub enable_no_new_privs: bool,
    pub enable_seccomp: bool,
    pub seccomp_fail_closed: bool,
    pub clear_env: bool,
    pub deny_filesystem: bool,
    pub allow_root: bool,
    pub child_nofile: u64,
    pub enable_cgroup: bool,
    pub cgroup_root: PathBuf,
    pub max_jobs: u64,
    pub process_limit: u32,
    pub fsize_kb: u64,
    pub wall_time_extra_s: u64,
    pub timeout_grace_s: u64,
}

/// How to launch the warm-child mode of the worker binary.
#[derive(Clone, Debug)]
pub struct ChildCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Error)]
pub enum WarmError {
    #[error("refusing to run the warm executor as root (set JUDGE_WARM_FORK_ALLOW_ROOT to override)")]
    RootRefused,
    #[error("parent hardening failed: {0}")]
    ParentHardening(String),
    #[error("seccomp filter unavailable: {0}")]
    Seccomp(String),
    #[error("failed to spawn warm child: {0}")]
    Spawn(#[from] std::io::Error),
}

pub struct WarmExecutor {
    config: WarmConfig,
    child_command: ChildCommand,
    max_output_chars: usize,
    standby: Option<std::process::Child>,
    jobs_run: u64,
}

impl WarmExecutor {
    /// Harden the parent, verify the seccomp filter compiles under
    /// fail-closed settings, and spawn the first standby child.
    pub fn new(
        config: WarmConfig,
        child_command: ChildCommand,
        max_output_chars: usize,
    ) -> Result<Self, WarmError> {
        if unsafe { libc::geteuid() } == 0 && !config.allow_root {
            return Err(WarmError::RootRefused);
        }
        #[cfg(target_os = "linux")]
        {
            // Prevent ptrace attach and core dumps of the long-lived parent.
            let outcome = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) };
            if outcome != 0 {
                return Err(WarmError::ParentHardening(format!(
                    "prctl(PR_SET_DUMPABLE) failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            if config.enable_seccomp && config.seccomp_fail_closed {
                seccomp::build_filter(config.deny_filesystem).map_err(WarmError::Seccomp)?;
            }
        }

        let mut executor = Self {
            config,
            child_command,
            max_output_chars,
            standby: None,
            jobs_run: 0,
        };
        executor.standby = Some(executor.spawn_standby()?);
        Ok(executor)
    }

    /// True once the configured job budget is exhausted; the owner tears the
    /// executor down and builds a replacement, bounding memory drift.
    pub fn needs_recycle(&self) -> bool {
        self.config.max_jobs > 0 && self.jobs_run >= self.config.max_jobs
    }

    pub fn shutdown(&mut self) {
        if let Some(mut standby) = self.standby.take() {
            let _ = standby.kill();
            let _ = standby.wait();
        }
    }

    pub async fn run_problem(
        &mut self,
        problem: &Problem,
        user_code: &str,
        include_hidden: bool,
        detail_mode: DetailMode,
    ) -> RunResult {
        let hidden_count = if include_hidden {
            problem.hidden_tests.len()
        } else {
            0
        };
        let summary = error_summary(problem.public_tests.len(), hidden_count);
        let internal = |detail: String| {
            RunResult::from_error(Verdict::RuntimeError, summary, detail, ErrorKind::Internal)
        };

        let time_limit = problem.time_limit_s.max(1);
        let wall_time = (time_limit + self.config.wall_time_extra_s).max(time_limit + 1);
        let timeout_s = wall_time + self.config.timeout_grace_s;
        self.jobs_run += 1;

        let mut runner_child = match self.take_standby() {
            Ok(child) => child,
            Err(err) => return internal(format!("Warm executor failed: {err}")),
        };

        let cgroup = match self.create_cgroup(problem) {
            Ok(cgroup) => cgroup,
            Err(err) => {
                // The standby never saw this job; keep it for the next one.
                self.standby = Some(runner_child);
                return internal(format!("Warm executor failed: {err}"));
            }
        };

        let job_spec = WarmJobSpec {
            config: TestConfig::for_problem(problem, include_hidden),
            user_code: user_code.to_string(),
            cgroup_dir: cgroup.as_ref().map(|handle| handle.dir().to_path_buf()),
            hardening: HardeningSpec {
                enable_no_new_privs: self.config.enable_no_new_privs,
                enable_seccomp: self.config.enable_seccomp,
                seccomp_fail_closed: self.config.seccomp_fail_closed,
                deny_filesystem: self.config.deny_filesystem,
                limits: ResourceLimits {
                    cpu_seconds: time_limit,
                    memory_bytes: problem.memory_mb.max(1) * 1024 * 1024,
                    fsize_bytes: self.config.fsize_kb.max(1) * 1024,
                    process_limit: self.config.process_limit,
                    nofile: self.config.child_nofile,
                },
            },
        };
        let spec_bytes = match serde_json::to_vec(&job_spec) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.standby = Some(runner_child);
                self.destroy_cgroup(cgroup);
                return internal(format!("Warm executor failed to encode job spec: {err}"));
            }
        };

        debug!(job = self.jobs_run, "dispatching job to warm child");
        let deadline = Instant::now() + Duration::from_secs(timeout_s);
        let waited = tokio::task::spawn_blocking(move || {
            // Deliver the job and close stdin so the child sees EOF.
            if let Some(mut stdin) = runner_child.stdin.take() {
                let _ = stdin.write_all(&spec_bytes);
            }
            wait::wait_and_capture(&mut runner_child, deadline)
        })
        .await;

        let oom_kills = cgroup.as_ref().map_or(0, CgroupRef::oom_kill_count);
        self.destroy_cgroup(cgroup);
        if !self.needs_recycle() {
            match self.spawn_standby() {
                Ok(standby) => self.standby = Some(standby),
                Err(err) => warn!("failed to respawn warm standby: {err}"),
            }
        }

        let outcome = match waited {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => return internal(format!("Warm executor wait failed: {err}")),
            Err(err) => return internal(format!("Warm executor wait panicked: {err}")),
        };
        classify(
            outcome,
            oom_kills,
            summary,
            time_limit,
            detail_mode,
            self.max_output_chars,
        )
    }

    /// The standby, or a fresh spawn when it is missing or already dead.
    fn take_standby(&mut self) -> Result<std::process::Child, WarmError> {
        if let Some(mut standby) = self.standby.take() {
            match standby.try_wait() {
                Ok(None) => return Ok(standby),
                Ok(Some(status)) => {
                    warn!("warm standby exited before use: {status}");
                }
                Err(err) => {
                    warn!("warm standby unhealthy: {err}");
                    let _ = standby.kill();
                    let _ = standby.wait();
                }
            }
        }
        self.spawn_standby()
    }

    fn spawn_standby(&self) -> Result<std::process::Child, WarmError> {
        let parent_env: HashMap<String, String> = std::env::vars().collect();
        let env = spec::build_child_env(&parent_env, self.config.clear_env);
        let mut cmd = std::process::Command::new(&self.child_command.program);
        cmd.args(&self.child_command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .envs(env);
        Ok(cmd.spawn()?)
    }

    #[cfg(target_os = "linux")]
    fn create_cgroup(&self, problem: &Problem) -> std::io::Result<Option<cgroup::CgroupHandle>> {
        if !self.config.enable_cgroup {
            return Ok(None);
        }
        cgroup::CgroupHandle::create(
            &self.config.cgroup_root,
            self.jobs_run,
            problem.memory_mb.max(1) * 1024 * 1024,
            self.config.process_limit,
        )
        .map(Some)
    }

    #[cfg(not(target_os = "linux"))]
    fn create_cgroup(&self, _problem: &Problem) -> std::io::Result<Option<NoCgroup>> {
        Ok(None)
    }

    #[cfg(target_os = "linux")]
    fn destroy_cgroup(&self, cgroup: Option<cgroup::CgroupHandle>) {
        if let Some(handle) = cgroup {
            handle.destroy();
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn destroy_cgroup(&self, _cgroup: Option<NoCgroup>) {}
}

impl Drop for WarmExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(target_os = "linux")]
use cgroup::CgroupHandle as CgroupRef;

#[cfg(not(target_os = "linux"))]
struct NoCgroup;

#[cfg(not(target_os = "linux"))]
impl NoCgroup {
    fn oom_kill_count(&self) -> u64 {
        0
    }
    fn dir(&self) -> &std::path::Path {
        std::path::Path::new("")
    }
}

#[cfg(not(target_os = "linux"))]
use NoCgroup as CgroupRef;

/// The warm-path verdict table. Cgroup OOM wins, then the parent deadline,
/// then the output cap; only a clean exit with parseable stdout reaches the
/// harness records.
fn classify(
    outcome: CaptureOutcome,
    oom_kills: u64,
    summary: Summary,
    time_limit: u64,
    detail_mode: DetailMode,
    max_output_chars: usize,
) -> RunResult {
    let stdout = String::from_utf8_lossy(&outcome.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&outcome.stderr).into_owned();

    if oom_kills > 0 {
        return RunResult::from_error(
            Verdict::MemoryLimitExceeded,
            summary,
            "Memory Limit Exceeded".to_string(),
            ErrorKind::User,
        );
    }
    if outcome.timed_out {
        return RunResult::from_error(
            Verdict::TimeLimitExceeded,
            summary,
            format!("Time Limit Exceeded ({time_limit}s)"),
            ErrorKind::User,
        );
    }
    if outcome.capped {
        return RunResult::from_error(
            Verdict::RuntimeError,
            summary,
            "Output Limit Exceeded".to_string(),
            ErrorKind::User,
        );
    }

    match outcome.status {
        ExitStatus::Exited(0) => match serde_json::from_str::<Vec<CaseRecord>>(stdout.trim()) {
            Ok(records) => finish_run(&records, detail_mode, max_output_chars),
            Err(_) => RunResult::from_error(
                Verdict::RuntimeError,
                summary,
                format!("Invalid runner output. Stdout: {stdout}\nStderr: {stderr}"),
                ErrorKind::Internal,
            ),
        },
        ExitStatus::Exited(_code) => {
            let infra = stderr.contains(INFRA_ERROR_MARKER);
            let detail = if stderr.trim().is_empty() {
                "Runner failed".to_string()
            } else {
                stderr.trim().to_string()
            };
            RunResult::from_error(
                Verdict::RuntimeError,
                summary,
                detail,
                if infra { ErrorKind::Internal } else { ErrorKind::User },
            )
        }
        ExitStatus::Signaled(signal) => {
            let detail = if stderr.trim().is_empty() {
                format!("Runner killed by signal {signal}")
            } else {
                stderr.trim().to_string()
            };
            RunResult::from_error(Verdict::RuntimeError, summary, detail, ErrorKind::User)
        }
        ExitStatus::Unknown => RunResult::from_error(
            Verdict::RuntimeError,
            summary,
            "Lost track of the runner child".to_string(),
            ErrorKind::Internal,
        ),
    }
}
