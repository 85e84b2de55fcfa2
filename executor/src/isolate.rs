//! Per-case execution under the external `isolate` sandbox binary.
//!
//! Each job initializes this worker's reserved box, stages the submission,
//! test config, and the content-addressed harness binary, runs the harness
//! with hard resource flags, then classifies the outcome from the meta file.
//! The box is cleaned up on every path.

use crate::THREAD_ENV_DEFAULTS;
use crate::meta::MetaOutcome;
use crate::meta::classify_meta;
use crate::meta::parse_meta;
use crate::stage::ensure_harness;
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
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

#[derive(Clone, Debug)]
pub struct IsolateConfig {
    pub executable: String,
    pub box_id: u32,
    pub use_cgroups: bool,
    pub process_limit: u32,
    pub wall_time_extra_s: u64,
    pub timeout_grace_s: u64,
    pub fsize_kb: u64,
}

#[derive(Debug, Error)]
enum IsolateError {
    #[error("failed to run isolate: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("isolate --init failed: {0}")]
    Init(String),
    #[error("isolate returned an unusable box path: {0}")]
    BoxPath(String),
}

pub struct IsolateExecutor {
    config: IsolateConfig,
    harness_bin: PathBuf,
    runtime_dir: PathBuf,
    max_output_chars: usize,
}

impl IsolateExecutor {
    pub fn new(
        config: IsolateConfig,
        harness_bin: PathBuf,
        runtime_dir: PathBuf,
        max_output_chars: usize,
    ) -> Self {
        Self {
            config,
            harness_bin,
            runtime_dir,
            max_output_chars,
        }
    }

    /// Execute a full job. Infrastructure failures are folded into an
    /// error-shaped result rather than raised; the box is always cleaned up.
    pub async fn run_problem(
        &self,
        problem: &Problem,
        user_code: &str,
        include_hidden: bool,
        detail_mode: DetailMode,
    ) -> RunResult {
        let summary = job_error_summary(problem, include_hidden);
        let result = self
            .run_job(problem, user_code, include_hidden, detail_mode, summary)
            .await;
        self.cleanup_box().await;
        match result {
            Ok(run) => run,
            Err(err) => RunResult::from_error(
                Verdict::RuntimeError,
                summary,
                format!("Isolate executor failed: {err}"),
                ErrorKind::Internal,
            ),
        }
    }

    async fn run_job(
        &self,
        problem: &Problem,
        user_code: &str,
        include_hidden: bool,
        detail_mode: DetailMode,
        summary: Summary,
    ) -> Result<RunResult, IsolateError> {
        let box_root = self.init_box().await?;
        let box_dir = box_root.join("box");

        let config = TestConfig::for_problem(problem, include_hidden);
        let config_json = serde_json::to_string(&config)
            .map_err(|err| IsolateError::Init(format!("unserializable test config: {err}")))?;
        tokio::fs::write(box_dir.join("main.py"), user_code).await?;
        tokio::fs::write(box_dir.join("test_config.json"), config_json).await?;
        let staged = ensure_harness(&self.harness_bin, &self.runtime_dir)?;
        let staged_name = staged
            .file_name()
            .ok_or_else(|| IsolateError::BoxPath(staged.display().to_string()))?
            .to_string_lossy()
            .into_owned();

        let scratch = tempfile::tempdir()?;
        let meta_path = scratch.path().join("meta.txt");

        let time_limit = problem.time_limit_s.max(1);
        let wall_time = (time_limit + self.config.wall_time_extra_s).max(time_limit + 1);
        let parent_timeout = wall_time + self.config.timeout_grace_s;
        let memory_kb = problem.memory_mb.max(1) * 1024;

        let mut cmd = Command::new(&self.config.executable);
        cmd.arg(format!("--box-id={}", self.config.box_id));
        if self.config.use_cgroups {
            cmd.arg("--cg");
            cmd.arg(format!("--cg-mem={memory_kb}"));
        }
        cmd.arg(format!("--time={time_limit}"))
            .arg(format!("--wall-time={wall_time}"))
            .arg(format!("--mem={memory_kb}"))
            .arg(format!("--fsize={}", self.config.fsize_kb))
            .arg(format!("--processes={}", self.config.process_limit))
            .arg(format!("--meta={}", meta_path.display()));
        for (name, value) in THREAD_ENV_DEFAULTS {
            cmd.arg(format!("--env={name}={value}"));
        }
        cmd.arg(format!("--dir=runtime={}", self.runtime_dir.display()))
            .arg("--stdin=/dev/null")
            .arg("--stdout=stdout.txt")
            .arg("--stderr=stderr.txt")
            .arg("--run")
            .arg("--")
            .arg(format!("/runtime/{staged_name}"));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(box_id = self.config.box_id, "running isolate job");
        let waited =
            tokio::time::timeout(Duration::from_secs(parent_timeout), cmd.output()).await;
        let output = match waited {
            Ok(output) => output?,
            Err(_elapsed) => {
                return Ok(RunResult::from_error(
                    Verdict::TimeLimitExceeded,
                    summary,
                    format!("Time Limit Exceeded ({time_limit}s)"),
                    ErrorKind::User,
                ));
            }
        };

        let meta_text = tokio::fs::read_to_string(&meta_path).await.ok();
        let harness_stdout = tokio::fs::read_to_string(box_dir.join("stdout.txt"))
            .await
            .unwrap_or_default();
        let harness_stderr = tokio::fs::read_to_string(box_dir.join("stderr.txt"))
            .await
            .unwrap_or_default();

        Ok(classify(
            summary,
            time_limit,
            meta_text.as_deref(),
            output.status.success(),
            &String::from_utf8_lossy(&output.stderr),
            &harness_stdout,
            &harness_stderr,
            detail_mode,
            self.max_output_chars,
        ))
    }

    /// `--init`, with one `--cleanup` + retry on transient failure. Returns
    /// the box root printed by isolate.
    async fn init_box(&self) -> Result<PathBuf, IsolateError> {
        let first = self.isolate_simple("--init").await?;
        if first.status.success() {
            return parse_box_root(&first.stdout);
        }
        warn!(
            box_id = self.config.box_id,
            "isolate --init failed, cleaning up and retrying"
        );
        let _ = self.isolate_simple("--cleanup").await;
        let second = self.isolate_simple("--init").await?;
        if second.status.success() {
            return parse_box_root(&second.stdout);
        }
        Err(IsolateError::Init(
            String::from_utf8_lossy(&second.stderr).trim().to_string(),
        ))
    }

    async fn cleanup_box(&self) {
        if let Err(err) = self.isolate_simple("--cleanup").await {
            warn!(box_id = self.config.box_id, "isolate --cleanup failed: {err}");
        }
    }

    async fn isolate_simple(&self, action: &str) -> Result<std::process::Output, IsolateError> {
        let mut cmd = Command::new(&self.config.executable);
        cmd.arg(format!("--box-id={}", self.config.box_id));
        if self.config.use_cgroups {
            cmd.arg("--cg");
        }
        cmd.arg(action)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd.output().await?)
    }
}

fn job_error_summary(problem: &Problem, include_hidden: bool) -> Summary {
    let hidden_count = if include_hidden {
        problem.hidden_tests.len()
    } else {
        0
    };
    error_summary(problem.public_tests.len(), hidden_count)
}

/// The verdict table of the isolate path. Meta state wins over exit codes;
/// an exit 0 with unparseable stdout is an infrastructure failure.
#[allow(clippy::too_many_arguments)]
fn classify(
    summary: Summary,
    time_limit: u64,
    meta_text: Option<&str>,
    exit_ok: bool,
    isolate_stderr: &str,
    harness_stdout: &str,
    harness_stderr: &str,
    detail_mode: DetailMode,
    max_output_chars: usize,
) -> RunResult {
    let Some(meta_text) = meta_text else {
        return RunResult::from_error(
            Verdict::RuntimeError,
            summary,
            "Isolate meta file missing".to_string(),
            ErrorKind::Internal,
        );
    };
    let meta = parse_meta(meta_text);
    match classify_meta(&meta) {
        MetaOutcome::TimedOut => RunResult::from_error(
            Verdict::TimeLimitExceeded,
            summary,
            format!("Time Limit Exceeded ({time_limit}s)"),
            ErrorKind::User,
        ),
        MetaOutcome::OomKilled => RunResult::from_error(
            Verdict::MemoryLimitExceeded,
            summary,
            "Memory Limit Exceeded".to_string(),
            ErrorKind::User,
        ),
        MetaOutcome::SandboxError(message) => RunResult::from_error(
            Verdict::RuntimeError,
            summary,
            format!("Isolate sandbox failure: {message}"),
            ErrorKind::Internal,
        ),
        MetaOutcome::ProgramFailed => {
            let detail = if harness_stderr.trim().is_empty() {
                "Runner failed".to_string()
            } else {
                harness_stderr.trim().to_string()
            };
            RunResult::from_error(Verdict::RuntimeError, summary, detail, ErrorKind::User)
        }
        MetaOutcome::Clean => {
            if !exit_ok {
                return RunResult::from_error(
                    Verdict::RuntimeError,
                    summary,
                    format!("Isolate exited abnormally: {}", isolate_stderr.trim()),
                    ErrorKind::Internal,
                );
            }
            match serde_json::from_str::<Vec<CaseRecord>>(harness_stdout.trim()) {
                Ok(records) => finish_run(&records, detail_mode, max_output_chars),
                Err(_) => RunResult::from_error(
                    Verdict::RuntimeError,
                    summary,
                    format!(
                        "Invalid runner output. Stdout: {harness_stdout}\nStderr: {harness_stderr}"
                    ),
                    ErrorKind::Internal,
                ),
            }
        }
    }
}

fn parse_box_root(stdout: &[u8]) -> Result<PathBuf, IsolateError> {
    let path_text = String::from_utf8_lossy(stdout).trim().to_string();
    if path_text.is_empty() {
        return Err(IsolateError::BoxPath("empty --init output".to_string()));
    }
    Ok(PathBuf::from(path_text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn summary() -> Summary {
        error_summary(2, 1)
    }

    #[test]
    fn missing_meta_is_internal() {
        let result = classify(
            summary(),
            5,
            None,
            true,
            "",
            "[]",
            "",
            DetailMode::All,
            2000,
        );
        assert_eq!(result.status, Verdict::RuntimeError);
        assert_eq!(result.error_kind, Some(ErrorKind::Internal));
    }

    #[test]
    fn meta_timeout_is_a_user_error() {
        let result = classify(
            summary(),
            5,
            Some("status:TO\n"),
            false,
            "",
            "",
            "",
            DetailMode::All,
            2000,
        );
        assert_eq!(result.status, Verdict::TimeLimitExceeded);
        assert_eq!(result.error_kind, Some(ErrorKind::User));
        assert_eq!(result.error.as_deref(), Some("Time Limit Exceeded (5s)"));
    }

    #[test]
    fn oom_kill_is_memory_limit() {
        let result = classify(
            summary(),
            5,
            Some("cg-oom-killed:1\nstatus:SG\n"),
            false,
            "",
            "",
            "",
            DetailMode::All,
            2000,
        );
        assert_eq!(result.status, Verdict::MemoryLimitExceeded);
        assert_eq!(result.error_kind, Some(ErrorKind::User));
    }

    #[test]
    fn program_failure_surfaces_user_stderr() {
        let result = classify(
            summary(),
            5,
            Some("status:RE\nexitcode:1\n"),
            false,
            "",
            "",
            "Line 2:\n    boom\nfail: boom\n",
            DetailMode::All,
            2000,
        );
        assert_eq!(result.status, Verdict::RuntimeError);
        assert_eq!(result.error_kind, Some(ErrorKind::User));
        assert!(result.error.unwrap().contains("boom"));
    }

    #[test]
    fn clean_exit_with_parseable_stdout_uses_harness_records() {
        let records = serde_json::json!([
            {"id": "t1", "status": "Accepted", "input": "a = 1", "stdout": "",
             "output": "1", "expected": "1", "stderr": "", "hidden": false}
        ]);
        let result = classify(
            summary(),
            5,
            Some("time:0.02\n"),
            true,
            "",
            &records.to_string(),
            "",
            DetailMode::All,
            2000,
        );
        assert_eq!(result.status, Verdict::Accepted);
        assert_eq!(result.error, None);
        assert_eq!(result.tests.len(), 1);
    }

    #[test]
    fn clean_exit_with_garbage_stdout_is_internal() {
        let result = classify(
            summary(),
            5,
            Some("time:0.02\n"),
            true,
            "",
            "not json at all",
            "",
            DetailMode::All,
            2000,
        );
        assert_eq!(result.status, Verdict::RuntimeError);
        assert_eq!(result.error_kind, Some(ErrorKind::Internal));
    }

    #[test]
    fn sandbox_xx_is_internal_with_message() {
        let result = classify(
            summary(),
            5,
            Some("status:XX\nmessage:Cannot mount box\n"),
            false,
            "",
            "",
            "",
            DetailMode::All,
            2000,
        );
        assert_eq!(result.error_kind, Some(ErrorKind::Internal));
        assert!(result.error.unwrap().contains("Cannot mount box"));
    }
}
