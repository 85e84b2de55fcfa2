//! Worker and service settings, read from `JUDGE_*` environment variables.
//!
//! Every value is validated up front so misconfiguration fails at process
//! start instead of mid-job.

use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must not be empty")]
    Empty { name: &'static str },
    #[error("{name} must be an integer, got {value:?}")]
    NotAnInteger { name: &'static str, value: String },
    #[error("{name} must be >= {min}, got {value}")]
    BelowMinimum {
        name: &'static str,
        min: i64,
        value: i64,
    },
    #[error("JUDGE_TORCH_EXECUTION_MODE must be one of: isolate, warm_fork (got {0:?})")]
    InvalidExecutionMode(String),
    #[error(
        "JUDGE_WARM_FORK_ENABLE_NO_NEW_PRIVS must be enabled when JUDGE_WARM_FORK_ENABLE_SECCOMP=1"
    )]
    SeccompRequiresNoNewPrivs,
}

/// How torch-profile jobs are executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TorchExecutionMode {
    Isolate,
    WarmFork,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub redis_url: String,
    pub results_db: PathBuf,
    pub problems_root: PathBuf,
    pub max_output_chars: usize,
    pub queue_maxlen: i64,
    pub job_claim_idle_ms: u64,
    pub job_claim_count: usize,
    pub isolate_bin: String,
    pub isolate_use_cgroups: bool,
    pub isolate_process_limit: u32,
    pub isolate_wall_time_extra_s: u64,
    pub isolate_timeout_grace_s: u64,
    pub isolate_fsize_kb: u64,
    pub harness_bin: PathBuf,
    pub runtime_dir: PathBuf,
    pub torch_execution_mode: TorchExecutionMode,
    pub warm_fork_enable_no_new_privs: bool,
    pub warm_fork_enable_seccomp: bool,
    pub warm_fork_seccomp_fail_closed: bool,
    pub warm_fork_clear_env: bool,
    pub warm_fork_deny_filesystem: bool,
    pub warm_fork_allow_root: bool,
    pub warm_fork_child_nofile: u64,
    pub warm_fork_enable_cgroup: bool,
    pub warm_fork_cgroup_root: PathBuf,
    pub warm_fork_max_jobs: u64,
    pub allowed_origins: Vec<String>,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&std::env::vars().collect::<HashMap<_, _>>())
    }

    /// Read settings from an explicit map. Tests use this to avoid mutating
    /// process-wide environment state.
    pub fn from_lookup(env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str| env.get(name).map(|value| value.trim().to_string());

        let redis_url =
            get("JUDGE_REDIS_URL").unwrap_or_else(|| "redis://localhost:6379/0".to_string());
        let results_db = PathBuf::from(
            get("JUDGE_RESULTS_DB").unwrap_or_else(|| "data/judge.db".to_string()),
        );
        let problems_root =
            PathBuf::from(get("JUDGE_PROBLEMS_ROOT").unwrap_or_else(|| "problems".to_string()));

        let max_output_chars = parse_int(&get("JUDGE_MAX_OUTPUT_CHARS"), "JUDGE_MAX_OUTPUT_CHARS", 2000)?;
        require_min("JUDGE_MAX_OUTPUT_CHARS", max_output_chars, 1)?;
        let queue_maxlen = parse_int(&get("JUDGE_QUEUE_MAXLEN"), "JUDGE_QUEUE_MAXLEN", 10_000)?;
        require_min("JUDGE_QUEUE_MAXLEN", queue_maxlen, 0)?;
        let job_claim_idle_ms =
            parse_int(&get("JUDGE_JOB_CLAIM_IDLE_MS"), "JUDGE_JOB_CLAIM_IDLE_MS", 30_000)?;
        require_min("JUDGE_JOB_CLAIM_IDLE_MS", job_claim_idle_ms, 0)?;
        let job_claim_count =
            parse_int(&get("JUDGE_JOB_CLAIM_COUNT"), "JUDGE_JOB_CLAIM_COUNT", 10)?;
        require_min("JUDGE_JOB_CLAIM_COUNT", job_claim_count, 1)?;

        let isolate_bin =
            get("JUDGE_ISOLATE_BIN").unwrap_or_else(|| "/usr/bin/isolate".to_string());
        if isolate_bin.is_empty() {
            return Err(ConfigError::Empty {
                name: "JUDGE_ISOLATE_BIN",
            });
        }
        let isolate_use_cgroups = parse_bool(&get("JUDGE_ISOLATE_USE_CGROUPS"), true);
        let isolate_process_limit =
            parse_int(&get("JUDGE_ISOLATE_PROCESSES"), "JUDGE_ISOLATE_PROCESSES", 64)?;
        require_min("JUDGE_ISOLATE_PROCESSES", isolate_process_limit, 1)?;
        let isolate_wall_time_extra_s = parse_int(
            &get("JUDGE_ISOLATE_WALL_TIME_EXTRA_S"),
            "JUDGE_ISOLATE_WALL_TIME_EXTRA_S",
            2,
        )?;
        require_min("JUDGE_ISOLATE_WALL_TIME_EXTRA_S", isolate_wall_time_extra_s, 0)?;
        let isolate_timeout_grace_s = parse_int(
            &get("JUDGE_ISOLATE_TIMEOUT_GRACE_S"),
            "JUDGE_ISOLATE_TIMEOUT_GRACE_S",
            5,
        )?;
        require_min("JUDGE_ISOLATE_TIMEOUT_GRACE_S", isolate_timeout_grace_s, 0)?;
        let isolate_fsize_kb =
            parse_int(&get("JUDGE_ISOLATE_FSIZE_KB"), "JUDGE_ISOLATE_FSIZE_KB", 1024)?;
        require_min("JUDGE_ISOLATE_FSIZE_KB", isolate_fsize_kb, 1)?;

        let harness_bin = PathBuf::from(
            get("JUDGE_HARNESS_BIN").unwrap_or_else(|| "/usr/local/bin/judge-harness".to_string()),
        );
        if harness_bin.as_os_str().is_empty() {
            return Err(ConfigError::Empty {
                name: "JUDGE_HARNESS_BIN",
            });
        }
        let runtime_dir = match get("JUDGE_RUNTIME_DIR") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => std::env::temp_dir().join("judge-runtime"),
        };

        let torch_execution_mode = match get("JUDGE_TORCH_EXECUTION_MODE")
            .unwrap_or_else(|| "isolate".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "isolate" => TorchExecutionMode::Isolate,
            "warm_fork" => TorchExecutionMode::WarmFork,
            other => return Err(ConfigError::InvalidExecutionMode(other.to_string())),
        };

        let warm_fork_enable_no_new_privs =
            parse_bool(&get("JUDGE_WARM_FORK_ENABLE_NO_NEW_PRIVS"), true);
        let warm_fork_enable_seccomp = parse_bool(&get("JUDGE_WARM_FORK_ENABLE_SECCOMP"), true);
        let warm_fork_seccomp_fail_closed =
            parse_bool(&get("JUDGE_WARM_FORK_SECCOMP_FAIL_CLOSED"), true);
        let warm_fork_clear_env = parse_bool(&get("JUDGE_WARM_FORK_CLEAR_ENV"), true);
        let warm_fork_deny_filesystem = parse_bool(&get("JUDGE_WARM_FORK_DENY_FILESYSTEM"), true);
        let warm_fork_allow_root = parse_bool(&get("JUDGE_WARM_FORK_ALLOW_ROOT"), false);
        let warm_fork_child_nofile =
            parse_int(&get("JUDGE_WARM_FORK_CHILD_NOFILE"), "JUDGE_WARM_FORK_CHILD_NOFILE", 64)?;
        require_min("JUDGE_WARM_FORK_CHILD_NOFILE", warm_fork_child_nofile, 16)?;
        let warm_fork_enable_cgroup = parse_bool(&get("JUDGE_WARM_FORK_ENABLE_CGROUP"), true);
        let warm_fork_cgroup_root = PathBuf::from(
            get("JUDGE_WARM_FORK_CGROUP_ROOT")
                .unwrap_or_else(|| "/sys/fs/cgroup/judge".to_string()),
        );
        let warm_fork_max_jobs =
            parse_int(&get("JUDGE_WARM_FORK_MAX_JOBS"), "JUDGE_WARM_FORK_MAX_JOBS", 0)?;
        require_min("JUDGE_WARM_FORK_MAX_JOBS", warm_fork_max_jobs, 0)?;

        if warm_fork_enable_seccomp && !warm_fork_enable_no_new_privs {
            return Err(ConfigError::SeccompRequiresNoNewPrivs);
        }

        let allowed_origins = get("JUDGE_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(ToString::to_string)
            .collect();

        Ok(Self {
            redis_url,
            results_db,
            problems_root,
            max_output_chars: max_output_chars as usize,
            queue_maxlen,
            job_claim_idle_ms: job_claim_idle_ms as u64,
            job_claim_count: job_claim_count as usize,
            isolate_bin,
            isolate_use_cgroups,
            isolate_process_limit: isolate_process_limit as u32,
            isolate_wall_time_extra_s: isolate_wall_time_extra_s as u64,
            isolate_timeout_grace_s: isolate_timeout_grace_s as u64,
            isolate_fsize_kb: isolate_fsize_kb as u64,
            harness_bin,
            runtime_dir,
            torch_execution_mode,
            warm_fork_enable_no_new_privs,
            warm_fork_enable_seccomp,
            warm_fork_seccomp_fail_closed,
            warm_fork_clear_env,
            warm_fork_deny_filesystem,
            warm_fork_allow_root,
            warm_fork_child_nofile: warm_fork_child_nofile as u64,
            warm_fork_enable_cgroup,
            warm_fork_cgroup_root,
            warm_fork_max_jobs: warm_fork_max_jobs as u64,
            allowed_origins,
        })
    }
}

/// The falsy set accepted for boolean toggles. Anything else is true.
fn parse_bool(value: &Option<String>, default: bool) -> bool {
    match value {
        Some(raw) if !raw.is_empty() => {
            !matches!(raw.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off")
        }
        _ => default,
    }
}

fn parse_int(value: &Option<String>, name: &'static str, default: i64) -> Result<i64, ConfigError> {
    match value {
        Some(raw) if !raw.is_empty() => raw.parse::<i64>().map_err(|_| ConfigError::NotAnInteger {
            name,
            value: raw.clone(),
        }),
        _ => Ok(default),
    }
}

fn require_min(name: &'static str, value: i64, min: i64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::BelowMinimum { name, min, value });
    }
    Ok(())
}
