//! Wire types and environment policy shared by the warm executor's parent
//! and child sides.

use judge_harness::TestConfig;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Children print this marker to stderr before a non-zero exit when the
/// failure is infrastructure, not the submission. The parent classifies the
/// job as an internal error when it sees it.
pub const INFRA_ERROR_MARKER: &str = "__WARM_FORK_INFRA_ERROR__";

/// Thread-count defaults for native numeric libraries; one thread per job
/// keeps the cgroup pid budget honest.
pub(crate) const THREAD_ENV_DEFAULTS: [(&str, &str); 6] = [
    ("OMP_NUM_THREADS", "1"),
    ("MKL_NUM_THREADS", "1"),
    ("OPENBLAS_NUM_THREADS", "1"),
    ("NUMEXPR_NUM_THREADS", "1"),
    ("VECLIB_MAXIMUM_THREADS", "1"),
    ("PYTORCH_NUM_THREADS", "1"),
];

/// Operator-tunable variables forwarded verbatim when present.
pub(crate) const OPTIONAL_ENV_VARS: [&str; 2] = ["PYTORCH_JIT", "CUDA_VISIBLE_DEVICES"];

/// Locale and timezone survive the scrub.
pub(crate) const SAFE_ENV_VARS: [&str; 4] = ["LANG", "LC_ALL", "LC_CTYPE", "TZ"];

/// Resource limits the child applies to itself before running user code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_seconds: u64,
    pub memory_bytes: u64,
    pub fsize_bytes: u64,
    pub process_limit: u32,
    pub nofile: u64,
}

/// Hardening toggles, resolved from settings by the parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardeningSpec {
    pub enable_no_new_privs: bool,
    pub enable_seccomp: bool,
    pub seccomp_fail_closed: bool,
    pub deny_filesystem: bool,
    pub limits: ResourceLimits,
}

/// The single job-start message written to the child's stdin. The child owns
/// cgroup attachment (membership cannot be inherited through spawn), so the
/// parent only names the directory here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WarmJobSpec {
    pub config: TestConfig,
    pub user_code: String,
    pub cgroup_dir: Option<PathBuf>,
    pub hardening: HardeningSpec,
}

/// Build the scrubbed child environment: a small allowlist, the thread-count
/// defaults, the optional passthrough set, and fixed filesystem-neutral
/// values. With `clear_env` off, the parent environment survives underneath.
pub(crate) fn build_child_env(
    parent_env: &HashMap<String, String>,
    clear_env: bool,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = HashMap::new();
    if clear_env {
        for name in SAFE_ENV_VARS {
            if let Some(value) = parent_env.get(name) {
                env.insert(name.to_string(), value.clone());
            }
        }
    } else {
        env.extend(parent_env.clone());
    }

    for (name, default) in THREAD_ENV_DEFAULTS {
        let value = parent_env.get(name).cloned().unwrap_or_else(|| default.to_string());
        env.insert(name.to_string(), value);
    }
    for name in OPTIONAL_ENV_VARS {
        if let Some(value) = parent_env.get(name) {
            env.insert(name.to_string(), value.clone());
        }
    }

    env.insert("HOME".to_string(), "/tmp".to_string());
    env.insert("TMPDIR".to_string(), "/tmp".to_string());
    env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
    env.insert("PYTHONNOUSERSITE".to_string(), "1".to_string());
    env
}
