//! Per-job cgroup v2 handling under the worker's delegated subtree.
//!
//! The parent creates `<root>/job-N` with memory and pid limits before the
//! job-start message is sent; the child joins by writing its own pid. After
//! the job the parent reads the OOM counter, kills any holdout pids, and
//! removes the directory.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug)]
pub(crate) struct CgroupHandle {
    dir: PathBuf,
}

impl CgroupHandle {
    /// Create the per-job child group and configure its limits.
    pub fn create(
        root: &Path,
        job_seq: u64,
        memory_bytes: u64,
        pids_max: u32,
    ) -> std::io::Result<Self> {
        let dir = root.join(format!("job-{job_seq}"));
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("memory.max"), memory_bytes.to_string())?;
        std::fs::write(dir.join("pids.max"), pids_max.to_string())?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// OOM kills charged to this group since creation.
    pub fn oom_kill_count(&self) -> u64 {
        std::fs::read_to_string(self.dir.join("memory.events"))
            .map(|text| parse_oom_kill(&text))
            .unwrap_or(0)
    }

    /// SIGKILL any pids still charged to the group, wait for them to be
    /// reaped, then rmdir. Failures are logged, not raised: cleanup runs on
    /// every job path.
    pub fn destroy(self) {
        for _ in 0..50 {
            let pids = self.member_pids();
            if pids.is_empty() {
                break;
            }
            for pid in pids {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if let Err(err) = std::fs::remove_dir(&self.dir) {
            warn!("failed to remove cgroup {}: {err}", self.dir.display());
        }
    }

    fn member_pids(&self) -> Vec<libc::pid_t> {
        std::fs::read_to_string(self.dir.join("cgroup.procs"))
            .map(|text| {
                text.lines()
                    .filter_map(|line| line.trim().parse::<libc::pid_t>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Child side: move the calling process into the group.
pub(crate) fn join_current_process(dir: &Path) -> std::io::Result<()> {
    let mut procs = std::fs::OpenOptions::new()
        .write(true)
        .open(dir.join("cgroup.procs"))?;
    write!(procs, "{}", std::process::id())?;
    Ok(())
}

/// `memory.events` is `key value` lines; `oom_kill` is the cumulative count.
pub(crate) fn parse_oom_kill(text: &str) -> u64 {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("oom_kill"), Some(count)) => count.parse().ok(),
                _ => None,
            }
        })
        .next_back()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_oom_kill_from_memory_events() {
        let text = "low 0\nhigh 4\nmax 12\noom 3\noom_kill 2\noom_group_kill 0\n";
        assert_eq!(parse_oom_kill(text), 2);
        assert_eq!(parse_oom_kill("low 0\n"), 0);
        assert_eq!(parse_oom_kill(""), 0);
    }

    #[test]
    fn create_writes_limits_into_the_subtree() {
        // Plain directories stand in for a delegated cgroupfs: the files the
        // handle writes are ordinary files here.
        let tmp = tempfile::tempdir().unwrap();
        let handle = CgroupHandle::create(tmp.path(), 7, 64 << 20, 32).unwrap();
        assert!(handle.dir().ends_with("job-7"));
        assert_eq!(
            std::fs::read_to_string(handle.dir().join("memory.max")).unwrap(),
            (64u64 << 20).to_string()
        );
        assert_eq!(
            std::fs::read_to_string(handle.dir().join("pids.max")).unwrap(),
            "32"
        );
    }
}
