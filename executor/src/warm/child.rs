//! Warm-runner child entrypoint.
//!
//! The process is spawned ahead of job arrival with a scrubbed environment
//! and piped stdio, builds its interpreter globals (the warm preload), then
//! blocks on stdin for the job-start message. Setup order inside the job is
//! a security invariant: cgroup join happens before `no_new_privs` (the
//! cgroup writes would be denied afterwards), rlimits before seccomp, and fd
//! closing last.

use crate::warm::rlimits;
use crate::warm::spec::INFRA_ERROR_MARKER;
use crate::warm::spec::WarmJobSpec;
use judge_harness::run_cases_with;
use judge_vm::Vm;
use std::io::Read;
use std::io::Write;

/// Run one job and exit. Returns the process exit code.
pub fn run_warm_child(preload_tensor: bool) -> i32 {
    // Warm preload: interpreter globals (and the tensor builtin set for the
    // heavy profile) are built before any job exists.
    let vm = Vm::new(preload_tensor);

    let mut message = String::new();
    if let Err(err) = std::io::stdin().read_to_string(&mut message) {
        return infra_error(&format!("failed to read job spec: {err}"));
    }
    let spec: WarmJobSpec = match serde_json::from_str(&message) {
        Ok(spec) => spec,
        Err(err) => return infra_error(&format!("invalid job spec: {err}")),
    };

    if let Err(detail) = enter_sandbox(&spec) {
        return infra_error(&detail);
    }

    let records = run_cases_with(&vm, &spec.config, &spec.user_code);
    let json = match serde_json::to_string(&records) {
        Ok(json) => json,
        Err(err) => return infra_error(&format!("failed to encode records: {err}")),
    };
    let mut stdout = std::io::stdout();
    if stdout
        .write_all(json.as_bytes())
        .and_then(|()| stdout.write_all(b"\n"))
        .and_then(|()| stdout.flush())
        .is_err()
    {
        return 1;
    }
    0
}

/// Apply the per-job hardening sequence, in order.
fn enter_sandbox(spec: &WarmJobSpec) -> Result<(), String> {
    #[cfg(target_os = "linux")]
    if let Some(cgroup_dir) = &spec.cgroup_dir {
        crate::warm::cgroup::join_current_process(cgroup_dir)
            .map_err(|err| format!("failed to join cgroup {}: {err}", cgroup_dir.display()))?;
    }

    if unsafe { libc::setsid() } == -1 {
        return Err(format!(
            "failed to create session: {}",
            std::io::Error::last_os_error()
        ));
    }
    unsafe {
        libc::umask(0o077);
    }

    #[cfg(target_os = "linux")]
    if spec.hardening.enable_no_new_privs {
        let outcome = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if outcome != 0 {
            return Err(format!(
                "prctl(PR_SET_NO_NEW_PRIVS) failed: {}",
                std::io::Error::last_os_error()
            ));
        }
    }

    rlimits::apply(&spec.hardening.limits)?;

    #[cfg(target_os = "linux")]
    if spec.hardening.enable_seccomp {
        if let Err(detail) = crate::warm::seccomp::install(spec.hardening.deny_filesystem) {
            if spec.hardening.seccomp_fail_closed {
                return Err(detail);
            }
            eprintln!("seccomp unavailable, continuing open: {detail}");
        }
    }

    close_inherited_fds();
    Ok(())
}

/// Close everything above stdio. The job spec was fully read before this
/// point, and the result pipes are fds 1 and 2.
fn close_inherited_fds() {
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max_fd = if max_fd <= 3 { 4096 } else { max_fd.min(65_536) };
    for fd in 3..max_fd as i32 {
        unsafe {
            libc::close(fd);
        }
    }
}

fn infra_error(detail: &str) -> i32 {
    eprintln!("{INFRA_ERROR_MARKER} {detail}");
    let _ = std::io::stderr().flush();
    1
}
