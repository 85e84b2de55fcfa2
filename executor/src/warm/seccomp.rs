//! Seccomp-bpf filter for warm-executor children.
//!
//! Default action is ALLOW; every listed syscall returns EPERM. Submissions
//! therefore keep normal computation but lose the network, process control,
//! high-risk kernel surfaces, and (optionally) filesystem access.
//!
//! Syscall numbers come from `libc::SYS_*` at compile time. Legacy names
//! that only exist on x86_64 (`open`, `stat`, ...) are gated to that
//! architecture; the process-control and high-risk groups are unconditional
//! on every supported target, so nothing dangerous is silently skipped.

use seccompiler::BpfProgram;
use seccompiler::SeccompAction;
use seccompiler::SeccompFilter;
use seccompiler::SeccompRule;
use seccompiler::TargetArch;
use seccompiler::apply_filter;
use std::collections::BTreeMap;

/// Network egress and local socket creation.
const DENY_NETWORK: &[i64] = &[
    libc::SYS_socket,
    libc::SYS_socketpair,
    libc::SYS_connect,
    libc::SYS_accept,
    libc::SYS_accept4,
    libc::SYS_bind,
    libc::SYS_listen,
    libc::SYS_sendto,
    libc::SYS_sendmsg,
    libc::SYS_sendmmsg,
    libc::SYS_recvfrom,
    libc::SYS_recvmsg,
    libc::SYS_recvmmsg,
    libc::SYS_getsockopt,
    libc::SYS_setsockopt,
    libc::SYS_shutdown,
];

/// Process execution, tracing, namespace manipulation, and cross-process
/// signaling or introspection.
const DENY_PROCESS_CONTROL: &[i64] = &[
    libc::SYS_execve,
    libc::SYS_execveat,
    libc::SYS_ptrace,
    libc::SYS_unshare,
    libc::SYS_setns,
    libc::SYS_mount,
    libc::SYS_umount2,
    libc::SYS_pivot_root,
    libc::SYS_chroot,
    libc::SYS_kill,
    libc::SYS_tkill,
    libc::SYS_tgkill,
    libc::SYS_pidfd_send_signal,
    libc::SYS_process_vm_readv,
    libc::SYS_process_vm_writev,
    libc::SYS_pidfd_open,
    libc::SYS_pidfd_getfd,
    libc::SYS_kcmp,
    libc::SYS_prlimit64,
];

/// Kernel attack surface user submissions never need.
const DENY_HIGH_RISK: &[i64] = &[
    libc::SYS_bpf,
    libc::SYS_keyctl,
    libc::SYS_add_key,
    libc::SYS_request_key,
    libc::SYS_init_module,
    libc::SYS_finit_module,
    libc::SYS_delete_module,
    libc::SYS_kexec_load,
    libc::SYS_open_by_handle_at,
    libc::SYS_io_uring_setup,
    libc::SYS_io_uring_enter,
    libc::SYS_io_uring_register,
    libc::SYS_userfaultfd,
    libc::SYS_perf_event_open,
];

/// Opening host paths, under the filesystem-deny profile.
const DENY_FILE_OPEN: &[i64] = &[
    libc::SYS_openat,
    libc::SYS_openat2,
    #[cfg(target_arch = "x86_64")]
    libc::SYS_open,
    #[cfg(target_arch = "x86_64")]
    libc::SYS_creat,
];

/// Filesystem metadata probing (existence and discovery), under the
/// filesystem-deny profile.
const DENY_FILE_METADATA: &[i64] = &[
    libc::SYS_newfstatat,
    libc::SYS_statx,
    libc::SYS_faccessat,
    libc::SYS_faccessat2,
    libc::SYS_readlinkat,
    libc::SYS_getdents64,
    #[cfg(target_arch = "x86_64")]
    libc::SYS_stat,
    #[cfg(target_arch = "x86_64")]
    libc::SYS_lstat,
    #[cfg(target_arch = "x86_64")]
    libc::SYS_access,
    #[cfg(target_arch = "x86_64")]
    libc::SYS_readlink,
    #[cfg(target_arch = "x86_64")]
    libc::SYS_getdents,
];

/// Every syscall the filter denies for the given profile.
pub(crate) fn denied_syscalls(deny_filesystem: bool) -> Vec<i64> {
    let mut syscalls: Vec<i64> = Vec::new();
    syscalls.extend_from_slice(DENY_NETWORK);
    syscalls.extend_from_slice(DENY_PROCESS_CONTROL);
    syscalls.extend_from_slice(DENY_HIGH_RISK);
    if deny_filesystem {
        syscalls.extend_from_slice(DENY_FILE_OPEN);
        syscalls.extend_from_slice(DENY_FILE_METADATA);
    }
    syscalls
}

fn target_arch() -> Result<TargetArch, String> {
    if cfg!(target_arch = "x86_64") {
        Ok(TargetArch::x86_64)
    } else if cfg!(target_arch = "aarch64") {
        Ok(TargetArch::aarch64)
    } else {
        Err("unsupported architecture for seccomp filter".to_string())
    }
}

/// Compile the filter without installing it. The parent runs this once at
/// startup so a fail-closed configuration refuses to start when the filter
/// cannot be built.
pub(crate) fn build_filter(deny_filesystem: bool) -> Result<BpfProgram, String> {
    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    for syscall in denied_syscalls(deny_filesystem) {
        // Empty rule vec = unconditional match.
        rules.insert(syscall, vec![]);
    }
    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM as u32),
        target_arch()?,
    )
    .map_err(|err| format!("seccomp filter construction failed: {err}"))?;
    filter
        .try_into()
        .map_err(|err: seccompiler::BackendError| format!("seccomp compilation failed: {err}"))
}

/// Install the filter on the current thread. Requires `no_new_privs`.
pub(crate) fn install(deny_filesystem: bool) -> Result<(), String> {
    let program = build_filter(deny_filesystem)?;
    apply_filter(&program).map_err(|err| format!("seccomp load failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deny_list_always_covers_process_control_and_network() {
        let base = denied_syscalls(false);
        for syscall in [libc::SYS_execve, libc::SYS_socket, libc::SYS_ptrace, libc::SYS_bpf] {
            assert!(base.contains(&syscall), "missing syscall {syscall}");
        }
        assert!(!base.contains(&libc::SYS_openat));
    }

    #[test]
    fn filesystem_deny_adds_open_and_metadata_families() {
        let full = denied_syscalls(true);
        for syscall in [libc::SYS_openat, libc::SYS_newfstatat, libc::SYS_statx] {
            assert!(full.contains(&syscall), "missing syscall {syscall}");
        }
        assert!(full.len() > denied_syscalls(false).len());
    }

    #[test]
    fn filters_compile_for_both_profiles() {
        assert!(!build_filter(false).unwrap().is_empty());
        assert!(!build_filter(true).unwrap().is_empty());
    }

    #[test]
    fn deny_list_has_no_duplicates() {
        let mut syscalls = denied_syscalls(true);
        let before = syscalls.len();
        syscalls.sort_unstable();
        syscalls.dedup();
        assert_eq!(syscalls.len(), before);
    }
}
