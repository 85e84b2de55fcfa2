//! Parent-side wait with bounded output capture.
//!
//! A poller watches the child's pidfd and its stdout/stderr pipes. Reads are
//! 64 KiB per wakeup; once the combined captured size exceeds the cap,
//! further bytes are consumed and discarded so the child never blocks on a
//! full pipe. On deadline expiry the child's whole process group is
//! SIGKILLed, then reaped with a blocking `waitpid`.

use std::os::fd::AsRawFd;
use std::time::Instant;
use tracing::warn;

const READ_CHUNK: usize = 64 * 1024;

/// Combined stdout+stderr capture budget.
pub(crate) const OUTPUT_CAP_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ExitStatus {
    Exited(i32),
    Signaled(i32),
    Unknown,
}

#[derive(Debug)]
pub(crate) struct CaptureOutcome {
    pub status: ExitStatus,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub capped: bool,
}

/// Shared budget across both pipes. `capped` latches once a read had to
/// discard bytes.
#[derive(Default)]
struct CaptureBudget {
    captured: usize,
    capped: bool,
}

struct PipeCapture {
    fd: i32,
    buffer: Vec<u8>,
    open: bool,
}

impl PipeCapture {
    fn new(fd: i32) -> Self {
        Self {
            fd,
            buffer: Vec::new(),
            open: true,
        }
    }

    /// One bounded read after a readiness event. Bytes beyond the budget are
    /// consumed and dropped. Returns the byte count read (0 for EOF or a
    /// fatal error, which also closes the capture).
    fn drain_once(&mut self, budget: &mut CaptureBudget) -> usize {
        let mut chunk = [0u8; READ_CHUNK];
        let read = unsafe { libc::read(self.fd, chunk.as_mut_ptr().cast(), READ_CHUNK) };
        match read {
            0 => {
                self.open = false;
                0
            }
            n if n < 0 => {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::WouldBlock
                    && err.kind() != std::io::ErrorKind::Interrupted
                {
                    self.open = false;
                }
                0
            }
            n => {
                let n = n as usize;
                let keep = n.min(OUTPUT_CAP_BYTES.saturating_sub(budget.captured));
                self.buffer.extend_from_slice(&chunk[..keep]);
                budget.captured += keep;
                if keep < n {
                    budget.capped = true;
                }
                n
            }
        }
    }
}

/// Wait for `child` until `deadline`, capturing bounded output.
///
/// Blocking; run under `spawn_blocking`. The child is reaped on every path,
/// including deadline kills.
pub(crate) fn wait_and_capture(
    child: &mut std::process::Child,
    deadline: Instant,
) -> std::io::Result<CaptureOutcome> {
    let pid = child.id() as libc::pid_t;
    let stdout_fd = child.stdout.as_ref().map(|pipe| pipe.as_raw_fd());
    let stderr_fd = child.stderr.as_ref().map(|pipe| pipe.as_raw_fd());

    let pidfd = open_pidfd(pid);
    let mut stdout = stdout_fd.map(PipeCapture::new);
    let mut stderr = stderr_fd.map(PipeCapture::new);
    let mut budget = CaptureBudget::default();
    let mut timed_out = false;
    let mut child_exited = false;

    loop {
        let now = Instant::now();
        if now >= deadline {
            timed_out = true;
            kill_process_group(pid);
            break;
        }
        if child_exited {
            break;
        }
        let pipes_open = stdout.as_ref().is_some_and(|pipe| pipe.open)
            || stderr.as_ref().is_some_and(|pipe| pipe.open);
        if pidfd.is_none() && !pipes_open {
            // No pidfd on this kernel: both pipes at EOF is the exit signal.
            break;
        }

        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(3);
        let mut roles: Vec<u8> = Vec::with_capacity(3);
        if let Some(fd) = pidfd {
            fds.push(pollfd(fd));
            roles.push(b'p');
        }
        if let Some(pipe) = stdout.as_ref().filter(|pipe| pipe.open) {
            fds.push(pollfd(pipe.fd));
            roles.push(b'o');
        }
        if let Some(pipe) = stderr.as_ref().filter(|pipe| pipe.open) {
            fds.push(pollfd(pipe.fd));
            roles.push(b'e');
        }

        let remaining_ms = deadline
            .saturating_duration_since(now)
            .as_millis()
            .min(i32::MAX as u128) as i32;
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, remaining_ms) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ready == 0 {
            continue;
        }

        for (index, entry) in fds.iter().enumerate() {
            if entry.revents == 0 {
                continue;
            }
            match roles[index] {
                b'p' => child_exited = true,
                b'o' => {
                    if let Some(pipe) = stdout.as_mut() {
                        pipe.drain_once(&mut budget);
                    }
                }
                b'e' => {
                    if let Some(pipe) = stderr.as_mut() {
                        pipe.drain_once(&mut budget);
                    }
                }
                _ => {}
            }
        }
    }

    let status = reap(pid);
    drain_remaining(stdout.as_mut(), &mut budget);
    drain_remaining(stderr.as_mut(), &mut budget);
    if let Some(fd) = pidfd {
        unsafe {
            libc::close(fd);
        }
    }
    // The pid is reaped above; the Child handle must not be waited on again.

    Ok(CaptureOutcome {
        status,
        timed_out,
        capped: budget.capped,
        stdout: stdout.map(|pipe| pipe.buffer).unwrap_or_default(),
        stderr: stderr.map(|pipe| pipe.buffer).unwrap_or_default(),
    })
}

fn pollfd(fd: i32) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

/// Final non-blocking sweep after the child is gone.
fn drain_remaining(pipe: Option<&mut PipeCapture>, budget: &mut CaptureBudget) {
    let Some(pipe) = pipe else {
        return;
    };
    set_nonblocking(pipe.fd);
    while pipe.open {
        if pipe.drain_once(budget) == 0 {
            break;
        }
    }
}

fn set_nonblocking(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

#[cfg(target_os = "linux")]
fn open_pidfd(pid: libc::pid_t) -> Option<i32> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0u32) };
    if fd < 0 { None } else { Some(fd as i32) }
}

#[cfg(not(target_os = "linux"))]
fn open_pidfd(_pid: libc::pid_t) -> Option<i32> {
    None
}

/// SIGKILL the child's process group (the child called `setsid`, so its pgid
/// is its pid), falling back to the single process.
pub(crate) fn kill_process_group(pid: libc::pid_t) {
    let killed = unsafe { libc::killpg(pid, libc::SIGKILL) };
    if killed != 0 {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

fn reap(pid: libc::pid_t) -> ExitStatus {
    let mut status: libc::c_int = 0;
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    if waited != pid {
        warn!("waitpid({pid}) returned {waited}: {}", std::io::Error::last_os_error());
        return ExitStatus::Unknown;
    }
    if libc::WIFEXITED(status) {
        ExitStatus::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitStatus::Signaled(libc::WTERMSIG(status))
    } else {
        ExitStatus::Unknown
    }
}
