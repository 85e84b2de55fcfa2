//! Child-side resource limits.
//!
//! Each setter clamps the target to the current hard limit, tries to set
//! soft and hard together, and falls back to raising only the soft cap when
//! the hard limit cannot be moved. A required limit that cannot be applied
//! aborts the child with an infrastructure error.

use crate::warm::spec::ResourceLimits;

pub(crate) fn apply(limits: &ResourceLimits) -> Result<(), String> {
    set_limit(
        libc::RLIMIT_CPU as i32,
        "RLIMIT_CPU",
        limits.cpu_seconds.max(1),
        true,
        1,
    )?;
    set_limit(
        libc::RLIMIT_AS as i32,
        "RLIMIT_AS",
        limits.memory_bytes.max(1),
        cfg!(target_os = "linux"),
        1,
    )?;
    set_limit(
        libc::RLIMIT_FSIZE as i32,
        "RLIMIT_FSIZE",
        limits.fsize_bytes.max(1),
        true,
        1,
    )?;
    set_limit(
        libc::RLIMIT_NPROC as i32,
        "RLIMIT_NPROC",
        u64::from(limits.process_limit.max(1)),
        true,
        1,
    )?;
    set_limit(
        libc::RLIMIT_NOFILE as i32,
        "RLIMIT_NOFILE",
        limits.nofile.max(16),
        true,
        1,
    )?;
    set_limit(libc::RLIMIT_CORE as i32, "RLIMIT_CORE", 0, false, 0)?;
    Ok(())
}

fn set_limit(
    resource: i32,
    name: &str,
    value: u64,
    required: bool,
    min_value: u64,
) -> Result<(), String> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let got = unsafe { libc::getrlimit(resource as _, &mut current) };
    if got != 0 {
        if required {
            return Err(format!(
                "getrlimit({name}) failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        return Ok(());
    }

    let mut target = value;
    if current.rlim_max != libc::RLIM_INFINITY {
        target = target.min(current.rlim_max);
    }
    if target < min_value {
        if required {
            return Err(format!("invalid {name} target: {target}"));
        }
        return Ok(());
    }

    let both = libc::rlimit {
        rlim_cur: target,
        rlim_max: target,
    };
    if unsafe { libc::setrlimit(resource as _, &both) } == 0 {
        return Ok(());
    }

    // Hard limit is immovable; settle for the soft cap.
    let soft_only = libc::rlimit {
        rlim_cur: target,
        rlim_max: current.rlim_max,
    };
    if unsafe { libc::setrlimit(resource as _, &soft_only) } == 0 {
        return Ok(());
    }
    if required {
        return Err(format!(
            "failed to set {name}: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nofile_limit_applies_within_the_hard_cap() {
        // Lowering the soft NOFILE limit is always permitted, so this
        // exercises the clamp + set path for real.
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let got = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE as _, &mut current) };
        assert_eq!(got, 0);
        let request = current.rlim_cur.max(64);
        set_limit(libc::RLIMIT_NOFILE as i32, "RLIMIT_NOFILE", request, true, 1).unwrap();
    }

    #[test]
    fn core_limit_is_best_effort() {
        set_limit(libc::RLIMIT_CORE as i32, "RLIMIT_CORE", 0, false, 0).unwrap();
    }
}
