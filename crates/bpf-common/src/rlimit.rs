use anyhow::{Context, Result};

/// Raise the memlock rlimit to infinity. Kernels before 5.11 charge map
/// memory against it, and the default is too low for the path tables.
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: `rlimit` is a valid, initialized struct for the whole call.
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        return Err(std::io::Error::last_os_error()).context("Failed to increase rlimit");
    }
    Ok(())
}
