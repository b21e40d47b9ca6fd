use std::io;

use tracing::{debug, info};

use crate::error::{PortDropError, Result};

/// Lifts RLIMIT_MEMLOCK so the kernel can pin map and program memory.
///
/// Kernels with memcg based accounting (>= 5.11) no longer need this, but
/// older ones refuse to create maps under the default 64 KiB limit, see
/// https://lwn.net/Articles/837122/.
pub fn remove_memlock_limit() -> Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `current` is a valid, writable rlimit.
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut current) } == 0
        && current.rlim_cur == libc::RLIM_INFINITY
    {
        debug!(
            event.name = "ebpf.memlock_unlimited",
            system.rlimit.type = "memlock",
            "locked memory is already unlimited"
        );
        return Ok(());
    }

    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: `rlim` is a valid rlimit that outlives the call.
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        return Err(PortDropError::ResourceLimitUnavailable(
            io::Error::last_os_error(),
        ));
    }

    info!(
        event.name = "ebpf.memlock_removed",
        system.rlimit.type = "memlock",
        "removed limit on locked memory"
    );
    Ok(())
}
