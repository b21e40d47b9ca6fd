//! Capability preflight.
//!
//! Loading and attaching the filter needs:
//! - CAP_BPF: create maps and load the program (CAP_SYS_ADMIN before 5.8)
//! - CAP_NET_ADMIN: attach XDP programs to interfaces
//! - CAP_SYS_RESOURCE: lift the memlock rlimit on older kernels
//!
//! Missing capabilities are only reported. The kernel call that needs one
//! fails with a precise error anyway.

use std::fs;

use tracing::{debug, warn};

/// Linux capability numbers from <linux/capability.h>
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    NetAdmin = 12,
    SysAdmin = 21,
    SysResource = 24,
    Bpf = 39,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Capability::NetAdmin => "CAP_NET_ADMIN",
            Capability::SysAdmin => "CAP_SYS_ADMIN",
            Capability::SysResource => "CAP_SYS_RESOURCE",
            Capability::Bpf => "CAP_BPF",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Capability::NetAdmin => "attach xdp programs to network interfaces",
            Capability::SysAdmin => "load eBPF programs on kernels without CAP_BPF",
            Capability::SysResource => "remove the memlock rlimit",
            Capability::Bpf => "load eBPF programs and create maps",
        }
    }

    fn bit(self) -> u64 {
        1u64 << (self as u32)
    }
}

const REQUIRED: [Capability; 3] = [
    Capability::Bpf,
    Capability::NetAdmin,
    Capability::SysResource,
];

/// Effective capability mask from the contents of `/proc/self/status`.
fn effective_mask(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
}

/// Capabilities from [`REQUIRED`] missing in `mask`. CAP_SYS_ADMIN stands in
/// for CAP_BPF.
fn missing_from(mask: u64) -> Vec<Capability> {
    REQUIRED
        .into_iter()
        .filter(|cap| mask & cap.bit() == 0)
        .filter(|cap| !(*cap == Capability::Bpf && mask & Capability::SysAdmin.bit() != 0))
        .collect()
}

/// Logs a warning for every required capability the process lacks and
/// returns them.
pub fn preflight() -> Vec<Capability> {
    let mask = match fs::read_to_string("/proc/self/status") {
        Ok(status) => effective_mask(&status),
        Err(e) => {
            warn!(
                event.name = "capabilities.check_failed",
                error.message = %e,
                "failed to read /proc/self/status, skipping capability check"
            );
            return Vec::new();
        }
    };
    let Some(mask) = mask else {
        warn!(
            event.name = "capabilities.check_failed",
            "CapEff line not found in /proc/self/status, skipping capability check"
        );
        return Vec::new();
    };

    let missing = missing_from(mask);
    for cap in &missing {
        warn!(
            event.name = "capabilities.missing",
            capability = cap.name(),
            description = cap.description(),
            "capability missing, startup will likely fail (run as root or grant it)"
        );
    }
    if missing.is_empty() {
        debug!(
            event.name = "capabilities.present",
            "all required capabilities present"
        );
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_mask_parsing() {
        let status = "Name:\tportdrop\nCapInh:\t0000000000000000\nCapEff:\t000001ffffffffff\n";
        assert_eq!(effective_mask(status), Some(0x000001ffffffffff));
        assert_eq!(effective_mask("Name:\tportdrop\n"), None);
        assert_eq!(effective_mask("CapEff:\tnothex\n"), None);
    }

    #[test]
    fn test_root_has_everything() {
        assert!(missing_from(0x000001ffffffffff).is_empty());
    }

    #[test]
    fn test_sys_admin_covers_bpf() {
        let mask = Capability::SysAdmin.bit()
            | Capability::NetAdmin.bit()
            | Capability::SysResource.bit();
        assert!(missing_from(mask).is_empty());
    }

    #[test]
    fn test_unprivileged_misses_all() {
        assert_eq!(
            missing_from(0),
            vec![
                Capability::Bpf,
                Capability::NetAdmin,
                Capability::SysResource
            ]
        );
    }

    #[test]
    fn test_capability_names() {
        assert_eq!(Capability::NetAdmin.name(), "CAP_NET_ADMIN");
        assert_eq!(Capability::Bpf.name(), "CAP_BPF");
    }
}
