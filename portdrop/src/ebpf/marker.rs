//! Armed marker: a small YAML file written next to every attachment.
//!
//! It exists from just before attach until the drain removes it. Finding one
//! at startup means a previous run did not drain, and whatever that run left
//! on the interface has to be cleared before attaching again.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ebpf::attach::XdpMode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmedMarker {
    pub interface: String,
    pub mode: XdpMode,
    pub pid: u32,
}

/// What a marker file says about an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerState {
    Absent,
    /// Left by a process that is gone.
    Stale(ArmedMarker),
    /// Owned by another live process.
    HeldBy(ArmedMarker),
}

/// Marker location for `interface`, e.g. `/run/portdrop/eth0.armed`.
pub fn marker_path(dir: &Path, interface: &str) -> PathBuf {
    dir.join(format!("{interface}.armed"))
}

impl ArmedMarker {
    pub fn for_current_process(interface: &str, mode: XdpMode) -> Self {
        Self {
            interface: interface.to_string(),
            mode,
            pid: std::process::id(),
        }
    }

    /// Writes the marker atomically, creating the parent directory.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let contents = serde_yaml::to_string(self).map_err(io::Error::other)?;
        let tmp = path.with_extension("armed.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)
    }
}

pub fn inspect(path: &Path, interface: &str) -> io::Result<MarkerState> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(MarkerState::Absent),
        Err(e) => return Err(e),
    };

    let marker = match serde_yaml::from_str::<ArmedMarker>(&contents) {
        Ok(marker) => marker,
        Err(e) => {
            // Truncated by a crash mid-write; the attachment mode is unknown.
            warn!(
                event.name = "ebpf.marker_unreadable",
                marker.path = %path.display(),
                error.message = %e,
                "armed marker is unreadable, treating it as stale"
            );
            return Ok(MarkerState::Stale(ArmedMarker {
                interface: interface.to_string(),
                mode: XdpMode::Auto,
                pid: 0,
            }));
        }
    };

    if marker.pid != std::process::id() && process_alive(marker.pid) {
        Ok(MarkerState::HeldBy(marker))
    } else {
        Ok(MarkerState::Stale(marker))
    }
}

/// Removes the marker; a missing file is not an error.
pub fn remove(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence checks only.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use figment::Jail;

    use super::*;

    #[test]
    fn written_marker_reads_back_as_own() {
        Jail::expect_with(|_| {
            let path = marker_path(Path::new("state"), "eth0");
            let marker = ArmedMarker::for_current_process("eth0", XdpMode::Driver);
            marker.write(&path).expect("write marker");

            assert_eq!(path, PathBuf::from("state/eth0.armed"));
            // Our own pid never blocks startup.
            assert_eq!(
                inspect(&path, "eth0").expect("inspect"),
                MarkerState::Stale(marker)
            );

            remove(&path).expect("remove");
            assert_eq!(inspect(&path, "eth0").expect("inspect"), MarkerState::Absent);
            remove(&path).expect("removing twice is fine");

            Ok(())
        });
    }

    #[test]
    fn marker_of_live_process_holds_interface() {
        Jail::expect_with(|jail| {
            // pid 1 always exists.
            jail.create_file("eth0.armed", "interface: eth0\nmode: skb\npid: 1\n")?;
            let state = inspect(Path::new("eth0.armed"), "eth0").expect("inspect");
            assert!(
                matches!(state, MarkerState::HeldBy(ArmedMarker { pid: 1, .. })),
                "{state:?}"
            );

            Ok(())
        });
    }

    #[test]
    fn marker_of_dead_process_is_stale() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "eth0.armed",
                "interface: eth0\nmode: hardware\npid: 4294967295\n",
            )?;
            let state = inspect(Path::new("eth0.armed"), "eth0").expect("inspect");
            assert_eq!(
                state,
                MarkerState::Stale(ArmedMarker {
                    interface: "eth0".to_string(),
                    mode: XdpMode::Hardware,
                    pid: u32::MAX,
                })
            );

            Ok(())
        });
    }

    #[test]
    fn garbage_marker_is_stale() {
        Jail::expect_with(|jail| {
            jail.create_file("eth0.armed", "interf")?;
            let state = inspect(Path::new("eth0.armed"), "eth0").expect("inspect");
            assert!(
                matches!(state, MarkerState::Stale(ArmedMarker { mode: XdpMode::Auto, .. })),
                "{state:?}"
            );

            Ok(())
        });
    }
}
