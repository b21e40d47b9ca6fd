//! Interface attacher: binds the XDP program to an interface and tracks the
//! attachment with an armed marker.
//!
//! Links stay owned by this process, so the kernel drops fd-based links
//! (5.9+) when the process dies for any reason. Netlink attachments survive
//! their owner; the marker lets the next start find and clear them.
//!
//! Pinning the link in bpffs is opt-in. A pinned link keeps filtering after a
//! crash until the next start removes it.

use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use aya::{
    programs::{
        ProgramError, Xdp, XdpFlags,
        links::{FdLink, PinnedLink},
        xdp::XdpLinkId,
    },
    util::KernelVersion,
};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    ebpf::{
        collection::FilterCollection,
        marker::{self, ArmedMarker, MarkerState},
        netlink,
    },
    error::{PortDropError, Result},
};
/// How the XDP program is hooked into the driver.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum XdpMode {
    /// Let the kernel pick the best mode the driver supports.
    Auto,
    /// Generic XDP, runs after the skb is allocated. Works on every interface.
    #[default]
    Skb,
    /// Native XDP inside the driver.
    Driver,
    /// Offloaded to the NIC.
    Hardware,
}

impl XdpMode {
    pub fn flags(self) -> XdpFlags {
        match self {
            XdpMode::Auto => XdpFlags::default(),
            XdpMode::Skb => XdpFlags::SKB_MODE,
            XdpMode::Driver => XdpFlags::DRV_MODE,
            XdpMode::Hardware => XdpFlags::HW_MODE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            XdpMode::Auto => "auto",
            XdpMode::Skb => "skb",
            XdpMode::Driver => "driver",
            XdpMode::Hardware => "hardware",
        }
    }
}

impl fmt::Display for XdpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how to attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub interface: String,
    pub mode: XdpMode,
    /// Directory for the armed marker, `None` to run without one.
    pub marker_dir: Option<PathBuf>,
    /// bpffs directory to pin the link in, `None` to keep it process-owned.
    pub pin_dir: Option<PathBuf>,
}

impl AttachRequest {
    pub fn marker_path(&self) -> Option<PathBuf> {
        self.marker_dir
            .as_deref()
            .map(|dir| marker::marker_path(dir, &self.interface))
    }

    /// Pin location for this interface, e.g. `/sys/fs/bpf/portdrop/eth0_xdp`.
    pub fn pin_path(&self) -> Option<PathBuf> {
        self.pin_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}_xdp", self.interface)))
    }
}

/// Revocation handle for an attached program.
pub struct XdpAttachment {
    interface: String,
    marker: Option<PathBuf>,
    link: AttachedLink,
}

enum AttachedLink {
    /// Tracked by the program; detached through the collection.
    Owned(XdpLinkId),
    /// Pinned in bpffs; detached by removing the pin and closing the fd.
    Pinned { path: PathBuf, link: PinnedLink },
}

/// Arms the marker, then attaches the collection's program to
/// `request.interface`.
pub fn attach(collection: &mut FilterCollection, request: &AttachRequest) -> Result<XdpAttachment> {
    let interface = request.interface.as_str();
    let program = collection.xdp_mut()?;

    let marker = request.marker_path();
    if let Some(path) = &marker {
        ArmedMarker::for_current_process(interface, request.mode)
            .write(path)
            .map_err(|e| PortDropError::armed_marker(path, e))?;
    }

    let link_id = match program.attach(interface, request.mode.flags()) {
        Ok(link_id) => link_id,
        Err(e) => {
            disarm(marker.as_deref());
            return Err(classify_attach_error(interface, e));
        }
    };

    info!(
        event.name = "ebpf.program_attached",
        network.interface.name = %interface,
        ebpf.attach.mode = %request.mode,
        "attached xdp program to interface"
    );

    let link = match request.pin_path() {
        None => AttachedLink::Owned(link_id),
        Some(path) => match pin(program, link_id, path, interface) {
            Ok(link) => link,
            Err(e) => {
                disarm(marker.as_deref());
                return Err(e);
            }
        },
    };

    Ok(XdpAttachment {
        interface: interface.to_string(),
        marker,
        link,
    })
}

fn pin(program: &mut Xdp, link_id: XdpLinkId, path: PathBuf, interface: &str) -> Result<AttachedLink> {
    if !fd_links_supported() {
        warn!(
            event.name = "ebpf.link_pin_skipped",
            network.interface.name = %interface,
            reason = "netlink_attach",
            "kernel attaches xdp through netlink, link cannot be pinned"
        );
        return Ok(AttachedLink::Owned(link_id));
    }

    if let Err(e) = ensure_pin_dir(&path) {
        warn!(
            event.name = "ebpf.link_pin_skipped",
            network.interface.name = %interface,
            pin_path = %path.display(),
            error = %e,
            "bpffs pin directory is not writable, keeping process-owned link"
        );
        return Ok(AttachedLink::Owned(link_id));
    }

    // From here on the link leaves the program's bookkeeping: if converting
    // or pinning fails, the dropped link detaches the program.
    let link = program
        .take_link(link_id)
        .map_err(|e| PortDropError::link_pin(&path, e))?;
    let fd_link = FdLink::try_from(link).map_err(|e| PortDropError::link_pin(&path, e))?;
    let pinned = fd_link
        .pin(&path)
        .map_err(|e| PortDropError::link_pin(&path, e))?;

    warn!(
        event.name = "ebpf.link_pinned",
        network.interface.name = %interface,
        pin_path = %path.display(),
        "pinned xdp link, filtering continues after an abnormal exit until the next start"
    );
    Ok(AttachedLink::Pinned { path, link: pinned })
}

/// Detaches a previously attached program, then removes its marker.
pub fn detach(collection: &mut FilterCollection, attachment: XdpAttachment) -> Result<()> {
    let XdpAttachment {
        interface,
        marker,
        link,
    } = attachment;

    match link {
        AttachedLink::Owned(link_id) => {
            collection
                .xdp_mut()?
                .detach(link_id)
                .map_err(|e| PortDropError::detach_failed(&interface, e))?;
        }
        AttachedLink::Pinned { path, link } => {
            let fd_link = link
                .unpin()
                .map_err(|e| PortDropError::detach_failed(&interface, e))?;
            drop(fd_link);
            debug!(
                event.name = "ebpf.link_unpinned",
                pin_path = %path.display(),
                "removed xdp link pin"
            );
        }
    }
    debug!(
        event.name = "ebpf.program_detached",
        network.interface.name = %interface,
        "detached xdp program"
    );

    if let Some(path) = marker {
        marker::remove(&path).map_err(|e| PortDropError::armed_marker(&path, e))?;
    }
    Ok(())
}

/// Clears whatever a previous run left on the interface: an opt-in link pin,
/// and the attachment behind a stale armed marker. Returns whether anything
/// was found.
///
/// Fails with `AttachmentRejected` when the marker belongs to another live
/// process.
pub fn clear_stale(request: &AttachRequest) -> Result<bool> {
    let mut cleared = false;

    if let Some(path) = request.pin_path().filter(|path| path.exists()) {
        let pinned = PinnedLink::from_pin(&path).map_err(|e| PortDropError::link_pin(&path, e))?;
        let fd_link = pinned
            .unpin()
            .map_err(|e| PortDropError::link_pin(&path, e))?;
        drop(fd_link);

        warn!(
            event.name = "ebpf.stale_link_detached",
            network.interface.name = %request.interface,
            pin_path = %path.display(),
            "detached pinned xdp link left behind by a previous run"
        );
        cleared = true;
    }

    let Some(path) = request.marker_path() else {
        return Ok(cleared);
    };
    match marker::inspect(&path, &request.interface)
        .map_err(|e| PortDropError::armed_marker(&path, e))?
    {
        MarkerState::Absent => {}
        MarkerState::HeldBy(owner) => {
            return Err(PortDropError::attachment_rejected(
                &request.interface,
                format!("interface is armed by running portdrop (pid {})", owner.pid),
            ));
        }
        MarkerState::Stale(previous) => {
            detach_orphan(&request.interface, previous.mode)?;
            marker::remove(&path).map_err(|e| PortDropError::armed_marker(&path, e))?;
            warn!(
                event.name = "ebpf.stale_attachment_cleared",
                network.interface.name = %request.interface,
                ebpf.attach.mode = %previous.mode,
                previous.pid = previous.pid,
                "cleared xdp attachment left behind by a previous run"
            );
            cleared = true;
        }
    }
    Ok(cleared)
}

/// Removes the XDP program in `mode` from `interface`, if any.
fn detach_orphan(interface: &str, mode: XdpMode) -> Result<()> {
    let index = netlink::interface_index(interface)
        .map_err(|e| PortDropError::stale_attachment(interface, e))?;
    let Some(index) = index else {
        debug!(
            event.name = "ebpf.stale_interface_gone",
            network.interface.name = %interface,
            "interface no longer exists, nothing to clear"
        );
        return Ok(());
    };
    netlink::clear_xdp(index, mode.flags().bits())
        .map_err(|e| PortDropError::stale_attachment(interface, e))
}

fn disarm(marker: Option<&Path>) {
    let Some(path) = marker else {
        return;
    };
    if let Err(e) = marker::remove(path) {
        warn!(
            event.name = "ebpf.marker_remove_failed",
            marker.path = %path.display(),
            error.message = %e,
            "failed to remove armed marker"
        );
    }
}

/// XDP links are fd based from 5.9 on; older kernels attach through netlink.
fn fd_links_supported() -> bool {
    KernelVersion::current()
        .map(|v| v >= KernelVersion::new(5, 9, 0))
        .unwrap_or(false)
}

fn ensure_pin_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) => std::fs::create_dir_all(dir),
        None => Ok(()),
    }
}

fn classify_attach_error(interface: &str, error: ProgramError) -> PortDropError {
    match &error {
        ProgramError::UnknownInterface { .. } => {
            PortDropError::interface_unsupported(interface, error)
        }
        ProgramError::SyscallError(e) if is_unsupported_hook(&e.io_error) => {
            PortDropError::interface_unsupported(interface, error)
        }
        _ => PortDropError::attachment_rejected(interface, error),
    }
}

fn is_unsupported_hook(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::EOPNOTSUPP) | Some(libc::ENODEV) | Some(libc::ENXIO)
    )
}
