//! rtnetlink access for XDP programs that no process owns any more.
//!
//! Netlink-attached XDP programs (kernels before 5.9, or attachments made by
//! other tools) stay on the interface after their loader dies. Clearing them
//! needs an `RTM_SETLINK` with `IFLA_XDP_FD = -1` in the matching mode.

use std::{ffi::CString, io};

use netlink_packet_core::{NLM_F_ACK, NLM_F_REQUEST, NetlinkMessage, NetlinkPayload};
use netlink_packet_route::{
    RouteNetlinkMessage,
    link::{LinkAttribute, LinkMessage, LinkXdp},
};
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use tracing::debug;

/// Index of `name`, or `None` if no such interface exists.
pub fn interface_index(name: &str) -> io::Result<Option<u32>> {
    let c_name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `c_name` is a valid NUL-terminated string for the duration of the call.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index != 0 {
        return Ok(Some(index));
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENODEV) | Some(libc::ENXIO) => Ok(None),
        _ => Err(err),
    }
}

/// Builds the `RTM_SETLINK` request removing the XDP program in the mode
/// selected by `flags` (`0` lets the kernel pick, as on attach).
fn clear_xdp_request(index: u32, flags: u32) -> Vec<u8> {
    let mut link = LinkMessage::default();
    link.header.index = index;

    let mut xdp = vec![LinkXdp::Fd(-1)];
    if flags != 0 {
        xdp.push(LinkXdp::Flags(flags));
    }
    link.attributes.push(LinkAttribute::Xdp(xdp));

    let mut request = NetlinkMessage::from(RouteNetlinkMessage::SetLink(link));
    request.header.flags = NLM_F_REQUEST | NLM_F_ACK;
    request.header.sequence_number = 1;
    request.finalize();

    let mut buf = vec![0u8; request.buffer_len()];
    request.serialize(&mut buf);
    buf
}

/// Detaches whatever XDP program is attached to interface `index` in the
/// given mode. Succeeds when nothing was attached.
pub fn clear_xdp(index: u32, flags: u32) -> io::Result<()> {
    let request = clear_xdp_request(index, flags);

    let mut socket = Socket::new(NETLINK_ROUTE)?;
    socket.bind_auto()?;
    socket.connect(&SocketAddr::new(0, 0))?;
    socket.send(&request, 0)?;

    let (reply, _) = socket.recv_from_full()?;
    let message = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&reply)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    match message.payload {
        NetlinkPayload::Error(e) if e.code.is_some() => Err(e.to_io()),
        _ => {
            debug!(
                event.name = "ebpf.netlink_xdp_cleared",
                network.interface.index = index,
                ebpf.attach.flags = flags,
                "cleared xdp program through netlink"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_interface_has_no_index() {
        assert_eq!(
            interface_index("portdrop-none0").expect("lookup"),
            None
        );
    }

    #[test]
    fn loopback_has_an_index() {
        assert!(interface_index("lo").expect("lookup").is_some());
    }

    #[test]
    fn request_carries_setlink_with_detach_fd() {
        let bytes = clear_xdp_request(7, 2);
        let message = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&bytes)
            .expect("request decodes");

        assert_eq!(message.header.flags, NLM_F_REQUEST | NLM_F_ACK);
        let NetlinkPayload::InnerMessage(RouteNetlinkMessage::SetLink(link)) = message.payload
        else {
            panic!("expected RTM_SETLINK");
        };
        assert_eq!(link.header.index, 7);
        assert!(link.attributes.iter().any(|attr| matches!(
            attr,
            LinkAttribute::Xdp(xdp)
                if xdp.contains(&LinkXdp::Fd(-1)) && xdp.contains(&LinkXdp::Flags(2))
        )));
    }

    #[test]
    #[ignore] // Needs CAP_NET_ADMIN
    fn clearing_loopback_without_program_succeeds() {
        let index = interface_index("lo").expect("lookup").expect("lo exists");
        clear_xdp(index, 2).expect("nothing attached is not an error");
    }
}
