// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::socket2::Socket;
use ::std::{
    io,
    mem,
    os::unix::io::{
        AsRawFd,
        FromRawFd,
    },
    time::Duration,
};

//==============================================================================
// Constants
//==============================================================================

/// Largest frame we care about.
const CAPTURE_SNAPLEN: usize = 0xffff;

/// Upper bound on how long a read blocks, so the capture loop can notice shutdown.
pub const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(200);

// From <linux/if_packet.h>.
const PACKET_ADD_MEMBERSHIP: libc::c_int = 1;
const PACKET_MR_PROMISC: libc::c_ushort = 1;
const PACKET_OUTGOING: libc::c_uchar = 4;

//==============================================================================
// Traits
//==============================================================================

/// Source of link-layer frames for the capture loop.
pub trait FrameSource: Send {
    /// Returns the next frame, or `None` if nothing arrived within [CAPTURE_POLL_INTERVAL].
    fn next_frame(&mut self) -> Result<Option<&[u8]>, Fail>;
}

//==============================================================================
// Structures
//==============================================================================

#[repr(C)]
struct PacketMreq {
    mr_ifindex: libc::c_int,
    mr_type: libc::c_ushort,
    mr_alen: libc::c_ushort,
    mr_address: [libc::c_uchar; 8],
}

/// Promiscuous link-layer capture on a single interface.
pub struct PacketCapture {
    socket: Socket,
    interface: String,
    buffer: Vec<u8>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl PacketCapture {
    /// Opens `interface` in promiscuous mode.
    pub fn open(interface: &str) -> Result<Self, Fail> {
        let ifindex: libc::c_uint = nix::net::if_::if_nametoindex(interface)?;
        let protocol: libc::c_int = (libc::ETH_P_ALL as u16).to_be() as libc::c_int;

        let fd: libc::c_int = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol) };
        if fd < 0 {
            return Err(Fail::last_os_error("socket(AF_PACKET)"));
        }
        // Safe: `fd` was just created and nothing else owns it.
        let socket: Socket = unsafe { Socket::from_raw_fd(fd) };

        let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as libc::c_ushort;
        sll.sll_protocol = protocol as libc::c_ushort;
        sll.sll_ifindex = ifindex as libc::c_int;
        let ret: libc::c_int = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(Fail::last_os_error(&format!("bind(AF_PACKET, {})", interface)));
        }

        let mreq: PacketMreq = PacketMreq {
            mr_ifindex: ifindex as libc::c_int,
            mr_type: PACKET_MR_PROMISC,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        let ret: libc::c_int = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_PACKET,
                PACKET_ADD_MEMBERSHIP,
                &mreq as *const PacketMreq as *const libc::c_void,
                mem::size_of::<PacketMreq>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(Fail::last_os_error("setsockopt(PACKET_ADD_MEMBERSHIP)"));
        }

        socket
            .set_read_timeout(Some(CAPTURE_POLL_INTERVAL))
            .map_err(|e| Fail::from_io("set_read_timeout", e))?;

        info!("capturing on {} (ifindex={})", interface, ifindex);
        Ok(Self {
            socket,
            interface: interface.to_string(),
            buffer: vec![0; CAPTURE_SNAPLEN],
        })
    }

    /// Reads the next inbound frame. Returns `None` when the read timed out or the
    /// frame was sent by this host.
    fn read_frame(&mut self) -> Result<Option<&[u8]>, Fail> {
        let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        let mut sll_len: libc::socklen_t = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        let nbytes: libc::ssize_t = unsafe {
            libc::recvfrom(
                self.socket.as_raw_fd(),
                self.buffer.as_mut_ptr() as *mut libc::c_void,
                self.buffer.len(),
                0,
                &mut sll as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                &mut sll_len as *mut libc::socklen_t,
            )
        };
        if nbytes < 0 {
            let e: io::Error = io::Error::last_os_error();
            return match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(Fail::from_io(&format!("recvfrom({})", self.interface), e)),
            };
        }
        if sll.sll_pkttype == PACKET_OUTGOING {
            return Ok(None);
        }
        Ok(Some(&self.buffer[..nbytes as usize]))
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl FrameSource for PacketCapture {
    fn next_frame(&mut self) -> Result<Option<&[u8]>, Fail> {
        self.read_frame()
    }
}
