// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! # TCP Connection Repair
//!
//! Freezes a live TCP socket into a [RepairState] and rebuilds an equivalent socket
//! from one, using the kernel's `TCP_REPAIR` facility.
//!
//! The order of the socket options below is dictated by the kernel: repair mode
//! comes first, a queue is selected before its sequence number is read or written,
//! the send queue is handled before the receive queue, and leaving repair mode is
//! the very last step.
//!
//! # References
//!
//! - https://lwn.net/Articles/495304/

mod state;

//==============================================================================
// Exports
//==============================================================================

pub use self::state::{
    RepairState,
    TcpRepairWindow,
};

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::socket2::{
    Domain,
    Protocol,
    SockAddr,
    Socket,
    Type,
};
use ::std::{
    mem,
    net::{
        Ipv6Addr,
        SocketAddrV6,
    },
    os::unix::io::AsRawFd,
};

//==============================================================================
// Constants
//==============================================================================

/// `IPPROTO_TCP` level option that toggles repair mode.
pub const TCP_REPAIR: libc::c_int = 19;
/// Selects the queue that `TCP_QUEUE_SEQ` refers to.
pub const TCP_REPAIR_QUEUE: libc::c_int = 20;
/// Sequence number of the selected queue.
pub const TCP_QUEUE_SEQ: libc::c_int = 21;
/// Send/receive window state, see [TcpRepairWindow].
pub const TCP_REPAIR_WINDOW: libc::c_int = 29;

/// Largest MSS the kernel accepts through `TCP_MAXSEG` (`MAX_TCP_WINDOW`).
pub const MAX_REPAIR_MSS: u32 = 32767;

const TCP_REPAIR_ON: libc::c_int = 1;
const TCP_REPAIR_OFF: libc::c_int = 0;

//==============================================================================
// Structures
//==============================================================================

/// Queues addressable through `TCP_REPAIR_QUEUE`.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairQueue {
    Recv = 1,
    Send = 2,
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// Puts `socket` into repair mode and captures its state.
///
/// On success the socket is left in repair mode, so closing it afterwards neither
/// sends a FIN nor a RST. If any read fails the socket is taken out of repair mode
/// again before the error is returned.
pub fn destroy(socket: &Socket) -> Result<RepairState, Fail> {
    set_repair(socket, TCP_REPAIR_ON)?;
    match freeze(socket) {
        Ok(state) => Ok(state),
        Err(e) => {
            if let Err(rollback) = set_repair(socket, TCP_REPAIR_OFF) {
                warn!("destroy(): socket left in repair mode ({})", rollback);
            }
            Err(e)
        },
    }
}

/// Creates a socket bound to `[saddr]:sport`, connected to `[daddr]:dport` and
/// carrying the sequence numbers, MSS and window of `state`, without a handshake.
///
/// `allow_foreign_bind` sets `IP_FREEBIND`, which lets the socket bind an address
/// that is not (yet) configured on any local interface.
pub fn repair(
    saddr: Ipv6Addr,
    sport: u16,
    daddr: Ipv6Addr,
    dport: u16,
    state: &RepairState,
    allow_foreign_bind: bool,
) -> Result<Socket, Fail> {
    let socket: Socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Fail::from_io("socket", e))?;

    set_repair(&socket, TCP_REPAIR_ON)?;

    select_queue(&socket, RepairQueue::Send)?;
    set_int(&socket, TCP_QUEUE_SEQ, state.snd_seq as libc::c_int, "TCP_QUEUE_SEQ(send)")?;
    select_queue(&socket, RepairQueue::Recv)?;
    set_int(&socket, TCP_QUEUE_SEQ, state.rcv_seq as libc::c_int, "TCP_QUEUE_SEQ(recv)")?;

    set_int(&socket, libc::TCP_MAXSEG, repair_mss(state.mss), "TCP_MAXSEG")?;
    set_repair_window(&socket, &state.window)?;

    if allow_foreign_bind {
        set_freebind(&socket)?;
    }

    let local: SocketAddrV6 = SocketAddrV6::new(saddr, sport, 0, 0);
    socket
        .bind(&SockAddr::from(local))
        .map_err(|e| Fail::from_io(&format!("bind {}", local), e))?;

    // Still in repair mode: the kernel moves straight to ESTABLISHED.
    let remote: SocketAddrV6 = SocketAddrV6::new(daddr, dport, 0, 0);
    socket
        .connect(&SockAddr::from(remote))
        .map_err(|e| Fail::from_io(&format!("connect {}", remote), e))?;

    set_repair(&socket, TCP_REPAIR_OFF)?;

    debug!(
        "repair(): {} -> {} restored (snd_seq={}, rcv_seq={}, mss={})",
        local, remote, state.snd_seq, state.rcv_seq, state.mss
    );
    Ok(socket)
}

/// Sets `IP_FREEBIND` on `socket`.
pub fn set_freebind(socket: &Socket) -> Result<(), Fail> {
    set_option(socket, libc::SOL_IP, libc::IP_FREEBIND, &1 as *const libc::c_int, "IP_FREEBIND")
}

/// Reads the repair state of a socket that is already in repair mode.
fn freeze(socket: &Socket) -> Result<RepairState, Fail> {
    let window: TcpRepairWindow = get_repair_window(socket)?;
    let mss: libc::c_int = get_int(socket, libc::TCP_MAXSEG, "TCP_MAXSEG")?;

    select_queue(socket, RepairQueue::Send)?;
    let snd_seq: libc::c_int = get_int(socket, TCP_QUEUE_SEQ, "TCP_QUEUE_SEQ(send)")?;
    select_queue(socket, RepairQueue::Recv)?;
    let rcv_seq: libc::c_int = get_int(socket, TCP_QUEUE_SEQ, "TCP_QUEUE_SEQ(recv)")?;

    trace!("freeze(): snd_seq={}, rcv_seq={}, mss={}, window={:?}", snd_seq, rcv_seq, mss, window);
    Ok(RepairState {
        window,
        mss: mss as u32,
        rcv_seq: rcv_seq as u32,
        snd_seq: snd_seq as u32,
        ..Default::default()
    })
}

/// Loopback and other 64K-MTU links report an MSS above what `TCP_MAXSEG` takes back.
fn repair_mss(mss: u32) -> libc::c_int {
    mss.min(MAX_REPAIR_MSS) as libc::c_int
}

fn set_repair(socket: &Socket, mode: libc::c_int) -> Result<(), Fail> {
    set_int(socket, TCP_REPAIR, mode, "TCP_REPAIR")
}

fn select_queue(socket: &Socket, queue: RepairQueue) -> Result<(), Fail> {
    set_int(socket, TCP_REPAIR_QUEUE, queue as libc::c_int, "TCP_REPAIR_QUEUE")
}

fn set_int(socket: &Socket, name: libc::c_int, value: libc::c_int, what: &str) -> Result<(), Fail> {
    set_option(socket, libc::IPPROTO_TCP, name, &value as *const libc::c_int, what)
}

fn set_repair_window(socket: &Socket, window: &TcpRepairWindow) -> Result<(), Fail> {
    set_option(
        socket,
        libc::IPPROTO_TCP,
        TCP_REPAIR_WINDOW,
        window as *const TcpRepairWindow,
        "TCP_REPAIR_WINDOW",
    )
}

fn get_int(socket: &Socket, name: libc::c_int, what: &str) -> Result<libc::c_int, Fail> {
    let mut value: libc::c_int = 0;
    get_option(socket, libc::IPPROTO_TCP, name, &mut value as *mut libc::c_int, what)?;
    Ok(value)
}

fn get_repair_window(socket: &Socket) -> Result<TcpRepairWindow, Fail> {
    let mut window: TcpRepairWindow = TcpRepairWindow::default();
    get_option(
        socket,
        libc::IPPROTO_TCP,
        TCP_REPAIR_WINDOW,
        &mut window as *mut TcpRepairWindow,
        "TCP_REPAIR_WINDOW",
    )?;
    Ok(window)
}

fn set_option<T>(
    socket: &Socket,
    level: libc::c_int,
    name: libc::c_int,
    value: *const T,
    what: &str,
) -> Result<(), Fail> {
    // Safe: `value` points to a live `T` for the duration of the call and the length matches.
    let ret: libc::c_int = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            value as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    match ret {
        0 => Ok(()),
        _ => Err(Fail::last_os_error(&format!("setsockopt({})", what))),
    }
}

fn get_option<T>(
    socket: &Socket,
    level: libc::c_int,
    name: libc::c_int,
    value: *mut T,
    what: &str,
) -> Result<(), Fail> {
    let mut len: libc::socklen_t = mem::size_of::<T>() as libc::socklen_t;
    // Safe: `value` points to a writable `T` and `len` holds its size.
    let ret: libc::c_int = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            level,
            name,
            value as *mut libc::c_void,
            &mut len as *mut libc::socklen_t,
        )
    };
    match ret {
        0 => Ok(()),
        _ => Err(Fail::last_os_error(&format!("getsockopt({})", what))),
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
