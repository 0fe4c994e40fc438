// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! # Coordination Bus
//!
//! Load balancer instances talk to each other over a UDP multicast group. Delivery is
//! best effort: datagrams may be lost, duplicated or reordered, and every instance that
//! joined the group sees every message. An instance ignores datagrams whose source
//! address equals its own configured source address.

mod memory;
mod message;

//==============================================================================
// Exports
//==============================================================================

pub use self::{
    memory::{
        MemoryBus,
        MemoryHub,
    },
    message::LbMessage,
};

//==============================================================================
// Imports
//==============================================================================

use crate::{
    config::LbNetworkConfig,
    runtime::fail::Fail,
};
use ::socket2::{
    Domain,
    Protocol,
    SockAddr,
    Socket,
    Type,
};
use ::std::{
    io,
    net::{
        IpAddr,
        Ipv4Addr,
        Ipv6Addr,
        SocketAddr,
        UdpSocket,
    },
    str,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        RwLock,
    },
    thread,
    time::Duration,
};

//==============================================================================
// Constants
//==============================================================================

/// Largest datagram accepted from the bus.
const RECV_BUFFER_SIZE: usize = 9000;

/// Upper bound on how long the receive loop blocks before checking for shutdown.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(200);

//==============================================================================
// Traits
//==============================================================================

/// Callback invoked with the text of a message and the address of its sender.
///
/// Handlers run on the receive thread and must not block.
pub type MessageHandler = Box<dyn Fn(&str, IpAddr) + Send + Sync>;

/// Publish/subscribe channel between load balancer instances.
pub trait MessageBus: Send + Sync {
    /// Publishes `message` to every other instance.
    fn send(&self, message: &str) -> Result<(), Fail>;

    /// Registers a handler for messages from other instances.
    fn add_handler(&self, handler: MessageHandler);
}

//==============================================================================
// Structures
//==============================================================================

/// Handlers shared between a bus and its receive loop.
#[derive(Default)]
pub(crate) struct HandlerList {
    handlers: RwLock<Vec<MessageHandler>>,
}

/// UDP multicast implementation of [MessageBus].
pub struct LbNetwork {
    sender: UdpSocket,
    handlers: Arc<HandlerList>,
    running: Arc<AtomicBool>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl HandlerList {
    pub(crate) fn push(&self, handler: MessageHandler) {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(poisoned) => poisoned.into_inner().push(handler),
        }
    }

    pub(crate) fn dispatch(&self, message: &str, remote: IpAddr) {
        let handlers = match self.handlers.read() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        for handler in handlers.iter() {
            handler(message, remote);
        }
    }
}

impl LbNetwork {
    /// Joins the multicast group and starts the receive loop.
    pub fn new(config: &LbNetworkConfig) -> Result<Self, Fail> {
        let ifindex: u32 = match &config.interface {
            Some(name) => nix::net::if_::if_nametoindex(name.as_str())?,
            None => 0,
        };
        let receiver: UdpSocket = join_group(config.network, ifindex)?;
        let sender: UdpSocket = connect_group(config.source, config.network, ifindex)?;

        let handlers: Arc<HandlerList> = Arc::new(HandlerList::default());
        let running: Arc<AtomicBool> = Arc::new(AtomicBool::new(true));
        {
            let handlers: Arc<HandlerList> = handlers.clone();
            let running: Arc<AtomicBool> = running.clone();
            let source: IpAddr = config.source.ip();
            thread::Builder::new()
                .name("lbnet-recv".to_string())
                .spawn(move || receive_loop(receiver, source, handlers, running))
                .map_err(|e| Fail::from_io("spawn lbnet receive thread", e))?;
        }

        info!("lbnet: joined {} as {}", config.network, config.source);
        Ok(Self {
            sender,
            handlers,
            running,
        })
    }

    /// Stops the receive loop.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl MessageBus for LbNetwork {
    fn send(&self, message: &str) -> Result<(), Fail> {
        trace!("lbnet: send {:?}", message);
        self.sender
            .send(message.as_bytes())
            .map_err(|e| Fail::from_io("lbnet send", e))?;
        Ok(())
    }

    fn add_handler(&self, handler: MessageHandler) {
        self.handlers.push(handler);
    }
}

impl Drop for LbNetwork {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

fn join_group(group: SocketAddr, ifindex: u32) -> Result<UdpSocket, Fail> {
    let socket: Socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Fail::from_io("lbnet socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Fail::from_io("SO_REUSEADDR", e))?;

    let any: SocketAddr = match group.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port()),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), group.port()),
    };
    socket
        .bind(&SockAddr::from(any))
        .map_err(|e| Fail::from_io(&format!("bind {}", any), e))?;

    let joined: io::Result<()> = match group.ip() {
        IpAddr::V4(addr) => socket.join_multicast_v4(&addr, &Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(addr) => socket.join_multicast_v6(&addr, ifindex),
    };
    joined.map_err(|e| Fail::from_io(&format!("join {}", group.ip()), e))?;

    socket
        .set_read_timeout(Some(RECV_POLL_INTERVAL))
        .map_err(|e| Fail::from_io("set_read_timeout", e))?;
    Ok(socket.into())
}

fn connect_group(source: SocketAddr, group: SocketAddr, ifindex: u32) -> Result<UdpSocket, Fail> {
    let socket: Socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Fail::from_io("lbnet socket", e))?;
    if group.is_ipv6() && ifindex != 0 {
        socket
            .set_multicast_if_v6(ifindex)
            .map_err(|e| Fail::from_io("IPV6_MULTICAST_IF", e))?;
    }
    socket
        .bind(&SockAddr::from(source))
        .map_err(|e| Fail::from_io(&format!("bind {}", source), e))?;
    socket
        .connect(&SockAddr::from(group))
        .map_err(|e| Fail::from_io(&format!("connect {}", group), e))?;
    Ok(socket.into())
}

fn receive_loop(receiver: UdpSocket, source: IpAddr, handlers: Arc<HandlerList>, running: Arc<AtomicBool>) {
    let mut buffer: Vec<u8> = vec![0; RECV_BUFFER_SIZE];
    while running.load(Ordering::Acquire) {
        let (nbytes, remote): (usize, SocketAddr) = match receiver.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
            Err(e) => {
                warn!("lbnet: receive failed ({})", e);
                continue;
            },
        };
        if remote.ip() == source {
            continue;
        }
        match str::from_utf8(&buffer[..nbytes]) {
            Ok(message) => {
                debug!("lbnet: received {:?} from {}", message, remote);
                handlers.dispatch(message, remote.ip());
            },
            Err(_) => warn!("lbnet: dropping non-text datagram from {}", remote),
        }
    }
    debug!("lbnet: receive loop stopped");
}
