// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! # Load Balancer
//!
//! Accepts client connections on a virtual address, proxies each of them to a backend
//! host, and moves established flows between instances on demand.
//!
//! A flow changes hands in four steps:
//!
//! 1. The new owner sees segments of a flow it never accepted and publishes a query.
//! 2. The old owner stops forwarding, freezes both sockets of the flow and publishes their
//!    state.
//! 3. The new owner rebuilds both sockets from that state, resumes forwarding and publishes
//!    the query again as an acknowledgment.
//! 4. The old owner runs its standby command and forgets the flow after a grace period.

mod addr;
mod cutover;
mod pipe;
mod waiters;

//==============================================================================
// Exports
//==============================================================================

pub use self::{
    addr::AddressAllocator,
    cutover::RouteCutover,
    pipe::{
        Direction,
        DuplexPipe,
        PIPE_BUFFER_SIZE,
    },
    waiters::{
        PendingMigrations,
        Waiter,
    },
};

//==============================================================================
// Imports
//==============================================================================

use crate::{
    config::{
        BackendConfig,
        CommandConfig,
        MigrationConfig,
    },
    lbnet::{
        LbMessage,
        MessageBus,
    },
    repair::{
        self,
        RepairState,
    },
    runtime::{
        clock::Clock,
        fail::Fail,
    },
    tcphook::{
        ConnectionState,
        FlowKey,
        TcpHook,
    },
};
use ::crossbeam_channel::{
    select,
    Receiver,
};
use ::socket2::{
    Domain,
    Protocol,
    SockAddr,
    Socket,
    Type,
};
use ::std::{
    net::{
        IpAddr,
        Ipv6Addr,
        Shutdown,
        SocketAddr,
        SocketAddrV6,
    },
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
    thread::{
        self,
        JoinHandle,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// Backlog of the listening socket.
pub const LISTEN_BACKLOG: i32 = 16;

//==============================================================================
// Structures
//==============================================================================

/// Load balancer for one backend service.
pub struct LoadBalancer {
    backend: BackendConfig,
    migration: MigrationConfig,
    hook: Arc<TcpHook>,
    bus: Arc<dyn MessageBus>,
    addresses: AddressAllocator,
    pending: PendingMigrations,
    cutover: RouteCutover,
    next_host: AtomicUsize,
    listener: Mutex<Option<Arc<Socket>>>,
    shutting_down: AtomicBool,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl LoadBalancer {
    /// Creates a load balancer and subscribes it to `bus` and to its own foreign flow detector.
    pub fn new(
        backend: BackendConfig,
        commands: &CommandConfig,
        migration: MigrationConfig,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let hook: Arc<TcpHook> = Arc::new(TcpHook::new(backend.listen, migration.query_retry, clock));
        let lb: Arc<Self> = Arc::new(Self {
            addresses: AddressAllocator::new(backend.address_range),
            cutover: RouteCutover::new(commands),
            backend,
            migration,
            hook,
            bus,
            pending: PendingMigrations::new(),
            next_host: AtomicUsize::new(0),
            listener: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&lb);
        lb.bus.add_handler(Box::new(move |message: &str, remote: IpAddr| {
            if let Some(lb) = weak.upgrade() {
                lb.handle_message(message, remote);
            }
        }));
        let weak = Arc::downgrade(&lb);
        lb.hook.add_handler(Box::new(move |flow: FlowKey| {
            if let Some(lb) = weak.upgrade() {
                lb.on_foreign_flow(flow);
            }
        }));

        lb
    }

    pub fn hook(&self) -> &Arc<TcpHook> {
        &self.hook
    }

    pub fn pending(&self) -> &PendingMigrations {
        &self.pending
    }

    /// Binds the listening socket to the virtual address, if not bound yet, and returns its
    /// local address.
    pub fn bind(&self) -> Result<SocketAddr, Fail> {
        let mut listener: MutexGuard<Option<Arc<Socket>>> = self.listener();
        if let Some(socket) = listener.as_ref() {
            return local_addr(socket);
        }

        let addr: SocketAddrV6 = SocketAddrV6::new(self.backend.vip, self.backend.listen, 0, 0);
        let socket: Socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Fail::from_io("socket", e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| Fail::from_io("SO_REUSEADDR", e))?;
        socket
            .bind(&SockAddr::from(addr))
            .map_err(|e| Fail::from_io(&format!("bind {}", addr), e))?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| Fail::from_io(&format!("listen {}", addr), e))?;

        let local: SocketAddr = local_addr(&socket)?;
        info!("listening on {}", local);
        *listener = Some(Arc::new(socket));
        Ok(local)
    }

    /// Starts watching the configured interface for foreign flows.
    pub fn start_capture(&self) -> Result<JoinHandle<()>, Fail> {
        self.hook.start_capture(&self.backend.interface)
    }

    /// Accepts client connections until [Self::shutdown] is called.
    pub fn start_listen(self: &Arc<Self>) -> Result<(), Fail> {
        self.bind()?;
        let listener: Arc<Socket> = match self.listener().as_ref() {
            Some(socket) => socket.clone(),
            None => return Err(Fail::new(libc::EBADF, "listener is gone")),
        };

        while !self.shutting_down.load(Ordering::Acquire) {
            let (socket, addr): (Socket, SockAddr) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(_) if self.shutting_down.load(Ordering::Acquire) => break,
                Err(e) => {
                    let e: Fail = Fail::from_io("accept", e);
                    if !e.is_transient() {
                        warn!("{}", e);
                    }
                    continue;
                },
            };
            let flow: FlowKey = match addr.as_socket_ipv6() {
                Some(peer) => FlowKey::from(peer),
                None => {
                    warn!("accept: unexpected peer address family");
                    continue;
                },
            };

            let lb: Arc<Self> = self.clone();
            if let Err(e) = thread::Builder::new()
                .name(format!("flow-{}", flow.port))
                .spawn(move || lb.handle_accept(socket, flow))
            {
                warn!("{}: failed to spawn flow thread ({})", flow, e);
            }
        }

        info!("stopped listening on [{}]:{}", self.backend.vip, self.backend.listen);
        Ok(())
    }

    /// Stops accepting new connections. Flows in progress are left alone.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.hook.stop_capture();
        if let Some(listener) = self.listener().as_ref() {
            if let Err(e) = listener.shutdown(Shutdown::Both) {
                debug!("shutdown(): {}", e);
            }
        }
    }

    /// Handles one message from the coordination bus.
    pub fn handle_message(self: &Arc<Self>, text: &str, remote: IpAddr) {
        let message: LbMessage = match LbMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("lbnet: dropping message from {} ({})", remote, e);
                return;
            },
        };
        debug!("lbnet: {} from {}", message, remote);
        match message {
            LbMessage::Query(flow) => self.on_query(flow),
            LbMessage::Handoff {
                flow,
                upstream,
                downstream,
            } => self.adopt(flow, &upstream, &downstream),
        }
    }

    fn on_foreign_flow(&self, flow: FlowKey) {
        info!("search lbnet: {}", flow);
        let query: String = match LbMessage::Query(flow).encode() {
            Ok(query) => query,
            Err(e) => {
                warn!("{}: {}", flow, e);
                return;
            },
        };
        if let Err(e) = self.bus.send(&query) {
            warn!("{}: failed to publish query ({})", flow, e);
        }
    }

    fn on_query(&self, flow: FlowKey) {
        match self.pending.fulfill(&flow) {
            true => debug!("{}: waiter woken", flow),
            false => info!("{}: not found", flow),
        }
    }

    fn handle_accept(self: &Arc<Self>, client: Socket, flow: FlowKey) {
        self.hook.accept_event(flow);
        let (backend, source): (Socket, Ipv6Addr) = match self.connect_backend() {
            Ok(connected) => connected,
            Err(e) => {
                warn!("{}: dropping connection ({})", flow, e);
                self.hook.close_event(flow, self.migration.grace_period);
                return;
            },
        };
        info!("{}: accepted, using [{}] to downstream", flow, source);

        let waiter: Waiter = self.pending.arm(flow);
        self.serve(flow, client, backend, Some(source), waiter);
    }

    /// Leases a source address and connects to the next backend host from it.
    fn connect_backend(&self) -> Result<(Socket, Ipv6Addr), Fail> {
        let source: Ipv6Addr = self.addresses.allocate()?;
        match self.dial(source) {
            Ok(socket) => Ok((socket, source)),
            Err(e) => {
                self.addresses.release(source);
                Err(e)
            },
        }
    }

    fn dial(&self, source: Ipv6Addr) -> Result<Socket, Fail> {
        let host: Ipv6Addr = self.next_host()?;
        let socket: Socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Fail::from_io("socket", e))?;
        repair::set_freebind(&socket)?;

        let local: SocketAddrV6 = SocketAddrV6::new(source, 0, 0, 0);
        socket
            .bind(&SockAddr::from(local))
            .map_err(|e| Fail::from_io(&format!("bind {}", local), e))?;
        let remote: SocketAddrV6 = SocketAddrV6::new(host, self.backend.port, 0, 0);
        socket
            .connect(&SockAddr::from(remote))
            .map_err(|e| Fail::from_io(&format!("connect {}", remote), e))?;
        Ok(socket)
    }

    /// Picks backend hosts round-robin.
    fn next_host(&self) -> Result<Ipv6Addr, Fail> {
        let hosts: &[Ipv6Addr] = &self.backend.hosts;
        if hosts.is_empty() {
            return Err(Fail::new(libc::EDESTADDRREQ, "no backend hosts configured"));
        }
        Ok(hosts[self.next_host.fetch_add(1, Ordering::Relaxed) % hosts.len()])
    }

    /// Forwards bytes of `flow` until either side closes or a peer asks for the flow.
    fn serve(&self, flow: FlowKey, client: Socket, backend: Socket, leased: Option<Ipv6Addr>, waiter: Waiter) {
        let pipe: DuplexPipe = match DuplexPipe::start(&client, &backend) {
            Ok(pipe) => pipe,
            Err(e) => {
                error!("{}: failed to start pipe ({})", flow, e);
                self.pending.disarm(&waiter);
                self.close(flow, leased);
                return;
            },
        };
        let exit: Receiver<Direction> = pipe.exit().clone();

        let requested: bool = select! {
            recv(exit) -> _ => false,
            recv(waiter.signal()) -> signal => match signal {
                Ok(()) => true,
                // Waiter was replaced, keep forwarding until the flow closes.
                Err(_) => {
                    let _ = exit.recv();
                    false
                },
            },
        };
        pipe.stop();

        match requested {
            true => {
                info!("{}: handoff requested", flow);
                self.hand_off(flow, client, backend, leased);
            },
            false => {
                self.pending.disarm(&waiter);
                info!("{}: closed", flow);
                drop(client);
                drop(backend);
                self.close(flow, leased);
            },
        }
    }

    /// Freezes both sockets of `flow` and publishes their state. Forwarding must be stopped.
    fn hand_off(&self, flow: FlowKey, client: Socket, backend: Socket, leased: Option<Ipv6Addr>) {
        lb_profile!("lb::hand_off");
        let (upstream, downstream): (RepairState, RepairState) = match freeze(&client, &backend) {
            Ok(states) => states,
            Err(e) => {
                error!("{}: freeze failed, dropping flow ({})", flow, e);
                self.close(flow, leased);
                return;
            },
        };
        let standby_addr: Ipv6Addr = downstream.saddr;
        let message: LbMessage = LbMessage::Handoff {
            flow,
            upstream,
            downstream,
        };
        let text: String = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("{}: {}", flow, e);
                self.close(flow, leased);
                return;
            },
        };

        // The acknowledgment may arrive before send() returns.
        let ack: Waiter = self.pending.arm(flow);
        if let Err(e) = self.bus.send(&text) {
            error!("{}: failed to publish state ({})", flow, e);
            self.pending.disarm(&ack);
            self.close(flow, leased);
            return;
        }
        info!("{}", message);

        // Both sockets are in repair mode, so closing them sends nothing.
        drop(client);
        drop(backend);
        // `leased` is not released: the address is routed to the new owner from now on.

        let acked: bool = match self.migration.handoff_timeout {
            Some(timeout) => ack.signal().recv_timeout(timeout).is_ok(),
            None => ack.signal().recv().is_ok(),
        };
        match acked {
            true => {
                info!("{}: handoff acknowledged", flow);
                self.cutover.standby(standby_addr);
            },
            false => {
                warn!("{}: handoff not acknowledged", flow);
                self.pending.disarm(&ack);
            },
        }
        self.hook.close_event(flow, self.migration.grace_period);
    }

    /// Rebuilds both sockets of a flow handed off by a peer and starts serving it.
    fn adopt(self: &Arc<Self>, flow: FlowKey, upstream: &RepairState, downstream: &RepairState) {
        if downstream.dport != self.backend.port || !self.backend.hosts.contains(&downstream.daddr) {
            debug!("{}: handoff for [{}]:{} is not ours", flow, downstream.daddr, downstream.dport);
            return;
        }
        if self.hook.registry().state(&flow) == Some(ConnectionState::Established) {
            error!("{}: duplicate handoff for an established flow", flow);
            return;
        }

        let (client, backend): (Socket, Socket) = match self.restore(flow, upstream, downstream) {
            Ok(sockets) => sockets,
            Err(e) => {
                error!("{}: restore failed ({})", flow, e);
                return;
            },
        };
        let leased: Option<Ipv6Addr> = match self.addresses.claim(downstream.saddr) {
            true => Some(downstream.saddr),
            false => None,
        };
        self.hook.accept_event(flow);
        self.cutover.activate(downstream.saddr);
        info!("{}: restored", flow);

        let waiter: Waiter = self.pending.arm(flow);
        match LbMessage::Query(flow).encode() {
            Ok(ack) => {
                if let Err(e) = self.bus.send(&ack) {
                    warn!("{}: failed to acknowledge handoff ({})", flow, e);
                }
            },
            Err(e) => warn!("{}: {}", flow, e),
        }

        let lb: Arc<Self> = self.clone();
        if let Err(e) = thread::Builder::new()
            .name(format!("flow-{}", flow.port))
            .spawn(move || lb.serve(flow, client, backend, leased, waiter))
        {
            error!("{}: failed to spawn flow thread ({})", flow, e);
        }
    }

    fn restore(&self, flow: FlowKey, upstream: &RepairState, downstream: &RepairState) -> Result<(Socket, Socket), Fail> {
        lb_profile!("lb::restore");
        let client: Socket = repair::repair(
            self.backend.vip,
            self.backend.listen,
            flow.ip,
            flow.port,
            upstream,
            false,
        )?;
        let backend: Socket = repair::repair(
            downstream.saddr,
            downstream.sport,
            downstream.daddr,
            downstream.dport,
            downstream,
            true,
        )?;
        Ok((client, backend))
    }

    fn close(&self, flow: FlowKey, leased: Option<Ipv6Addr>) {
        if let Some(addr) = leased {
            self.addresses.release(addr);
        }
        self.hook.close_event(flow, self.migration.grace_period);
    }

    fn listener(&self) -> MutexGuard<Option<Arc<Socket>>> {
        match self.listener.lock() {
            Ok(listener) => listener,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// Captures both legs of a flow. The backend-facing state carries its 4-tuple.
fn freeze(client: &Socket, backend: &Socket) -> Result<(RepairState, RepairState), Fail> {
    let local: SocketAddrV6 = socket_addr_v6(backend.local_addr(), "getsockname")?;
    let remote: SocketAddrV6 = socket_addr_v6(backend.peer_addr(), "getpeername")?;

    let upstream: RepairState = repair::destroy(client)?;
    let mut downstream: RepairState = repair::destroy(backend)?;
    downstream.saddr = *local.ip();
    downstream.sport = local.port();
    downstream.daddr = *remote.ip();
    downstream.dport = remote.port();
    Ok((upstream, downstream))
}

fn socket_addr_v6(addr: std::io::Result<SockAddr>, op: &str) -> Result<SocketAddrV6, Fail> {
    match addr.map_err(|e| Fail::from_io(op, e))?.as_socket_ipv6() {
        Some(addr) => Ok(addr),
        None => Err(Fail::new(libc::EAFNOSUPPORT, &format!("{}: not an IPv6 address", op))),
    }
}

fn local_addr(socket: &Socket) -> Result<SocketAddr, Fail> {
    match socket.local_addr().map_err(|e| Fail::from_io("getsockname", e))?.as_socket() {
        Some(addr) => Ok(addr),
        None => Err(Fail::new(libc::EAFNOSUPPORT, "getsockname: not an inet address")),
    }
}
