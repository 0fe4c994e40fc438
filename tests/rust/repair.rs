// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! These tests need `CAP_NET_ADMIN` and an IPv6 loopback. They pass vacuously without them.

//==============================================================================
// Imports
//==============================================================================

use ::crossbeam_channel::{
    unbounded,
    Receiver,
    Sender,
};
use ::etherparse::PacketBuilder;
use ::socket2::{
    Domain,
    Socket,
    Type,
};
use ::std::{
    fs,
    io::{
        self,
        Read,
        Write,
    },
    mem,
    net::{
        IpAddr,
        Ipv6Addr,
        SocketAddr,
        TcpListener,
        TcpStream,
    },
    os::unix::io::AsRawFd,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{
        Duration,
        Instant,
    },
};
use ::tcpmig_lb::{
    config::{
        BackendConfig,
        CommandConfig,
        MigrationConfig,
    },
    lbnet::{
        MemoryBus,
        MemoryHub,
    },
    repair::{
        self,
        RepairState,
    },
    runtime::{
        clock::SystemClock,
        logging,
    },
    tcphook::ConnectionState,
    FlowKey,
    LbMessage,
    LoadBalancer,
    MessageBus,
};

//==============================================================================
// Constants
//==============================================================================

const TIMEOUT: Duration = Duration::from_secs(2);

//==============================================================================
// Helpers
//==============================================================================

/// Whether this process may put sockets into repair mode.
fn privileged() -> bool {
    let socket: Socket = match Socket::new(Domain::IPV6, Type::STREAM, None) {
        Ok(socket) => socket,
        Err(_) => return false,
    };
    let on: libc::c_int = 1;
    let ret: libc::c_int = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            repair::TCP_REPAIR,
            &on as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    ret == 0
}

fn loopback_listener() -> Option<TcpListener> {
    match TcpListener::bind("[::1]:0") {
        Ok(listener) => Some(listener),
        Err(e) => {
            eprintln!("skipping: no IPv6 loopback ({})", e);
            None
        },
    }
}

/// Returns the client end, the accepted end, and the client's address.
fn connected_pair(listener: &TcpListener) -> (TcpStream, Socket, SocketAddr) {
    let client: TcpStream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    let (server, peer) = listener.accept().unwrap();
    (client, Socket::from(server), peer)
}

fn echo_server(listener: TcpListener) {
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream: TcpStream = match stream {
                Ok(stream) => stream,
                Err(_) => continue,
            };
            thread::spawn(move || {
                let mut reader: TcpStream = stream.try_clone().unwrap();
                let _ = io::copy(&mut reader, &mut stream);
            });
        }
    });
}

fn echo(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).unwrap();
    let mut buf: Vec<u8> = vec![0; payload.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf, payload);
}

fn backend_config(backend_port: u16, listen: u16) -> BackendConfig {
    BackendConfig {
        hosts: vec![Ipv6Addr::LOCALHOST],
        port: backend_port,
        listen,
        vip: Ipv6Addr::LOCALHOST,
        interface: "lo".to_string(),
        address_range: "::/127".parse().unwrap(),
    }
}

fn migration_config() -> MigrationConfig {
    MigrationConfig {
        grace_period: Duration::from_millis(50),
        handoff_timeout: Some(TIMEOUT),
        query_retry: Duration::from_secs(3),
    }
}

/// Returns a fresh marker path and a standby command that writes the address into it.
fn standby_marker(name: &str) -> (PathBuf, CommandConfig) {
    let path: PathBuf = std::env::temp_dir().join(format!("tcpmig-lb-{}-{}", name, std::process::id()));
    let _ = fs::remove_file(&path);
    let commands: CommandConfig = CommandConfig {
        active: None,
        standby: Some(format!("echo %s > {}", path.display())),
    };
    (path, commands)
}

fn marker_contents(path: &PathBuf) -> String {
    fs::read_to_string(path).unwrap_or_default().trim().to_string()
}

/// Forwards every message seen by `bus` into a channel.
fn tap(bus: &Arc<MemoryBus>) -> Receiver<String> {
    let (tx, rx): (Sender<String>, Receiver<String>) = unbounded();
    bus.add_handler(Box::new(move |message: &str, _: IpAddr| {
        let _ = tx.send(message.to_string());
    }));
    rx
}

fn flow_of(stream: &TcpStream) -> FlowKey {
    match stream.local_addr().unwrap() {
        SocketAddr::V6(local) => FlowKey::from(local),
        SocketAddr::V4(_) => unreachable!(),
    }
}

fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline: Instant = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

//==============================================================================
// Tests
//==============================================================================

/// Tests that a rebuilt socket carries on the byte stream of the frozen one.
#[test]
fn freeze_and_rebuild_socket() {
    logging::initialize();
    if !privileged() {
        eprintln!("skipping: TCP_REPAIR needs CAP_NET_ADMIN");
        return;
    }
    let listener: TcpListener = match loopback_listener() {
        Some(listener) => listener,
        None => return,
    };
    let (mut client, server, peer) = connected_pair(&listener);

    client.write_all(b"ping").unwrap();
    let mut buf: [u8; 4] = [0; 4];
    (&server).read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");

    let state: RepairState = repair::destroy(&server).unwrap();
    assert!(state.mss > 0);
    assert!(state.window.snd_wnd > 0);
    drop(server);

    let local: SocketAddr = listener.local_addr().unwrap();
    let peer: SocketAddr = peer;
    // Loopback reports an MSS above what TCP_MAXSEG accepts back; the rebuild must still work.
    let restored: Socket = repair::repair(
        Ipv6Addr::LOCALHOST,
        local.port(),
        Ipv6Addr::LOCALHOST,
        peer.port(),
        &state,
        false,
    )
    .unwrap_or_else(|e| panic!("rebuild with mss={} failed: {}", state.mss, e));
    restored.set_read_timeout(Some(TIMEOUT)).unwrap();

    client.write_all(b"after handoff").unwrap();
    let mut buf: [u8; 13] = [0; 13];
    (&restored).read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"after handoff");

    (&restored).write_all(b"pong").unwrap();
    let mut buf: [u8; 4] = [0; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"pong");
}

/// Tests that freezing fails cleanly without the privilege and leaves the socket usable.
#[test]
fn destroy_without_privilege() {
    logging::initialize();
    if privileged() {
        return;
    }
    let listener: TcpListener = match loopback_listener() {
        Some(listener) => listener,
        None => return,
    };
    let (mut client, server, _) = connected_pair(&listener);

    let e = repair::destroy(&server).unwrap_err();
    assert_eq!(e.errno, libc::EPERM);

    client.write_all(b"ping").unwrap();
    let mut buf: [u8; 4] = [0; 4];
    (&server).read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
}

/// Tests a full handoff of a proxied flow between two load balancers.
#[test]
fn hand_off_flow_between_instances() {
    logging::initialize();
    if !privileged() {
        eprintln!("skipping: TCP_REPAIR needs CAP_NET_ADMIN");
        return;
    }
    let backend: TcpListener = match loopback_listener() {
        Some(listener) => listener,
        None => return,
    };
    let backend_port: u16 = backend.local_addr().unwrap().port();
    echo_server(backend);

    let (marker, commands) = standby_marker("standby");
    let hub: Arc<MemoryHub> = MemoryHub::new();

    let old: Arc<LoadBalancer> = LoadBalancer::new(
        backend_config(backend_port, 0),
        &commands,
        migration_config(),
        hub.endpoint("fc00::a".parse().unwrap()).unwrap(),
        Arc::new(SystemClock),
    );
    let addr: SocketAddr = old.bind().unwrap();
    {
        let old: Arc<LoadBalancer> = old.clone();
        thread::spawn(move || old.start_listen().unwrap());
    }
    // Same virtual address and port, but never listens.
    let new: Arc<LoadBalancer> = LoadBalancer::new(
        backend_config(backend_port, addr.port()),
        &CommandConfig::default(),
        migration_config(),
        hub.endpoint("fc00::b".parse().unwrap()).unwrap(),
        Arc::new(SystemClock),
    );

    let mut client: TcpStream = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    echo(&mut client, b"before handoff");
    let flow: FlowKey = flow_of(&client);
    assert!(old.pending().is_armed(&flow));

    // The new instance sees a segment of the flow on the wire.
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv6(flow.ip.octets(), Ipv6Addr::LOCALHOST.octets(), 64)
        .tcp(flow.port, addr.port(), 1, 65535)
        .ack(1);
    let mut frame: Vec<u8> = Vec::with_capacity(builder.size(0));
    builder.write(&mut frame, &[]).unwrap();
    assert_eq!(new.hook().inspect(&frame), Some(flow));

    assert!(wait_until(|| new.hook().registry().state(&flow) == Some(ConnectionState::Established)));
    assert!(wait_until(|| new.pending().is_armed(&flow)));

    // The old instance saw the acknowledgment, stepped down and let go of the flow.
    assert!(wait_until(|| marker_contents(&marker) == "::1"));
    assert!(wait_until(|| !old.hook().registry().contains(&flow)));
    assert!(!old.pending().is_armed(&flow));

    // The old instance holds no socket of the flow anymore, so this goes through the new one.
    echo(&mut client, b"after handoff");
    assert_eq!(new.hook().registry().state(&flow), Some(ConnectionState::Established));

    // The only source address of the range went with the flow, so the old instance has
    // none left for another client.
    let mut late: TcpStream = TcpStream::connect(addr).unwrap();
    late.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut buf: [u8; 1] = [0; 1];
    assert!(matches!(late.read(&mut buf), Ok(0) | Err(_)));

    old.shutdown();
    let _ = fs::remove_file(&marker);
}

/// Tests that a handoff nobody acknowledges is abandoned after the timeout.
#[test]
fn abandon_unacknowledged_handoff() {
    logging::initialize();
    if !privileged() {
        eprintln!("skipping: TCP_REPAIR needs CAP_NET_ADMIN");
        return;
    }
    let backend: TcpListener = match loopback_listener() {
        Some(listener) => listener,
        None => return,
    };
    let backend_port: u16 = backend.local_addr().unwrap().port();
    echo_server(backend);

    let (marker, commands) = standby_marker("unacked");
    let hub: Arc<MemoryHub> = MemoryHub::new();
    let mut migration: MigrationConfig = migration_config();
    migration.handoff_timeout = Some(Duration::from_millis(200));

    let lb: Arc<LoadBalancer> = LoadBalancer::new(
        backend_config(backend_port, 0),
        &commands,
        migration,
        hub.endpoint("fc00::a".parse().unwrap()).unwrap(),
        Arc::new(SystemClock),
    );
    let addr: SocketAddr = lb.bind().unwrap();
    {
        let lb: Arc<LoadBalancer> = lb.clone();
        thread::spawn(move || lb.start_listen().unwrap());
    }
    let peer: Arc<MemoryBus> = hub.endpoint("fc00::b".parse().unwrap()).unwrap();
    let messages: Receiver<String> = tap(&peer);

    let mut client: TcpStream = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    echo(&mut client, b"ping");
    let flow: FlowKey = flow_of(&client);

    // Ask for the flow, then never acknowledge the state that comes back.
    peer.send(&format!("{} {}", flow.ip, flow.port)).unwrap();
    let handoff: String = messages.recv_timeout(TIMEOUT).unwrap();
    match LbMessage::parse(&handoff).unwrap() {
        LbMessage::Handoff { flow: handed, .. } => assert_eq!(handed, flow),
        LbMessage::Query(_) => panic!("expected a handoff, got {:?}", handoff),
    }

    assert!(wait_until(|| !lb.pending().is_armed(&flow) && !lb.hook().registry().contains(&flow)));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(marker_contents(&marker), "");

    lb.shutdown();
}
