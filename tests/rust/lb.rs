// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::crossbeam_channel::{
    unbounded,
    Receiver,
    Sender,
};
use ::etherparse::PacketBuilder;
use ::std::{
    io::{
        self,
        Read,
        Write,
    },
    net::{
        IpAddr,
        Ipv6Addr,
        SocketAddr,
        TcpListener,
        TcpStream,
    },
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
    runtime::{
        clock::SystemClock,
        logging,
    },
    tcphook::ConnectionState,
    FlowKey,
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

/// Starts an echo server on the IPv6 loopback, or returns `None` if there is none.
fn echo_server() -> Option<SocketAddr> {
    let listener: TcpListener = match TcpListener::bind("[::1]:0") {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("skipping: no IPv6 loopback ({})", e);
            return None;
        },
    };
    let addr: SocketAddr = listener.local_addr().unwrap();
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
    Some(addr)
}

fn backend_config(backend_port: u16, listen: u16) -> BackendConfig {
    BackendConfig {
        hosts: vec![Ipv6Addr::LOCALHOST],
        port: backend_port,
        listen,
        vip: Ipv6Addr::LOCALHOST,
        interface: "lo".to_string(),
        // Only ::1 is usable on the loopback.
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

/// Creates a listening load balancer in front of the echo server at `backend`.
fn start_lb(backend: SocketAddr, bus: Arc<MemoryBus>) -> (Arc<LoadBalancer>, SocketAddr) {
    let lb: Arc<LoadBalancer> = LoadBalancer::new(
        backend_config(backend.port(), 0),
        &CommandConfig::default(),
        migration_config(),
        bus,
        Arc::new(SystemClock),
    );
    let addr: SocketAddr = lb.bind().unwrap();
    let listener: Arc<LoadBalancer> = lb.clone();
    thread::spawn(move || listener.start_listen().unwrap());
    (lb, addr)
}

/// Forwards every message seen by `bus` into a channel.
fn tap(bus: &Arc<MemoryBus>) -> Receiver<String> {
    let (tx, rx): (Sender<String>, Receiver<String>) = unbounded();
    bus.add_handler(Box::new(move |message: &str, _: IpAddr| {
        let _ = tx.send(message.to_string());
    }));
    rx
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream: TcpStream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream
}

fn echo(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).unwrap();
    let mut buf: Vec<u8> = vec![0; payload.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf, payload);
}

fn flow_of(stream: &TcpStream) -> FlowKey {
    match stream.local_addr().unwrap() {
        SocketAddr::V6(addr) => FlowKey::from(addr),
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

/// Tests that a client is proxied to the backend and that closing the client tears the flow down.
#[test]
fn proxy_accepted_connection() {
    logging::initialize();
    let backend: SocketAddr = match echo_server() {
        Some(addr) => addr,
        None => return,
    };
    let hub: Arc<MemoryHub> = MemoryHub::new();
    let (lb, addr) = start_lb(backend, hub.endpoint("fc00::a".parse().unwrap()).unwrap());

    let mut client: TcpStream = connect(addr);
    echo(&mut client, b"hello through the load balancer");

    let flow: FlowKey = flow_of(&client);
    assert_eq!(lb.hook().registry().state(&flow), Some(ConnectionState::Established));
    assert!(lb.pending().is_armed(&flow));

    drop(client);
    assert!(wait_until(|| !lb.hook().registry().contains(&flow)));
    assert!(!lb.pending().is_armed(&flow));

    // The single address of the range is handed out again.
    let mut client: TcpStream = connect(addr);
    echo(&mut client, b"again");

    lb.shutdown();
}

/// Tests that queries for flows nobody waits on are ignored, however often they arrive.
#[test]
fn ignore_unknown_query() {
    logging::initialize();
    let backend: SocketAddr = match echo_server() {
        Some(addr) => addr,
        None => return,
    };
    let hub: Arc<MemoryHub> = MemoryHub::new();
    let (lb, addr) = start_lb(backend, hub.endpoint("fc00::a".parse().unwrap()).unwrap());
    let peer: Arc<MemoryBus> = hub.endpoint("fc00::b".parse().unwrap()).unwrap();

    let mut client: TcpStream = connect(addr);
    echo(&mut client, b"ping");

    peer.send("2001:db8::1 55555").unwrap();
    peer.send("2001:db8::1 55555").unwrap();
    peer.send("not a message").unwrap();

    let flow: FlowKey = FlowKey::new("2001:db8::1".parse().unwrap(), 55555);
    thread::sleep(Duration::from_millis(100));
    assert!(!lb.pending().is_armed(&flow));
    assert!(!lb.hook().registry().contains(&flow));

    // The owned flow is unaffected.
    echo(&mut client, b"still here");
    lb.shutdown();
}

/// Tests that a foreign flow seen on the wire turns into a query on the bus.
#[test]
fn publish_query_for_foreign_flow() {
    logging::initialize();
    let hub: Arc<MemoryHub> = MemoryHub::new();
    let bus: Arc<MemoryBus> = hub.endpoint("fc00::a".parse().unwrap()).unwrap();
    let peer: Arc<MemoryBus> = hub.endpoint("fc00::b".parse().unwrap()).unwrap();
    let queries: Receiver<String> = tap(&peer);

    let lb: Arc<LoadBalancer> = LoadBalancer::new(
        backend_config(8080, 80),
        &CommandConfig::default(),
        migration_config(),
        bus,
        Arc::new(SystemClock),
    );

    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv6(
            "2001:db8::1".parse::<Ipv6Addr>().unwrap().octets(),
            Ipv6Addr::LOCALHOST.octets(),
            64,
        )
        .tcp(55555, 80, 1, 65535)
        .ack(1);
    let mut frame: Vec<u8> = Vec::with_capacity(builder.size(0));
    builder.write(&mut frame, &[]).unwrap();

    assert!(lb.hook().inspect(&frame).is_some());
    assert!(lb.hook().inspect(&frame).is_none());

    assert_eq!(queries.recv_timeout(TIMEOUT).unwrap(), "2001:db8::1 55555");
    assert!(queries.recv_timeout(Duration::from_millis(100)).is_err());
}

/// Tests that handoffs for another backend or for an established flow are not adopted.
#[test]
fn reject_unrelated_and_duplicate_handoff() {
    logging::initialize();
    let backend: SocketAddr = match echo_server() {
        Some(addr) => addr,
        None => return,
    };
    let hub: Arc<MemoryHub> = MemoryHub::new();
    let (lb, addr) = start_lb(backend, hub.endpoint("fc00::a".parse().unwrap()).unwrap());

    let mut client: TcpStream = connect(addr);
    echo(&mut client, b"ping");
    let flow: FlowKey = flow_of(&client);

    let state = |daddr: &str, dport: u16| {
        format!(
            r#"{{"window":{{"sndWl1":1,"sndWnd":1,"maxWindow":1,"rcvWnd":1,"rcvWup":1}},"mss":1400,"rcvSeq":1,"sndSeq":1,"saddr":"::1","sport":40000,"daddr":"{}","dport":{}}}"#,
            daddr, dport
        )
    };
    let remote: IpAddr = "fc00::b".parse().unwrap();

    let other_backend: String = format!("2001:db8::2 1234 {} {}", state("::1", 1), state("fc00::99", 1));
    lb.handle_message(&other_backend, remote);
    assert!(!lb.hook().registry().contains(&FlowKey::new("2001:db8::2".parse().unwrap(), 1234)));

    let duplicate: String = format!(
        "{} {} {} {}",
        flow.ip,
        flow.port,
        state("::1", 1),
        state("::1", backend.port())
    );
    lb.handle_message(&duplicate, remote);
    assert_eq!(lb.hook().registry().state(&flow), Some(ConnectionState::Established));

    echo(&mut client, b"unchanged");
    lb.shutdown();
}

/// Tests that shutdown stops the accept loop.
#[test]
fn shutdown_stops_listening() {
    logging::initialize();
    if TcpListener::bind("[::1]:0").is_err() {
        return;
    }
    let hub: Arc<MemoryHub> = MemoryHub::new();
    let lb: Arc<LoadBalancer> = LoadBalancer::new(
        backend_config(9, 0),
        &CommandConfig::default(),
        migration_config(),
        hub.endpoint("fc00::a".parse().unwrap()).unwrap(),
        Arc::new(SystemClock),
    );
    lb.bind().unwrap();

    let (tx, rx): (Sender<bool>, Receiver<bool>) = unbounded();
    let listener: Arc<LoadBalancer> = lb.clone();
    thread::spawn(move || {
        let _ = tx.send(listener.start_listen().is_ok());
    });

    thread::sleep(Duration::from_millis(50));
    lb.shutdown();
    assert!(rx.recv_timeout(TIMEOUT).unwrap());
}
