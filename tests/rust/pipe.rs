// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::socket2::Socket;
use ::std::{
    io::{
        self,
        Read,
        Write,
    },
    net::{
        Shutdown,
        TcpListener,
        TcpStream,
    },
    thread,
    time::Duration,
};
use ::tcpmig_lb::{
    lb::{
        Direction,
        DuplexPipe,
    },
    runtime::logging,
};

//==============================================================================
// Constants
//==============================================================================

const TIMEOUT: Duration = Duration::from_secs(2);

//==============================================================================
// Helpers
//==============================================================================

/// Returns an outside end and the proxy-owned end of a loopback connection.
fn connected_pair() -> (TcpStream, Socket) {
    let listener: TcpListener = TcpListener::bind("127.0.0.1:0").unwrap();
    let outside: TcpStream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (inside, _) = listener.accept().unwrap();
    outside.set_read_timeout(Some(TIMEOUT)).unwrap();
    (outside, Socket::from(inside))
}

fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf: Vec<u8> = vec![0; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

//==============================================================================
// Tests
//==============================================================================

/// Tests that bytes cross the pipe unmodified in both directions.
#[test]
fn forward_both_directions() {
    logging::initialize();
    let (mut client, upstream) = connected_pair();
    let (mut backend, downstream) = connected_pair();
    let pipe: DuplexPipe = DuplexPipe::start(&upstream, &downstream).unwrap();

    client.write_all(b"hello backend").unwrap();
    assert_eq!(read_exact(&mut backend, 13), b"hello backend");

    backend.write_all(b"hello client").unwrap();
    assert_eq!(read_exact(&mut client, 12), b"hello client");

    pipe.stop();
}

/// Tests that a large transfer arrives complete and in order.
#[test]
fn forward_large_transfer() {
    logging::initialize();
    let (client, upstream) = connected_pair();
    let (mut backend, downstream) = connected_pair();
    let pipe: DuplexPipe = DuplexPipe::start(&upstream, &downstream).unwrap();

    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i: u32| (i % 251) as u8).collect();
    let expected: Vec<u8> = payload.clone();
    let writer: thread::JoinHandle<()> = thread::spawn(move || {
        let mut client: TcpStream = client;
        client.write_all(&payload).unwrap();
    });

    assert_eq!(read_exact(&mut backend, expected.len()), expected);
    writer.join().unwrap();
    pipe.stop();
}

/// Tests that closing one side ends the pipe and that tearing it down closes the other side.
#[test]
fn close_terminates_pipe() {
    logging::initialize();
    let (client, upstream) = connected_pair();
    let (mut backend, downstream) = connected_pair();
    let pipe: DuplexPipe = DuplexPipe::start(&upstream, &downstream).unwrap();

    client.shutdown(Shutdown::Write).unwrap();
    assert_eq!(pipe.exit().recv_timeout(TIMEOUT).unwrap(), Direction::Upstream);

    pipe.stop();
    drop(upstream);
    drop(downstream);

    let mut buf: [u8; 1] = [0; 1];
    assert_eq!(backend.read(&mut buf).unwrap(), 0);
}

/// Tests that nothing is forwarded once the pipe is stopped.
#[test]
fn stop_halts_forwarding() {
    logging::initialize();
    let (mut client, upstream) = connected_pair();
    let (mut backend, downstream) = connected_pair();
    let pipe: DuplexPipe = DuplexPipe::start(&upstream, &downstream).unwrap();

    client.write_all(b"before").unwrap();
    assert_eq!(read_exact(&mut backend, 6), b"before");

    pipe.stop();
    client.write_all(b"after").unwrap();

    backend.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let mut buf: [u8; 5] = [0; 5];
    let e: io::Error = backend.read(&mut buf).unwrap_err();
    assert!(matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut));
}
