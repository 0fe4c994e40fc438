// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Byte forwarding between the client-facing and the backend-facing socket of a flow.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::crossbeam_channel::{
    bounded,
    Receiver,
    Sender,
};
use ::nix::{
    errno::Errno,
    poll::{
        poll,
        PollFd,
        PollFlags,
    },
    sys::eventfd::{
        eventfd,
        EfdFlags,
    },
};
use ::socket2::Socket;
use ::std::{
    io::{
        self,
        Read,
        Write,
    },
    os::unix::io::{
        AsRawFd,
        FromRawFd,
        OwnedFd,
        RawFd,
    },
    sync::Arc,
    thread::{
        self,
        JoinHandle,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// Size of the per-direction forwarding buffer.
pub const PIPE_BUFFER_SIZE: usize = 64 * 1024;

//==============================================================================
// Structures
//==============================================================================

/// Direction of a forwarding loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend.
    Upstream,
    /// Backend to client.
    Downstream,
}

/// Level-triggered wakeup shared by both forwarding loops.
struct StopSignal {
    fd: OwnedFd,
}

enum Outcome {
    /// Source reached end of stream.
    Eof,
    /// Stopped by the owner of the pipe.
    Stopped,
}

/// Two forwarding loops between a pair of sockets.
///
/// The first loop that ends posts its [Direction] on [DuplexPipe::exit]. Nothing is posted
/// for loops that end because of [DuplexPipe::stop].
pub struct DuplexPipe {
    stop: Arc<StopSignal>,
    exit: Receiver<Direction>,
    threads: Vec<JoinHandle<()>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl StopSignal {
    fn new() -> Result<Self, Fail> {
        let fd: RawFd = eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        // Safe: `fd` was just created and nothing else owns it.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn raise(&self) {
        if let Err(e) = nix::unistd::write(self.fd.as_raw_fd(), &1u64.to_ne_bytes()) {
            // EAGAIN only happens when the counter is already saturated, i.e. raised.
            if e != Errno::EAGAIN {
                warn!("pipe: failed to raise stop signal ({})", e);
            }
        }
    }
}

impl DuplexPipe {
    /// Starts forwarding between `client` and `backend`. Both sockets are switched to
    /// non-blocking mode.
    pub fn start(client: &Socket, backend: &Socket) -> Result<Self, Fail> {
        client
            .set_nonblocking(true)
            .map_err(|e| Fail::from_io("set_nonblocking", e))?;
        backend
            .set_nonblocking(true)
            .map_err(|e| Fail::from_io("set_nonblocking", e))?;

        let stop: Arc<StopSignal> = Arc::new(StopSignal::new()?);
        let (tx, rx): (Sender<Direction>, Receiver<Direction>) = bounded(2);
        let mut pipe: Self = Self {
            stop,
            exit: rx,
            threads: Vec::with_capacity(2),
        };

        for (direction, from, to) in [
            (Direction::Upstream, client, backend),
            (Direction::Downstream, backend, client),
        ] {
            let from: Socket = from.try_clone().map_err(|e| Fail::from_io("dup", e))?;
            let to: Socket = to.try_clone().map_err(|e| Fail::from_io("dup", e))?;
            let stop: Arc<StopSignal> = pipe.stop.clone();
            let tx: Sender<Direction> = tx.clone();
            let thread: JoinHandle<()> = thread::Builder::new()
                .name(format!("pipe-{:?}", direction).to_lowercase())
                .spawn(move || forward(direction, from, to, stop, tx))
                .map_err(|e| Fail::from_io("spawn pipe thread", e))?;
            pipe.threads.push(thread);
        }

        Ok(pipe)
    }

    pub fn exit(&self) -> &Receiver<Direction> {
        &self.exit
    }

    /// Stops both loops and waits for them. No byte is forwarded after this returns.
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.stop.raise();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("pipe: forwarding thread panicked");
            }
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl AsRawFd for StopSignal {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for DuplexPipe {
    fn drop(&mut self) {
        self.join();
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

fn forward(direction: Direction, from: Socket, to: Socket, stop: Arc<StopSignal>, exit: Sender<Direction>) {
    let mut buffer: Vec<u8> = vec![0; PIPE_BUFFER_SIZE];
    match copy(&from, &to, &mut buffer, &stop) {
        Ok(Outcome::Stopped) => {
            trace!("pipe: {:?} stopped", direction);
            return;
        },
        Ok(Outcome::Eof) => debug!("pipe: {:?} reached end of stream", direction),
        Err(e) => debug!("pipe: {:?} failed ({})", direction, e),
    }
    // Only the first exit matters.
    let _ = exit.try_send(direction);
}

fn copy(from: &Socket, to: &Socket, buffer: &mut [u8], stop: &StopSignal) -> Result<Outcome, Fail> {
    loop {
        let (readable, stopped): (bool, bool) = wait(from, PollFlags::POLLIN, stop)?;
        if stopped {
            return Ok(Outcome::Stopped);
        }
        if !readable {
            continue;
        }

        let nbytes: usize = match (&*from).read(buffer) {
            Ok(0) => return Ok(Outcome::Eof),
            Ok(nbytes) => nbytes,
            Err(e) if is_retryable(&e) => continue,
            Err(e) => return Err(Fail::from_io("read", e)),
        };

        let mut written: usize = 0;
        while written < nbytes {
            match (&*to).write(&buffer[written..nbytes]) {
                Ok(0) => return Err(Fail::new(libc::EPIPE, "write returned zero")),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let (writable, stopped): (bool, bool) = wait(to, PollFlags::POLLOUT, stop)?;
                    // A pending write is finished if the peer takes it.
                    if stopped && !writable {
                        return Ok(Outcome::Stopped);
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Fail::from_io("write", e)),
            }
        }
    }
}

/// Waits until `socket` is ready for `events` or the stop signal is raised.
fn wait(socket: &Socket, events: PollFlags, stop: &StopSignal) -> Result<(bool, bool), Fail> {
    let mut fds: [PollFd; 2] = [
        PollFd::new(socket.as_raw_fd(), events),
        PollFd::new(stop.as_raw_fd(), PollFlags::POLLIN),
    ];
    match poll(&mut fds, -1) {
        Ok(_) | Err(Errno::EINTR) => (),
        Err(e) => return Err(e.into()),
    }
    // Hang-ups and errors surface on the next read or write.
    let ready: bool = fds[0]
        .revents()
        .map_or(false, |r| r.intersects(events | PollFlags::POLLHUP | PollFlags::POLLERR));
    let stopped: bool = fds[1].revents().map_or(false, |r| r.contains(PollFlags::POLLIN));
    Ok((ready, stopped))
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

//==============================================================================
// Unit Tests
//==============================================================================
