// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Passive detection of flows that reach this instance without having been accepted here.

mod capture;
mod registry;

//==============================================================================
// Exports
//==============================================================================

pub use self::{
    capture::{
        FrameSource,
        PacketCapture,
        CAPTURE_POLL_INTERVAL,
    },
    registry::{
        ConnectionRecord,
        ConnectionRegistry,
        ConnectionState,
        FlowKey,
    },
};

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::{
    clock::Clock,
    fail::Fail,
};
use ::etherparse::{
    InternetSlice,
    SlicedPacket,
    TransportSlice,
};
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        RwLock,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::Duration,
};

//==============================================================================
// Structures
//==============================================================================

/// Callback invoked for every newly observed foreign flow.
pub type FlowHandler = Box<dyn Fn(FlowKey) + Send + Sync>;

/// Watches inbound segments for one service port.
pub struct TcpHook {
    port: u16,
    query_retry: Duration,
    registry: ConnectionRegistry,
    handlers: RwLock<Vec<FlowHandler>>,
    capturing: AtomicBool,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl TcpHook {
    /// Creates a hook for segments addressed to `port`. A foreign flow is reported again if it
    /// is still unknown after `query_retry`.
    pub fn new(port: u16, query_retry: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            port,
            query_retry,
            registry: ConnectionRegistry::new(clock),
            handlers: RwLock::new(Vec::new()),
            capturing: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn add_handler(&self, handler: FlowHandler) {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(poisoned) => poisoned.into_inner().push(handler),
        }
    }

    pub fn accept_event(&self, flow: FlowKey) {
        debug!("accept: {}", flow);
        self.registry.record_accept(flow);
    }

    pub fn close_event(&self, flow: FlowKey, grace: Duration) {
        debug!("close: {} (evict in {:?})", flow, grace);
        self.registry.schedule_evict(flow, grace);
    }

    /// Inspects one Ethernet frame. Returns the flow if it is a newly observed foreign flow,
    /// after every handler has seen it.
    pub fn inspect(&self, frame: &[u8]) -> Option<FlowKey> {
        let flow: FlowKey = self.classify(frame)?;
        if !self.registry.record_foreign(flow, self.query_retry) {
            return None;
        }

        info!("unknown: {}", flow);
        let handlers = match self.handlers.read() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        for handler in handlers.iter() {
            handler(flow);
        }
        Some(flow)
    }

    /// Starts a capture thread on `interface` that feeds [Self::inspect].
    pub fn start_capture(self: &Arc<Self>, interface: &str) -> Result<JoinHandle<()>, Fail> {
        let capture: PacketCapture = PacketCapture::open(interface)?;
        self.spawn_capture(format!("tcphook-{}", interface), capture)
    }

    /// Starts a thread that feeds frames from `source` to [Self::inspect] until
    /// [Self::stop_capture] is called.
    pub fn spawn_capture<S: FrameSource + 'static>(
        self: &Arc<Self>,
        name: String,
        mut source: S,
    ) -> Result<JoinHandle<()>, Fail> {
        self.capturing.store(true, Ordering::Release);
        let hook: Arc<Self> = self.clone();
        thread::Builder::new()
            .name(name)
            .spawn(move || hook.run_capture(&mut source))
            .map_err(|e| Fail::from_io("spawn capture thread", e))
    }

    pub fn stop_capture(&self) {
        self.capturing.store(false, Ordering::Release);
    }

    fn run_capture<S: FrameSource>(&self, source: &mut S) {
        while self.capturing.load(Ordering::Acquire) {
            match source.next_frame() {
                Ok(Some(frame)) => {
                    self.inspect(frame);
                },
                Ok(None) => (),
                Err(e) => {
                    warn!("capture: {}", e);
                    thread::sleep(CAPTURE_POLL_INTERVAL);
                },
            }
        }
        debug!("capture stopped");
    }

    /// Extracts the client side of a non-SYN IPv6 TCP segment addressed to our port.
    fn classify(&self, frame: &[u8]) -> Option<FlowKey> {
        let packet: SlicedPacket = match SlicedPacket::from_ethernet(frame) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("inspect(): dropping frame ({:?})", e);
                return None;
            },
        };
        let source = match packet.ip {
            Some(InternetSlice::Ipv6(header, _)) => header.source_addr(),
            _ => return None,
        };
        match packet.transport {
            Some(TransportSlice::Tcp(tcp)) if !tcp.syn() && tcp.destination_port() == self.port => {
                Some(FlowKey::new(source, tcp.source_port()))
            },
            _ => None,
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
