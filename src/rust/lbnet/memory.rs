// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use super::{
    HandlerList,
    MessageBus,
    MessageHandler,
};
use crate::runtime::fail::Fail;
use ::crossbeam_channel::{
    unbounded,
    Receiver,
    Sender,
};
use ::std::{
    net::IpAddr,
    sync::{
        Arc,
        Mutex,
    },
    thread,
};

//==============================================================================
// Structures
//==============================================================================

/// In-process stand-in for the multicast group.
#[derive(Default)]
pub struct MemoryHub {
    members: Mutex<Vec<(IpAddr, Sender<(String, IpAddr)>)>>,
}

/// One instance's endpoint on a [MemoryHub].
///
/// Messages are delivered on a dedicated thread per endpoint, so handlers never run on the
/// sender's stack, and are not echoed back to the endpoint that sent them.
pub struct MemoryBus {
    source: IpAddr,
    hub: Arc<MemoryHub>,
    handlers: Arc<HandlerList>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches a new endpoint that sends from `source`.
    pub fn endpoint(self: &Arc<Self>, source: IpAddr) -> Result<Arc<MemoryBus>, Fail> {
        let (tx, rx): (Sender<(String, IpAddr)>, Receiver<(String, IpAddr)>) = unbounded();
        let handlers: Arc<HandlerList> = Arc::new(HandlerList::default());
        {
            let handlers: Arc<HandlerList> = handlers.clone();
            thread::Builder::new()
                .name(format!("memory-bus-{}", source))
                .spawn(move || {
                    for (message, remote) in rx.iter() {
                        handlers.dispatch(&message, remote);
                    }
                })
                .map_err(|e| Fail::from_io("spawn memory bus thread", e))?;
        }
        match self.members.lock() {
            Ok(mut members) => members.push((source, tx)),
            Err(poisoned) => poisoned.into_inner().push((source, tx)),
        }
        Ok(Arc::new(MemoryBus {
            source,
            hub: self.clone(),
            handlers,
        }))
    }

    fn publish(&self, message: &str, source: IpAddr) {
        let members: Vec<(IpAddr, Sender<(String, IpAddr)>)> = match self.members.lock() {
            Ok(members) => members.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for (member, tx) in members {
            if member != source {
                // A member whose thread is gone simply misses the message.
                let _ = tx.send((message.to_string(), source));
            }
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl MessageBus for MemoryBus {
    fn send(&self, message: &str) -> Result<(), Fail> {
        self.hub.publish(message, self.source);
        Ok(())
    }

    fn add_handler(&self, handler: MessageHandler) {
        self.handlers.push(handler);
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
