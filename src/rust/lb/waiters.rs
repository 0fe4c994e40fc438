// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::tcphook::FlowKey;
use ::crossbeam_channel::{
    bounded,
    Receiver,
    Sender,
};
use ::std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Mutex,
        MutexGuard,
    },
};

//==============================================================================
// Structures
//==============================================================================

/// Receiving end of a one-shot completion signal.
pub struct Waiter {
    id: u64,
    flow: FlowKey,
    signal: Receiver<()>,
}

/// Flows for which this instance is waiting on a message from a peer, at most one waiter
/// per flow.
#[derive(Default)]
pub struct PendingMigrations {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<FlowKey, (u64, Sender<()>)>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Waiter {
    pub fn signal(&self) -> &Receiver<()> {
        &self.signal
    }
}

impl PendingMigrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `flow`, replacing any previous one.
    pub fn arm(&self, flow: FlowKey) -> Waiter {
        let id: u64 = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx): (Sender<()>, Receiver<()>) = bounded(1);
        self.waiters().insert(flow, (id, tx));
        Waiter { id, flow, signal: rx }
    }

    /// Wakes and removes the waiter of `flow`. Returns `false` if there was none.
    pub fn fulfill(&self, flow: &FlowKey) -> bool {
        let waiter: Option<(u64, Sender<()>)> = self.waiters().remove(flow);
        match waiter {
            Some((_, tx)) => {
                // Full channel means already woken.
                let _ = tx.try_send(());
                true
            },
            None => false,
        }
    }

    /// Removes `waiter` if it is still the registered one.
    pub fn disarm(&self, waiter: &Waiter) {
        let mut waiters: MutexGuard<HashMap<FlowKey, (u64, Sender<()>)>> = self.waiters();
        if let Some((id, _)) = waiters.get(&waiter.flow) {
            if *id == waiter.id {
                waiters.remove(&waiter.flow);
            }
        }
    }

    pub fn is_armed(&self, flow: &FlowKey) -> bool {
        self.waiters().contains_key(flow)
    }

    fn waiters(&self) -> MutexGuard<HashMap<FlowKey, (u64, Sender<()>)>> {
        match self.waiters.lock() {
            Ok(waiters) => waiters,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
