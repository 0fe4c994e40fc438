// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::ipnet::Ipv6Net;
use ::std::{
    collections::HashSet,
    net::Ipv6Addr,
    sync::{
        Mutex,
        MutexGuard,
    },
};

//==============================================================================
// Structures
//==============================================================================

struct AllocatorState {
    /// Last address produced by the counter.
    current: [u8; 16],
    /// Released addresses, handed out again before the counter moves.
    free: Vec<Ipv6Addr>,
    /// Addresses currently in use by a flow.
    leased: HashSet<Ipv6Addr>,
}

/// Hands out source addresses for backend-facing connections.
///
/// Addresses are taken in order from just after the network address, by counting up the
/// last byte. The allocator never wraps around.
pub struct AddressAllocator {
    range: Ipv6Net,
    state: Mutex<AllocatorState>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl AddressAllocator {
    pub fn new(range: Ipv6Net) -> Self {
        let range: Ipv6Net = range.trunc();
        Self {
            range,
            state: Mutex::new(AllocatorState {
                current: range.network().octets(),
                free: Vec::new(),
                leased: HashSet::new(),
            }),
        }
    }

    pub fn range(&self) -> Ipv6Net {
        self.range
    }

    /// Leases an unused address.
    pub fn allocate(&self) -> Result<Ipv6Addr, Fail> {
        let mut state: MutexGuard<AllocatorState> = self.state();
        if let Some(addr) = state.free.pop() {
            state.leased.insert(addr);
            return Ok(addr);
        }
        loop {
            let mut next: [u8; 16] = state.current;
            next[15] = match next[15].checked_add(1) {
                Some(low) => low,
                None => return Err(self.exhausted()),
            };
            let addr: Ipv6Addr = Ipv6Addr::from(next);
            if !self.range.contains(&addr) {
                return Err(self.exhausted());
            }
            state.current = next;
            // Skip addresses taken over from another instance.
            if state.leased.insert(addr) {
                return Ok(addr);
            }
        }
    }

    /// Marks `addr` as in use without allocating it. Returns `false` if the address is
    /// outside of the range.
    pub fn claim(&self, addr: Ipv6Addr) -> bool {
        if !self.range.contains(&addr) {
            return false;
        }
        let mut state: MutexGuard<AllocatorState> = self.state();
        state.free.retain(|free| *free != addr);
        state.leased.insert(addr);
        true
    }

    /// Returns `addr` to the pool.
    pub fn release(&self, addr: Ipv6Addr) {
        let mut state: MutexGuard<AllocatorState> = self.state();
        if state.leased.remove(&addr) {
            state.free.push(addr);
        }
    }

    fn exhausted(&self) -> Fail {
        Fail::new(
            libc::EADDRNOTAVAIL,
            &format!("insufficient addresses in {}", self.range),
        )
    }

    fn state(&self) -> MutexGuard<AllocatorState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
