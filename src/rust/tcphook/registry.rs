// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::clock::Clock;
use ::std::{
    collections::HashMap,
    fmt,
    net::{
        Ipv6Addr,
        SocketAddrV6,
    },
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
    time::{
        Duration,
        Instant,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// Minimum time between two sweeps of expired records.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

//==============================================================================
// Structures
//==============================================================================

/// Client side of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub ip: Ipv6Addr,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted or adopted by this instance.
    Established,
    /// Seen on the wire but never accepted here.
    MigrationPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub state: ConnectionState,
    /// Entry counts as absent from this instant on.
    pub expires_at: Option<Instant>,
}

/// Flows known to this instance.
pub struct ConnectionRegistry {
    clock: Arc<dyn Clock>,
    table: Mutex<Table>,
}

struct Table {
    records: HashMap<FlowKey, ConnectionRecord>,
    swept_at: Instant,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl FlowKey {
    pub fn new(ip: Ipv6Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl ConnectionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let swept_at: Instant = clock.now();
        Self {
            clock,
            table: Mutex::new(Table {
                records: HashMap::new(),
                swept_at,
            }),
        }
    }

    /// Marks `flow` as owned by this instance. Cancels any pending eviction.
    pub fn record_accept(&self, flow: FlowKey) {
        let record: ConnectionRecord = ConnectionRecord {
            state: ConnectionState::Established,
            expires_at: None,
        };
        let now: Instant = self.clock.now();
        let mut table: MutexGuard<Table> = self.table();
        table.sweep(now);
        table.records.insert(flow, record);
    }

    /// Remembers `flow` as a migration candidate for `retry`. Returns `false` if the flow
    /// is already known, in which case nothing changes.
    pub fn record_foreign(&self, flow: FlowKey, retry: Duration) -> bool {
        let now: Instant = self.clock.now();
        let mut table: MutexGuard<Table> = self.table();
        table.sweep(now);
        if let Some(record) = table.records.get(&flow) {
            if !is_expired(record, now) {
                return false;
            }
        }
        table.records.insert(
            flow,
            ConnectionRecord {
                state: ConnectionState::MigrationPending,
                expires_at: Some(now + retry),
            },
        );
        true
    }

    /// Drops `flow` once `grace` has elapsed.
    pub fn schedule_evict(&self, flow: FlowKey, grace: Duration) {
        let now: Instant = self.clock.now();
        let mut table: MutexGuard<Table> = self.table();
        table.sweep(now);
        if let Some(record) = table.records.get_mut(&flow) {
            record.expires_at = Some(now + grace);
        }
    }

    pub fn state(&self, flow: &FlowKey) -> Option<ConnectionState> {
        let now: Instant = self.clock.now();
        let mut table: MutexGuard<Table> = self.table();
        let record: ConnectionRecord = *table.records.get(flow)?;
        if is_expired(&record, now) {
            table.records.remove(flow);
            return None;
        }
        Some(record.state)
    }

    pub fn contains(&self, flow: &FlowKey) -> bool {
        self.state(flow).is_some()
    }

    /// Number of live entries. Expired entries are purged on the way.
    pub fn len(&self) -> usize {
        let now: Instant = self.clock.now();
        let mut table: MutexGuard<Table> = self.table();
        table.records.retain(|_, record| !is_expired(record, now));
        table.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table(&self) -> MutexGuard<Table> {
        match self.table.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Table {
    /// Drops expired records, at most once per [SWEEP_INTERVAL].
    fn sweep(&mut self, now: Instant) {
        if now < self.swept_at + SWEEP_INTERVAL {
            return;
        }
        let before: usize = self.records.len();
        self.records.retain(|_, record| !is_expired(record, now));
        self.swept_at = now;
        if self.records.len() < before {
            trace!("registry: swept {} expired record(s)", before - self.records.len());
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]:{}", self.ip, self.port)
    }
}

impl From<SocketAddrV6> for FlowKey {
    fn from(addr: SocketAddrV6) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

fn is_expired(record: &ConnectionRecord, now: Instant) -> bool {
    match record.expires_at {
        Some(deadline) => now >= deadline,
        None => false,
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
