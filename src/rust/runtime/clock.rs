// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::std::{
    sync::Mutex,
    time::{
        Duration,
        Instant,
    },
};

//==============================================================================
// Traits
//==============================================================================

/// Source of monotonic time for deadlines kept in shared tables.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

//==============================================================================
// Structures
//==============================================================================

/// Wall clock backed by [Instant::now].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let elapsed: Duration = match self.elapsed.lock() {
            Ok(elapsed) => *elapsed,
            Err(poisoned) => *poisoned.into_inner(),
        };
        self.origin + elapsed
    }
}

//==============================================================================
// Associate Functions
//==============================================================================

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        match self.elapsed.lock() {
            Ok(mut elapsed) => *elapsed += by,
            Err(poisoned) => *poisoned.into_inner() += by,
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}
