// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::serde::{
    Deserialize,
    Serialize,
};
use ::std::net::Ipv6Addr;

//==============================================================================
// Structures
//==============================================================================

/// Mirror of the kernel's `struct tcp_repair_window`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpRepairWindow {
    pub snd_wl1: u32,
    pub snd_wnd: u32,
    pub max_window: u32,
    pub rcv_wnd: u32,
    pub rcv_wup: u32,
}

/// Kernel state of one frozen TCP socket.
///
/// `saddr`, `sport`, `daddr` and `dport` are only filled in for the backend-facing
/// leg; the client-facing leg is rebuilt from the virtual address and the flow key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairState {
    pub window: TcpRepairWindow,
    pub mss: u32,
    pub rcv_seq: u32,
    pub snd_seq: u32,
    #[serde(default = "unspecified")]
    pub saddr: Ipv6Addr,
    #[serde(default)]
    pub sport: u16,
    #[serde(default = "unspecified")]
    pub daddr: Ipv6Addr,
    #[serde(default)]
    pub dport: u16,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl RepairState {
    /// Serializes into the single-token JSON blob carried on the coordination bus.
    pub fn to_json(&self) -> Result<String, Fail> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(blob: &str) -> Result<Self, Fail> {
        Ok(serde_json::from_str::<RepairState>(blob)?)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for RepairState {
    fn default() -> Self {
        Self {
            window: TcpRepairWindow::default(),
            mss: 0,
            rcv_seq: 0,
            snd_seq: 0,
            saddr: Ipv6Addr::UNSPECIFIED,
            sport: 0,
            daddr: Ipv6Addr::UNSPECIFIED,
            dport: 0,
        }
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

fn unspecified() -> Ipv6Addr {
    Ipv6Addr::UNSPECIFIED
}

//==============================================================================
// Unit Tests
//==============================================================================
