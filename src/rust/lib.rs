// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Layer-4 load balancer for IPv6 TCP that moves live client connections between
//! instances using the kernel's TCP repair mode.

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate log;

#[macro_use]
pub mod profiler;

pub mod config;
pub mod lb;
pub mod lbnet;
pub mod repair;
pub mod runtime;
pub mod tcphook;

//==============================================================================
// Exports
//==============================================================================

pub use self::{
    config::Config,
    lb::LoadBalancer,
    lbnet::{
        LbMessage,
        LbNetwork,
        MessageBus,
    },
    repair::RepairState,
    runtime::fail::Fail,
    tcphook::FlowKey,
};
