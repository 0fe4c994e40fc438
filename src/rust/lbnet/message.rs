// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    repair::RepairState,
    runtime::fail::Fail,
    tcphook::FlowKey,
};
use ::std::{
    fmt,
    net::Ipv6Addr,
};

//==============================================================================
// Structures
//==============================================================================

/// Messages exchanged between load balancer instances.
///
/// On the wire these are space separated ASCII tokens:
/// - `<ip> <port>`
/// - `<ip> <port> <upstream json> <downstream json>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LbMessage {
    /// Asks the owner of a flow to hand it over. The new owner sends the same message once it
    /// has taken a flow over, which the old owner takes as the acknowledgment.
    Query(FlowKey),
    /// Frozen state of both legs of a flow.
    Handoff {
        flow: FlowKey,
        upstream: RepairState,
        downstream: RepairState,
    },
}

//==============================================================================
// Associate Functions
//==============================================================================

impl LbMessage {
    pub fn parse(text: &str) -> Result<Self, Fail> {
        let tokens: Vec<&str> = text.trim_end_matches(|c: char| c == '\n' || c == '\r').split(' ').collect();
        match tokens.as_slice() {
            [ip, port] => Ok(LbMessage::Query(parse_flow(ip, port)?)),
            [ip, port, upstream, downstream] => Ok(LbMessage::Handoff {
                flow: parse_flow(ip, port)?,
                upstream: RepairState::from_json(upstream)?,
                downstream: RepairState::from_json(downstream)?,
            }),
            _ => Err(Fail::new(
                libc::EBADMSG,
                &format!("unexpected number of tokens ({})", tokens.len()),
            )),
        }
    }

    pub fn encode(&self) -> Result<String, Fail> {
        match self {
            LbMessage::Query(flow) => Ok(format!("{} {}", flow.ip, flow.port)),
            LbMessage::Handoff {
                flow,
                upstream,
                downstream,
            } => Ok(format!(
                "{} {} {} {}",
                flow.ip,
                flow.port,
                upstream.to_json()?,
                downstream.to_json()?
            )),
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Display for LbMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LbMessage::Query(flow) => write!(f, "query {}", flow),
            LbMessage::Handoff { flow, downstream, .. } => write!(
                f,
                "handoff {} via [{}]:{} -> [{}]:{}",
                flow, downstream.saddr, downstream.sport, downstream.daddr, downstream.dport
            ),
        }
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

fn parse_flow(ip: &str, port: &str) -> Result<FlowKey, Fail> {
    let ip: Ipv6Addr = ip
        .parse()
        .map_err(|_| Fail::new(libc::EBADMSG, &format!("invalid client address {:?}", ip)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Fail::new(libc::EBADMSG, &format!("invalid client port {:?}", port)))?;
    Ok(FlowKey::new(ip, port))
}

//==============================================================================
// Unit Tests
//==============================================================================
