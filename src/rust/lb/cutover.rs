// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    config::CommandConfig,
    runtime::fail::Fail,
};
use ::std::{
    net::Ipv6Addr,
    process::{
        Command,
        ExitStatus,
    },
    thread::{
        self,
        JoinHandle,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// Placeholder replaced by the flow's backend-facing source address.
const ADDRESS_PLACEHOLDER: &str = "%s";

//==============================================================================
// Structures
//==============================================================================

/// External commands that steer return traffic of a flow to the instance owning it.
#[derive(Debug, Clone, Default)]
pub struct RouteCutover {
    active: Option<String>,
    standby: Option<String>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl RouteCutover {
    pub fn new(commands: &CommandConfig) -> Self {
        Self {
            active: commands.active.clone(),
            standby: commands.standby.clone(),
        }
    }

    /// Runs the `active` command in the background after taking a flow over.
    pub fn activate(&self, addr: Ipv6Addr) -> Option<JoinHandle<()>> {
        self.spawn("active", self.active.as_deref(), addr)
    }

    /// Runs the `standby` command in the background after giving a flow away.
    pub fn standby(&self, addr: Ipv6Addr) -> Option<JoinHandle<()>> {
        self.spawn("standby", self.standby.as_deref(), addr)
    }

    fn spawn(&self, kind: &'static str, template: Option<&str>, addr: Ipv6Addr) -> Option<JoinHandle<()>> {
        let command: String = render(template?, addr);
        let spawned = thread::Builder::new()
            .name(format!("cutover-{}", kind))
            .spawn(move || {
                info!("exec ({}): {}", kind, command);
                match run(&command) {
                    Ok(status) if status.success() => (),
                    Ok(status) => warn!("{} command exited with {}: {}", kind, status, command),
                    Err(e) => warn!("{} command failed: {}", kind, e),
                }
            });
        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("failed to spawn {} command ({})", kind, e);
                None
            },
        }
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

fn render(template: &str, addr: Ipv6Addr) -> String {
    template.replace(ADDRESS_PLACEHOLDER, &addr.to_string())
}

fn run(command: &str) -> Result<ExitStatus, Fail> {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .map_err(|e| Fail::from_io("sh -c", e))
}

//==============================================================================
// Unit Tests
//==============================================================================
