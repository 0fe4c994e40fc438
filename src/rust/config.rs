// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::ipnet::Ipv6Net;
use ::std::{
    fs,
    net::{
        Ipv6Addr,
        SocketAddr,
    },
    path::Path,
    time::Duration,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//==============================================================================
// Constants
//==============================================================================

/// Time a closed flow stays in the connection table.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Time the old owner waits for the new owner to acknowledge a handoff.
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a foreign flow is remembered before a repeated packet re-issues its query.
pub const DEFAULT_QUERY_RETRY: Duration = Duration::from_secs(3);

//==============================================================================
// Structures
//==============================================================================

/// Load balancer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub backends: Vec<BackendConfig>,
    pub lb_network: LbNetworkConfig,
    pub migration: MigrationConfig,
}

/// One load-balanced service.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    /// Candidate backend hosts.
    pub hosts: Vec<Ipv6Addr>,
    /// Port the backends listen on.
    pub port: u16,
    /// Port clients connect to.
    pub listen: u16,
    /// Virtual address clients connect to.
    pub vip: Ipv6Addr,
    /// Interface watched for foreign flows.
    pub interface: String,
    /// Source addresses handed out for backend-facing connections.
    pub address_range: Ipv6Net,
}

/// Coordination bus between load balancer instances.
#[derive(Debug, Clone, PartialEq)]
pub struct LbNetworkConfig {
    /// Multicast group and port.
    pub network: SocketAddr,
    /// Address this instance sends from. Messages from it are ignored on receive.
    pub source: SocketAddr,
    /// Interface used to join the multicast group. `None` lets the kernel pick.
    pub interface: Option<String>,
    pub commands: CommandConfig,
}

/// Route cutover command templates. `%s` is replaced by the flow's backend-facing source address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandConfig {
    pub active: Option<String>,
    pub standby: Option<String>,
}

/// Timers of the migration protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationConfig {
    pub grace_period: Duration,
    /// `None` waits for an acknowledgment forever.
    pub handoff_timeout: Option<Duration>,
    pub query_retry: Duration,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Config {
    /// Reads and parses a YAML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Fail> {
        let path: &Path = path.as_ref();
        let contents: String = fs::read_to_string(path)
            .map_err(|e| Fail::from_io(&format!("failed to read {}", path.display()), e))?;
        Self::from_str(&contents)
    }

    /// Parses a YAML configuration document.
    pub fn from_str(contents: &str) -> Result<Self, Fail> {
        let docs: Vec<Yaml> = YamlLoader::load_from_str(contents)
            .map_err(|e| Fail::new(libc::EINVAL, &format!("malformed configuration: {}", e)))?;
        let doc: &Yaml = match docs.first() {
            Some(doc) => doc,
            None => return Err(Fail::new(libc::EINVAL, "empty configuration")),
        };

        let backends: Vec<BackendConfig> = match &doc["backends"] {
            Yaml::Array(backends) => backends
                .iter()
                .map(BackendConfig::parse)
                .collect::<Result<Vec<_>, Fail>>()?,
            _ => return Err(Fail::new(libc::EINVAL, "backends: expected a list")),
        };

        Ok(Self {
            backends,
            lb_network: LbNetworkConfig::parse(&doc["lbNetwork"])?,
            migration: MigrationConfig::parse(&doc["migration"])?,
        })
    }
}

impl BackendConfig {
    fn parse(yaml: &Yaml) -> Result<Self, Fail> {
        let hosts: Vec<Ipv6Addr> = match &yaml["hosts"] {
            Yaml::Array(hosts) => hosts
                .iter()
                .map(|host| parse_from_str(host, "hosts[]"))
                .collect::<Result<Vec<_>, Fail>>()?,
            _ => return Err(Fail::new(libc::EINVAL, "hosts: expected a list")),
        };
        if hosts.is_empty() {
            return Err(Fail::new(libc::EINVAL, "hosts: at least one backend host is required"));
        }

        // The allocator counts from the network address, not from whatever host bits were written.
        let address_range: Ipv6Net = parse_from_str::<Ipv6Net>(&yaml["addressRange"], "addressRange")?.trunc();

        Ok(Self {
            hosts,
            port: parse_port(&yaml["port"], "port")?,
            listen: parse_port(&yaml["listen"], "listen")?,
            vip: parse_from_str(&yaml["vip"], "vip")?,
            interface: parse_string(&yaml["interface"], "interface")?,
            address_range,
        })
    }
}

impl LbNetworkConfig {
    fn parse(yaml: &Yaml) -> Result<Self, Fail> {
        if yaml.is_badvalue() {
            return Err(Fail::new(libc::EINVAL, "lbNetwork: section is required"));
        }
        let commands: &Yaml = &yaml["commands"];
        Ok(Self {
            network: parse_from_str(&yaml["network"], "lbNetwork.network")?,
            source: parse_from_str(&yaml["source"], "lbNetwork.source")?,
            interface: parse_optional_string(&yaml["interface"], "lbNetwork.interface")?,
            commands: CommandConfig {
                active: parse_optional_string(&commands["active"], "commands.active")?,
                standby: parse_optional_string(&commands["standby"], "commands.standby")?,
            },
        })
    }
}

impl MigrationConfig {
    fn parse(yaml: &Yaml) -> Result<Self, Fail> {
        let mut config: Self = Self::default();
        if yaml.is_badvalue() || yaml.is_null() {
            return Ok(config);
        }
        if let Some(ms) = parse_optional_millis(&yaml["gracePeriodMs"], "migration.gracePeriodMs")? {
            config.grace_period = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_optional_millis(&yaml["handoffTimeoutMs"], "migration.handoffTimeoutMs")? {
            config.handoff_timeout = match ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            };
        }
        if let Some(ms) = parse_optional_millis(&yaml["queryRetryMs"], "migration.queryRetryMs")? {
            config.query_retry = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            handoff_timeout: Some(DEFAULT_HANDOFF_TIMEOUT),
            query_retry: DEFAULT_QUERY_RETRY,
        }
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

fn parse_string(yaml: &Yaml, key: &str) -> Result<String, Fail> {
    match yaml.as_str() {
        Some(s) => Ok(s.to_string()),
        None => Err(Fail::new(libc::EINVAL, &format!("{}: expected a string", key))),
    }
}

fn parse_optional_string(yaml: &Yaml, key: &str) -> Result<Option<String>, Fail> {
    match yaml {
        Yaml::BadValue | Yaml::Null => Ok(None),
        _ => parse_string(yaml, key).map(Some),
    }
}

fn parse_from_str<T: std::str::FromStr>(yaml: &Yaml, key: &str) -> Result<T, Fail> {
    let s: String = parse_string(yaml, key)?;
    s.parse::<T>()
        .map_err(|_| Fail::new(libc::EINVAL, &format!("{}: invalid value {:?}", key, s)))
}

fn parse_port(yaml: &Yaml, key: &str) -> Result<u16, Fail> {
    match yaml.as_i64() {
        Some(port) if (0..=u16::MAX as i64).contains(&port) => Ok(port as u16),
        _ => Err(Fail::new(libc::EINVAL, &format!("{}: expected a port number", key))),
    }
}

fn parse_optional_millis(yaml: &Yaml, key: &str) -> Result<Option<u64>, Fail> {
    match yaml {
        Yaml::BadValue | Yaml::Null => Ok(None),
        Yaml::Integer(ms) if *ms >= 0 => Ok(Some(*ms as u64)),
        _ => Err(Fail::new(libc::EINVAL, &format!("{}: expected a non-negative integer", key))),
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
