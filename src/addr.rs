// src/addr.rs
//! Agent and environment addressing.
//!
//! Every agent is reachable at `tcp://<host>:<port>/<index>`: the host and
//! port identify the environment's TCP listener, the index identifies the
//! agent inside it. Index 0 is reserved for the environment's manager.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::errors::{AgoraError, Result};

/// Index of the manager slot in every environment
pub const MANAGER_INDEX: u32 = 0;

/// Network address of an environment (`tcp://host:port`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvAddr {
    pub host: String,
    pub port: u16,
}

impl EnvAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address of the agent at `index` in this environment
    pub fn agent(&self, index: u32) -> AgentAddr {
        AgentAddr {
            host: self.host.clone(),
            port: self.port,
            index,
        }
    }

    /// Address of this environment's manager (agent 0)
    pub fn manager(&self) -> AgentAddr {
        self.agent(MANAGER_INDEX)
    }

    /// `(host, port)` pair suitable for `TcpStream::connect`
    pub fn host_port(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}

impl fmt::Display for EnvAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

impl FromStr for EnvAddr {
    type Err = AgoraError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.strip_prefix("tcp://").unwrap_or(s);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        let (host, port) = trimmed
            .rsplit_once(':')
            .ok_or_else(|| AgoraError::InvalidAddr(s.to_string()))?;
        if host.is_empty() {
            return Err(AgoraError::InvalidAddr(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AgoraError::InvalidAddr(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Network address of a single agent (`tcp://host:port/index`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentAddr {
    pub host: String,
    pub port: u16,
    pub index: u32,
}

impl AgentAddr {
    pub fn new(host: impl Into<String>, port: u16, index: u32) -> Self {
        Self {
            host: host.into(),
            port,
            index,
        }
    }

    /// The environment part of this address
    pub fn env(&self) -> EnvAddr {
        EnvAddr::new(self.host.clone(), self.port)
    }

    /// Manager address of the environment this agent lives in
    pub fn manager(&self) -> AgentAddr {
        self.env().manager()
    }

    pub fn is_manager(&self) -> bool {
        self.index == MANAGER_INDEX
    }
}

impl fmt::Display for AgentAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}/{}", self.host, self.port, self.index)
    }
}

impl FromStr for AgentAddr {
    type Err = AgoraError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.strip_prefix("tcp://").unwrap_or(s);
        let (env_part, index) = trimmed
            .rsplit_once('/')
            .ok_or_else(|| AgoraError::InvalidAddr(s.to_string()))?;
        let index = index
            .parse::<u32>()
            .map_err(|_| AgoraError::InvalidAddr(s.to_string()))?;
        let env: EnvAddr = env_part.parse()?;
        Ok(env.agent(index))
    }
}

// Addresses order by host, then numeric port, then creation index. This is
// the "alphabetical" ordering used for synchronous simulation stepping.
impl Ord for AgentAddr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.host
            .cmp(&other.host)
            .then(self.port.cmp(&other.port))
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for AgentAddr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for AgentAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AgentAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

impl Serialize for EnvAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EnvAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Sort addresses by host, numeric port and creation index
pub fn sort_addrs(mut addrs: Vec<AgentAddr>) -> Vec<AgentAddr> {
    addrs.sort();
    addrs
}

/// Group addresses by host and port
///
/// `result[host][port]` holds all agent addresses served by that
/// environment.
pub fn split_addrs(addrs: &[AgentAddr]) -> BTreeMap<String, BTreeMap<u16, Vec<AgentAddr>>> {
    let mut split: BTreeMap<String, BTreeMap<u16, Vec<AgentAddr>>> = BTreeMap::new();
    for addr in addrs {
        split
            .entry(addr.host.clone())
            .or_default()
            .entry(addr.port)
            .or_default()
            .push(addr.clone());
    }
    split
}

/// Map agent addresses to their assumed environment managers
pub fn addrs_to_managers(addrs: &[AgentAddr]) -> BTreeMap<AgentAddr, Vec<AgentAddr>> {
    let mut managers: BTreeMap<AgentAddr, Vec<AgentAddr>> = BTreeMap::new();
    for addr in addrs {
        managers.entry(addr.manager()).or_default().push(addr.clone());
    }
    managers
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_agent_addr() {
        let addr: AgentAddr = "tcp://localhost:5555/3".parse().unwrap();
        assert_eq!(addr.host, "localhost");
        assert_eq!(addr.port, 5555);
        assert_eq!(addr.index, 3);
        assert_eq!(addr.to_string(), "tcp://localhost:5555/3");
    }

    #[test]
    fn test_parse_env_addr() {
        let addr: EnvAddr = "tcp://127.0.0.1:5555".parse().unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 5555);

        let bare: EnvAddr = "127.0.0.1:5555".parse().unwrap();
        assert_eq!(bare, addr);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("tcp://nohost".parse::<EnvAddr>().is_err());
        assert!("tcp://host:notaport/0".parse::<AgentAddr>().is_err());
        assert!("tcp://host:5555".parse::<AgentAddr>().is_err());
        assert!(":5555".parse::<EnvAddr>().is_err());
    }

    #[test]
    fn test_manager_derivation() {
        let addr: AgentAddr = "tcp://anode:5555/7".parse().unwrap();
        assert_eq!(addr.manager().to_string(), "tcp://anode:5555/0");
        assert!(addr.manager().is_manager());
        assert!(!addr.is_manager());
    }

    #[test]
    fn test_sort_addrs() {
        let raw = [
            "tcp://bnode:5555/0",
            "tcp://anode:5555/0",
            "tcp://anode:50/1",
            "tcp://anode:5555/2",
            "tcp://anode:50/2",
            "tcp://anode:18000/0",
            "tcp://bnode:50/0",
            "tcp://anode:50/0",
            "tcp://anode:5555/1",
        ];
        let addrs: Vec<AgentAddr> = raw.iter().map(|s| s.parse().unwrap()).collect();
        let sorted = sort_addrs(addrs);
        let expected = [
            "tcp://anode:50/0",
            "tcp://anode:50/1",
            "tcp://anode:50/2",
            "tcp://anode:5555/0",
            "tcp://anode:5555/1",
            "tcp://anode:5555/2",
            "tcp://anode:18000/0",
            "tcp://bnode:50/0",
            "tcp://bnode:5555/0",
        ];
        let got: Vec<String> = sorted.iter().map(|a| a.to_string()).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_split_addrs() {
        let addrs: Vec<AgentAddr> = [
            "tcp://anode:50/0",
            "tcp://anode:50/1",
            "tcp://anode:5555/0",
            "tcp://bnode:50/0",
        ]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();
        let split = split_addrs(&addrs);
        assert_eq!(split.len(), 2);
        assert_eq!(split["anode"][&50].len(), 2);
        assert_eq!(split["anode"][&5555].len(), 1);
        assert_eq!(split["bnode"][&50].len(), 1);
    }

    #[test]
    fn test_serde_as_string() {
        let addr: AgentAddr = "tcp://localhost:5555/2".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"tcp://localhost:5555/2\"");
        let back: AgentAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    proptest! {
        #[test]
        fn prop_agent_addr_roundtrip(host in "[a-z][a-z0-9.-]{0,20}", port in 1u16..=u16::MAX, index in 0u32..10_000) {
            let addr = AgentAddr::new(host, port, index);
            let parsed: AgentAddr = addr.to_string().parse().unwrap();
            prop_assert_eq!(parsed, addr);
        }
    }
}
