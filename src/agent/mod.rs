// src/agent/mod.rs
//! Agents and their shared state.
//!
//! An [`Agent`] implementation supplies the behavior (`act`, `evaluate`), an
//! embedded [`AgentCore`] supplies the state every agent carries: address,
//! social connections, attitudes towards peers, per-step resources, age and
//! the artifacts it has created. The [`EnvHandle`] lets an agent reach back
//! into the environment it lives in without owning it.

pub mod builtin;
pub mod registry;

use std::collections::BTreeMap;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::addr::AgentAddr;
use crate::artifact::Artifact;
use crate::env::environment::{Environment, Proxy};
use crate::utils::errors::{AgoraError, Result};

/// How long an agent waits for a peer's opinion before moving on
const OPINION_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of evaluating an artifact: a scalar score plus optional framing
/// metadata describing how the score came about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub score: f64,
    #[serde(default)]
    pub framing: Option<Value>,
}

impl Evaluation {
    pub fn new(score: f64, framing: Option<Value>) -> Self {
        Self { score, framing }
    }

    /// The indifferent evaluation
    pub fn none() -> Self {
        Self {
            score: 0.0,
            framing: None,
        }
    }
}

/// One social connection: a peer address plus arbitrary annotation data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub addr: AgentAddr,
    #[serde(default)]
    pub data: Value,
}

impl ConnectionInfo {
    pub fn new(addr: AgentAddr) -> Self {
        Self {
            addr,
            data: Value::Null,
        }
    }

    pub fn with_data(addr: AgentAddr, data: Value) -> Self {
        Self { addr, data }
    }
}

/// Map from an agent to the connections that should be created for it
pub type ConnectionMap = BTreeMap<AgentAddr, Vec<ConnectionInfo>>;

/// Behavior interface implemented by every agent
///
/// `act` is the simulation entry point, called once per step. `evaluate`
/// renders an opinion about an artifact. `handle` is the extension point for
/// agent-specific RPC methods beyond the standard set.
#[async_trait]
pub trait Agent: std::fmt::Debug + Send + Sync {
    fn core(&self) -> &AgentCore;

    fn core_mut(&mut self) -> &mut AgentCore;

    /// Perform one step of behavior; `args` are passed through verbatim
    /// from the trigger call.
    async fn act(&mut self, args: Value) -> Result<Value>;

    /// Evaluate an artifact. The default implementation is indifferent.
    async fn evaluate(&mut self, _artifact: &Artifact) -> Result<Evaluation> {
        Ok(Evaluation::none())
    }

    /// Handle an agent-specific RPC method.
    async fn handle(&mut self, method: &str, _params: Value) -> Result<Value> {
        Err(AgoraError::UnknownMethod(method.to_string()))
    }

    /// Bookkeeping before the agent is dropped from its environment.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Handle from an agent back to its environment
///
/// The handle holds a weak reference, so a destroyed environment surfaces as
/// [`AgoraError::EnvironmentClosed`] instead of keeping the environment
/// alive from inside its own agents.
#[derive(Debug, Clone, Default)]
pub struct EnvHandle {
    env: Weak<Environment>,
}

impl EnvHandle {
    pub(crate) fn new(env: Weak<Environment>) -> Self {
        Self { env }
    }

    /// A handle not attached to any environment; every operation fails
    /// with [`AgoraError::EnvironmentClosed`]. Useful in tests.
    pub fn detached() -> Self {
        Self { env: Weak::new() }
    }

    fn env(&self) -> Result<std::sync::Arc<Environment>> {
        self.env.upgrade().ok_or(AgoraError::EnvironmentClosed)
    }

    /// Publish an artifact to the environment's shared artifact list
    pub fn publish(&self, artifact: Artifact) -> Result<()> {
        self.env()?.add_artifact(artifact);
        Ok(())
    }

    /// Put an artifact up as a candidate for collective evaluation
    pub fn publish_candidate(&self, artifact: Artifact) -> Result<()> {
        self.env()?.add_candidate(artifact);
        Ok(())
    }

    /// Connect to the agent at `addr`, locally or over the network
    pub fn connect(&self, addr: &AgentAddr) -> Result<Proxy> {
        Ok(self.env()?.connect(addr))
    }

    /// Ask a peer's opinion about an artifact
    ///
    /// The call is bounded so that two agents asking each other
    /// concurrently cannot wedge a step forever; a peer that does not
    /// answer in time reads as unreachable.
    pub async fn ask_opinion(&self, addr: &AgentAddr, artifact: &Artifact) -> Result<Evaluation> {
        let proxy = self.connect(addr)?;
        let fut = proxy.evaluate(artifact);
        match tokio::time::timeout(OPINION_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => Err(AgoraError::Timeout(addr.to_string())),
        }
    }
}

/// State shared by all agents
#[derive(Debug)]
pub struct AgentCore {
    addr: AgentAddr,
    name: String,
    env: EnvHandle,
    max_resources: u32,
    cur_resources: u32,
    age: u64,
    connections: BTreeMap<AgentAddr, Value>,
    attitudes: BTreeMap<AgentAddr, f64>,
    artifacts: Vec<Artifact>,
}

impl AgentCore {
    pub(crate) fn new(
        addr: AgentAddr,
        name: Option<String>,
        env: EnvHandle,
        resources: u32,
    ) -> Self {
        let name = name.unwrap_or_else(|| addr.to_string());
        Self {
            addr,
            name,
            env,
            max_resources: resources,
            cur_resources: resources,
            age: 0,
            connections: BTreeMap::new(),
            attitudes: BTreeMap::new(),
            artifacts: Vec::new(),
        }
    }

    /// A core detached from any environment, for direct library use and
    /// tests.
    pub fn detached(addr: AgentAddr) -> Self {
        Self::new(addr, None, EnvHandle::detached(), 0)
    }

    pub fn addr(&self) -> &AgentAddr {
        &self.addr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &EnvHandle {
        &self.env
    }

    // ---- social connections -------------------------------------------

    /// Add a connection; returns `false` when the peer was already known
    pub fn add_connection(&mut self, addr: AgentAddr, data: Value) -> bool {
        if self.connections.contains_key(&addr) {
            return false;
        }
        self.connections.insert(addr, data);
        true
    }

    pub fn add_connections(&mut self, conns: Vec<ConnectionInfo>) -> Vec<bool> {
        conns
            .into_iter()
            .map(|c| self.add_connection(c.addr, c.data))
            .collect()
    }

    /// Remove a connection, returning its annotation data if it existed
    pub fn remove_connection(&mut self, addr: &AgentAddr) -> Option<Value> {
        self.attitudes.remove(addr);
        self.connections.remove(addr)
    }

    pub fn clear_connections(&mut self) {
        self.connections.clear();
        self.attitudes.clear();
    }

    /// Peer addresses, ordered by host, port and index
    pub fn connection_addrs(&self) -> Vec<AgentAddr> {
        self.connections.keys().cloned().collect()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|(addr, data)| ConnectionInfo::with_data(addr.clone(), data.clone()))
            .collect()
    }

    pub fn has_connection(&self, addr: &AgentAddr) -> bool {
        self.connections.contains_key(addr)
    }

    /// A uniformly random known peer, if any
    pub fn random_connection(&self) -> Option<AgentAddr> {
        let addrs: Vec<&AgentAddr> = self.connections.keys().collect();
        addrs.choose(&mut rand::thread_rng()).map(|a| (*a).clone())
    }

    // ---- attitudes ----------------------------------------------------

    /// Attitude towards a peer in [-1, 1]; unknown peers read as 0.0
    pub fn attitude(&self, addr: &AgentAddr) -> f64 {
        self.attitudes.get(addr).copied().unwrap_or(0.0)
    }

    pub fn set_attitude(&mut self, addr: AgentAddr, value: f64) {
        self.attitudes.insert(addr, value.clamp(-1.0, 1.0));
    }

    // ---- resources ----------------------------------------------------

    /// Maximum resources per step; 0 means unlimited
    pub fn max_resources(&self) -> u32 {
        self.max_resources
    }

    pub fn cur_resources(&self) -> u32 {
        self.cur_resources
    }

    /// Lowering the maximum below current resources caps them
    pub fn set_max_resources(&mut self, value: u32) {
        self.max_resources = value;
        if self.cur_resources > self.max_resources {
            self.cur_resources = self.max_resources;
        }
    }

    /// Spend `amount` resources; always succeeds for unlimited agents
    pub fn spend_resources(&mut self, amount: u32) -> bool {
        if self.max_resources == 0 {
            return true;
        }
        if self.cur_resources < amount {
            return false;
        }
        self.cur_resources -= amount;
        true
    }

    /// Refill resources to the maximum
    pub fn refill(&mut self) {
        self.cur_resources = self.max_resources;
    }

    // ---- age and artifacts --------------------------------------------

    /// Number of times this agent has been triggered to act
    pub fn age(&self) -> u64 {
        self.age
    }

    pub(crate) fn bump_age(&mut self) {
        self.age += 1;
    }

    /// Artifacts created by this agent so far
    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn record_artifact(&mut self, artifact: Artifact) {
        self.artifacts.push(artifact);
    }
}
