// src/env/environment.rs
//! The basic agent container.
//!
//! An [`Environment`] owns a set of agents, serves RPC for them on its TCP
//! address, and keeps the shared artifact and candidate lists. Index 0 of
//! every environment is the manager slot; agents are numbered from 1.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use once_cell::sync::OnceCell;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::addr::{AgentAddr, EnvAddr, MANAGER_INDEX};
use crate::agent::registry::AgentRegistry;
use crate::agent::{Agent, AgentCore, ConnectionInfo, ConnectionMap, EnvHandle, Evaluation};
use crate::artifact::Artifact;
use crate::env::{Env, Manager};
use crate::rpc::{server, Dispatcher, RpcClient};
use crate::utils::errors::{AgoraError, Result};

/// Timeout for calls made through a local [`Proxy`]
const LOCAL_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Options for creating an [`Environment`]
pub struct EnvOptions {
    /// Environment name; defaults to `host:port`
    pub name: Option<String>,

    /// Registry used when agents are spawned by type name
    pub registry: Arc<AgentRegistry>,

    /// Client used for outgoing calls to other environments
    pub rpc: RpcClient,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            name: None,
            registry: Arc::new(AgentRegistry::with_builtins()),
            rpc: RpcClient::default(),
        }
    }
}

/// A registered agent: its address, name and the behavior object
#[derive(Clone)]
pub struct AgentEntry {
    pub addr: AgentAddr,
    pub name: String,
    pub agent: Arc<tokio::sync::Mutex<Box<dyn Agent>>>,
}

/// Connections of one agent, as carried over the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConnections {
    pub addr: AgentAddr,
    pub connections: Vec<ConnectionInfo>,
}

pub struct Environment {
    name: String,
    addr: EnvAddr,
    registry: Arc<AgentRegistry>,
    rpc: RpcClient,
    agents: DashMap<u32, AgentEntry>,
    next_index: AtomicU32,
    manager: parking_lot::RwLock<Option<Arc<dyn Manager>>>,
    artifacts: parking_lot::RwLock<Vec<Artifact>>,
    candidates: parking_lot::RwLock<Vec<Artifact>>,
    age: AtomicU64,
    closed: AtomicBool,
    stop_tx: watch::Sender<bool>,
    self_ref: OnceCell<Weak<Environment>>,
}

impl Environment {
    /// Bind the listener and start serving RPC for this environment
    ///
    /// Passing port 0 binds an ephemeral port; the actual port is visible
    /// through [`Environment::addr`].
    pub async fn create(addr: EnvAddr, opts: EnvOptions) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr.host_port()).await?;
        let bound = EnvAddr::new(addr.host.clone(), listener.local_addr()?.port());
        let name = opts.name.unwrap_or_else(|| format!("{}:{}", bound.host, bound.port));

        let (stop_tx, stop_rx) = watch::channel(false);
        let env = Arc::new(Self {
            name,
            addr: bound,
            registry: opts.registry,
            rpc: opts.rpc,
            agents: DashMap::new(),
            next_index: AtomicU32::new(MANAGER_INDEX + 1),
            manager: parking_lot::RwLock::new(None),
            artifacts: parking_lot::RwLock::new(Vec::new()),
            candidates: parking_lot::RwLock::new(Vec::new()),
            age: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            stop_tx,
            self_ref: OnceCell::new(),
        });
        env.self_ref
            .set(Arc::downgrade(&env))
            .expect("self reference set twice");

        let dispatcher: Arc<dyn Dispatcher> = env.clone();
        tokio::spawn(server::serve(listener, dispatcher, stop_rx));

        info!(env = %env.name, addr = %env.addr, "environment serving");
        Ok(env)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address this environment is actually bound to
    pub fn addr(&self) -> &EnvAddr {
        &self.addr
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub(crate) fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    fn self_arc(&self) -> Arc<Environment> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("environment self reference lost")
    }

    /// Handle from agents back into this environment
    pub fn handle(&self) -> EnvHandle {
        EnvHandle::new(
            self.self_ref
                .get()
                .cloned()
                .unwrap_or_default(),
        )
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgoraError::EnvironmentClosed);
        }
        Ok(())
    }

    // ---- manager -------------------------------------------------------

    /// Install the manager serving agent index 0
    pub fn set_manager(&self, manager: Arc<dyn Manager>) {
        *self.manager.write() = Some(manager);
    }

    pub fn manager(&self) -> Option<Arc<dyn Manager>> {
        self.manager.read().clone()
    }

    /// Resolve once a manager receives a `stop` call or the environment is
    /// destroyed
    pub async fn wait_stopped(&self) {
        let mut rx = self.stop_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Ask the hosting process to shut this environment down
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    // ---- agents --------------------------------------------------------

    /// Spawn an agent built by `f` from its freshly assigned core
    pub fn spawn_with<F>(&self, name: Option<String>, resources: u32, f: F) -> Result<AgentAddr>
    where
        F: FnOnce(AgentCore) -> Box<dyn Agent>,
    {
        self.ensure_open()?;
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let addr = self.addr.agent(index);
        let core = AgentCore::new(addr.clone(), name, self.handle(), resources);
        let agent = f(core);
        let entry = AgentEntry {
            addr: addr.clone(),
            name: agent.core().name().to_string(),
            agent: Arc::new(tokio::sync::Mutex::new(agent)),
        };
        self.agents.insert(index, entry);
        counter!("agora_agents_spawned_total").increment(1);
        debug!(env = %self.name, agent = %addr, "agent spawned");
        Ok(addr)
    }

    /// Spawn an agent of a registered type
    ///
    /// The standard parameter keys `name` and `resources` are applied to
    /// the agent's core; everything else is interpreted by the factory.
    pub fn spawn(&self, type_name: &str, params: &Value) -> Result<AgentAddr> {
        self.ensure_open()?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let resources = params
            .get("resources")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let addr = self.addr.agent(index);
        let core = AgentCore::new(addr.clone(), name, self.handle(), resources);
        let agent = self.registry.create(type_name, core, params)?;
        let entry = AgentEntry {
            addr: addr.clone(),
            name: agent.core().name().to_string(),
            agent: Arc::new(tokio::sync::Mutex::new(agent)),
        };
        self.agents.insert(index, entry);
        counter!("agora_agents_spawned_total").increment(1);
        debug!(env = %self.name, agent = %addr, type_name, "agent spawned");
        Ok(addr)
    }

    /// Spawn `n` agents of a registered type with identical parameters
    pub fn spawn_n(&self, type_name: &str, n: usize, params: &Value) -> Result<Vec<AgentAddr>> {
        let mut addrs = Vec::with_capacity(n);
        for _ in 0..n {
            addrs.push(self.spawn(type_name, params)?);
        }
        Ok(addrs)
    }

    /// Addresses of all agents in this environment, sorted
    ///
    /// The manager slot is never included.
    pub fn agent_addrs(&self) -> Vec<AgentAddr> {
        let mut addrs: Vec<AgentAddr> = self.agents.iter().map(|e| e.value().addr.clone()).collect();
        addrs.sort();
        addrs
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Look up an agent entry by address
    pub fn get_agent(&self, addr: &AgentAddr) -> Option<AgentEntry> {
        if !self.is_local(addr) {
            return None;
        }
        self.agents.get(&addr.index).map(|e| e.value().clone())
    }

    /// Whether `addr` points into this environment
    pub fn is_local(&self, addr: &AgentAddr) -> bool {
        addr.port == self.addr.port && (addr.host == self.addr.host || is_loopback_pair(&addr.host, &self.addr.host))
    }

    /// A random agent address different from `exclude`
    pub fn random_agent(&self, exclude: &AgentAddr) -> Option<AgentAddr> {
        let addrs: Vec<AgentAddr> = self
            .agent_addrs()
            .into_iter()
            .filter(|a| a != exclude)
            .collect();
        addrs.choose(&mut rand::thread_rng()).cloned()
    }

    /// Give every agent `n` random connections to distinct peers
    ///
    /// When fewer than `n` other agents exist, each agent is connected to
    /// all of them.
    pub async fn create_random_connections(&self, n: usize) -> Result<()> {
        let addrs = self.agent_addrs();
        for addr in &addrs {
            let mut others: Vec<AgentAddr> =
                addrs.iter().filter(|a| *a != addr).cloned().collect();
            others.shuffle(&mut rand::thread_rng());
            others.truncate(n);

            let entry = self
                .get_agent(addr)
                .ok_or_else(|| AgoraError::UnknownAgent(addr.to_string()))?;
            let mut agent = entry.agent.lock().await;
            for other in others {
                agent.core_mut().add_connection(other, Value::Null);
            }
        }
        Ok(())
    }

    /// Create the connections listed for agents of this environment
    ///
    /// Entries for agents living elsewhere are ignored; the caller fans the
    /// same map out to every environment involved.
    pub async fn create_connections(
        &self,
        map: &ConnectionMap,
    ) -> Result<Vec<(AgentAddr, Vec<bool>)>> {
        let mut results = Vec::new();
        for (addr, conns) in map {
            let Some(entry) = self.get_agent(addr) else {
                continue;
            };
            let mut agent = entry.agent.lock().await;
            let added = agent.core_mut().add_connections(conns.clone());
            results.push((addr.clone(), added));
        }
        Ok(results)
    }

    /// Connections of every agent in this environment
    ///
    /// With `data == false` the per-connection annotations are omitted.
    pub async fn get_connections(&self, data: bool) -> Vec<AgentConnections> {
        let mut results = Vec::new();
        for addr in self.agent_addrs() {
            let Some(entry) = self.get_agent(&addr) else {
                continue;
            };
            let agent = entry.agent.lock().await;
            let mut connections = agent.core().connections();
            if !data {
                for conn in &mut connections {
                    conn.data = Value::Null;
                }
            }
            results.push(AgentConnections { addr, connections });
        }
        results
    }

    // ---- triggering ----------------------------------------------------

    /// Connect to an agent, locally when it lives here, over TCP otherwise
    pub fn connect(&self, addr: &AgentAddr) -> Proxy {
        if self.is_local(addr) {
            Proxy::Local {
                env: self.self_arc(),
                index: addr.index,
                timeout: LOCAL_CALL_TIMEOUT,
            }
        } else {
            Proxy::Remote {
                addr: addr.clone(),
                rpc: self.rpc.clone(),
            }
        }
    }

    /// Trigger the agent at `addr` to act once
    pub async fn trigger_act(&self, addr: &AgentAddr, args: Value) -> Result<Value> {
        self.ensure_open()?;
        self.connect(addr).act(args).await
    }

    /// Trigger all local agents concurrently and await every result
    ///
    /// Arguments are passed to each agent verbatim. Managers do not act.
    /// An agent that synchronously calls into a peer while that peer is
    /// acting is only safe here because peer calls are bounded by the
    /// opinion timeout; long chains of mutual calls belong in sequential
    /// stepping.
    pub async fn trigger_all(&self, args: Value) -> Result<Vec<Value>> {
        self.ensure_open()?;
        let entries: Vec<AgentEntry> = self.agents.iter().map(|e| e.value().clone()).collect();
        let tasks = entries.iter().map(|entry| {
            let args = args.clone();
            async move { dispatch_agent(entry, "act", args).await }
        });
        let results = futures::future::join_all(tasks).await;
        results.into_iter().collect()
    }

    /// Whether this environment is serving
    pub fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    // ---- artifacts and candidates --------------------------------------

    pub fn age(&self) -> u64 {
        self.age.load(Ordering::SeqCst)
    }

    pub fn set_age(&self, age: u64) {
        self.age.store(age, Ordering::SeqCst);
    }

    /// Add a published artifact, stamping it with the current age
    pub fn add_artifact(&self, mut artifact: Artifact) {
        artifact.set_env_time(self.age());
        debug!(env = %self.name, creator = artifact.creator(), "artifact published");
        counter!("agora_artifacts_total").increment(1);
        self.artifacts.write().push(artifact);
    }

    pub fn add_artifacts(&self, artifacts: impl IntoIterator<Item = Artifact>) {
        for artifact in artifacts {
            self.add_artifact(artifact);
        }
    }

    /// All published artifacts, optionally only those of one creator
    pub fn get_artifacts(&self, creator: Option<&str>) -> Vec<Artifact> {
        let artifacts = self.artifacts.read();
        match creator {
            Some(creator) => artifacts
                .iter()
                .filter(|a| a.creator() == creator)
                .cloned()
                .collect(),
            None => artifacts.clone(),
        }
    }

    /// Append an artifact to the pending candidate list
    pub fn add_candidate(&self, artifact: Artifact) {
        debug!(env = %self.name, creator = artifact.creator(), "candidate added");
        self.candidates.write().push(artifact);
    }

    pub fn candidates(&self) -> Vec<Artifact> {
        self.candidates.read().clone()
    }

    pub fn clear_candidates(&self) {
        self.candidates.write().clear();
    }

    // ---- teardown ------------------------------------------------------

    /// Destroy the environment: close every agent, stop serving and
    /// release the address
    pub async fn destroy(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(env = %self.name, "destroying environment");

        let entries: Vec<AgentEntry> = self.agents.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            let mut agent = entry.agent.lock().await;
            if let Err(e) = agent.close().await {
                warn!(agent = %entry.addr, "agent close failed: {}", e);
            }
        }
        self.agents.clear();
        *self.manager.write() = None;
        self.stop_tx.send_replace(true);
        Ok(())
    }
}

// Loopback aliases refer to the same listener.
fn is_loopback_pair(a: &str, b: &str) -> bool {
    let loopback = |h: &str| h == "localhost" || h == "127.0.0.1";
    loopback(a) && loopback(b)
}

/// Dispatch one of the standard agent methods, or hand the call to the
/// agent's own [`Agent::handle`].
async fn dispatch_agent(entry: &AgentEntry, method: &str, params: Value) -> Result<Value> {
    let mut agent = entry.agent.lock().await;
    match method {
        "act" => {
            agent.core_mut().bump_age();
            agent.act(params).await
        }
        "evaluate" => {
            let artifact: Artifact = serde_json::from_value(params)?;
            let evaluation = agent.evaluate(&artifact).await?;
            Ok(serde_json::to_value(evaluation)?)
        }
        "add_connection" => {
            let conn: ConnectionInfo = serde_json::from_value(params)?;
            let added = agent.core_mut().add_connection(conn.addr, conn.data);
            Ok(Value::Bool(added))
        }
        "add_connections" => {
            let conns: Vec<ConnectionInfo> = serde_json::from_value(params)?;
            let added = agent.core_mut().add_connections(conns);
            Ok(serde_json::to_value(added)?)
        }
        "remove_connection" => {
            let conn: ConnectionInfo = serde_json::from_value(params)?;
            let removed = agent.core_mut().remove_connection(&conn.addr);
            Ok(serde_json::to_value(removed)?)
        }
        "clear_connections" => {
            agent.core_mut().clear_connections();
            Ok(Value::Null)
        }
        "get_connections" => {
            let data = params
                .get("data")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if data {
                Ok(serde_json::to_value(agent.core().connections())?)
            } else {
                Ok(serde_json::to_value(agent.core().connection_addrs())?)
            }
        }
        "artifacts" => Ok(serde_json::to_value(agent.core().artifacts())?),
        "close" => {
            agent.close().await?;
            Ok(Value::Null)
        }
        _ => agent.handle(method, params).await,
    }
}

#[async_trait]
impl Dispatcher for Environment {
    async fn dispatch(&self, target: u32, method: &str, params: Value) -> Result<Value> {
        self.ensure_open()?;
        if target == MANAGER_INDEX {
            let manager = self.manager().ok_or(AgoraError::NoManager)?;
            return manager.dispatch(method, params).await;
        }
        let entry = self
            .agents
            .get(&target)
            .map(|e| e.value().clone())
            .ok_or_else(|| AgoraError::UnknownAgent(self.addr.agent(target).to_string()))?;
        dispatch_agent(&entry, method, params).await
    }
}

/// A connection to a single agent, local or remote
///
/// Local proxies short-circuit the network and dispatch straight into the
/// environment; remote proxies open one TCP connection per call.
pub enum Proxy {
    Local {
        env: Arc<Environment>,
        index: u32,
        timeout: Duration,
    },
    Remote {
        addr: AgentAddr,
        rpc: RpcClient,
    },
}

impl Proxy {
    /// Call an arbitrary method on the agent
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        match self {
            Proxy::Local {
                env,
                index,
                timeout,
            } => {
                let fut = Dispatcher::dispatch(env.as_ref(), *index, method, params);
                match tokio::time::timeout(*timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(AgoraError::Timeout(env.addr().agent(*index).to_string())),
                }
            }
            Proxy::Remote { addr, rpc } => rpc.call(addr, method, params).await,
        }
    }

    /// Call with an explicit deadline
    pub async fn call_timeout(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value> {
        let target = self.target();
        match tokio::time::timeout(deadline, self.call(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(AgoraError::Timeout(target)),
        }
    }

    /// Trigger the agent to act
    pub async fn act(&self, args: Value) -> Result<Value> {
        self.call("act", args).await
    }

    /// Ask the agent to evaluate an artifact
    pub async fn evaluate(&self, artifact: &Artifact) -> Result<Evaluation> {
        let result = self
            .call("evaluate", serde_json::to_value(artifact)?)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    fn target(&self) -> String {
        match self {
            Proxy::Local { env, index, .. } => env.addr().agent(*index).to_string(),
            Proxy::Remote { addr, .. } => addr.to_string(),
        }
    }
}

#[async_trait]
impl Env for Environment {
    fn name(&self) -> &str {
        self.name()
    }

    async fn is_ready(&self) -> bool {
        Environment::is_ready(self)
    }

    async fn get_agents(&self) -> Result<Vec<AgentAddr>> {
        Ok(self.agent_addrs())
    }

    async fn trigger_act(&self, addr: &AgentAddr, args: Value) -> Result<Value> {
        Environment::trigger_act(self, addr, args).await
    }

    async fn trigger_all(&self, args: Value) -> Result<Vec<Value>> {
        Environment::trigger_all(self, args).await
    }

    fn set_age(&self, age: u64) {
        Environment::set_age(self, age)
    }

    async fn close(&self) -> Result<()> {
        self.destroy().await
    }
}
