// src/env/multi.rs
//! Multi-process environments.
//!
//! A [`MultiEnvironment`] is a master [`Environment`] plus a set of slave
//! environments running in their own processes. Each slave carries an
//! [`EnvManager`] at index 0; the master relays commands to the slave
//! managers and merges their results.
//!
//! [`EnvManager`]: crate::env::manager::EnvManager

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::addr::{sort_addrs, AgentAddr, EnvAddr};
use crate::artifact::Artifact;
use crate::env::environment::{AgentConnections, EnvOptions, Environment};
use crate::env::manager::MultiEnvManager;
use crate::env::{spawn, Env};
use crate::agent::ConnectionMap;
use crate::utils::errors::{AgoraError, Result};

/// Interval between readiness polls while waiting for slaves
const READY_POLL: Duration = Duration::from_millis(500);

/// Environment for utilizing multiple processes on a single machine
///
/// The master environment typically contains only the
/// [`MultiEnvManager`]; the actual simulation agents live in the slave
/// environments and are reached through their managers.
pub struct MultiEnvironment {
    name: String,
    env: Arc<Environment>,
    slave_managers: parking_lot::RwLock<Vec<AgentAddr>>,
    children: tokio::sync::Mutex<Vec<Child>>,
    artifacts: parking_lot::RwLock<Vec<Artifact>>,
    age: AtomicU64,
    closed: AtomicBool,
}

impl MultiEnvironment {
    /// Create the master environment and install its manager
    pub async fn create(addr: EnvAddr, opts: EnvOptions) -> Result<Arc<Self>> {
        let name = opts
            .name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", addr.host, addr.port));
        let env = Environment::create(addr, opts).await?;

        let menv = Arc::new(Self {
            name,
            env,
            slave_managers: parking_lot::RwLock::new(Vec::new()),
            children: tokio::sync::Mutex::new(Vec::new()),
            artifacts: parking_lot::RwLock::new(Vec::new()),
            age: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        MultiEnvManager::attach(&menv);

        info!(menv = %menv.name, addr = %menv.env.addr(), "multi-environment created");
        Ok(menv)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The master environment hosting this multi-environment's manager
    ///
    /// It is also used, manager aside, to talk to the slave managers.
    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Address of this multi-environment's own manager
    pub fn manager_addr(&self) -> AgentAddr {
        self.env.addr().manager()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgoraError::EnvironmentClosed);
        }
        Ok(())
    }

    // ---- slaves --------------------------------------------------------

    /// Spawn one slave environment process per address
    ///
    /// Each slave is the current binary re-executed with the `env`
    /// subcommand; its manager address is recorded for relaying.
    pub async fn spawn_slaves(&self, slave_addrs: &[EnvAddr]) -> Result<()> {
        self.ensure_open()?;
        let mut children = self.children.lock().await;
        for addr in slave_addrs {
            let args = vec![
                "env".to_string(),
                "--addr".to_string(),
                addr.to_string(),
            ];
            let child = spawn::spawn_node_process(&args)?;
            children.push(child);
            self.slave_managers.write().push(addr.manager());
        }
        Ok(())
    }

    /// Attach an already running slave by its manager address
    ///
    /// Used when the slave process is started by other means, e.g. by a
    /// distributed coordinator over SSH.
    pub fn add_slave(&self, manager_addr: AgentAddr) {
        self.slave_managers.write().push(manager_addr);
    }

    /// Addresses of the slave environment managers
    pub fn slave_managers(&self) -> Vec<AgentAddr> {
        self.slave_managers.read().clone()
    }

    /// Wait until all slaves are online, or `timeout` expires
    ///
    /// A slave is online once its manager answers; with `check_ready` it
    /// must also report `is_ready`. Returns `false` on timeout so the
    /// caller can decide whether to tear down or keep waiting.
    pub async fn wait_slaves(&self, timeout: Duration, check_ready: bool) -> Result<bool> {
        self.ensure_open()?;
        let status = if check_ready { "ready" } else { "online" };
        debug!(menv = %self.name, "waiting for slaves to become {}", status);

        let started = Instant::now();
        let addrs = self.slave_managers();
        let mut online: HashSet<AgentAddr> = HashSet::new();

        while online.len() < addrs.len() {
            if started.elapsed() > timeout {
                warn!(menv = %self.name, "timeout while waiting for slaves to become {}", status);
                return Ok(false);
            }
            for addr in &addrs {
                if online.contains(addr) {
                    continue;
                }
                match self.env.rpc().call(addr, "is_ready", Value::Null).await {
                    Ok(value) => {
                        if !check_ready || value == Value::Bool(true) {
                            online.insert(addr.clone());
                            debug!(
                                menv = %self.name,
                                slave = %addr,
                                "slave {}/{} {}",
                                online.len(),
                                addrs.len(),
                                status
                            );
                        }
                    }
                    Err(_) => {
                        // Not up yet; keep polling until the deadline.
                    }
                }
            }
            if online.len() < addrs.len() {
                tokio::time::sleep(READY_POLL).await;
            }
        }
        debug!(
            menv = %self.name,
            "all slaves {} in {:.3}s",
            status,
            started.elapsed().as_secs_f64()
        );
        Ok(true)
    }

    /// Whether the master and every slave environment is ready
    pub async fn is_ready(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) || !self.env.is_ready() {
            return false;
        }
        let addrs = self.slave_managers();
        let checks = addrs.iter().map(|addr| async move {
            matches!(
                self.env.rpc().call(addr, "is_ready", Value::Null).await,
                Ok(Value::Bool(true))
            )
        });
        futures::future::join_all(checks).await.into_iter().all(|r| r)
    }

    /// Call `method` on every slave manager concurrently
    async fn fan_out(&self, method: &str, params: Value) -> Result<Vec<Value>> {
        self.ensure_open()?;
        let addrs = self.slave_managers();
        let calls = addrs.iter().map(|addr| {
            let params = params.clone();
            async move { self.env.rpc().call(addr, method, params).await }
        });
        futures::future::join_all(calls).await.into_iter().collect()
    }

    // ---- relayed operations --------------------------------------------

    /// Addresses of all agents in all slave environments, sorted
    pub async fn get_agents(&self) -> Result<Vec<AgentAddr>> {
        let results = self.fan_out("get_agents", Value::Null).await?;
        let mut agents = Vec::new();
        for value in results {
            let addrs: Vec<AgentAddr> = serde_json::from_value(value)?;
            agents.extend(addrs);
        }
        Ok(sort_addrs(agents))
    }

    /// Trigger all agents in all slave environments and flatten the results
    pub async fn trigger_all(&self, args: Value) -> Result<Vec<Value>> {
        let results = self
            .fan_out("trigger_all", json!({ "args": args }))
            .await?;
        let mut flattened = Vec::new();
        for value in results {
            match value {
                Value::Array(items) => flattened.extend(items),
                other => flattened.push(other),
            }
        }
        Ok(flattened)
    }

    /// Trigger one agent, wherever it lives
    pub async fn trigger_act(&self, addr: &AgentAddr, args: Value) -> Result<Value> {
        self.ensure_open()?;
        self.env.trigger_act(addr, args).await
    }

    /// Manager of the slave environment currently holding the fewest agents
    async fn smallest_slave(&self) -> Result<AgentAddr> {
        let addrs = self.slave_managers();
        if addrs.is_empty() {
            return Err(AgoraError::NoSlaves);
        }
        let counts = self.fan_out("get_agents", Value::Null).await?;
        let mut best: Option<(usize, &AgentAddr)> = None;
        for (addr, value) in addrs.iter().zip(counts.iter()) {
            let count = value.as_array().map(Vec::len).unwrap_or(usize::MAX);
            if best.map_or(true, |(c, _)| count < c) {
                best = Some((count, addr));
            }
        }
        Ok(best.expect("at least one slave").1.clone())
    }

    /// Spawn an agent into a slave environment
    ///
    /// Without an explicit `target` manager the least loaded slave is
    /// chosen.
    pub async fn spawn(
        &self,
        type_name: &str,
        params: &Value,
        target: Option<AgentAddr>,
    ) -> Result<AgentAddr> {
        let manager = match target {
            Some(addr) => addr,
            None => self.smallest_slave().await?,
        };
        let result = self
            .env
            .rpc()
            .call(
                &manager,
                "spawn",
                json!({ "type": type_name, "params": params }),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Spawn `n` identically parameterized agents into one slave
    pub async fn spawn_n(
        &self,
        type_name: &str,
        n: usize,
        params: &Value,
        target: Option<AgentAddr>,
    ) -> Result<Vec<AgentAddr>> {
        let manager = match target {
            Some(addr) => addr,
            None => self.smallest_slave().await?,
        };
        let result = self
            .env
            .rpc()
            .call(
                &manager,
                "spawn_n",
                json!({ "type": type_name, "n": n, "params": params }),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Point the slave manager at `addr` back at this master's manager
    pub async fn set_host_manager(&self, addr: &AgentAddr) -> Result<()> {
        self.ensure_open()?;
        self.env
            .rpc()
            .call(
                addr,
                "set_host_manager",
                json!({ "addr": self.manager_addr() }),
            )
            .await?;
        Ok(())
    }

    /// Make this master's manager the host manager of every slave
    ///
    /// This is what lets slave managers report back upstream.
    pub async fn set_host_managers(&self) -> Result<()> {
        let addrs = self.slave_managers();
        let calls = addrs.iter().map(|addr| self.set_host_manager(addr));
        futures::future::join_all(calls)
            .await
            .into_iter()
            .collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    /// Create connections for agents across all slave environments
    ///
    /// The whole map is sent to every slave; each slave applies the
    /// entries for its own agents.
    pub async fn create_connections(
        &self,
        map: &ConnectionMap,
    ) -> Result<Vec<(AgentAddr, Vec<bool>)>> {
        let results = self
            .fan_out("create_connections", serde_json::to_value(map)?)
            .await?;
        let mut merged = Vec::new();
        for value in results {
            let part: Vec<(AgentAddr, Vec<bool>)> = serde_json::from_value(value)?;
            merged.extend(part);
        }
        Ok(merged)
    }

    /// Connections of every agent in every slave environment
    pub async fn get_connections(&self, data: bool) -> Result<Vec<AgentConnections>> {
        let results = self
            .fan_out("get_connections", json!({ "data": data }))
            .await?;
        let mut merged = Vec::new();
        for value in results {
            let part: Vec<AgentConnections> = serde_json::from_value(value)?;
            merged.extend(part);
        }
        Ok(merged)
    }

    // ---- artifacts -----------------------------------------------------

    pub fn age(&self) -> u64 {
        self.age.load(Ordering::SeqCst)
    }

    pub fn set_age(&self, age: u64) {
        self.age.store(age, Ordering::SeqCst);
        self.env.set_age(age);
    }

    /// Add an artifact to the multi-environment's shared list
    pub fn add_artifact(&self, mut artifact: Artifact) {
        artifact.set_env_time(self.age());
        debug!(menv = %self.name, creator = artifact.creator(), "artifact added");
        self.artifacts.write().push(artifact);
    }

    pub fn add_artifacts(&self, artifacts: impl IntoIterator<Item = Artifact>) {
        for artifact in artifacts {
            self.add_artifact(artifact);
        }
    }

    /// All artifacts, optionally filtered by creator
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

    // ---- teardown ------------------------------------------------------

    /// Send `stop` to every slave manager; failures are logged, not fatal
    pub async fn stop_slaves(&self) {
        for addr in self.slave_managers() {
            if let Err(e) = self.env.rpc().call(&addr, "stop", Value::Null).await {
                warn!(menv = %self.name, slave = %addr, "could not stop slave: {}", e);
            }
        }
    }

    /// Resolve once this multi-environment's manager receives `stop`
    pub async fn wait_stopped(&self) {
        self.env.wait_stopped().await;
    }

    /// Destroy the multi-environment and its slaves
    pub async fn destroy(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(menv = %self.name, "destroying multi-environment");
        self.stop_slaves().await;

        let mut children = self.children.lock().await;
        for child in children.iter_mut() {
            spawn::terminate(child, spawn::TERMINATE_GRACE).await;
        }
        children.clear();

        self.env.destroy().await
    }
}

#[async_trait]
impl Env for MultiEnvironment {
    fn name(&self) -> &str {
        self.name()
    }

    async fn is_ready(&self) -> bool {
        MultiEnvironment::is_ready(self).await
    }

    async fn get_agents(&self) -> Result<Vec<AgentAddr>> {
        MultiEnvironment::get_agents(self).await
    }

    async fn trigger_act(&self, addr: &AgentAddr, args: Value) -> Result<Value> {
        MultiEnvironment::trigger_act(self, addr, args).await
    }

    async fn trigger_all(&self, args: Value) -> Result<Vec<Value>> {
        MultiEnvironment::trigger_all(self, args).await
    }

    fn set_age(&self, age: u64) {
        MultiEnvironment::set_age(self, age)
    }

    async fn close(&self) -> Result<()> {
        self.destroy().await
    }
}
