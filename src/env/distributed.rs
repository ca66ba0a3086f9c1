// src/env/distributed.rs
//! Environments spanning multiple machines.
//!
//! A [`DistributedEnvironment`] spawns one multi-environment node per remote
//! host over SSH, waits until the node managers answer, and relays
//! trigger/spawn/connection commands across all of them. Spawning assumes
//! passwordless SSH access to every node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Child;
use tracing::info;

use crate::addr::{sort_addrs, AgentAddr, EnvAddr};
use crate::agent::ConnectionMap;
use crate::artifact::Artifact;
use crate::env::environment::{AgentConnections, EnvOptions};
use crate::env::multi::MultiEnvironment;
use crate::env::{spawn, Env};
use crate::utils::errors::{AgoraError, Result};

/// One remote machine a node is spawned on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    /// Host name of the machine, also used in the node's manager address
    pub host: String,

    /// SSH port to reach the machine on
    pub ssh_port: u16,
}

impl NodeSpec {
    pub fn new(host: impl Into<String>, ssh_port: u16) -> Self {
        Self {
            host: host.into(),
            ssh_port,
        }
    }
}

/// Command line(s) used to start the node process on each machine
#[derive(Debug, Clone)]
pub enum SpawnCmd {
    /// The same command for every node
    Same(String),

    /// One command per node, in node order
    PerNode(Vec<String>),
}

impl SpawnCmd {
    fn for_node(&self, index: usize, nodes: usize) -> Result<&str> {
        match self {
            SpawnCmd::Same(cmd) => Ok(cmd),
            SpawnCmd::PerNode(cmds) => {
                if cmds.len() != nodes {
                    return Err(AgoraError::SpawnFailed(format!(
                        "{} spawn commands given for {} nodes",
                        cmds.len(),
                        nodes
                    )));
                }
                Ok(&cmds[index])
            }
        }
    }
}

/// Coordinator for multi-environment nodes on remote machines
pub struct DistributedEnvironment {
    multi: Arc<MultiEnvironment>,
    nodes: Vec<NodeSpec>,
    node_port: u16,
    ssh_children: tokio::sync::Mutex<Vec<Child>>,
    closed: AtomicBool,
}

impl DistributedEnvironment {
    /// Create the coordinator's own master environment
    ///
    /// `addr` is the address of this (coordinating) machine; its port also
    /// serves as the default port the node managers are expected on.
    pub async fn create(
        addr: EnvAddr,
        nodes: Vec<NodeSpec>,
        opts: EnvOptions,
    ) -> Result<Arc<Self>> {
        let node_port = addr.port;
        let multi = MultiEnvironment::create(addr, opts).await?;
        let denv = Arc::new(Self {
            multi,
            nodes,
            node_port,
            ssh_children: tokio::sync::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        info!(
            denv = %denv.multi.name(),
            nodes = denv.nodes.len(),
            "distributed environment created"
        );
        Ok(denv)
    }

    /// The remote machines this environment coordinates
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    /// The underlying multi-environment doing the relaying
    pub fn multi(&self) -> &Arc<MultiEnvironment> {
        &self.multi
    }

    /// Addresses of the node managers (one multi-environment per machine)
    pub fn node_managers(&self) -> Vec<AgentAddr> {
        self.multi.slave_managers()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgoraError::EnvironmentClosed);
        }
        Ok(())
    }

    /// Spawn the node processes over SSH
    ///
    /// Each node's manager address is derived as `tcp://<host>:<port>/0`,
    /// with the port taken from `ports` or defaulting to this
    /// environment's own port. The SSH connections stay open until the
    /// nodes are stopped.
    pub async fn spawn_nodes(
        &self,
        cmd: &SpawnCmd,
        ports: Option<&HashMap<String, u16>>,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut children = self.ssh_children.lock().await;
        for (i, node) in self.nodes.iter().enumerate() {
            let port = ports
                .and_then(|p| p.get(&node.host).copied())
                .unwrap_or(self.node_port);
            let manager = EnvAddr::new(node.host.clone(), port).manager();
            self.multi.add_slave(manager);

            let command = cmd.for_node(i, self.nodes.len())?;
            let child = spawn::spawn_ssh_process(&node.host, node.ssh_port, command)?;
            children.push(child);
        }
        Ok(())
    }

    /// Wait until all node managers answer (and report ready)
    ///
    /// Should be called after [`spawn_nodes`]; returns `false` on timeout.
    ///
    /// [`spawn_nodes`]: DistributedEnvironment::spawn_nodes
    pub async fn wait_nodes(&self, timeout: Duration, check_ready: bool) -> Result<bool> {
        self.multi.wait_slaves(timeout, check_ready).await
    }

    /// Addresses of the true slave environment managers on every node
    ///
    /// A coordinator with two nodes of four slave environments each gets
    /// eight addresses back.
    pub async fn slave_managers(&self) -> Result<Vec<AgentAddr>> {
        self.ensure_open()?;
        let managers = self.node_managers();
        let calls = managers.iter().map(|addr| {
            self.multi
                .env()
                .rpc()
                .call(addr, "get_slave_managers", Value::Null)
        });
        let results = futures::future::join_all(calls)
            .await
            .into_iter()
            .collect::<Result<Vec<Value>>>()?;
        let mut addrs = Vec::new();
        for value in results {
            let part: Vec<AgentAddr> = serde_json::from_value(value)?;
            addrs.extend(part);
        }
        Ok(sort_addrs(addrs))
    }

    /// Addresses of all agents on all nodes
    pub async fn get_agents(&self) -> Result<Vec<AgentAddr>> {
        self.multi.get_agents().await
    }

    /// Trigger all agents on all nodes to act
    pub async fn trigger_all(&self, args: Value) -> Result<Vec<Value>> {
        self.multi.trigger_all(args).await
    }

    /// Spawn an agent on some node (the least loaded one by default)
    pub async fn spawn(
        &self,
        type_name: &str,
        params: &Value,
        target: Option<AgentAddr>,
    ) -> Result<AgentAddr> {
        self.multi.spawn(type_name, params, target).await
    }

    /// Create agent connections across all nodes
    pub async fn create_connections(
        &self,
        map: &ConnectionMap,
    ) -> Result<Vec<(AgentAddr, Vec<bool>)>> {
        self.multi.create_connections(map).await
    }

    /// Connections of every agent on every node
    pub async fn get_connections(&self, data: bool) -> Result<Vec<AgentConnections>> {
        self.multi.get_connections(data).await
    }

    pub fn get_artifacts(&self, creator: Option<&str>) -> Vec<Artifact> {
        self.multi.get_artifacts(creator)
    }

    pub fn add_artifact(&self, artifact: Artifact) {
        self.multi.add_artifact(artifact)
    }

    /// Destroy the distributed environment
    ///
    /// Sends `stop` to the node managers, destroys the coordinating
    /// environment and terminates the SSH children. Skipping this leaves
    /// rogue node processes running on the remote machines.
    pub async fn destroy(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(denv = %self.multi.name(), "destroying distributed environment");
        let result = self.multi.destroy().await;

        let mut children = self.ssh_children.lock().await;
        for child in children.iter_mut() {
            spawn::terminate(child, spawn::TERMINATE_GRACE).await;
        }
        children.clear();
        result
    }
}

#[async_trait]
impl Env for DistributedEnvironment {
    fn name(&self) -> &str {
        self.multi.name()
    }

    async fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.multi.is_ready().await
    }

    async fn get_agents(&self) -> Result<Vec<AgentAddr>> {
        DistributedEnvironment::get_agents(self).await
    }

    async fn trigger_act(&self, addr: &AgentAddr, args: Value) -> Result<Value> {
        self.multi.trigger_act(addr, args).await
    }

    async fn trigger_all(&self, args: Value) -> Result<Vec<Value>> {
        DistributedEnvironment::trigger_all(self, args).await
    }

    fn set_age(&self, age: u64) {
        self.multi.set_age(age)
    }

    async fn close(&self) -> Result<()> {
        self.destroy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_cmd_same() {
        let cmd = SpawnCmd::Same("agora node --addr tcp://n:5555".to_string());
        assert_eq!(cmd.for_node(0, 3).unwrap(), "agora node --addr tcp://n:5555");
        assert_eq!(cmd.for_node(2, 3).unwrap(), "agora node --addr tcp://n:5555");
    }

    #[test]
    fn test_spawn_cmd_per_node() {
        let cmd = SpawnCmd::PerNode(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cmd.for_node(1, 2).unwrap(), "b");
        assert!(cmd.for_node(0, 3).is_err());
    }
}
