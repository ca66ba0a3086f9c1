// src/env/mod.rs
//! Environments: single-process containers, multi-process masters and
//! SSH-distributed coordinators.
//!
//! All three flavors expose the same stepping surface through the [`Env`]
//! trait so a [`Simulation`] can drive any of them.
//!
//! [`Simulation`]: crate::simulation::Simulation

pub mod distributed;
pub mod environment;
pub mod manager;
pub mod multi;
pub mod spawn;

pub use distributed::{DistributedEnvironment, NodeSpec, SpawnCmd};
pub use environment::{AgentConnections, EnvOptions, Environment, Proxy};
pub use manager::{EnvManager, MultiEnvManager};
pub use multi::MultiEnvironment;

use async_trait::async_trait;
use serde_json::Value;

use crate::addr::AgentAddr;
use crate::utils::errors::Result;

/// An address-zero RPC service mirroring its environment's operations
///
/// Managers execute whatever they are told to: there is no authentication
/// and no caller identity check. They are meant for trusted, closed
/// networks only.
#[async_trait]
pub trait Manager: Send + Sync {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value>;
}

/// Common surface of all environment flavors, as seen by a simulation
#[async_trait]
pub trait Env: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the environment (and all of its subordinates) is ready
    async fn is_ready(&self) -> bool;

    /// Addresses of all agents, managers excluded
    async fn get_agents(&self) -> Result<Vec<AgentAddr>>;

    /// Trigger a single agent to act
    async fn trigger_act(&self, addr: &AgentAddr, args: Value) -> Result<Value>;

    /// Trigger every agent to act concurrently and collect all results
    async fn trigger_all(&self, args: Value) -> Result<Vec<Value>>;

    /// Propagate the simulation age into the environment
    fn set_age(&self, age: u64);

    /// Tear the environment down, releasing its address and subordinates
    async fn close(&self) -> Result<()>;
}
