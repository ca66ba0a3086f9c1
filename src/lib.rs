// src/lib.rs
//! Agora — distributed multi-agent environments and simulations.
//!
//! Agents live in [`Environment`]s addressed as `tcp://host:port/index`.
//! Several environments can be combined into a [`MultiEnvironment`] (one
//! master process, slave environments in subprocesses) and several
//! multi-environments into a [`DistributedEnvironment`] spanning machines
//! over SSH. A [`Simulation`] steps any of them.
//!
//! # Architecture
//!
//! - **addr**: the `tcp://host:port/index` addressing scheme
//! - **agent**: the `Agent` trait, shared agent state, the type registry
//! - **artifact**: payload wrappers with evaluations and framings
//! - **rpc**: length-prefixed JSON RPC between environments
//! - **env**: environments, managers, multi-process and distributed masters
//! - **simulation**: synchronous and concurrent stepping
//! - **observability**: tracing and metrics initialization
//! - **utils**: errors and configuration
//!
//! [`Environment`]: env::Environment
//! [`MultiEnvironment`]: env::MultiEnvironment
//! [`DistributedEnvironment`]: env::DistributedEnvironment
//! [`Simulation`]: simulation::Simulation

// Public module exports
pub mod addr;
pub mod agent;
pub mod artifact;
pub mod env;
pub mod observability;
pub mod rpc;
pub mod simulation;
pub mod utils;

// Re-export commonly used types
pub use addr::{AgentAddr, EnvAddr};
pub use agent::registry::AgentRegistry;
pub use agent::{Agent, AgentCore, Evaluation};
pub use artifact::Artifact;
pub use env::{
    DistributedEnvironment, EnvManager, EnvOptions, Environment, MultiEnvManager,
    MultiEnvironment,
};
pub use rpc::RpcClient;
pub use simulation::{Simulation, StepOrder};
pub use utils::config::NodeConfig;
pub use utils::errors::{AgoraError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
