// src/agent/registry.rs
//! Agent type registry.
//!
//! Environments spawn agents over RPC by type name. The registry maps each
//! name to a factory closure producing a boxed agent from an [`AgentCore`]
//! and JSON parameters. Names are registered once at node start; spawning an
//! unregistered name fails with [`AgoraError::UnknownAgentType`].
//!
//! [`AgoraError::UnknownAgentType`]: crate::utils::errors::AgoraError::UnknownAgentType

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::agent::builtin::NumberAgent;
use crate::agent::{Agent, AgentCore};
use crate::utils::errors::{AgoraError, Result};

/// Factory producing an agent from its core state and spawn parameters
pub type AgentFactory = dyn Fn(AgentCore, &Value) -> Result<Box<dyn Agent>> + Send + Sync;

/// Registry of named agent factories
pub struct AgentRegistry {
    factories: RwLock<HashMap<String, Arc<AgentFactory>>>,
}

impl AgentRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the built-in agent types registered
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("number", |core, params| {
            Ok(Box::new(NumberAgent::from_params(core, params)?))
        });
        registry
    }

    /// Register a factory under `name`, replacing any earlier registration
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(AgentCore, &Value) -> Result<Box<dyn Agent>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert(name.into(), Arc::new(factory));
    }

    /// Instantiate an agent of the given registered type
    pub fn create(&self, name: &str, core: AgentCore, params: &Value) -> Result<Box<dyn Agent>> {
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AgoraError::UnknownAgentType(name.to_string()))?;
        factory(core, params)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Registered type names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
