// src/env/manager.rs
//! Manager agents: the address-zero RPC services of environments.
//!
//! An [`EnvManager`] fronts a slave [`Environment`]; a [`MultiEnvManager`]
//! fronts a [`MultiEnvironment`] master. Both expose pass-through mirrors of
//! their environment's operations so remote masters can drive them.
//!
//! Managers do not check who gives them orders: any caller that can reach
//! the address can execute the full method set.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::addr::AgentAddr;
use crate::agent::ConnectionMap;
use crate::env::environment::Environment;
use crate::env::multi::MultiEnvironment;
use crate::env::Manager;
use crate::utils::errors::{AgoraError, Result};

#[derive(Debug, Deserialize)]
struct SpawnParams {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    n: Option<usize>,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct AddrParams {
    addr: AgentAddr,
}

#[derive(Debug, Deserialize, Default)]
struct TriggerParams {
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize, Default)]
struct DataParams {
    #[serde(default)]
    data: bool,
}

fn trigger_args(params: Value) -> Result<Value> {
    if params.is_null() {
        return Ok(Value::Null);
    }
    let parsed: TriggerParams = serde_json::from_value(params)?;
    Ok(parsed.args)
}

/// Manager for a slave [`Environment`]
///
/// The manager is created as the first (address 0) agent of its
/// environment. A host manager address can be set so reports flow back to
/// the multi-environment that owns this slave.
pub struct EnvManager {
    env: Weak<Environment>,
    host_manager: parking_lot::RwLock<Option<AgentAddr>>,
}

impl EnvManager {
    /// Install a new manager into `env` and return it
    pub fn attach(env: &Arc<Environment>) -> Arc<Self> {
        let manager = Arc::new(Self {
            env: Arc::downgrade(env),
            host_manager: parking_lot::RwLock::new(None),
        });
        env.set_manager(manager.clone());
        manager
    }

    fn env(&self) -> Result<Arc<Environment>> {
        self.env.upgrade().ok_or(AgoraError::EnvironmentClosed)
    }

    /// Address of the host (master) manager, when one has been set
    pub fn host_manager(&self) -> Option<AgentAddr> {
        self.host_manager.read().clone()
    }

    /// Relay a message to the host manager's `handle` method
    async fn report(&self, msg: Value) -> Result<Value> {
        let host = self
            .host_manager()
            .ok_or_else(|| AgoraError::UnknownAgent("host manager not set".to_string()))?;
        let env = self.env()?;
        env.rpc().call(&host, "handle", msg).await
    }

    /// Fetch the global artifact list from the host manager
    ///
    /// Without a host manager the local artifact list is returned.
    async fn get_artifacts(&self) -> Result<Value> {
        let env = self.env()?;
        match self.host_manager() {
            Some(host) => env.rpc().call(&host, "get_artifacts", Value::Null).await,
            None => Ok(serde_json::to_value(env.get_artifacts(None))?),
        }
    }
}

#[async_trait]
impl Manager for EnvManager {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        let env = self.env()?;
        match method {
            "get_agents" => Ok(serde_json::to_value(env.agent_addrs())?),
            "trigger_all" => {
                let args = trigger_args(params)?;
                Ok(serde_json::to_value(env.trigger_all(args).await?)?)
            }
            "is_ready" => Ok(Value::Bool(env.is_ready())),
            "spawn" => {
                let spawn: SpawnParams = serde_json::from_value(params)?;
                let addr = env.spawn(&spawn.type_name, &spawn.params)?;
                Ok(serde_json::to_value(addr)?)
            }
            "spawn_n" => {
                let spawn: SpawnParams = serde_json::from_value(params)?;
                let n = spawn.n.unwrap_or(1);
                let addrs = env.spawn_n(&spawn.type_name, n, &spawn.params)?;
                Ok(serde_json::to_value(addrs)?)
            }
            "set_host_manager" => {
                let parsed: AddrParams = serde_json::from_value(params)?;
                *self.host_manager.write() = Some(parsed.addr);
                Ok(Value::Null)
            }
            "host_manager" => Ok(serde_json::to_value(self.host_manager())?),
            "report" => self.report(params).await,
            // Override point for embedding applications; the default
            // manager swallows reports.
            "handle" => Ok(Value::Null),
            "artifacts" => Ok(serde_json::to_value(env.get_artifacts(None))?),
            "get_artifacts" => self.get_artifacts().await,
            "get_candidates" => Ok(serde_json::to_value(env.candidates())?),
            "clear_candidates" => {
                env.clear_candidates();
                Ok(Value::Null)
            }
            "create_connections" => {
                let map: ConnectionMap = serde_json::from_value(params)?;
                Ok(serde_json::to_value(env.create_connections(&map).await?)?)
            }
            "get_connections" => {
                let parsed: DataParams = if params.is_null() {
                    DataParams::default()
                } else {
                    serde_json::from_value(params)?
                };
                Ok(serde_json::to_value(env.get_connections(parsed.data).await)?)
            }
            "stop" => {
                env.request_stop();
                Ok(Value::Null)
            }
            "close" => Ok(Value::Null),
            _ => Err(AgoraError::UnknownMethod(method.to_string())),
        }
    }
}

/// Manager for a [`MultiEnvironment`] master
///
/// Spawn and connection methods are relayed onwards to the slave
/// environment managers through the multi-environment.
pub struct MultiEnvManager {
    menv: Weak<MultiEnvironment>,
}

impl MultiEnvManager {
    /// Install a new manager into the master environment of `menv`
    pub fn attach(menv: &Arc<MultiEnvironment>) -> Arc<Self> {
        let manager = Arc::new(Self {
            menv: Arc::downgrade(menv),
        });
        menv.env().set_manager(manager.clone());
        manager
    }

    fn menv(&self) -> Result<Arc<MultiEnvironment>> {
        self.menv.upgrade().ok_or(AgoraError::EnvironmentClosed)
    }
}

#[async_trait]
impl Manager for MultiEnvManager {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        let menv = self.menv()?;
        match method {
            "get_agents" => Ok(serde_json::to_value(menv.get_agents().await?)?),
            "trigger_all" => {
                let args = trigger_args(params)?;
                Ok(serde_json::to_value(menv.trigger_all(args).await?)?)
            }
            "is_ready" => Ok(Value::Bool(menv.is_ready().await)),
            "spawn" => {
                let spawn: SpawnParams = serde_json::from_value(params)?;
                let addr = menv.spawn(&spawn.type_name, &spawn.params, None).await?;
                Ok(serde_json::to_value(addr)?)
            }
            "spawn_n" => {
                let spawn: SpawnParams = serde_json::from_value(params)?;
                let n = spawn.n.unwrap_or(1);
                let addrs = menv.spawn_n(&spawn.type_name, n, &spawn.params, None).await?;
                Ok(serde_json::to_value(addrs)?)
            }
            "set_as_host_manager" => {
                let parsed: AddrParams = serde_json::from_value(params)?;
                menv.set_host_manager(&parsed.addr).await?;
                Ok(Value::Null)
            }
            "create_connections" => {
                let map: ConnectionMap = serde_json::from_value(params)?;
                Ok(serde_json::to_value(menv.create_connections(&map).await?)?)
            }
            "get_connections" => {
                let parsed: DataParams = if params.is_null() {
                    DataParams::default()
                } else {
                    serde_json::from_value(params)?
                };
                Ok(serde_json::to_value(menv.get_connections(parsed.data).await?)?)
            }
            "get_artifacts" => Ok(serde_json::to_value(menv.get_artifacts(None))?),
            "get_slave_managers" => Ok(serde_json::to_value(menv.slave_managers())?),
            "handle" => Ok(Value::Null),
            "stop" => {
                menv.env().request_stop();
                Ok(Value::Null)
            }
            "close" => Ok(Value::Null),
            _ => Err(AgoraError::UnknownMethod(method.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trigger_args_unwrapping() {
        assert_eq!(trigger_args(Value::Null).unwrap(), Value::Null);
        assert_eq!(
            trigger_args(json!({"args": {"k": 1}})).unwrap(),
            json!({"k": 1})
        );
        assert_eq!(trigger_args(json!({})).unwrap(), Value::Null);
    }

    #[test]
    fn test_spawn_params() {
        let spawn: SpawnParams =
            serde_json::from_value(json!({"type": "number", "n": 3, "params": {"factors": [2]}}))
                .unwrap();
        assert_eq!(spawn.type_name, "number");
        assert_eq!(spawn.n, Some(3));
        assert_eq!(spawn.params, json!({"factors": [2]}));

        let bare: SpawnParams = serde_json::from_value(json!({"type": "number"})).unwrap();
        assert_eq!(bare.n, None);
        assert!(bare.params.is_null());
    }
}
