// src/rpc/client.rs
//! RPC client: one connection per call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::debug;

use crate::addr::AgentAddr;
use crate::rpc::codec;
use crate::rpc::message::{Request, Response};
use crate::utils::errors::{AgoraError, Result};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Default timeout for establishing a connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a full call, response included
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Client for calling methods on remote agents and managers
///
/// Each call opens a fresh TCP connection, sends a single request frame,
/// waits for the response frame and closes the connection. Connections are
/// never pooled.
#[derive(Debug, Clone)]
pub struct RpcClient {
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl RpcClient {
    pub fn new(connect_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            call_timeout,
        }
    }

    /// Client with a caller-supplied connect timeout, used while polling
    /// slaves for readiness
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..Self::default()
        }
    }

    /// Call `method` on the agent at `addr` and return the raw result value
    pub async fn call(&self, addr: &AgentAddr, method: &str, params: Value) -> Result<Value> {
        let fut = self.call_inner(addr, method, params);
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AgoraError::Timeout(addr.to_string())),
        }
    }

    /// Call `method` and deserialize the result into `T`
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        addr: &AgentAddr,
        method: &str,
        params: Value,
    ) -> Result<T> {
        let value = self.call(addr, method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn call_inner(&self, addr: &AgentAddr, method: &str, params: Value) -> Result<Value> {
        let stream = self.connect(addr).await?;
        let mut framed = codec::frame(stream);

        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(id, addr.index, method, params);
        debug!(%addr, method, id, "rpc call");
        framed.send(codec::encode(&request)?).await?;

        let frame = match framed.next().await {
            Some(frame) => frame?,
            None => return Err(AgoraError::ConnectionClosed(addr.to_string())),
        };
        let response: Response = codec::decode(&frame)?;
        if let Some(message) = response.error {
            return Err(AgoraError::Remote {
                addr: addr.to_string(),
                message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn connect(&self, addr: &AgentAddr) -> Result<TcpStream> {
        let connect = TcpStream::connect((addr.host.as_str(), addr.port));
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(AgoraError::Timeout(addr.to_string())),
        }
    }
}
