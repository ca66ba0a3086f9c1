// src/rpc/message.rs
//! RPC request and response envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single RPC request
///
/// `target` is the agent index inside the receiving environment; index 0
/// addresses the environment's manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub target: u32,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, target: u32, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            target,
            method: method.into(),
            params,
        }
    }
}

/// A single RPC response, mirroring the request id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let req = Request::new(7, 3, "act", json!({"step": 1}));
        let bytes = serde_json::to_vec(&req).unwrap();
        let back: Request = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.id, 7);
        assert_eq!(back.target, 3);
        assert_eq!(back.method, "act");
        assert_eq!(back.params, json!({"step": 1}));
    }

    #[test]
    fn test_request_params_default_to_null() {
        let back: Request =
            serde_json::from_str(r#"{"id":1,"target":0,"method":"is_ready"}"#).unwrap();
        assert!(back.params.is_null());
    }

    #[test]
    fn test_response_variants() {
        let ok = Response::ok(1, json!([1, 2]));
        assert!(ok.error.is_none());
        let err = Response::error(2, "boom");
        assert!(err.result.is_none());
        assert_eq!(err.error.as_deref(), Some("boom"));
    }
}
