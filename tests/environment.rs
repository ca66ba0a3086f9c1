// tests/environment.rs
//! Container behavior exercised over real RPC connections.

use std::sync::Arc;

use serde_json::{json, Value};

use agora::agent::{Agent, AgentCore, ConnectionInfo};
use agora::env::{EnvManager, EnvOptions, Environment};
use agora::{AgentAddr, AgoraError, Artifact, RpcClient};

async fn managed_env() -> Arc<Environment> {
    let env = Environment::create("127.0.0.1:0".parse().unwrap(), EnvOptions::default())
        .await
        .expect("create environment");
    EnvManager::attach(&env);
    env
}

#[tokio::test]
async fn test_manager_answers_over_rpc() {
    let env = managed_env().await;
    let rpc = RpcClient::default();
    let manager = env.addr().manager();

    let ready = rpc.call(&manager, "is_ready", Value::Null).await.unwrap();
    assert_eq!(ready, Value::Bool(true));

    // No agents yet, managers are never listed
    let agents: Vec<AgentAddr> = rpc.call_as(&manager, "get_agents", Value::Null).await.unwrap();
    assert!(agents.is_empty());

    env.destroy().await.unwrap();
}

#[tokio::test]
async fn test_spawn_and_trigger_through_manager() {
    let env = managed_env().await;
    let rpc = RpcClient::default();
    let manager = env.addr().manager();

    let first: AgentAddr = rpc
        .call_as(
            &manager,
            "spawn",
            json!({"type": "number", "params": {"factors": [2], "name": "n1"}}),
        )
        .await
        .unwrap();
    assert_eq!(first.index, 1);
    assert_eq!(first.env(), *env.addr());

    let more: Vec<AgentAddr> = rpc
        .call_as(
            &manager,
            "spawn_n",
            json!({"type": "number", "n": 3, "params": {"factors": [3]}}),
        )
        .await
        .unwrap();
    assert_eq!(more.len(), 3);

    let agents: Vec<AgentAddr> = rpc.call_as(&manager, "get_agents", Value::Null).await.unwrap();
    assert_eq!(agents.len(), 4);
    assert!(agents.iter().all(|a| !a.is_manager()));

    // Every agent acts exactly once and reports its invention
    let results: Vec<Value> = rpc
        .call_as(&manager, "trigger_all", Value::Null)
        .await
        .unwrap();
    assert_eq!(results.len(), 4);
    for result in &results {
        assert!(result.get("number").is_some());
    }

    env.destroy().await.unwrap();
}

#[tokio::test]
async fn test_unknown_spawn_type_is_remote_error() {
    let env = managed_env().await;
    let rpc = RpcClient::default();
    let manager = env.addr().manager();

    let err = rpc
        .call(&manager, "spawn", json!({"type": "no-such-agent"}))
        .await
        .unwrap_err();
    match err {
        AgoraError::Remote { message, .. } => assert!(message.contains("no-such-agent")),
        other => panic!("expected remote error, got {:?}", other),
    }

    env.destroy().await.unwrap();
}

#[tokio::test]
async fn test_agent_connection_methods_over_rpc() {
    let env = managed_env().await;
    let rpc = RpcClient::default();

    let a = env.spawn("number", &json!({"factors": [2]})).unwrap();
    let b = env.spawn("number", &json!({"factors": [3]})).unwrap();

    let added = rpc
        .call(&a, "add_connection", json!({"addr": b.to_string()}))
        .await
        .unwrap();
    assert_eq!(added, Value::Bool(true));

    // Adding the same peer twice reports false
    let again = rpc
        .call(&a, "add_connection", json!({"addr": b.to_string()}))
        .await
        .unwrap();
    assert_eq!(again, Value::Bool(false));

    let conns: Vec<AgentAddr> = rpc
        .call_as(&a, "get_connections", Value::Null)
        .await
        .unwrap();
    assert_eq!(conns, vec![b.clone()]);

    let removed = rpc
        .call(&a, "remove_connection", json!({"addr": b.to_string()}))
        .await
        .unwrap();
    assert_eq!(removed, Value::Null);
    let conns: Vec<AgentAddr> = rpc
        .call_as(&a, "get_connections", Value::Null)
        .await
        .unwrap();
    assert!(conns.is_empty());

    env.destroy().await.unwrap();
}

#[tokio::test]
async fn test_remote_evaluation() {
    let env = managed_env().await;
    let rpc = RpcClient::default();

    let evaluator = env.spawn("number", &json!({"factors": [2, 5]})).unwrap();
    let artifact = Artifact::new("tcp://elsewhere:5555/1", json!(10));

    let evaluation: agora::Evaluation = rpc
        .call_as(&evaluator, "evaluate", serde_json::to_value(&artifact).unwrap())
        .await
        .unwrap();
    assert_eq!(evaluation.score, 1.0);
    assert_eq!(evaluation.framing, Some(json!([2, 5])));

    env.destroy().await.unwrap();
}

#[tokio::test]
async fn test_create_connections_applies_local_entries_only() {
    let env = managed_env().await;

    let a = env.spawn("number", &json!({})).unwrap();
    let b = env.spawn("number", &json!({})).unwrap();
    let foreign: AgentAddr = "tcp://elsewhere:9999/1".parse().unwrap();

    let mut map = agora::agent::ConnectionMap::new();
    map.insert(a.clone(), vec![ConnectionInfo::new(b.clone())]);
    map.insert(foreign.clone(), vec![ConnectionInfo::new(a.clone())]);

    let results = env.create_connections(&map).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, a);
    assert_eq!(results[0].1, vec![true]);

    let all = env.get_connections(true).await;
    let a_conns = all.iter().find(|c| c.addr == a).unwrap();
    assert_eq!(a_conns.connections.len(), 1);
    assert_eq!(a_conns.connections[0].addr, b);

    env.destroy().await.unwrap();
}

#[tokio::test]
async fn test_unknown_agent_and_method_errors() {
    let env = managed_env().await;
    let rpc = RpcClient::default();

    let missing = env.addr().agent(99);
    let err = rpc.call(&missing, "act", Value::Null).await.unwrap_err();
    assert!(matches!(err, AgoraError::Remote { .. }));

    let agent = env.spawn("number", &json!({})).unwrap();
    let err = rpc.call(&agent, "frobnicate", Value::Null).await.unwrap_err();
    match err {
        AgoraError::Remote { message, .. } => assert!(message.contains("frobnicate")),
        other => panic!("expected remote error, got {:?}", other),
    }

    env.destroy().await.unwrap();
}

#[tokio::test]
async fn test_stop_resolves_wait_stopped() {
    let env = managed_env().await;
    let rpc = RpcClient::default();
    let manager = env.addr().manager();

    let waiter = {
        let env = env.clone();
        tokio::spawn(async move { env.wait_stopped().await })
    };

    rpc.call(&manager, "stop", Value::Null).await.unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
        .await
        .expect("wait_stopped resolves after stop")
        .unwrap();

    env.destroy().await.unwrap();
    assert!(!env.is_ready());
}

#[tokio::test]
async fn test_artifacts_and_candidates() {
    let env = managed_env().await;
    env.set_age(7);

    let artifact = Artifact::new("tcp://localhost:5555/1", json!(4));
    env.add_artifact(artifact.clone());
    let stored = env.get_artifacts(None);
    assert_eq!(stored.len(), 1);
    // Publication stamps the environment age
    assert_eq!(stored[0].env_time(), 7);

    assert_eq!(env.get_artifacts(Some("tcp://localhost:5555/1")).len(), 1);
    assert!(env.get_artifacts(Some("tcp://localhost:5555/2")).is_empty());

    env.add_candidate(Artifact::new("tcp://localhost:5555/2", json!(9)));
    assert_eq!(env.candidates().len(), 1);
    env.clear_candidates();
    assert!(env.candidates().is_empty());

    env.destroy().await.unwrap();
}

#[tokio::test]
async fn test_random_connections_are_distinct_peers() {
    let env = managed_env().await;
    let mut addrs = Vec::new();
    for _ in 0..6 {
        addrs.push(env.spawn("number", &json!({})).unwrap());
    }
    env.create_random_connections(3).await.unwrap();

    for addr in &addrs {
        let entry = env.get_agent(addr).unwrap();
        let agent = entry.agent.lock().await;
        let conns = agent.core().connection_addrs();
        assert_eq!(conns.len(), 3);
        // No self-connections, no duplicates (set semantics of the map)
        assert!(!conns.contains(addr));
    }

    env.destroy().await.unwrap();
}

// A handle into a destroyed environment must fail, not hang
#[tokio::test]
async fn test_destroyed_env_rejects_operations() {
    let env = managed_env().await;
    let agent = env.spawn("number", &json!({})).unwrap();
    env.destroy().await.unwrap();

    let err = env.trigger_act(&agent, Value::Null).await.unwrap_err();
    assert!(matches!(err, AgoraError::EnvironmentClosed));
    assert!(env.spawn("number", &json!({})).is_err());
}

// Direct (in-process) spawning bypasses the registry
#[tokio::test]
async fn test_spawn_with_closure() {
    #[derive(Debug)]
    struct Silent {
        core: AgentCore,
    }

    #[async_trait::async_trait]
    impl Agent for Silent {
        fn core(&self) -> &AgentCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut AgentCore {
            &mut self.core
        }
        async fn act(&mut self, args: Value) -> agora::Result<Value> {
            Ok(args)
        }
    }

    let env = managed_env().await;
    let addr = env
        .spawn_with(Some("silent".to_string()), 0, |core| Box::new(Silent { core }))
        .unwrap();

    let result = env.trigger_act(&addr, json!({"ping": 1})).await.unwrap();
    assert_eq!(result, json!({"ping": 1}));

    env.destroy().await.unwrap();
}
