// tests/multienv.rs
//! Master/slave relaying across process-style boundaries.
//!
//! Slaves run in-process here, but every relay goes through the real RPC
//! path: master -> slave manager -> agents.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use agora::addr::split_addrs;
use agora::agent::{Agent, AgentCore, ConnectionInfo, ConnectionMap};
use agora::env::{
    DistributedEnvironment, EnvManager, EnvOptions, Environment, MultiEnvironment, NodeSpec,
};
use agora::{AgentAddr, AgentRegistry, RpcClient};

/// Returns whatever it is triggered with
#[derive(Debug)]
struct EchoAgent {
    core: AgentCore,
}

#[async_trait]
impl Agent for EchoAgent {
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

fn echo_registry() -> Arc<AgentRegistry> {
    let registry = AgentRegistry::with_builtins();
    registry.register("echo", |core, _params| Ok(Box::new(EchoAgent { core })));
    Arc::new(registry)
}

fn options(registry: &Arc<AgentRegistry>) -> EnvOptions {
    EnvOptions {
        registry: registry.clone(),
        ..EnvOptions::default()
    }
}

async fn slave(registry: &Arc<AgentRegistry>) -> Arc<Environment> {
    let env = Environment::create("127.0.0.1:0".parse().unwrap(), options(registry))
        .await
        .expect("create slave environment");
    EnvManager::attach(&env);
    env
}

#[tokio::test]
async fn test_wait_slaves_and_readiness() {
    let registry = echo_registry();
    let menv = MultiEnvironment::create("127.0.0.1:0".parse().unwrap(), options(&registry))
        .await
        .unwrap();
    let s1 = slave(&registry).await;
    let s2 = slave(&registry).await;
    menv.add_slave(s1.addr().manager());
    menv.add_slave(s2.addr().manager());

    assert!(menv
        .wait_slaves(Duration::from_secs(5), true)
        .await
        .unwrap());
    assert!(menv.is_ready().await);
    assert_eq!(menv.slave_managers().len(), 2);

    menv.destroy().await.unwrap();
    s1.destroy().await.unwrap();
    s2.destroy().await.unwrap();
}

#[tokio::test]
async fn test_wait_slaves_times_out_on_dead_slave() {
    let registry = echo_registry();
    let menv = MultiEnvironment::create("127.0.0.1:0".parse().unwrap(), options(&registry))
        .await
        .unwrap();
    // Nothing listens on port 1
    menv.add_slave("tcp://127.0.0.1:1/0".parse().unwrap());

    let ready = menv
        .wait_slaves(Duration::from_secs(2), false)
        .await
        .unwrap();
    assert!(!ready);
    assert!(!menv.is_ready().await);

    menv.destroy().await.unwrap();
}

#[tokio::test]
async fn test_host_managers_point_back_to_master() {
    let registry = echo_registry();
    let menv = MultiEnvironment::create("127.0.0.1:0".parse().unwrap(), options(&registry))
        .await
        .unwrap();
    let s1 = slave(&registry).await;
    let s2 = slave(&registry).await;
    menv.add_slave(s1.addr().manager());
    menv.add_slave(s2.addr().manager());
    menv.wait_slaves(Duration::from_secs(5), true).await.unwrap();

    menv.set_host_managers().await.unwrap();

    let rpc = RpcClient::default();
    for mgr in menv.slave_managers() {
        let host: Option<AgentAddr> = rpc.call_as(&mgr, "host_manager", Value::Null).await.unwrap();
        assert_eq!(host, Some(menv.manager_addr()));
    }

    menv.destroy().await.unwrap();
    s1.destroy().await.unwrap();
    s2.destroy().await.unwrap();
}

#[tokio::test]
async fn test_spawn_balances_across_slaves() {
    let registry = echo_registry();
    let menv = MultiEnvironment::create("127.0.0.1:0".parse().unwrap(), options(&registry))
        .await
        .unwrap();
    let s1 = slave(&registry).await;
    let s2 = slave(&registry).await;
    menv.add_slave(s1.addr().manager());
    menv.add_slave(s2.addr().manager());
    menv.wait_slaves(Duration::from_secs(5), true).await.unwrap();

    for _ in 0..4 {
        menv.spawn("echo", &Value::Null, None).await.unwrap();
    }

    let agents = menv.get_agents().await.unwrap();
    assert_eq!(agents.len(), 4);
    let by_env = split_addrs(&agents);
    for (_, ports) in &by_env {
        for (_, addrs) in ports {
            assert_eq!(addrs.len(), 2, "spawn should balance across slaves");
        }
    }

    // spawn_n puts all agents into one (the least loaded) slave
    let batch = menv.spawn_n("echo", 2, &Value::Null, None).await.unwrap();
    assert_eq!(batch.len(), 2);
    let first_env = batch[0].env();
    assert!(batch.iter().all(|a| a.env() == first_env));
    assert_eq!(menv.get_agents().await.unwrap().len(), 6);

    menv.destroy().await.unwrap();
    s1.destroy().await.unwrap();
    s2.destroy().await.unwrap();
}

#[tokio::test]
async fn test_trigger_all_passes_args_to_every_agent() {
    let registry = echo_registry();
    let menv = MultiEnvironment::create("127.0.0.1:0".parse().unwrap(), options(&registry))
        .await
        .unwrap();
    let s1 = slave(&registry).await;
    let s2 = slave(&registry).await;
    menv.add_slave(s1.addr().manager());
    menv.add_slave(s2.addr().manager());
    menv.wait_slaves(Duration::from_secs(5), true).await.unwrap();

    for _ in 0..6 {
        menv.spawn("echo", &Value::Null, None).await.unwrap();
    }

    let args = json!({"foo": "bar", "yep": 2});
    let results = menv.trigger_all(args.clone()).await.unwrap();
    assert_eq!(results.len(), 6);
    for result in &results {
        assert_eq!(result, &args);
    }

    // Triggering one agent directly also crosses the boundary
    let agents = menv.get_agents().await.unwrap();
    let one = menv
        .trigger_act(&agents[0], json!({"solo": true}))
        .await
        .unwrap();
    assert_eq!(one, json!({"solo": true}));

    menv.destroy().await.unwrap();
    s1.destroy().await.unwrap();
    s2.destroy().await.unwrap();
}

#[tokio::test]
async fn test_connections_across_slaves() {
    let registry = echo_registry();
    let menv = MultiEnvironment::create("127.0.0.1:0".parse().unwrap(), options(&registry))
        .await
        .unwrap();
    let s1 = slave(&registry).await;
    let s2 = slave(&registry).await;
    menv.add_slave(s1.addr().manager());
    menv.add_slave(s2.addr().manager());
    menv.wait_slaves(Duration::from_secs(5), true).await.unwrap();

    let a = menv
        .spawn("echo", &Value::Null, Some(s1.addr().manager()))
        .await
        .unwrap();
    let b = menv
        .spawn("echo", &Value::Null, Some(s2.addr().manager()))
        .await
        .unwrap();

    let mut map = ConnectionMap::new();
    map.insert(
        a.clone(),
        vec![ConnectionInfo::with_data(b.clone(), json!({"weight": 0.5}))],
    );
    map.insert(b.clone(), vec![ConnectionInfo::new(a.clone())]);

    let results = menv.create_connections(&map).await.unwrap();
    assert_eq!(results.len(), 2);

    let connections = menv.get_connections(true).await.unwrap();
    let a_conns = connections.iter().find(|c| c.addr == a).unwrap();
    assert_eq!(a_conns.connections[0].addr, b);
    assert_eq!(a_conns.connections[0].data, json!({"weight": 0.5}));
    let b_conns = connections.iter().find(|c| c.addr == b).unwrap();
    assert_eq!(b_conns.connections[0].addr, a);

    // Without data the annotations are dropped
    let bare = menv.get_connections(false).await.unwrap();
    let a_bare = bare.iter().find(|c| c.addr == a).unwrap();
    assert_eq!(a_bare.connections[0].data, Value::Null);

    menv.destroy().await.unwrap();
    s1.destroy().await.unwrap();
    s2.destroy().await.unwrap();
}

#[tokio::test]
async fn test_distributed_relay_chain() {
    // Coordinator -> node (multi-environment) -> slave environment
    let registry = echo_registry();

    let slave_env = slave(&registry).await;
    let node = MultiEnvironment::create("127.0.0.1:0".parse().unwrap(), options(&registry))
        .await
        .unwrap();
    node.add_slave(slave_env.addr().manager());

    let denv = DistributedEnvironment::create(
        "127.0.0.1:0".parse().unwrap(),
        vec![NodeSpec::new("127.0.0.1", 22)],
        options(&registry),
    )
    .await
    .unwrap();
    denv.multi().add_slave(node.manager_addr());

    assert!(denv.wait_nodes(Duration::from_secs(5), true).await.unwrap());

    // Spawn lands in the slave environment two hops away
    let addr = denv.spawn("echo", &Value::Null, None).await.unwrap();
    assert_eq!(addr.env(), *slave_env.addr());

    let agents = denv.get_agents().await.unwrap();
    assert_eq!(agents, vec![addr.clone()]);

    // The true slave managers are collected across all nodes
    let slave_managers = denv.slave_managers().await.unwrap();
    assert_eq!(slave_managers, vec![slave_env.addr().manager()]);

    let results = denv.trigger_all(json!({"hop": 3})).await.unwrap();
    assert_eq!(results, vec![json!({"hop": 3})]);

    denv.destroy().await.unwrap();
    node.destroy().await.unwrap();
    slave_env.destroy().await.unwrap();
}

#[tokio::test]
async fn test_stop_relays_to_slaves() {
    let registry = echo_registry();
    let menv = MultiEnvironment::create("127.0.0.1:0".parse().unwrap(), options(&registry))
        .await
        .unwrap();
    let s1 = slave(&registry).await;
    menv.add_slave(s1.addr().manager());
    menv.wait_slaves(Duration::from_secs(5), true).await.unwrap();

    let slave_waiter = {
        let s1 = s1.clone();
        tokio::spawn(async move { s1.wait_stopped().await })
    };

    menv.stop_slaves().await;
    tokio::time::timeout(Duration::from_secs(5), slave_waiter)
        .await
        .expect("slave sees stop")
        .unwrap();

    menv.destroy().await.unwrap();
    s1.destroy().await.unwrap();
}
