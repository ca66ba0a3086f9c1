// tests/simulation.rs
//! Stepper semantics: ordering, age propagation, concurrent stepping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use agora::agent::{Agent, AgentCore};
use agora::env::{Env, EnvOptions, Environment};
use agora::{AgoraError, Simulation, StepOrder};

/// Reports its own address and age every time it acts
#[derive(Debug)]
struct ReporterAgent {
    core: AgentCore,
}

#[async_trait]
impl Agent for ReporterAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut AgentCore {
        &mut self.core
    }
    async fn act(&mut self, _args: Value) -> agora::Result<Value> {
        Ok(json!({
            "addr": self.core.addr().to_string(),
            "age": self.core.age(),
        }))
    }
}

async fn reporter_env(n: usize) -> Arc<Environment> {
    let env = Environment::create("127.0.0.1:0".parse().unwrap(), EnvOptions::default())
        .await
        .expect("create environment");
    for _ in 0..n {
        env.spawn_with(None, 0, |core| Box::new(ReporterAgent { core }))
            .unwrap();
    }
    env
}

#[tokio::test]
async fn test_step_triggers_each_agent_once_in_order() {
    let env = reporter_env(5).await;
    let mut sim = Simulation::new(env.clone() as Arc<dyn Env>);

    let results = sim.step().await.unwrap();
    assert_eq!(results.len(), 5);
    assert_eq!(sim.age(), 1);
    // The simulation age is pushed into the environment
    assert_eq!(env.age(), 1);

    // Alphabetical order is address order
    let expected: Vec<String> = env.agent_addrs().iter().map(|a| a.to_string()).collect();
    let got: Vec<String> = results
        .iter()
        .map(|r| r["addr"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(got, expected);

    // Every agent has acted exactly once
    for result in &results {
        assert_eq!(result["age"], json!(1));
    }

    sim.close().await.unwrap();
    assert!(!env.is_ready());
}

#[tokio::test]
async fn test_steps_accumulate_age() {
    let env = reporter_env(3).await;
    let mut sim = Simulation::new(env.clone() as Arc<dyn Env>);

    let all = sim.steps(4).await.unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(sim.age(), 4);
    assert_eq!(env.age(), 4);
    for result in &all[3] {
        assert_eq!(result["age"], json!(4));
    }

    sim.close().await.unwrap();
}

#[tokio::test]
async fn test_next_walks_one_agent_at_a_time() {
    let env = reporter_env(3).await;
    let mut sim = Simulation::new(env.clone() as Arc<dyn Env>);

    // First call starts a new step
    let first = sim.next().await.unwrap().unwrap();
    assert_eq!(sim.age(), 1);
    assert_eq!(sim.pending(), 2);
    assert_eq!(first["age"], json!(1));

    // A full step cannot start while agents are pending
    let err = sim.step().await.unwrap_err();
    assert!(matches!(err, AgoraError::StepInProgress));

    let rest = sim.finish_step().await.unwrap();
    assert_eq!(rest.len(), 2);
    assert_eq!(sim.pending(), 0);

    // The next step begins cleanly
    sim.step().await.unwrap();
    assert_eq!(sim.age(), 2);

    sim.close().await.unwrap();
}

#[tokio::test]
async fn test_async_step_awaits_every_agent() {
    let env = reporter_env(8).await;
    let mut sim = Simulation::new(env.clone() as Arc<dyn Env>);

    let results = sim.async_step().await.unwrap();
    assert_eq!(results.len(), 8);
    assert_eq!(sim.age(), 1);
    for result in &results {
        assert_eq!(result["age"], json!(1));
    }

    let more = sim.async_steps(2).await.unwrap();
    assert_eq!(more.len(), 2);
    assert_eq!(sim.age(), 3);

    sim.close().await.unwrap();
}

#[tokio::test]
async fn test_random_order_still_triggers_everyone() {
    let env = reporter_env(6).await;
    let mut sim = Simulation::new(env.clone() as Arc<dyn Env>).with_order(StepOrder::Random);

    let results = sim.step().await.unwrap();
    let mut got: Vec<String> = results
        .iter()
        .map(|r| r["addr"].as_str().unwrap().to_string())
        .collect();
    got.sort();
    let mut expected: Vec<String> = env.agent_addrs().iter().map(|a| a.to_string()).collect();
    expected.sort();
    assert_eq!(got, expected);

    sim.close().await.unwrap();
}

#[tokio::test]
async fn test_callback_fires_after_each_step() {
    let env = reporter_env(2).await;
    let calls = Arc::new(AtomicU64::new(0));
    let seen = calls.clone();
    let mut sim = Simulation::new(env.clone() as Arc<dyn Env>).with_callback(move |age| {
        seen.store(age, Ordering::SeqCst);
    });

    sim.step().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    sim.async_step().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    sim.close().await.unwrap();
}

#[tokio::test]
async fn test_number_agents_publish_artifacts() {
    let env = Environment::create("127.0.0.1:0".parse().unwrap(), EnvOptions::default())
        .await
        .unwrap();
    for i in 0..4 {
        env.spawn("number", &json!({"factors": [2], "name": format!("number-{}", i)}))
            .unwrap();
    }
    env.create_random_connections(3).await.unwrap();

    let mut sim = Simulation::new(env.clone() as Arc<dyn Env>);
    sim.steps(5).await.unwrap();

    // Agents share the factor 2, so even inventions score 1.0 with every
    // peer and get published.
    let artifacts = env.get_artifacts(None);
    assert!(!artifacts.is_empty());
    for artifact in &artifacts {
        let n = artifact.payload().as_u64().unwrap();
        assert_eq!(n % 2, 0);
        assert!(artifact.evals().len() >= 2);
    }

    sim.close().await.unwrap();
}
