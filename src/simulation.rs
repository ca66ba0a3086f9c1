// src/simulation.rs
//! Iterative simulations over an environment.
//!
//! A [`Simulation`] repeatedly triggers every agent's `act`. Synchronous
//! stepping visits agents one at a time in a defined order; asynchronous
//! stepping triggers all of them concurrently and awaits every agent before
//! the step finishes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::{debug, info};

use crate::addr::AgentAddr;
use crate::env::Env;
use crate::utils::errors::{AgoraError, Result};

/// Order in which agents are triggered during synchronous stepping
///
/// Concurrent stepping does not promise any ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepOrder {
    /// Sorted by host, port and creation index
    #[default]
    Alphabetical,

    /// Shuffled anew at every step
    Random,
}

/// A stepper driving agents in an environment
pub struct Simulation {
    env: Arc<dyn Env>,
    age: u64,
    order: StepOrder,
    callback: Option<Box<dyn FnMut(u64) + Send>>,
    pending: VecDeque<AgentAddr>,
    step_started: Option<Instant>,
    started: Instant,
    processing: f64,
}

impl Simulation {
    /// Create a simulation for a fully prepared environment
    pub fn new(env: Arc<dyn Env>) -> Self {
        Self {
            env,
            age: 0,
            order: StepOrder::default(),
            callback: None,
            pending: VecDeque::new(),
            step_started: None,
            started: Instant::now(),
            processing: 0.0,
        }
    }

    /// Use the given trigger order for synchronous steps
    pub fn with_order(mut self, order: StepOrder) -> Self {
        self.order = order;
        self
    }

    /// Invoke `callback` with the new age after every finished step
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(u64) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn env(&self) -> &Arc<dyn Env> {
        &self.env
    }

    /// Number of finished or started steps
    pub fn age(&self) -> u64 {
        self.age
    }

    pub fn order(&self) -> StepOrder {
        self.order
    }

    /// Agents that have not acted yet in the current step
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    async fn ordered_agents(&self) -> Result<Vec<AgentAddr>> {
        // get_agents returns sorted addresses already
        let mut agents = self.env.get_agents().await?;
        if self.order == StepOrder::Random {
            agents.shuffle(&mut rand::thread_rng());
        }
        Ok(agents)
    }

    async fn init_step(&mut self) -> Result<()> {
        self.age += 1;
        self.env.set_age(self.age);
        info!(sim = self.env.name(), step = self.age, "***** step {:0>10} *****", self.age);
        self.pending = self.ordered_agents().await?.into();
        self.step_started = Some(Instant::now());
        Ok(())
    }

    fn finalize_step(&mut self) {
        let elapsed = self
            .step_started
            .take()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.processing += elapsed;
        histogram!("agora_step_seconds").record(elapsed);
        if let Some(callback) = self.callback.as_mut() {
            callback(self.age);
        }
        info!(
            sim = self.env.name(),
            step = self.age,
            "step run in {:.3}s",
            elapsed
        );
    }

    /// Trigger the next untriggered agent of the current step
    ///
    /// Starts a new step when the previous one has finished. Returns the
    /// acting agent's result, or `None` when the environment holds no
    /// agents at all.
    pub async fn next(&mut self) -> Result<Option<Value>> {
        if self.pending.is_empty() {
            self.init_step().await?;
        }
        let Some(addr) = self.pending.pop_front() else {
            self.finalize_step();
            return Ok(None);
        };
        debug!(agent = %addr, step = self.age, "triggering");
        let result = self.env.trigger_act(&addr, Value::Null).await?;
        if self.pending.is_empty() {
            self.finalize_step();
        }
        Ok(Some(result))
    }

    /// Finish the current step, triggering every still-pending agent
    pub async fn finish_step(&mut self) -> Result<Vec<Value>> {
        let mut results = Vec::new();
        while !self.pending.is_empty() {
            if let Some(result) = self.next().await? {
                results.push(result);
            }
        }
        Ok(results)
    }

    /// Progress the simulation by one synchronous step
    ///
    /// Every agent is triggered on its own, in the configured order.
    pub async fn step(&mut self) -> Result<Vec<Value>> {
        if !self.pending.is_empty() {
            return Err(AgoraError::StepInProgress);
        }
        self.init_step().await?;
        let mut results = Vec::new();
        while let Some(addr) = self.pending.pop_front() {
            debug!(agent = %addr, step = self.age, "triggering");
            results.push(self.env.trigger_act(&addr, Value::Null).await?);
        }
        self.finalize_step();
        Ok(results)
    }

    /// Progress the simulation by `n` synchronous steps
    pub async fn steps(&mut self, n: usize) -> Result<Vec<Vec<Value>>> {
        let mut results = Vec::with_capacity(n);
        for _ in 0..n {
            results.push(self.step().await?);
        }
        Ok(results)
    }

    /// Progress the simulation by one concurrent step
    ///
    /// All agents are triggered at once; the step finishes only after
    /// every agent has acted.
    pub async fn async_step(&mut self) -> Result<Vec<Value>> {
        if !self.pending.is_empty() {
            return Err(AgoraError::StepInProgress);
        }
        self.age += 1;
        self.env.set_age(self.age);
        info!(sim = self.env.name(), step = self.age, "***** step {:0>10} (concurrent) *****", self.age);
        self.step_started = Some(Instant::now());
        let results = self.env.trigger_all(Value::Null).await?;
        self.finalize_step();
        Ok(results)
    }

    /// Progress the simulation by `n` concurrent steps
    pub async fn async_steps(&mut self, n: usize) -> Result<Vec<Vec<Value>>> {
        let mut results = Vec::with_capacity(n);
        for _ in 0..n {
            results.push(self.async_step().await?);
        }
        Ok(results)
    }

    /// Close the simulation and destroy its environment
    pub async fn close(self) -> Result<()> {
        self.env.close().await?;
        info!(
            sim = self.env.name(),
            steps = self.age,
            "simulation completed in {:.3}s ({:.3}s of processing time)",
            self.started.elapsed().as_secs_f64(),
            self.processing
        );
        Ok(())
    }
}
