// src/agent/builtin.rs
//! Built-in agent implementations.
//!
//! [`NumberAgent`] is a small smoke-test agent: it invents integers,
//! scores them by how many of its preferred factors divide them, asks its
//! connections for opinions and publishes the numbers its peers like.

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tracing::debug;

use crate::agent::{Agent, AgentCore, Evaluation};
use crate::artifact::Artifact;
use crate::utils::errors::Result;

/// How many fresh candidates an invention round examines
const INVENT_CANDIDATES: usize = 10;

/// Upper bound on sampling attempts per invention round
const INVENT_MAX_DRAWS: usize = 1000;

/// An agent that searches for "interesting" integers
#[derive(Debug)]
pub struct NumberAgent {
    core: AgentCore,
    factors: Vec<u64>,
}

impl NumberAgent {
    /// Create an agent with a single random preferred factor
    pub fn new(core: AgentCore) -> Self {
        let factor = rand::thread_rng().gen_range(2..=100);
        Self::with_factors(core, vec![factor])
    }

    /// Create an agent with explicit preferred factors
    pub fn with_factors(core: AgentCore, factors: Vec<u64>) -> Self {
        Self { core, factors }
    }

    /// Build from registry spawn parameters: `{"factors": [2, 3, ...]}`
    pub fn from_params(core: AgentCore, params: &Value) -> Result<Self> {
        match params.get("factors") {
            Some(value) => {
                let factors: Vec<u64> = serde_json::from_value(value.clone())?;
                Ok(Self::with_factors(core, factors))
            }
            None => Ok(Self::new(core)),
        }
    }

    pub fn factors(&self) -> &[u64] {
        &self.factors
    }

    /// Fraction of preferred factors dividing `n`
    fn score(&self, n: u64) -> f64 {
        if self.factors.is_empty() || n == 0 {
            return 0.0;
        }
        let hits = self.factors.iter().filter(|f| **f != 0 && n % **f == 0).count();
        hits as f64 / self.factors.len() as f64
    }

    /// Factors of this agent dividing `n`, used as evaluation framing
    fn dividing_factors(&self, n: u64) -> Vec<u64> {
        if n == 0 {
            return Vec::new();
        }
        self.factors
            .iter()
            .copied()
            .filter(|f| *f != 0 && n % *f == 0)
            .collect()
    }

    /// Invent a new number from `[low, high]`, best-of-N by own score
    ///
    /// Numbers the agent has already created are not candidates again.
    fn invent(&self, low: u64, high: u64) -> Option<(u64, f64)> {
        let mut rng = rand::thread_rng();
        let known: Vec<u64> = self
            .core
            .artifacts()
            .iter()
            .filter_map(|a| a.payload().as_u64())
            .collect();

        let mut candidates = Vec::new();
        let mut draws = 0;
        while candidates.len() < INVENT_CANDIDATES && draws < INVENT_MAX_DRAWS {
            draws += 1;
            let n = rng.gen_range(low..=high);
            if known.contains(&n) || candidates.contains(&n) {
                continue;
            }
            candidates.push(n);
        }

        candidates
            .into_iter()
            .map(|n| (n, self.score(n)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }
}

#[async_trait]
impl Agent for NumberAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AgentCore {
        &mut self.core
    }

    async fn act(&mut self, _args: Value) -> Result<Value> {
        let high = self.factors.iter().copied().max().unwrap_or(2) + 100;
        let Some((number, self_eval)) = self.invent(2, high) else {
            debug!(agent = %self.core.addr(), "could not invent a new number");
            return Ok(Value::Null);
        };

        let mut artifact = Artifact::new(self.core.addr().to_string(), json!(number));
        artifact.add_eval(
            self.core.addr().to_string(),
            self_eval,
            Some(json!(self.dividing_factors(number))),
        );

        // Gather peer opinions; unreachable peers simply do not vote.
        let env = self.core.env().clone();
        let peers = self.core.connection_addrs();
        let mut opinions = Vec::new();
        for peer in &peers {
            match env.ask_opinion(peer, &artifact).await {
                Ok(evaluation) => {
                    artifact.add_eval(peer.to_string(), evaluation.score, evaluation.framing);
                    opinions.push(evaluation.score);
                }
                Err(e) => {
                    debug!(agent = %self.core.addr(), %peer, "opinion unavailable: {}", e);
                }
            }
        }

        opinions.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let top3 = &opinions[..opinions.len().min(3)];
        let peer_eval = if top3.is_empty() {
            0.0
        } else {
            top3.iter().sum::<f64>() / top3.len() as f64
        };

        let published = peer_eval > 0.25 && self_eval > 0.5;
        if published {
            env.publish(artifact.clone())?;
            if !self.factors.contains(&number) {
                self.factors.push(number);
                debug!(agent = %self.core.addr(), number, "adopted new factor");
            }
        }
        self.core.record_artifact(artifact);

        Ok(json!({
            "number": number,
            "self_eval": self_eval,
            "peer_eval": peer_eval,
            "published": published,
        }))
    }

    async fn evaluate(&mut self, artifact: &Artifact) -> Result<Evaluation> {
        let Some(number) = artifact.payload().as_u64() else {
            return Ok(Evaluation::none());
        };
        let score = self.score(number);
        let framing = json!(self.dividing_factors(number));
        Ok(Evaluation::new(score, Some(framing)))
    }
}
