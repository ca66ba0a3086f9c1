// src/artifact.rs
//! Artifacts produced by agents.
//!
//! An [`Artifact`] wraps an opaque JSON payload together with its creator,
//! the environment age at publication time, and the evaluations other agents
//! have given it. The payload is immutable once created; evaluations are
//! append-only.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// A wrapper around a payload created by an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique artifact id
    id: Ulid,

    /// Address string of the creating agent
    creator: String,

    /// The artifact object itself
    payload: Value,

    /// Environment age when the artifact was added to an environment
    env_time: u64,

    /// Wall-clock creation time
    created_at: DateTime<Utc>,

    /// Evaluator address -> scalar evaluation
    evals: BTreeMap<String, f64>,

    /// Evaluator address -> framing metadata for its evaluation
    framings: BTreeMap<String, Value>,
}

impl Artifact {
    /// Create a new artifact with the given creator and payload
    pub fn new(creator: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Ulid::new(),
            creator: creator.into(),
            payload,
            env_time: 0,
            created_at: Utc::now(),
            evals: BTreeMap::new(),
            framings: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    /// Address string of the agent which created the artifact
    pub fn creator(&self) -> &str {
        &self.creator
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Environment age at publication time
    pub fn env_time(&self) -> u64 {
        self.env_time
    }

    pub(crate) fn set_env_time(&mut self, age: u64) {
        self.env_time = age;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// All evaluations given to this artifact so far
    pub fn evals(&self) -> &BTreeMap<String, f64> {
        &self.evals
    }

    /// All framings attached to evaluations of this artifact
    pub fn framings(&self) -> &BTreeMap<String, Value> {
        &self.framings
    }

    /// Add or replace an evaluator's evaluation, with optional framing
    pub fn add_eval(&mut self, evaluator: impl Into<String>, eval: f64, framing: Option<Value>) {
        let evaluator = evaluator.into();
        self.evals.insert(evaluator.clone(), eval);
        self.framings
            .insert(evaluator, framing.unwrap_or(Value::Null));
    }

    /// A single evaluator's evaluation, if it has evaluated this artifact
    pub fn eval_by(&self, evaluator: &str) -> Option<f64> {
        self.evals.get(evaluator).copied()
    }

    /// Mean of all evaluations, or `None` when nobody has evaluated yet
    pub fn mean_eval(&self) -> Option<f64> {
        if self.evals.is_empty() {
            return None;
        }
        Some(self.evals.values().sum::<f64>() / self.evals.len() as f64)
    }
}

impl PartialEq for Artifact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Artifact {}

impl std::hash::Hash for Artifact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
