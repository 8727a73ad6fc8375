//! Experiment result persistence.
//!
//! Per-trial results are serialized as JSON with the configuration
//! snapshot and a results list. Final density matrices are stored as
//! separate binary `.qu` files; the JSON carries only the filename
//! reference.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entangled-pair record inside a trial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairRecord {
    /// Local node name.
    pub node: String,
    /// Local memory name.
    pub memory: String,
    /// Remote node name.
    pub remote_node: String,
    /// Remote memory name.
    pub remote_memory: String,
    /// Bookkeeping fidelity at record time.
    pub fidelity: f64,
    /// Simulation time of the record (ps).
    pub time: u64,
}

/// One trial's results.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrialResult {
    /// Pairs as first entangled.
    #[serde(rename = "initial entangled states")]
    pub initial_entangled_states: Vec<PairRecord>,
    /// Pairs surviving distillation.
    #[serde(rename = "purified states")]
    pub purified_states: Vec<PairRecord>,
    /// Filename of the `.qu` density-matrix dump, when one was produced.
    #[serde(rename = "GHZ state")]
    pub ghz_state: Option<String>,
}

impl TrialResult {
    /// Attaches a density-matrix file handle. The suffix is normalized to
    /// `.qu`; the file contents are written by the state server, not here.
    pub fn with_ghz_file(mut self, stem: &str) -> Self {
        let name = if stem.ends_with(".qu") {
            stem.to_string()
        } else {
            format!("{stem}.qu")
        };
        self.ghz_state = Some(name);
        self
    }
}

/// A full experiment record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResults {
    /// Simulation parameters (seed, stop time, formalism, ...).
    pub simulation_config: Value,
    /// The topology document the run consumed.
    pub network_config: Value,
    /// Per-trial results.
    pub results: Vec<TrialResult>,
}

impl ExperimentResults {
    /// Creates an experiment record from configuration snapshots.
    pub fn new(simulation_config: Value, network_config: Value) -> Self {
        Self {
            simulation_config,
            network_config,
            results: Vec::new(),
        }
    }

    /// Appends one trial.
    pub fn push_trial(&mut self, trial: TrialResult) {
        self.results.push(trial);
    }

    /// Writes the record as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("serialize experiment results")?;
        std::fs::write(path, text)
            .with_context(|| format!("write experiment results to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair() -> PairRecord {
        PairRecord {
            node: "r1".into(),
            memory: "r1.memo[0]".into(),
            remote_node: "r2".into(),
            remote_memory: "r2.memo[0]".into(),
            fidelity: 0.9,
            time: 1_000,
        }
    }

    #[test]
    fn serializes_with_spec_field_names() {
        let mut results =
            ExperimentResults::new(json!({"seed": 0}), json!({"nodes": []}));
        let trial = TrialResult {
            initial_entangled_states: vec![pair()],
            purified_states: vec![],
            ghz_state: None,
        }
        .with_ghz_file("trial0");
        results.push_trial(trial);

        let text = serde_json::to_string(&results).expect("serialize");
        assert!(text.contains("\"initial entangled states\""));
        assert!(text.contains("\"purified states\""));
        assert!(text.contains("\"GHZ state\":\"trial0.qu\""));
    }

    #[test]
    fn round_trips_through_json() {
        let mut results = ExperimentResults::new(json!({}), json!({}));
        results.push_trial(TrialResult {
            initial_entangled_states: vec![pair()],
            purified_states: vec![pair()],
            ghz_state: Some("x.qu".into()),
        });

        let text = serde_json::to_string(&results).expect("serialize");
        let back: ExperimentResults = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back.results.len(), 1);
        assert_eq!(back.results[0].initial_entangled_states[0], pair());
    }

    #[test]
    fn qu_suffix_is_normalized() {
        let trial = TrialResult::default().with_ghz_file("state.qu");
        assert_eq!(trial.ghz_state.as_deref(), Some("state.qu"));
        let trial = TrialResult::default().with_ghz_file("state");
        assert_eq!(trial.ghz_state.as_deref(), Some("state.qu"));
    }
}
