//! Topology configuration schema.
//!
//! The JSON the core consumes. Field names and the closed node-type set
//! follow the external interface contract; `qchannels`/`cchannels` are
//! accepted as aliases of the connection lists, and the per-node `group`
//! field of the parallel variant is parsed and ignored.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Configuration-loading errors. All fatal at init time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The JSON could not be parsed.
    #[error("failed to parse topology JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// A connection references an undeclared node.
    #[error("connection references unknown node {0}")]
    UnknownNode(String),

    /// Two nodes share one name.
    #[error("duplicate node name {0}")]
    DuplicateNode(String),

    /// A BSM node is not joined to exactly two routers.
    #[error("BSM node {0} must join exactly two routers, found {1}")]
    BadBsmDegree(String, usize),
}

/// Stop time: a picosecond count or unbounded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StopTimeConfig {
    /// Run until this time (ps).
    At(u64),
    /// Run until the event queue drains.
    Infinity(String),
}

impl<'de> Deserialize<'de> for StopTimeConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(StopTimeConfig::At(n as u64)),
            Raw::Text(s) if s.eq_ignore_ascii_case("infinity") => {
                Ok(StopTimeConfig::Infinity(s))
            }
            Raw::Text(s) => Err(serde::de::Error::custom(format!(
                "invalid stop_time: {s:?} (number or \"Infinity\")"
            ))),
        }
    }
}

impl StopTimeConfig {
    /// Converts to the kernel stop-time contract.
    pub fn to_stop_time(&self) -> photonq_kernel::StopTime {
        match self {
            StopTimeConfig::At(t) => photonq_kernel::StopTime::At(*t),
            StopTimeConfig::Infinity(_) => photonq_kernel::StopTime::Never,
        }
    }
}

/// The closed set of node construction recipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// End router with memory array and the full protocol stack.
    QuantumRouter,
    /// Middle herald node with BSM detectors.
    BSMNode,
    /// QKD end node with an optional cascade stack.
    QKDNode,
    /// Router extended with a data-memory array.
    DQCNode,
}

/// One node declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node name.
    pub name: String,
    /// Construction recipe.
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Per-node seed folded into the RNG stream derivation.
    #[serde(default)]
    pub seed: u64,
    /// Memory array size (routers; default 50).
    #[serde(default = "default_memo_size")]
    pub memo_size: usize,
    /// QKD stack depth: 1 = BB84 only, 2 = BB84 + cascade.
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
    /// Process group of the parallel variant; ignored by the core.
    #[serde(default)]
    pub group: Option<u64>,
}

fn default_memo_size() -> usize {
    50
}

fn default_stack_size() -> usize {
    2
}

/// One quantum connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantumConnection {
    /// First endpoint.
    pub node1: String,
    /// Second endpoint.
    pub node2: String,
    /// Fiber attenuation (dB/m).
    #[serde(default)]
    pub attenuation: f64,
    /// Fiber length (m).
    pub distance: f64,
    /// Connection flavor; `meet_in_the_middle` between two routers
    /// auto-creates a BSM node halfway.
    #[serde(rename = "type", default)]
    pub connection_type: Option<String>,
}

/// One classical connection (bidirectional, lossless).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassicalConnection {
    /// First endpoint.
    pub node1: String,
    /// Second endpoint.
    pub node2: String,
    /// One-way delay (ps).
    pub delay: u64,
}

/// Top-level topology description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Parallel-execution flag; the core accepts and ignores it.
    #[serde(default)]
    pub is_parallel: bool,
    /// Stop time (ps, or "Infinity").
    pub stop_time: StopTimeConfig,
    /// Node declarations.
    pub nodes: Vec<NodeConfig>,
    /// Quantum connections.
    #[serde(default, alias = "qchannels")]
    pub qconnections: Vec<QuantumConnection>,
    /// Classical connections.
    #[serde(default, alias = "cchannels")]
    pub cconnections: Vec<ClassicalConnection>,
}

impl TopologyConfig {
    /// Parses a topology from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: TopologyConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation: unique names, known endpoints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(ConfigError::DuplicateNode(node.name.clone()));
            }
        }
        for qc in &self.qconnections {
            for endpoint in [&qc.node1, &qc.node2] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(ConfigError::UnknownNode(endpoint.clone()));
                }
            }
        }
        for cc in &self.cconnections {
            for endpoint in [&cc.node1, &cc.node2] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(ConfigError::UnknownNode(endpoint.clone()));
                }
            }
        }
        Ok(())
    }
}
