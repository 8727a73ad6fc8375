//! # photonq-topology: Network Construction
//!
//! Turns a topology description (the JSON the core consumes, or a
//! programmatic builder) into a ready-to-run [`photonq_net::Network`]:
//! node recipes per declared type, channel wiring with dangling-endpoint
//! checks, automatic BSM middle nodes for meet-in-the-middle connections,
//! and shortest-path forwarding tables with deterministic tie-breaking.
//! Also holds the experiment result serializer.

mod builder;
mod config;
mod results;

pub use builder::Topology;
pub use config::{
    ClassicalConnection, ConfigError, NodeConfig, NodeType, QuantumConnection, StopTimeConfig,
    TopologyConfig,
};
pub use results::{ExperimentResults, PairRecord, TrialResult};
