use std::time::Duration;

use thiserror::Error;

use crate::node::{LaunchStep, NodeState};

#[derive(Debug, Error)]
pub enum ScalerError {
    #[error("Unable to provision instance {name}: {reason}")]
    Provisioning { name: String, reason: String },
    #[error("Instance {0} already exists")]
    AlreadyExists(String),
    #[error("Timeout after {timeout:?} while waiting for {what}")]
    Timeout { what: String, timeout: Duration },
    #[error("Node {node} was unable to join the cluster: {reason}")]
    JoinCluster { node: String, reason: String },
    #[error("Unable to bootstrap node {node}: {reason}")]
    Bootstrap { node: String, reason: String },
    #[error("Unable to update node {node}: {reason}")]
    Annotation { node: String, reason: String },
    #[error("Node {0} is not managed by this node group")]
    NotOwned(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Node group {0} is not ready")]
    GroupNotReady(String),
    #[error("Node group {0} was deleted while its nodes were being launched")]
    GroupNotCreated(String),
    #[error("Unable to launch any of the {count} node(s) of node group {group}: {source}")]
    GroupLaunchFailed {
        group: String,
        count: usize,
        source: Box<ScalerError>,
    },
    #[error(
        "Unable to remove every requested node of node group {group}, removed [{}]: {source}",
        .removed.join(", ")
    )]
    ShrinkFailed {
        group: String,
        removed: Vec<String>,
        source: Box<ScalerError>,
    },
    #[error("Provider error for {name}: {reason}")]
    Provider { name: String, reason: String },
    #[error("Unable to register DNS record for {node}: {reason}")]
    Dns { node: String, reason: String },
    #[error("Node {node} is {state}, expected {expected}")]
    InvalidState {
        node: String,
        state: NodeState,
        expected: NodeState,
    },
    #[error("Launch of node {node} failed at step {step}: {source}")]
    Step {
        node: String,
        step: LaunchStep,
        source: Box<ScalerError>,
    },
    #[error("Invalid provider id: {0}")]
    InvalidProviderId(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ScalerError {
    pub fn provider(name: &str, error: impl std::fmt::Display) -> Self {
        ScalerError::Provider {
            name: name.to_string(),
            reason: error.to_string(),
        }
    }

    /// Returns the innermost error, looking through launch step wrappers.
    pub fn root(&self) -> &ScalerError {
        match self {
            ScalerError::Step { source, .. } => source.root(),
            error => error,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), ScalerError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), ScalerError::AlreadyExists(_))
    }

    pub fn is_group_not_ready(&self) -> bool {
        matches!(self.root(), ScalerError::GroupNotReady(_))
    }

    /// Step of the launch pipeline that produced this error, if any.
    pub fn failed_step(&self) -> Option<LaunchStep> {
        match self {
            ScalerError::Step { step, .. } => Some(*step),
            ScalerError::GroupLaunchFailed { source, .. } => source.failed_step(),
            _ => None,
        }
    }
}
