//! Cloud-provider backend for a Kubernetes cluster autoscaler.
//!
//! A [`NodeGroup`](nodegroup::NodeGroup) keeps a pool of cloud instances at a requested size.
//! Instances are driven through the [`Node`](node::Node) lifecycle, which delegates every remote
//! effect to injected collaborators: a VM provider, a cluster client and a bootstrapper.
pub mod bootstrap;
pub mod cluster;
pub mod common;
pub mod config;
pub mod context;
pub mod node;
pub mod nodegroup;
pub mod provider;
pub mod state;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::ScalerError;
pub type Result<T> = std::result::Result<T, Error>;

pub use context::GroupContext;
pub use node::{Node, NodeState, NodeType};
pub use nodegroup::{GroupStatus, NodeGroup, NodeGroupSpec};
