//! Kubernetes API operations consumed by the node lifecycle and the reconciler.
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::common::labels::{KubernetesLabel, LABEL_CONTROL_PLANE_ROLE, LABEL_MASTER_ROLE};
use crate::common::wait::poll_until;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

impl Taint {
    pub fn control_plane_no_schedule() -> Self {
        Self {
            key: LABEL_CONTROL_PLANE_ROLE.to_string(),
            value: String::new(),
            effect: TaintEffect::NoSchedule,
        }
    }
}

/// Capacity reported by the kubelet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeCapacity {
    pub cpu: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

/// Snapshot of a cluster node object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClusterNode {
    pub name: String,
    pub annotations: KubernetesLabel,
    pub labels: KubernetesLabel,
    pub taints: Vec<Taint>,
    pub internal_address: Option<String>,
    pub capacity: NodeCapacity,
    pub ready: bool,
    /// UID of the controlling managed node resource, if any.
    pub owner_uid: Option<String>,
    pub provider_id: Option<String>,
}

impl ClusterNode {
    pub fn is_control_plane(&self) -> bool {
        self.labels.contains_key(LABEL_CONTROL_PLANE_ROLE)
            || self.labels.contains_key(LABEL_MASTER_ROLE)
    }

    /// A node accepts workloads unless a control-plane `NoSchedule` taint keeps them away.
    pub fn allows_deployment(&self) -> bool {
        !self.taints.iter().any(|taint| {
            (taint.key == LABEL_CONTROL_PLANE_ROLE || taint.key == LABEL_MASTER_ROLE)
                && taint.effect == TaintEffect::NoSchedule
        })
    }
}

pub trait ClusterClient: Send + Sync {
    fn list_nodes(&self) -> BoxFuture<'_, crate::Result<Vec<ClusterNode>>>;

    /// Returns [`crate::Error::NotFound`] if the node is not registered.
    fn get_node<'a>(&'a self, name: &'a str) -> BoxFuture<'a, crate::Result<ClusterNode>>;

    fn annotate_node<'a>(
        &'a self,
        name: &'a str,
        annotations: &'a KubernetesLabel,
    ) -> BoxFuture<'a, crate::Result<()>>;

    fn label_node<'a>(
        &'a self,
        name: &'a str,
        labels: &'a KubernetesLabel,
    ) -> BoxFuture<'a, crate::Result<()>>;

    fn taint_node<'a>(&'a self, name: &'a str, taint: &'a Taint)
    -> BoxFuture<'a, crate::Result<()>>;

    fn cordon_node<'a>(&'a self, name: &'a str) -> BoxFuture<'a, crate::Result<()>>;

    fn uncordon_node<'a>(&'a self, name: &'a str) -> BoxFuture<'a, crate::Result<()>>;

    fn mark_node_draining<'a>(&'a self, name: &'a str) -> BoxFuture<'a, crate::Result<()>>;

    /// Evicts the pods of the node, giving each at most `grace_period` to terminate.
    fn drain_node<'a>(
        &'a self,
        name: &'a str,
        ignore_daemon_sets: bool,
        delete_local_data: bool,
        grace_period: Duration,
    ) -> BoxFuture<'a, crate::Result<()>>;

    fn delete_node<'a>(&'a self, name: &'a str) -> BoxFuture<'a, crate::Result<()>>;

    fn set_provider_id<'a>(
        &'a self,
        name: &'a str,
        provider_id: &'a str,
    ) -> BoxFuture<'a, crate::Result<()>>;

    /// Polls the node until it reports `Ready`. A missing node is polled again, since a
    /// freshly joined kubelet may not have registered yet.
    fn wait_node_ready<'a>(
        &'a self,
        name: &'a str,
        timeout: Option<Duration>,
        interval: Duration,
    ) -> BoxFuture<'a, crate::Result<ClusterNode>> {
        Box::pin(async move {
            let what = format!("node {name} to be ready");
            poll_until(&what, timeout, interval, || async {
                match self.get_node(name).await {
                    Ok(node) if node.ready => {
                        log::info!("The kubernetes node {name} is Ready");
                        Ok(Some(node))
                    }
                    Ok(_) => Ok(None),
                    Err(error) if error.is_not_found() => Ok(None),
                    Err(error) => Err(error),
                }
            })
            .await
        })
    }
}
