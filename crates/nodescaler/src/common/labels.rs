//! Label, annotation and taint keys written onto cluster nodes.
use std::collections::BTreeMap;

pub type KubernetesLabel = BTreeMap<String, String>;

pub const ANNOTATION_NODE_GROUP: &str = "cluster.autoscaler.nodegroup/name";
pub const ANNOTATION_INSTANCE_ID: &str = "cluster.autoscaler.nodegroup/instance-id";
pub const ANNOTATION_INSTANCE_NAME: &str = "cluster.autoscaler.nodegroup/instance-name";
pub const ANNOTATION_NODE_INDEX: &str = "cluster.autoscaler.nodegroup/node-index";
pub const ANNOTATION_AUTO_PROVISIONED: &str = "cluster.autoscaler.nodegroup/autoprovision";
pub const ANNOTATION_MANAGED: &str = "cluster.autoscaler.nodegroup/managed";
pub const ANNOTATION_SCALE_DOWN_DISABLED: &str =
    "cluster-autoscaler.kubernetes.io/scale-down-disabled";

pub const LABEL_WORKER_ROLE: &str = "node-role.kubernetes.io/worker";
pub const LABEL_CONTROL_PLANE_ROLE: &str = "node-role.kubernetes.io/control-plane";
pub const LABEL_MASTER_ROLE: &str = "node-role.kubernetes.io/master";
pub const LABEL_TOPOLOGY_REGION: &str = "topology.kubernetes.io/region";
pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";

/// Parses `key=value` strings into a label map.
///
/// Entries without `=` become keys with an empty value.
pub fn create_label_or_annotation(values: &[String]) -> KubernetesLabel {
    values
        .iter()
        .filter(|value| !value.trim().is_empty())
        .map(|value| match value.split_once('=') {
            Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
            None => (value.trim().to_string(), String::new()),
        })
        .collect()
}

/// Returns the entries of `desired` that are missing or different in `current`.
pub fn stale_entries(current: &KubernetesLabel, desired: &KubernetesLabel) -> KubernetesLabel {
    desired
        .iter()
        .filter(|(key, value)| current.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

pub fn parse_bool(values: &KubernetesLabel, key: &str) -> bool {
    values
        .get(key)
        .and_then(|value| value.parse::<bool>().ok())
        .unwrap_or(false)
}
