//! Rebuilds the state of a node group from the node list reported by the cluster.
use std::collections::{BTreeMap, BTreeSet};

use crate::cluster::ClusterNode;
use crate::common::labels::{
    parse_bool, stale_entries, ANNOTATION_AUTO_PROVISIONED, ANNOTATION_INSTANCE_NAME,
    ANNOTATION_MANAGED, ANNOTATION_NODE_GROUP, ANNOTATION_NODE_INDEX,
};
use crate::node::{Node, NodeState, NodeType};
use crate::nodegroup::{GroupState, NodeGroup, SlotState};

fn node_type_of(cluster_node: &ClusterNode) -> NodeType {
    if parse_bool(&cluster_node.annotations, ANNOTATION_AUTO_PROVISIONED) {
        NodeType::Autoscaled
    } else if parse_bool(&cluster_node.annotations, ANNOTATION_MANAGED) {
        NodeType::Managed
    } else {
        NodeType::External
    }
}

/// Index recorded on the node. Indices too close to `u32::MAX` to leave room for minting one
/// index per member are ignored, those nodes get a minted index instead.
fn annotated_index(cluster_node: &ClusterNode, headroom: u32) -> Option<u32> {
    cluster_node
        .annotations
        .get(ANNOTATION_NODE_INDEX)
        .and_then(|index| index.parse::<u32>().ok())
        .filter(|index| *index > 0 && index.checked_add(headroom).is_some())
}

impl NodeGroup {
    /// Lists the cluster nodes and reconciles the group against them.
    pub async fn reconcile_from_cluster(&self) -> crate::Result<()> {
        let cluster_nodes = self.ctx.cluster.list_nodes().await?;
        self.reconcile(&cluster_nodes).await
    }

    /// Replaces registry, pending set, ledger and counts with what `cluster_nodes` shows.
    ///
    /// Previously tracked nodes that are gone from the cluster get their instance deleted.
    pub async fn reconcile(&self, cluster_nodes: &[ClusterNode]) -> crate::Result<()> {
        let include_existing = self.ctx.config.include_existing_node;
        let mut members: Vec<&ClusterNode> = cluster_nodes
            .iter()
            .filter(|node| {
                node.annotations.get(ANNOTATION_NODE_GROUP).map(String::as_str)
                    == Some(self.spec.id.as_str())
            })
            .filter(|&node| include_existing || node_type_of(node) == NodeType::Autoscaled)
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        log::debug!(
            "Reconcile node group {} with {} cluster node(s)",
            self.spec.id,
            members.len()
        );

        let (former, status) = {
            let state = self.state();
            (state.registry.clone(), state.status)
        };

        // Annotated indices are claimed first so that minted ones never collide with them.
        let headroom = u32::try_from(members.len()).unwrap_or(u32::MAX);
        let mut indices: BTreeMap<&str, u32> = BTreeMap::new();
        let mut claimed = BTreeSet::new();
        for &cluster_node in &members {
            if let Some(index) = annotated_index(cluster_node, headroom) {
                if claimed.insert(index) {
                    indices.insert(cluster_node.name.as_str(), index);
                } else {
                    log::warn!(
                        "Node {} reuses index {index} in node group {}",
                        cluster_node.name,
                        self.spec.id
                    );
                }
            }
        }

        let mut rebuilt = GroupState {
            status,
            ..Default::default()
        };
        for index in &claimed {
            rebuilt.ledger.set(*index, SlotState::NotRunning);
        }

        for &cluster_node in &members {
            let index = match indices.get(cluster_node.name.as_str()) {
                Some(index) => *index,
                None => match rebuilt.ledger.mint() {
                    Some(index) => index,
                    None => {
                        log::warn!(
                            "Skip node {} of node group {}, no index left",
                            cluster_node.name,
                            self.spec.id
                        );
                        continue;
                    }
                },
            };
            match self.reconcile_node(cluster_node, index, former.get(&cluster_node.name)).await {
                Some(node) => rebuilt.commit(node),
                None => rebuilt.ledger.set(index, SlotState::NotRunning),
            }
        }

        let live: BTreeSet<&str> = members.iter().map(|node| node.name.as_str()).collect();
        let orphans: Vec<Node> = former
            .into_values()
            .filter(|node| node.node_type.is_owned() && !live.contains(node.node_name.as_str()))
            .collect();

        *self.state() = rebuilt;

        for mut node in orphans {
            log::info!(
                "Node {} of node group {} is gone from the cluster, delete its instance",
                node.node_name,
                self.spec.id
            );
            if let Err(error) = node.delete(&self.ctx).await {
                log::error!("Unable to delete orphaned node {}: {error}", node.node_name);
            }
        }
        Ok(())
    }

    async fn reconcile_node(
        &self,
        cluster_node: &ClusterNode,
        index: u32,
        former: Option<&Node>,
    ) -> Option<Node> {
        let instance_name = cluster_node
            .annotations
            .get(ANNOTATION_INSTANCE_NAME)
            .cloned()
            .unwrap_or_else(|| cluster_node.name.clone());
        let instance = match self.ctx.provider.find_instance(&instance_name).await {
            Ok(instance) => instance,
            Err(error) => {
                log::warn!(
                    "Skip node {} of node group {}, instance {instance_name} is unavailable: {error}",
                    cluster_node.name,
                    self.spec.id
                );
                return None;
            }
        };
        let status = match instance.status().await {
            Ok(status) => status,
            Err(error) => {
                log::warn!("Unable to read status of instance {instance_name}: {error}");
                return None;
            }
        };

        let node_type = node_type_of(cluster_node);
        let mut node = match former {
            Some(node) => node.clone(),
            None => Node::new(
                &self.spec.id,
                &instance_name,
                index,
                node_type,
                self.machine.clone(),
            ),
        };
        node.node_name = cluster_node.name.clone();
        node.instance_name = instance_name;
        node.index = index;
        node.node_type = node_type;
        node.control_plane = cluster_node.is_control_plane();
        node.allow_deployment = cluster_node.allows_deployment();
        node.capacity = Some(cluster_node.capacity);
        if cluster_node.owner_uid.is_some() {
            node.crd_uid = cluster_node.owner_uid.clone();
        }
        node.address = cluster_node
            .internal_address
            .clone()
            .or(status.address)
            .or(node.address);
        node.state = if status.powered {
            NodeState::Running
        } else {
            NodeState::Stopped
        };
        node.attach_instance(instance);

        if node_type.is_owned() {
            let stale = stale_entries(&cluster_node.annotations, &node.desired_annotations());
            if !stale.is_empty() {
                log::debug!("Update {} annotation(s) of node {}", stale.len(), node.node_name);
                if let Err(error) = self.ctx.cluster.annotate_node(&node.node_name, &stale).await {
                    log::warn!("Unable to annotate node {}: {error}", node.node_name);
                }
            }
        }
        Some(node)
    }
}
