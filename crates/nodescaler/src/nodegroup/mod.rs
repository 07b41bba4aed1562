//! Node group scaling engine.
//!
//! A group keeps committed nodes in its registry and nodes being launched in its pending set.
//! Index slots are tracked by an [`IndexLedger`]. The group lock only guards this bookkeeping,
//! remote calls run without it.
mod batch;
mod ledger;
mod managed;
mod reconcile;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::common::labels::{
    KubernetesLabel, LABEL_CONTROL_PLANE_ROLE, LABEL_MASTER_ROLE, LABEL_WORKER_ROLE,
};
use crate::config::{BootstrapFlavor, NodeGroupAutoscalingOptions};
use crate::context::GroupContext;
use crate::node::{LaunchLabels, Node, NodeState, NodeType};
use crate::provider::MachineSpec;
use crate::Error;

pub use batch::{plan_cycles, InflightCounter, InflightGuard};
pub use ledger::{node_name, IndexLedger, SlotState};
pub use managed::ManagedNodeSpec;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupStatus {
    #[default]
    NotCreated,
    Created,
    Deleting,
    Deleted,
}

/// Running totals per node kind. Control-plane nodes are also counted under their type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GroupCounts {
    pub control_planes: u32,
    pub external: u32,
    pub autoscaled: u32,
    pub managed: u32,
}

impl GroupCounts {
    fn counter(&mut self, node_type: NodeType) -> &mut u32 {
        match node_type {
            NodeType::External => &mut self.external,
            NodeType::Autoscaled => &mut self.autoscaled,
            NodeType::Managed => &mut self.managed,
        }
    }

    pub fn add(&mut self, node: &Node) {
        *self.counter(node.node_type) += 1;
        if node.control_plane {
            self.control_planes += 1;
        }
    }

    pub fn remove(&mut self, node: &Node) {
        let counter = self.counter(node.node_type);
        *counter = counter.saturating_sub(1);
        if node.control_plane {
            self.control_planes = self.control_planes.saturating_sub(1);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeGroupSpec {
    pub id: String,
    #[serde(default)]
    pub service_id: String,
    /// The configured `min-node` if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u32>,
    /// The configured `max-node` if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,
    /// Machine of autoscaled nodes, the configured default machine if unset.
    #[serde(default)]
    pub machine_type: Option<String>,
    #[serde(default)]
    pub node_labels: KubernetesLabel,
    #[serde(default)]
    pub system_labels: KubernetesLabel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeRole {
    Autoscaled,
    Managed,
    ControlPlane,
}

/// Serializable image of a node group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeGroupSnapshot {
    pub spec: NodeGroupSpec,
    pub status: GroupStatus,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub pending: Vec<Node>,
    pub ledger: IndexLedger,
    pub counts: GroupCounts,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default)]
struct GroupState {
    status: GroupStatus,
    registry: BTreeMap<String, Node>,
    pending: BTreeMap<String, Node>,
    /// Pending node names in the order they were requested.
    pending_order: Vec<String>,
    ledger: IndexLedger,
    counts: GroupCounts,
}

impl GroupState {
    fn target_size(&self) -> usize {
        self.registry.len() + self.pending.len()
    }

    fn find(&self, name: &str) -> Option<&Node> {
        self.registry.get(name).or_else(|| self.pending.get(name))
    }

    fn add_pending(&mut self, node: Node) {
        self.pending_order.push(node.node_name.clone());
        self.pending.insert(node.node_name.clone(), node);
    }

    fn remove_pending(&mut self, name: &str) -> Option<Node> {
        self.pending_order.retain(|pending| pending != name);
        self.pending.remove(name)
    }

    fn commit(&mut self, node: Node) {
        self.ledger.set(node.index, SlotState::Running);
        self.counts.add(&node);
        self.registry.insert(node.node_name.clone(), node);
    }
}

pub struct NodeGroup {
    spec: NodeGroupSpec,
    min_size: u32,
    max_size: u32,
    machine: MachineSpec,
    ctx: GroupContext,
    state: Mutex<GroupState>,
    inflight: InflightCounter,
    extra: serde_json::Map<String, serde_json::Value>,
}

impl NodeGroup {
    pub fn new(spec: NodeGroupSpec, ctx: GroupContext) -> crate::Result<Self> {
        let min_size = spec.min_size.unwrap_or(ctx.config.min_node);
        let max_size = spec.max_size.unwrap_or(ctx.config.max_node);
        if min_size > max_size {
            return Err(Error::Config(format!(
                "node group {} has min size {min_size} larger than max size {max_size}",
                spec.id
            )));
        }
        let machine_type = spec
            .machine_type
            .clone()
            .unwrap_or_else(|| ctx.config.default_machine.clone());
        let characteristic = ctx.config.machine(&machine_type)?;
        let machine = MachineSpec {
            instance_type: machine_type,
            disk_type: characteristic.disk_type.clone(),
            disk_size: characteristic.disk_size,
        };
        Ok(Self {
            spec,
            min_size,
            max_size,
            machine,
            ctx,
            state: Default::default(),
            inflight: Default::default(),
            extra: Default::default(),
        })
    }

    fn state(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &NodeGroupSpec {
        &self.spec
    }

    pub fn min_size(&self) -> u32 {
        self.min_size
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn context(&self) -> &GroupContext {
        &self.ctx
    }

    pub fn status(&self) -> GroupStatus {
        self.state().status
    }

    pub fn target_size(&self) -> usize {
        self.state().target_size()
    }

    /// Committed nodes ordered by name.
    pub fn nodes(&self) -> Vec<Node> {
        self.state().registry.values().cloned().collect()
    }

    /// Nodes being launched, in request order.
    pub fn pending_nodes(&self) -> Vec<Node> {
        let state = self.state();
        state
            .pending_order
            .iter()
            .filter_map(|name| state.pending.get(name).cloned())
            .collect()
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state().find(name).cloned()
    }

    pub fn counts(&self) -> GroupCounts {
        self.state().counts
    }

    pub fn ledger(&self) -> IndexLedger {
        self.state().ledger.clone()
    }

    pub fn inflight(&self) -> &InflightCounter {
        &self.inflight
    }

    pub fn options(&self, defaults: &NodeGroupAutoscalingOptions) -> NodeGroupAutoscalingOptions {
        self.ctx.config.autoscaling_options(defaults).clone()
    }

    fn launch_labels(&self) -> LaunchLabels {
        let mut node = self.ctx.config.node_labels.clone();
        node.extend(self.spec.node_labels.clone());
        LaunchLabels {
            node,
            system: self.spec.system_labels.clone(),
        }
    }

    fn role_prefix(&self, role: NodeRole) -> &str {
        let config = &self.ctx.config;
        match role {
            NodeRole::Autoscaled => &config.node_name_prefix,
            NodeRole::Managed => &config.managed_name_prefix,
            NodeRole::ControlPlane => &config.controlplane_name_prefix,
        }
    }

    fn max_per_cycle(&self) -> usize {
        self.ctx.config.max_node_per_cycle
    }

    fn ensure_created(&self) -> crate::Result<()> {
        if self.status() == GroupStatus::Created {
            Ok(())
        } else {
            Err(Error::GroupNotReady(self.spec.id.clone()))
        }
    }

    /// Marks the group as created and grows it to its minimum size.
    pub async fn create(&self) -> crate::Result<Vec<Node>> {
        {
            let mut state = self.state();
            match state.status {
                GroupStatus::NotCreated => state.status = GroupStatus::Created,
                GroupStatus::Created => return Ok(vec![]),
                GroupStatus::Deleting | GroupStatus::Deleted => {
                    return Err(Error::GroupNotReady(self.spec.id.clone()));
                }
            }
        }
        log::info!("Created node group {}", self.spec.id);
        if self.min_size > 0 {
            self.set_size(self.min_size).await
        } else {
            Ok(vec![])
        }
    }

    fn delta(&self, target: u32) -> crate::Result<i64> {
        self.ensure_created()?;
        Ok(target as i64 - self.target_size() as i64)
    }

    /// Grows or shrinks the group to `target` nodes.
    ///
    /// Returns the launched nodes on growth and the deleted nodes on shrink.
    pub async fn set_size(&self, target: u32) -> crate::Result<Vec<Node>> {
        log::debug!("Set size of node group {} to {target}", self.spec.id);
        let delta = self.delta(target)?;
        match delta.cmp(&0) {
            Ordering::Less => {
                let victims = self.select_victims(delta.unsigned_abs() as usize);
                self.destroy_nodes(victims).await
            }
            Ordering::Greater => {
                let nodes = self.stage_nodes(delta as usize).await?;
                self.launch_nodes(nodes).await
            }
            Ordering::Equal => Ok(vec![]),
        }
    }

    /// Computes the nodes `set_size(target)` would act on without launching or deleting anything.
    ///
    /// On growth the new nodes are added to the pending set and can be started with
    /// [`NodeGroup::launch_pending`].
    pub async fn prepare_size(&self, target: u32) -> crate::Result<Vec<Node>> {
        let delta = self.delta(target)?;
        match delta.cmp(&0) {
            Ordering::Less => Ok(self.select_victims(delta.unsigned_abs() as usize)),
            Ordering::Greater => self.stage_nodes(delta as usize).await,
            Ordering::Equal => Ok(vec![]),
        }
    }

    pub async fn launch_pending(&self) -> crate::Result<Vec<Node>> {
        self.ensure_created()?;
        let nodes = self
            .pending_nodes()
            .into_iter()
            .filter(|node| node.state == NodeState::NotCreated)
            .collect();
        self.launch_nodes(nodes).await
    }

    /// Picks up to `count` autoscaled nodes to remove, pending nodes first (latest request
    /// first), then committed nodes by descending index.
    fn select_victims(&self, count: usize) -> Vec<Node> {
        let state = self.state();
        let pending = state
            .pending_order
            .iter()
            .rev()
            .filter_map(|name| state.pending.get(name));
        let mut committed: Vec<&Node> = state.registry.values().collect();
        committed.sort_by(|a, b| b.index.cmp(&a.index));

        let victims: Vec<Node> = pending
            .chain(committed)
            .filter(|node| node.node_type == NodeType::Autoscaled)
            .take(count)
            .cloned()
            .collect();
        if victims.len() < count {
            log::info!(
                "Node group {}: only {} of {count} requested nodes can be removed",
                self.spec.id,
                victims.len()
            );
        }
        victims
    }

    async fn destroy_nodes(&self, victims: Vec<Node>) -> crate::Result<Vec<Node>> {
        let mut deleted = Vec::with_capacity(victims.len());
        let mut last_error = None;
        for mut node in victims {
            match node.delete(&self.ctx).await {
                Ok(()) => {
                    self.forget_node(&node);
                    deleted.push(node);
                }
                Err(error) => {
                    log::error!("Unable to delete node {}: {error}", node.instance_name);
                    last_error = Some(error);
                }
            }
        }
        match last_error {
            Some(error) => Err(Error::ShrinkFailed {
                group: self.spec.id.clone(),
                removed: deleted.into_iter().map(|node| node.node_name).collect(),
                source: Box::new(error),
            }),
            None => Ok(deleted),
        }
    }

    fn forget_node(&self, node: &Node) {
        let mut state = self.state();
        if let Some(removed) = state.registry.remove(&node.node_name) {
            state.counts.remove(&removed);
        }
        state.remove_pending(&node.node_name);
        state.ledger.set(node.index, SlotState::Deleted);
    }

    /// Reserves an index and a name that no existing instance uses.
    pub(crate) async fn allocate_slot(&self, role: NodeRole) -> crate::Result<(u32, String)> {
        let prefix = self.role_prefix(role).to_string();
        let exhausted = || Error::Provisioning {
            name: format!("{}-{prefix}", self.spec.id),
            reason: "no free node name left".to_string(),
        };
        // Every collision fills a slot, give up once the scan went well past the group size.
        let attempts = (self.max_size as usize).max(1) * 2;
        for _ in 0..attempts {
            let (index, name, tracked) = {
                let mut state = self.state();
                let index = state
                    .ledger
                    .allocate(self.max_size)
                    .ok_or_else(exhausted)?;
                let name = node_name(&self.spec.id, &prefix, index);
                let tracked = state.find(&name).is_some();
                (index, name, tracked)
            };
            let exists = tracked
                || match self.ctx.provider.exists(&name).await {
                    Ok(exists) => exists,
                    Err(error) => {
                        self.state().ledger.set(index, SlotState::NotRunning);
                        return Err(error);
                    }
                };
            if !exists {
                return Ok((index, name));
            }
            log::warn!("Instance {name} already exists, skip index {index}");
            self.state().ledger.set(index, SlotState::Running);
        }
        Err(exhausted())
    }

    pub(crate) fn build_node(&self, role: NodeRole, index: u32, name: &str) -> Node {
        let node_type = match role {
            NodeRole::Autoscaled => NodeType::Autoscaled,
            NodeRole::Managed | NodeRole::ControlPlane => NodeType::Managed,
        };
        let mut node = Node::new(&self.spec.id, name, index, node_type, self.machine.clone());
        let role_value = if self.ctx.config.bootstrap == BootstrapFlavor::K3s {
            "true"
        } else {
            ""
        };
        let labels = &mut node.extra_labels;
        if role == NodeRole::ControlPlane {
            node.control_plane = true;
            labels.insert(LABEL_MASTER_ROLE.to_string(), role_value.to_string());
            labels.insert(LABEL_CONTROL_PLANE_ROLE.to_string(), role_value.to_string());
            labels.insert("master".to_string(), "true".to_string());
        } else {
            labels.insert(LABEL_WORKER_ROLE.to_string(), role_value.to_string());
            labels.insert("worker".to_string(), "true".to_string());
        }
        node
    }

    async fn stage_nodes(&self, count: usize) -> crate::Result<Vec<Node>> {
        let mut staged: Vec<Node> = Vec::with_capacity(count);
        for _ in 0..count {
            let (index, name) = match self.allocate_slot(NodeRole::Autoscaled).await {
                Ok(slot) => slot,
                Err(error) => {
                    let mut state = self.state();
                    for node in &staged {
                        state.remove_pending(&node.node_name);
                        state.ledger.set(node.index, SlotState::NotRunning);
                    }
                    return Err(error);
                }
            };
            let node = self.build_node(NodeRole::Autoscaled, index, &name);
            self.state().add_pending(node.clone());
            staged.push(node);
        }
        Ok(staged)
    }

    pub(crate) fn stage_node(&self, node: Node) {
        self.state().add_pending(node);
    }

    /// Launches `nodes` in sequential cycles of bounded concurrency.
    ///
    /// Succeeds when at least one node was launched.
    pub(crate) async fn launch_nodes(&self, nodes: Vec<Node>) -> crate::Result<Vec<Node>> {
        let total = nodes.len();
        if total == 0 {
            return Ok(vec![]);
        }
        let labels = self.launch_labels();
        let mut queue = nodes
            .into_iter()
            .map(|node| (node, self.inflight.enter()))
            .collect::<Vec<_>>()
            .into_iter();

        let cycles = plan_cycles(total, self.max_per_cycle());
        log::debug!(
            "Launch {total} node(s) of node group {} in {} cycle(s)",
            self.spec.id,
            cycles.len()
        );

        let mut results = Vec::with_capacity(total);
        for (cycle, size) in cycles.into_iter().enumerate() {
            let launches: Vec<_> = queue.by_ref().take(size).collect();
            if size == 1 {
                for (node, guard) in launches {
                    results.push(self.launch_one(node, &labels, guard).await);
                }
            } else {
                log::debug!("Launch cycle {cycle} with {size} node(s)");
                let futures = launches
                    .into_iter()
                    .map(|(node, guard)| self.launch_one(node, &labels, guard));
                results.extend(join_all(futures).await);
                log::debug!("Finished cycle {cycle}");
            }
        }

        let mut created = Vec::with_capacity(total);
        let mut last_error = None;
        for result in results {
            match result {
                Ok(node) => created.push(node),
                Err(error) => last_error = Some(error),
            }
        }
        if self.status() != GroupStatus::Created {
            log::error!(
                "Node group {} was deleted while launching {total} node(s)",
                self.spec.id
            );
            return Err(Error::GroupNotCreated(self.spec.id.clone()));
        }
        if let (true, Some(error)) = (created.is_empty(), last_error) {
            log::error!("Launch of {total} node(s) in node group {} failed", self.spec.id);
            return Err(Error::GroupLaunchFailed {
                group: self.spec.id.clone(),
                count: total,
                source: Box::new(error),
            });
        }
        log::info!(
            "Launched {}/{total} node(s) in node group {}",
            created.len(),
            self.spec.id
        );
        Ok(created)
    }

    async fn launch_one(
        &self,
        mut node: Node,
        labels: &LaunchLabels,
        _guard: InflightGuard,
    ) -> crate::Result<Node> {
        if self.status() != GroupStatus::Created {
            let mut state = self.state();
            state.remove_pending(&node.node_name);
            state.ledger.set(node.index, SlotState::NotRunning);
            log::debug!(
                "Skip launch of node {}, node group {} is not ready",
                node.instance_name,
                self.spec.id
            );
            return Err(Error::GroupNotReady(self.spec.id.clone()));
        }

        let result = node.launch(&self.ctx, labels).await;

        let mut state = self.state();
        state.remove_pending(&node.node_name);
        match result {
            Ok(()) => {
                state.commit(node.clone());
                Ok(node)
            }
            // The name belongs to an instance this group does not track, keep the slot taken.
            Err(error) if error.is_already_exists() => {
                log::warn!(
                    "Instance {} appeared before its launch, skip index {}",
                    node.instance_name,
                    node.index
                );
                state.ledger.set(node.index, SlotState::Running);
                Err(error)
            }
            Err(error) => {
                state.ledger.set(node.index, SlotState::Deleted);
                Err(error)
            }
        }
    }

    /// Deletes one node of the group. External nodes are refused.
    pub async fn delete_node_by_name(&self, name: &str) -> crate::Result<Node> {
        let mut node = self.node(name).ok_or_else(|| {
            Error::NotFound(format!("Node {name} in node group {}", self.spec.id))
        })?;
        if !node.node_type.is_owned() {
            return Err(Error::NotOwned(name.to_string()));
        }
        node.delete(&self.ctx).await?;
        self.forget_node(&node);
        Ok(node)
    }

    /// Tears the group down once in-flight launches have finished.
    ///
    /// Only autoscaled nodes are deleted, managed and external nodes are left to their owners.
    pub async fn delete_group(&self) -> crate::Result<()> {
        log::info!("Delete node group {}", self.spec.id);
        self.state().status = GroupStatus::Deleting;
        self.inflight.wait_idle().await;

        let nodes: Vec<Node> = {
            let state = self.state();
            state
                .registry
                .values()
                .chain(state.pending.values())
                .filter(|node| node.node_type == NodeType::Autoscaled)
                .cloned()
                .collect()
        };
        let mut last_error = None;
        for mut node in nodes {
            if let Err(error) = node.delete(&self.ctx).await {
                log::error!(
                    "Unable to delete node {} of node group {}: {error}",
                    node.instance_name,
                    self.spec.id
                );
                last_error = Some(error);
            }
        }

        *self.state() = GroupState {
            status: GroupStatus::Deleted,
            ..Default::default()
        };
        log::info!("Deleted node group {}", self.spec.id);
        last_error.map_or(Ok(()), Err)
    }

    fn update_node(&self, node: Node) {
        if let Some(entry) = self.state().registry.get_mut(&node.node_name) {
            *entry = node;
        }
    }

    /// Refreshes the status of every committed node.
    pub async fn refresh(&self) {
        for mut node in self.nodes() {
            if let Err(error) = node.status_refresh(&self.ctx).await {
                log::info!("Unable to refresh status of node {}: {error}", node.node_name);
            }
            self.update_node(node);
        }
    }

    /// Whether the named node exists and its instance is running.
    pub async fn has_instance(&self, name: &str) -> crate::Result<bool> {
        let mut node = self.node(name).ok_or_else(|| {
            Error::NotFound(format!("Node {name} in node group {}", self.spec.id))
        })?;
        let state = node.status_refresh(&self.ctx).await?;
        self.update_node(node);
        Ok(state == NodeState::Running)
    }

    /// Image of the group. The saved spec carries the resolved size bounds.
    pub fn snapshot(&self) -> NodeGroupSnapshot {
        let state = self.state();
        NodeGroupSnapshot {
            spec: NodeGroupSpec {
                min_size: Some(self.min_size),
                max_size: Some(self.max_size),
                ..self.spec.clone()
            },
            status: state.status,
            nodes: state.registry.values().cloned().collect(),
            pending: state
                .pending_order
                .iter()
                .filter_map(|name| state.pending.get(name).cloned())
                .collect(),
            ledger: state.ledger.clone(),
            counts: state.counts,
            extra: self.extra.clone(),
        }
    }

    /// Rebuilds a group from a snapshot. Instance handles are looked up again on demand.
    pub fn restore(snapshot: NodeGroupSnapshot, ctx: GroupContext) -> crate::Result<Self> {
        let NodeGroupSnapshot {
            spec,
            status,
            nodes,
            pending,
            ledger,
            counts,
            extra,
        } = snapshot;
        let mut group = NodeGroup::new(spec, ctx)?;
        group.extra = extra;
        {
            let mut state = group.state();
            state.status = status;
            state.ledger = ledger;
            state.counts = counts;
            for node in nodes {
                state.registry.insert(node.node_name.clone(), node);
            }
            for node in pending {
                state.add_pending(node);
            }
        }
        Ok(group)
    }
}
