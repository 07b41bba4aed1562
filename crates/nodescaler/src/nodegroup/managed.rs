//! Nodes driven by a declarative managed node resource instead of the group size.
use serde::{Deserialize, Serialize};

use crate::common::labels::create_label_or_annotation;
use crate::node::Node;
use crate::nodegroup::{NodeGroup, NodeRole};
use crate::provider::{MachineSpec, NetworkSpec};
use crate::Error;

fn default_true() -> bool {
    true
}

/// Desired shape of a managed node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManagedNodeSpec {
    #[serde(default)]
    pub control_plane: bool,
    #[serde(default = "default_true")]
    pub allow_deployment: bool,
    /// Falls back to the machine of the group.
    #[serde(default)]
    pub instance_type: Option<String>,
    /// Disk size in MiB, clamped to the configured limits.
    #[serde(default)]
    pub disk_size: Option<u64>,
    #[serde(default)]
    pub disk_type: Option<String>,
    /// `key=value` entries.
    #[serde(default)]
    pub labels: Vec<String>,
    /// `key=value` entries.
    #[serde(default)]
    pub annotations: Vec<String>,
    #[serde(default)]
    pub network: Option<NetworkSpec>,
}

impl Default for ManagedNodeSpec {
    fn default() -> Self {
        Self {
            control_plane: false,
            allow_deployment: true,
            instance_type: None,
            disk_size: None,
            disk_type: None,
            labels: vec![],
            annotations: vec![],
            network: None,
        }
    }
}

impl NodeGroup {
    fn managed_machine(&self, spec: &ManagedNodeSpec) -> crate::Result<MachineSpec> {
        let config = &self.ctx.config;
        let mut machine = match &spec.instance_type {
            Some(instance_type) => {
                let characteristic = config.machine(instance_type)?;
                MachineSpec {
                    instance_type: instance_type.clone(),
                    disk_type: characteristic.disk_type.clone(),
                    disk_size: characteristic.disk_size,
                }
            }
            None => self.machine.clone(),
        };
        if let Some(disk_type) = &spec.disk_type {
            machine.disk_type = disk_type.clone();
        }
        machine.disk_size = config
            .managednodes_limits
            .clamp_disk_size(spec.disk_size.unwrap_or(machine.disk_size));
        Ok(machine)
    }

    /// Creates and launches a node for the managed node resource identified by `uid`.
    pub async fn add_managed_node(&self, spec: &ManagedNodeSpec, uid: &str) -> crate::Result<Node> {
        self.ensure_created()?;
        if let Some(node) = self.find_node_by_crd_uid(uid) {
            return Err(Error::AlreadyExists(node.node_name));
        }
        let machine = self.managed_machine(spec)?;
        let role = if spec.control_plane {
            NodeRole::ControlPlane
        } else {
            NodeRole::Managed
        };

        let (index, name) = self.allocate_slot(role).await?;
        let mut node = self.build_node(role, index, &name);
        node.machine = machine;
        node.allow_deployment = spec.allow_deployment;
        node.crd_uid = Some(uid.to_string());
        node.network = spec.network.clone();
        node.extra_labels
            .extend(create_label_or_annotation(&spec.labels));
        node.extra_annotations
            .extend(create_label_or_annotation(&spec.annotations));

        log::info!(
            "Add managed node {name} to node group {} for resource {uid}",
            self.spec.id
        );
        self.stage_node(node.clone());
        self.launch_one(node, &self.launch_labels(), self.inflight.enter())
            .await
    }

    pub fn find_node_by_crd_uid(&self, uid: &str) -> Option<Node> {
        let state = self.state();
        state
            .registry
            .values()
            .chain(state.pending.values())
            .find(|node| node.crd_uid.as_deref() == Some(uid))
            .cloned()
    }
}
