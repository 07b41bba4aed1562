//! Lifecycle of a single node: launch, stop, start and delete.
mod pipeline;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster::NodeCapacity;
use crate::common::labels::{
    KubernetesLabel, ANNOTATION_AUTO_PROVISIONED, ANNOTATION_INSTANCE_ID,
    ANNOTATION_INSTANCE_NAME, ANNOTATION_MANAGED, ANNOTATION_NODE_GROUP, ANNOTATION_NODE_INDEX,
    ANNOTATION_SCALE_DOWN_DISABLED, LABEL_TOPOLOGY_REGION, LABEL_TOPOLOGY_ZONE,
};
use crate::context::GroupContext;
use crate::provider::{wait_for_address, InstanceRef, MachineSpec, NetworkSpec, ProviderIdentity};
use crate::Error;

pub use pipeline::LaunchStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    NotCreated,
    Creating,
    Running,
    Stopped,
    Deleted,
    Undefined,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeState::NotCreated => "not-created",
            NodeState::Creating => "creating",
            NodeState::Running => "running",
            NodeState::Stopped => "stopped",
            NodeState::Deleted => "deleted",
            NodeState::Undefined => "undefined",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    /// Pre-existing node, tracked read-only.
    External,
    /// Created and destroyed to satisfy the group size.
    Autoscaled,
    /// Driven by a declarative managed node resource.
    Managed,
}

impl NodeType {
    pub fn is_owned(self) -> bool {
        self != NodeType::External
    }
}

/// Labels the owning group applies to each node it launches.
#[derive(Debug, Clone, Default)]
pub struct LaunchLabels {
    pub node: KubernetesLabel,
    pub system: KubernetesLabel,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Node {
    pub group: String,
    /// Name of the cloud instance.
    pub instance_name: String,
    /// Name of the cluster node object, which can differ from the instance name.
    pub node_name: String,
    pub index: u32,
    pub node_type: NodeType,
    #[serde(default)]
    pub control_plane: bool,
    #[serde(default = "default_true")]
    pub allow_deployment: bool,
    pub machine: MachineSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSpec>,
    #[serde(default)]
    pub address: Option<String>,
    pub state: NodeState,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// UID of the managed node resource this node was created for.
    #[serde(default)]
    pub crd_uid: Option<String>,
    #[serde(default)]
    pub capacity: Option<NodeCapacity>,
    #[serde(default)]
    pub extra_labels: KubernetesLabel,
    #[serde(default)]
    pub extra_annotations: KubernetesLabel,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
    #[serde(skip)]
    instance: Option<InstanceRef>,
}

impl Node {
    pub fn new(
        group: &str,
        name: &str,
        index: u32,
        node_type: NodeType,
        machine: MachineSpec,
    ) -> Self {
        Self {
            group: group.to_string(),
            instance_name: name.to_string(),
            node_name: name.to_string(),
            index,
            node_type,
            control_plane: false,
            allow_deployment: true,
            machine,
            network: None,
            address: None,
            state: NodeState::NotCreated,
            instance_id: None,
            zone: None,
            region: None,
            crd_uid: None,
            capacity: None,
            extra_labels: Default::default(),
            extra_annotations: Default::default(),
            extra: Default::default(),
            instance: None,
        }
    }

    pub fn instance(&self) -> Option<&InstanceRef> {
        self.instance.as_ref()
    }

    pub fn attach_instance(&mut self, instance: InstanceRef) {
        self.instance_id = Some(instance.instance_id().to_string());
        self.zone = Some(instance.zone().to_string());
        self.region = Some(instance.region().to_string());
        self.instance = Some(instance);
    }

    /// `{scheme}://{zone}/{instanceId}`, known once the instance exists.
    pub fn provider_identity(&self, scheme: &str) -> Option<ProviderIdentity> {
        match (&self.zone, &self.instance_id) {
            (Some(zone), Some(instance_id)) => {
                Some(ProviderIdentity::new(scheme, zone, instance_id))
            }
            _ => None,
        }
    }

    /// Annotations identifying the node as a member of its group.
    pub fn desired_annotations(&self) -> KubernetesLabel {
        let mut annotations = self.extra_annotations.clone();
        let bool_str = |value: bool| value.to_string();
        annotations.extend([
            (ANNOTATION_NODE_GROUP.to_string(), self.group.clone()),
            (
                ANNOTATION_SCALE_DOWN_DISABLED.to_string(),
                bool_str(self.node_type != NodeType::Autoscaled),
            ),
            (
                ANNOTATION_AUTO_PROVISIONED.to_string(),
                bool_str(self.node_type == NodeType::Autoscaled),
            ),
            (
                ANNOTATION_MANAGED.to_string(),
                bool_str(self.node_type == NodeType::Managed),
            ),
            (ANNOTATION_NODE_INDEX.to_string(), self.index.to_string()),
            (
                ANNOTATION_INSTANCE_NAME.to_string(),
                self.instance_name.clone(),
            ),
        ]);
        if let Some(instance_id) = &self.instance_id {
            annotations.insert(ANNOTATION_INSTANCE_ID.to_string(), instance_id.clone());
        }
        annotations
    }

    pub fn desired_labels(&self, labels: &LaunchLabels) -> KubernetesLabel {
        let mut result = labels.node.clone();
        result.extend(labels.system.clone());
        if let Some(region) = &self.region {
            result.insert(LABEL_TOPOLOGY_REGION.to_string(), region.clone());
        }
        if let Some(zone) = &self.zone {
            result.insert(LABEL_TOPOLOGY_ZONE.to_string(), zone.clone());
        }
        result.extend(self.extra_labels.clone());
        result
    }

    fn ensure_owned(&self) -> crate::Result<()> {
        if self.node_type.is_owned() {
            Ok(())
        } else {
            Err(Error::NotOwned(self.node_name.clone()))
        }
    }

    fn ensure_state(&self, expected: NodeState) -> crate::Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                node: self.instance_name.clone(),
                state: self.state,
                expected,
            })
        }
    }

    /// Returns the attached instance handle, looking it up by name if needed.
    async fn resolve_instance(&mut self, ctx: &GroupContext) -> crate::Result<InstanceRef> {
        if let Some(instance) = &self.instance {
            return Ok(instance.clone());
        }
        let instance = ctx.provider.find_instance(&self.instance_name).await?;
        self.attach_instance(instance.clone());
        Ok(instance)
    }

    fn mark_deleted(&mut self) {
        self.state = NodeState::Deleted;
        self.instance = None;
    }

    pub async fn stop(&mut self, ctx: &GroupContext) -> crate::Result<()> {
        self.ensure_owned()?;
        self.ensure_state(NodeState::Running)?;
        let instance = self.resolve_instance(ctx).await?;

        log::info!("Stop node {}", self.instance_name);
        if let Err(error) = ctx.cluster.cordon_node(&self.node_name).await {
            log::error!("Unable to cordon node {}, ignored: {error}", self.node_name);
        }
        instance.power_off().await?;
        self.state = NodeState::Stopped;
        log::info!("Stopped node {}", self.instance_name);
        Ok(())
    }

    pub async fn start(&mut self, ctx: &GroupContext) -> crate::Result<()> {
        self.ensure_owned()?;
        self.ensure_state(NodeState::Stopped)?;
        let instance = self.resolve_instance(ctx).await?;

        log::info!("Start node {}", self.instance_name);
        instance.power_on().await?;
        let address = wait_for_address(
            instance.as_ref(),
            &self.node_name,
            ctx.bootstrapper.as_ref(),
            ctx.address_timeout(),
            ctx.poll_interval(),
        )
        .await?;
        self.address = Some(address);

        if !instance.status().await?.powered {
            self.state = NodeState::Undefined;
            return Err(Error::provider(
                &self.instance_name,
                "instance is not running after power on",
            ));
        }
        if let Err(error) = ctx.cluster.uncordon_node(&self.node_name).await {
            log::error!("Unable to uncordon node {}, ignored: {error}", self.node_name);
        }
        self.state = NodeState::Running;
        log::info!("Started node {}", self.instance_name);
        Ok(())
    }

    /// Tears the node down. A missing instance counts as already deleted.
    ///
    /// The teardown is bounded by the configured deletion timeout.
    pub async fn delete(&mut self, ctx: &GroupContext) -> crate::Result<()> {
        self.ensure_owned()?;
        if self.state == NodeState::Deleted {
            return Ok(());
        }
        log::info!("Delete node {}", self.instance_name);
        let Some(timeout) = ctx.deletion_timeout() else {
            return self.delete_instance(ctx).await;
        };
        match tokio::time::timeout(timeout, self.delete_instance(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                what: format!("deletion of node {}", self.instance_name),
                timeout,
            }),
        }
    }

    async fn delete_instance(&mut self, ctx: &GroupContext) -> crate::Result<()> {

        let instance = match self.resolve_instance(ctx).await {
            Ok(instance) => instance,
            Err(error) if error.is_not_found() => {
                log::info!("Instance of node {} is already gone", self.instance_name);
                self.mark_deleted();
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        let status = match instance.status().await {
            Ok(status) => status,
            Err(error) if error.is_not_found() => {
                self.mark_deleted();
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        if let Some(dns) = ctx.dns() {
            if let Some(address) = self.address.as_deref().or(status.address.as_deref()) {
                let hostname = ctx.hostname(&self.node_name);
                if let Err(error) = dns.unregister(&hostname, address).await {
                    log::error!("Unable to unregister DNS record {hostname}, ignored: {error:?}");
                }
            }
        }

        if status.powered {
            self.evict_from_cluster(ctx).await;
            match instance.power_off().await {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {
                    self.mark_deleted();
                    return Ok(());
                }
                Err(error) => return Err(error),
            }
        }
        match instance.delete().await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error),
        }
        self.mark_deleted();
        log::info!("Deleted node {}", self.instance_name);
        Ok(())
    }

    /// Best-effort removal of the node object from the cluster.
    async fn evict_from_cluster(&self, ctx: &GroupContext) {
        let name = &self.node_name;
        if let Err(error) = ctx.cluster.mark_node_draining(name).await {
            log::error!("Unable to mark node {name} as draining, ignored: {error}");
        }
        if let Err(error) = ctx
            .cluster
            .drain_node(name, true, true, ctx.drain_grace_period())
            .await
        {
            log::error!("Unable to drain node {name}, ignored: {error}");
        }
        if let Err(error) = ctx.cluster.delete_node(name).await {
            log::error!("Unable to delete cluster node {name}, ignored: {error}");
        }
    }

    /// Re-reads the instance power state.
    pub async fn status_refresh(&mut self, ctx: &GroupContext) -> crate::Result<NodeState> {
        if matches!(
            self.state,
            NodeState::NotCreated | NodeState::Creating | NodeState::Deleted
        ) {
            return Ok(self.state);
        }
        let status = match self.resolve_instance(ctx).await {
            Ok(instance) => instance.status().await,
            Err(error) => Err(error),
        };
        match status {
            Ok(status) => {
                if status.address.is_some() {
                    self.address = status.address;
                }
                self.state = if status.powered {
                    NodeState::Running
                } else {
                    NodeState::Stopped
                };
            }
            Err(error) if error.is_not_found() => self.mark_deleted(),
            Err(error) => {
                self.state = NodeState::Undefined;
                return Err(error);
            }
        }
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::{NodeState, NodeType};
    use crate::tests::mocks::MockInstance;
    use crate::tests::{autoscaled_node, TestEnv};
    use crate::Error;

    #[tokio::test]
    async fn stop_and_start() {
        let env = TestEnv::new();
        let mut node = env.running_node("ng-autoscaled-01", 1);

        node.stop(&env.ctx).await.unwrap();
        assert_eq!(node.state, NodeState::Stopped);
        assert!(!env.provider.instance("ng-autoscaled-01").unwrap().is_powered());

        node.start(&env.ctx).await.unwrap();
        assert_eq!(node.state, NodeState::Running);
        assert!(env.provider.instance("ng-autoscaled-01").unwrap().is_powered());
        assert_eq!(
            env.cluster.calls(),
            vec!["cordon ng-autoscaled-01", "uncordon ng-autoscaled-01"]
        );
    }

    #[tokio::test]
    async fn stop_ignores_cordon_failure() {
        let env = TestEnv::new();
        env.cluster.fail_operation("cordon");
        let mut node = env.running_node("ng-autoscaled-01", 1);
        node.stop(&env.ctx).await.unwrap();
        assert_eq!(node.state, NodeState::Stopped);
    }

    #[tokio::test]
    async fn stop_fails_on_power_off_error() {
        let env = TestEnv::new();
        let mut node = env.running_node("ng-autoscaled-01", 1);
        env.provider
            .instance("ng-autoscaled-01")
            .unwrap()
            .fail_power_off();
        assert!(node.stop(&env.ctx).await.is_err());
        assert_eq!(node.state, NodeState::Running);
    }

    #[tokio::test]
    async fn start_requires_stopped_node() {
        let env = TestEnv::new();
        let mut node = env.running_node("ng-autoscaled-01", 1);
        let error = node.start(&env.ctx).await.unwrap_err();
        insta::assert_snapshot!(error, @"Node ng-autoscaled-01 is running, expected stopped");
    }

    #[tokio::test]
    async fn delete_running_node_drains_first() {
        let env = TestEnv::new();
        let mut node = env.running_node("ng-autoscaled-01", 1);
        env.cluster.fail_operation("drain");

        node.delete(&env.ctx).await.unwrap();
        assert_eq!(node.state, NodeState::Deleted);
        assert!(node.instance().is_none());
        assert!(env.provider.instance("ng-autoscaled-01").unwrap().is_deleted());
        assert_eq!(
            env.cluster.calls(),
            vec![
                "mark-draining ng-autoscaled-01",
                "drain ng-autoscaled-01",
                "delete ng-autoscaled-01"
            ]
        );
        assert_eq!(
            env.cluster.drain_grace_periods(),
            vec![std::time::Duration::from_secs(120)]
        );
    }

    #[tokio::test]
    async fn drain_uses_configured_grace_period() {
        let env = TestEnv::with_config(crate::config::AutoScalerConfig {
            timeouts: crate::config::Timeouts {
                max_grace_period: std::time::Duration::from_secs(45),
                ..Default::default()
            },
            ..Default::default()
        });
        let mut node = env.running_node("ng-autoscaled-01", 1);
        node.delete(&env.ctx).await.unwrap();
        assert_eq!(
            env.cluster.drain_grace_periods(),
            vec![std::time::Duration::from_secs(45)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delete_times_out() {
        let env = TestEnv::with_config(crate::config::AutoScalerConfig {
            timeouts: crate::config::Timeouts {
                deletion: std::time::Duration::from_secs(30),
                ..Default::default()
            },
            ..Default::default()
        });
        let mut node = env.running_node("ng-autoscaled-01", 1);
        env.provider
            .instance("ng-autoscaled-01")
            .unwrap()
            .hang_delete();

        let error = node.delete(&env.ctx).await.unwrap_err();
        insta::assert_snapshot!(error, @"Timeout after 30s while waiting for deletion of node ng-autoscaled-01");
        assert_ne!(node.state, NodeState::Deleted);
    }

    #[tokio::test]
    async fn delete_stopped_node_skips_drain() {
        let env = TestEnv::new();
        let mut node = env.running_node("ng-autoscaled-01", 1);
        env.provider
            .instance("ng-autoscaled-01")
            .unwrap()
            .set_powered(false);
        node.delete(&env.ctx).await.unwrap();
        assert_eq!(node.state, NodeState::Deleted);
        assert!(env.cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn delete_missing_instance_is_not_an_error() {
        let env = TestEnv::new();
        let mut node = autoscaled_node("ng-autoscaled-01", 1);
        node.state = NodeState::Running;
        node.delete(&env.ctx).await.unwrap();
        assert_eq!(node.state, NodeState::Deleted);
    }

    #[tokio::test]
    async fn delete_unregisters_dns() {
        let env = TestEnv::with_dns();
        let mut node = env.running_node("ng-autoscaled-01", 1);
        env.dns.insert("ng-autoscaled-01.cluster.test", "10.0.0.1");
        node.delete(&env.ctx).await.unwrap();
        assert!(env.dns.records().is_empty());
    }

    #[tokio::test]
    async fn delete_fails_when_instance_delete_fails() {
        let env = TestEnv::new();
        let mut node = env.running_node("ng-autoscaled-01", 1);
        env.provider
            .instance("ng-autoscaled-01")
            .unwrap()
            .fail_delete();
        assert!(matches!(
            node.delete(&env.ctx).await,
            Err(Error::Provider { .. })
        ));
        assert_ne!(node.state, NodeState::Deleted);
    }

    #[tokio::test]
    async fn external_node_is_not_owned() {
        let env = TestEnv::new();
        let mut node = env.running_node("external-01", 1);
        node.node_type = NodeType::External;
        assert!(matches!(node.delete(&env.ctx).await, Err(Error::NotOwned(_))));
        assert!(matches!(node.stop(&env.ctx).await, Err(Error::NotOwned(_))));
        assert!(!env.provider.instance("external-01").unwrap().is_deleted());
    }

    #[tokio::test]
    async fn refresh_status() {
        let env = TestEnv::new();
        let mut node = env.running_node("ng-autoscaled-01", 1);
        let instance = env.provider.instance("ng-autoscaled-01").unwrap();

        instance.set_powered(false);
        assert_eq!(node.status_refresh(&env.ctx).await.unwrap(), NodeState::Stopped);

        instance.set_powered(true);
        assert_eq!(node.status_refresh(&env.ctx).await.unwrap(), NodeState::Running);

        instance.mark_deleted();
        assert_eq!(node.status_refresh(&env.ctx).await.unwrap(), NodeState::Deleted);
    }

    #[test]
    fn provider_identity_needs_instance() {
        let mut node = autoscaled_node("ng-autoscaled-01", 1);
        assert!(node.provider_identity("aws").is_none());
        node.attach_instance(MockInstance::new("ng-autoscaled-01", "i-42"));
        assert_eq!(
            node.provider_identity("aws").unwrap().to_string(),
            "aws://eu-west-1a/i-42"
        );
    }

    #[test]
    fn annotations_follow_node_type() {
        let mut node = autoscaled_node("ng-worker-02", 2);
        node.node_type = NodeType::Managed;
        node.instance_id = Some("i-7".to_string());
        node.extra_annotations
            .insert("team".to_string(), "infra".to_string());
        insta::assert_debug_snapshot!(node.desired_annotations(), @r###"
        {
            "cluster-autoscaler.kubernetes.io/scale-down-disabled": "true",
            "cluster.autoscaler.nodegroup/autoprovision": "false",
            "cluster.autoscaler.nodegroup/instance-id": "i-7",
            "cluster.autoscaler.nodegroup/instance-name": "ng-worker-02",
            "cluster.autoscaler.nodegroup/managed": "true",
            "cluster.autoscaler.nodegroup/name": "ng",
            "cluster.autoscaler.nodegroup/node-index": "2",
            "team": "infra",
        }
        "###);
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let node = autoscaled_node("ng-autoscaled-01", 1);
        let mut value = serde_json::to_value(&node).unwrap();
        value["legacy-field"] = serde_json::json!({"a": 1});
        let restored: super::Node = serde_json::from_value(value).unwrap();
        let saved = serde_json::to_value(&restored).unwrap();
        assert_eq!(saved["legacy-field"]["a"], 1);
        assert_eq!(saved["instance-name"], "ng-autoscaled-01");
    }
}
