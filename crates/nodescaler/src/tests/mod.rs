//! Shared fixtures for unit tests.

use std::sync::Arc;

use derive_builder::Builder;

use crate::common::labels::KubernetesLabel;
use crate::config::{AutoScalerConfig, DnsConfig, DEFAULT_DISK_TYPE, DEFAULT_MACHINE};
use crate::context::GroupContext;
use crate::node::{Node, NodeState, NodeType};
use crate::nodegroup::{NodeGroup, NodeGroupSpec};
use crate::provider::MachineSpec;
use mocks::{MockBootstrapper, MockCluster, MockDns, MockProvider, MOCK_ADDRESS};

pub fn init_logging() {
    let _ = env_logger::Builder::default()
        .filter(None, log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

pub struct TestEnv {
    pub provider: Arc<MockProvider>,
    pub cluster: Arc<MockCluster>,
    pub bootstrapper: Arc<MockBootstrapper>,
    pub dns: Arc<MockDns>,
    pub ctx: GroupContext,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(Default::default())
    }

    pub fn with_config(config: AutoScalerConfig) -> Self {
        init_logging();
        let provider = Arc::new(MockProvider::default());
        let cluster = Arc::new(MockCluster::default());
        let bootstrapper = Arc::new(MockBootstrapper::with_cluster(cluster.clone()));
        let dns = Arc::new(MockDns::default());
        let ctx = GroupContext::new(
            provider.clone(),
            cluster.clone(),
            bootstrapper.clone(),
            Arc::new(config),
        )
        .with_dns(dns.clone());
        Self {
            provider,
            cluster,
            bootstrapper,
            dns,
            ctx,
        }
    }

    pub fn with_dns() -> Self {
        Self::with_config(AutoScalerConfig {
            dns: Some(DnsConfig {
                zone_id: "Z1".to_string(),
                domain: "cluster.test".to_string(),
            }),
            ..Default::default()
        })
    }

    /// Node of group `ng` backed by a powered instance and registered in the cluster.
    pub fn running_node(&self, name: &str, index: u32) -> Node {
        let instance = self.provider.add_instance(name);
        self.cluster.register_ready(name);
        let mut node = autoscaled_node(name, index);
        node.attach_instance(instance);
        node.state = NodeState::Running;
        node.address = Some(MOCK_ADDRESS.to_string());
        node
    }
}

pub fn default_machine() -> MachineSpec {
    MachineSpec {
        instance_type: DEFAULT_MACHINE.to_string(),
        disk_type: DEFAULT_DISK_TYPE.to_string(),
        disk_size: 10240,
    }
}

pub fn autoscaled_node(name: &str, index: u32) -> Node {
    Node::new("ng", name, index, NodeType::Autoscaled, default_machine())
}

#[derive(Builder)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct Group {
    #[builder(default = "\"ng\".to_string()")]
    id: String,
    #[builder(default = "Some(0)", setter(strip_option))]
    min_size: Option<u32>,
    #[builder(default = "Some(3)", setter(strip_option))]
    max_size: Option<u32>,
    #[builder(default)]
    node_labels: KubernetesLabel,
}

impl GroupBuilder {
    pub fn build(self, env: &TestEnv) -> NodeGroup {
        let Group {
            id,
            min_size,
            max_size,
            node_labels,
        } = self.finish().unwrap();
        let spec = NodeGroupSpec {
            id,
            service_id: "test".to_string(),
            min_size,
            max_size,
            machine_type: None,
            node_labels,
            system_labels: Default::default(),
        };
        NodeGroup::new(spec, env.ctx.clone()).unwrap()
    }

    /// Builds the group and marks it created.
    pub async fn create(self, env: &TestEnv) -> NodeGroup {
        let group = self.build(env);
        group.create().await.unwrap();
        group
    }
}
