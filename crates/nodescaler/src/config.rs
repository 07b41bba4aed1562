//! Autoscaler configuration document.
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::labels::KubernetesLabel;
use crate::Error;

pub const DEFAULT_AUTOSCALED_PREFIX: &str = "autoscaled";
pub const DEFAULT_MANAGED_PREFIX: &str = "worker";
pub const DEFAULT_CONTROL_PLANE_PREFIX: &str = "master";
pub const DEFAULT_MACHINE: &str = "standard";
pub const DEFAULT_DISK_TYPE: &str = "gp2";

/// Resource name used to bound the disk of managed nodes (in MiB).
pub const RESOURCE_MANAGED_NODE_DISK: &str = "disk";
pub const MANAGED_NODE_MIN_DISK_SIZE: i64 = 10;
pub const MANAGED_NODE_MAX_DISK_SIZE: i64 = 1024 * 1024;

/// (De)serializes a [`Duration`] as a human readable string such as `"5m"`.
mod human_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootstrapFlavor {
    #[default]
    Kubeadm,
    K3s,
    Rke2,
    /// Nodes join the cluster on their own, e.g. through the cloud-init payload.
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MachineCharacteristic {
    /// Price in USD
    pub price: f64,
    /// Memory in MiB
    pub memsize: u64,
    pub vcpus: u32,
    pub disk_type: String,
    /// Disk size in MiB
    pub disk_size: u64,
}

impl Default for MachineCharacteristic {
    fn default() -> Self {
        Self {
            price: 0.0,
            memsize: 0,
            vcpus: 0,
            disk_type: DEFAULT_DISK_TYPE.to_string(),
            disk_size: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimiter {
    pub min: BTreeMap<String, i64>,
    pub max: BTreeMap<String, i64>,
}

impl ResourceLimiter {
    pub fn min_value(&self, key: &str, default: i64) -> i64 {
        self.min.get(key).copied().unwrap_or(default)
    }

    pub fn max_value(&self, key: &str, default: i64) -> i64 {
        self.max.get(key).copied().unwrap_or(default)
    }

    /// Clamps a managed node disk size into the configured bounds.
    pub fn clamp_disk_size(&self, size: u64) -> u64 {
        let min = self.min_value(RESOURCE_MANAGED_NODE_DISK, MANAGED_NODE_MIN_DISK_SIZE);
        let max = self.max_value(RESOURCE_MANAGED_NODE_DISK, MANAGED_NODE_MAX_DISK_SIZE);
        let clamped = i64::try_from(size).unwrap_or(i64::MAX).min(max).max(min);
        u64::try_from(clamped).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct JoinConfig {
    pub address: String,
    pub token: String,
    pub ca: String,
    pub extras_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TrustMaterialConfig {
    pub kubernetes_pki_srcdir: String,
    pub kubernetes_pki_dstdir: String,
    pub use_external_etcd: bool,
    pub src_etcd_ssl_dir: String,
    pub dst_etcd_ssl_dir: String,
}

impl Default for TrustMaterialConfig {
    fn default() -> Self {
        Self {
            kubernetes_pki_srcdir: "/etc/kubernetes/pki".to_string(),
            kubernetes_pki_dstdir: "/etc/kubernetes/pki".to_string(),
            use_external_etcd: false,
            src_etcd_ssl_dir: "/etc/etcd/ssl".to_string(),
            dst_etcd_ssl_dir: "/etc/etcd/ssl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DnsConfig {
    pub zone_id: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Timeouts {
    /// Deadline for an instance to get an address and pass the readiness probe.
    #[serde(with = "human_duration")]
    pub request: Duration,
    #[serde(with = "human_duration")]
    pub deletion: Duration,
    /// Deadline for a joined node to be reported `Ready` by the cluster.
    #[serde(with = "human_duration")]
    pub node_ready: Duration,
    #[serde(with = "human_duration")]
    pub max_grace_period: Duration,
    #[serde(with = "human_duration")]
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(120),
            deletion: Duration::from_secs(300),
            node_ready: Duration::from_secs(300),
            max_grace_period: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct NodeGroupAutoscalingOptions {
    pub scale_down_utilization_threshold: f64,
    pub scale_down_gpu_utilization_threshold: f64,
    #[serde(with = "human_duration")]
    pub scale_down_unneeded_time: Duration,
    #[serde(with = "human_duration")]
    pub scale_down_unready_time: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AutoScalerConfig {
    pub node_name_prefix: String,
    pub managed_name_prefix: String,
    pub controlplane_name_prefix: String,
    /// Maximum number of nodes launched concurrently; `0` launches a whole batch at once.
    pub max_node_per_cycle: usize,
    pub min_node: u32,
    pub max_node: u32,
    pub default_machine: String,
    pub machines: BTreeMap<String, MachineCharacteristic>,
    pub node_labels: KubernetesLabel,
    pub managednodes_limits: ResourceLimiter,
    pub bootstrap: BootstrapFlavor,
    pub join: JoinConfig,
    pub trust_material: TrustMaterialConfig,
    /// When set, an external cloud controller manager fills in the provider id.
    pub use_external_cloud_controller: bool,
    pub provider_id_scheme: String,
    pub timeouts: Timeouts,
    pub dns: Option<DnsConfig>,
    pub autoscaling_options: Option<NodeGroupAutoscalingOptions>,
    /// Track annotated nodes the autoscaler did not create when reconciling.
    pub include_existing_node: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            node_name_prefix: DEFAULT_AUTOSCALED_PREFIX.to_string(),
            managed_name_prefix: DEFAULT_MANAGED_PREFIX.to_string(),
            controlplane_name_prefix: DEFAULT_CONTROL_PLANE_PREFIX.to_string(),
            max_node_per_cycle: 2,
            min_node: 0,
            max_node: 10,
            default_machine: DEFAULT_MACHINE.to_string(),
            machines: BTreeMap::from([(DEFAULT_MACHINE.to_string(), Default::default())]),
            node_labels: Default::default(),
            managednodes_limits: Default::default(),
            bootstrap: Default::default(),
            join: Default::default(),
            trust_material: Default::default(),
            use_external_cloud_controller: false,
            provider_id_scheme: "aws".to_string(),
            timeouts: Default::default(),
            dns: None,
            autoscaling_options: None,
            include_existing_node: true,
            extra: Default::default(),
        }
    }
}

impl AutoScalerConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AutoScalerConfig = serde_json::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(interval) = get_duration_from_env("NODESCALER_POLL_INTERVAL_MS") {
            self.timeouts.poll_interval = interval;
        }
        if let Some(count) = std::env::var("NODESCALER_MAX_NODE_PER_CYCLE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
        {
            self.max_node_per_cycle = count;
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.min_node > self.max_node {
            return Err(Error::Config(format!(
                "min-node ({}) is larger than max-node ({})",
                self.min_node, self.max_node
            )));
        }
        if !self.machines.contains_key(&self.default_machine) {
            return Err(Error::Config(format!(
                "default machine {} is not listed in machines",
                self.default_machine
            )));
        }
        for (name, prefix) in [
            ("node-name-prefix", &self.node_name_prefix),
            ("managed-name-prefix", &self.managed_name_prefix),
            ("controlplane-name-prefix", &self.controlplane_name_prefix),
        ] {
            if prefix.is_empty() {
                return Err(Error::Config(format!("{name} must not be empty")));
            }
        }
        if self.max_node_per_cycle == 0 {
            return Err(Error::Config(
                "max-node-per-cycle must be at least 1".to_string(),
            ));
        }
        if self.timeouts.poll_interval.is_zero() {
            return Err(Error::Config("poll-interval must be positive".to_string()));
        }
        Ok(())
    }

    pub fn machine(&self, name: &str) -> crate::Result<&MachineCharacteristic> {
        self.machines
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Machine type {name}")))
    }

    /// Per-group options, falling back to the caller supplied defaults.
    pub fn autoscaling_options<'a>(
        &'a self,
        defaults: &'a NodeGroupAutoscalingOptions,
    ) -> &'a NodeGroupAutoscalingOptions {
        self.autoscaling_options.as_ref().unwrap_or(defaults)
    }
}

fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}
