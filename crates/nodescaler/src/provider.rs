//! Cloud instance operations consumed by the node lifecycle.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::bootstrap::ReadinessProbe;
use crate::common::wait::poll_until;
use crate::Error;

/// Shape of an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MachineSpec {
    pub instance_type: String,
    pub disk_type: String,
    /// Disk size in MiB
    pub disk_size: u64,
}

/// Network placement requested for an instance instead of the provider default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct NetworkSpec {
    pub network_interface_id: Option<String>,
    pub subnet_id: Option<String>,
    pub security_group_id: Option<String>,
    pub private_address: Option<String>,
    pub public_ip: bool,
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub index: u32,
    pub group_id: String,
    pub name: String,
    pub machine: MachineSpec,
    pub bootstrap_payload: String,
    pub network: Option<NetworkSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceStatus {
    pub address: Option<String>,
    pub powered: bool,
}

/// Handle to one cloud instance.
pub trait VmInstance: Send + Sync + fmt::Debug {
    fn instance_id(&self) -> &str;

    fn zone(&self) -> &str;

    fn region(&self) -> &str;

    /// Returns [`Error::NotFound`] when the instance no longer exists.
    fn status(&self) -> BoxFuture<'_, crate::Result<InstanceStatus>>;

    fn power_on(&self) -> BoxFuture<'_, crate::Result<()>>;

    fn power_off(&self) -> BoxFuture<'_, crate::Result<()>>;

    /// Returns [`Error::NotFound`] when the instance no longer exists.
    fn delete(&self) -> BoxFuture<'_, crate::Result<()>>;
}

pub type InstanceRef = Arc<dyn VmInstance>;

/// Cloud API able to create and look up instances.
pub trait VmProvider: Send + Sync {
    /// Creates an instance.
    ///
    /// Fails with [`Error::AlreadyExists`] when an instance of the same name exists and with
    /// [`Error::Provisioning`] when the provider refused the request.
    fn create(&self, request: CreateRequest) -> BoxFuture<'_, crate::Result<InstanceRef>>;

    /// Looks up an instance by its name, [`Error::NotFound`] if there is none.
    fn find_instance<'a>(&'a self, name: &'a str) -> BoxFuture<'a, crate::Result<InstanceRef>>;

    fn exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, crate::Result<bool>>;
}

/// Waits until `instance` has an address that passes `probe`.
pub async fn wait_for_address<P: ReadinessProbe + ?Sized>(
    instance: &dyn VmInstance,
    node_name: &str,
    probe: &P,
    timeout: Option<Duration>,
    interval: Duration,
) -> crate::Result<String> {
    let what = format!("address of {node_name}");
    poll_until(&what, timeout, interval, || async {
        let status = instance.status().await?;
        let Some(address) = status.address.filter(|address| !address.is_empty()) else {
            return Ok(None);
        };
        match probe.probe(node_name, &address).await {
            Ok(()) => Ok(Some(address)),
            Err(error) => {
                log::debug!("Node {node_name} at {address} is not ready yet: {error:?}");
                Ok(None)
            }
        }
    })
    .await
}

/// Stable identity linking a cluster node to its cloud instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderIdentity {
    pub scheme: String,
    pub zone: String,
    pub instance_id: String,
}

impl ProviderIdentity {
    pub fn new(scheme: &str, zone: &str, instance_id: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            zone: zone.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

impl fmt::Display for ProviderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.zone, self.instance_id)
    }
}

impl FromStr for ProviderIdentity {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidProviderId(value.to_string());
        let (scheme, rest) = value.split_once("://").ok_or_else(invalid)?;
        let (zone, instance_id) = rest.rsplit_once('/').ok_or_else(invalid)?;
        let zone = zone.trim_matches('/');
        if scheme.is_empty() || zone.is_empty() || instance_id.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(scheme, zone, instance_id))
    }
}
