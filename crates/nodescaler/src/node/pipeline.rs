use std::fmt;

use serde::Serialize;

use crate::bootstrap::{build_bootstrap_payload, JoinRequest};
use crate::cluster::Taint;
use crate::context::GroupContext;
use crate::node::{LaunchLabels, Node, NodeState};
use crate::provider::{wait_for_address, CreateRequest, InstanceRef};
use crate::Error;

/// Ordered steps of a node launch. Execution stops at the first failing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchStep {
    Preflight,
    MarkCreating,
    CreateInstance,
    WaitAddress,
    RegisterDns,
    ConfirmRunning,
    CopyTrustMaterial,
    JoinCluster,
    SetProviderId,
    WaitClusterReady,
    ReadCapacity,
    ApplyLabels,
}

impl LaunchStep {
    pub const ALL: [LaunchStep; 12] = [
        LaunchStep::Preflight,
        LaunchStep::MarkCreating,
        LaunchStep::CreateInstance,
        LaunchStep::WaitAddress,
        LaunchStep::RegisterDns,
        LaunchStep::ConfirmRunning,
        LaunchStep::CopyTrustMaterial,
        LaunchStep::JoinCluster,
        LaunchStep::SetProviderId,
        LaunchStep::WaitClusterReady,
        LaunchStep::ReadCapacity,
        LaunchStep::ApplyLabels,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LaunchStep::Preflight => "preflight",
            LaunchStep::MarkCreating => "mark-creating",
            LaunchStep::CreateInstance => "create-instance",
            LaunchStep::WaitAddress => "wait-address",
            LaunchStep::RegisterDns => "register-dns",
            LaunchStep::ConfirmRunning => "confirm-running",
            LaunchStep::CopyTrustMaterial => "copy-trust-material",
            LaunchStep::JoinCluster => "join-cluster",
            LaunchStep::SetProviderId => "set-provider-id",
            LaunchStep::WaitClusterReady => "wait-cluster-ready",
            LaunchStep::ReadCapacity => "read-capacity",
            LaunchStep::ApplyLabels => "apply-labels",
        }
    }
}

impl fmt::Display for LaunchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Node {
    /// Brings a `NotCreated` node to `Running`.
    ///
    /// On failure the error is wrapped with the failing [`LaunchStep`]. Unless the instance
    /// already existed, any instance created along the way is deleted and the node ends up
    /// `Deleted`.
    pub async fn launch(&mut self, ctx: &GroupContext, labels: &LaunchLabels) -> crate::Result<()> {
        log::info!("Launch node {} for node group {}", self.instance_name, self.group);

        for step in LaunchStep::ALL {
            log::debug!("Node {}: {step}", self.instance_name);
            if let Err(error) = self.run_step(step, ctx, labels).await {
                log::error!(
                    "Unable to launch node {} for node group {}, step {step} failed: {error}",
                    self.instance_name,
                    self.group
                );
                if step > LaunchStep::Preflight {
                    if error.is_already_exists() {
                        self.state = NodeState::NotCreated;
                    } else {
                        self.rollback(ctx, step).await;
                    }
                }
                return Err(Error::Step {
                    node: self.instance_name.clone(),
                    step,
                    source: Box::new(error),
                });
            }
        }

        self.state = NodeState::Running;
        log::info!("Launched node {} for node group {}", self.instance_name, self.group);
        Ok(())
    }

    async fn run_step(
        &mut self,
        step: LaunchStep,
        ctx: &GroupContext,
        labels: &LaunchLabels,
    ) -> crate::Result<()> {
        match step {
            LaunchStep::Preflight => self.preflight(ctx).await,
            LaunchStep::MarkCreating => {
                self.state = NodeState::Creating;
                Ok(())
            }
            LaunchStep::CreateInstance => self.create_instance(ctx).await,
            LaunchStep::WaitAddress => {
                let instance = self.require_instance()?;
                let address = wait_for_address(
                    instance.as_ref(),
                    &self.node_name,
                    ctx.bootstrapper.as_ref(),
                    ctx.address_timeout(),
                    ctx.poll_interval(),
                )
                .await?;
                self.address = Some(address);
                Ok(())
            }
            LaunchStep::RegisterDns => {
                if let Some(dns) = ctx.dns() {
                    let hostname = ctx.hostname(&self.node_name);
                    dns.register(&hostname, self.require_address()?)
                        .await
                        .map_err(|error| Error::Dns {
                            node: self.instance_name.clone(),
                            reason: format!("{error:#}"),
                        })?;
                }
                Ok(())
            }
            LaunchStep::ConfirmRunning => {
                let status = self.require_instance()?.status().await?;
                if status.powered {
                    Ok(())
                } else {
                    Err(Error::provider(&self.instance_name, "instance is not running"))
                }
            }
            LaunchStep::CopyTrustMaterial => {
                if self.control_plane {
                    ctx.bootstrapper
                        .copy_trust_material(self.require_address()?, &ctx.config.trust_material)
                        .await
                        .map_err(|error| Error::Bootstrap {
                            node: self.instance_name.clone(),
                            reason: format!("{error:#}"),
                        })?;
                }
                Ok(())
            }
            LaunchStep::JoinCluster => {
                let request = JoinRequest {
                    node_name: self.node_name.clone(),
                    address: self.require_address()?.to_string(),
                    control_plane: self.control_plane,
                    flavor: ctx.config.bootstrap,
                    join: ctx.config.join.clone(),
                };
                if request.join_command().is_none() {
                    log::debug!("Node {} joins the cluster by itself", self.node_name);
                    return Ok(());
                }
                ctx.bootstrapper
                    .join_cluster(&request)
                    .await
                    .map_err(|error| Error::JoinCluster {
                        node: self.instance_name.clone(),
                        reason: format!("{error:#}"),
                    })
            }
            LaunchStep::SetProviderId => {
                if ctx.config.use_external_cloud_controller {
                    return Ok(());
                }
                let identity = self
                    .provider_identity(&ctx.config.provider_id_scheme)
                    .ok_or_else(|| Error::provider(&self.instance_name, "unknown instance id"))?;
                ctx.cluster
                    .set_provider_id(&self.node_name, &identity.to_string())
                    .await
                    .map_err(|error| self.annotation_error(error))
            }
            LaunchStep::WaitClusterReady => {
                ctx.cluster
                    .wait_node_ready(&self.node_name, ctx.ready_timeout(), ctx.poll_interval())
                    .await?;
                Ok(())
            }
            LaunchStep::ReadCapacity => {
                let node = ctx.cluster.get_node(&self.node_name).await?;
                self.capacity = Some(node.capacity);
                Ok(())
            }
            LaunchStep::ApplyLabels => self.apply_labels(ctx, labels).await,
        }
    }

    async fn preflight(&self, ctx: &GroupContext) -> crate::Result<()> {
        self.ensure_owned()?;
        self.ensure_state(NodeState::NotCreated)?;
        if ctx.provider.exists(&self.instance_name).await? {
            return Err(Error::AlreadyExists(self.instance_name.clone()));
        }
        Ok(())
    }

    async fn create_instance(&mut self, ctx: &GroupContext) -> crate::Result<()> {
        let payload =
            build_bootstrap_payload(&ctx.config, &self.group, &self.node_name, self.index)?;
        let request = CreateRequest {
            index: self.index,
            group_id: self.group.clone(),
            name: self.instance_name.clone(),
            machine: self.machine.clone(),
            bootstrap_payload: payload,
            network: self.network.clone(),
        };
        let instance = ctx
            .provider
            .create(request)
            .await
            .map_err(|error| match error {
                Error::AlreadyExists(_) | Error::Provisioning { .. } => error,
                error => Error::Provisioning {
                    name: self.instance_name.clone(),
                    reason: error.to_string(),
                },
            })?;
        self.attach_instance(instance);
        Ok(())
    }

    async fn apply_labels(&self, ctx: &GroupContext, labels: &LaunchLabels) -> crate::Result<()> {
        let cluster = &ctx.cluster;
        cluster
            .label_node(&self.node_name, &self.desired_labels(labels))
            .await
            .map_err(|error| self.annotation_error(error))?;
        cluster
            .annotate_node(&self.node_name, &self.desired_annotations())
            .await
            .map_err(|error| self.annotation_error(error))?;
        if self.control_plane && !self.allow_deployment {
            cluster
                .taint_node(&self.node_name, &Taint::control_plane_no_schedule())
                .await
                .map_err(|error| self.annotation_error(error))?;
        }
        Ok(())
    }

    async fn rollback(&mut self, ctx: &GroupContext, failed_step: LaunchStep) {
        log::warn!("Roll back launch of node {}", self.instance_name);

        let instance = match self.instance.clone() {
            Some(instance) => Some(instance),
            None => match ctx.provider.find_instance(&self.instance_name).await {
                Ok(instance) => Some(instance),
                Err(error) if error.is_not_found() => None,
                Err(error) => {
                    log::error!("Unable to look up instance {}: {error}", self.instance_name);
                    None
                }
            },
        };

        if failed_step > LaunchStep::RegisterDns {
            if let (Some(dns), Some(address)) = (ctx.dns(), self.address.as_deref()) {
                if let Err(error) = dns.unregister(&ctx.hostname(&self.node_name), address).await {
                    log::error!("Unable to unregister DNS of {}: {error:?}", self.node_name);
                }
            }
        }
        if failed_step > LaunchStep::JoinCluster {
            if let Err(error) = ctx.cluster.delete_node(&self.node_name).await {
                log::warn!("Unable to delete cluster node {}: {error}", self.node_name);
            }
        }
        if let Some(instance) = instance {
            if let Err(error) = instance.delete().await {
                if !error.is_not_found() {
                    log::error!("Unable to delete instance {}: {error}", self.instance_name);
                }
            }
        }
        self.mark_deleted();
    }

    fn require_instance(&self) -> crate::Result<InstanceRef> {
        self.instance
            .clone()
            .ok_or_else(|| Error::provider(&self.instance_name, "instance was not created"))
    }

    fn require_address(&self) -> crate::Result<&str> {
        self.address
            .as_deref()
            .ok_or_else(|| Error::provider(&self.instance_name, "instance has no address"))
    }

    fn annotation_error(&self, error: Error) -> Error {
        Error::Annotation {
            node: self.node_name.clone(),
            reason: error.to_string(),
        }
    }
}
