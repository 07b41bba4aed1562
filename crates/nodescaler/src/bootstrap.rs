//! Remote bootstrap of freshly created instances: readiness probing, cluster join and DNS.
use futures::future::BoxFuture;
use serde::Serialize;

use crate::config::{AutoScalerConfig, BootstrapFlavor, JoinConfig, TrustMaterialConfig};

/// Checks that an instance is reachable at `address`, e.g. by running a command over SSH.
pub trait ReadinessProbe: Send + Sync {
    fn probe<'a>(&'a self, node_name: &'a str, address: &'a str)
    -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Executes bootstrap commands on an instance.
pub trait Bootstrapper: ReadinessProbe {
    fn copy_trust_material<'a>(
        &'a self,
        address: &'a str,
        material: &'a TrustMaterialConfig,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    fn join_cluster<'a>(&'a self, request: &'a JoinRequest) -> BoxFuture<'a, anyhow::Result<()>>;
}

pub trait DnsRegistrar: Send + Sync {
    fn register<'a>(&'a self, hostname: &'a str, address: &'a str)
    -> BoxFuture<'a, anyhow::Result<()>>;

    fn unregister<'a>(
        &'a self,
        hostname: &'a str,
        address: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub node_name: String,
    pub address: String,
    pub control_plane: bool,
    pub flavor: BootstrapFlavor,
    pub join: JoinConfig,
}

impl JoinRequest {
    /// Command line that joins the node to the cluster, `None` when nodes join on their own.
    pub fn join_command(&self) -> Option<Vec<String>> {
        let join = &self.join;
        let mut args: Vec<String> = match self.flavor {
            BootstrapFlavor::External => return None,
            BootstrapFlavor::Kubeadm => {
                let mut args = vec![
                    "kubeadm".to_string(),
                    "join".to_string(),
                    join.address.clone(),
                    "--token".to_string(),
                    join.token.clone(),
                    "--discovery-token-ca-cert-hash".to_string(),
                    join.ca.clone(),
                ];
                if self.control_plane {
                    args.push("--control-plane".to_string());
                }
                args
            }
            BootstrapFlavor::K3s | BootstrapFlavor::Rke2 => {
                let binary = if self.flavor == BootstrapFlavor::K3s {
                    "k3s"
                } else {
                    "rke2"
                };
                let role = if self.control_plane { "server" } else { "agent" };
                vec![
                    binary.to_string(),
                    role.to_string(),
                    "--server".to_string(),
                    format!("https://{}", join.address),
                    "--token".to_string(),
                    join.token.clone(),
                ]
            }
        };
        args.push("--node-name".to_string());
        args.push(self.node_name.clone());
        args.extend(join.extras_args.iter().cloned());
        Some(args)
    }
}

#[derive(Serialize)]
struct WriteFile {
    path: String,
    permissions: &'static str,
    content: String,
}

#[derive(Serialize)]
struct CloudConfig {
    hostname: String,
    fqdn: Option<String>,
    manage_etc_hosts: bool,
    write_files: Vec<WriteFile>,
}

#[derive(Serialize)]
struct NodeIdentityFile<'a> {
    group: &'a str,
    name: &'a str,
    index: u32,
}

/// Renders the `#cloud-config` user data handed to the provider when creating an instance.
///
/// JSON is a subset of YAML, so cloud-init reads the document as is.
pub fn build_bootstrap_payload(
    config: &AutoScalerConfig,
    group: &str,
    node_name: &str,
    index: u32,
) -> crate::Result<String> {
    let identity = serde_json::to_string(&NodeIdentityFile {
        group,
        name: node_name,
        index,
    })?;
    let cloud_config = CloudConfig {
        hostname: node_name.to_string(),
        fqdn: config
            .dns
            .as_ref()
            .map(|dns| format!("{node_name}.{}", dns.domain)),
        manage_etc_hosts: true,
        write_files: vec![WriteFile {
            path: "/etc/nodescaler/node.json".to_string(),
            permissions: "0644",
            content: identity,
        }],
    };
    Ok(format!(
        "#cloud-config\n{}\n",
        serde_json::to_string_pretty(&cloud_config)?
    ))
}
