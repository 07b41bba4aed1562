use std::sync::Arc;
use std::time::Duration;

use crate::bootstrap::{Bootstrapper, DnsRegistrar};
use crate::cluster::ClusterClient;
use crate::common::wait::deadline_from_timeout;
use crate::config::AutoScalerConfig;
use crate::provider::VmProvider;

/// Collaborators and configuration shared by a node group and its nodes.
#[derive(Clone)]
pub struct GroupContext {
    pub provider: Arc<dyn VmProvider>,
    pub cluster: Arc<dyn ClusterClient>,
    pub bootstrapper: Arc<dyn Bootstrapper>,
    pub dns: Option<Arc<dyn DnsRegistrar>>,
    pub config: Arc<AutoScalerConfig>,
}

impl GroupContext {
    pub fn new(
        provider: Arc<dyn VmProvider>,
        cluster: Arc<dyn ClusterClient>,
        bootstrapper: Arc<dyn Bootstrapper>,
        config: Arc<AutoScalerConfig>,
    ) -> Self {
        Self {
            provider,
            cluster,
            bootstrapper,
            dns: None,
            config,
        }
    }

    pub fn with_dns(mut self, dns: Arc<dyn DnsRegistrar>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// DNS registrar, only when the configuration enables DNS.
    pub fn dns(&self) -> Option<&dyn DnsRegistrar> {
        self.config.dns.as_ref().and(self.dns.as_deref())
    }

    pub fn hostname(&self, node_name: &str) -> String {
        match &self.config.dns {
            Some(dns) if !dns.domain.is_empty() => format!("{node_name}.{}", dns.domain),
            _ => node_name.to_string(),
        }
    }

    pub fn address_timeout(&self) -> Option<Duration> {
        deadline_from_timeout(self.config.timeouts.request)
    }

    pub fn deletion_timeout(&self) -> Option<Duration> {
        deadline_from_timeout(self.config.timeouts.deletion)
    }

    pub fn drain_grace_period(&self) -> Duration {
        self.config.timeouts.max_grace_period
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        deadline_from_timeout(self.config.timeouts.node_ready)
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.timeouts.poll_interval
    }
}
