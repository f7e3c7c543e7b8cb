//! Public hostname record.

use std::net::IpAddr;
use std::sync::Arc;

use jld_cloud::{DnsProvider, DnsRecordType};
use tracing::info;

use crate::error::DeployError;

/// TTL for the published record, in seconds.
pub const RECORD_TTL: u32 = 60;

/// Publishes and withdraws the demo hostname in one hosted zone.
pub struct DnsManager {
    provider: Arc<dyn DnsProvider>,
    zone_id: String,
}

impl DnsManager {
    /// Resolve the hosted zone for `hostname` up front so a wrong zone is
    /// caught before anything is provisioned.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Config`] on `hostname` (or `dns_zone` when an
    /// override was given) if no hosted zone serves it.
    pub async fn resolve(
        provider: Arc<dyn DnsProvider>,
        hostname: &str,
        zone_override: Option<&str>,
    ) -> Result<Self, DeployError> {
        let field = if zone_override.is_some() { "dns_zone" } else { "hostname" };
        let zone_id = provider
            .resolve_zone(hostname, zone_override)
            .await
            .map_err(|e| DeployError::config(field, format!("no usable hosted zone: {e}")))?;
        Ok(Self { provider, zone_id })
    }

    /// Hosted zone id records are written to.
    #[must_use]
    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    /// Point `hostname` at `address`, replacing any existing record.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Provider`] if the change is rejected.
    pub async fn upsert(&self, hostname: &str, address: &str) -> Result<(), DeployError> {
        let record_type = record_type_for(address);
        self.provider
            .upsert_record(&self.zone_id, hostname, record_type, address, RECORD_TTL)
            .await?;
        info!(hostname, address, %record_type, "DNS record published");
        Ok(())
    }

    /// Remove the record for `hostname`. An absent record is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Provider`] if the lookup or delete fails.
    pub async fn remove(&self, hostname: &str) -> Result<(), DeployError> {
        if self.provider.delete_record(&self.zone_id, hostname).await? {
            info!(hostname, "DNS record removed");
        } else {
            info!(hostname, "DNS record already absent");
        }
        Ok(())
    }
}

/// `A`/`AAAA` for literal addresses, `CNAME` for load balancer hostnames.
fn record_type_for(address: &str) -> DnsRecordType {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => DnsRecordType::A,
        Ok(IpAddr::V6(_)) => DnsRecordType::Aaaa,
        Err(_) => DnsRecordType::Cname,
    }
}
