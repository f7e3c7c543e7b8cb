//! Route 53 client implementation.

use async_trait::async_trait;
use tracing::{debug, info};

use super::models::{
    Change, ChangeAction, ChangeBatch, HostedZone, HostedZoneList, RecordSetList, ResourceRecord,
    ResourceRecordSet,
};
use crate::providers::command::run_captured;
use crate::providers::traits::{DnsProvider, DnsRecordType, ProviderError};

/// Record types this deployer may have published for a hostname.
const MANAGED_TYPES: [&str; 3] = ["A", "AAAA", "CNAME"];

/// Route 53 DNS provider.
#[derive(Debug, Clone)]
pub struct Route53 {
    /// Path or name of the `aws` executable.
    program: String,
}

impl Default for Route53 {
    fn default() -> Self {
        Self::new()
    }
}

impl Route53 {
    /// Create a provider using `aws` from the search path.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: "aws".to_string(),
        }
    }

    /// Use a specific `aws` executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn aws<T: serde::de::DeserializeOwned>(&self, args: &[&str]) -> Result<T, ProviderError> {
        let mut full = vec!["route53"];
        full.extend_from_slice(args);
        full.extend_from_slice(&["--output", "json"]);
        let stdout = run_captured(&self.program, &full).await?;
        if stdout.is_empty() {
            return Ok(serde_json::from_str("{}")?);
        }
        Ok(serde_json::from_str(&stdout)?)
    }

    async fn change(&self, zone_id: &str, batch: &ChangeBatch) -> Result<(), ProviderError> {
        let batch_json = serde_json::to_string(batch)?;
        let _: serde_json::Value = self
            .aws(&[
                "change-resource-record-sets",
                "--hosted-zone-id",
                zone_id,
                "--change-batch",
                &batch_json,
            ])
            .await?;
        Ok(())
    }

    /// Absolute form of a record name, as Route 53 reports it.
    fn absolute(name: &str) -> String {
        if name.ends_with('.') {
            name.to_string()
        } else {
            format!("{name}.")
        }
    }

    /// Domain a hostname lives in: everything after the first label.
    fn parent_domain(hostname: &str) -> Option<&str> {
        hostname
            .trim_end_matches('.')
            .split_once('.')
            .map(|(_, domain)| domain)
            .filter(|d| !d.is_empty())
    }

    /// Pick the zone named `domain` out of a zone listing.
    fn match_zone<'a>(zones: &'a [HostedZone], domain: &str) -> Option<&'a HostedZone> {
        let wanted = Self::absolute(domain).to_ascii_lowercase();
        zones
            .iter()
            .find(|z| z.name.to_ascii_lowercase() == wanted)
    }

    /// Record sets at `name` that the deployer manages.
    fn managed_sets(list: RecordSetList, name: &str) -> Vec<ResourceRecordSet> {
        let wanted = Self::absolute(name).to_ascii_lowercase();
        list.resource_record_sets
            .into_iter()
            .filter(|rs| rs.name.to_ascii_lowercase() == wanted)
            .filter(|rs| MANAGED_TYPES.contains(&rs.record_type.as_str()))
            .collect()
    }

    /// Replace whatever the deployer manages at `name` with one record.
    /// Sets of another type go in the same batch as `DELETE`s, since an
    /// `UPSERT` only replaces a set of its own type.
    fn upsert_batch(
        name: &str,
        record_type: DnsRecordType,
        value: &str,
        ttl: u32,
        existing: Vec<ResourceRecordSet>,
    ) -> ChangeBatch {
        let wanted_type = record_type.to_string();
        let mut changes: Vec<Change> = existing
            .into_iter()
            .filter(|rs| rs.record_type != wanted_type)
            .map(|rs| Change {
                action: ChangeAction::Delete,
                resource_record_set: rs,
            })
            .collect();
        changes.push(Change {
            action: ChangeAction::Upsert,
            resource_record_set: ResourceRecordSet {
                name: Self::absolute(name),
                record_type: wanted_type,
                ttl: Some(ttl),
                resource_records: vec![ResourceRecord {
                    value: value.to_string(),
                }],
            },
        });
        ChangeBatch {
            comment: format!("jld-deploy upsert {name}"),
            changes,
        }
    }

    async fn list_managed(
        &self,
        zone_id: &str,
        name: &str,
    ) -> Result<Vec<ResourceRecordSet>, ProviderError> {
        let absolute = Self::absolute(name);
        let list: RecordSetList = self
            .aws(&[
                "list-resource-record-sets",
                "--hosted-zone-id",
                zone_id,
                "--start-record-name",
                &absolute,
                "--max-items",
                "10",
            ])
            .await?;
        Ok(Self::managed_sets(list, name))
    }

    fn delete_batch(name: &str, sets: Vec<ResourceRecordSet>) -> ChangeBatch {
        ChangeBatch {
            comment: format!("jld-deploy delete {name}"),
            changes: sets
                .into_iter()
                .map(|rs| Change {
                    action: ChangeAction::Delete,
                    resource_record_set: rs,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl DnsProvider for Route53 {
    async fn resolve_zone(
        &self,
        hostname: &str,
        zone_override: Option<&str>,
    ) -> Result<String, ProviderError> {
        let domain = match zone_override {
            Some(zone) => zone,
            None => Self::parent_domain(hostname).ok_or_else(|| {
                ProviderError::Config(format!("hostname {hostname} has no parent domain"))
            })?,
        };

        let zones: HostedZoneList = self.aws(&["list-hosted-zones"]).await?;
        let zone = Self::match_zone(&zones.hosted_zones, domain)
            .ok_or_else(|| ProviderError::NotFound(format!("hosted zone for {domain}")))?;

        debug!(domain, zone_id = zone.short_id(), "Resolved hosted zone");
        Ok(zone.short_id().to_string())
    }

    async fn upsert_record(
        &self,
        zone_id: &str,
        name: &str,
        record_type: DnsRecordType,
        value: &str,
        ttl: u32,
    ) -> Result<(), ProviderError> {
        let existing = self.list_managed(zone_id, name).await?;
        info!(zone_id, name, %record_type, value, "Upserting DNS record");
        self.change(
            zone_id,
            &Self::upsert_batch(name, record_type, value, ttl, existing),
        )
        .await
    }

    async fn delete_record(&self, zone_id: &str, name: &str) -> Result<bool, ProviderError> {
        let sets = self.list_managed(zone_id, name).await?;
        if sets.is_empty() {
            debug!(zone_id, name, "No DNS record to delete");
            return Ok(false);
        }

        info!(zone_id, name, count = sets.len(), "Deleting DNS record");
        self.change(zone_id, &Self::delete_batch(name, sets)).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zones() -> Vec<HostedZone> {
        serde_json::from_value::<HostedZoneList>(serde_json::json!({
            "HostedZones": [
                { "Id": "/hostedzone/ZORG", "Name": "example.org." },
                { "Id": "/hostedzone/ZCOM", "Name": "example.com." }
            ]
        }))
        .unwrap()
        .hosted_zones
    }

    #[test]
    fn test_parent_domain() {
        assert_eq!(Route53::parent_domain("demo.example.org"), Some("example.org"));
        assert_eq!(Route53::parent_domain("demo.example.org."), Some("example.org"));
        assert_eq!(Route53::parent_domain("localhost"), None);
    }

    #[test]
    fn test_match_zone_by_name() {
        let zones = zones();
        let zone = Route53::match_zone(&zones, "Example.org").unwrap();
        assert_eq!(zone.short_id(), "ZORG");
        assert!(Route53::match_zone(&zones, "example.net").is_none());
    }

    #[test]
    fn test_upsert_batch_shape() {
        let batch =
            Route53::upsert_batch("demo.example.org", DnsRecordType::A, "35.1.2.3", 60, vec![]);
        let json = serde_json::to_value(&batch).unwrap();
        let change = &json["Changes"][0];
        assert_eq!(change["Action"], "UPSERT");
        assert_eq!(change["ResourceRecordSet"]["Name"], "demo.example.org.");
        assert_eq!(change["ResourceRecordSet"]["Type"], "A");
        assert_eq!(change["ResourceRecordSet"]["TTL"], 60);
        assert_eq!(
            change["ResourceRecordSet"]["ResourceRecords"][0]["Value"],
            "35.1.2.3"
        );
    }

    #[test]
    fn test_managed_sets_ignore_other_names_and_types() {
        let list: RecordSetList = serde_json::from_value(serde_json::json!({
            "ResourceRecordSets": [
                { "Name": "demo.example.org.", "Type": "A", "TTL": 60,
                  "ResourceRecords": [{ "Value": "35.1.2.3" }] },
                { "Name": "demo.example.org.", "Type": "TXT", "TTL": 300,
                  "ResourceRecords": [{ "Value": "\"keep\"" }] },
                { "Name": "demo2.example.org.", "Type": "A", "TTL": 60,
                  "ResourceRecords": [{ "Value": "35.9.9.9" }] }
            ]
        }))
        .unwrap();

        let sets = Route53::managed_sets(list, "demo.example.org");
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].record_type, "A");

        let batch = Route53::delete_batch("demo.example.org", sets);
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["Changes"][0]["Action"], "DELETE");
        assert_eq!(json["Changes"][0]["ResourceRecordSet"]["TTL"], 60);
    }

    #[test]
    fn test_upsert_batch_replaces_record_of_another_type() {
        let existing = vec![
            ResourceRecordSet {
                name: "demo.example.org.".into(),
                record_type: "A".into(),
                ttl: Some(60),
                resource_records: vec![ResourceRecord {
                    value: "35.1.2.3".into(),
                }],
            },
            ResourceRecordSet {
                name: "demo.example.org.".into(),
                record_type: "CNAME".into(),
                ttl: Some(60),
                resource_records: vec![ResourceRecord {
                    value: "old.elb.amazonaws.com".into(),
                }],
            },
        ];

        let batch = Route53::upsert_batch(
            "demo.example.org",
            DnsRecordType::Cname,
            "a1b2.elb.amazonaws.com",
            60,
            existing,
        );
        let json = serde_json::to_value(&batch).unwrap();
        let changes = json["Changes"].as_array().unwrap();

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0]["Action"], "DELETE");
        assert_eq!(changes[0]["ResourceRecordSet"]["Type"], "A");
        assert_eq!(
            changes[0]["ResourceRecordSet"]["ResourceRecords"][0]["Value"],
            "35.1.2.3"
        );
        assert_eq!(changes[1]["Action"], "UPSERT");
        assert_eq!(changes[1]["ResourceRecordSet"]["Type"], "CNAME");
        assert_eq!(
            changes[1]["ResourceRecordSet"]["ResourceRecords"][0]["Value"],
            "a1b2.elb.amazonaws.com"
        );
    }
}
