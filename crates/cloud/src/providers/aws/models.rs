//! Route 53 request and response models.

use serde::{Deserialize, Serialize};

/// Response of `list-hosted-zones`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostedZoneList {
    /// Hosted zones visible to the caller.
    #[serde(default)]
    pub hosted_zones: Vec<HostedZone>,
}

/// A hosted zone.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostedZone {
    /// Zone id, e.g. `/hostedzone/Z123456`.
    pub id: String,
    /// Zone name with trailing dot, e.g. `example.org.`.
    pub name: String,
}

impl HostedZone {
    /// The bare zone id without the `/hostedzone/` prefix.
    #[must_use]
    pub fn short_id(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }
}

/// Response of `list-resource-record-sets`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecordSetList {
    /// Record sets, starting at the requested name.
    #[serde(default)]
    pub resource_record_sets: Vec<ResourceRecordSet>,
}

/// A resource record set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceRecordSet {
    /// Fully qualified record name.
    pub name: String,
    /// Record type (`A`, `CNAME`, ...).
    #[serde(rename = "Type")]
    pub record_type: String,
    /// Time to live in seconds.
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    /// Record values.
    #[serde(default)]
    pub resource_records: Vec<ResourceRecord>,
}

/// A single record value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceRecord {
    /// Record value.
    pub value: String,
}

/// Change batch passed to `change-resource-record-sets`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeBatch {
    /// Free-form comment recorded with the change.
    pub comment: String,
    /// Changes to apply atomically.
    pub changes: Vec<Change>,
}

/// A single change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Change {
    /// `UPSERT` or `DELETE`.
    pub action: ChangeAction,
    /// Record set the action applies to.
    pub resource_record_set: ResourceRecordSet,
}

/// Change action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    /// Create or replace.
    Upsert,
    /// Delete; the record set must match exactly.
    Delete,
}
