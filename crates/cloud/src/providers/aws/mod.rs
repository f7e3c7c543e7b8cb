//! AWS (Amazon Web Services) DNS provider.
//!
//! Implements [`DnsProvider`](super::DnsProvider) for Route 53 hosted zones.
//!
//! Requests go through the `aws` CLI so that whatever credential chain the
//! operator has configured (profiles, SSO, instance roles) is honoured
//! without this crate handling AWS request signing.

mod client;
mod models;

pub use client::Route53;
pub use models::*;
