//! Deployment configuration.
//!
//! The operator writes a YAML document; keys missing from it may be supplied
//! through `JLD_<KEY>` environment variables. Every field is validated on its
//! own so a [`DeployError::Config`] always names the one key to fix.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_yaml::Value;
use tracing::{debug, warn};

use crate::error::DeployError;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "JLD_";

/// Environment variable naming a directory holding `cert.pem`, `key.pem`,
/// `chain.pem` and optionally `dhparam.pem`.
pub const ENV_CERTIFICATE_DIRECTORY: &str = "JLD_CERTIFICATE_DIRECTORY";

const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_GKE_ZONE: &str = "us-central1-a";
const DEFAULT_GKE_MACHINE_TYPE: &str = "n1-standard-2";
const DEFAULT_GKE_NODE_COUNT: u64 = 2;
const DEFAULT_VOLUME_SIZE_GB: u64 = 20;
const DEFAULT_DHPARAM_BITS: u64 = 2048;
const DEFAULT_SESSION_DB_URL: &str = "sqlite:////home/jupyter/jupyterhub.sqlite";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_ADDRESS_TIMEOUT_SECS: u64 = 300;
const MAX_POLL_INTERVAL_SECS: u64 = 300;
const MAX_ADDRESS_TIMEOUT_SECS: u64 = 86_400;

/// Every recognised key.
const KNOWN_KEYS: &[&str] = &[
    "kubernetes_cluster_name",
    "kubernetes_cluster_namespace",
    "hostname",
    "dns_zone",
    "gke_zone",
    "gke_project",
    "gke_machine_type",
    "gke_node_count",
    "tls_cert",
    "tls_key",
    "tls_root_chain",
    "tls_dhparam",
    "dhparam_bits",
    "github_client_id",
    "github_client_secret",
    "github_organization_whitelist",
    "volume_size_gigabytes",
    "session_db_url",
    "address_poll_interval_secs",
    "address_timeout_secs",
    "log_shipper_name",
    "rabbitmq_pan_password",
    "rabbitmq_target_host",
    "rabbitmq_target_vhost",
    "beats_cert",
    "beats_key",
    "beats_ca",
];

/// Keys that together switch on log shipping. All or none.
const LOGGING_KEYS: [&str; 7] = [
    "log_shipper_name",
    "rabbitmq_pan_password",
    "rabbitmq_target_host",
    "rabbitmq_target_vhost",
    "beats_cert",
    "beats_key",
    "beats_ca",
];

static CLUSTER_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));

static NAMESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));

static DNS_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9]*[A-Za-z0-9])?$").expect("valid regex"));

/// A credential that must never reach a log line.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a credential.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, for embedding in a secret manifest.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Whether a resource is created and destroyed by this tool, per resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourcePolicy {
    /// `--existing-cluster`: never create or destroy the cluster.
    pub existing_cluster: bool,
    /// `--existing-namespace`: never create or destroy the namespace.
    pub existing_namespace: bool,
}

/// Command-line switches that shape a load.
#[derive(Debug, Clone, Default)]
pub struct Flags {
    /// Existing-resource switches.
    pub policy: ResourcePolicy,
    /// `-d`: durable manifest directory.
    pub directory: Option<PathBuf>,
    /// `--disable-prepuller`.
    pub disable_prepuller: bool,
}

/// GKE cluster sizing and placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GkeSettings {
    /// Zone the cluster lives in.
    pub zone: String,
    /// Project; `None` means the active gcloud project.
    pub project: Option<String>,
    /// Node machine type.
    pub machine_type: String,
    /// Node count.
    pub node_count: i32,
}

/// Where a deployment lives. Enough to tear it down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// GKE cluster name.
    pub cluster_name: String,
    /// Namespace inside the cluster.
    pub namespace: String,
    /// Public FQDN.
    pub hostname: String,
    /// Hosted zone override; `None` means the hostname's parent domain.
    pub dns_zone: Option<String>,
    /// Cluster placement.
    pub gke: GkeSettings,
    /// Existing-resource switches.
    pub policy: ResourcePolicy,
    /// Durable manifest directory, if any.
    pub directory: Option<PathBuf>,
}

/// TLS material for the ingress, as file paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    /// Server certificate.
    pub cert: PathBuf,
    /// Private key.
    pub key: PathBuf,
    /// Root chain.
    pub root_chain: PathBuf,
    /// Pre-computed Diffie-Hellman parameters.
    pub dhparam: Option<PathBuf>,
    /// Size used when generating Diffie-Hellman parameters.
    pub dhparam_bits: u32,
}

/// GitHub OAuth application settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthSettings {
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: Secret,
    /// Organizations whose members may log in. Never empty.
    pub organization_whitelist: Vec<String>,
}

/// Log shipping through filebeat to a RabbitMQ-backed logstash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    /// Name the shipper identifies itself with.
    pub shipper_name: String,
    /// Password for the RabbitMQ `pan` user.
    pub rabbitmq_pan_password: Secret,
    /// RabbitMQ host logstash forwards to.
    pub rabbitmq_target_host: String,
    /// RabbitMQ virtual host.
    pub rabbitmq_target_vhost: String,
    /// Beats client certificate.
    pub beats_cert: PathBuf,
    /// Beats client key.
    pub beats_key: PathBuf,
    /// CA that signed the beats certificates.
    pub beats_ca: PathBuf,
}

impl LoggingSettings {
    fn from_raw(raw: &RawConfig) -> Result<Option<Self>, DeployError> {
        let present: Vec<&str> = LOGGING_KEYS
            .iter()
            .copied()
            .filter(|k| !raw.is_empty(k))
            .collect();
        if present.is_empty() {
            return Ok(None);
        }
        if let Some(missing) = LOGGING_KEYS.iter().find(|k| !present.contains(k)) {
            return Err(DeployError::config(
                *missing,
                format!(
                    "log shipping is configured ({}) but this key is missing",
                    present.join(", ")
                ),
            ));
        }

        Ok(Some(Self {
            shipper_name: raw.required_string("log_shipper_name")?,
            rabbitmq_pan_password: Secret::new(raw.required_string("rabbitmq_pan_password")?),
            rabbitmq_target_host: raw.required_string("rabbitmq_target_host")?,
            rabbitmq_target_vhost: raw.required_string("rabbitmq_target_vhost")?,
            beats_cert: readable_file("beats_cert", &raw.required_string("beats_cert")?)?,
            beats_key: readable_file("beats_key", &raw.required_string("beats_key")?)?,
            beats_ca: readable_file("beats_ca", &raw.required_string("beats_ca")?)?,
        }))
    }
}

/// Bounds on the ingress address poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Delay between polls.
    pub interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            timeout: Duration::from_secs(DEFAULT_ADDRESS_TIMEOUT_SECS),
        }
    }
}

/// A fully validated deployment configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentConfig {
    /// File the configuration was read from.
    pub source: PathBuf,
    /// Cluster, namespace and hostname.
    pub target: Target,
    /// Ingress TLS material.
    pub tls: TlsMaterial,
    /// Hub authentication.
    pub oauth: OAuthSettings,
    /// Shared volume size in GiB.
    pub volume_size_gb: u32,
    /// Hub session database URL.
    pub session_db_url: Secret,
    /// Whether to deploy the image prepuller.
    pub enable_prepuller: bool,
    /// Log shipping, when configured.
    pub logging: Option<LoggingSettings>,
    /// Ingress address poll bounds.
    pub poll: PollSettings,
}

impl DeploymentConfig {
    /// Load and validate everything a deploy or render needs.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Config`] naming the first invalid key.
    pub fn load(path: &Path, flags: &Flags) -> Result<Self, DeployError> {
        let raw = RawConfig::read(path)?.with_env(|k| std::env::var(k).ok());
        Self::from_raw(path, &raw, flags)
    }

    fn from_raw(path: &Path, raw: &RawConfig, flags: &Flags) -> Result<Self, DeployError> {
        raw.warn_unknown(KNOWN_KEYS);
        let target = Target::from_raw(raw, flags)?;

        let tls = TlsMaterial {
            cert: readable_file("tls_cert", &raw.required_string("tls_cert")?)?,
            key: readable_file("tls_key", &raw.required_string("tls_key")?)?,
            root_chain: readable_file("tls_root_chain", &raw.required_string("tls_root_chain")?)?,
            dhparam: raw
                .string("tls_dhparam")?
                .map(|p| readable_file("tls_dhparam", &p))
                .transpose()?,
            dhparam_bits: bounded(
                "dhparam_bits",
                raw.integer("dhparam_bits")?.unwrap_or(DEFAULT_DHPARAM_BITS),
                1024,
                u64::from(u32::MAX),
            )?,
        };

        let oauth = OAuthSettings {
            client_id: raw.required_string("github_client_id")?,
            client_secret: Secret::new(raw.required_string("github_client_secret")?),
            organization_whitelist: whitelist(raw)?,
        };

        let volume_size_gb = bounded(
            "volume_size_gigabytes",
            raw.integer("volume_size_gigabytes")?
                .unwrap_or(DEFAULT_VOLUME_SIZE_GB),
            1,
            u64::from(u32::MAX),
        )?;

        let poll = PollSettings {
            interval: Duration::from_secs(bounded(
                "address_poll_interval_secs",
                raw.integer("address_poll_interval_secs")?
                    .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
                1,
                MAX_POLL_INTERVAL_SECS,
            )?),
            timeout: Duration::from_secs(bounded(
                "address_timeout_secs",
                raw.integer("address_timeout_secs")?
                    .unwrap_or(DEFAULT_ADDRESS_TIMEOUT_SECS),
                1,
                MAX_ADDRESS_TIMEOUT_SECS,
            )?),
        };

        let config = Self {
            source: path.to_path_buf(),
            target,
            tls,
            oauth,
            volume_size_gb,
            session_db_url: Secret::new(
                raw.string("session_db_url")?
                    .unwrap_or_else(|| DEFAULT_SESSION_DB_URL.to_string()),
            ),
            enable_prepuller: !flags.disable_prepuller,
            logging: LoggingSettings::from_raw(raw)?,
            poll,
        };

        debug!(
            cluster = %config.target.cluster_name,
            namespace = %config.target.namespace,
            hostname = %config.target.hostname,
            whitelist = ?config.oauth.organization_whitelist,
            logging = config.logging.is_some(),
            "Loaded deployment configuration"
        );
        Ok(config)
    }

    /// Load and validate only what undeploy needs.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Config`] naming the first invalid key.
    pub fn load_target(path: &Path, flags: &Flags) -> Result<Target, DeployError> {
        let raw = RawConfig::read(path)?.with_env(|k| std::env::var(k).ok());
        raw.warn_unknown(KNOWN_KEYS);
        Target::from_raw(&raw, flags)
    }

    /// GitHub OAuth callback URL.
    #[must_use]
    pub fn callback_url(&self) -> String {
        format!("https://{}/hub/oauth_callback", self.target.hostname)
    }

    /// Whitelist as the comma-separated form the hub expects.
    #[must_use]
    pub fn whitelist_csv(&self) -> String {
        self.oauth.organization_whitelist.join(",")
    }

    /// Size requested for the physical volume, e.g. `20Gi`.
    #[must_use]
    pub fn physical_volume_size(&self) -> String {
        format!("{}Gi", self.volume_size_gb)
    }

    /// Size exposed to users: 95% of the physical volume.
    #[must_use]
    pub fn shared_volume_size(&self) -> String {
        if self.volume_size_gb > 1 {
            format!("{}Gi", u64::from(self.volume_size_gb) * 95 / 100)
        } else {
            "950Mi".to_string()
        }
    }
}

impl Target {
    fn from_raw(raw: &RawConfig, flags: &Flags) -> Result<Self, DeployError> {
        if flags.policy.existing_namespace && !flags.policy.existing_cluster {
            return Err(DeployError::config(
                "existing_namespace",
                "--existing-namespace requires --existing-cluster",
            ));
        }

        let cluster_name = raw.required_string("kubernetes_cluster_name")?;
        validate_cluster_name(&cluster_name)?;

        let namespace = raw
            .string("kubernetes_cluster_namespace")?
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        validate_namespace(&namespace)?;

        let hostname = raw.required_string("hostname")?;
        validate_hostname("hostname", &hostname)?;
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();

        let dns_zone = raw.string("dns_zone")?;
        if let Some(zone) = &dns_zone {
            validate_hostname("dns_zone", zone)?;
            let bare = zone.trim_end_matches('.').to_ascii_lowercase();
            if hostname != bare && !hostname.ends_with(&format!(".{bare}")) {
                return Err(DeployError::config(
                    "dns_zone",
                    format!("hostname {hostname} is not inside zone {bare}"),
                ));
            }
        }

        let gke = GkeSettings {
            zone: raw
                .string("gke_zone")?
                .unwrap_or_else(|| DEFAULT_GKE_ZONE.to_string()),
            project: raw.string("gke_project")?,
            machine_type: raw
                .string("gke_machine_type")?
                .unwrap_or_else(|| DEFAULT_GKE_MACHINE_TYPE.to_string()),
            node_count: bounded(
                "gke_node_count",
                raw.integer("gke_node_count")?.unwrap_or(DEFAULT_GKE_NODE_COUNT),
                1,
                1000,
            )?,
        };

        Ok(Self {
            cluster_name,
            namespace,
            hostname,
            dns_zone,
            gke,
            policy: flags.policy,
            directory: flags.directory.clone(),
        })
    }
}

/// Unvalidated key/value view of the config file.
#[derive(Debug, Clone, Default)]
struct RawConfig {
    values: BTreeMap<String, Value>,
}

impl RawConfig {
    fn read(path: &Path) -> Result<Self, DeployError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DeployError::config("file", format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> Result<Self, DeployError> {
        let value: Value = serde_yaml::from_str(text)
            .map_err(|e| DeployError::config("file", format!("not valid YAML: {e}")))?;

        let mapping = match value {
            Value::Mapping(m) => m,
            Value::Null => serde_yaml::Mapping::new(),
            _ => {
                return Err(DeployError::config(
                    "file",
                    "top level must be a mapping of keys to values",
                ))
            }
        };

        let mut values = BTreeMap::new();
        for (k, v) in mapping {
            let Value::String(key) = k else {
                return Err(DeployError::config("file", "keys must be strings"));
            };
            values.insert(key, v);
        }
        Ok(Self { values })
    }

    /// Fill keys absent from the file from `JLD_<KEY>` variables.
    fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        for key in KNOWN_KEYS {
            if self.is_empty(key) {
                if let Some(v) = lookup(&format!("{ENV_PREFIX}{}", key.to_ascii_uppercase())) {
                    self.values.insert((*key).to_string(), Value::String(v));
                }
            }
        }

        if self.is_empty("tls_cert") {
            if let Some(dir) = lookup(ENV_CERTIFICATE_DIRECTORY) {
                let dir = PathBuf::from(dir);
                for (key, file) in [
                    ("tls_cert", "cert.pem"),
                    ("tls_key", "key.pem"),
                    ("tls_root_chain", "chain.pem"),
                ] {
                    self.values.insert(
                        key.to_string(),
                        Value::String(dir.join(file).display().to_string()),
                    );
                }
                let dhparam = dir.join("dhparam.pem");
                if self.is_empty("tls_dhparam") && dhparam.exists() {
                    self.values.insert(
                        "tls_dhparam".to_string(),
                        Value::String(dhparam.display().to_string()),
                    );
                }
                if self.is_empty("beats_cert") && dir.join("beats_cert.pem").exists() {
                    for (key, file) in [
                        ("beats_cert", "beats_cert.pem"),
                        ("beats_key", "beats_key.pem"),
                        ("beats_ca", "beats_ca.pem"),
                    ] {
                        self.values.insert(
                            key.to_string(),
                            Value::String(dir.join(file).display().to_string()),
                        );
                    }
                }
            }
        }
        self
    }

    fn warn_unknown(&self, known: &[&str]) {
        for key in self.values.keys() {
            if !known.contains(&key.as_str()) {
                warn!(key = %key, "Unknown configuration key ignored");
            }
        }
    }

    fn is_empty(&self, key: &str) -> bool {
        match self.values.get(key) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(Value::Sequence(s)) => s.is_empty(),
            Some(_) => false,
        }
    }

    fn string(&self, key: &str) -> Result<Option<String>, DeployError> {
        if self.is_empty(key) {
            return Ok(None);
        }
        match self.values.get(key) {
            Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            _ => Err(DeployError::config(key, "expected a string")),
        }
    }

    fn required_string(&self, key: &str) -> Result<String, DeployError> {
        self.string(key)?
            .ok_or_else(|| DeployError::config(key, "required but missing"))
    }

    fn integer(&self, key: &str) -> Result<Option<u64>, DeployError> {
        if self.is_empty(key) {
            return Ok(None);
        }
        match self.values.get(key) {
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| DeployError::config(key, "expected a non-negative integer")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| DeployError::config(key, format!("'{s}' is not an integer"))),
            _ => Err(DeployError::config(key, "expected an integer")),
        }
    }

    fn list(&self, key: &str) -> Result<Option<Vec<String>>, DeployError> {
        if self.is_empty(key) {
            return Ok(None);
        }
        match self.values.get(key) {
            Some(Value::Sequence(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.trim().to_string()),
                    Value::Number(n) => Ok(n.to_string()),
                    _ => Err(DeployError::config(key, "list entries must be strings")),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(Value::String(s)) => Ok(Some(
                s.split(',').map(|t| t.trim().to_string()).collect(),
            )),
            _ => Err(DeployError::config(key, "expected a list")),
        }
    }
}

fn whitelist(raw: &RawConfig) -> Result<Vec<String>, DeployError> {
    const KEY: &str = "github_organization_whitelist";
    let entries = raw
        .list(KEY)?
        .ok_or_else(|| DeployError::config(KEY, "required but missing"))?;

    let mut orgs: Vec<String> = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.is_empty() || entry.chars().any(|c| c.is_whitespace() || c == ',') {
            return Err(DeployError::config(
                KEY,
                format!("'{entry}' is not a valid organization name"),
            ));
        }
        if !orgs.contains(&entry) {
            orgs.push(entry);
        }
    }

    if orgs.is_empty() {
        return Err(DeployError::config(KEY, "must name at least one organization"));
    }
    Ok(orgs)
}

fn bounded<T: TryFrom<u64>>(key: &str, value: u64, min: u64, max: u64) -> Result<T, DeployError> {
    if value < min || value > max {
        return Err(DeployError::config(
            key,
            format!("{value} is outside {min}..={max}"),
        ));
    }
    T::try_from(value).map_err(|_| DeployError::config(key, format!("{value} is out of range")))
}

fn readable_file(key: &str, path: &str) -> Result<PathBuf, DeployError> {
    let path = PathBuf::from(path);
    File::open(&path)
        .map_err(|e| DeployError::config(key, format!("{} is not readable: {e}", path.display())))?;
    if !path.is_file() {
        return Err(DeployError::config(
            key,
            format!("{} is not a regular file", path.display()),
        ));
    }
    Ok(path)
}

/// GKE cluster names: lowercase, start with a letter, at most 40 characters.
fn validate_cluster_name(name: &str) -> Result<(), DeployError> {
    const KEY: &str = "kubernetes_cluster_name";
    if name.len() > 40 {
        return Err(DeployError::config(KEY, "at most 40 characters"));
    }
    if !CLUSTER_NAME_RE.is_match(name) {
        return Err(DeployError::config(
            KEY,
            format!("'{name}' must be lowercase letters, digits and '-', starting with a letter"),
        ));
    }
    Ok(())
}

/// Namespaces are DNS-1123 labels.
fn validate_namespace(name: &str) -> Result<(), DeployError> {
    const KEY: &str = "kubernetes_cluster_namespace";
    if name.len() > 63 || !NAMESPACE_RE.is_match(name) {
        return Err(DeployError::config(
            KEY,
            format!("'{name}' is not a valid namespace name"),
        ));
    }
    Ok(())
}

fn validate_hostname(key: &str, name: &str) -> Result<(), DeployError> {
    let bare = name.strip_suffix('.').unwrap_or(name);
    if bare.is_empty() || bare.len() > 253 {
        return Err(DeployError::config(key, "must be 1 to 253 characters"));
    }

    let labels: Vec<&str> = bare.split('.').collect();
    if labels.len() < 2 {
        return Err(DeployError::config(
            key,
            format!("'{name}' is not fully qualified"),
        ));
    }
    for label in labels {
        if label.is_empty() || label.len() > 63 || !DNS_LABEL_RE.is_match(label) {
            return Err(DeployError::config(
                key,
                format!("'{label}' is not a valid DNS label"),
            ));
        }
    }
    Ok(())
}
