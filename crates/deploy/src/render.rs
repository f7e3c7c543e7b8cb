//! Manifest rendering.
//!
//! Each Kubernetes object the demo needs is a Handlebars template embedded in
//! the binary. Templates reference `{{PLACEHOLDER}}` names; every name maps to
//! a [`Placeholder`] whose value is resolved from the [`DeploymentConfig`].
//! Rendering runs in strict mode, so a reference with no value is a
//! [`DeployError::Template`] rather than a broken object at apply time.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use handlebars::Handlebars;
use jld_cloud::providers::command::run_captured;
use regex::Regex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{DeploymentConfig, Secret, TlsMaterial};
use crate::error::DeployError;

/// Subdirectory of a manifest directory holding the rendered objects.
pub const DEPLOYMENT_DIR: &str = "deployment";

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex")
});

/// Groups of objects, in apply order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    /// Log shipping: logstash forwarding to RabbitMQ, filebeat on every node.
    Logging,
    /// Daemon set that pulls the lab image onto every node.
    Prepuller,
    /// The hub: secrets, config, storage, service, deployment.
    Jupyterhub,
    /// TLS-terminating nginx behind a load balancer.
    Ingress,
}

impl Component {
    /// All components, in apply order.
    pub const ALL: [Self; 4] = [Self::Logging, Self::Prepuller, Self::Jupyterhub, Self::Ingress];

    /// Components `config` switches on.
    #[must_use]
    pub fn enabled_for(config: &DeploymentConfig) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|c| match c {
                Self::Logging => config.logging.is_some(),
                Self::Prepuller => config.enable_prepuller,
                Self::Jupyterhub | Self::Ingress => true,
            })
            .collect()
    }

    /// Directory name under `deployment/`.
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Logging => "logging",
            Self::Prepuller => "prepuller",
            Self::Jupyterhub => "jupyterhub",
            Self::Ingress => "ingress",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One embedded template and the object it produces.
#[derive(Debug, Clone)]
pub struct TemplateSpec {
    /// Component the object belongs to.
    pub component: Component,
    /// File name under the component directory.
    pub file: &'static str,
    /// `apiVersion` of the rendered object.
    pub api_version: &'static str,
    /// `kind` of the rendered object.
    pub kind: &'static str,
    /// `metadata.name` of the rendered object.
    pub name: &'static str,
    /// Template text.
    pub source: &'static str,
}

impl TemplateSpec {
    /// Path relative to the `deployment/` directory.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        Path::new(self.component.dir_name()).join(self.file)
    }

    /// Identity of the object, known without rendering.
    #[must_use]
    pub fn resource(&self) -> ResourceRef {
        ResourceRef {
            api_version: self.api_version.to_string(),
            kind: self.kind.to_string(),
            name: self.name.to_string(),
        }
    }
}

macro_rules! template {
    ($component:ident, $dir:literal, $file:literal, $api:literal, $kind:literal, $name:literal) => {
        TemplateSpec {
            component: Component::$component,
            file: $file,
            api_version: $api,
            kind: $kind,
            name: $name,
            source: include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/templates/",
                $dir,
                "/",
                $file,
                ".hbs"
            )),
        }
    };
}

/// Every object the demo deploys, in apply order.
pub static TEMPLATES: LazyLock<Vec<TemplateSpec>> = LazyLock::new(|| {
    vec![
        template!(Logging, "logging", "logstashrmq-secrets.yaml", "v1", "Secret", "logstashrmq"),
        template!(Logging, "logging", "logstashrmq-service.yaml", "v1", "Service", "logstashrmq"),
        template!(
            Logging,
            "logging",
            "logstashrmq-deployment.yaml",
            "apps/v1",
            "Deployment",
            "logstash"
        ),
        template!(Logging, "logging", "filebeat-secrets.yaml", "v1", "Secret", "filebeat"),
        template!(
            Logging,
            "logging",
            "filebeat-daemonset.yaml",
            "apps/v1",
            "DaemonSet",
            "filebeat"
        ),
        template!(
            Prepuller,
            "prepuller",
            "prepuller-daemonset.yaml",
            "apps/v1",
            "DaemonSet",
            "jld-prepuller"
        ),
        template!(Jupyterhub, "jupyterhub", "jld-hub-secrets.yaml", "v1", "Secret", "jld-hub"),
        template!(
            Jupyterhub,
            "jupyterhub",
            "jld-hub-config.yaml",
            "v1",
            "ConfigMap",
            "jld-hub-config"
        ),
        template!(
            Jupyterhub,
            "jupyterhub",
            "jld-hub-physpvc.yaml",
            "v1",
            "PersistentVolumeClaim",
            "jld-hub-physpvc"
        ),
        template!(Jupyterhub, "jupyterhub", "jld-hub-service.yaml", "v1", "Service", "jld-hub"),
        template!(
            Jupyterhub,
            "jupyterhub",
            "jld-hub-deployment.yaml",
            "apps/v1",
            "Deployment",
            "jld-hub"
        ),
        template!(Ingress, "ingress", "tls-secrets.yaml", "v1", "Secret", "tls"),
        template!(Ingress, "ingress", "nginx-config.yaml", "v1", "ConfigMap", "jld-nginx-config"),
        template!(Ingress, "ingress", "nginx-service.yaml", "v1", "Service", "jld-nginx"),
        template!(
            Ingress,
            "ingress",
            "nginx-deployment.yaml",
            "apps/v1",
            "Deployment",
            "jld-nginx"
        ),
    ]
});

/// Name of the load balancer service whose address DNS points at.
pub const INGRESS_SERVICE: &str = "jld-nginx";

/// Every substitution a template may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Placeholder {
    ClusterName,
    ClusterIdentifier,
    Hostname,
    GithubClientId,
    GithubSecret,
    GithubOauthCallbackUrl,
    GithubOrganizationWhitelist,
    SessionDbUrl,
    JupyterhubCryptoKey,
    SharedVolumeSize,
    PhysicalSharedVolumeSize,
    TlsCrt,
    TlsKey,
    RootChainPem,
    DhparamPem,
    CaCertificate,
    BeatsCertificate,
    BeatsKey,
    ShipperName,
    RabbitmqPanPassword,
    RabbitmqTargetHost,
    RabbitmqTargetVhost,
}

impl Placeholder {
    /// All placeholders.
    pub const ALL: [Self; 22] = [
        Self::ClusterName,
        Self::ClusterIdentifier,
        Self::Hostname,
        Self::GithubClientId,
        Self::GithubSecret,
        Self::GithubOauthCallbackUrl,
        Self::GithubOrganizationWhitelist,
        Self::SessionDbUrl,
        Self::JupyterhubCryptoKey,
        Self::SharedVolumeSize,
        Self::PhysicalSharedVolumeSize,
        Self::TlsCrt,
        Self::TlsKey,
        Self::RootChainPem,
        Self::DhparamPem,
        Self::CaCertificate,
        Self::BeatsCertificate,
        Self::BeatsKey,
        Self::ShipperName,
        Self::RabbitmqPanPassword,
        Self::RabbitmqTargetHost,
        Self::RabbitmqTargetVhost,
    ];

    /// Name as written inside `{{ }}`.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ClusterName => "CLUSTERNAME",
            Self::ClusterIdentifier => "CLUSTER_IDENTIFIER",
            Self::Hostname => "HOSTNAME",
            Self::GithubClientId => "GITHUB_CLIENT_ID",
            Self::GithubSecret => "GITHUB_SECRET",
            Self::GithubOauthCallbackUrl => "GITHUB_OAUTH_CALLBACK_URL",
            Self::GithubOrganizationWhitelist => "GITHUB_ORGANIZATION_WHITELIST",
            Self::SessionDbUrl => "SESSION_DB_URL",
            Self::JupyterhubCryptoKey => "JUPYTERHUB_CRYPTO_KEY",
            Self::SharedVolumeSize => "SHARED_VOLUME_SIZE",
            Self::PhysicalSharedVolumeSize => "PHYSICAL_SHARED_VOLUME_SIZE",
            Self::TlsCrt => "TLS_CRT",
            Self::TlsKey => "TLS_KEY",
            Self::RootChainPem => "ROOT_CHAIN_PEM",
            Self::DhparamPem => "DHPARAM_PEM",
            Self::CaCertificate => "CA_CERTIFICATE",
            Self::BeatsCertificate => "BEATS_CERTIFICATE",
            Self::BeatsKey => "BEATS_KEY",
            Self::ShipperName => "SHIPPER_NAME",
            Self::RabbitmqPanPassword => "RABBITMQ_PAN_PASSWORD",
            Self::RabbitmqTargetHost => "RABBITMQ_TARGET_HOST",
            Self::RabbitmqTargetVhost => "RABBITMQ_TARGET_VHOST",
        }
    }

    /// Look a placeholder up by its template name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    /// Whether the value lands in a `Secret` and is therefore base64 encoded.
    #[must_use]
    pub fn is_encoded(self) -> bool {
        !matches!(
            self,
            Self::ClusterName
                | Self::ClusterIdentifier
                | Self::Hostname
                | Self::SharedVolumeSize
                | Self::PhysicalSharedVolumeSize
                | Self::ShipperName
                | Self::RabbitmqTargetHost
                | Self::RabbitmqTargetVhost
        )
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Generated per-render key material.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    /// PEM Diffie-Hellman parameters.
    pub dhparams: Secret,
    /// Hub cookie and state encryption key.
    pub crypto_key: Secret,
}

impl KeyMaterial {
    /// Read the configured dhparam file, or run `openssl dhparam`, and draw
    /// a fresh hub crypto key.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Io`] if the dhparam file cannot be read, or
    /// [`DeployError::Provider`] if `openssl` fails.
    pub async fn generate(tls: &TlsMaterial) -> Result<Self, DeployError> {
        let dhparams = if let Some(path) = &tls.dhparam {
            debug!(path = %path.display(), "Using pre-computed dhparams");
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| DeployError::io(path, e))?
        } else {
            info!(
                bits = tls.dhparam_bits,
                "Generating Diffie-Hellman parameters; this can take a while"
            );
            let bits = tls.dhparam_bits.to_string();
            let mut pem = run_captured("openssl", &["dhparam", &bits]).await?;
            pem.push('\n');
            pem
        };

        Ok(Self {
            dhparams: Secret::new(dhparams),
            crypto_key: Secret::new(generate_crypto_key()),
        })
    }
}

/// Two random 128-bit hex words joined by `;`.
fn generate_crypto_key() -> String {
    format!("{};{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Resolved value for every [`Placeholder`].
#[derive(Clone)]
pub struct Bindings {
    values: BTreeMap<Placeholder, String>,
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bindings")
            .field("placeholders", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Bindings {
    /// Resolve every placeholder from the configuration. Log shipping
    /// placeholders are bound only when log shipping is configured.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Io`] if a TLS or beats file cannot be read.
    pub fn resolve(config: &DeploymentConfig, keys: &KeyMaterial) -> Result<Self, DeployError> {
        let mut raw: BTreeMap<Placeholder, Vec<u8>> = BTreeMap::new();
        raw.insert(Placeholder::ClusterName, config.target.cluster_name.clone().into_bytes());
        raw.insert(Placeholder::ClusterIdentifier, config.target.namespace.clone().into_bytes());
        raw.insert(Placeholder::Hostname, config.target.hostname.clone().into_bytes());
        raw.insert(Placeholder::GithubClientId, config.oauth.client_id.clone().into_bytes());
        raw.insert(
            Placeholder::GithubSecret,
            config.oauth.client_secret.expose().as_bytes().to_vec(),
        );
        raw.insert(Placeholder::GithubOauthCallbackUrl, config.callback_url().into_bytes());
        raw.insert(Placeholder::GithubOrganizationWhitelist, config.whitelist_csv().into_bytes());
        raw.insert(
            Placeholder::SessionDbUrl,
            config.session_db_url.expose().as_bytes().to_vec(),
        );
        raw.insert(
            Placeholder::JupyterhubCryptoKey,
            keys.crypto_key.expose().as_bytes().to_vec(),
        );
        raw.insert(Placeholder::SharedVolumeSize, config.shared_volume_size().into_bytes());
        raw.insert(
            Placeholder::PhysicalSharedVolumeSize,
            config.physical_volume_size().into_bytes(),
        );
        raw.insert(Placeholder::TlsCrt, read_file(&config.tls.cert)?);
        raw.insert(Placeholder::TlsKey, read_file(&config.tls.key)?);
        raw.insert(Placeholder::RootChainPem, read_file(&config.tls.root_chain)?);
        raw.insert(Placeholder::DhparamPem, keys.dhparams.expose().as_bytes().to_vec());
        if let Some(logging) = &config.logging {
            raw.insert(Placeholder::CaCertificate, read_file(&logging.beats_ca)?);
            raw.insert(Placeholder::BeatsCertificate, read_file(&logging.beats_cert)?);
            raw.insert(Placeholder::BeatsKey, read_file(&logging.beats_key)?);
            raw.insert(Placeholder::ShipperName, logging.shipper_name.clone().into_bytes());
            raw.insert(
                Placeholder::RabbitmqPanPassword,
                logging.rabbitmq_pan_password.expose().as_bytes().to_vec(),
            );
            raw.insert(
                Placeholder::RabbitmqTargetHost,
                logging.rabbitmq_target_host.clone().into_bytes(),
            );
            raw.insert(
                Placeholder::RabbitmqTargetVhost,
                logging.rabbitmq_target_vhost.clone().into_bytes(),
            );
        }

        let values = raw
            .into_iter()
            .map(|(p, bytes)| {
                let value = if p.is_encoded() {
                    BASE64.encode(bytes)
                } else {
                    String::from_utf8_lossy(&bytes).into_owned()
                };
                (p, value)
            })
            .collect();
        Ok(Self { values })
    }

    /// Value bound to `placeholder`.
    #[must_use]
    pub fn get(&self, placeholder: Placeholder) -> Option<&str> {
        self.values.get(&placeholder).map(String::as_str)
    }

    fn to_data(&self) -> serde_json::Value {
        self.values
            .iter()
            .map(|(p, v)| (p.name().to_string(), serde_json::Value::String(v.clone())))
            .collect::<serde_json::Map<_, _>>()
            .into()
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, DeployError> {
    std::fs::read(path).map_err(|e| DeployError::io(path, e))
}

/// Identity of a Kubernetes object inside the target namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    /// `apiVersion`, e.g. `apps/v1`.
    pub api_version: String,
    /// `kind`, e.g. `Deployment`.
    pub kind: String,
    /// `metadata.name`.
    pub name: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// One rendered manifest document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Path relative to `deployment/`.
    pub path: PathBuf,
    /// YAML text.
    pub contents: String,
}

impl Manifest {
    /// Read `apiVersion`, `kind` and `metadata.name` from the document.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Template`] if the document is not YAML or lacks
    /// one of those fields.
    pub fn identity(&self) -> Result<ResourceRef, DeployError> {
        let label = self.path.display().to_string();
        let doc: serde_yaml::Value = serde_yaml::from_str(&self.contents)
            .map_err(|e| DeployError::template(&label, format!("not valid YAML: {e}")))?;

        let field = |value: Option<&serde_yaml::Value>, name: &str| {
            value
                .and_then(serde_yaml::Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| DeployError::template(&label, format!("missing `{name}`")))
        };

        Ok(ResourceRef {
            api_version: field(doc.get("apiVersion"), "apiVersion")?,
            kind: field(doc.get("kind"), "kind")?,
            name: field(doc.get("metadata").and_then(|m| m.get("name")), "metadata.name")?,
        })
    }
}

/// Ordered manifests for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedManifestSet {
    manifests: Vec<Manifest>,
}

impl RenderedManifestSet {
    /// Wrap manifests already in apply order.
    #[must_use]
    pub fn new(manifests: Vec<Manifest>) -> Self {
        Self { manifests }
    }

    /// Manifests in apply order.
    pub fn iter(&self) -> impl Iterator<Item = &Manifest> {
        self.manifests.iter()
    }

    /// Number of manifests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    /// Find a manifest by its file name.
    #[must_use]
    pub fn find(&self, file: &str) -> Option<&Manifest> {
        self.manifests
            .iter()
            .find(|m| m.path.file_name().is_some_and(|n| n == file))
    }

    /// Identities of every manifest, in apply order.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Template`] for a manifest with no identity.
    pub fn resources(&self) -> Result<Vec<ResourceRef>, DeployError> {
        self.manifests.iter().map(Manifest::identity).collect()
    }

    /// Whether `dir` already holds a rendered deployment.
    #[must_use]
    pub fn is_prerendered(dir: &Path) -> bool {
        dir.join(DEPLOYMENT_DIR).is_dir()
    }

    /// Write manifests under `<dir>/deployment/` and keep a copy of the
    /// configuration they were rendered from.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Io`] on any filesystem failure.
    pub fn persist(&self, dir: &Path, config_source: &Path) -> Result<(), DeployError> {
        let root = dir.join(DEPLOYMENT_DIR);
        for manifest in &self.manifests {
            let path = root.join(&manifest.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| DeployError::io(parent, e))?;
            }
            std::fs::write(&path, &manifest.contents).map_err(|e| DeployError::io(&path, e))?;
        }

        let stamp = chrono::Utc::now().format("%Y-%m-%d-%H-%M-%S");
        let copy = dir.join(format!("deploy.{stamp}.yml"));
        std::fs::copy(config_source, &copy).map_err(|e| DeployError::io(&copy, e))?;

        info!(
            directory = %dir.display(),
            manifests = self.manifests.len(),
            "Wrote deployment manifests"
        );
        Ok(())
    }

    /// Load a pre-rendered directory verbatim.
    ///
    /// Known files come first in apply order; any other `.yaml`/`.yml` the
    /// operator added follows, sorted by path.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Io`] if the directory cannot be read, or
    /// [`DeployError::Template`] if a file still carries a placeholder.
    pub fn load(dir: &Path) -> Result<Self, DeployError> {
        let root = dir.join(DEPLOYMENT_DIR);
        let mut manifests = Vec::new();
        let mut seen = BTreeSet::new();

        for spec in TEMPLATES.iter() {
            let relative = spec.relative_path();
            let path = root.join(&relative);
            if path.is_file() {
                manifests.push(read_manifest(&path, relative.clone())?);
                seen.insert(relative);
            }
        }

        let mut extras = Vec::new();
        collect_yaml(&root, &root, &mut extras)?;
        extras.sort();
        for relative in extras {
            if !seen.contains(&relative) {
                manifests.push(read_manifest(&root.join(&relative), relative)?);
            }
        }

        for manifest in &manifests {
            if let Some(m) = PLACEHOLDER_RE.captures(&manifest.contents) {
                return Err(DeployError::template(
                    manifest.path.display().to_string(),
                    format!("unresolved placeholder {{{{{}}}}}", &m[1]),
                ));
            }
        }

        info!(
            directory = %dir.display(),
            manifests = manifests.len(),
            "Loaded pre-rendered manifests"
        );
        Ok(Self { manifests })
    }
}

fn read_manifest(path: &Path, relative: PathBuf) -> Result<Manifest, DeployError> {
    let contents = std::fs::read_to_string(path).map_err(|e| DeployError::io(path, e))?;
    Ok(Manifest {
        path: relative,
        contents,
    })
}

fn collect_yaml(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), DeployError> {
    let entries = std::fs::read_dir(dir).map_err(|e| DeployError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| DeployError::io(dir, e))?.path();
        if path.is_dir() {
            collect_yaml(root, &path, out)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_path_buf());
            }
        }
    }
    Ok(())
}

/// Turns a configuration into manifests.
pub struct ManifestRenderer {
    handlebars: Handlebars<'static>,
    templates: Vec<TemplateSpec>,
}

impl ManifestRenderer {
    /// Renderer over the embedded templates of `components`.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Template`] if a template does not parse.
    pub fn new(components: &[Component]) -> Result<Self, DeployError> {
        let templates = TEMPLATES
            .iter()
            .filter(|t| components.contains(&t.component))
            .cloned()
            .collect();
        Self::with_templates(templates)
    }

    /// Renderer over the components `config` switches on.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Template`] if a template does not parse.
    pub fn for_config(config: &DeploymentConfig) -> Result<Self, DeployError> {
        Self::new(&Component::enabled_for(config))
    }

    /// Renderer over an explicit template list.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Template`] if a template does not parse.
    pub fn with_templates(templates: Vec<TemplateSpec>) -> Result<Self, DeployError> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        handlebars.register_escape_fn(handlebars::no_escape);

        for spec in &templates {
            let key = spec.relative_path().display().to_string();
            handlebars
                .register_template_string(&key, spec.source)
                .map_err(|e| DeployError::template(&key, e.to_string()))?;
        }

        Ok(Self {
            handlebars,
            templates,
        })
    }

    /// Check every referenced placeholder is one the configuration binds.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Template`] naming the template and placeholder.
    pub fn validate(&self) -> Result<(), DeployError> {
        for spec in &self.templates {
            for cap in PLACEHOLDER_RE.captures_iter(spec.source) {
                let name = &cap[1];
                if Placeholder::from_name(name).is_none() {
                    return Err(DeployError::template(
                        spec.relative_path().display().to_string(),
                        format!("placeholder {{{{{name}}}}} has no configuration value"),
                    ));
                }
            }
        }
        debug!(templates = self.templates.len(), "Templates validated");
        Ok(())
    }

    /// Render every template against `config`.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Template`] if a template cannot be fully
    /// resolved, or [`DeployError::Io`] if a TLS file cannot be read.
    pub fn render(
        &self,
        config: &DeploymentConfig,
        keys: &KeyMaterial,
    ) -> Result<RenderedManifestSet, DeployError> {
        self.validate()?;
        let data = Bindings::resolve(config, keys)?.to_data();

        let mut manifests = Vec::with_capacity(self.templates.len());
        for spec in &self.templates {
            let relative = spec.relative_path();
            let key = relative.display().to_string();
            let contents = self
                .handlebars
                .render(&key, &data)
                .map_err(|e| DeployError::template(&key, e.to_string()))?;
            if contents.contains("{{") {
                return Err(DeployError::template(&key, "output still contains `{{`"));
            }
            manifests.push(Manifest {
                path: relative,
                contents,
            });
        }

        info!(
            manifests = manifests.len(),
            hostname = %config.target.hostname,
            "Rendered manifests"
        );
        Ok(RenderedManifestSet { manifests })
    }

    /// Every object the embedded templates can produce, in apply order,
    /// whether or not its component is enabled. Used by teardown when no
    /// rendered directory is available.
    #[must_use]
    pub fn inventory() -> Vec<ResourceRef> {
        TEMPLATES.iter().map(TemplateSpec::resource).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        GkeSettings, LoggingSettings, OAuthSettings, PollSettings, ResourcePolicy, Target,
    };

    fn fixture(dir: &Path) -> DeploymentConfig {
        for (name, body) in [
            ("cert.pem", "CERT"),
            ("key.pem", "PRIVATE KEY"),
            ("chain.pem", "CHAIN"),
        ] {
            std::fs::write(dir.join(name), body).unwrap();
        }
        let config_file = dir.join("deploy.yml");
        std::fs::write(&config_file, "kubernetes_cluster_name: demo1\n").unwrap();

        DeploymentConfig {
            source: config_file,
            target: Target {
                cluster_name: "demo1".into(),
                namespace: "default".into(),
                hostname: "demo.example.org".into(),
                dns_zone: None,
                gke: GkeSettings {
                    zone: "us-central1-a".into(),
                    project: Some("proj".into()),
                    machine_type: "n1-standard-2".into(),
                    node_count: 2,
                },
                policy: ResourcePolicy::default(),
                directory: None,
            },
            tls: TlsMaterial {
                cert: dir.join("cert.pem"),
                key: dir.join("key.pem"),
                root_chain: dir.join("chain.pem"),
                dhparam: None,
                dhparam_bits: 2048,
            },
            oauth: OAuthSettings {
                client_id: "abc123".into(),
                client_secret: Secret::new("s3cr3t"),
                organization_whitelist: vec!["lsst-sqre".into()],
            },
            volume_size_gb: 20,
            session_db_url: Secret::new("sqlite:////home/jupyter/jupyterhub.sqlite"),
            enable_prepuller: true,
            logging: None,
            poll: PollSettings::default(),
        }
    }

    fn with_logging(dir: &Path, mut config: DeploymentConfig) -> DeploymentConfig {
        for (name, body) in [
            ("beats_cert.pem", "BEATS CERT"),
            ("beats_key.pem", "BEATS KEY"),
            ("beats_ca.pem", "BEATS CA"),
        ] {
            std::fs::write(dir.join(name), body).unwrap();
        }
        config.logging = Some(LoggingSettings {
            shipper_name: "jld-demo".into(),
            rabbitmq_pan_password: Secret::new("rmq-pass"),
            rabbitmq_target_host: "rabbit.example.org".into(),
            rabbitmq_target_vhost: "logs".into(),
            beats_cert: dir.join("beats_cert.pem"),
            beats_key: dir.join("beats_key.pem"),
            beats_ca: dir.join("beats_ca.pem"),
        });
        config
    }

    fn count(component: Component) -> usize {
        TEMPLATES.iter().filter(|t| t.component == component).count()
    }

    fn keys() -> KeyMaterial {
        KeyMaterial {
            dhparams: Secret::new("DH PARAMS"),
            crypto_key: Secret::new(generate_crypto_key()),
        }
    }

    #[test]
    fn test_render_resolves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let set = ManifestRenderer::for_config(&config)
            .unwrap()
            .render(&config, &keys())
            .unwrap();

        assert_eq!(set.len(), TEMPLATES.len() - count(Component::Logging));
        for manifest in set.iter() {
            assert!(!manifest.contents.contains("{{"), "{}", manifest.path.display());
            manifest.identity().unwrap();
        }
    }

    #[test]
    fn test_secrets_are_base64() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let set = ManifestRenderer::for_config(&config)
            .unwrap()
            .render(&config, &keys())
            .unwrap();

        let hub = set.find("jld-hub-secrets.yaml").unwrap();
        assert!(!hub.contents.contains("s3cr3t"));
        assert!(hub.contents.contains(&BASE64.encode("s3cr3t")));
        assert!(hub.contents.contains(&BASE64.encode("lsst-sqre")));

        let tls = set.find("tls-secrets.yaml").unwrap();
        assert!(!tls.contents.contains("PRIVATE KEY"));
        assert!(tls.contents.contains(&BASE64.encode("PRIVATE KEY")));
    }

    #[test]
    fn test_ingress_references_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let set = ManifestRenderer::for_config(&config)
            .unwrap()
            .render(&config, &keys())
            .unwrap();

        let nginx = set.find("nginx-config.yaml").unwrap();
        assert!(nginx.contents.contains("server_name demo.example.org;"));
        let pvc = set.find("jld-hub-physpvc.yaml").unwrap();
        assert!(pvc.contents.contains("storage: 20Gi"));
    }

    #[test]
    fn test_disabled_prepuller_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let set = ManifestRenderer::new(&[Component::Jupyterhub, Component::Ingress])
            .unwrap()
            .render(&config, &keys())
            .unwrap();
        assert!(set.find("prepuller-daemonset.yaml").is_none());
        assert_eq!(set.len(), count(Component::Jupyterhub) + count(Component::Ingress));
    }

    #[test]
    fn test_enabled_components_follow_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fixture(dir.path());
        assert_eq!(
            Component::enabled_for(&config),
            vec![Component::Prepuller, Component::Jupyterhub, Component::Ingress]
        );

        config.enable_prepuller = false;
        let config = with_logging(dir.path(), config);
        assert_eq!(
            Component::enabled_for(&config),
            vec![Component::Logging, Component::Jupyterhub, Component::Ingress]
        );
    }

    #[test]
    fn test_logging_renders_first_with_encoded_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let config = with_logging(dir.path(), fixture(dir.path()));
        let set = ManifestRenderer::for_config(&config)
            .unwrap()
            .render(&config, &keys())
            .unwrap();

        assert_eq!(set.len(), TEMPLATES.len());
        let first = set.iter().next().unwrap();
        assert_eq!(first.path, Path::new("logging/logstashrmq-secrets.yaml"));
        assert!(!first.contents.contains("rmq-pass"));
        assert!(first.contents.contains(&BASE64.encode("rmq-pass")));
        assert!(first.contents.contains(&BASE64.encode("BEATS KEY")));

        let logstash = set.find("logstashrmq-deployment.yaml").unwrap();
        assert!(logstash.contents.contains("value: \"rabbit.example.org\""));
        assert!(logstash.contents.contains("value: \"jld-demo\""));
        assert_eq!(logstash.identity().unwrap().name, "logstash");
    }

    #[test]
    fn test_logging_templates_without_settings_fail_to_render() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let err = ManifestRenderer::new(&Component::ALL)
            .unwrap()
            .render(&config, &keys())
            .unwrap_err();
        assert_eq!(err.kind(), "TemplateError");
    }

    #[test]
    fn test_unknown_placeholder_is_template_error() {
        let renderer = ManifestRenderer::with_templates(vec![TemplateSpec {
            component: Component::Ingress,
            file: "extra.yaml",
            api_version: "v1",
            kind: "ConfigMap",
            name: "extra",
            source: concat!(
                "apiVersion: v1\nkind: ConfigMap\n",
                "metadata:\n  name: extra\ndata:\n  x: {{NOT_A_VALUE}}\n"
            ),
        }])
        .unwrap();

        let err = renderer.validate().unwrap_err();
        assert_eq!(err.kind(), "TemplateError");
        assert!(err.to_string().contains("NOT_A_VALUE"));
    }

    #[test]
    fn test_unused_bindings_are_fine() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let renderer = ManifestRenderer::with_templates(vec![TemplateSpec {
            component: Component::Ingress,
            file: "only-host.yaml",
            api_version: "v1",
            kind: "ConfigMap",
            name: "only-host",
            source: concat!(
                "apiVersion: v1\nkind: ConfigMap\n",
                "metadata:\n  name: only-host\ndata:\n  host: {{HOSTNAME}}\n"
            ),
        }])
        .unwrap();

        let set = renderer.render(&config, &keys()).unwrap();
        assert!(set.iter().next().unwrap().contents.contains("host: demo.example.org"));
    }

    #[test]
    fn test_persist_then_load_keeps_order_and_extras() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let out = dir.path().join("cfg");
        let set = ManifestRenderer::for_config(&config)
            .unwrap()
            .render(&config, &keys())
            .unwrap();

        assert!(!RenderedManifestSet::is_prerendered(&out));
        set.persist(&out, &config.source).unwrap();
        assert!(RenderedManifestSet::is_prerendered(&out));
        assert!(std::fs::read_dir(&out)
            .unwrap()
            .any(|e| e.unwrap().file_name().to_string_lossy().starts_with("deploy.")));

        std::fs::write(
            out.join(DEPLOYMENT_DIR).join("ingress/zz-extra.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: zz-extra\n",
        )
        .unwrap();

        let loaded = RenderedManifestSet::load(&out).unwrap();
        assert_eq!(loaded.len(), set.len() + 1);
        let names: Vec<String> = loaded.resources().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names.first().map(String::as_str), Some("jld-prepuller"));
        assert_eq!(names.last().map(String::as_str), Some("zz-extra"));
    }

    #[test]
    fn test_load_rejects_leftover_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let component = dir.path().join(DEPLOYMENT_DIR).join("ingress");
        std::fs::create_dir_all(&component).unwrap();
        std::fs::write(
            component.join("nginx-service.yaml"),
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: jld-nginx\n  host: {{HOSTNAME}}\n",
        )
        .unwrap();

        let err = RenderedManifestSet::load(dir.path()).unwrap_err();
        assert_eq!(err.kind(), "TemplateError");
    }

    #[test]
    fn test_inventory_matches_table() {
        let inventory = ManifestRenderer::inventory();
        assert_eq!(inventory.len(), TEMPLATES.len());
        assert!(inventory.contains(&ResourceRef {
            api_version: "apps/v1".into(),
            kind: "DaemonSet".into(),
            name: "filebeat".into(),
        }));
        assert!(inventory.contains(&ResourceRef {
            api_version: "v1".into(),
            kind: "Service".into(),
            name: INGRESS_SERVICE.into(),
        }));
    }

    #[test]
    fn test_crypto_key_shape() {
        let key = generate_crypto_key();
        let (a, b) = key.split_once(';').unwrap();
        assert_eq!(a.len(), 32);
        assert_eq!(b.len(), 32);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_key_material_reads_dhparam_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fixture(dir.path());
        let dh = dir.path().join("dhparam.pem");
        std::fs::write(&dh, "DH FROM FILE").unwrap();
        config.tls.dhparam = Some(dh);

        let keys = KeyMaterial::generate(&config.tls).await.unwrap();
        assert_eq!(keys.dhparams.expose(), "DH FROM FILE");
    }
}
