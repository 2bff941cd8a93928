//! Cluster description consumed by the lifecycle engine
//!
//! These types mirror the parsed cluster manifest. Validation of the raw
//! manifest is the manifest layer's responsibility; [`Cluster::validate`]
//! re-checks only the invariants the engine itself depends on (non-empty
//! masters, disjoint IP sets, credentials for every host) so a hand-built
//! `Cluster` cannot put the engine into an undefined state.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default domain the in-cluster registry is reachable at
pub const DEFAULT_REGISTRY_DOMAIN: &str = "sea.hub";

/// Default port the in-cluster registry listens on
pub const DEFAULT_REGISTRY_PORT: u16 = 5000;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// The Kubernetes distribution bundled in a cluster image
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Distribution {
    /// Full kubeadm-managed Kubernetes
    #[serde(rename = "k8s-full")]
    K8s,
    /// Lightweight single-binary k0s
    #[serde(rename = "k0s")]
    K0s,
    /// Lightweight k3s
    #[serde(rename = "k3s")]
    K3s,
}

impl Distribution {
    /// The manifest tag for this distribution
    pub fn as_str(&self) -> &'static str {
        match self {
            Distribution::K8s => "k8s-full",
            Distribution::K0s => "k0s",
            Distribution::K3s => "k3s",
        }
    }
}

impl std::fmt::Display for Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a host joins the cluster as
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinRole {
    /// Control-plane member
    Controller,
    /// Worker node
    Worker,
}

impl JoinRole {
    /// Parse a role string from an external source.
    ///
    /// Unknown strings fall back to [`JoinRole::Worker`]. This fallback is
    /// deliberately confined to the string boundary; library callers pass
    /// the typed role and never hit it.
    pub fn parse(s: &str) -> Self {
        match s {
            "controller" | "master" => JoinRole::Controller,
            _ => JoinRole::Worker,
        }
    }

    /// Lowercase name used in log fields and paths
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinRole::Controller => "controller",
            JoinRole::Worker => "worker",
        }
    }
}

impl std::fmt::Display for JoinRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How keel authenticates to a host over SSH
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Password authentication
    Password(String),
    /// Private key file on the controller
    KeyFile(PathBuf),
}

/// SSH endpoint material for one host
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostCredentials {
    /// User to connect as
    pub user: String,
    /// Password or key material
    pub auth: AuthMethod,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Configuration of the in-cluster image registry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Domain all node runtimes pull from
    #[serde(default = "default_registry_domain")]
    pub domain: String,
    /// Registry port
    #[serde(default = "default_registry_port")]
    pub port: u16,
    /// Blob storage path on the registry host
    #[serde(default = "default_registry_storage")]
    pub storage_path: PathBuf,
}

fn default_registry_domain() -> String {
    DEFAULT_REGISTRY_DOMAIN.to_string()
}

fn default_registry_port() -> u16 {
    DEFAULT_REGISTRY_PORT
}

fn default_registry_storage() -> PathBuf {
    PathBuf::from("/var/lib/registry")
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            domain: default_registry_domain(),
            port: default_registry_port(),
            storage_path: default_registry_storage(),
        }
    }
}

impl RegistryConfig {
    /// `domain:port` endpoint string used in runtime mirror configuration
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.domain, self.port)
    }
}

/// Guest platform the image must support
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system, e.g. `linux`
    pub os: String,
    /// CPU architecture, e.g. `amd64` or `arm64`
    pub arch: String,
    /// Optional variant, e.g. `v8`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            os: "linux".to_string(),
            arch: "amd64".to_string(),
            variant: None,
        }
    }
}

impl Platform {
    /// Parse an `os/arch[/variant]` string
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let os = parts.next().filter(|p| !p.is_empty());
        let arch = parts.next().filter(|p| !p.is_empty());
        match (os, arch) {
            (Some(os), Some(arch)) => Ok(Self {
                os: os.to_string(),
                arch: arch.to_string(),
                variant: parts.next().map(str::to_string),
            }),
            _ => Err(Error::serialization(format!(
                "invalid platform {s:?}, expected os/arch[/variant]"
            ))),
        }
    }

    /// Whether an image advertising `other` satisfies this platform
    pub fn matches(&self, other: &Platform) -> bool {
        self.os == other.os
            && self.arch == other.arch
            && match (&self.variant, &other.variant) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.arch, v),
            None => write!(f, "{}/{}", self.os, self.arch),
        }
    }
}

/// The root cluster entity
///
/// `masters[0]` is master0: the singleton bootstrap node that mints join
/// tokens and holds the authoritative cluster metadata. It is never mutated
/// except at init and reset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster name, used in all on-disk paths
    pub name: String,
    /// Ordered control-plane hosts; the first entry is master0
    pub masters: Vec<IpAddr>,
    /// Ordered worker hosts
    #[serde(default)]
    pub workers: Vec<IpAddr>,
    /// SSH material per host IP
    pub creds: HashMap<IpAddr, HostCredentials>,
    /// Bundled Kubernetes distribution
    pub distribution: Distribution,
    /// In-cluster registry configuration
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Guest platform
    #[serde(default)]
    pub platform: Platform,
    /// Arbitrary key/value overrides passed to distribution plans
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Cluster {
    /// The bootstrap node
    ///
    /// # Panics
    ///
    /// Panics when `masters` is empty; [`Cluster::validate`] rejects such a
    /// cluster before any operation runs.
    pub fn master0(&self) -> IpAddr {
        self.masters[0]
    }

    /// All hosts, masters first
    pub fn all_hosts(&self) -> Vec<IpAddr> {
        self.masters.iter().chain(self.workers.iter()).copied().collect()
    }

    /// Credentials for a host
    pub fn credentials(&self, host: IpAddr) -> Result<&HostCredentials> {
        self.creds.get(&host).ok_or_else(|| {
            Error::validation(&self.name, format!("no SSH credentials for host {host}"))
        })
    }

    /// Re-check the invariants the engine depends on
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("<unnamed>", "cluster name cannot be empty"));
        }
        if self.masters.is_empty() {
            return Err(Error::validation(&self.name, "master list cannot be empty"));
        }
        let mut seen = std::collections::HashSet::new();
        for ip in self.all_hosts() {
            if !seen.insert(ip) {
                return Err(Error::validation(
                    &self.name,
                    format!("host {ip} appears more than once across masters and workers"),
                ));
            }
            self.credentials(ip)?;
        }
        Ok(())
    }
}
