//! Canonical filesystem layout for a cluster
//!
//! Pure path construction, deterministic across runs. Controller-side paths
//! live under the data root (`/var/lib/keel/data` unless `DATA_ROOT` is
//! set); host-side paths live under `/var/lib/keel/<cluster>`.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Product directory component used in every path
pub const PRODUCT: &str = "keel";

/// Default controller data root
pub const DEFAULT_DATA_ROOT: &str = "/var/lib/keel/data";

/// Root of per-cluster install trees on hosts
pub const HOST_INSTALL_ROOT: &str = "/var/lib/keel";

/// Environment variable overriding the controller data root
pub const DATA_ROOT_ENV: &str = "DATA_ROOT";

/// Path set for one named cluster
#[derive(Clone, Debug)]
pub struct Layout {
    data_root: PathBuf,
    name: String,
}

impl Layout {
    /// Build the layout for a cluster under an explicit data root
    pub fn new(data_root: impl Into<PathBuf>, name: &str) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            data_root: data_root.into(),
            name: name.to_string(),
        })
    }

    /// Build the layout for a cluster, honoring `DATA_ROOT`
    pub fn for_cluster(name: &str) -> Result<Self> {
        let root = std::env::var(DATA_ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_ROOT));
        Self::new(root, name)
    }

    /// The cluster name this layout was built for
    pub fn cluster_name(&self) -> &str {
        &self.name
    }

    /// Controller directory holding everything for this cluster
    pub fn cluster_dir(&self) -> PathBuf {
        self.data_root.join(&self.name)
    }

    /// Controller mount point of the cluster image
    pub fn mount_dir(&self) -> PathBuf {
        self.cluster_dir().join("mount")
    }

    /// Controller copy of the image rootfs
    pub fn rootfs_dir(&self) -> PathBuf {
        self.cluster_dir().join("rootfs")
    }

    /// Controller certs directory
    pub fn certs_dir(&self) -> PathBuf {
        self.cluster_dir().join("certs")
    }

    /// Advisory lock file guarding lifecycle operations on this cluster
    pub fn lock_path(&self) -> PathBuf {
        self.cluster_dir().join("cluster.lock")
    }

    /// On-host rootfs directory
    pub fn host_rootfs(&self) -> String {
        host_rootfs(&self.name)
    }

    /// On-host scripts directory shipped inside the rootfs
    pub fn host_scripts(&self) -> String {
        format!("{}/scripts", self.host_rootfs())
    }

    /// On-host cluster metadata path (master0 only)
    pub fn host_metadata_path(&self) -> String {
        format!("{HOST_INSTALL_ROOT}/{}/metadata.json", self.name)
    }

    /// On-host cluster directory removed by reset
    pub fn host_cluster_dir(&self) -> String {
        format!("{HOST_INSTALL_ROOT}/{}", self.name)
    }
}

/// On-host rootfs directory for a cluster name
///
/// Free-standing so command planners can build host paths without a
/// controller data root.
pub fn host_rootfs(name: &str) -> String {
    format!("{HOST_INSTALL_ROOT}/{name}/rootfs")
}

/// Reject names that could escape the data root
fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || Path::new(name).is_absolute();
    if bad {
        return Err(Error::validation(
            name,
            "cluster name must not contain path separators or '..'",
        ));
    }
    Ok(())
}
