//! Cluster metadata persisted on master0
//!
//! The authoritative `{version, distribution, created_at}` record lives
//! under the cluster rootfs on master0, not on the controller. Writes are
//! atomic: the JSON is shipped to a temp path over the session's stdin and
//! renamed into place.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::Distribution;
use crate::error::{Error, Result};
use crate::exec::{self, ExecOpts, HostSession};

/// Authoritative record of what is installed on a cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    /// Kubernetes version reported by the distribution
    pub version: String,
    /// The installed distribution
    pub distribution: Distribution,
    /// Unix timestamp of the successful init
    pub created_at: u64,
}

impl ClusterMetadata {
    /// Metadata stamped with the current time
    pub fn new(version: impl Into<String>, distribution: Distribution) -> Self {
        Self {
            version: version.into(),
            distribution,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

/// Atomically write metadata to its path on master0
pub async fn write(
    session: &dyn HostSession,
    path: &str,
    meta: &ClusterMetadata,
) -> Result<()> {
    let body = serde_json::to_vec_pretty(meta)
        .map_err(|e| Error::serialization(format!("encoding cluster metadata: {e}")))?;
    let tmp = format!("{path}.tmp");
    let cmd = format!("mkdir -p $(dirname {path}) && cat > {tmp} && mv -f {tmp} {path}");
    let out = session
        .run(&cmd, ExecOpts::default().stdin(body))
        .await?;
    if !out.success() {
        return Err(Error::exec(session.host(), cmd, out.exit, &out.stderr));
    }
    debug!(host = %session.host(), path, "cluster metadata written");
    Ok(())
}

/// Read metadata from master0
///
/// A missing file means the cluster was never initialized (or has been
/// reset) and maps to [`Error::NotInitialized`].
pub async fn read(
    session: &dyn HostSession,
    path: &str,
    cluster_name: &str,
) -> Result<ClusterMetadata> {
    let cmd = format!("cat {path}");
    let out = session.run(&cmd, ExecOpts::default()).await?;
    if !out.success() {
        return Err(Error::NotInitialized {
            cluster: cluster_name.to_string(),
        });
    }
    serde_json::from_slice(&out.stdout)
        .map_err(|e| Error::serialization(format!("decoding cluster metadata at {path}: {e}")))
}

/// Remove metadata from master0 (reset path); tolerates a missing file
pub async fn remove(session: &dyn HostSession, path: &str) -> Result<()> {
    exec::run_to_string(session, &format!("rm -f {path}")).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{MockHostSession, Output};
    use std::net::IpAddr;
    use std::sync::{Arc, Mutex};

    fn ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_write_is_atomic_and_ships_json_over_stdin() {
        let seen = Arc::new(Mutex::new((String::new(), Vec::new())));
        let seen_clone = seen.clone();

        let mut session = MockHostSession::new();
        session.expect_host().return_const(ip());
        session.expect_run().returning(move |cmd, opts| {
            *seen_clone.lock().unwrap() = (cmd.to_string(), opts.stdin.unwrap_or_default());
            Ok(Output {
                stdout: Vec::new(),
                stderr: Vec::new(),
                exit: 0,
            })
        });

        let meta = ClusterMetadata::new("v1.23.8", Distribution::K0s);
        write(&session, "/var/lib/keel/demo/metadata.json", &meta)
            .await
            .unwrap();

        let (cmd, stdin) = seen.lock().unwrap().clone();
        assert!(cmd.contains("metadata.json.tmp"), "must write via temp file");
        assert!(cmd.contains("mv -f"), "must rename into place");
        let decoded: ClusterMetadata = serde_json::from_slice(&stdin).unwrap();
        assert_eq!(decoded, meta);
    }

    #[tokio::test]
    async fn test_read_missing_file_is_not_initialized() {
        let mut session = MockHostSession::new();
        session.expect_host().return_const(ip());
        session.expect_run().returning(|_, _| {
            Ok(Output {
                stdout: Vec::new(),
                stderr: b"cat: No such file or directory".to_vec(),
                exit: 1,
            })
        });

        let err = read(&session, "/var/lib/keel/demo/metadata.json", "demo")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "E_NOT_INITIALIZED");
        assert!(err.to_string().contains("demo"));
    }

    #[tokio::test]
    async fn test_read_round_trips() {
        let meta = ClusterMetadata::new("v1.24.4", Distribution::K3s);
        let body = serde_json::to_vec(&meta).unwrap();
        let mut session = MockHostSession::new();
        session.expect_host().return_const(ip());
        session.expect_run().returning(move |_, _| {
            Ok(Output {
                stdout: body.clone(),
                stderr: Vec::new(),
                exit: 0,
            })
        });

        let got = read(&session, "/p/metadata.json", "demo").await.unwrap();
        assert_eq!(got, meta);
    }

    #[tokio::test]
    async fn test_garbled_metadata_is_a_serialization_error() {
        let mut session = MockHostSession::new();
        session.expect_host().return_const(ip());
        session.expect_run().returning(|_, _| {
            Ok(Output {
                stdout: b"not json".to_vec(),
                stderr: Vec::new(),
                exit: 0,
            })
        });
        let err = read(&session, "/p/metadata.json", "demo").await.unwrap_err();
        assert_eq!(err.kind(), "E_SERIALIZATION");
    }
}
