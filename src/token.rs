//! Join token brokerage
//!
//! Tokens are minted on master0 by the active distribution, fetched as raw
//! bytes, and written to the driver-declared path on each joining host with
//! mode 0600. The bytes cross the SSH boundary base64-armored on stdin and
//! never touch the controller disk. A token lives for one lifecycle call;
//! every join fetches a fresh one because previous tokens may have expired.

use std::net::IpAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cluster::JoinRole;
use crate::distro::DistroDriver;
use crate::error::{Error, Result};
use crate::exec::{run_step, ExecOpts, HostSession, SessionPool};
use crate::fanout::{self, FanoutReport, Mode};

/// An opaque join credential minted by the control plane
///
/// Debug output never exposes the bytes.
pub struct JoinToken {
    role: JoinRole,
    bytes: Vec<u8>,
}

impl JoinToken {
    /// The role this token enrolls
    pub fn role(&self) -> JoinRole {
        self.role
    }

    /// The raw credential bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinToken")
            .field("role", &self.role)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Mint and fetch a join token from master0
///
/// Runs the driver's token command; the trimmed stdout is the credential.
pub async fn fetch_join_token(
    master0: &dyn HostSession,
    driver: &dyn DistroDriver,
    role: JoinRole,
) -> Result<JoinToken> {
    let step = driver.read_join_token(role);
    let out = run_step(master0, &step).await?;
    let bytes = out.stdout_trimmed().into_bytes();
    if bytes.is_empty() {
        return Err(Error::exec(
            master0.host(),
            step.cmd,
            out.exit,
            b"token command produced no output",
        ));
    }
    info!(role = %role, host = %master0.host(), "join token minted");
    Ok(JoinToken { role, bytes })
}

/// Write a token to its on-host path on every listed host
///
/// The write is `umask 077` + `base64 -d`, so the file lands with mode
/// 0600 owned by the connecting (root) user and no shell-quoting issue can
/// corrupt the bytes. All copies are awaited; failures surface through the
/// report.
pub async fn distribute(
    pool: Arc<SessionPool>,
    driver: &dyn DistroDriver,
    token: &JoinToken,
    hosts: &[IpAddr],
    cancel: &CancellationToken,
    limit: usize,
) -> FanoutReport {
    let path = driver.token_path(token.role());
    let encoded = BASE64.encode(token.as_bytes());
    debug!(role = %token.role(), hosts = hosts.len(), path, "distributing join token");

    fanout::for_each(hosts, limit, Mode::FailFast, cancel, move |host| {
        let pool = pool.clone();
        let encoded = encoded.clone();
        async move {
            let session = pool.session(host).await?;
            let cmd = format!(
                "umask 077 && mkdir -p $(dirname {path}) && base64 -d > {path} \
                 && chmod 0600 {path}"
            );
            let out = session
                .run(&cmd, ExecOpts::default().stdin(encoded.into_bytes()))
                .await?;
            if !out.success() {
                return Err(Error::exec(host, cmd, out.exit, &out.stderr));
            }
            Ok(())
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Distribution;
    use crate::distro::driver_for;
    use crate::exec::{MockHostSession, MockSessionFactory, Output};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_fetch_trims_and_wraps_token_bytes() {
        let driver = driver_for(Distribution::K0s);
        let mut master0 = MockHostSession::new();
        master0.expect_host().return_const(ip("10.0.0.1"));
        master0.expect_run().returning(|_, _| {
            Ok(Output {
                stdout: b"  H4sIAAAAA-token-bytes\n".to_vec(),
                stderr: Vec::new(),
                exit: 0,
            })
        });

        let token = fetch_join_token(&master0, driver.as_ref(), JoinRole::Worker)
            .await
            .unwrap();
        assert_eq!(token.as_bytes(), b"H4sIAAAAA-token-bytes");
        assert_eq!(token.role(), JoinRole::Worker);
    }

    #[tokio::test]
    async fn test_fetch_rejects_empty_token() {
        let driver = driver_for(Distribution::K0s);
        let mut master0 = MockHostSession::new();
        master0.expect_host().return_const(ip("10.0.0.1"));
        master0.expect_run().returning(|_, _| {
            Ok(Output {
                stdout: b"\n".to_vec(),
                stderr: Vec::new(),
                exit: 0,
            })
        });

        let err = fetch_join_token(&master0, driver.as_ref(), JoinRole::Controller)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "E_EXEC");
        assert!(err.to_string().contains("k0s token create"));
    }

    #[test]
    fn test_debug_redacts_token_bytes() {
        let token = JoinToken {
            role: JoinRole::Worker,
            bytes: b"super-secret-join-credential".to_vec(),
        };
        let debug = format!("{token:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("len"));
    }

    #[tokio::test]
    async fn test_distribute_writes_0600_via_stdin_on_every_host() {
        let writes: Arc<Mutex<HashMap<IpAddr, (String, Vec<u8>)>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let writes_clone = writes.clone();

        let mut factory = MockSessionFactory::new();
        factory.expect_connect().returning(move |host, _| {
            let writes = writes_clone.clone();
            let mut s = MockHostSession::new();
            s.expect_host().return_const(host);
            s.expect_close().returning(|| ());
            s.expect_run().returning(move |cmd, opts| {
                writes
                    .lock()
                    .unwrap()
                    .insert(host, (cmd.to_string(), opts.stdin.unwrap_or_default()));
                Ok(Output {
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    exit: 0,
                })
            });
            Ok(Arc::new(s) as Arc<dyn crate::exec::HostSession>)
        });

        let hosts = vec![ip("10.0.0.2"), ip("10.0.0.3")];
        let creds = hosts
            .iter()
            .map(|h| {
                (
                    *h,
                    crate::cluster::HostCredentials {
                        user: "root".into(),
                        auth: crate::cluster::AuthMethod::Password("pw".into()),
                        port: 22,
                    },
                )
            })
            .collect();
        let pool = Arc::new(SessionPool::new(Arc::new(factory), creds));

        let driver = driver_for(Distribution::K0s);
        let token = JoinToken {
            role: JoinRole::Worker,
            bytes: b"tok-123".to_vec(),
        };
        let cancel = CancellationToken::new();

        let report = distribute(pool, driver.as_ref(), &token, &hosts, &cancel, 16).await;
        report.into_result().unwrap();

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        for (cmd, stdin) in writes.values() {
            assert!(cmd.contains("umask 077"));
            assert!(cmd.contains("chmod 0600 /etc/k0s/worker.token"));
            assert_eq!(BASE64.decode(stdin).unwrap(), b"tok-123");
        }
    }
}
