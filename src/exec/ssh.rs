//! SSH transport backed by the system `ssh`/`scp` binaries
//!
//! Connection reuse comes from OpenSSH multiplexing: every session shares a
//! `ControlPath` socket with `ControlPersist`, so the first command pays the
//! handshake and later commands ride the cached connection. `close` tears
//! the multiplexed connection down with `ssh -O exit`.
//!
//! Password authentication is delegated to `sshpass`; key authentication
//! passes the key file with `-i` and runs in batch mode.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::cluster::{AuthMethod, HostCredentials};
use crate::error::{Error, Result};

use super::{ExecOpts, HostSession, Output, SessionFactory, PING_TIMEOUT};

/// Builds [`SshSession`]s sharing one control-socket directory
pub struct SshSessionFactory {
    control_dir: PathBuf,
}

impl SshSessionFactory {
    /// Factory with control sockets under the system temp dir, namespaced
    /// by controller pid so concurrent keel processes do not collide
    pub fn new() -> Self {
        Self {
            control_dir: std::env::temp_dir().join(format!("keel-ssh-{}", std::process::id())),
        }
    }
}

impl Default for SshSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionFactory for SshSessionFactory {
    async fn connect(&self, host: IpAddr, creds: &HostCredentials) -> Result<Arc<dyn HostSession>> {
        tokio::fs::create_dir_all(&self.control_dir)
            .await
            .map_err(|e| Error::io("creating ssh control dir", e))?;
        // Lazy by design: no handshake here. The first run/copy establishes
        // the multiplexed connection.
        Ok(Arc::new(SshSession {
            host,
            creds: creds.clone(),
            control_path: self.control_dir.join(host.to_string()),
        }))
    }
}

struct SshSession {
    host: IpAddr,
    creds: HostCredentials,
    control_path: PathBuf,
}

impl SshSession {
    /// Options shared by ssh and scp invocations
    fn common_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "ConnectTimeout=10".into(),
            "-o".into(),
            "ControlMaster=auto".into(),
            "-o".into(),
            "ControlPersist=60s".into(),
            "-o".into(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".into(),
            "LogLevel=ERROR".into(),
        ];
        if let AuthMethod::KeyFile(key) = &self.creds.auth {
            opts.push("-o".into());
            opts.push("BatchMode=yes".into());
            opts.push("-i".into());
            opts.push(key.display().to_string());
        }
        opts
    }

    /// Wrap a program in `sshpass` when the host uses password auth
    fn command(&self, program: &str) -> Command {
        match &self.creds.auth {
            AuthMethod::Password(pw) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-p").arg(pw).arg(program);
                cmd
            }
            AuthMethod::KeyFile(_) => Command::new(program),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.creds.user, self.host)
    }

    /// Map a transport-level failure (ssh exit 255, sshpass exit 5) to the
    /// right error kind using the stderr text
    fn classify_transport(&self, exit: i32, stderr: &[u8]) -> Error {
        let text = String::from_utf8_lossy(stderr);
        let lowered = text.to_lowercase();
        if exit == 5
            || lowered.contains("permission denied")
            || lowered.contains("authentication fail")
        {
            return Error::auth(self.host, &self.creds.user, text.trim().to_string());
        }
        Error::unreachable(self.host, text.trim().to_string())
    }
}

#[async_trait]
impl HostSession for SshSession {
    fn host(&self) -> IpAddr {
        self.host
    }

    async fn run(&self, cmd: &str, opts: ExecOpts) -> Result<Output> {
        trace!(host = %self.host, cmd, "ssh exec");
        let mut command = self.command("ssh");
        command
            .args(self.common_options())
            .arg("-p")
            .arg(self.creds.port.to_string())
            .arg(self.destination())
            .arg(cmd)
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::io(format!("spawning ssh for {}", self.host), e))?;

        if let Some(bytes) = &opts.stdin {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            stdin
                .write_all(bytes)
                .await
                .map_err(|e| Error::io(format!("writing stdin to {}", self.host), e))?;
            drop(stdin);
        }

        let waited = tokio::time::timeout(opts.timeout, child.wait_with_output()).await;
        let output = match waited {
            Err(_) => {
                return Err(Error::command_timeout(
                    self.host,
                    cmd,
                    opts.timeout.as_secs(),
                ))
            }
            Ok(result) => {
                result.map_err(|e| Error::io(format!("waiting on ssh for {}", self.host), e))?
            }
        };

        let exit = output.status.code().unwrap_or(-1);
        // 255 is OpenSSH's transport failure; 5 is sshpass's bad password.
        // A remote command cannot legitimately produce either through ssh.
        if exit == 255 || (exit == 5 && matches!(self.creds.auth, AuthMethod::Password(_))) {
            return Err(self.classify_transport(exit, &output.stderr));
        }

        Ok(Output {
            stdout: output.stdout,
            stderr: output.stderr,
            exit,
        })
    }

    async fn copy(&self, local: &Path, remote: &str) -> Result<()> {
        debug!(host = %self.host, local = %local.display(), remote, "scp copy");
        let mut command = self.command("scp");
        command
            .args(self.common_options())
            .arg("-r")
            .arg("-P")
            .arg(self.creds.port.to_string())
            .arg(local)
            .arg(format!("{}:{}", self.destination(), remote))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = command
            .output()
            .await
            .map_err(|e| Error::io(format!("spawning scp for {}", self.host), e))?;

        let exit = output.status.code().unwrap_or(-1);
        if exit == 0 {
            return Ok(());
        }
        Err(self.classify_transport(exit, &output.stderr))
    }

    async fn ping(&self) -> Result<()> {
        let out = self.run("true", ExecOpts::with_timeout(PING_TIMEOUT)).await?;
        if out.success() {
            Ok(())
        } else {
            Err(Error::unreachable(
                self.host,
                format!("readiness probe exited {}", out.exit),
            ))
        }
    }

    async fn close(&self) {
        // Best-effort shutdown of the multiplexed connection
        let _ = self
            .command("ssh")
            .args(self.common_options())
            .arg("-O")
            .arg("exit")
            .arg(self.destination())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await;
    }
}
