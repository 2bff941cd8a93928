//! Host executor: run commands and ship files to one remote host
//!
//! [`HostSession`] is the narrow seam between the lifecycle engine and a
//! host. The production implementation drives the system `ssh`/`scp`
//! binaries (see [`ssh`]); tests substitute scripted sessions. Sessions are
//! created lazily on first use and cached per host in a [`SessionPool`]
//! scoped to a single lifecycle call.

mod ssh;

pub use ssh::SshSessionFactory;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cluster::HostCredentials;
use crate::distro::{CommandPlan, CommandStep};
use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryConfig};

/// Default deadline for a single remote command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Deadline for readiness pings
pub const PING_TIMEOUT: Duration = Duration::from_secs(15);

/// Options for one remote command
#[derive(Clone, Debug)]
pub struct ExecOpts {
    /// Deadline for the command
    pub timeout: Duration,
    /// Bytes piped to the remote stdin
    pub stdin: Option<Vec<u8>>,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
            stdin: None,
        }
    }
}

impl ExecOpts {
    /// Options with an explicit deadline
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    /// Attach stdin bytes
    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }
}

/// Result of one remote command
#[derive(Clone, Debug, Default)]
pub struct Output {
    /// Captured stdout
    pub stdout: Vec<u8>,
    /// Captured stderr
    pub stderr: Vec<u8>,
    /// Remote exit code
    pub exit: i32,
}

impl Output {
    /// Whether the command exited zero
    pub fn success(&self) -> bool {
        self.exit == 0
    }

    /// stdout as trimmed UTF-8
    pub fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// One host's command/copy surface
///
/// `run` returns `Ok` with a nonzero exit for ordinary command failures;
/// transport-level problems (unreachable, bad credentials, deadline) are
/// errors. Policy about nonzero exits belongs to the caller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostSession: Send + Sync {
    /// The host this session talks to
    fn host(&self) -> IpAddr;

    /// Run a shell command
    async fn run(&self, cmd: &str, opts: ExecOpts) -> Result<Output>;

    /// Copy a local file or directory to the host
    async fn copy(&self, local: &Path, remote: &str) -> Result<()>;

    /// Cheap readiness check (a no-op exec)
    async fn ping(&self) -> Result<()>;

    /// Tear down any cached transport state
    async fn close(&self);
}

impl std::fmt::Debug for dyn HostSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSession").field("host", &self.host()).finish()
    }
}

/// Creates sessions on demand
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Create a session for a host. Implementations are lazy: transport
    /// state is established on first use, not here.
    async fn connect(&self, host: IpAddr, creds: &HostCredentials) -> Result<Arc<dyn HostSession>>;
}

/// Per-lifecycle-call cache of host sessions
///
/// Also owns the per-host file locks that serialize `/etc/hosts` edits: the
/// registry orchestrator takes the lock before any append/strip on a host.
pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    creds: HashMap<IpAddr, HostCredentials>,
    sessions: DashMap<IpAddr, Arc<dyn HostSession>>,
    file_locks: DashMap<IpAddr, Arc<Mutex<()>>>,
}

impl SessionPool {
    /// New pool over a factory and the cluster's credential map
    pub fn new(factory: Arc<dyn SessionFactory>, creds: HashMap<IpAddr, HostCredentials>) -> Self {
        Self {
            factory,
            creds,
            sessions: DashMap::new(),
            file_locks: DashMap::new(),
        }
    }

    /// The cached session for a host, created on first request
    pub async fn session(&self, host: IpAddr) -> Result<Arc<dyn HostSession>> {
        if let Some(s) = self.sessions.get(&host) {
            return Ok(s.value().clone());
        }
        let creds = self.creds.get(&host).ok_or_else(|| {
            Error::validation("<pool>", format!("no SSH credentials for host {host}"))
        })?;
        let session = self.factory.connect(host, creds).await?;
        // A concurrent connect for the same host may race here; last write
        // wins and the loser's session is just dropped.
        self.sessions.insert(host, session.clone());
        debug!(host = %host, "host session cached");
        Ok(session)
    }

    /// Serialization point for single-writer files on a host (`/etc/hosts`)
    pub fn host_file_lock(&self, host: IpAddr) -> Arc<Mutex<()>> {
        self.file_locks
            .entry(host)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Close and drop every cached session
    pub async fn close_all(&self) {
        let hosts: Vec<IpAddr> = self.sessions.iter().map(|e| *e.key()).collect();
        for host in hosts {
            if let Some((_, session)) = self.sessions.remove(&host) {
                session.close().await;
            }
        }
    }
}

/// Run a command that must succeed and return its trimmed stdout
pub async fn run_to_string(session: &dyn HostSession, cmd: &str) -> Result<String> {
    let out = session.run(cmd, ExecOpts::default()).await?;
    if !out.success() {
        return Err(Error::exec(session.host(), cmd, out.exit, &out.stderr));
    }
    Ok(out.stdout_trimmed())
}

/// Apply a command plan to one host
///
/// Steps run in order. A nonzero exit on a `must_succeed` step aborts the
/// plan; other failures are logged and skipped. Returns every step's
/// output so callers can pick up captured stdout.
pub async fn apply_plan(session: &dyn HostSession, plan: &CommandPlan) -> Result<Vec<Output>> {
    let mut outputs = Vec::with_capacity(plan.steps.len());
    for step in &plan.steps {
        let out = run_step(session, step).await?;
        outputs.push(out);
    }
    Ok(outputs)
}

/// Apply a single plan step to one host
pub async fn run_step(session: &dyn HostSession, step: &CommandStep) -> Result<Output> {
    let out = session
        .run(&step.cmd, ExecOpts::with_timeout(step.timeout))
        .await?;
    if !out.success() {
        if step.must_succeed {
            return Err(Error::exec(session.host(), &step.cmd, out.exit, &out.stderr));
        }
        warn!(
            host = %session.host(),
            cmd = %step.cmd,
            exit = out.exit,
            "tolerated step failure"
        );
    }
    Ok(out)
}

/// Copy with the file-level retry policy: up to 3 attempts, exponential
/// backoff starting at one second, transient errors only
pub async fn copy_with_retry(session: &dyn HostSession, local: &Path, remote: &str) -> Result<()> {
    let config = RetryConfig::default();
    retry_with_backoff(
        &config,
        &format!("copy {} -> {}:{}", local.display(), session.host(), remote),
        Error::is_retryable,
        || session.copy(local, remote),
    )
    .await
}

/// Ping a host until it answers, sleeping linearly between attempts
///
/// Used before any remote phase so a freshly booted host gets a grace
/// window to bring sshd up.
pub async fn wait_ready(session: &dyn HostSession, tries: u32) -> Result<()> {
    let mut last = None;
    for attempt in 0..tries {
        match session.ping().await {
            Ok(()) => return Ok(()),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => last = Some(e),
        }
        if attempt + 1 < tries {
            tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
        }
    }
    Err(last.unwrap_or_else(|| {
        Error::unreachable(session.host(), format!("no answer after {tries} attempts"))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::AuthMethod;
    use crate::distro::CommandStep;
    use mockall::predicate::eq;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn ok_output(stdout: &str) -> Output {
        Output {
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            exit: 0,
        }
    }

    fn failed_output(exit: i32, stderr: &str) -> Output {
        Output {
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            exit,
        }
    }

    #[tokio::test]
    async fn test_run_to_string_trims_stdout() {
        let mut session = MockHostSession::new();
        session.expect_host().return_const(ip("10.0.0.1"));
        session
            .expect_run()
            .with(eq("k0s version"), mockall::predicate::always())
            .returning(|_, _| Ok(ok_output("v1.23.8+k0s.0\n")));
        let out = run_to_string(&session, "k0s version").await.unwrap();
        assert_eq!(out, "v1.23.8+k0s.0");
    }

    #[tokio::test]
    async fn test_run_to_string_surfaces_nonzero_exit() {
        let mut session = MockHostSession::new();
        session.expect_host().return_const(ip("10.0.0.1"));
        session
            .expect_run()
            .returning(|_, _| Ok(failed_output(7, "boom")));
        let err = run_to_string(&session, "false").await.unwrap_err();
        assert_eq!(err.kind(), "E_EXEC");
        assert!(err.to_string().contains("exit 7"));
    }

    #[tokio::test]
    async fn test_apply_plan_aborts_on_must_succeed_failure() {
        let mut session = MockHostSession::new();
        session.expect_host().return_const(ip("10.0.0.1"));
        session.expect_run().returning(|cmd, _| {
            if cmd == "step2" {
                Ok(failed_output(1, "bad"))
            } else {
                Ok(ok_output(""))
            }
        });
        let plan = CommandPlan::new(vec![
            CommandStep::new("step1"),
            CommandStep::new("step2"),
            CommandStep::new("step3"),
        ]);
        let err = apply_plan(&session, &plan).await.unwrap_err();
        assert!(err.to_string().contains("step2"));
    }

    #[tokio::test]
    async fn test_apply_plan_tolerates_allowed_failures() {
        let mut session = MockHostSession::new();
        session.expect_host().return_const(ip("10.0.0.1"));
        session.expect_run().returning(|cmd, _| {
            if cmd.contains("reset") {
                Ok(failed_output(1, "not installed"))
            } else {
                Ok(ok_output(""))
            }
        });
        let plan = CommandPlan::new(vec![
            CommandStep::new("k0s reset").allow_failure(),
            CommandStep::new("rm -rf /etc/k0s").allow_failure(),
        ]);
        let outputs = apply_plan(&session, &plan).await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].exit, 1);
    }

    #[tokio::test]
    async fn test_wait_ready_gives_up_after_tries() {
        let mut session = MockHostSession::new();
        session.expect_host().return_const(ip("10.0.0.3"));
        session
            .expect_ping()
            .times(2)
            .returning(|| Err(Error::unreachable(ip("10.0.0.3"), "refused")));
        let err = wait_ready(&session, 2).await.unwrap_err();
        assert_eq!(err.kind(), "E_UNREACHABLE");
    }

    #[tokio::test]
    async fn test_wait_ready_stops_on_auth_failure() {
        let mut session = MockHostSession::new();
        session.expect_host().return_const(ip("10.0.0.3"));
        session
            .expect_ping()
            .times(1)
            .returning(|| Err(Error::auth(ip("10.0.0.3"), "root", "denied")));
        let err = wait_ready(&session, 5).await.unwrap_err();
        assert_eq!(err.kind(), "E_AUTH");
    }

    #[tokio::test]
    async fn test_pool_caches_sessions_and_requires_credentials() {
        let mut factory = MockSessionFactory::new();
        factory.expect_connect().times(1).returning(|host, _| {
            let mut s = MockHostSession::new();
            s.expect_host().return_const(host);
            s.expect_close().returning(|| ());
            Ok(Arc::new(s) as Arc<dyn HostSession>)
        });
        let creds = HashMap::from([(
            ip("10.0.0.1"),
            HostCredentials {
                user: "root".into(),
                auth: AuthMethod::Password("pw".into()),
                port: 22,
            },
        )]);
        let pool = SessionPool::new(Arc::new(factory), creds);

        let a = pool.session(ip("10.0.0.1")).await.unwrap();
        let b = pool.session(ip("10.0.0.1")).await.unwrap();
        assert_eq!(a.host(), b.host());

        let err = pool.session(ip("10.0.0.9")).await.unwrap_err();
        assert_eq!(err.kind(), "E_VALIDATION");

        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_host_file_lock_is_stable_per_host() {
        let factory = MockSessionFactory::new();
        let pool = SessionPool::new(Arc::new(factory), HashMap::new());
        let a = pool.host_file_lock(ip("10.0.0.1"));
        let b = pool.host_file_lock(ip("10.0.0.1"));
        assert!(Arc::ptr_eq(&a, &b));
    }
}
