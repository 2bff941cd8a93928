//! In-cluster image registry orchestration
//!
//! Every node's container runtime pulls through one registry deployed on a
//! designated host (master0 by default). Deploy starts the registry from
//! the blob set shipped in the image rootfs, then wires each host to it:
//! trust material into the runtime trust store, a `/etc/hosts` mapping for
//! the registry domain, and a mirror configuration. Teardown reverts all
//! three.
//!
//! `/etc/hosts` is single-writer per host: every edit takes the host's
//! file lock from the session pool.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::RegistryConfig;
use crate::distro::{CommandPlan, CommandStep};
use crate::error::{Error, Result};
use crate::exec::{self, SessionPool};
use crate::fanout::{self, Mode};
use crate::layout::Layout;

/// Name of the registry container on the registry host
pub const REGISTRY_CONTAINER: &str = "keel-registry";

/// Runtime trust-store root the registry certificate is installed under
const RUNTIME_CERTS_ROOT: &str = "/etc/containerd/certs.d";

/// Deadline for the registry reachability probe from a joining host
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Orchestrates the lifecycle of the in-cluster registry
#[derive(Clone)]
pub struct Registry {
    config: RegistryConfig,
    /// Host the registry container runs on
    host: IpAddr,
}

impl Registry {
    /// Registry pinned to its serving host
    pub fn new(config: RegistryConfig, host: IpAddr) -> Self {
        Self { config, host }
    }

    /// The host the registry serves from
    pub fn host(&self) -> IpAddr {
        self.host
    }

    fn trust_dir(&self) -> String {
        format!("{RUNTIME_CERTS_ROOT}/{}", self.config.endpoint())
    }

    /// Plan run on the registry host itself: start the registry container
    /// from the image-shipped script and blob set
    fn start_plan(&self, layout: &Layout) -> CommandPlan {
        let scripts = layout.host_scripts();
        CommandPlan::new(vec![
            CommandStep::new(format!("mkdir -p {}", self.config.storage_path.display()))
                .idempotent(),
            CommandStep::new(format!(
                "cd {scripts} && bash init-registry.sh {} {} {}",
                self.config.port,
                self.config.storage_path.display(),
                self.config.domain
            ))
            .with_timeout(Duration::from_secs(300))
            .idempotent(),
        ])
    }

    /// Plan run on every host: trust the registry certificate and mirror
    /// pulls through it
    fn wire_plan(&self, layout: &Layout) -> CommandPlan {
        let trust_dir = self.trust_dir();
        let rootfs = layout.host_rootfs();
        let endpoint = self.config.endpoint();
        CommandPlan::new(vec![
            CommandStep::new(format!("mkdir -p {trust_dir}")).idempotent(),
            CommandStep::new(format!(
                "cp -f {rootfs}/certs/registry.crt {trust_dir}/ca.crt"
            ))
            .idempotent(),
            CommandStep::new(format!(
                "printf 'server = \"https://{endpoint}\"\\n\\n\
                 [host.\"https://{endpoint}\"]\\n  capabilities = [\"pull\", \"resolve\"]\\n  \
                 ca = \"{trust_dir}/ca.crt\"\\n' > {trust_dir}/hosts.toml"
            ))
            .idempotent(),
        ])
    }

    /// Append the registry domain mapping on one host, guarded by the
    /// host's file lock and grep so repeated deploys never duplicate it
    async fn map_domain(&self, pool: &SessionPool, host: IpAddr) -> Result<()> {
        let lock = pool.host_file_lock(host);
        let _guard = lock.lock().await;
        let session = pool.session(host).await?;
        let domain = &self.config.domain;
        let cmd = format!(
            "grep -q ' {domain}$' /etc/hosts || echo '{} {domain}' >> /etc/hosts",
            self.host
        );
        exec::run_to_string(session.as_ref(), &cmd).await?;
        Ok(())
    }

    /// Remove the registry domain mapping on one host
    async fn unmap_domain(&self, pool: &SessionPool, host: IpAddr) -> Result<()> {
        let lock = pool.host_file_lock(host);
        let _guard = lock.lock().await;
        let session = pool.session(host).await?;
        let cmd = format!("sed -i '/ {}$/d' /etc/hosts", self.config.domain);
        exec::run_to_string(session.as_ref(), &cmd).await?;
        Ok(())
    }

    /// Configure one host to pull through the registry
    pub async fn wire_host(&self, pool: &SessionPool, layout: &Layout, host: IpAddr) -> Result<()> {
        self.map_domain(pool, host).await?;
        let session = pool.session(host).await?;
        exec::apply_plan(session.as_ref(), &self.wire_plan(layout)).await?;
        Ok(())
    }

    /// Probe the registry from a host; joining hosts must see it before
    /// any distribution-level step runs
    pub async fn probe_from(&self, pool: &SessionPool, host: IpAddr) -> Result<()> {
        let session = pool.session(host).await?;
        let cmd = format!(
            "curl -k -s -m 10 -o /dev/null https://{}/v2/",
            self.config.endpoint()
        );
        let out = session
            .run(&cmd, exec::ExecOpts::with_timeout(PROBE_TIMEOUT))
            .await?;
        if out.success() {
            Ok(())
        } else {
            Err(Error::RegistryDeploy {
                host,
                message: format!(
                    "registry at {} not reachable (curl exit {})",
                    self.config.endpoint(),
                    out.exit
                ),
            })
        }
    }

    /// Stand up the registry and wire the given hosts to it
    ///
    /// The registry host is always wired; `hosts` lists the rest of the
    /// fleet to configure (may be empty at init time, when other hosts are
    /// wired later as part of their preparation).
    pub async fn deploy(
        &self,
        pool: Arc<SessionPool>,
        layout: &Layout,
        hosts: &[IpAddr],
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(host = %self.host, endpoint = %self.config.endpoint(), "deploying registry");
        let session = pool.session(self.host).await?;
        exec::apply_plan(session.as_ref(), &self.start_plan(layout))
            .await
            .map_err(|e| Error::RegistryDeploy {
                host: self.host,
                message: e.to_string(),
            })?;

        self.wire_host(&pool, layout, self.host).await?;

        let registry = self.clone();
        let layout = layout.clone();
        let wire_pool = pool.clone();
        fanout::for_each(hosts, fanout::DEFAULT_FANOUT_LIMIT, Mode::FailFast, cancel, {
            move |host| {
                let registry = registry.clone();
                let layout = layout.clone();
                let pool = wire_pool.clone();
                async move { registry.wire_host(&pool, &layout, host).await }
            }
        })
        .await
        .into_result()?;

        self.probe_from(&pool, self.host).await
    }

    /// Stop the registry and revert every host's wiring. Best-effort:
    /// failures are aggregated, never fail-fast.
    pub async fn teardown(
        &self,
        pool: Arc<SessionPool>,
        hosts: &[IpAddr],
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(host = %self.host, "tearing down registry");
        match pool.session(self.host).await {
            Ok(session) => {
                let stop = CommandStep::new(format!("nerdctl rm -f {REGISTRY_CONTAINER}"))
                    .allow_failure();
                if let Err(e) = exec::run_step(session.as_ref(), &stop).await {
                    warn!(error = %e, "registry container stop failed");
                }
            }
            Err(e) => warn!(error = %e, "registry host unreachable during teardown"),
        }

        let registry = self.clone();
        let unwire_pool = pool.clone();
        let mut all = hosts.to_vec();
        if !all.contains(&self.host) {
            all.push(self.host);
        }
        let trust_dir = self.trust_dir();
        fanout::for_each(&all, fanout::DEFAULT_FANOUT_LIMIT, Mode::CollectAll, cancel, {
            move |host| {
                let registry = registry.clone();
                let pool = unwire_pool.clone();
                let trust_dir = trust_dir.clone();
                async move {
                    registry.unmap_domain(&pool, host).await?;
                    let session = pool.session(host).await?;
                    exec::run_to_string(session.as_ref(), &format!("rm -rf {trust_dir}")).await?;
                    Ok(())
                }
            }
        })
        .await
        .into_result()
    }
}
