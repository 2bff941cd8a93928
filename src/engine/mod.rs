//! Lifecycle engine: the top-level state machine for a cluster
//!
//! Operations are strictly phased. Within a phase, per-host work fans out
//! concurrently; across phases, ordering is total. The ordering guarantees
//! the rest of the system depends on are structural here:
//!
//! 1. the registry is reachable from a host before any join on that host,
//! 2. master0 init completes before anyone joins,
//! 3. a fresh join token is fetched after master0 is ready and before each
//!    join batch,
//! 4. metadata is persisted only after master0 is ready.
//!
//! Every operation takes the per-cluster advisory lock, runs under its own
//! deadline, and propagates cancellation into the fan-out.

mod lock;

pub use lock::ClusterLock;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, JoinRole};
use crate::distro::{self, CommandPlan, CommandStep, DistroDriver};
use crate::error::{Error, Result};
use crate::exec::{self, SessionFactory, SessionPool};
use crate::fanout::{self, Mode, DEFAULT_FANOUT_LIMIT};
use crate::layout::Layout;
use crate::metadata::{self, ClusterMetadata};
use crate::mount::{mount_image, ImageSource, MountGuard, PullPolicy};
use crate::registry::Registry;
use crate::token;

/// Tunables for one engine instance
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Bound on in-flight per-host tasks
    pub fanout_limit: usize,
    /// Deadline for init
    pub init_timeout: Duration,
    /// Deadline for join and delete operations
    pub join_timeout: Duration,
    /// Deadline for reset
    pub reset_timeout: Duration,
    /// Deadline for upgrade (rolling, so proportionally longer)
    pub upgrade_timeout: Duration,
    /// Ping attempts while waiting for a host's sshd
    pub ssh_ready_tries: u32,
    /// Controller data root override; defaults to the `DATA_ROOT`
    /// environment variable, then `/var/lib/keel/data`
    pub data_root: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fanout_limit: DEFAULT_FANOUT_LIMIT,
            init_timeout: Duration::from_secs(600),
            join_timeout: Duration::from_secs(600),
            reset_timeout: Duration::from_secs(300),
            upgrade_timeout: Duration::from_secs(1800),
            ssh_ready_tries: 6,
            data_root: None,
        }
    }
}

/// Drives a cluster through its lifecycle
pub struct Engine {
    cluster: Cluster,
    layout: Layout,
    driver: Box<dyn DistroDriver>,
    image_source: Arc<dyn ImageSource>,
    image: String,
    factory: Arc<dyn SessionFactory>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl Engine {
    /// Build an engine for a validated cluster
    pub fn new(
        cluster: Cluster,
        image_source: Arc<dyn ImageSource>,
        image: impl Into<String>,
        factory: Arc<dyn SessionFactory>,
        config: EngineConfig,
    ) -> Result<Self> {
        cluster.validate()?;
        let layout = match &config.data_root {
            Some(root) => Layout::new(root.clone(), &cluster.name)?,
            None => Layout::for_cluster(&cluster.name)?,
        };
        let driver = distro::driver_for(cluster.distribution);
        Ok(Self {
            cluster,
            layout,
            driver,
            image_source,
            image: image.into(),
            factory,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that cancels every in-flight phase of this engine
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fresh per-operation session cache
    fn pool(&self) -> Arc<SessionPool> {
        Arc::new(SessionPool::new(
            self.factory.clone(),
            self.cluster.creds.clone(),
        ))
    }

    /// Wrap an operation body with cancellation and its deadline
    async fn guard<T, F>(&self, op: &str, deadline: Duration, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            outcome = tokio::time::timeout(deadline, fut) => match outcome {
                Err(_) => Err(Error::operation_timeout(op, deadline.as_secs())),
                Ok(result) => result,
            },
        }
    }

    // =========================================================================
    // Init
    // =========================================================================

    /// Stand up the whole cluster from the image
    pub async fn init(&self) -> Result<()> {
        let _lock = ClusterLock::acquire(self.layout.lock_path(), &self.cluster.name)?;
        let pool = self.pool();
        let result = self
            .guard("init", self.config.init_timeout, self.init_inner(&pool))
            .await;
        pool.close_all().await;
        result
    }

    async fn init_inner(&self, pool: &Arc<SessionPool>) -> Result<()> {
        info!(
            cluster = %self.cluster.name,
            master0 = %self.cluster.master0(),
            masters = self.cluster.masters.len(),
            workers = self.cluster.workers.len(),
            "initializing cluster"
        );
        let mount = self.mount().await?;
        let result = self.init_phases(pool, &mount).await;
        if let Err(e) = mount.release().await {
            warn!(error = %e, "image unmount failed");
        }
        result
    }

    async fn init_phases(&self, pool: &Arc<SessionPool>, mount: &MountGuard) -> Result<()> {
        let cluster = &self.cluster;
        let master0 = cluster.master0();
        let registry = Registry::new(cluster.registry.clone(), master0);

        // Phase 1: master0 alone. Rootfs must land before the registry can
        // start from the image-shipped script and blobs.
        let m0 = pool.session(master0).await?;
        prepare_host(
            pool.clone(),
            self.layout.clone(),
            None,
            mount.rootfs(),
            self.shell_env(),
            self.config.ssh_ready_tries,
            master0,
        )
        .await?;
        registry
            .deploy(pool.clone(), &self.layout, &[], &self.cancel)
            .await?;
        exec::apply_plan(m0.as_ref(), &self.driver.plan_init(cluster)).await?;

        // Phase 2: version probe and metadata. Nothing joins before this
        // succeeds.
        let version_step = self.driver.read_version();
        let version_out = exec::run_step(m0.as_ref(), &version_step).await?;
        let version = distro::parse_version(&version_out.stdout_trimmed());
        if version.is_empty() {
            return Err(Error::exec(
                master0,
                version_step.cmd,
                version_out.exit,
                b"version command produced no output",
            ));
        }
        let meta = ClusterMetadata::new(&version, cluster.distribution);
        metadata::write(m0.as_ref(), &self.layout.host_metadata_path(), &meta).await?;
        info!(version = %version, "master0 ready, metadata persisted");

        // Phase 3: prepare the rest of the fleet in parallel. From here on
        // master0 is up and metadata is persisted, so a fleet failure is a
        // partial failure of the whole init, never a fatal one.
        let rest: Vec<IpAddr> = cluster.masters[1..]
            .iter()
            .chain(cluster.workers.iter())
            .copied()
            .collect();
        if rest.is_empty() {
            return Ok(());
        }
        self.prepare_fleet(pool, mount, &registry, &rest)
            .await
            .map_err(|e| self.partial_behind_master0(e))?;

        // Phases 4 and 5: controllers join before workers, each batch with
        // a freshly minted token.
        self.join_phase(pool, JoinRole::Controller, &cluster.masters[1..])
            .await
            .map_err(|e| self.partial_behind_master0(e))?;
        self.join_phase(pool, JoinRole::Worker, &cluster.workers)
            .await
            .map_err(|e| self.partial_behind_master0(e))
    }

    /// Recast a fleet-phase failure as a partial init outcome
    ///
    /// By the time the fleet phases run, master0 has completed its
    /// bootstrap, so the operation as a whole partially succeeded even
    /// when fail-fast cancelled every other joiner. Errors that are not
    /// attributable to specific hosts (cancellation, timeouts, master0's
    /// own failures) pass through unchanged.
    fn partial_behind_master0(&self, err: Error) -> Error {
        let master0 = self.cluster.master0();
        match err {
            Error::Partial {
                mut succeeded,
                failed,
            } => {
                if !succeeded.contains(&master0) {
                    succeeded.insert(0, master0);
                }
                Error::Partial { succeeded, failed }
            }
            other => {
                let failed: Vec<(IpAddr, String)> = other
                    .hosts()
                    .into_iter()
                    .map(|h| (h, other.to_string()))
                    .collect();
                if failed.is_empty() || failed.iter().any(|(h, _)| *h == master0) {
                    return other;
                }
                Error::Partial {
                    succeeded: vec![master0],
                    failed,
                }
            }
        }
    }

    // =========================================================================
    // Join
    // =========================================================================

    /// Add control-plane nodes; no-op for an empty list
    pub async fn join_masters(&self, ips: &[IpAddr]) -> Result<()> {
        self.join_fleet(JoinRole::Controller, ips, "join-masters").await
    }

    /// Add worker nodes; no-op for an empty list
    pub async fn join_nodes(&self, ips: &[IpAddr]) -> Result<()> {
        self.join_fleet(JoinRole::Worker, ips, "join-nodes").await
    }

    async fn join_fleet(&self, role: JoinRole, ips: &[IpAddr], op: &str) -> Result<()> {
        if ips.is_empty() {
            return Ok(());
        }
        self.validate_join(ips)?;
        let _lock = ClusterLock::acquire(self.layout.lock_path(), &self.cluster.name)?;
        info!(cluster = %self.cluster.name, role = %role, hosts = ?ips, "joining hosts");
        let pool = self.pool();
        let result = self
            .guard(
                op,
                self.config.join_timeout,
                self.join_inner(&pool, role, ips),
            )
            .await;
        pool.close_all().await;
        result
    }

    fn validate_join(&self, ips: &[IpAddr]) -> Result<()> {
        let existing = self.cluster.all_hosts();
        for ip in ips {
            if existing.contains(ip) {
                return Err(Error::validation(
                    &self.cluster.name,
                    format!("host {ip} is already part of the cluster"),
                ));
            }
            self.cluster.credentials(*ip)?;
        }
        Ok(())
    }

    async fn join_inner(
        &self,
        pool: &Arc<SessionPool>,
        role: JoinRole,
        ips: &[IpAddr],
    ) -> Result<()> {
        let mount = self.mount().await?;
        let result = self.join_with_mount(pool, &mount, role, ips).await;
        if let Err(e) = mount.release().await {
            warn!(error = %e, "image unmount failed");
        }
        result
    }

    async fn join_with_mount(
        &self,
        pool: &Arc<SessionPool>,
        mount: &MountGuard,
        role: JoinRole,
        ips: &[IpAddr],
    ) -> Result<()> {
        let master0 = self.cluster.master0();
        let m0 = pool.session(master0).await?;
        exec::wait_ready(m0.as_ref(), self.config.ssh_ready_tries).await?;
        // Joining requires a prior successful init for this cluster name
        metadata::read(
            m0.as_ref(),
            &self.layout.host_metadata_path(),
            &self.cluster.name,
        )
        .await?;

        let registry = Registry::new(self.cluster.registry.clone(), master0);
        match self.prepare_fleet(pool, mount, &registry, ips).await {
            Ok(()) => {}
            // A registry that fell over since init gets one full
            // teardown/redeploy before the join is abandoned.
            Err(e) if e.kind() == "E_REGISTRY" => {
                warn!(error = %e, "registry unreachable during join, redeploying once");
                let all = self.cluster.all_hosts();
                if let Err(e) = registry.teardown(pool.clone(), &all, &self.cancel).await {
                    debug!(error = %e, "registry teardown during redeploy");
                }
                registry
                    .deploy(pool.clone(), &self.layout, &[], &self.cancel)
                    .await?;
                self.prepare_fleet(pool, mount, &registry, ips).await?;
            }
            Err(e) => return Err(e),
        }

        self.join_phase(pool, role, ips).await
    }

    /// Prepare hosts (rootfs sync, runtime install, registry wiring) in
    /// parallel with fail-fast escalation
    async fn prepare_fleet(
        &self,
        pool: &Arc<SessionPool>,
        mount: &MountGuard,
        registry: &Registry,
        hosts: &[IpAddr],
    ) -> Result<()> {
        let layout = self.layout.clone();
        let registry = registry.clone();
        let rootfs = mount.rootfs();
        let env = self.shell_env();
        let tries = self.config.ssh_ready_tries;
        let pool = pool.clone();
        fanout::for_each(
            hosts,
            self.config.fanout_limit,
            Mode::FailFast,
            &self.cancel,
            move |host| {
                let pool = pool.clone();
                let layout = layout.clone();
                let registry = registry.clone();
                let rootfs = rootfs.clone();
                let env = env.clone();
                async move {
                    prepare_host(pool, layout, Some(registry), rootfs, env, tries, host).await
                }
            },
        )
        .await
        .into_result()
    }

    /// Render the cluster's env overrides as a `K=V ` shell prefix for the
    /// image bootstrap scripts, sorted for deterministic commands
    fn shell_env(&self) -> String {
        let mut pairs: Vec<_> = self.cluster.env.iter().collect();
        pairs.sort();
        pairs
            .into_iter()
            .map(|(k, v)| format!("{k}={v} "))
            .collect()
    }

    /// Fetch one fresh token for `role` and join every listed host
    async fn join_phase(
        &self,
        pool: &Arc<SessionPool>,
        role: JoinRole,
        hosts: &[IpAddr],
    ) -> Result<()> {
        if hosts.is_empty() {
            return Ok(());
        }
        let m0 = pool.session(self.cluster.master0()).await?;
        let joining_token = token::fetch_join_token(m0.as_ref(), self.driver.as_ref(), role).await?;
        token::distribute(
            pool.clone(),
            self.driver.as_ref(),
            &joining_token,
            hosts,
            &self.cancel,
            self.config.fanout_limit,
        )
        .await
        .into_result()?;

        let plan = self.driver.plan_join(role, &self.cluster);
        let pool = pool.clone();
        fanout::for_each(
            hosts,
            self.config.fanout_limit,
            Mode::FailFast,
            &self.cancel,
            move |host| {
                let pool = pool.clone();
                let plan = plan.clone();
                async move { apply_plan_to(pool, plan, host).await }
            },
        )
        .await
        .into_result()
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Drain and reset control-plane nodes; master0 and the last master
    /// are protected
    pub async fn delete_masters(&self, ips: &[IpAddr]) -> Result<()> {
        if ips.is_empty() {
            return Ok(());
        }
        self.validate_delete_masters(ips)?;
        self.delete_fleet(ips, "delete-masters").await
    }

    /// Drain and reset worker nodes
    pub async fn delete_nodes(&self, ips: &[IpAddr]) -> Result<()> {
        if ips.is_empty() {
            return Ok(());
        }
        for ip in ips {
            if !self.cluster.workers.contains(ip) {
                return Err(Error::validation(
                    &self.cluster.name,
                    format!("host {ip} is not a worker of this cluster"),
                ));
            }
        }
        self.delete_fleet(ips, "delete-nodes").await
    }

    fn validate_delete_masters(&self, ips: &[IpAddr]) -> Result<()> {
        let masters = &self.cluster.masters;
        for ip in ips {
            if !masters.contains(ip) {
                return Err(Error::validation(
                    &self.cluster.name,
                    format!("host {ip} is not a master of this cluster"),
                ));
            }
        }
        let remaining = masters.iter().filter(|m| !ips.contains(m)).count();
        if remaining == 0 {
            return Err(Error::validation(
                &self.cluster.name,
                "refusing to delete the last master; reset the cluster instead",
            ));
        }
        if ips.contains(&self.cluster.master0()) {
            return Err(Error::validation(
                &self.cluster.name,
                "master0 cannot be deleted; reset the cluster instead",
            ));
        }
        Ok(())
    }

    async fn delete_fleet(&self, ips: &[IpAddr], op: &str) -> Result<()> {
        let _lock = ClusterLock::acquire(self.layout.lock_path(), &self.cluster.name)?;
        info!(cluster = %self.cluster.name, hosts = ?ips, "deleting hosts");
        let pool = self.pool();
        let result = self
            .guard(op, self.config.join_timeout, self.delete_inner(&pool, ips))
            .await;
        pool.close_all().await;
        result
    }

    async fn delete_inner(&self, pool: &Arc<SessionPool>, ips: &[IpAddr]) -> Result<()> {
        let master0 = self.cluster.master0();
        let m0 = pool.session(master0).await?;
        exec::wait_ready(m0.as_ref(), self.config.ssh_ready_tries).await?;
        metadata::read(
            m0.as_ref(),
            &self.layout.host_metadata_path(),
            &self.cluster.name,
        )
        .await?;

        let kubectl = self.driver.kubectl();
        let reset_plan = self.driver.plan_reset();
        let host_dir = self.layout.host_cluster_dir();
        let pool = pool.clone();
        // Best-effort: one broken node must not block the others
        fanout::for_each(
            ips,
            self.config.fanout_limit,
            Mode::CollectAll,
            &self.cancel,
            move |host| {
                let pool = pool.clone();
                let reset_plan = reset_plan.clone();
                let host_dir = host_dir.clone();
                async move {
                    delete_host(pool, master0, kubectl, reset_plan, host_dir, host).await
                }
            },
        )
        .await
        .into_result()
    }

    // =========================================================================
    // Upgrade
    // =========================================================================

    /// Rolling upgrade to the version declared by the mounted image
    ///
    /// Nodes are upgraded strictly one at a time, masters before workers,
    /// so quorum is preserved throughout.
    pub async fn upgrade(&self) -> Result<()> {
        let _lock = ClusterLock::acquire(self.layout.lock_path(), &self.cluster.name)?;
        let pool = self.pool();
        let result = self
            .guard(
                "upgrade",
                self.config.upgrade_timeout,
                self.upgrade_inner(&pool),
            )
            .await;
        pool.close_all().await;
        result
    }

    async fn upgrade_inner(&self, pool: &Arc<SessionPool>) -> Result<()> {
        let mount = self.mount().await?;
        let result = self.upgrade_with_mount(pool, &mount).await;
        if let Err(e) = mount.release().await {
            warn!(error = %e, "image unmount failed");
        }
        result
    }

    async fn upgrade_with_mount(&self, pool: &Arc<SessionPool>, mount: &MountGuard) -> Result<()> {
        let target = mount.manifest().version.clone();
        let master0 = self.cluster.master0();
        let m0 = pool.session(master0).await?;
        exec::wait_ready(m0.as_ref(), self.config.ssh_ready_tries).await?;
        let current = metadata::read(
            m0.as_ref(),
            &self.layout.host_metadata_path(),
            &self.cluster.name,
        )
        .await?;

        if current.version == target {
            info!(version = %target, "cluster already at image version");
            return Ok(());
        }
        info!(from = %current.version, to = %target, "rolling upgrade");

        for host in self.cluster.all_hosts() {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let session = pool.session(host).await?;
            exec::wait_ready(session.as_ref(), self.config.ssh_ready_tries).await?;
            exec::apply_plan(
                session.as_ref(),
                &self.driver.plan_upgrade(&self.cluster, &target),
            )
            .await?;
            info!(host = %host, version = %target, "node upgraded");
        }

        let version_out = exec::run_step(m0.as_ref(), &self.driver.read_version()).await?;
        let reported = distro::parse_version(&version_out.stdout_trimmed());
        if reported != target {
            warn!(reported = %reported, target = %target, "control plane reports unexpected version");
        }
        let meta = ClusterMetadata {
            version: reported,
            distribution: current.distribution,
            created_at: current.created_at,
        };
        metadata::write(m0.as_ref(), &self.layout.host_metadata_path(), &meta).await
    }

    // =========================================================================
    // Reset
    // =========================================================================

    /// Tear the whole cluster down, best-effort on every host
    pub async fn reset(&self) -> Result<()> {
        let _lock = ClusterLock::acquire(self.layout.lock_path(), &self.cluster.name)?;
        let pool = self.pool();
        let result = self
            .guard("reset", self.config.reset_timeout, self.reset_inner(&pool))
            .await;
        pool.close_all().await;
        result
    }

    async fn reset_inner(&self, pool: &Arc<SessionPool>) -> Result<()> {
        info!(cluster = %self.cluster.name, "resetting cluster");
        let hosts = self.cluster.all_hosts();
        let reset_plan = self.driver.plan_reset();
        let host_dir = self.layout.host_cluster_dir();

        let task_pool = pool.clone();
        let report = fanout::for_each(
            &hosts,
            self.config.fanout_limit,
            Mode::CollectAll,
            &self.cancel,
            move |host| {
                let pool = task_pool.clone();
                let reset_plan = reset_plan.clone();
                let host_dir = host_dir.clone();
                async move {
                    let session = pool.session(host).await?;
                    exec::apply_plan(session.as_ref(), &reset_plan).await?;
                    exec::run_to_string(session.as_ref(), &format!("rm -rf {host_dir}")).await?;
                    Ok(())
                }
            },
        )
        .await;

        // Everything below is cleanup that must run regardless of per-host
        // failures; problems are logged, never escalated.
        let registry = Registry::new(self.cluster.registry.clone(), self.cluster.master0());
        if let Err(e) = registry.teardown(pool.clone(), &hosts, &self.cancel).await {
            warn!(error = %e, "registry teardown incomplete");
        }
        if let Err(e) = self.image_source.unmount(&self.layout.mount_dir()).await {
            debug!(error = %e, "image unmount during reset");
        }
        if let Err(e) = tokio::fs::remove_dir_all(self.layout.cluster_dir()).await {
            debug!(error = %e, "controller cluster dir already gone");
        }

        report.into_result()
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Read the authoritative metadata from master0
    pub async fn get_metadata(&self) -> Result<ClusterMetadata> {
        let pool = self.pool();
        let result = async {
            let m0 = pool.session(self.cluster.master0()).await?;
            exec::wait_ready(m0.as_ref(), self.config.ssh_ready_tries).await?;
            metadata::read(
                m0.as_ref(),
                &self.layout.host_metadata_path(),
                &self.cluster.name,
            )
            .await
        }
        .await;
        pool.close_all().await;
        result
    }

    async fn mount(&self) -> Result<MountGuard> {
        self.image_source
            .pull(&self.image, &self.cluster.platform, PullPolicy::Missing)
            .await?;
        mount_image(
            self.image_source.clone(),
            &self.image,
            &self.cluster.platform,
        )
        .await
    }
}

/// Bring one host to the provisioned state: reachable, rootfs synced,
/// runtime installed, and (when a registry is given) wired to and able to
/// reach the registry
async fn prepare_host(
    pool: Arc<SessionPool>,
    layout: Layout,
    registry: Option<Registry>,
    rootfs: PathBuf,
    env: String,
    ssh_tries: u32,
    host: IpAddr,
) -> Result<()> {
    let session = pool.session(host).await?;
    exec::wait_ready(session.as_ref(), ssh_tries).await?;

    exec::run_to_string(
        session.as_ref(),
        &format!("mkdir -p {}", layout.host_cluster_dir()),
    )
    .await?;
    exec::copy_with_retry(session.as_ref(), &rootfs, &layout.host_cluster_dir()).await?;
    exec::run_to_string(
        session.as_ref(),
        &format!("cd {} && {env}bash init.sh", layout.host_scripts()),
    )
    .await?;

    if let Some(registry) = registry {
        registry.wire_host(&pool, &layout, host).await?;
        registry.probe_from(&pool, host).await?;
    }

    debug!(host = %host, "host provisioned");
    Ok(())
}

/// Apply a join (or any per-host) plan through the pool
async fn apply_plan_to(pool: Arc<SessionPool>, plan: CommandPlan, host: IpAddr) -> Result<()> {
    let session = pool.session(host).await?;
    exec::apply_plan(session.as_ref(), &plan).await?;
    Ok(())
}

/// Drain a node through master0, then reset the host itself
async fn delete_host(
    pool: Arc<SessionPool>,
    master0: IpAddr,
    kubectl: &'static str,
    reset_plan: CommandPlan,
    host_dir: String,
    host: IpAddr,
) -> Result<()> {
    let m0 = pool.session(master0).await?;
    let node_name = exec::run_to_string(
        m0.as_ref(),
        &format!(
            "{kubectl} get nodes -o wide --no-headers | awk -v ip={host} '$6==ip {{print $1}}'"
        ),
    )
    .await?;

    if node_name.is_empty() {
        // Never registered (failed join); nothing to drain
        debug!(host = %host, "no node object found, skipping drain");
    } else {
        let drain = CommandStep::new(format!(
            "{kubectl} drain {node_name} --ignore-daemonsets --delete-emptydir-data \
             --force --timeout=120s"
        ))
        .allow_failure()
        .with_timeout(Duration::from_secs(150));
        exec::run_step(m0.as_ref(), &drain).await?;
        let delete = CommandStep::new(format!("{kubectl} delete node {node_name}"))
            .allow_failure();
        exec::run_step(m0.as_ref(), &delete).await?;
    }

    let session = pool.session(host).await?;
    exec::apply_plan(session.as_ref(), &reset_plan).await?;
    exec::run_to_string(session.as_ref(), &format!("rm -rf {host_dir}")).await?;
    info!(host = %host, "host removed from cluster");
    Ok(())
}
