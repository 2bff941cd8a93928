//! Distribution drivers: per-distribution command planners
//!
//! A driver is a pure planner. It turns a (role, action) pair into an
//! ordered [`CommandPlan`] and parses command output, but performs no I/O
//! itself; the lifecycle engine applies plans through the host executor.
//! This keeps every plan testable without a remote host.

mod k0s;
mod k3s;
mod kubeadm;

pub use k0s::K0sDriver;
pub use k3s::K3sDriver;
pub use kubeadm::KubeadmDriver;

use std::time::Duration;

use serde::Serialize;

use crate::cluster::{Cluster, Distribution, JoinRole};

/// Default per-step timeout when a step does not override it
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// One shell step of a command plan
#[derive(Clone, Debug, Serialize)]
pub struct CommandStep {
    /// The shell command
    pub cmd: String,
    /// Whether a nonzero exit aborts the plan
    pub must_succeed: bool,
    /// Whether stdout is meaningful to the caller
    pub capture_stdout: bool,
    /// Per-step deadline
    #[serde(skip)]
    pub timeout: Duration,
    /// Whether re-running the step on an already-converged host is safe
    pub idempotent: bool,
}

impl CommandStep {
    /// A must-succeed step with the default timeout
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            must_succeed: true,
            capture_stdout: false,
            timeout: DEFAULT_STEP_TIMEOUT,
            idempotent: false,
        }
    }

    /// Tolerate a nonzero exit (cleanup steps on partially installed hosts)
    pub fn allow_failure(mut self) -> Self {
        self.must_succeed = false;
        self
    }

    /// Mark stdout as the step's product
    pub fn capture(mut self) -> Self {
        self.capture_stdout = true;
        self
    }

    /// Override the step deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mark the step as safe to re-run
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }
}

/// An ordered sequence of shell steps for one (role, action) pair
#[derive(Clone, Debug, Default, Serialize)]
pub struct CommandPlan {
    /// Steps in execution order
    pub steps: Vec<CommandStep>,
}

impl CommandPlan {
    /// Plan from a list of steps
    pub fn new(steps: Vec<CommandStep>) -> Self {
        Self { steps }
    }

    /// Whether the plan has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Concatenated command strings, for assertions and debug logs
    pub fn commands(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.cmd.as_str()).collect()
    }
}

impl FromIterator<CommandStep> for CommandPlan {
    fn from_iter<T: IntoIterator<Item = CommandStep>>(iter: T) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}

/// Capability set shared by every supported distribution
///
/// Implementations return plans and parse outputs; they never touch the
/// network or filesystem.
pub trait DistroDriver: Send + Sync {
    /// The distribution this driver plans for
    fn distribution(&self) -> Distribution;

    /// Install and start the distribution on master0, wired to pull from
    /// the in-cluster registry, and wait for the control plane to answer.
    /// Re-running on an initialized master0 must be a no-op or safe resync.
    fn plan_init(&self, cluster: &Cluster) -> CommandPlan;

    /// Join a prepared host in the given role, consuming the join token
    /// previously written to [`DistroDriver::token_path`]
    fn plan_join(&self, role: JoinRole, cluster: &Cluster) -> CommandPlan;

    /// Stop services and remove state. Must tolerate a partial prior
    /// installation, so most steps tolerate failure.
    fn plan_reset(&self) -> CommandPlan;

    /// Roll one node onto the target version; applied host by host by the
    /// engine's serialized upgrade schedule
    fn plan_upgrade(&self, cluster: &Cluster, target: &str) -> CommandPlan;

    /// Command run on master0 whose stdout is the join token for `role`.
    /// This is not a file read; the driver may materialize the token on
    /// demand.
    fn read_join_token(&self, role: JoinRole) -> CommandStep;

    /// Command run on master0 whose trimmed stdout yields the Kubernetes
    /// version (see [`parse_version`])
    fn read_version(&self) -> CommandStep;

    /// Well-known on-host path the join token for `role` is written to
    fn token_path(&self, role: JoinRole) -> &'static str;

    /// Shell prefix that invokes kubectl against this distribution's
    /// control plane, used by the engine for drain and node queries
    fn kubectl(&self) -> &'static str;
}

/// Resolve the driver for a cluster's distribution
pub fn driver_for(distribution: Distribution) -> Box<dyn DistroDriver> {
    match distribution {
        Distribution::K8s => Box::new(KubeadmDriver),
        Distribution::K0s => Box::new(K0sDriver),
        Distribution::K3s => Box::new(K3sDriver),
    }
}

/// Normalize a version command's stdout: trim whitespace and strip the
/// build-metadata suffix at the first `+` (`v1.23.8+k0s.0` -> `v1.23.8`)
pub fn parse_version(stdout: &str) -> String {
    let trimmed = stdout.trim();
    match trimmed.split_once('+') {
        Some((version, _)) => version.to_string(),
        None => trimmed.to_string(),
    }
}
