//! Command planner for the k0s distribution
//!
//! k0s is a single binary: install registers a systemd unit for the chosen
//! role, `k0s start` brings it up. The image repository override is injected
//! into the generated `/etc/k0s/k0s.yaml` so every image pull goes through
//! the in-cluster registry.

use std::time::Duration;

use crate::cluster::{Cluster, Distribution, JoinRole};
use crate::layout;

use super::{CommandPlan, CommandStep, DistroDriver};

/// Generated k0s configuration file
const CONFIG_PATH: &str = "/etc/k0s/k0s.yaml";

/// Join token path for controllers
const CONTROLLER_TOKEN: &str = "/etc/k0s/controller.token";

/// Join token path for workers
const WORKER_TOKEN: &str = "/etc/k0s/worker.token";

/// External container runtime socket handed to every k0s install
const EXTERNAL_CRI: &str = "remote:unix:///run/containerd/containerd.sock";

/// Planner for k0s clusters
pub struct K0sDriver;

impl K0sDriver {
    /// Steps shared by init and controller join: generate the config and
    /// point its image repository at the in-cluster registry. The sed is
    /// grep-guarded so a re-run does not duplicate the override.
    fn config_steps(cluster: &Cluster) -> Vec<CommandStep> {
        let repo = cluster.registry.endpoint();
        vec![
            CommandStep::new("mkdir -p /etc/k0s").idempotent(),
            CommandStep::new(format!("k0s config create > {CONFIG_PATH}")).idempotent(),
            CommandStep::new(format!(
                "grep -q 'repository:' {CONFIG_PATH} || \
                 sed -i '/  images/ a\\    repository: \"{repo}\"' {CONFIG_PATH}"
            ))
            .idempotent(),
        ]
    }

    /// Start the service if it is not already running, then wait for the
    /// API to answer
    fn start_steps() -> Vec<CommandStep> {
        vec![
            CommandStep::new("k0s status >/dev/null 2>&1 || k0s start").idempotent(),
            CommandStep::new(
                "timeout 180 sh -c 'until k0s kubectl get --raw /readyz >/dev/null 2>&1; \
                 do sleep 3; done'",
            )
            .with_timeout(Duration::from_secs(200))
            .idempotent(),
        ]
    }
}

impl DistroDriver for K0sDriver {
    fn distribution(&self) -> Distribution {
        Distribution::K0s
    }

    fn plan_init(&self, cluster: &Cluster) -> CommandPlan {
        let mut steps = Self::config_steps(cluster);
        steps.push(
            CommandStep::new(format!(
                "k0s install controller --force -c {CONFIG_PATH} --cri-socket {EXTERNAL_CRI}"
            ))
            .idempotent(),
        );
        steps.extend(Self::start_steps());
        CommandPlan::new(steps)
    }

    fn plan_join(&self, role: JoinRole, cluster: &Cluster) -> CommandPlan {
        let mut steps = match role {
            JoinRole::Controller => {
                let mut steps = Self::config_steps(cluster);
                steps.push(CommandStep::new(format!(
                    "k0s install controller --token-file {CONTROLLER_TOKEN} \
                     -c {CONFIG_PATH} --cri-socket {EXTERNAL_CRI}"
                )));
                steps
            }
            JoinRole::Worker => vec![CommandStep::new(format!(
                "k0s install worker --cri-socket {EXTERNAL_CRI} --token-file {WORKER_TOKEN}"
            ))],
        };
        steps.push(CommandStep::new("k0s status >/dev/null 2>&1 || k0s start").idempotent());
        CommandPlan::new(steps)
    }

    fn plan_reset(&self) -> CommandPlan {
        CommandPlan::new(vec![
            CommandStep::new("k0s stop").allow_failure(),
            CommandStep::new("k0s reset").allow_failure(),
            CommandStep::new("rm -rf /etc/k0s /run/k0s").allow_failure(),
        ])
    }

    fn plan_upgrade(&self, cluster: &Cluster, _target: &str) -> CommandPlan {
        let rootfs = layout::host_rootfs(&cluster.name);
        let mut steps = vec![
            CommandStep::new("k0s stop").allow_failure(),
            CommandStep::new(format!("install -m 0755 {rootfs}/bin/k0s /usr/local/bin/k0s")),
        ];
        steps.extend(Self::start_steps());
        CommandPlan::new(steps)
    }

    fn read_join_token(&self, role: JoinRole) -> CommandStep {
        let role_flag = match role {
            JoinRole::Controller => "controller",
            JoinRole::Worker => "worker",
        };
        CommandStep::new(format!("k0s token create --role={role_flag} --expiry=24h"))
            .capture()
            .with_timeout(Duration::from_secs(60))
    }

    fn read_version(&self) -> CommandStep {
        CommandStep::new("k0s version")
            .capture()
            .with_timeout(Duration::from_secs(30))
    }

    fn token_path(&self, role: JoinRole) -> &'static str {
        match role {
            JoinRole::Controller => CONTROLLER_TOKEN,
            JoinRole::Worker => WORKER_TOKEN,
        }
    }

    fn kubectl(&self) -> &'static str {
        "k0s kubectl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distro::tests::test_cluster;

    #[test]
    fn test_init_overrides_image_repository() {
        let cluster = test_cluster(Distribution::K0s);
        let plan = K0sDriver.plan_init(&cluster);
        let joined = plan.commands().join("\n");
        assert!(joined.contains("repository: \"sea.hub:5000\""));
        assert!(joined.contains("k0s install controller"));
        assert!(joined.contains("--cri-socket remote:unix:///run/containerd/containerd.sock"));
    }

    #[test]
    fn test_init_is_rerunnable() {
        let cluster = test_cluster(Distribution::K0s);
        let plan = K0sDriver.plan_init(&cluster);
        assert!(plan.steps.iter().all(|s| s.idempotent));
    }

    #[test]
    fn test_controller_join_consumes_token_file() {
        let cluster = test_cluster(Distribution::K0s);
        let plan = K0sDriver.plan_join(JoinRole::Controller, &cluster);
        let joined = plan.commands().join("\n");
        assert!(joined.contains("--token-file /etc/k0s/controller.token"));
        assert!(joined.contains("k0s config create"));
    }

    #[test]
    fn test_worker_join_is_minimal() {
        let cluster = test_cluster(Distribution::K0s);
        let plan = K0sDriver.plan_join(JoinRole::Worker, &cluster);
        let joined = plan.commands().join("\n");
        assert!(joined.contains("k0s install worker"));
        assert!(joined.contains("--token-file /etc/k0s/worker.token"));
        assert!(!joined.contains("config create"), "workers take no config file");
    }

    #[test]
    fn test_token_commands_mint_fresh_tokens() {
        let step = K0sDriver.read_join_token(JoinRole::Controller);
        assert!(step.capture_stdout);
        assert!(step.cmd.contains("--role=controller"));
        let step = K0sDriver.read_join_token(JoinRole::Worker);
        assert!(step.cmd.contains("--role=worker"));
    }

    #[test]
    fn test_upgrade_replaces_binary_from_rootfs() {
        let cluster = test_cluster(Distribution::K0s);
        let plan = K0sDriver.plan_upgrade(&cluster, "v1.24.0");
        let joined = plan.commands().join("\n");
        assert!(joined.contains("/var/lib/keel/demo/rootfs/bin/k0s"));
    }
}
