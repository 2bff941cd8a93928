//! Command planner for the k3s distribution
//!
//! k3s reads `/etc/rancher/k3s/config.yaml` at startup. The plans write
//! that file with printf, point `system-default-registry` at the
//! in-cluster registry, and run the server/agent through the systemd units
//! shipped in the image rootfs.

use std::time::Duration;

use crate::cluster::{Cluster, Distribution, JoinRole};
use crate::layout;

use super::{CommandPlan, CommandStep, DistroDriver};

/// k3s configuration file consumed by server and agent
const CONFIG_PATH: &str = "/etc/rancher/k3s/config.yaml";

/// Join token path for additional servers
const SERVER_TOKEN: &str = "/etc/rancher/k3s/server.token";

/// Join token path for agents
const AGENT_TOKEN: &str = "/etc/rancher/k3s/agent.token";

/// External container runtime socket
const EXTERNAL_CRI: &str = "unix:///run/containerd/containerd.sock";

/// Planner for k3s clusters
pub struct K3sDriver;

impl K3sDriver {
    fn write_config(cluster: &Cluster, extra: &[String]) -> CommandStep {
        let mut lines = vec![
            format!("system-default-registry: {}", cluster.registry.endpoint()),
            format!("container-runtime-endpoint: {EXTERNAL_CRI}"),
        ];
        lines.extend(extra.iter().cloned());
        let body = lines.join("\\n");
        CommandStep::new(format!(
            "mkdir -p /etc/rancher/k3s && printf '{body}\\n' > {CONFIG_PATH}"
        ))
        .idempotent()
    }

    fn wait_ready() -> CommandStep {
        CommandStep::new(
            "timeout 180 sh -c 'until k3s kubectl get --raw /readyz >/dev/null 2>&1; \
             do sleep 3; done'",
        )
        .with_timeout(Duration::from_secs(200))
        .idempotent()
    }
}

impl DistroDriver for K3sDriver {
    fn distribution(&self) -> Distribution {
        Distribution::K3s
    }

    fn plan_init(&self, cluster: &Cluster) -> CommandPlan {
        CommandPlan::new(vec![
            Self::write_config(cluster, &["cluster-init: true".to_string()]),
            CommandStep::new("systemctl enable --now k3s-server").idempotent(),
            Self::wait_ready(),
        ])
    }

    fn plan_join(&self, role: JoinRole, cluster: &Cluster) -> CommandPlan {
        let server_url = format!("https://{}:6443", cluster.master0());
        match role {
            JoinRole::Controller => CommandPlan::new(vec![
                Self::write_config(
                    cluster,
                    &[
                        format!("server: {server_url}"),
                        format!("token-file: {SERVER_TOKEN}"),
                    ],
                ),
                CommandStep::new("systemctl enable --now k3s-server"),
            ]),
            JoinRole::Worker => CommandPlan::new(vec![
                Self::write_config(
                    cluster,
                    &[
                        format!("server: {server_url}"),
                        format!("token-file: {AGENT_TOKEN}"),
                    ],
                ),
                CommandStep::new("systemctl enable --now k3s-agent"),
            ]),
        }
    }

    fn plan_reset(&self) -> CommandPlan {
        CommandPlan::new(vec![
            CommandStep::new("systemctl disable --now k3s-server k3s-agent").allow_failure(),
            CommandStep::new("k3s-killall.sh").allow_failure(),
            CommandStep::new("rm -rf /etc/rancher/k3s /var/lib/rancher/k3s").allow_failure(),
        ])
    }

    fn plan_upgrade(&self, cluster: &Cluster, _target: &str) -> CommandPlan {
        let rootfs = layout::host_rootfs(&cluster.name);
        CommandPlan::new(vec![
            CommandStep::new("systemctl stop k3s-server k3s-agent").allow_failure(),
            CommandStep::new(format!("install -m 0755 {rootfs}/bin/k3s /usr/local/bin/k3s")),
            CommandStep::new(
                "systemctl is-enabled k3s-server >/dev/null 2>&1 \
                 && systemctl start k3s-server || systemctl start k3s-agent",
            ),
            Self::wait_ready(),
        ])
    }

    fn read_join_token(&self, role: JoinRole) -> CommandStep {
        // k3s materializes tokens on disk under the server data dir; the
        // agent token falls back to the server token on older releases.
        let cmd = match role {
            JoinRole::Controller => "cat /var/lib/rancher/k3s/server/token",
            JoinRole::Worker => {
                "cat /var/lib/rancher/k3s/server/agent-token 2>/dev/null \
                 || cat /var/lib/rancher/k3s/server/token"
            }
        };
        CommandStep::new(cmd).capture().with_timeout(Duration::from_secs(30))
    }

    fn read_version(&self) -> CommandStep {
        CommandStep::new("k3s --version | head -n1 | awk '{print $3}'")
            .capture()
            .with_timeout(Duration::from_secs(30))
    }

    fn token_path(&self, role: JoinRole) -> &'static str {
        match role {
            JoinRole::Controller => SERVER_TOKEN,
            JoinRole::Worker => AGENT_TOKEN,
        }
    }

    fn kubectl(&self) -> &'static str {
        "k3s kubectl"
    }
}
