//! Command planner for full kubeadm-managed Kubernetes
//!
//! Join tokens for kubeadm are whole join command lines: `kubeadm token
//! create --print-join-command` emits `kubeadm join <endpoint> --token ...
//! --discovery-token-ca-cert-hash ...`. The broker ships that line to the
//! joining host and the join plan executes it, appending the CRI socket and
//! (for controllers) the control-plane flags.

use std::time::Duration;

use crate::cluster::{Cluster, Distribution, JoinRole};
use crate::layout;

use super::{CommandPlan, CommandStep, DistroDriver};

/// kubeadm init configuration written on master0
const INIT_CONFIG: &str = "/etc/kubernetes/kubeadm.yaml";

/// Shipped join command line for additional control-plane nodes
const CONTROLLER_JOIN_CMD: &str = "/etc/kubernetes/join-controller.cmd";

/// Shipped join command line for workers
const WORKER_JOIN_CMD: &str = "/etc/kubernetes/join-worker.cmd";

/// External container runtime socket
const EXTERNAL_CRI: &str = "unix:///run/containerd/containerd.sock";

/// Admin kubeconfig present on control-plane nodes only
const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";

/// Planner for kubeadm clusters
pub struct KubeadmDriver;

impl DistroDriver for KubeadmDriver {
    fn distribution(&self) -> Distribution {
        Distribution::K8s
    }

    fn plan_init(&self, cluster: &Cluster) -> CommandPlan {
        let repo = cluster.registry.endpoint();
        CommandPlan::new(vec![
            CommandStep::new("mkdir -p /etc/kubernetes").idempotent(),
            CommandStep::new(format!(
                "printf 'apiVersion: kubeadm.k8s.io/v1beta3\\nkind: ClusterConfiguration\\n\
                 imageRepository: {repo}\\n' > {INIT_CONFIG}"
            ))
            .idempotent(),
            // kubeadm init refuses to run twice; an initialized master0 is
            // detected by its admin.conf and left alone.
            CommandStep::new(format!(
                "test -f {ADMIN_CONF} || kubeadm init --config {INIT_CONFIG} \
                 --upload-certs --cri-socket {EXTERNAL_CRI}"
            ))
            .with_timeout(Duration::from_secs(600))
            .idempotent(),
            CommandStep::new(format!(
                "timeout 180 sh -c 'until kubectl --kubeconfig {ADMIN_CONF} get --raw /readyz \
                 >/dev/null 2>&1; do sleep 3; done'"
            ))
            .with_timeout(Duration::from_secs(200))
            .idempotent(),
        ])
    }

    fn plan_join(&self, role: JoinRole, _cluster: &Cluster) -> CommandPlan {
        match role {
            JoinRole::Controller => CommandPlan::new(vec![CommandStep::new(format!(
                "sh -c \"$(cat {CONTROLLER_JOIN_CMD}) --control-plane \
                 --cri-socket {EXTERNAL_CRI}\""
            ))
            .with_timeout(Duration::from_secs(600))]),
            JoinRole::Worker => CommandPlan::new(vec![CommandStep::new(format!(
                "sh -c \"$(cat {WORKER_JOIN_CMD}) --cri-socket {EXTERNAL_CRI}\""
            ))
            .with_timeout(Duration::from_secs(600))]),
        }
    }

    fn plan_reset(&self) -> CommandPlan {
        CommandPlan::new(vec![
            CommandStep::new(format!("kubeadm reset -f --cri-socket {EXTERNAL_CRI}"))
                .allow_failure(),
            CommandStep::new("rm -rf /etc/kubernetes /var/lib/etcd /var/lib/kubelet")
                .allow_failure(),
            CommandStep::new("rm -rf $HOME/.kube").allow_failure(),
        ])
    }

    fn plan_upgrade(&self, cluster: &Cluster, target: &str) -> CommandPlan {
        let rootfs = layout::host_rootfs(&cluster.name);
        CommandPlan::new(vec![
            CommandStep::new(format!(
                "install -m 0755 {rootfs}/bin/kubeadm /usr/local/bin/kubeadm"
            )),
            // Control-plane nodes carry admin.conf; workers only replay the
            // node upgrade.
            CommandStep::new(format!(
                "if [ -f {ADMIN_CONF} ]; then kubeadm upgrade apply -y {target}; \
                 else kubeadm upgrade node; fi"
            ))
            .with_timeout(Duration::from_secs(600)),
            CommandStep::new(format!(
                "install -m 0755 {rootfs}/bin/kubelet /usr/local/bin/kubelet \
                 && systemctl restart kubelet"
            )),
        ])
    }

    fn read_join_token(&self, role: JoinRole) -> CommandStep {
        let cmd = match role {
            // The certificate key lets additional control-plane nodes fetch
            // the shared certs uploaded at init.
            JoinRole::Controller => {
                "echo \"$(kubeadm token create --print-join-command) \
                 --certificate-key $(kubeadm init phase upload-certs --upload-certs \
                 2>/dev/null | tail -1)\""
            }
            JoinRole::Worker => "kubeadm token create --print-join-command",
        };
        CommandStep::new(cmd).capture().with_timeout(Duration::from_secs(60))
    }

    fn read_version(&self) -> CommandStep {
        CommandStep::new("kubeadm version -o short")
            .capture()
            .with_timeout(Duration::from_secs(30))
    }

    fn token_path(&self, role: JoinRole) -> &'static str {
        match role {
            JoinRole::Controller => CONTROLLER_JOIN_CMD,
            JoinRole::Worker => WORKER_JOIN_CMD,
        }
    }

    fn kubectl(&self) -> &'static str {
        "kubectl --kubeconfig /etc/kubernetes/admin.conf"
    }
}
