//! Fan-out coordinator: apply a per-host task across a fleet
//!
//! Concurrency is bounded and cancellation-aware. Two escalation modes:
//! fail-fast cancels peers on the first error (init, join, upgrade);
//! collect-all runs everything and aggregates failures (delete, reset).
//! No ordering is guaranteed between hosts; callers needing order apply
//! phases serially (master0 is always handled alone before any fan-out).

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default bound on in-flight per-host tasks
pub const DEFAULT_FANOUT_LIMIT: usize = 16;

/// Error escalation policy for one fan-out
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Cancel pending peers on the first error
    FailFast,
    /// Run every host to completion and aggregate failures
    CollectAll,
}

/// Terminal state of one host within a fan-out
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostState {
    /// Task returned Ok
    Succeeded,
    /// Task returned an error (message kept for the aggregate)
    Failed(String),
    /// Task was cancelled mid-flight
    Cancelled,
    /// Task never started (cancelled while queued)
    NotStarted,
}

/// Outcome of one fan-out across a host set
#[derive(Debug)]
pub struct FanoutReport {
    /// Per-host terminal states
    pub states: BTreeMap<IpAddr, HostState>,
    mode: Mode,
    first_error: Option<Error>,
    externally_cancelled: bool,
}

impl FanoutReport {
    /// Whether every host succeeded
    pub fn all_succeeded(&self) -> bool {
        self.states.values().all(|s| *s == HostState::Succeeded)
    }

    /// Hosts that completed the task
    pub fn succeeded(&self) -> Vec<IpAddr> {
        self.states
            .iter()
            .filter(|(_, s)| **s == HostState::Succeeded)
            .map(|(h, _)| *h)
            .collect()
    }

    /// Hosts that failed, with their failure messages
    pub fn failed(&self) -> Vec<(IpAddr, String)> {
        self.states
            .iter()
            .filter_map(|(h, s)| match s {
                HostState::Failed(msg) => Some((*h, msg.clone())),
                _ => None,
            })
            .collect()
    }

    /// Collapse the report into a result
    ///
    /// Cancellation of the parent token wins. Otherwise: all-success is Ok;
    /// a mix of success and failure is [`Error::Partial`]; an all-failure
    /// fail-fast run surfaces the first error unchanged so its kind is
    /// preserved; an all-failure collect-all run aggregates.
    pub fn into_result(self) -> Result<()> {
        if self.externally_cancelled {
            return Err(Error::Cancelled);
        }
        if self.all_succeeded() {
            return Ok(());
        }
        let succeeded = self.succeeded();
        let failed = self.failed();
        if succeeded.is_empty() && self.mode == Mode::FailFast {
            if let Some(e) = self.first_error {
                return Err(e);
            }
        }
        Err(Error::Partial { succeeded, failed })
    }
}

/// Run `task` for each host concurrently, bounded by `limit`
///
/// The task future must be `'static`; callers capture their context in
/// `Arc`s. Cancelling `cancel` tears down in-flight work and reports
/// [`Error::Cancelled`] from [`FanoutReport::into_result`].
pub async fn for_each<F, Fut>(
    hosts: &[IpAddr],
    limit: usize,
    mode: Mode,
    cancel: &CancellationToken,
    task: F,
) -> FanoutReport
where
    F: Fn(IpAddr) -> Fut,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let states: Arc<DashMap<IpAddr, HostState>> = Arc::new(DashMap::new());
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let child = cancel.child_token();
    let mut set: JoinSet<(IpAddr, Option<Error>)> = JoinSet::new();

    for &host in hosts {
        let fut = task(host);
        let semaphore = semaphore.clone();
        let child = child.clone();
        let states = states.clone();
        set.spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = child.cancelled() => return (host, None),
                permit = semaphore.acquire_owned() => permit.expect("semaphore never closed"),
            };
            let result = tokio::select! {
                biased;
                _ = child.cancelled() => {
                    states.insert(host, HostState::Cancelled);
                    return (host, None);
                }
                r = fut => r,
            };
            match result {
                Ok(()) => {
                    states.insert(host, HostState::Succeeded);
                    (host, None)
                }
                Err(e) => {
                    states.insert(host, HostState::Failed(e.to_string()));
                    (host, Some(e))
                }
            }
        });
    }

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((host, Some(e))) => {
                debug!(host = %host, error = %e, "fan-out task failed");
                if first_error.is_none() {
                    if mode == Mode::FailFast {
                        child.cancel();
                    }
                    first_error = Some(e);
                }
            }
            Ok((_, None)) => {}
            Err(join_err) => {
                // A panicked task loses its host attribution; the host
                // stays NotStarted in the report.
                warn!(error = %join_err, "fan-out task panicked");
            }
        }
    }

    let mut final_states = BTreeMap::new();
    for &host in hosts {
        let state = states
            .get(&host)
            .map(|s| s.value().clone())
            .unwrap_or(HostState::NotStarted);
        final_states.insert(host, state);
    }

    FanoutReport {
        states: final_states,
        mode,
        first_error,
        externally_cancelled: cancel.is_cancelled(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn hosts(n: usize) -> Vec<IpAddr> {
        (1..=n).map(|i| format!("10.0.0.{i}").parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_all_hosts_succeed() {
        let hosts = hosts(5);
        let cancel = CancellationToken::new();
        let report = for_each(&hosts, 16, Mode::FailFast, &cancel, |_| async { Ok(()) }).await;
        assert!(report.all_succeeded());
        report.into_result().unwrap();
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let hosts = hosts(12);
        let cancel = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let report = for_each(&hosts, 3, Mode::CollectAll, &cancel, |_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(report.all_succeeded());
        assert!(peak.load(Ordering::SeqCst) <= 3, "cap exceeded");
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_queued_peers() {
        let hosts = hosts(8);
        let bad: IpAddr = "10.0.0.1".parse().unwrap();
        let cancel = CancellationToken::new();

        let report = for_each(&hosts, 1, Mode::FailFast, &cancel, move |host| async move {
            if host == bad {
                Err(Error::unreachable(host, "refused"))
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(())
            }
        })
        .await;

        assert!(!report.all_succeeded());
        let not_started = report
            .states
            .values()
            .filter(|s| **s == HostState::NotStarted)
            .count();
        assert!(not_started > 0, "queued peers should never start");
        // With no successes, the first error's kind is preserved
        let err = report.into_result().unwrap_err();
        assert_eq!(err.kind(), "E_UNREACHABLE");
    }

    #[tokio::test]
    async fn test_collect_all_runs_everything() {
        let hosts = hosts(6);
        let cancel = CancellationToken::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let report = for_each(&hosts, 16, Mode::CollectAll, &cancel, |host| {
            let ran = ran.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                if host.to_string().ends_with(".3") {
                    Err(Error::unreachable(host, "down"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(ran.load(Ordering::SeqCst), 6, "collect_all never cancels");
        let err = report.into_result().unwrap_err();
        match err {
            Error::Partial { succeeded, failed } => {
                assert_eq!(succeeded.len(), 5);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].0.to_string(), "10.0.0.3");
            }
            other => panic!("expected Partial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partial_failure_lists_exactly_the_failed_hosts() {
        let hosts = hosts(5);
        let cancel = CancellationToken::new();
        let report = for_each(&hosts, 16, Mode::CollectAll, &cancel, |host| async move {
            let last: u8 = host.to_string().rsplit('.').next().unwrap().parse().unwrap();
            if last % 2 == 0 {
                Err(Error::unreachable(host, "down"))
            } else {
                Ok(())
            }
        })
        .await;

        let failed = report.failed();
        let failed_hosts: Vec<String> = failed.iter().map(|(h, _)| h.to_string()).collect();
        assert_eq!(failed_hosts, vec!["10.0.0.2", "10.0.0.4"]);
    }

    #[tokio::test]
    async fn test_external_cancellation_reports_cancelled() {
        let hosts = hosts(4);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            cancel_clone.cancel();
        });

        let report = for_each(&hosts, 2, Mode::FailFast, &cancel, |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;

        let err = report.into_result().unwrap_err();
        assert_eq!(err.kind(), "E_CANCELLED");
    }

    #[tokio::test]
    async fn test_empty_host_list_is_a_no_op() {
        let cancel = CancellationToken::new();
        let report = for_each(&[], 16, Mode::FailFast, &cancel, |_| async { Ok(()) }).await;
        assert!(report.all_succeeded());
        report.into_result().unwrap();
    }
}
