//! Poll an instance until it accepts SSH.

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::Instant;

use crate::error::PodliftError;
use crate::provider::{Endpoint, InstanceSnapshot, Provider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub timeout: Duration,
    pub interval: Duration,
}

/// Checks that an endpoint completes an SSH handshake.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait SshProbe {
    async fn probe(&self, endpoint: &Endpoint, user: &str) -> Result<(), String>;
}

const PROBE_TOKEN: &str = "PODLIFT_SSH_OK";
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Runs `ssh ... echo PODLIFT_SSH_OK` non-interactively.
pub struct SshCommandProbe {
    pub identity_file: Option<PathBuf>,
}

impl SshCommandProbe {
    pub fn args(&self, endpoint: &Endpoint, user: &str) -> Vec<String> {
        let mut args: Vec<String> = vec!["-p".into(), endpoint.port.to_string()];
        for opt in [
            "ConnectTimeout=10",
            "BatchMode=yes",
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
            "LogLevel=ERROR",
        ] {
            args.push("-o".into());
            args.push(opt.into());
        }
        if let Some(identity) = &self.identity_file
            && identity.exists()
        {
            args.push("-i".into());
            args.push(identity.display().to_string());
        }
        args.push(format!("{user}@{}", endpoint.host));
        args.push("echo".into());
        args.push(PROBE_TOKEN.into());
        args
    }
}

impl SshProbe for SshCommandProbe {
    async fn probe(&self, endpoint: &Endpoint, user: &str) -> Result<(), String> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.args(endpoint, user))
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("failed to run ssh: {e}")),
            Err(_) => return Err(format!("ssh timed out after {}s", PROBE_TIMEOUT.as_secs())),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() && stdout.contains(PROBE_TOKEN) {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("ssh {}: {}", output.status, stderr.trim()))
        }
    }
}

/// One observation reported to the caller while polling.
#[derive(Debug)]
pub enum PollEvent<'a> {
    QueryFailed(&'a PodliftError),
    NotReady,
    Snapshot(&'a InstanceSnapshot),
    ProbeFailed(&'a Endpoint, &'a str),
}

/// Query `id` every `budget.interval` until an endpoint is assigned and the
/// probe succeeds.
///
/// Provider errors count as "not yet ready". A terminal status aborts
/// immediately with `InstanceFailed`, and so does an instance that stops
/// being reported after it was seen. With `existing` set the instance is
/// assumed to be known to the provider from the first query on.
pub async fn wait_until_ready<P, S>(
    provider: &P,
    probe: &S,
    id: &str,
    user: &str,
    budget: PollBudget,
    existing: bool,
    mut on_event: impl FnMut(PollEvent<'_>),
) -> Result<Endpoint, PodliftError>
where
    P: Provider,
    S: SshProbe,
{
    let start = Instant::now();
    let mut attempt = 0u32;
    let mut seen = existing;

    while start.elapsed() < budget.timeout {
        attempt += 1;
        match provider.show_instance(id).await {
            Err(e) => {
                tracing::warn!(id, attempt, error = %e, "status query failed");
                on_event(PollEvent::QueryFailed(&e));
            }
            Ok(None) if seen => {
                tracing::warn!(id, attempt, "instance no longer reported");
                return Err(PodliftError::InstanceFailed {
                    id: id.to_string(),
                    message: "the provider no longer reports it (destroyed or terminated)".into(),
                });
            }
            Ok(None) => {
                tracing::debug!(id, attempt, "instance not reported yet");
                on_event(PollEvent::NotReady);
            }
            Ok(Some(snapshot)) => {
                seen = true;
                tracing::debug!(id, attempt, status = %snapshot.status, endpoint = ?snapshot.endpoint, "instance status");
                on_event(PollEvent::Snapshot(&snapshot));

                if snapshot.status.is_terminal() {
                    let message = snapshot
                        .status_message
                        .clone()
                        .unwrap_or_else(|| snapshot.status.to_string());
                    return Err(PodliftError::InstanceFailed {
                        id: id.to_string(),
                        message,
                    });
                }

                if let Some(endpoint) = &snapshot.endpoint {
                    match probe.probe(endpoint, user).await {
                        Ok(()) => {
                            tracing::info!(id, %endpoint, attempt, "instance reachable");
                            return Ok(endpoint.clone());
                        }
                        Err(reason) => {
                            tracing::debug!(id, %endpoint, %reason, "ssh probe failed");
                            on_event(PollEvent::ProbeFailed(endpoint, &reason));
                        }
                    }
                }
            }
        }

        tokio::time::sleep(budget.interval).await;
    }

    Err(PodliftError::ReadinessTimeout {
        id: id.to_string(),
        waited: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::provider::InstanceStatus;
    use crate::provider::fake::{FakeProvider, Reply};

    struct AlwaysOk;
    impl SshProbe for AlwaysOk {
        async fn probe(&self, _endpoint: &Endpoint, _user: &str) -> Result<(), String> {
            Ok(())
        }
    }

    /// Fails the first `failures` probes.
    struct Flaky {
        failures: Cell<u32>,
    }
    impl SshProbe for Flaky {
        async fn probe(&self, _endpoint: &Endpoint, _user: &str) -> Result<(), String> {
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err("connection refused".into());
            }
            Ok(())
        }
    }

    fn snapshot(status: InstanceStatus, endpoint: Option<Endpoint>) -> Reply {
        Reply::Snapshot(Some(InstanceSnapshot {
            id: "1001".into(),
            status,
            endpoint,
            status_message: None,
            gpu_name: None,
            price_per_hour: None,
        }))
    }

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "203.0.113.9".into(),
            port: 40122,
        }
    }

    fn budget() -> PollBudget {
        PollBudget {
            timeout: Duration::from_secs(300),
            interval: Duration::from_secs(20),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ready_on_third_query() {
        let provider = FakeProvider::with_replies(vec![
            Reply::Snapshot(None),
            snapshot(InstanceStatus::Starting, None),
            snapshot(InstanceStatus::Running, Some(endpoint())),
        ]);
        let got = wait_until_ready(&provider, &AlwaysOk, "1001", "root", budget(), false, |_| {})
            .await
            .unwrap();
        assert_eq!(got, endpoint());
        assert_eq!(provider.show_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn query_errors_are_retried() {
        let provider = FakeProvider::with_replies(vec![
            Reply::Error("502 bad gateway".into()),
            snapshot(InstanceStatus::Running, Some(endpoint())),
        ]);
        let mut failures = 0;
        wait_until_ready(&provider, &AlwaysOk, "1001", "root", budget(), false, |ev| {
            if matches!(ev, PollEvent::QueryFailed(_)) {
                failures += 1;
            }
        })
        .await
        .unwrap();
        assert_eq!(failures, 1);
        assert_eq!(provider.show_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_keeps_polling() {
        let provider =
            FakeProvider::with_replies(vec![snapshot(InstanceStatus::Running, Some(endpoint()))]);
        let probe = Flaky {
            failures: Cell::new(2),
        };
        wait_until_ready(&provider, &probe, "1001", "root", budget(), false, |_| {})
            .await
            .unwrap();
        assert_eq!(provider.show_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready_times_out() {
        let provider = FakeProvider::with_replies(vec![Reply::Snapshot(None)]);
        let start = Instant::now();
        let err = wait_until_ready(&provider, &AlwaysOk, "1001", "root", budget(), false, |_| {})
            .await
            .unwrap_err();
        match err {
            PodliftError::ReadinessTimeout { id, waited } => {
                assert_eq!(id, "1001");
                assert!(waited >= budget().timeout);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(start.elapsed() >= Duration::from_secs(300));
        // 0, 20, ..., 280 seconds
        assert_eq!(provider.show_count(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_state_aborts_immediately() {
        let provider = FakeProvider::with_replies(vec![
            snapshot(InstanceStatus::Starting, None),
            snapshot(InstanceStatus::Failed("pull access denied".into()), None),
            snapshot(InstanceStatus::Running, Some(endpoint())),
        ]);
        let err = wait_until_ready(&provider, &AlwaysOk, "1001", "root", budget(), false, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, PodliftError::InstanceFailed { .. }));
        assert!(err.is_readiness_failure());
        assert_eq!(provider.show_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_instance_fails() {
        let provider = FakeProvider::with_replies(vec![
            snapshot(InstanceStatus::Starting, None),
            Reply::Snapshot(None),
        ]);
        let err = wait_until_ready(&provider, &AlwaysOk, "1001", "root", budget(), false, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, PodliftError::InstanceFailed { .. }));
        assert_eq!(provider.show_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_existing_instance_fails_at_once() {
        let provider = FakeProvider::with_replies(vec![Reply::Snapshot(None)]);
        let err = wait_until_ready(&provider, &AlwaysOk, "1001", "root", budget(), true, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, PodliftError::InstanceFailed { ref id, .. } if id == "1001"));
        assert_eq!(provider.show_count(), 1);
    }

    #[test]
    fn probe_command_is_non_interactive() {
        let probe = SshCommandProbe {
            identity_file: None,
        };
        let args = probe.args(&endpoint(), "root");
        assert_eq!(&args[..2], ["-p", "40122"]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(!args.contains(&"-i".to_string()));
        assert_eq!(
            &args[args.len() - 3..],
            ["root@203.0.113.9", "echo", "PODLIFT_SSH_OK"]
        );
    }
}
