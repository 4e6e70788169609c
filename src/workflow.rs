//! Command orchestration: provision, poll, write the SSH block, tear down.
//!
//! Each command is a short sequence of numbered steps on a
//! [`StepProgress`]. Nothing here prompts; `main` owns the terminal.

use std::path::Path;

use crate::config::Config;
use crate::error::PodliftError;
use crate::logging;
use crate::marker::Marker;
use crate::progress::StepProgress;
use crate::provider::{Endpoint, InstanceSnapshot, Offer, Provider, ProviderKind};
use crate::provision::{self, ResourceRequest};
use crate::readiness::{self, PollBudget, PollEvent, SshProbe};
use crate::ssh_config::{self, HostEntry};

/// Where an instance ended up after `up` or `wait`.
#[derive(Debug, Clone)]
pub struct Ready {
    pub id: String,
    pub endpoint: Endpoint,
    pub alias: String,
}

pub const UP_STEPS: usize = 4;
pub const WAIT_STEPS: usize = 2;

/// Shared state for the commands that talk to a provider.
pub struct Workflow<'a, P> {
    pub config: &'a Config,
    pub provider: &'a P,
    pub marker: Marker,
    pub logs_dir: &'a Path,
}

pub fn poll_budget(config: &Config) -> PollBudget {
    PollBudget {
        timeout: config.poll_timeout(),
        interval: config.poll_interval(),
    }
}

pub fn host_entry(config: &Config, endpoint: &Endpoint) -> HostEntry {
    HostEntry::new(
        &config.ssh.alias,
        endpoint,
        &config.ssh.user,
        Some(config.ssh.identity_file.as_str()),
    )
}

impl<'a, P: Provider> Workflow<'a, P> {
    pub fn new(config: &'a Config, provider: &'a P, marker: Marker, logs_dir: &'a Path) -> Self {
        Self {
            config,
            provider,
            marker,
            logs_dir,
        }
    }

    fn kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    /// An explicit id, or the one recorded by the last `up`.
    pub fn resolve_id(&self, explicit: Option<String>) -> Result<String, PodliftError> {
        if let Some(id) = explicit {
            return Ok(id);
        }
        self.marker.read()?.ok_or_else(|| PodliftError::NoMarker {
            provider: self.kind().display_name().to_string(),
        })
    }

    // ── up ──────────────────────────────────────────────────────────

    /// Rent, wait for SSH, and write the host block.
    ///
    /// If the instance never becomes reachable its logs are fetched and it
    /// is destroyed (unless `keep_on_failure`); the readiness error is
    /// returned either way.
    pub async fn up<S: SshProbe>(
        &self,
        probe: &S,
        request: &ResourceRequest,
        keep_on_failure: bool,
        progress: &mut StepProgress,
    ) -> Result<Ready, PodliftError> {
        progress
            .run("Authorizing SSH key", |step| async move {
                match &request.launch.public_key {
                    Some(key) => {
                        // Best effort: the key also travels with the instance.
                        if let Err(e) = self.provider.register_ssh_key(key).await {
                            tracing::warn!(error = %e, "registering ssh key failed");
                            step.log(&format!("skipped: {e}"));
                        }
                        step.set_done_label("SSH key authorized");
                    }
                    None => step.set_done_label("No public key configured"),
                }
                Ok::<_, PodliftError>(())
            })
            .await?;

        let provisioned = progress
            .run("Renting instance", |step| async move {
                let p = provision::provision(self.provider, request, &self.marker).await?;
                step.set_done_label(format!(
                    "Rented {} at ${:.3}/hr (instance {})",
                    p.offer.gpu_name, p.offer.price_per_hour, p.id
                ));
                Ok::<_, PodliftError>(p)
            })
            .await?;
        if !provisioned.recorded {
            progress.info(&format!(
                "could not record instance {0}; pass the id explicitly, e.g. `podlift down {0}`",
                provisioned.id
            ));
        }

        let id = provisioned.id;
        let endpoint = match self.wait_step(probe, &id, false, progress).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                if e.is_readiness_failure() {
                    self.cleanup_failed(&id, keep_on_failure, progress).await;
                }
                return Err(e);
            }
        };

        self.write_config_step(&id, endpoint, progress).await
    }

    // ── wait ────────────────────────────────────────────────────────

    /// Poll an existing instance and write its host block.
    pub async fn wait<S: SshProbe>(
        &self,
        probe: &S,
        id: &str,
        progress: &mut StepProgress,
    ) -> Result<Ready, PodliftError> {
        let endpoint = self.wait_step(probe, id, true, progress).await?;
        self.write_config_step(id, endpoint, progress).await
    }

    async fn wait_step<S: SshProbe>(
        &self,
        probe: &S,
        id: &str,
        existing: bool,
        progress: &mut StepProgress,
    ) -> Result<Endpoint, PodliftError> {
        let budget = poll_budget(self.config);
        let user = self.config.ssh.user.as_str();
        let label = format!(
            "Waiting for SSH on instance {id} (up to {}s)",
            budget.timeout.as_secs()
        );

        progress
            .run(&label, |step| async move {
                let endpoint =
                    readiness::wait_until_ready(self.provider, probe, id, user, budget, existing, |event| {
                        match event {
                            PollEvent::QueryFailed(e) => step.log(&format!("status query failed: {e}")),
                            PollEvent::NotReady => step.log("not scheduled yet"),
                            PollEvent::Snapshot(s) => step.log(&describe(s)),
                            PollEvent::ProbeFailed(ep, reason) => {
                                step.log(&format!("ssh {ep} not ready: {reason}"))
                            }
                        }
                    })
                    .await?;
                step.set_done_label(format!("SSH reachable at {endpoint}"));
                Ok::<_, PodliftError>(endpoint)
            })
            .await
    }

    async fn write_config_step(
        &self,
        id: &str,
        endpoint: Endpoint,
        progress: &mut StepProgress,
    ) -> Result<Ready, PodliftError> {
        let path = self.config.ssh_config_path();
        let entry = host_entry(self.config, &endpoint);
        let label = format!("Writing Host {} to {}", entry.alias, path.display());
        let (target, block) = (&path, &entry);
        let notes = progress
            .run(&label, |_step| async move {
                ssh_config::write_host_entry(target, block)
            })
            .await?;
        for note in &notes {
            progress.info(note);
        }

        Ok(Ready {
            id: id.to_string(),
            endpoint,
            alias: entry.alias,
        })
    }

    /// Fetch and archive logs, then destroy. Failures here are logged and
    /// never replace the readiness error.
    async fn cleanup_failed(&self, id: &str, keep: bool, progress: &mut StepProgress) {
        match self.provider.instance_logs(id).await {
            Ok(logs) => {
                progress.println(&format!("── logs from instance {id} ──"));
                for line in logs.lines().rev().take(40).collect::<Vec<_>>().into_iter().rev() {
                    progress.println(line);
                }
                match logging::archive_instance_logs(self.logs_dir, self.kind().as_str(), id, &logs) {
                    Ok(path) => progress.info(&format!("full log saved to {}", path.display())),
                    Err(e) => tracing::error!(id, error = %e, "saving instance logs failed"),
                }
            }
            Err(e) => tracing::error!(id, error = %e, "fetching instance logs failed"),
        }

        if keep {
            progress.info(&format!(
                "instance {id} kept running; remove it with `podlift down {id}`"
            ));
            return;
        }

        match self.provider.destroy_instance(id).await {
            Ok(()) => {
                progress.info(&format!("instance {id} destroyed"));
                if let Err(e) = self.marker.clear_if(id) {
                    tracing::error!(id, error = %e, "clearing instance marker failed");
                }
            }
            Err(e) => {
                tracing::error!(id, error = %e, "destroying instance failed");
                progress.info(&format!(
                    "could not destroy instance {id}; it may still be billing: {e}"
                ));
            }
        }
    }

    // ── one-shot commands ───────────────────────────────────────────

    /// Satisfying offers, cheapest first.
    pub async fn offers(&self, request: &ResourceRequest) -> Result<Vec<Offer>, PodliftError> {
        let all = self.provider.search_offers(&request.query).await?;
        Ok(provision::rank_offers(&all, &request.query)
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn status(&self, id: &str) -> Result<Option<InstanceSnapshot>, PodliftError> {
        self.provider.show_instance(id).await
    }

    pub async fn logs(&self, id: &str) -> Result<String, PodliftError> {
        self.provider.instance_logs(id).await
    }

    /// Destroy `id` and forget it if it is the recorded instance.
    pub async fn down(&self, id: &str) -> Result<(), PodliftError> {
        self.provider.destroy_instance(id).await?;
        tracing::info!(id, "instance destroyed");
        self.marker.clear_if(id)
    }

    /// The block `wait` would write, without probing or writing.
    pub async fn ssh_config_preview(&self, id: &str) -> Result<String, PodliftError> {
        let snapshot = self.provider.show_instance(id).await?;
        let endpoint = snapshot
            .and_then(|s| s.endpoint)
            .ok_or_else(|| self.kind().error(format!("instance {id} has no SSH endpoint yet")))?;
        Ok(host_entry(self.config, &endpoint).render())
    }
}

/// One-line progress description of a snapshot.
pub fn describe(snapshot: &InstanceSnapshot) -> String {
    let mut line = format!("status: {}", snapshot.status);
    if let Some(ep) = &snapshot.endpoint {
        line.push_str(&format!(", ssh {ep}"));
    }
    if let Some(msg) = &snapshot.status_message {
        line.push_str(&format!(" ({})", msg.trim()));
    }
    line
}
