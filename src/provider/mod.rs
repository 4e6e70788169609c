//! Cloud GPU providers.
//!
//! Each provider is an HTTP client behind [`Provider`]. The provisioner and
//! the readiness poller only see this trait, so tests drive them with an
//! in-memory fake.

pub mod runpod;
pub mod vast;

#[cfg(test)]
pub mod fake;

use std::fmt;
use std::str::FromStr;

use crate::config::Config;
use crate::error::PodliftError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Vast,
    RunPod,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Vast => "vast",
            ProviderKind::RunPod => "runpod",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ProviderKind::Vast => "Vast.ai",
            ProviderKind::RunPod => "RunPod",
        }
    }

    pub fn default_api_key_env(self) -> &'static str {
        match self {
            ProviderKind::Vast => "VASTAI_API_KEY",
            ProviderKind::RunPod => "RUNPOD_API_KEY",
        }
    }

    pub fn default_api_url(self) -> &'static str {
        match self {
            ProviderKind::Vast => vast::DEFAULT_API_URL,
            ProviderKind::RunPod => runpod::DEFAULT_API_URL,
        }
    }

    /// Build a `PodliftError::Provider` attributed to this provider.
    pub fn error(self, message: impl Into<String>) -> PodliftError {
        PodliftError::Provider {
            provider: self.display_name().to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = PodliftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vast" | "vastai" | "vast.ai" => Ok(ProviderKind::Vast),
            "runpod" => Ok(ProviderKind::RunPod),
            other => Err(PodliftError::Validation {
                message: format!("unknown provider '{other}' (expected 'vast' or 'runpod')"),
            }),
        }
    }
}

// ── Shared vocabulary ───────────────────────────────────────────────

/// A rentable configuration advertised by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    /// Provider-side id: a Vast.ai ask id or a RunPod GPU type id.
    pub id: String,
    pub gpu_name: String,
    pub gpu_count: u32,
    /// Total hourly price in USD.
    pub price_per_hour: f64,
    /// Disk available in GB. `0.0` means allocated on demand.
    pub disk_gb: f64,
    pub location: Option<String>,
}

/// Hardware constraints for an offer search.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferQuery {
    pub gpu_type: String,
    pub gpu_count: u32,
    pub max_price: f64,
    pub disk_gb: u32,
}

/// What to run on the instance once an offer is chosen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSpec {
    pub image: String,
    pub disk_gb: u32,
    pub gpu_count: u32,
    pub env: Vec<(String, String)>,
    pub onstart: Option<String>,
    /// Extra TCP ports; SSH is always exposed.
    pub ports: Vec<u16>,
    /// Public key authorized on the instance.
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Provider-reported lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Creating,
    Starting,
    Running,
    Exited,
    Failed(String),
    Unknown(String),
}

impl InstanceStatus {
    /// States from which the instance will never accept SSH.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Exited | InstanceStatus::Failed(_))
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Creating => f.write_str("creating"),
            InstanceStatus::Starting => f.write_str("starting"),
            InstanceStatus::Running => f.write_str("running"),
            InstanceStatus::Exited => f.write_str("exited"),
            InstanceStatus::Failed(msg) => write!(f, "failed ({msg})"),
            InstanceStatus::Unknown(raw) if raw.is_empty() => f.write_str("initializing"),
            InstanceStatus::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// One status query result. The local copy may already be stale.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSnapshot {
    pub id: String,
    pub status: InstanceStatus,
    /// SSH endpoint once the provider has assigned one.
    pub endpoint: Option<Endpoint>,
    pub status_message: Option<String>,
    pub gpu_name: Option<String>,
    pub price_per_hour: Option<f64>,
}

// ── Provider trait ──────────────────────────────────────────────────

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Provider {
    fn kind(&self) -> ProviderKind;

    /// Offers matching `query`. Providers may pre-filter server-side; the
    /// final choice is made by [`crate::provision::select_offer`].
    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>, PodliftError>;

    /// Rent `offer` and start `spec` on it. Billing starts on success.
    async fn create_instance(&self, offer: &Offer, spec: &LaunchSpec)
    -> Result<String, PodliftError>;

    /// Current state, or `None` while the provider has no record or network
    /// block for the instance yet.
    async fn show_instance(&self, id: &str) -> Result<Option<InstanceSnapshot>, PodliftError>;

    async fn instance_logs(&self, id: &str) -> Result<String, PodliftError>;

    async fn destroy_instance(&self, id: &str) -> Result<(), PodliftError>;

    /// Authorize `public_key` on the provider account. Providers that only
    /// accept keys per instance treat this as a no-op.
    async fn register_ssh_key(&self, public_key: &str) -> Result<(), PodliftError>;
}

// ── Configured provider ─────────────────────────────────────────────

/// The provider selected in `podlift.toml`.
pub enum Backend {
    Vast(vast::VastClient),
    RunPod(runpod::RunPodClient),
}

/// Build the configured provider, reading the API key from the environment.
pub fn create_backend(config: &Config) -> Result<Backend, PodliftError> {
    let kind = config.provider_kind()?;
    let key_env = config.api_key_env()?;
    let api_key = std::env::var(&key_env)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| PodliftError::MissingEnv {
            name: key_env.clone(),
            hint: format!("export {key_env}=<your {} API key>", kind.display_name()),
        })?;
    let base_url = if config.provider.api_url.is_empty() {
        kind.default_api_url().to_string()
    } else {
        config.provider.api_url.trim_end_matches('/').to_string()
    };

    Ok(match kind {
        ProviderKind::Vast => Backend::Vast(vast::VastClient::new(base_url, api_key)?),
        ProviderKind::RunPod => Backend::RunPod(runpod::RunPodClient::new(base_url, api_key)?),
    })
}

impl Provider for Backend {
    fn kind(&self) -> ProviderKind {
        match self {
            Backend::Vast(p) => p.kind(),
            Backend::RunPod(p) => p.kind(),
        }
    }

    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>, PodliftError> {
        match self {
            Backend::Vast(p) => p.search_offers(query).await,
            Backend::RunPod(p) => p.search_offers(query).await,
        }
    }

    async fn create_instance(
        &self,
        offer: &Offer,
        spec: &LaunchSpec,
    ) -> Result<String, PodliftError> {
        match self {
            Backend::Vast(p) => p.create_instance(offer, spec).await,
            Backend::RunPod(p) => p.create_instance(offer, spec).await,
        }
    }

    async fn show_instance(&self, id: &str) -> Result<Option<InstanceSnapshot>, PodliftError> {
        match self {
            Backend::Vast(p) => p.show_instance(id).await,
            Backend::RunPod(p) => p.show_instance(id).await,
        }
    }

    async fn instance_logs(&self, id: &str) -> Result<String, PodliftError> {
        match self {
            Backend::Vast(p) => p.instance_logs(id).await,
            Backend::RunPod(p) => p.instance_logs(id).await,
        }
    }

    async fn destroy_instance(&self, id: &str) -> Result<(), PodliftError> {
        match self {
            Backend::Vast(p) => p.destroy_instance(id).await,
            Backend::RunPod(p) => p.destroy_instance(id).await,
        }
    }

    async fn register_ssh_key(&self, public_key: &str) -> Result<(), PodliftError> {
        match self {
            Backend::Vast(p) => p.register_ssh_key(public_key).await,
            Backend::RunPod(p) => p.register_ssh_key(public_key).await,
        }
    }
}

// ── HTTP helpers ────────────────────────────────────────────────────

const HTTP_TIMEOUT_SECS: u64 = 30;

pub(crate) fn http_client(kind: ProviderKind) -> Result<reqwest::Client, PodliftError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
        .user_agent(concat!("podlift/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| kind.error(format!("building HTTP client: {e}")))
}

/// Send a request and return the body text of a 2xx response. Non-2xx
/// responses become provider errors carrying the body, which usually holds
/// the provider's own explanation.
pub(crate) async fn send(
    kind: ProviderKind,
    what: &str,
    request: reqwest::RequestBuilder,
) -> Result<String, PodliftError> {
    let response = request
        .send()
        .await
        .map_err(|e| kind.error(format!("{what}: request failed: {e}")))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| kind.error(format!("{what}: reading response: {e}")))?;
    tracing::debug!(provider = %kind, what, %status, bytes = body.len(), "provider response");

    if !status.is_success() {
        let detail = body.trim();
        return Err(kind.error(if detail.is_empty() {
            format!("{what}: HTTP {status}")
        } else {
            format!("{what}: HTTP {status}: {}", truncate(detail, 500))
        }));
    }
    Ok(body)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
