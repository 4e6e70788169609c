use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PodliftError {
    #[error("failed to load config from {path}")]
    #[diagnostic(help("run `podlift init` to create one"))]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("failed to write {path}")]
    ConfigWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("environment variable {name} is not set")]
    #[diagnostic(help("{hint}"))]
    MissingEnv { name: String, hint: String },

    #[error("ssh config error in {path}: {message}")]
    SshConfig { path: String, message: String },

    #[error("no offer matches {gpu_count}x {gpu_type} at <= ${max_price}/hr with >= {disk_gb} GB disk")]
    #[diagnostic(help("raise [instance] max_price or pick another gpu_type"))]
    NoOfferAvailable {
        gpu_type: String,
        gpu_count: u32,
        max_price: f64,
        disk_gb: u32,
    },

    #[error("{provider} API error: {message}")]
    Provider { provider: String, message: String },

    #[error("instance {id} was not reachable over SSH after {}s", .waited.as_secs())]
    #[diagnostic(help("inspect it with `podlift logs {id}` and remove it with `podlift down {id}`"))]
    ReadinessTimeout { id: String, waited: Duration },

    #[error("instance {id} entered a failed state: {message}")]
    InstanceFailed { id: String, message: String },

    #[error("no SSH hosts found in {path}")]
    NoHostConfigured { path: String },

    #[error("several SSH hosts are configured: {}", .aliases.join(", "))]
    #[diagnostic(help("choose one with --host <ALIAS>"))]
    AmbiguousHostSelection { aliases: Vec<String> },

    #[error("rsync exited with {status}\n{stderr}")]
    Transfer { status: String, stderr: String },

    #[error("no instance recorded for {provider}")]
    #[diagnostic(help("pass an instance id explicitly or run `podlift up`"))]
    NoMarker { provider: String },

    #[error("selection cancelled")]
    SelectionCancelled,

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl PodliftError {
    /// Whether the readiness poller gave up on this instance, in which case
    /// the caller should collect logs and tear it down.
    pub fn is_readiness_failure(&self) -> bool {
        matches!(
            self,
            PodliftError::ReadinessTimeout { .. } | PodliftError::InstanceFailed { .. }
        )
    }
}
