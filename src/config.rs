use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::PodliftError;
use crate::provider::ProviderKind;
use crate::util::expand_home;

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ProviderConfig {
    #[facet(default = "vast")]
    pub kind: String,
    /// Name of the environment variable holding the API key.
    /// Empty means the provider's conventional name.
    #[facet(default)]
    pub api_key_env: String,
    /// Base URL override. Empty means the provider's public endpoint.
    #[facet(default)]
    pub api_url: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "vast".into(),
            api_key_env: String::new(),
            api_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct InstanceConfig {
    #[facet(default = "motilin/huggingface-pytorch-ml:latest")]
    pub image: String,
    #[facet(default = "RTX_A5000")]
    pub gpu_type: String,
    #[facet(default = 1)]
    pub gpu_count: u32,
    /// Maximum hourly price in USD.
    #[facet(default = 0.3)]
    pub max_price: f64,
    #[facet(default = 70)]
    pub disk_gb: u32,
    /// Environment variables copied from the local environment into the
    /// instance. Each one must be set.
    #[facet(default)]
    pub forward_env: Vec<String>,
    /// Literal environment variables for the instance.
    #[facet(default)]
    pub env: BTreeMap<String, String>,
    /// Extra TCP ports to expose besides SSH.
    #[facet(default)]
    pub ports: Vec<u16>,
    /// Script run by the instance on start. Passed through untouched.
    #[facet(default)]
    pub onstart: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            image: "motilin/huggingface-pytorch-ml:latest".into(),
            gpu_type: "RTX_A5000".into(),
            gpu_count: 1,
            max_price: 0.3,
            disk_gb: 70,
            forward_env: Vec::new(),
            env: BTreeMap::new(),
            ports: Vec::new(),
            onstart: String::new(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct SshConfig {
    #[facet(default = "vast-ai-dev")]
    pub alias: String,
    #[facet(default = "root")]
    pub user: String,
    /// OpenSSH client config that receives the host block.
    #[facet(default = "~/.ssh/config")]
    pub config_file: String,
    #[facet(default = "~/.ssh/id_ed25519")]
    pub identity_file: String,
    #[facet(default = "~/.ssh/id_ed25519.pub")]
    pub public_key: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            alias: "vast-ai-dev".into(),
            user: "root".into(),
            config_file: "~/.ssh/config".into(),
            identity_file: "~/.ssh/id_ed25519".into(),
            public_key: "~/.ssh/id_ed25519.pub".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct PollConfig {
    #[facet(default = 300)]
    pub timeout_s: u64,
    #[facet(default = 20)]
    pub interval_s: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout_s: 300,
            interval_s: 20,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct TransferConfig {
    #[facet(default = "rsync")]
    pub rsync: String,
    #[facet(default)]
    pub flags: Vec<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            rsync: "rsync".into(),
            flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
pub struct Config {
    #[facet(default)]
    pub provider: ProviderConfig,
    #[facet(default)]
    pub instance: InstanceConfig,
    #[facet(default)]
    pub ssh: SshConfig,
    #[facet(default)]
    pub poll: PollConfig,
    #[facet(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Provider kind. Validated at load time, so parsing cannot fail here
    /// for a config produced by [`load_config`].
    pub fn provider_kind(&self) -> Result<ProviderKind, PodliftError> {
        self.provider.kind.parse()
    }

    /// Environment variable that carries the provider API key.
    pub fn api_key_env(&self) -> Result<String, PodliftError> {
        if !self.provider.api_key_env.is_empty() {
            return Ok(self.provider.api_key_env.clone());
        }
        Ok(self.provider_kind()?.default_api_key_env().to_string())
    }

    pub fn ssh_config_path(&self) -> PathBuf {
        expand_home(&self.ssh.config_file)
    }

    pub fn identity_file(&self) -> Option<PathBuf> {
        if self.ssh.identity_file.is_empty() {
            None
        } else {
            Some(expand_home(&self.ssh.identity_file))
        }
    }

    pub fn public_key_path(&self) -> PathBuf {
        expand_home(&self.ssh.public_key)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll.timeout_s)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll.interval_s)
    }

    pub fn rsync_flags(&self) -> Vec<String> {
        if self.transfer.flags.is_empty() {
            vec!["-avz".into(), "--progress".into()]
        } else {
            self.transfer.flags.clone()
        }
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), PodliftError> {
    let kind = config.provider_kind()?;

    let instance = &config.instance;
    if instance.image.trim().is_empty() {
        return Err(PodliftError::Validation {
            message: "instance.image must not be empty".into(),
        });
    }
    if instance.gpu_type.trim().is_empty() {
        return Err(PodliftError::Validation {
            message: "instance.gpu_type must not be empty".into(),
        });
    }
    if instance.gpu_count < 1 {
        return Err(PodliftError::Validation {
            message: "instance.gpu_count must be at least 1".into(),
        });
    }
    if !(instance.max_price > 0.0) {
        return Err(PodliftError::Validation {
            message: format!("instance.max_price must be positive (got {})", instance.max_price),
        });
    }
    if instance.disk_gb < 1 {
        return Err(PodliftError::Validation {
            message: "instance.disk_gb must be at least 1".into(),
        });
    }
    for name in instance.forward_env.iter().chain(instance.env.keys()) {
        validate_env_name(name)?;
    }
    // RunPod passes onstart as the container's start command, replacing the
    // image entrypoint that launches sshd; keep it to a single command.
    if kind == ProviderKind::RunPod && instance.onstart.trim().contains('\n') {
        return Err(PodliftError::Validation {
            message: "instance.onstart must be a single command for RunPod; put longer scripts in a file inside the image".into(),
        });
    }
    if instance.ports.contains(&22) {
        return Err(PodliftError::Validation {
            message: "instance.ports must not list 22, SSH is always exposed".into(),
        });
    }

    validate_alias(&config.ssh.alias)?;
    if config.ssh.user.trim().is_empty() || config.ssh.user.contains(char::is_whitespace) {
        return Err(PodliftError::Validation {
            message: format!("ssh.user must be a single word (got '{}')", config.ssh.user),
        });
    }
    if config.ssh.config_file.trim().is_empty() {
        return Err(PodliftError::Validation {
            message: "ssh.config_file must not be empty".into(),
        });
    }

    if config.poll.interval_s < 1 {
        return Err(PodliftError::Validation {
            message: "poll.interval_s must be at least 1".into(),
        });
    }
    if config.poll.timeout_s < config.poll.interval_s {
        return Err(PodliftError::Validation {
            message: "poll.timeout_s must be at least poll.interval_s".into(),
        });
    }

    if config.transfer.rsync.trim().is_empty() {
        return Err(PodliftError::Validation {
            message: "transfer.rsync must not be empty".into(),
        });
    }

    Ok(())
}

/// An alias becomes a `Host` pattern, so it must be one token without
/// pattern metacharacters.
pub fn validate_alias(alias: &str) -> Result<(), PodliftError> {
    let valid = !alias.is_empty()
        && !alias.starts_with('!')
        && alias
            .chars()
            .all(|c| !c.is_whitespace() && c != '*' && c != '?' && c != ',' && c != '"');
    if !valid {
        return Err(PodliftError::Validation {
            message: format!("ssh.alias must be a single host name without patterns (got '{alias}')"),
        });
    }
    Ok(())
}

fn validate_env_name(name: &str) -> Result<(), PodliftError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(PodliftError::Validation {
            message: format!("invalid environment variable name '{name}'"),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn parse_config(contents: &str, path: &Path) -> Result<Config, PodliftError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| PodliftError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config, PodliftError> {
    let contents = std::fs::read_to_string(path).map_err(|source| PodliftError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&contents, path)
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn parse(toml: &str) -> Result<Config, PodliftError> {
        parse_config(toml, Path::new("podlift.toml"))
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.provider.kind, "vast");
        assert_eq!(config.instance.gpu_type, "RTX_A5000");
        assert_eq!(config.instance.gpu_count, 1);
        assert_eq!(config.instance.disk_gb, 70);
        assert_eq!(config.ssh.alias, "vast-ai-dev");
        assert_eq!(config.ssh.user, "root");
        assert_eq!(config.poll.timeout_s, 300);
        assert_eq!(config.poll.interval_s, 20);
        assert_eq!(config.rsync_flags(), vec!["-avz", "--progress"]);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[provider]
kind = "runpod"
api_key_env = "MY_RUNPOD_KEY"

[instance]
image = "runpod/pytorch:2.1.0-py3.10-cuda11.8.0-devel"
gpu_type = "NVIDIA RTX A5000"
gpu_count = 2
max_price = 0.55
disk_gb = 100
forward_env = ["HUGGING_FACE_TOKEN"]
ports = [8080, 8888]
onstart = "echo hi"

[instance.env]
MODE = "dev"

[ssh]
alias = "gpu-box"
user = "ubuntu"

[poll]
timeout_s = 600
interval_s = 10

[transfer]
flags = ["-az"]
"#;
        let config = parse(toml).unwrap();
        assert_eq!(config.provider_kind().unwrap(), ProviderKind::RunPod);
        assert_eq!(config.api_key_env().unwrap(), "MY_RUNPOD_KEY");
        assert_eq!(config.instance.gpu_count, 2);
        assert_eq!(config.instance.ports, vec![8080, 8888]);
        assert_eq!(config.instance.env["MODE"], "dev");
        assert_eq!(config.ssh.alias, "gpu-box");
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.rsync_flags(), vec!["-az"]);
    }

    #[test]
    fn default_api_key_env_follows_provider() {
        let config = parse("[provider]\nkind = \"vast\"\n").unwrap();
        assert_eq!(config.api_key_env().unwrap(), "VASTAI_API_KEY");
        let config = parse("[provider]\nkind = \"runpod\"\n").unwrap();
        assert_eq!(config.api_key_env().unwrap(), "RUNPOD_API_KEY");
    }

    #[test]
    fn unknown_provider_rejected() {
        assert!(parse("[provider]\nkind = \"lambda\"\n").is_err());
    }

    #[test]
    fn multi_line_onstart_rejected_for_runpod() {
        let script = "[instance]\nonstart = \"apt-get update\\nbash /workspace/start.sh\"\n";
        assert!(parse(&format!("[provider]\nkind = \"vast\"\n{script}")).is_ok());
        let err = parse(&format!("[provider]\nkind = \"runpod\"\n{script}")).unwrap_err();
        assert!(matches!(err, PodliftError::Validation { ref message } if message.contains("onstart")));
        assert!(parse("[provider]\nkind = \"runpod\"\n[instance]\nonstart = \"bash /start.sh\"\n").is_ok());
    }

    #[test]
    fn non_positive_price_rejected() {
        assert!(parse("[instance]\nmax_price = 0.0\n").is_err());
        assert!(parse("[instance]\nmax_price = -1.0\n").is_err());
    }

    #[test]
    fn zero_gpus_rejected() {
        assert!(parse("[instance]\ngpu_count = 0\n").is_err());
    }

    #[test]
    fn ssh_port_in_extra_ports_rejected() {
        assert!(parse("[instance]\nports = [22]\n").is_err());
    }

    #[test]
    fn bad_env_names_rejected() {
        assert!(parse("[instance]\nforward_env = [\"1BAD\"]\n").is_err());
        assert!(parse("[instance]\nforward_env = [\"HAS-DASH\"]\n").is_err());
        parse("[instance]\nforward_env = [\"_OK_1\"]\n").unwrap();
    }

    #[test]
    fn alias_patterns_rejected() {
        for alias in ["", "a b", "gpu-*", "gpu?", "!gpu", "a,b"] {
            assert!(validate_alias(alias).is_err(), "expected '{alias}' to be rejected");
        }
        for alias in ["vast-ai-dev", "gpu.box", "pod_1"] {
            validate_alias(alias).unwrap();
        }
    }

    #[test]
    fn poll_timeout_shorter_than_interval_rejected() {
        assert!(parse("[poll]\ntimeout_s = 5\ninterval_s = 10\n").is_err());
        assert!(parse("[poll]\ninterval_s = 0\n").is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/podlift.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/podlift.toml"));
    }
}
