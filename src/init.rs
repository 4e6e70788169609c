use std::path::Path;

use inquire::validator::Validation;
use inquire::{Confirm, CustomType, Select, Text};

use crate::config::validate_alias;
use crate::error::PodliftError;
use crate::provider::ProviderKind;

// ── wizard state ─────────────────────────────────────────

struct WizardConfig {
    provider: ProviderKind,
    gpu_type: String,
    gpu_count: u32,
    max_price: f64,
    disk_gb: u32,
    image: String,
    forward_env: Vec<String>,
    alias: String,
    user: String,
    identity_file: String,
}

// ── public entry point ───────────────────────────────────

pub fn run(defaults: bool, output_path: &Path) -> Result<(), PodliftError> {
    let shown = output_path.display().to_string();

    if output_path.exists() {
        if defaults {
            return Err(PodliftError::Validation {
                message: format!("{shown} already exists (use interactive mode to overwrite)"),
            });
        }
        let overwrite = Confirm::new(&format!("{shown} already exists. Overwrite?"))
            .with_default(false)
            .prompt()
            .map_err(map_inquire_err)?;
        if !overwrite {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let config = if defaults {
        default_config()
    } else {
        run_wizard()?
    };

    let toml = generate_toml(&config);
    std::fs::write(output_path, &toml).map_err(|e| PodliftError::ConfigWrite {
        path: shown.clone(),
        source: e,
    })?;

    println!("Created {shown}");
    println!(
        "Export {} and run `podlift up` to rent an instance.",
        config.provider.default_api_key_env()
    );
    Ok(())
}

// ── defaults ─────────────────────────────────────────────

fn default_config() -> WizardConfig {
    WizardConfig {
        provider: ProviderKind::Vast,
        gpu_type: "RTX_A5000".into(),
        gpu_count: 1,
        max_price: 0.3,
        disk_gb: 70,
        image: "motilin/huggingface-pytorch-ml:latest".into(),
        forward_env: Vec::new(),
        alias: "vast-ai-dev".into(),
        user: "root".into(),
        identity_file: "~/.ssh/id_ed25519".into(),
    }
}

// ── wizard step navigation ───────────────────────────────

enum WizardStep {
    Provider,
    Hardware,
    Image,
    Ssh,
    Done,
}

impl WizardStep {
    fn next(&self) -> Self {
        match self {
            Self::Provider => Self::Hardware,
            Self::Hardware => Self::Image,
            Self::Image => Self::Ssh,
            Self::Ssh | Self::Done => Self::Done,
        }
    }

    fn prev(&self) -> Self {
        match self {
            Self::Provider | Self::Hardware => Self::Provider,
            Self::Image => Self::Hardware,
            Self::Ssh => Self::Image,
            Self::Done => Self::Ssh,
        }
    }
}

// ── interactive wizard ───────────────────────────────────

fn run_wizard() -> Result<WizardConfig, PodliftError> {
    println!();

    let mut config = default_config();
    let mut step = WizardStep::Provider;

    // Esc on any step after the first goes back one step.
    loop {
        let result = match step {
            WizardStep::Provider => match prompt_provider() {
                Ok(kind) => {
                    config.provider = kind;
                    Ok(())
                }
                Err(PodliftError::SelectionCancelled) => return Err(PodliftError::SelectionCancelled),
                Err(e) => Err(e),
            },
            WizardStep::Hardware => prompt_hardware(&config).map(|(gpu_type, count, price, disk)| {
                config.gpu_type = gpu_type;
                config.gpu_count = count;
                config.max_price = price;
                config.disk_gb = disk;
            }),
            WizardStep::Image => prompt_image(&config).map(|(image, forward_env)| {
                config.image = image;
                config.forward_env = forward_env;
            }),
            WizardStep::Ssh => prompt_ssh(&config).map(|(alias, user, identity)| {
                config.alias = alias;
                config.user = user;
                config.identity_file = identity;
            }),
            WizardStep::Done => break,
        };

        match result {
            Ok(()) => step = step.next(),
            Err(PodliftError::SelectionCancelled) => step = step.prev(),
            Err(e) => return Err(e),
        }
    }

    Ok(config)
}

// ── wizard steps ─────────────────────────────────────────

fn prompt_provider() -> Result<ProviderKind, PodliftError> {
    let choice = Select::new("Provider:", vec!["Vast.ai", "RunPod"])
        .with_help_message("Where GPU instances are rented")
        .prompt()
        .map_err(map_inquire_err)?;
    Ok(if choice == "RunPod" {
        ProviderKind::RunPod
    } else {
        ProviderKind::Vast
    })
}

fn prompt_hardware(current: &WizardConfig) -> Result<(String, u32, f64, u32), PodliftError> {
    let gpu_type = Text::new("GPU type:")
        .with_default(&current.gpu_type)
        .with_help_message("e.g. 'RTX_A5000', 'RTX 4090', 'H100 SXM'")
        .with_validator(|input: &str| {
            if input.trim().is_empty() {
                Ok(Validation::Invalid("GPU type is required".into()))
            } else {
                Ok(Validation::Valid)
            }
        })
        .prompt()
        .map_err(map_inquire_err)?;

    let gpu_count: u32 = CustomType::new("GPU count:")
        .with_default(current.gpu_count)
        .with_error_message("Please enter a valid number")
        .with_validator(|val: &u32| {
            if *val >= 1 {
                Ok(Validation::Valid)
            } else {
                Ok(Validation::Invalid("Must be at least 1".into()))
            }
        })
        .prompt()
        .map_err(map_inquire_err)?;

    let max_price: f64 = CustomType::new("Max price (USD/hour):")
        .with_default(current.max_price)
        .with_help_message("Total for all GPUs; the cheapest offer under this is rented")
        .with_error_message("Please enter a price like 0.35")
        .with_validator(|val: &f64| {
            if *val > 0.0 {
                Ok(Validation::Valid)
            } else {
                Ok(Validation::Invalid("Must be positive".into()))
            }
        })
        .prompt()
        .map_err(map_inquire_err)?;

    let disk_gb: u32 = CustomType::new("Disk (GB):")
        .with_default(current.disk_gb)
        .with_error_message("Please enter a valid number")
        .with_validator(|val: &u32| {
            if *val >= 1 {
                Ok(Validation::Valid)
            } else {
                Ok(Validation::Invalid("Must be at least 1".into()))
            }
        })
        .prompt()
        .map_err(map_inquire_err)?;

    Ok((gpu_type.trim().to_string(), gpu_count, max_price, disk_gb))
}

fn prompt_image(current: &WizardConfig) -> Result<(String, Vec<String>), PodliftError> {
    let image = Text::new("Container image:")
        .with_default(&current.image)
        .prompt()
        .map_err(map_inquire_err)?;

    let forward = Text::new("Forward environment variables:")
        .with_default(&current.forward_env.join(" "))
        .with_help_message("Space-separated names copied into the instance, e.g. 'HUGGING_FACE_TOKEN'")
        .with_validator(|input: &str| {
            let bad = input.split_whitespace().find(|name| {
                !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                    || name.starts_with(|c: char| c.is_ascii_digit())
            });
            match bad {
                Some(name) => Ok(Validation::Invalid(format!("'{name}' is not a valid name").into())),
                None => Ok(Validation::Valid),
            }
        })
        .prompt()
        .map_err(map_inquire_err)?;

    Ok((
        image.trim().to_string(),
        forward.split_whitespace().map(str::to_string).collect(),
    ))
}

fn prompt_ssh(current: &WizardConfig) -> Result<(String, String, String), PodliftError> {
    let alias = Text::new("SSH host alias:")
        .with_default(&current.alias)
        .with_help_message("Written as a Host block to ~/.ssh/config")
        .with_validator(|input: &str| match validate_alias(input.trim()) {
            Ok(()) => Ok(Validation::Valid),
            Err(e) => Ok(Validation::Invalid(e.to_string().into())),
        })
        .prompt()
        .map_err(map_inquire_err)?;

    let user = Text::new("SSH user:")
        .with_default(&current.user)
        .prompt()
        .map_err(map_inquire_err)?;

    let identity = Text::new("SSH private key:")
        .with_default(&current.identity_file)
        .with_help_message("The matching .pub file is sent to the instance")
        .prompt()
        .map_err(map_inquire_err)?;

    Ok((
        alias.trim().to_string(),
        user.trim().to_string(),
        identity.trim().to_string(),
    ))
}

// ── TOML generation ──────────────────────────────────────

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn generate_toml(config: &WizardConfig) -> String {
    let mut out = String::new();

    out.push_str("[provider]\n");
    out.push_str(&format!("kind = {}\n", quote(config.provider.as_str())));
    out.push_str(&format!(
        "# api key is read from ${}\n",
        config.provider.default_api_key_env()
    ));
    out.push('\n');

    out.push_str("[instance]\n");
    out.push_str(&format!("image = {}\n", quote(&config.image)));
    out.push_str(&format!("gpu_type = {}\n", quote(&config.gpu_type)));
    out.push_str(&format!("gpu_count = {}\n", config.gpu_count));
    out.push_str(&format!("max_price = {:?}\n", config.max_price));
    out.push_str(&format!("disk_gb = {}\n", config.disk_gb));
    if config.forward_env.is_empty() {
        out.push_str("# forward_env = [\"HUGGING_FACE_TOKEN\"]\n");
    } else {
        let names: Vec<String> = config.forward_env.iter().map(|n| quote(n)).collect();
        out.push_str(&format!("forward_env = [{}]\n", names.join(", ")));
    }
    out.push_str("# ports = [8080]\n");
    if config.provider == ProviderKind::RunPod {
        out.push_str("# RunPod runs onstart as the container command, replacing the image's\n");
        out.push_str("# entrypoint; it must be one command and the image must still start sshd.\n");
    }
    out.push_str("# onstart = \"bash /workspace/start.sh\"\n");
    out.push('\n');

    out.push_str("[ssh]\n");
    out.push_str(&format!("alias = {}\n", quote(&config.alias)));
    out.push_str(&format!("user = {}\n", quote(&config.user)));
    out.push_str(&format!("identity_file = {}\n", quote(&config.identity_file)));
    out.push_str(&format!("public_key = {}\n", quote(&format!("{}.pub", config.identity_file))));
    out.push('\n');

    out.push_str("# [poll]\n");
    out.push_str("# timeout_s = 300\n");
    out.push_str("# interval_s = 20\n");
    out.push_str("#\n");
    out.push_str("# [transfer]\n");
    out.push_str("# flags = [\"-avz\", \"--progress\"]\n");

    out
}

// ── error mapping ────────────────────────────────────────

fn map_inquire_err(e: inquire::InquireError) -> PodliftError {
    match e {
        inquire::InquireError::OperationCanceled | inquire::InquireError::OperationInterrupted => {
            PodliftError::SelectionCancelled
        }
        other => PodliftError::Validation {
            message: format!("prompt error: {other}"),
        },
    }
}

// ── tests ────────────────────────────────────────────────
