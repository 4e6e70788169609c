use std::io::IsTerminal;

use clap::Parser;
use console::style;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use podlift::cli::{Cli, Command};
use podlift::config::{self, Config};
use podlift::error::PodliftError;
use podlift::logging;
use podlift::marker::Marker;
use podlift::progress::{OutputMode, StepProgress};
use podlift::provider::{self, Provider};
use podlift::provision::ResourceRequest;
use podlift::readiness::SshCommandProbe;
use podlift::ssh_config;
use podlift::transfer::{Direction, Rsync, Scope, TransferRequest};
use podlift::workflow::{self, Workflow};

#[tokio::main(flavor = "current_thread")]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let mode = resolve_output_mode(cli.verbose, cli.quiet);

    // Tracing to stderr fights indicatif for the terminal, so it stays off
    // while spinners are drawn.
    let terminal_filter = match mode {
        OutputMode::Verbose => EnvFilter::new("podlift=debug"),
        OutputMode::Normal | OutputMode::Quiet => EnvFilter::new("off"),
        OutputMode::Plain => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("podlift=info")),
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures podlift=debug, discards until activated
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("podlift=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    // init creates the config, so it runs before loading one
    if let Command::Init { defaults } = cli.command {
        return podlift::init::run(defaults, &cli.config).map_err(Into::into);
    }

    let config = config::load_config(&cli.config)?;
    let logs_dir = podlift::paths::logs_dir();

    // Activate file logging for commands that wait on an instance
    if matches!(cli.command, Command::Up { .. } | Command::Wait { .. }) {
        if let Err(e) = file_handle.set_file(&logs_dir.join("podlift.log")) {
            tracing::warn!(error = %e, "file logging disabled");
        }
    }

    match cli.command {
        Command::Init { .. } => unreachable!(),
        Command::Hosts => {
            let path = config.ssh_config_path();
            for alias in ssh_config::collect_aliases(&path)? {
                println!("{alias}");
            }
        }
        Command::Push {
            local,
            remote,
            recursive,
            host,
        } => {
            run_transfer(&config, Direction::Upload, recursive, local, remote, host).await?;
        }
        Command::Pull {
            remote,
            local,
            recursive,
            host,
        } => {
            run_transfer(&config, Direction::Download, recursive, local, remote, host).await?;
        }
        Command::Logs { saved: true, .. } => {
            let Some(path) = logging::latest_archived_log(&logs_dir) else {
                println!("No saved instance logs in {}", logs_dir.display());
                return Ok(());
            };
            let contents = std::fs::read_to_string(&path).map_err(|e| PodliftError::Io {
                context: format!("reading {}", path.display()),
                source: e,
            })?;
            eprintln!("{}", style(path.display()).dim());
            print!("{contents}");
        }
        command => {
            let backend = provider::create_backend(&config)?;
            let marker = Marker::new(podlift::paths::marker_path(backend.kind()));
            let wf = Workflow::new(&config, &backend, marker, &logs_dir);
            run_provider_command(&wf, command, mode).await?;
        }
    }

    Ok(())
}

async fn run_provider_command<P: Provider>(
    wf: &Workflow<'_, P>,
    command: Command,
    mode: OutputMode,
) -> Result<(), PodliftError> {
    let config = wf.config;
    let probe = SshCommandProbe {
        identity_file: config.identity_file(),
    };

    match command {
        Command::Offers { limit } => {
            let request = ResourceRequest::from_config(config, |n| std::env::var(n).ok())?;
            let offers = wf.offers(&request).await?;
            if offers.is_empty() {
                println!("No offers match the [instance] requirements.");
            }
            for offer in offers.iter().take(limit) {
                println!(
                    "{:>12}  {:<24} x{}  ${:.3}/hr  {}  {}",
                    offer.id,
                    offer.gpu_name,
                    offer.gpu_count,
                    offer.price_per_hour,
                    if offer.disk_gb > 0.0 {
                        format!("{:.0} GB", offer.disk_gb)
                    } else {
                        "disk on demand".into()
                    },
                    offer.location.as_deref().unwrap_or("")
                );
            }
        }
        Command::Up { keep_on_failure } => {
            let request = ResourceRequest::from_config(config, |n| std::env::var(n).ok())?;
            let mut progress = StepProgress::new(workflow::UP_STEPS, mode);
            let ready = wf.up(&probe, &request, keep_on_failure, &mut progress).await?;
            print_ready(&ready, &progress);
        }
        Command::Wait { id } => {
            let id = wf.resolve_id(id)?;
            let mut progress = StepProgress::new(workflow::WAIT_STEPS, mode);
            let ready = wf.wait(&probe, &id, &mut progress).await?;
            print_ready(&ready, &progress);
        }
        Command::Status { id } => {
            let id = wf.resolve_id(id)?;
            match wf.status(&id).await? {
                Some(snapshot) => {
                    println!("Instance {}: {}", snapshot.id, snapshot.status);
                    if let Some(ep) = &snapshot.endpoint {
                        println!("  SSH: {ep}");
                    }
                    if let Some(gpu) = &snapshot.gpu_name {
                        println!("  GPU: {gpu}");
                    }
                    if let Some(price) = snapshot.price_per_hour {
                        println!("  Price: ${price:.3}/hr");
                    }
                    if let Some(msg) = &snapshot.status_message {
                        println!("  Message: {}", msg.trim());
                    }
                }
                None => println!("Instance {id}: not found"),
            }
        }
        Command::Logs { id, .. } => {
            let id = wf.resolve_id(id)?;
            print!("{}", wf.logs(&id).await?);
        }
        Command::Down { id } => {
            let id = wf.resolve_id(id)?;
            wf.down(&id).await?;
            println!("Destroyed instance {id}");
        }
        Command::SshConfig { id } => {
            let id = wf.resolve_id(id)?;
            print!("{}", wf.ssh_config_preview(&id).await?);
        }
        Command::Init { .. }
        | Command::Hosts
        | Command::Push { .. }
        | Command::Pull { .. } => unreachable!(),
    }
    Ok(())
}

fn print_ready(ready: &workflow::Ready, progress: &StepProgress) {
    progress.println("");
    progress.println(&format!(
        "{} instance {} is ready at {}",
        style("✓").green(),
        ready.id,
        ready.endpoint
    ));
    progress.println(&format!("  connect:  ssh {}", style(&ready.alias).bold()));
    progress.println(&format!(
        "  upload:   podlift push -r ./project /workspace/project --host {}",
        ready.alias
    ));
    progress.println(&format!("  teardown: podlift down {}", ready.id));
}

async fn run_transfer(
    config: &Config,
    direction: Direction,
    recursive: bool,
    local: std::path::PathBuf,
    remote: String,
    host: Option<String>,
) -> Result<(), PodliftError> {
    let alias = resolve_host(config, host)?;
    let request = TransferRequest {
        direction,
        scope: if recursive { Scope::Folder } else { Scope::File },
        alias,
        local,
        remote,
    };
    Rsync::from_config(config).run(&request).await
}

/// Pick the transfer target, prompting when several hosts are configured
/// and a terminal is attached.
fn resolve_host(config: &Config, explicit: Option<String>) -> Result<String, PodliftError> {
    let path = config.ssh_config_path();

    if explicit.is_some() {
        // An explicit alias works even without a readable config file.
        let aliases = ssh_config::collect_aliases(&path).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "alias discovery failed");
            Vec::new()
        });
        return ssh_config::select_alias(&aliases, explicit.as_deref(), &path);
    }

    let aliases = ssh_config::collect_aliases(&path)?;
    match ssh_config::select_alias(&aliases, None, &path) {
        Err(PodliftError::AmbiguousHostSelection { aliases }) if std::io::stdin().is_terminal() => {
            let default = aliases
                .iter()
                .position(|a| *a == config.ssh.alias)
                .unwrap_or(0);
            inquire::Select::new("Host:", aliases)
                .with_starting_cursor(default)
                .prompt()
                .map_err(|_| PodliftError::SelectionCancelled)
        }
        other => other,
    }
}

fn resolve_output_mode(verbose: bool, quiet: bool) -> OutputMode {
    if quiet {
        OutputMode::Quiet
    } else if verbose {
        OutputMode::Verbose
    } else if !std::io::stdout().is_terminal() {
        OutputMode::Plain
    } else {
        OutputMode::Normal
    }
}
