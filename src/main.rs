use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sandbox_host::presentation::{self, Synchronizer};
use sandbox_host::readiness::{HttpStatusProbe, ReadinessPoller};
use sandbox_host::transport::ProcessLauncher;
use sandbox_host::{
    ChannelHost, Config, HostNotice, HostSupervisor, SupervisorDeps, SupervisorOptions,
};

fn print_help() {
    println!(
        "\
sandbox-host v{}

Runs a content renderer in an isolated child process and supervises it.

USAGE:
    sandbox-host [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/sandbox.toml]

OPTIONS:
    -c, --content <REF>    Content reference passed to the child [default: untitled]
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, sandbox_host=debug,warn)

EXAMPLES:
    sandbox-host                                  # uses config/sandbox.toml
    sandbox-host --content doc-1 renderer.toml    # custom content and config
    RUST_LOG=debug sandbox-host                   # with wire-level logging",
        env!("CARGO_PKG_VERSION"),
    );
}

struct Args {
    config_path: String,
    content_ref: String,
}

fn parse_args() -> Result<Args> {
    let mut config_path = None;
    let mut content_ref = None;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("sandbox-host v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--content" | "-c" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("{arg} requires a value"))?;
                content_ref = Some(value);
            }
            other if other.starts_with('-') => bail!("unknown option {other} (see --help)"),
            other => config_path = Some(other.to_string()),
        }
    }

    Ok(Args {
        config_path: config_path.unwrap_or_else(|| "config/sandbox.toml".to_string()),
        content_ref: content_ref.unwrap_or_else(|| "untitled".to_string()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    let args = parse_args()?;

    // Initialize logging (RUST_LOG=debug for wire traffic)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sandbox_host=info")),
        )
        .init();

    info!("Loading configuration from {}", args.config_path);
    let config = Config::load(&args.config_path)?;
    info!("Child: {}", config.describe());
    info!(
        "Presentation variables: {}",
        config.presentation.variables.join(", ")
    );

    let readiness = match &config.readiness {
        Some(readiness) => {
            let probe = HttpStatusProbe::from_config(readiness)?;
            Some(ReadinessPoller::from_config(Arc::new(probe), readiness))
        }
        None => None,
    };
    let options = SupervisorOptions {
        read_only: config.supervisor.read_only,
        dependency_gate_required: readiness.is_some(),
    };

    // The publisher stays alive for the whole run so the watch never closes
    let (_presentation_tx, presentation_rx) = presentation::publisher(&config.presentation);
    let (host, mut notices) = ChannelHost::new();

    let deps = SupervisorDeps {
        launcher: Arc::new(ProcessLauncher::new(config.child.clone())),
        readiness,
        presentation: Synchronizer::new(config.presentation.variables.clone(), presentation_rx),
        host: Arc::new(host),
    };
    let supervisor = HostSupervisor::create(
        args.content_ref.clone(),
        options,
        config.supervisor.clone(),
        deps,
    )?;

    loop {
        tokio::select! {
            notice = notices.recv() => {
                let Some(notice) = notice else {
                    return Err(anyhow!("supervisor stopped unexpectedly"));
                };
                match notice {
                    HostNotice::Ready => info!("✓ Sandbox for {} is ready", args.content_ref),
                    HostNotice::StateChange(state) if state.is_terminal() => {
                        error!("Sandbox failed permanently: {state}");
                        supervisor.dispose().await;
                        return Err(anyhow!("{state}"));
                    }
                    HostNotice::StateChange(_) => {}
                    HostNotice::Error { category, message, notification } => {
                        if !notification.blocking {
                            warn!("Sandbox reported {category} error: {message}");
                        }
                    }
                    HostNotice::ContentPersist(content) => {
                        info!("Content changed ({} bytes)", content.len());
                    }
                    HostNotice::TitleChange(title) => info!("Title: {title}"),
                    HostNotice::HeightChange(height) => info!("Height: {height}px"),
                    HostNotice::Navigate(target) => info!("Navigation requested: {target}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, disposing sandbox");
                supervisor.dispose().await;
                return Ok(());
            }
        }
    }
}
