use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use thin::config::{resolve_home, Config, HOME_ENV};
use thin::install::{install_provider, provider_binary};
use thin_oci::ProgressMode;

#[derive(Parser)]
#[command(name = "thin", version, about = "Install and manage providers")]
struct Cli {
    /// Home directory (defaults to ./.thin when present, else ~/.thin)
    #[arg(long, global = true, env = HOME_ENV)]
    home: Option<PathBuf>,

    /// Progress presentation: auto, plain or interactive
    #[arg(long, global = true)]
    progress: Option<ProgressMode>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage installed providers
    #[command(alias = "providers")]
    Provider {
        #[command(subcommand)]
        command: ProviderCommand,
    },
    /// Print version information
    Version,
}

#[derive(Subcommand)]
enum ProviderCommand {
    /// Install a provider from an OCI image
    ///
    /// Example: thin provider install lite ghcr.io/sourceplane/lite-ci:v0.1.2
    Install { name: String, image_ref: String },
    /// List installed providers
    List,
    /// Print the binary path of an installed provider
    Path { name: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match cli.command {
        Command::Version => {
            println!("thin {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
        Command::Provider { command } => {
            let config = Config::load(resolve_home(cli.home)?)?;
            match command {
                ProviderCommand::Install { name, image_ref } => {
                    let progress = cli.progress.unwrap_or(config.settings.progress);
                    cmd_install(&config, &name, &image_ref, progress).await
                }
                ProviderCommand::List => cmd_list(&config),
                ProviderCommand::Path { name } => {
                    println!("{}", provider_binary(&config, &name)?.display());
                    Ok(ExitCode::SUCCESS)
                }
            }
        }
    }
}

async fn cmd_install(
    config: &Config,
    name: &str,
    image_ref: &str,
    progress: ProgressMode,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    println!("Downloading {} from {}...", name, image_ref);
    let report = match install_provider(config, name, image_ref, progress).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("✗ Failed to install provider: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    if report.legacy_fallback {
        println!("Using legacy multi-platform layers");
    }
    for warning in &report.warnings {
        println!("⚠ Warning: {}", warning);
    }
    if let Some(binary) = report.binary.as_ref().and_then(|b| b.file_name()) {
        println!("✓ Binary ready: {}", binary.to_string_lossy());
    }
    println!("✓ Provider {} installed from {}", name, image_ref);
    Ok(ExitCode::SUCCESS)
}

fn cmd_list(config: &Config) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let providers = config.installed_providers()?;
    if providers.is_empty() {
        println!("No providers installed");
    }
    for name in providers {
        println!("  {}", name);
    }
    Ok(ExitCode::SUCCESS)
}
