use anyhow::{bail, Context, Result};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repomirror::config::{Configuration, CONFIG_FILE};
use repomirror::ops::{scan_untracked, Operation};
use repomirror::{sync, GitHubClient};

#[derive(Parser)]
#[command(name = "repomirror")]
#[command(about = "GitHub repository mirror synchronization tool")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Concurrency for repository jobs
    #[arg(short, long, global = true)]
    concurrency: Option<usize>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the repository mirror in the current directory
    Init {
        /// GitHub username
        #[arg(short, long)]
        user: String,

        /// GitHub token
        #[arg(short, long, default_value = "")]
        token: String,

        /// GitHub Enterprise API URL
        #[arg(short = 'r', long = "url", default_value = "")]
        base_url: String,

        /// Directory in which repositories will be stored
        #[arg(short, long, default_value = ".")]
        dir: String,

        /// Create a separate subdirectory per owner
        #[arg(short, long)]
        subdirs: bool,
    },

    /// Update the repository list from GitHub
    Update,

    /// Pull all repositories
    Pull,

    /// Push all repositories
    Push,

    /// Show status for all repositories
    Status,

    /// Display version information
    Version {
        /// Check whether a newer release is available
        #[arg(short = 'u', long = "update-check")]
        update_check: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(255);
        }
    };

    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{}", e);
        std::process::exit(255);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init {
            user,
            token,
            base_url,
            dir,
            subdirs,
        } => cmd_init(user, token, base_url, dir, subdirs, cli.concurrency).await,
        Commands::Update => cmd_update(cli.concurrency).await,
        Commands::Pull => cmd_repo_loop(Operation::Pull, cli.concurrency).await,
        Commands::Push => cmd_repo_loop(Operation::Push, cli.concurrency).await,
        Commands::Status => cmd_status(cli.concurrency).await,
        Commands::Version { update_check } => cmd_version(update_check).await,
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Create the configuration: resolve the account, discover its
/// repositories, and persist everything into the current directory.
async fn cmd_init(
    user: String,
    token: String,
    base_url: String,
    dir: String,
    subdirs: bool,
    concurrency: Option<usize>,
) -> Result<()> {
    if Path::new(CONFIG_FILE).exists() {
        bail!(
            "configuration file already exists in the current directory. \
             Run 'update' if you want to refresh your repository list, or \
             remove {} to initialize again.",
            CONFIG_FILE
        );
    }

    // expanded up front so the derived repository dirs carry the same prefix
    let base_dir = shellexpand::full(&dir)
        .context("failed to expand base directory")?
        .into_owned();

    let mut config = Configuration {
        username: user,
        token,
        base_url,
        base_dir,
        subdirs,
        concurrency: concurrency.unwrap_or(0),
        ..Configuration::default()
    };

    let client = GitHubClient::new(&config)?;

    let account = client.account(&config.username).await?;
    info!("initializing mirror for {}", account.login);
    config.username = account.login;
    config.full_name = account.full_name;
    config.email = account.email;

    config.repos = client.discover(&config).await?;

    std::fs::create_dir_all(&config.base_dir)?;

    config.save(Path::new("."))?;
    println!("Configuration saved. You can now run pull to download your repositories.");

    Ok(())
}

/// Re-run discovery with the stored identity and overwrite the
/// configuration in place.
async fn cmd_update(concurrency: Option<usize>) -> Result<()> {
    let mut config = Configuration::load()?;

    let client = GitHubClient::new(&config)?;

    let account = client.account(&config.username).await?;
    config.username = account.login;
    config.full_name = account.full_name;
    config.email = account.email;

    config.repos = client.discover(&config).await?;

    if let Some(n) = concurrency {
        config.concurrency = n;
    }

    config.save(Path::new("."))?;
    println!(
        "Configuration updated: {} repositories tracked.",
        config.repos.len()
    );

    Ok(())
}

/// Run one operation over every configured repository.
async fn cmd_repo_loop(operation: Operation, concurrency: Option<usize>) -> Result<()> {
    let config = Arc::new(Configuration::load()?);
    sync::run(operation, config, concurrency).await;
    Ok(())
}

/// Per-repository status, then the untracked-directory scan, merged into
/// one sorted table.
async fn cmd_status(concurrency: Option<usize>) -> Result<()> {
    let config = Arc::new(Configuration::load()?);

    let report = sync::collect(Operation::Status, Arc::clone(&config), concurrency).await;
    scan_untracked(&config, &report)?;
    report.print();

    Ok(())
}

/// Print version information, optionally checking for a newer release.
async fn cmd_version(update_check: bool) -> Result<()> {
    let current = env!("CARGO_PKG_VERSION");
    println!("repomirror version: {}", current);

    if update_check {
        let client = GitHubClient::new(&Configuration::default())?;
        match client.latest_release_tag().await? {
            Some(tag) => {
                let latest = tag.trim_start_matches('v');
                if latest == current {
                    println!("You are running the latest release.");
                } else {
                    println!("Release {} is available.", latest);
                }
            }
            None => println!("No published releases found."),
        }
    }

    Ok(())
}
