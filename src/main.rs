use anyhow::{Context, Result};
use clap::Parser;
use pacm::archive::PathPolicy;
use pacm::deadline::Deadline;
use pacm::remote::{SshConnector, is_encrypted_key};
use pacm::runtime::{RealRuntime, Runtime};
use pacm::settings::{DEFAULT_PORT, ServerSettings};
use pacm::transfer::UpdateReport;
use pacm::{PackageManager, PublishReport};
use std::path::PathBuf;
use std::time::Duration;

/// pacm - package manager for tar.gz archives kept on an SSH host
///
/// Packages live under <ROOT_DIR>/<name>/<name>-<ver>.tar.gz on the server.
///
/// Examples:
///   pacm create package.json   # bundle and upload the package described in package.json
///   pacm update packages.yaml  # fetch and unpack the listed packages here
#[derive(Parser, Debug)]
#[command(author, version = env!("PACM_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    server: ServerArgs,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Bundle the targets of a package config and upload the archive
    Create(ConfigArgs),

    /// Fetch and unpack every package listed in an update config
    Update(ConfigArgs),
}

#[derive(clap::Args, Debug)]
struct ConfigArgs {
    /// Path to the JSON or YAML config file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,
}

#[derive(clap::Args, Debug)]
struct ServerArgs {
    /// SSH server host
    #[arg(long, env = "PACMAN_SSH_HOST", default_value = "localhost", global = true)]
    host: String,

    /// SSH server port
    #[arg(long, env = "PACMAN_SSH_PORT", default_value_t = DEFAULT_PORT, global = true)]
    port: u16,

    /// SSH user (defaults to $USER)
    #[arg(long, env = "PACMAN_SSH_USER", global = true)]
    user: Option<String>,

    /// Private key file (defaults to ~/.ssh/id_rsa)
    #[arg(long, env = "PACMAN_SSH_KEY", value_name = "PATH", global = true)]
    key: Option<PathBuf>,

    /// Private key passphrase (prompted for when the key is encrypted)
    #[arg(long, env = "PACMAN_SSH_KEY_PASS", hide_env_values = true, global = true)]
    key_pass: Option<String>,

    /// Remote directory holding the packages
    #[arg(long, env = "PACMAN_ROOT_DIR", value_name = "DIR", global = true)]
    root_dir: Option<String>,

    /// Time limit for the whole run, in seconds
    #[arg(long, env = "PACMAN_TIMEOUT", default_value_t = 3, global = true)]
    timeout: u64,

    /// Refuse to unpack archive entries with absolute or `..` paths
    #[arg(long, global = true)]
    contain_paths: bool,
}

impl ServerArgs {
    fn into_settings(self, home_dir: Option<PathBuf>) -> Result<ServerSettings> {
        let root_dir = self
            .root_dir
            .context("Remote root directory is not set (use --root-dir or PACMAN_ROOT_DIR)")?;
        let user = match self.user {
            Some(user) => user,
            None => std::env::var("USER")
                .context("SSH user is not set (use --user, PACMAN_SSH_USER or USER)")?,
        };
        let key_path = match self.key {
            Some(key) => key,
            None => home_dir
                .context("Cannot determine home directory for the default SSH key")?
                .join(".ssh")
                .join("id_rsa"),
        };

        Ok(ServerSettings {
            host: self.host,
            port: self.port,
            user,
            key_path,
            key_passphrase: self.key_pass,
            root_dir,
            timeout: Duration::from_secs(self.timeout),
        })
    }
}

/// Ask on the terminal for the passphrase of an encrypted key, unless one
/// was supplied. An unreadable key is left for the connector to report.
fn ensure_passphrase<R: Runtime>(runtime: &R, settings: &mut ServerSettings) -> Result<()> {
    if settings.key_passphrase.is_some() {
        return Ok(());
    }
    let Ok(key) = runtime.read(&settings.key_path) else {
        return Ok(());
    };
    if !is_encrypted_key(&key) {
        return Ok(());
    }
    let passphrase = rpassword::prompt_password(format!(
        "Enter passphrase for {}: ",
        settings.key_path.display()
    ))
    .context("Failed to read SSH key passphrase")?;
    settings.key_passphrase = Some(passphrase);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Variables already set in the environment win over `.env`.
    let dotenv = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("PACMAN_LOG", "info"))
        .init();
    match dotenv {
        Ok(path) => log::debug!("Loaded environment from {:?}", path),
        Err(e) if e.not_found() => {}
        Err(e) => log::warn!("Failed to load .env: {}", e),
    }
    let cli = Cli::parse();
    let runtime = RealRuntime;

    let policy = if cli.server.contain_paths {
        PathPolicy::Contained
    } else {
        PathPolicy::Verbatim
    };
    let mut settings = cli.server.into_settings(runtime.home_dir())?;
    ensure_passphrase(&runtime, &mut settings)?;
    log::debug!("{:?}", settings);

    let deadline = Deadline::after(settings.timeout);
    let connector = SshConnector::new(&runtime, &settings)?.with_deadline(deadline);
    let manager = PackageManager::new(runtime, connector, &settings).with_path_policy(policy);

    match cli.command {
        Commands::Create(args) => {
            let report = manager.publish(&args.config, deadline).await?;
            print_publish(&report);
        }
        Commands::Update(args) => {
            let report = manager.update(&args.config, deadline).await?;
            print_update(&report);
        }
    }
    Ok(())
}

fn print_publish(report: &PublishReport) {
    for entry in &report.entries {
        println!("   added {} ({} bytes)", entry.name, entry.size);
    }
    println!(
        "   published {} {} to {}",
        report.package, report.version, report.remote_path
    );
}

fn print_update(report: &UpdateReport) {
    for outcome in report.outcomes() {
        match &outcome.result {
            Ok(installed) => println!(
                "   installed {} ({} files)",
                installed.archive,
                installed.files.len()
            ),
            Err(message) => println!("     failed {}: {}", outcome.spec.name, message),
        }
    }
}
