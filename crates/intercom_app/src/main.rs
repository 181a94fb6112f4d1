//! Intercom federation daemon.
//!
//! Loads the federation configuration, starts the engine with logging-only
//! subsystems and runs until Ctrl-C.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file
//! intercom-federation --config /etc/intercom/federation.json
//!
//! # Override the listener and identity from the command line
//! intercom-federation --listen 0.0.0.0:3002 --server-id site-b
//!
//! # Print the effective configuration (secret redacted)
//! intercom-federation --config federation.json show-config
//! ```

mod logging;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use intercom_federation::{FederationConfig, FederationNode, Subsystems};
use tracing::info;

const REDACTED: &str = "********";

/// Intercom server federation engine
#[derive(Parser, Debug)]
#[command(name = "intercom-federation")]
#[command(version)]
#[command(about = "Links intercom servers into a federated mesh")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Address the federation listener binds to
    #[arg(long, global = true)]
    listen: Option<SocketAddr>,

    /// Id of this server in the mesh
    #[arg(long, global = true)]
    server_id: Option<String>,

    /// Human-readable server name
    #[arg(long, global = true)]
    server_name: Option<String>,

    /// URL peers use to reach this server
    #[arg(long, global = true)]
    server_url: Option<String>,

    /// Log directory (default: ~/.intercom/logs)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Run the federation engine (default)
    Run,
    /// Print the effective configuration with the secret redacted
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::ShowConfig => {
            let config = load_config(
                &cli,
                default_config_path().as_deref(),
                |key| std::env::var(key).ok(),
            )?;
            println!("{}", render_redacted(&config)?);
            Ok(())
        }
        Commands::Run => run(&cli).await,
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let logs_dir = match &cli.log_dir {
        Some(dir) => dir.clone(),
        None => logging::default_logs_dir()?,
    };
    let _guard = logging::init_logging(&logs_dir)?;

    let config = load_config(
        cli,
        default_config_path().as_deref(),
        |key| std::env::var(key).ok(),
    )?;
    info!(
        "Loaded federation config for {} ({} configured peer(s))",
        config.server_id,
        config.peers.len()
    );

    let mut node = FederationNode::new(config, Subsystems::default());
    let Some(addr) = node
        .start()
        .await
        .context("Failed to start the federation engine")?
    else {
        return Ok(());
    };
    info!("Federation engine listening on {addr}; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    node.stop();
    Ok(())
}

/// Default config file: `~/.intercom/federation.json`.
fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".intercom").join("federation.json"))
}

/// Layer the configuration: file, then `FEDERATION_*` variables, then
/// command-line flags.
///
/// A file named with `--config` must exist and parse. Otherwise the file at
/// `fallback` is used when it is usable, and defaults when it is not.
fn load_config(
    cli: &Cli,
    fallback: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<FederationConfig> {
    let mut config = match (&cli.config, fallback) {
        (Some(path), _) if !path.exists() => {
            bail!("Config file {} does not exist", path.display())
        }
        (Some(path), _) => FederationConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        (None, Some(path)) => FederationConfig::load_or_default(path),
        (None, None) => FederationConfig::default(),
    };

    config
        .apply_overrides(env)
        .context("Invalid FEDERATION_* environment variable")?;

    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(id) = &cli.server_id {
        config.server_id = id.clone();
    }
    if let Some(name) = &cli.server_name {
        config.server_name = name.clone();
    }
    if let Some(url) = &cli.server_url {
        config.server_url = url.clone();
    }
    Ok(config)
}

fn render_redacted(config: &FederationConfig) -> Result<String> {
    let mut shown = config.clone();
    if !shown.federation_secret.is_empty() {
        shown.federation_secret = REDACTED.to_string();
    }
    Ok(serde_json::to_string_pretty(&shown)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["intercom-federation"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let config = load_config(&cli(&[]), None, no_env).unwrap();
        assert_eq!(config.server_id, "intercom-server-01");
        assert_eq!(config.listen_addr.port(), 3002);
    }

    #[test]
    fn test_layering_file_env_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("federation.json");
        let mut file_config = FederationConfig::default();
        file_config.server_id = "from-file".into();
        file_config.server_name = "File Name".into();
        file_config.max_connections = 4;
        file_config.save_to_file(&path).unwrap();

        let env = |key: &str| match key {
            "FEDERATION_SERVER_NAME" => Some("Env Name".to_string()),
            "FEDERATION_SECRET" => Some("s3cret".to_string()),
            _ => None,
        };
        let args = cli(&[
            "--config",
            path.to_str().unwrap(),
            "--server-id",
            "from-flag",
            "--listen",
            "127.0.0.1:4100",
        ]);
        let config = load_config(&args, None, env).unwrap();

        assert_eq!(config.server_id, "from-flag");
        assert_eq!(config.server_name, "Env Name");
        assert_eq!(config.federation_secret, "s3cret");
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.listen_addr, "127.0.0.1:4100".parse().unwrap());
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("absent.json");
        let args = cli(&["--config", path.to_str().unwrap()]);
        assert!(load_config(&args, None, no_env).is_err());
    }

    #[test]
    fn test_corrupt_config_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("federation.json");
        std::fs::write(&path, "{ \"serverId\": ").unwrap();

        let args = cli(&["--config", path.to_str().unwrap()]);
        let err = load_config(&args, None, no_env).unwrap_err();
        assert!(format!("{err:#}").contains("federation.json"), "got {err:#}");

        // The implicit default file only warns.
        let config = load_config(&cli(&[]), Some(&path), no_env).unwrap();
        assert_eq!(config.server_id, "intercom-server-01");
    }

    #[test]
    fn test_default_file_used_without_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("federation.json");
        let mut file_config = FederationConfig::default();
        file_config.server_id = "from-default-file".into();
        file_config.save_to_file(&path).unwrap();

        let config = load_config(&cli(&[]), Some(&path), no_env).unwrap();
        assert_eq!(config.server_id, "from-default-file");
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let env = |key: &str| (key == "FEDERATION_MAX_CONNECTIONS").then(|| "many".to_string());
        assert!(load_config(&cli(&[]), None, env).is_err());
    }

    #[test]
    fn test_show_config_redacts_secret() {
        let mut config = FederationConfig::default();
        config.federation_secret = "hunter2".into();
        let rendered = render_redacted(&config).unwrap();
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains(REDACTED));
    }

    #[test]
    fn test_subcommand_parsing() {
        assert_eq!(cli(&[]).command, None);
        assert_eq!(cli(&["show-config"]).command, Some(Commands::ShowConfig));
        assert_eq!(cli(&["run", "--server-id", "x"]).server_id.as_deref(), Some("x"));
    }
}
