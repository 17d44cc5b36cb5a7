//! SessionMux CLI
//!
//! Drives a session stream manager from the command line.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sessionmux::config::{default_config_path, Config};
use sessionmux::persistence::Persistence;
use sessionmux::{
    HttpPersistence, ManagerEvent, SessionKind, SessionSpec, SessionStreamManager, StreamingUnit,
    WebSocketTransport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// SessionMux - many chat and terminal sessions over one stream.
#[derive(Parser, Debug)]
#[command(name = "sessionmux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Create a session and forward stdin lines to it
    Run {
        /// Session kind
        #[arg(long, short, value_enum, default_value = "chat")]
        kind: KindArg,

        /// Display name of the session
        #[arg(long, short, default_value = "cli")]
        name: String,

        /// Initial terminal size as COLSxROWS (terminal sessions only)
        #[arg(long, value_name = "COLSxROWS")]
        size: Option<String>,
    },

    /// List sessions of the configured scope
    Sessions {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

/// Session kind accepted on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
    /// Conversational session
    Chat,
    /// Remote shell
    Terminal,
}

impl From<KindArg> for SessionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Chat => SessionKind::Chat,
            KindArg::Terminal => SessionKind::Terminal,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    if let Commands::Config(cmd) = &cli.command {
        return run_config_command(cmd, &config, &config_path);
    }

    config.validate()?;
    let _log_guard = init_logging(&config, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Run { kind, name, size } => {
            let size = size.as_deref().map(parse_size).transpose()?;
            run_session(&config, kind.into(), name, size).await?;
        }
        Commands::Sessions { json } => {
            let persistence =
                HttpPersistence::new(&config.persistence.base_url, config.request_timeout())?;
            let sessions = persistence
                .list_sessions(&config.persistence.scope_id)
                .await
                .context("Failed to list sessions")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("No sessions in scope {}.", config.persistence.scope_id);
            } else {
                println!("{:<38} {:<10} {:<14} NAME", "ID", "KIND", "STATUS");
                for session in sessions {
                    println!(
                        "{:<38} {:<10} {:<14} {}",
                        session.id,
                        format!("{:?}", session.kind),
                        format!("{:?}", session.status()),
                        session.name
                    );
                }
            }
        }
        Commands::Config(_) => {}
    }

    Ok(())
}

fn run_config_command(cmd: &ConfigCommands, config: &Config, path: &Path) -> anyhow::Result<()> {
    match cmd {
        ConfigCommands::Show => {
            println!("# {}", path.display());
            print!("{}", config.to_toml()?);
        }
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}

/// Installs the tracing subscriber. The returned guard flushes the file
/// writer on drop and must live until exit.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.logging.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let Some(path) = &config.logging.log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let file_name = path
        .file_name()
        .with_context(|| format!("Invalid log file path: {}", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// Parses `COLSxROWS`.
fn parse_size(value: &str) -> anyhow::Result<(u16, u16)> {
    let (cols, rows) = value
        .split_once(['x', 'X'])
        .with_context(|| format!("Invalid size '{}', expected COLSxROWS", value))?;
    let cols = cols.trim().parse::<u16>().with_context(|| format!("Invalid columns in '{}'", value))?;
    let rows = rows.trim().parse::<u16>().with_context(|| format!("Invalid rows in '{}'", value))?;
    Ok((cols, rows))
}

fn print_unit(unit: &StreamingUnit) {
    let mut stdout = std::io::stdout().lock();
    let _ = write!(stdout, "{}", unit.content);
    if !unit.content.ends_with('\n') {
        let _ = writeln!(stdout);
    }
    if let Some(code) = unit.exit_code {
        let _ = writeln!(stdout, "[exit {}]", code);
    }
    let _ = stdout.flush();
}

async fn run_session(
    config: &Config,
    kind: SessionKind,
    name: String,
    size: Option<(u16, u16)>,
) -> anyhow::Result<()> {
    let ws_config = config.websocket_config();
    let connect_timeout = ws_config.connect_timeout;
    let transport = Arc::new(WebSocketTransport::new(ws_config));
    transport.clone().start();
    transport
        .wait_connected(connect_timeout)
        .await
        .with_context(|| format!("Failed to reach {}", config.transport.endpoint))?;

    let persistence = Arc::new(HttpPersistence::new(
        &config.persistence.base_url,
        config.request_timeout(),
    )?);

    let manager = SessionStreamManager::new(transport.clone(), persistence, config.manager_options())
        .with_completion_hook(print_unit);
    manager.start()?;

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ManagerEvent::Error { category, message } = event {
                eprintln!("[{} error] {}", category, message);
            }
        }
    });

    let mut spec = SessionSpec::new(config.persistence.scope_id.clone(), name, kind);
    if let Some((cols, rows)) = size {
        spec = spec.with_size(cols, rows);
    }
    let session = manager.create_session(spec).await?;
    tracing::info!(session_id = %session.id, kind = ?kind, "Session ready");
    eprintln!("Session {} ready. Ctrl-D or Ctrl-C to quit.", session.id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let result = match kind {
                    SessionKind::Chat if line.trim().is_empty() => continue,
                    SessionKind::Chat => manager.send_message(&session.id, &line).await.map(|_| ()),
                    SessionKind::Terminal => manager.send_input(&session.id, format!("{}\n", line)).await,
                };
                // Already surfaced through the event stream
                if let Err(e) = result {
                    tracing::debug!(error = %e, "Send failed");
                }
            }
        }
    }

    manager.shutdown();
    transport.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("120x40").unwrap(), (120, 40));
        assert_eq!(parse_size("80X24").unwrap(), (80, 24));
        assert!(parse_size("80").is_err());
        assert!(parse_size("axb").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::parse_from(["sessionmux", "-v", "run", "--kind", "terminal", "--name", "build"]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Run { kind, name, size } => {
                assert_eq!(kind, KindArg::Terminal);
                assert_eq!(name, "build");
                assert!(size.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_config_init() {
        let cli = Cli::parse_from(["sessionmux", "--config", "/tmp/c.toml", "config", "init", "--force"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));
    }

    #[test]
    fn test_kind_conversion() {
        assert_eq!(SessionKind::from(KindArg::Chat), SessionKind::Chat);
        assert_eq!(SessionKind::from(KindArg::Terminal), SessionKind::Terminal);
    }
}
