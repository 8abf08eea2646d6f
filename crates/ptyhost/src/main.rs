//! ptyhost
//!
//! Developer CLI: attaches the local terminal to a session.

use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use ptyhost::config::{default_config_path, Config, DaemonConfig};
use ptyhost::session::{BackendSelector, Geometry, SessionEvent, SessionHandle, SpawnRequest};

/// Exit code used when the session ended without one, e.g. on a signal.
const FALLBACK_EXIT_CODE: i32 = 1;

/// ptyhost - interactive terminal sessions with a pipe fallback.
#[derive(Parser, Debug)]
#[command(name = "ptyhost")]
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
    /// Run a command (or the default shell) attached to this terminal
    Run(RunArgs),

    /// Report whether PTY sessions are available
    Probe,

    /// Print the effective configuration
    Config(ConfigArgs),
}

/// Arguments for `run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Use pipe emulation even if a PTY is available
    #[arg(long)]
    pub force_pipe: bool,

    /// Terminal width (defaults to the current terminal)
    #[arg(long)]
    pub cols: Option<u16>,

    /// Terminal height (defaults to the current terminal)
    #[arg(long)]
    pub rows: Option<u16>,

    /// Working directory for the session
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Command and arguments; the default shell when omitted
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Arguments for `config`.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Write the effective configuration to the config file
    #[arg(long)]
    pub write: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    let log_guard = init_logging(&config.daemon, cli.verbose)?;
    tracing::debug!(path = %config_path.display(), "Configuration loaded");

    match cli.command {
        Commands::Run(args) => {
            let code = run(&config, args).await?;
            drop(log_guard);
            std::process::exit(code);
        }
        Commands::Probe => {
            let selector = BackendSelector::from_config(&config.session);
            println!("pty available: {}", selector.pty_available());
            println!("force pipe:    {}", selector.force_pipe());
            println!("backend:       {}", selector.preferred());
        }
        Commands::Config(args) => {
            if args.write {
                config.save(&config_path)?;
                println!("Wrote {}", config_path.display());
            } else {
                println!("# {}", config_path.display());
                print!("{}", config.to_toml()?);
            }
        }
    }

    Ok(())
}

/// Installs the tracing subscriber.
///
/// Logs go to stderr, or to `log_file` through a non-blocking writer whose
/// guard must live until exit.
fn init_logging(config: &DaemonConfig, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.log_level.as_str()
    };
    let filter = EnvFilter::new(level.to_lowercase());

    let Some(path) = &config.log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let directory = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("Invalid log file path: {}", path.display()))?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// Leaves raw mode when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> anyhow::Result<Self> {
        crossterm::terminal::enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// Runs one session attached to this terminal and returns its exit code.
async fn run(config: &Config, args: RunArgs) -> anyhow::Result<i32> {
    let mut session_config = config.session.clone();
    session_config.force_pipe |= args.force_pipe;
    let selector = BackendSelector::from_config(&session_config);

    let interactive = std::io::stdin().is_terminal();
    let terminal_size = if std::io::stdout().is_terminal() {
        crossterm::terminal::size().ok()
    } else {
        None
    };
    let geometry = Geometry::new(
        args.cols
            .or(terminal_size.map(|(cols, _)| cols))
            .unwrap_or(session_config.default_cols),
        args.rows
            .or(terminal_size.map(|(_, rows)| rows))
            .unwrap_or(session_config.default_rows),
    );

    let mut command = args.command.into_iter();
    let request = SpawnRequest {
        command: command.next(),
        args: command.collect(),
        cwd: args.cwd,
        env: Vec::new(),
        geometry,
    };

    let (handle, mut events) = selector.spawn(request);
    let handle = Arc::new(handle);
    tracing::info!(backend = %handle.kind(), pid = ?handle.pid(), %geometry, "Session attached");

    let _raw_mode = if interactive {
        Some(RawModeGuard::enable()?)
    } else {
        None
    };

    spawn_stdin_pump(Arc::clone(&handle))?;
    #[cfg(unix)]
    spawn_resize_watcher(Arc::clone(&handle), args.cols.is_none() && args.rows.is_none())?;

    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Data(text) => {
                stdout
                    .write_all(text.as_bytes())
                    .await
                    .context("Failed to write to stdout")?;
                stdout.flush().await.context("Failed to flush stdout")?;
            }
            SessionEvent::Error(message) => {
                tracing::error!(%message, "Session error");
                eprint!("ptyhost: {message}\r\n");
            }
            SessionEvent::Exit(status) => {
                tracing::info!(code = ?status.code, signal = ?status.signal, "Session ended");
                return Ok(status.code.unwrap_or(FALLBACK_EXIT_CODE));
            }
        }
    }

    Ok(FALLBACK_EXIT_CODE)
}

/// Forwards this process's stdin to the session on a blocking thread.
fn spawn_stdin_pump(handle: Arc<SessionHandle>) -> anyhow::Result<()> {
    std::thread::Builder::new()
        .name("stdin-pump".to_string())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buffer = [0u8; 1024];
            loop {
                match stdin.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => handle.write(&buffer[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!(error = %e, "stdin read failed");
                        break;
                    }
                }
                if !handle.is_running() {
                    break;
                }
            }
        })
        .context("Failed to start stdin thread")?;
    Ok(())
}

/// Propagates local terminal size changes to the session.
#[cfg(unix)]
fn spawn_resize_watcher(handle: Arc<SessionHandle>, follow: bool) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    if !follow {
        return Ok(());
    }

    let mut winch = signal(SignalKind::window_change()).context("Failed to watch SIGWINCH")?;
    tokio::spawn(async move {
        while winch.recv().await.is_some() {
            if !handle.is_running() {
                break;
            }
            if let Ok((cols, rows)) = crossterm::terminal::size() {
                tracing::debug!(cols, rows, "Local terminal resized");
                handle.resize(cols, rows);
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run_with_command() {
        let cli = Cli::try_parse_from(["ptyhost", "run", "--force-pipe", "--cols", "100", "ls", "-la"])
            .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert!(args.force_pipe);
                assert_eq!(args.cols, Some(100));
                assert_eq!(args.rows, None);
                assert_eq!(args.command, vec!["ls", "-la"]);
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_parse_run_default_shell() {
        let cli = Cli::try_parse_from(["ptyhost", "-v", "run"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run(args) => assert!(args.command.is_empty()),
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_parse_global_config() {
        let cli = Cli::try_parse_from(["ptyhost", "probe", "--config", "/tmp/c.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(matches!(cli.command, Commands::Probe));
    }

    #[test]
    fn test_cli_parse_config_write() {
        let cli = Cli::try_parse_from(["ptyhost", "config", "--write"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigArgs { write: true })));

        let cli = Cli::try_parse_from(["ptyhost", "config"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigArgs { write: false })));
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["ptyhost"]).is_err());
    }
}
