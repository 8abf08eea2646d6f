//! Turns a spawn request into the exact program, arguments, directory and
//! environment handed to the OS.
//!
//! The same launch spec feeds both backends, so shells get their interactive
//! flag and terminal variables whether or not a pty ends up behind them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use protocol::messages::SessionCreate;

use super::handle::Geometry;

/// Shells that get `-i` when the caller did not ask for interactive mode.
pub const INTERACTIVE_SHELLS: &[&str] = &["bash", "sh", "zsh"];

/// `TERM` value used when neither the caller nor the environment sets one.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// A request to start a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Command to run; `None` runs the default shell.
    pub command: Option<String>,
    /// Arguments for the command.
    pub args: Vec<String>,
    /// Working directory; `None` uses the current directory.
    pub cwd: Option<PathBuf>,
    /// Environment overrides. Later entries win over earlier ones, and all
    /// of them win over the inherited environment.
    pub env: Vec<(String, String)>,
    /// Initial terminal geometry.
    pub geometry: Geometry,
}

impl SpawnRequest {
    /// A request for the given command with default settings.
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::default()
        }
    }

    /// A request for the default shell.
    pub fn shell() -> Self {
        Self::default()
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment override.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the initial geometry.
    pub fn geometry(mut self, cols: u16, rows: u16) -> Self {
        self.geometry = Geometry::new(cols, rows);
        self
    }
}

impl From<SessionCreate> for SpawnRequest {
    fn from(req: SessionCreate) -> Self {
        Self {
            command: req.command.filter(|c| !c.trim().is_empty()),
            args: req.args,
            cwd: req.cwd.map(PathBuf::from),
            env: req.env,
            geometry: Geometry::new(req.cols, req.rows),
        }
    }
}

/// Everything needed to start the process, already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Program path, resolved through `PATH` when possible.
    pub program: PathBuf,
    /// Final argument vector, without the program itself.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Complete environment for the child.
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// The program's file name, used in logs.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

/// Normalizes spawn requests.
#[derive(Debug, Clone)]
pub struct Launcher {
    default_shell: String,
    base_env: BTreeMap<String, String>,
}

impl Launcher {
    /// Creates a launcher that inherits this process's environment.
    pub fn new(default_shell: impl Into<String>) -> Self {
        let base_env = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self {
            default_shell: default_shell.into(),
            base_env,
        }
    }

    /// Replaces the inherited environment.
    pub fn with_base_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.base_env = env.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// The shell used for requests without a command.
    pub fn default_shell(&self) -> &str {
        &self.default_shell
    }

    /// Builds the launch spec for a request.
    pub fn prepare(&self, request: &SpawnRequest) -> LaunchSpec {
        let command = request
            .command
            .as_deref()
            .unwrap_or(self.default_shell.as_str());
        let program = resolve_program(command);

        let mut args = request.args.clone();
        if is_interactive_shell(&program) && !has_interactive_flag(&args) {
            args.insert(0, "-i".to_string());
        }

        let cwd = request
            .cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut env = self.base_env.clone();
        for (key, value) in &request.env {
            env.insert(key.clone(), value.clone());
        }
        env.entry("TERM".to_string())
            .or_insert_with(|| DEFAULT_TERM.to_string());
        env.entry("COLUMNS".to_string())
            .or_insert_with(|| request.geometry.cols.to_string());
        env.entry("LINES".to_string())
            .or_insert_with(|| request.geometry.rows.to_string());

        LaunchSpec {
            program,
            args,
            cwd,
            env,
        }
    }
}

/// Resolves bare command names through `PATH`.
///
/// Names that cannot be resolved are kept as given; starting them fails
/// later and is reported through the session's exit.
fn resolve_program(command: &str) -> PathBuf {
    let path = Path::new(command);
    if path.components().count() > 1 || path.is_absolute() {
        return path.to_path_buf();
    }
    which::which(command).unwrap_or_else(|_| path.to_path_buf())
}

/// Returns `true` when the program is one of [`INTERACTIVE_SHELLS`].
pub fn is_interactive_shell(program: &Path) -> bool {
    program
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| INTERACTIVE_SHELLS.contains(&name))
}

/// Looks for `-i`, `--interactive`, or a short-flag cluster such as `-li`
/// among the leading option arguments.
pub fn has_interactive_flag(args: &[String]) -> bool {
    for arg in args {
        if arg == "--" || !arg.starts_with('-') {
            break;
        }
        if arg == "--interactive" {
            return true;
        }
        if let Some(cluster) = arg.strip_prefix('-') {
            if !cluster.starts_with('-')
                && cluster.chars().all(|c| c.is_ascii_alphabetic())
                && cluster.contains('i')
            {
                return true;
            }
        }
    }
    false
}
