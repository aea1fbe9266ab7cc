//! Login shell environment resolution.
//!
//! GUI-launched daemons often inherit a minimal environment. Before spawning a
//! session the manager asks the user's shell for its environment and overlays
//! it on its own, then makes sure a few well-known bin directories are on
//! `PATH`.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

/// Directories guaranteed to be on `PATH` unless configured otherwise.
pub const DEFAULT_PATH_DIRS: [&str; 2] = ["/usr/local/bin", "/opt/homebrew/bin"];

/// Environment as an ordered key/value map.
pub type EnvMap = BTreeMap<String, String>;

/// Reasons the login environment could not be read.
#[derive(Error, Debug)]
pub enum EnvError {
    #[error("failed to run {shell}: {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{shell} -c env exited with status {status}")]
    Status { shell: String, status: String },

    #[error("{shell} -c env timed out after {timeout:?}")]
    Timeout { shell: String, timeout: Duration },

    #[error("{shell} -c env produced no variables")]
    Empty { shell: String },
}

/// Parses `env` output. Each line is split on its first `=`; lines without
/// one, or with an empty key, are skipped.
pub fn parse_env_output(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Overlays `overlay` onto `base`; overlay values win.
pub fn merge_env(base: &mut EnvMap, overlay: impl IntoIterator<Item = (String, String)>) {
    base.extend(overlay);
}

/// Returns `path` with every entry of `dirs` present.
///
/// Missing directories are prepended in the order given. Applying this to
/// its own output returns the same string.
pub fn ensure_path_dirs(path: Option<&str>, dirs: &[String]) -> String {
    let existing: Vec<&str> = path
        .unwrap_or_default()
        .split(':')
        .filter(|entry| !entry.is_empty())
        .collect();

    let mut entries: Vec<&str> = Vec::with_capacity(existing.len() + dirs.len());
    for dir in dirs {
        let dir = dir.as_str();
        if !dir.is_empty() && !existing.contains(&dir) && !entries.contains(&dir) {
            entries.push(dir);
        }
    }
    entries.extend(existing);
    entries.join(":")
}

/// The daemon's own environment. Variables that are not valid UTF-8 are
/// dropped.
pub fn process_env() -> EnvMap {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

/// Runs `<shell> -c env` and parses its output.
pub async fn login_env(
    shell: &str,
    timeout: Option<Duration>,
) -> Result<Vec<(String, String)>, EnvError> {
    let output = Command::new(shell)
        .args(["-c", "env"])
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, output)
            .await
            .map_err(|_| EnvError::Timeout {
                shell: shell.to_string(),
                timeout: limit,
            })?,
        None => output.await,
    }
    .map_err(|source| EnvError::Spawn {
        shell: shell.to_string(),
        source,
    })?;

    if !output.status.success() {
        return Err(EnvError::Status {
            shell: shell.to_string(),
            status: output.status.to_string(),
        });
    }

    let vars = parse_env_output(&String::from_utf8_lossy(&output.stdout));
    if vars.is_empty() {
        return Err(EnvError::Empty {
            shell: shell.to_string(),
        });
    }

    Ok(vars)
}

/// Builds the environment handed to new sessions.
#[derive(Debug, Clone)]
pub struct EnvResolver {
    shell: String,
    timeout: Option<Duration>,
    path_dirs: Vec<String>,
    resolve_login_env: bool,
}

impl EnvResolver {
    /// Creates a resolver for `shell`. A zero timeout disables the limit.
    pub fn new(shell: impl Into<String>, timeout: Duration, path_dirs: Vec<String>) -> Self {
        Self {
            shell: shell.into(),
            timeout: (!timeout.is_zero()).then_some(timeout),
            path_dirs,
            resolve_login_env: true,
        }
    }

    /// Skip asking the shell and use the daemon's own environment.
    pub fn without_login_env(mut self) -> Self {
        self.resolve_login_env = false;
        self
    }

    /// Resolves the environment. Never fails: any problem with the login
    /// shell degrades to the daemon's own environment.
    pub async fn resolve(&self) -> EnvMap {
        let mut env = process_env();

        if self.resolve_login_env {
            match login_env(&self.shell, self.timeout).await {
                Ok(vars) => {
                    tracing::debug!(shell = %self.shell, count = vars.len(), "Resolved login environment");
                    merge_env(&mut env, vars);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Falling back to daemon environment");
                }
            }
        }

        let path = ensure_path_dirs(env.get("PATH").map(String::as_str), &self.path_dirs);
        env.insert("PATH".to_string(), path);
        env
    }
}
