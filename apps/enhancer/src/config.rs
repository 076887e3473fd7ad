use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Interpreter used when neither `PYTHON_PATH` nor a project virtualenv exists.
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Virtualenv interpreter locations, relative to the project root, in priority order.
const VENV_INTERPRETERS: &[&str] = &[
    ".venv/bin/python",
    "venv/bin/python",
    ".venv/Scripts/python.exe",
    "venv/Scripts/python.exe",
];

/// Application configuration loaded from environment variables.
/// Resolved once at startup and passed by value into the services that need it.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub rust_log: String,
    pub project_root: PathBuf,
    /// Interpreter for helper scripts, already resolved (see `resolve_interpreter`).
    pub interpreter: PathBuf,
    pub helper_scripts_dir: PathBuf,
    pub helper_timeout: Duration,
    pub kill_grace: Duration,
    /// Compiler program followed by any leading arguments.
    pub latex_command: Vec<String>,
    pub latex_timeout: Duration,
    pub scratch_root: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let project_root = match std::env::var("PROJECT_ROOT") {
            Ok(root) => PathBuf::from(root),
            Err(_) => std::env::current_dir().context("Cannot determine current directory")?,
        };

        let explicit_interpreter = std::env::var("PYTHON_PATH").ok().map(PathBuf::from);
        let interpreter = resolve_interpreter(explicit_interpreter, &project_root);

        let helper_scripts_dir = std::env::var("HELPER_SCRIPTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| project_root.join("scripts"));

        let latex_command = parse_command(
            &std::env::var("LATEX_COMPILER").unwrap_or_else(|_| "pdflatex".to_string()),
        )?;

        let helper_timeout = timeout_secs("HELPER_TIMEOUT_SECS", parse_env("HELPER_TIMEOUT_SECS", 30)?)?;
        let latex_timeout = timeout_secs("LATEX_TIMEOUT_SECS", parse_env("LATEX_TIMEOUT_SECS", 60)?)?;

        Ok(Config {
            port: parse_env("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            interpreter,
            helper_scripts_dir,
            helper_timeout,
            kill_grace: Duration::from_millis(parse_env("HELPER_KILL_GRACE_MS", 2000)?),
            latex_command,
            latex_timeout,
            scratch_root: std::env::var("SCRATCH_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir()),
            project_root,
        })
    }
}

/// Picks the helper interpreter: explicit path, then a project virtualenv, then
/// the system `python3`.
pub fn resolve_interpreter(explicit: Option<PathBuf>, project_root: &Path) -> PathBuf {
    if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
        return path;
    }

    VENV_INTERPRETERS
        .iter()
        .map(|rel| project_root.join(rel))
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_INTERPRETER))
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Environment variable '{key}' has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

/// Timeouts from the environment must be non-zero.
fn timeout_secs(key: &str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(Duration::from_secs(secs))
}

fn parse_command(raw: &str) -> Result<Vec<String>> {
    let parts: Vec<String> = raw.split_whitespace().map(String::from).collect();
    if parts.is_empty() {
        bail!("LATEX_COMPILER must name a program");
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_interpreter_wins() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join(".venv/bin")).unwrap();
        std::fs::write(root.path().join(".venv/bin/python"), "").unwrap();

        let chosen = resolve_interpreter(Some(PathBuf::from("/opt/py/bin/python3.11")), root.path());
        assert_eq!(chosen, PathBuf::from("/opt/py/bin/python3.11"));
    }

    #[test]
    fn test_venv_interpreter_used_when_present() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("venv/bin")).unwrap();
        std::fs::write(root.path().join("venv/bin/python"), "").unwrap();

        assert_eq!(
            resolve_interpreter(None, root.path()),
            root.path().join("venv/bin/python")
        );
    }

    #[test]
    fn test_dot_venv_preferred_over_venv() {
        let root = tempfile::tempdir().unwrap();
        for rel in [".venv/bin", "venv/bin"] {
            std::fs::create_dir_all(root.path().join(rel)).unwrap();
            std::fs::write(root.path().join(rel).join("python"), "").unwrap();
        }

        assert_eq!(
            resolve_interpreter(None, root.path()),
            root.path().join(".venv/bin/python")
        );
    }

    #[test]
    fn test_falls_back_to_system_interpreter() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve_interpreter(Some(PathBuf::new()), root.path()),
            PathBuf::from(DEFAULT_INTERPRETER)
        );
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let err = timeout_secs("HELPER_TIMEOUT_SECS", 0).unwrap_err();
        assert!(err.to_string().contains("HELPER_TIMEOUT_SECS"));
        assert_eq!(
            timeout_secs("LATEX_TIMEOUT_SECS", 60).unwrap(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_parse_command_splits_wrapper() {
        assert_eq!(
            parse_command("nice -n 10 pdflatex").unwrap(),
            vec!["nice", "-n", "10", "pdflatex"]
        );
        assert!(parse_command("   ").is_err());
    }
}
