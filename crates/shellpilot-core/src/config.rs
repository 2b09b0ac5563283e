//! Shell session settings.
//!
//! Settings are built with chained setters (see [`ShellSettings::output_dir`])
//! or read from `SHELLPILOT_*` environment variables with
//! [`ShellSettings::from_env`]. The daemon layers its command-line flags on
//! top of the environment.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_OUTPUT_DIR: &str = "outputs";
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid shell type: {0} (expected auto, bash or sh)")]
    InvalidShellType(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Which shell interpreter backs new sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShellType {
    /// bash when it is on PATH, otherwise sh
    #[default]
    Auto,
    Bash,
    Sh,
}

impl FromStr for ShellType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(ShellType::Auto),
            "bash" => Ok(ShellType::Bash),
            "sh" => Ok(ShellType::Sh),
            other => Err(ConfigError::InvalidShellType(other.to_string())),
        }
    }
}

/// Resolved configuration shared by the registry and the tool handlers.
#[derive(Debug, Clone)]
pub struct ShellSettings {
    pub shell_type: ShellType,
    /// Path to bash, used when the shell type resolves to bash
    pub bash_path: String,
    /// Full shell command line overriding detection (e.g. "/bin/zsh -f")
    pub shell_command: Option<String>,
    /// Where per-invocation output artifacts are written
    pub output_dir: PathBuf,
    /// Optional directory for per-session transcript files
    pub transcript_dir: Option<PathBuf>,
    /// How long stop waits after SIGTERM before SIGKILL
    pub stop_grace: Duration,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            shell_type: ShellType::Auto,
            bash_path: "bash".to_string(),
            shell_command: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            transcript_dir: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

impl ShellSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read settings from the environment, falling back to defaults.
    ///
    /// Recognised variables: `SHELLPILOT_SHELL_TYPE`, `SHELLPILOT_BASH_PATH`,
    /// `SHELLPILOT_SHELL_COMMAND`, `SHELLPILOT_OUTPUT_DIR`,
    /// `SHELLPILOT_TRANSCRIPT_DIR` and `SHELLPILOT_STOP_GRACE_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(value) = lookup("SHELLPILOT_SHELL_TYPE") {
            settings.shell_type = value.parse()?;
        }
        if let Some(value) = non_empty(lookup("SHELLPILOT_BASH_PATH")) {
            settings.bash_path = value;
        }
        settings.shell_command = non_empty(lookup("SHELLPILOT_SHELL_COMMAND"));
        if let Some(value) = non_empty(lookup("SHELLPILOT_OUTPUT_DIR")) {
            settings.output_dir = PathBuf::from(value);
        }
        settings.transcript_dir = non_empty(lookup("SHELLPILOT_TRANSCRIPT_DIR")).map(PathBuf::from);
        if let Some(value) = non_empty(lookup("SHELLPILOT_STOP_GRACE_MS")) {
            let millis = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    name: "SHELLPILOT_STOP_GRACE_MS",
                    value: value.clone(),
                })?;
            settings.stop_grace = Duration::from_millis(millis);
        }

        Ok(settings)
    }

    /// Set the shell type.
    pub fn shell_type(mut self, shell_type: ShellType) -> Self {
        self.shell_type = shell_type;
        self
    }

    /// Set the bash executable path.
    pub fn bash_path(mut self, path: impl Into<String>) -> Self {
        self.bash_path = path.into();
        self
    }

    /// Override shell detection with a full command line.
    pub fn shell_command(mut self, command: impl Into<String>) -> Self {
        self.shell_command = Some(command.into());
        self
    }

    /// Set the artifact directory.
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Enable per-session transcripts in `dir`.
    pub fn transcript_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transcript_dir = Some(dir.into());
        self
    }

    /// Set the stop grace period.
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    mod shell_type {
        use super::*;

        #[test]
        fn parses_known_values() {
            assert_eq!("auto".parse::<ShellType>().unwrap(), ShellType::Auto);
            assert_eq!("BASH".parse::<ShellType>().unwrap(), ShellType::Bash);
            assert_eq!(" sh ".parse::<ShellType>().unwrap(), ShellType::Sh);
        }

        #[test]
        fn rejects_unknown_value() {
            let err = "cmd".parse::<ShellType>().unwrap_err();
            assert_eq!(err, ConfigError::InvalidShellType("cmd".to_string()));
            assert!(err.to_string().contains("cmd"));
        }
    }

    mod settings {
        use super::*;

        #[test]
        fn defaults() {
            let settings = ShellSettings::default();
            assert_eq!(settings.shell_type, ShellType::Auto);
            assert_eq!(settings.bash_path, "bash");
            assert_eq!(settings.output_dir, PathBuf::from("outputs"));
            assert!(settings.transcript_dir.is_none());
            assert!(settings.shell_command.is_none());
            assert_eq!(settings.stop_grace, Duration::from_secs(2));
        }

        #[test]
        fn builder_sets_fields() {
            let settings = ShellSettings::new()
                .shell_type(ShellType::Sh)
                .bash_path("/usr/local/bin/bash")
                .shell_command("/bin/zsh -f")
                .output_dir("/tmp/out")
                .transcript_dir("/tmp/logs")
                .stop_grace(Duration::from_millis(250));

            assert_eq!(settings.shell_type, ShellType::Sh);
            assert_eq!(settings.bash_path, "/usr/local/bin/bash");
            assert_eq!(settings.shell_command.as_deref(), Some("/bin/zsh -f"));
            assert_eq!(settings.output_dir, PathBuf::from("/tmp/out"));
            assert_eq!(settings.transcript_dir, Some(PathBuf::from("/tmp/logs")));
            assert_eq!(settings.stop_grace, Duration::from_millis(250));
        }

        #[test]
        fn reads_environment_lookup() {
            let settings = ShellSettings::from_lookup(lookup_from(&[
                ("SHELLPILOT_SHELL_TYPE", "bash"),
                ("SHELLPILOT_BASH_PATH", "/opt/bash"),
                ("SHELLPILOT_OUTPUT_DIR", "/var/out"),
                ("SHELLPILOT_TRANSCRIPT_DIR", "/var/log/shellpilot"),
                ("SHELLPILOT_STOP_GRACE_MS", "500"),
            ]))
            .unwrap();

            assert_eq!(settings.shell_type, ShellType::Bash);
            assert_eq!(settings.bash_path, "/opt/bash");
            assert_eq!(settings.output_dir, PathBuf::from("/var/out"));
            assert_eq!(
                settings.transcript_dir,
                Some(PathBuf::from("/var/log/shellpilot"))
            );
            assert_eq!(settings.stop_grace, Duration::from_millis(500));
        }

        #[test]
        fn empty_values_keep_defaults() {
            let settings = ShellSettings::from_lookup(lookup_from(&[
                ("SHELLPILOT_BASH_PATH", ""),
                ("SHELLPILOT_OUTPUT_DIR", "  "),
            ]))
            .unwrap();
            assert_eq!(settings.bash_path, "bash");
            assert_eq!(settings.output_dir, PathBuf::from("outputs"));
        }

        #[test]
        fn invalid_grace_is_an_error() {
            let err = ShellSettings::from_lookup(lookup_from(&[(
                "SHELLPILOT_STOP_GRACE_MS",
                "soon",
            )]))
            .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }));
        }
    }
}
