//! Shell detection and command construction.
//!
//! Sessions run a long-lived, non-interactive shell reading commands from a
//! pipe. This module decides which shell to run and prepares the
//! [`Command`] for it:
//! - `bash --norc --noprofile` when bash is available (or requested)
//! - `sh` as the fallback
//! - any command line given in [`ShellSettings::shell_command`], split with
//!   POSIX shell rules
//!
//! The environment is tuned so tools produce plain output: no colours, a
//! dumb terminal, and unbuffered Python.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::{ShellSettings, ShellType};

/// Exit status recorded when a shell process terminates.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ShellExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ShellExit {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Environment applied to every spawned shell.
const SHELL_ENV: &[(&str, &str)] = &[
    ("TERM", "dumb"),
    ("PS1", "$ "),
    ("NO_COLOR", "1"),
    ("PYTHONUNBUFFERED", "1"),
    ("PYTHONIOENCODING", "utf-8"),
];

/// Search PATH for an executable named `name`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Resolve `auto` to a concrete shell type.
pub fn detect_shell_type() -> ShellType {
    if find_in_path("bash").is_some() {
        ShellType::Bash
    } else {
        ShellType::Sh
    }
}

/// Resolve the shell program and its arguments from settings.
pub fn shell_program(settings: &ShellSettings) -> Result<(String, Vec<String>), String> {
    if let Some(custom) = settings.shell_command.as_deref() {
        let mut parts = shlex::split(custom)
            .ok_or_else(|| format!("Invalid shell command: {custom}"))?
            .into_iter();
        let program = parts
            .next()
            .ok_or_else(|| "Empty shell command".to_string())?;
        return Ok((program, parts.collect()));
    }

    let shell_type = match settings.shell_type {
        ShellType::Auto => detect_shell_type(),
        other => other,
    };

    match shell_type {
        ShellType::Sh => Ok(("sh".to_string(), Vec::new())),
        _ => {
            let bash = if settings.bash_path == "bash" {
                find_in_path("bash")
                    .and_then(|p| p.to_str().map(str::to_string))
                    .unwrap_or_else(|| settings.bash_path.clone())
            } else {
                settings.bash_path.clone()
            };
            Ok((bash, vec!["--norc".to_string(), "--noprofile".to_string()]))
        }
    }
}

/// Build the command for a new interactive shell session.
///
/// The returned command has no stdio configured; the caller pipes them.
/// On Unix the shell leads its own process group so that stopping a session
/// also reaches the commands it started.
pub fn build_shell_command(
    settings: &ShellSettings,
    working_dir: Option<&Path>,
) -> Result<Command, String> {
    let (program, args) = shell_program(settings)?;

    let mut cmd = Command::new(&program);
    cmd.args(&args);

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    for (key, value) in SHELL_ENV {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    Ok(cmd)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_exit_serializes() {
        let exit = ShellExit {
            code: Some(1),
            signal: None,
        };
        let json = serde_json::to_string(&exit).unwrap();
        assert!(json.contains("\"code\":1"));
        assert!(json.contains("\"signal\":null"));
    }

    #[test]
    fn custom_shell_command_is_split() {
        let settings = ShellSettings::new().shell_command("/bin/zsh -f --no-rcs");
        let (program, args) = shell_program(&settings).unwrap();
        assert_eq!(program, "/bin/zsh");
        assert_eq!(args, vec!["-f", "--no-rcs"]);
    }

    #[test]
    fn custom_shell_command_honours_quotes() {
        let settings = ShellSettings::new().shell_command("'/opt/my shell/bash' --norc");
        let (program, args) = shell_program(&settings).unwrap();
        assert_eq!(program, "/opt/my shell/bash");
        assert_eq!(args, vec!["--norc"]);
    }

    #[test]
    fn unbalanced_shell_command_is_rejected() {
        let settings = ShellSettings::new().shell_command("'/bin/bash");
        assert!(shell_program(&settings).is_err());
    }

    #[test]
    fn sh_has_no_arguments() {
        let settings = ShellSettings::new().shell_type(ShellType::Sh);
        let (program, args) = shell_program(&settings).unwrap();
        assert_eq!(program, "sh");
        assert!(args.is_empty());
    }

    #[test]
    fn explicit_bash_path_is_used_verbatim() {
        let settings = ShellSettings::new()
            .shell_type(ShellType::Bash)
            .bash_path("/opt/bash/bin/bash");
        let (program, args) = shell_program(&settings).unwrap();
        assert_eq!(program, "/opt/bash/bin/bash");
        assert_eq!(args, vec!["--norc", "--noprofile"]);
    }

    #[test]
    fn detect_shell_type_is_concrete() {
        assert_ne!(detect_shell_type(), ShellType::Auto);
    }

    #[test]
    fn build_shell_command_sets_plain_environment() {
        let settings = ShellSettings::new().shell_type(ShellType::Sh);
        let cmd = build_shell_command(&settings, Some(Path::new("/tmp"))).unwrap();

        assert_eq!(cmd.get_program().to_str().unwrap(), "sh");
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/tmp")));
        let envs: Vec<_> = cmd
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_str()?, v?.to_str()?)))
            .collect();
        assert!(envs.contains(&("TERM", "dumb")));
        assert!(envs.contains(&("NO_COLOR", "1")));
    }

    #[test]
    #[cfg(unix)]
    fn find_in_path_locates_sh() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-binary-name").is_none());
    }
}
