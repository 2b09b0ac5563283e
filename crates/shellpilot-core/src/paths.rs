use std::env;
use std::path::{Component, Path, PathBuf};

/// Return the user's home directory path.
///
/// Uses HOME on Unix-like systems and USERPROFILE on Windows.
pub fn get_home_dir() -> Result<String, String> {
    if let Ok(home) = env::var("HOME") {
        if !home.is_empty() {
            return Ok(home);
        }
    }

    if let Ok(profile) = env::var("USERPROFILE") {
        if !profile.is_empty() {
            return Ok(profile);
        }
    }

    Err("Home directory not set".to_string())
}

/// Expand a leading `~` in a working directory to the home directory.
///
/// `~user` forms are left alone.
pub fn expand_home(path: &str) -> Result<PathBuf, String> {
    if path == "~" {
        return get_home_dir().map(PathBuf::from);
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return get_home_dir().map(|home| Path::new(&home).join(rest));
    }
    Ok(PathBuf::from(path))
}

/// Check that `component` is exactly one normal path component.
///
/// Session ids end up in artifact paths, so separators and `..` are rejected.
pub fn validate_path_component(component: &str) -> Result<(), String> {
    if component.is_empty() {
        return Err("Path component cannot be empty".to_string());
    }

    let path = Path::new(component);
    let mut components = path.components();

    match components.next() {
        Some(Component::Normal(_))
            if components.next().is_none() && !component.contains(['/', '\\']) =>
        {
            Ok(())
        }
        _ => Err(format!("Invalid path component: {component}")),
    }
}
