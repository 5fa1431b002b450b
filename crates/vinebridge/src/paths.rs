//! Locating the runner binary and the plugin's Wine prefix.

use crate::arch::PluginArchitecture;
use crate::error::{BridgeError, Result};
use std::path::{Path, PathBuf};

/// Runner binary hosting 64-bit plugins.
pub const RUNNER_BINARY_64: &str = "vinebridge-runner.exe";
/// Runner binary hosting 32-bit plugins.
pub const RUNNER_BINARY_32: &str = "vinebridge-runner-32.exe";

/// Locate the runner binary matching the plugin's architecture.
///
/// The copy sitting next to the shim library wins; a version mismatch between
/// the two halves of the bridge is far more likely to bite than a stale
/// `$PATH` entry. Falls back to a `$PATH` walk for system-wide installs.
pub fn find_runner(arch: PluginArchitecture) -> Result<PathBuf> {
    let name = runner_binary_name(arch);

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join(name);
            if sibling.is_file() {
                return Ok(sibling);
            }
        }
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(BridgeError::RunnerNotFound {
        name: name.to_string(),
    })
}

pub fn runner_binary_name(arch: PluginArchitecture) -> &'static str {
    match arch {
        PluginArchitecture::Win32 => RUNNER_BINARY_32,
        PluginArchitecture::Win64 => RUNNER_BINARY_64,
    }
}

/// Find the Wine prefix governing a plugin.
///
/// An explicit `WINEPREFIX` always wins, matching Wine's own precedence.
/// Otherwise the plugin is assumed to live inside its prefix and the
/// directory tree is walked upwards looking for one. No silent fallback to
/// `~/.wine`: loading a plugin into the wrong prefix produces failures far
/// harder to diagnose than this error.
pub fn find_wine_prefix(plugin_path: &Path) -> Result<PathBuf> {
    if let Some(prefix) = std::env::var_os("WINEPREFIX") {
        return Ok(PathBuf::from(prefix));
    }
    discover_prefix(plugin_path).ok_or_else(|| BridgeError::PrefixNotFound(plugin_path.to_path_buf()))
}

/// Walk from the plugin upwards until a directory containing `dosdevices`
/// shows up. That subdirectory exists in every initialized Wine prefix and
/// essentially nowhere else.
pub fn discover_prefix(plugin_path: &Path) -> Option<PathBuf> {
    plugin_path
        .ancestors()
        .skip(1)
        .find(|dir| dir.join("dosdevices").is_dir())
        .map(Path::to_path_buf)
}

/// File stem of the plugin image, used to label sockets and log lines.
pub fn plugin_base_name(plugin_path: &Path) -> String {
    plugin_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plugin".to_string())
}
