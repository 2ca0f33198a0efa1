//! Where llm-gate keeps its files.
//!
//! - config: `~/.config/llm-gate/config.toml`
//! - learned limits: `<state dir>/adaptive-limits.json`
//! - coordination: `$XDG_RUNTIME_DIR/llm-gate/coordinator`, else
//!   `/tmp/llm-gate-<euid>/coordinator`

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "llm-gate";

const STATE_FILE_NAME: &str = "adaptive-limits.json";
const COORDINATION_DIR_NAME: &str = "coordinator";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Per-user runtime root. An unset or empty `xdg_runtime` falls back to a
/// uid-scoped directory under `/tmp` so two users never share files.
pub fn resolve_runtime_dir(xdg_runtime: Option<&Path>, euid: u32) -> PathBuf {
    match xdg_runtime {
        Some(root) if !root.as_os_str().is_empty() => root.join(APP_NAME),
        _ => Path::new("/tmp").join(format!("{APP_NAME}-{euid}")),
    }
}

#[cfg(unix)]
fn euid() -> u32 {
    // SAFETY: geteuid cannot fail and touches no memory.
    unsafe { libc::geteuid() }
}

#[cfg(not(unix))]
fn euid() -> u32 {
    0
}

pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Per-user state directory; falls back to the temp dir when HOME is unknown.
pub fn state_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.state_dir().unwrap_or(dirs.data_local_dir()).to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join(format!("{APP_NAME}-state")))
}

/// Runtime directory shared by all instances of one user.
pub fn runtime_dir() -> PathBuf {
    let xdg_runtime = std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from);
    resolve_runtime_dir(xdg_runtime.as_deref(), euid())
}

pub fn default_state_path() -> PathBuf {
    state_dir().join(STATE_FILE_NAME)
}

pub fn default_coordination_dir() -> PathBuf {
    runtime_dir().join(COORDINATION_DIR_NAME)
}
