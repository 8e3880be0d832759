//! CodeMap home-directory layout and language-server executable resolution.
//!
//! The home root resolves, in order: the `CODEMAP_HOME` override,
//! `$XDG_CACHE_HOME/codemap` on non-Windows, then the platform cache
//! directory (`~/.cache/codemap`, `%LOCALAPPDATA%\codemap`). Inside live
//! `bin/` (executable symlinks or shims placed by the installer),
//! `packages/`, `registry/`, `tmp/`, and `graph/<workspace-key>/` for the
//! per-workspace store.
//!
//! The installer itself is an external collaborator; the core only consumes
//! the "resolve executable path for language L" capability expressed by
//! [`ExecutableResolver`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

use crate::language::LanguageSpec;

pub const HOME_ENV: &str = "CODEMAP_HOME";

pub fn codemap_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var(HOME_ENV) {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    if !cfg!(windows) {
        if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
            if !xdg.is_empty() {
                return Ok(PathBuf::from(xdg).join("codemap"));
            }
        }
    }
    dirs::cache_dir()
        .map(|dir| dir.join("codemap"))
        .ok_or_else(|| anyhow!("could not determine a cache directory for the codemap home"))
}

pub fn bin_dir() -> Result<PathBuf> {
    Ok(codemap_home()?.join("bin"))
}

pub fn packages_dir() -> Result<PathBuf> {
    Ok(codemap_home()?.join("packages"))
}

pub fn registry_dir() -> Result<PathBuf> {
    Ok(codemap_home()?.join("registry"))
}

pub fn tmp_dir() -> Result<PathBuf> {
    Ok(codemap_home()?.join("tmp"))
}

/// The store directory for one workspace: `graph/<first 16 hex of
/// sha256(root)>` under home, so distinct workspaces never share a store.
pub fn graph_dir(workspace_root: &Path) -> Result<PathBuf> {
    let mut hasher = Sha256::new();
    hasher.update(workspace_root.to_string_lossy().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    Ok(codemap_home()?.join("graph").join(&digest[..16]))
}

/// Resolution of a language-server executable; implemented by the installer
/// integration, and by stubs in tests.
pub trait ExecutableResolver: Send + Sync {
    fn resolve(&self, spec: &LanguageSpec) -> Result<PathBuf>;
}

/// Default resolver: the home `bin/` directory first (where the installer
/// links executables), then the process PATH.
pub struct ToolchainResolver {
    bin_dir: PathBuf,
}

impl ToolchainResolver {
    pub fn new() -> Result<Self> {
        Ok(Self {
            bin_dir: bin_dir()?,
        })
    }

    pub fn with_bin_dir(bin_dir: PathBuf) -> Self {
        Self { bin_dir }
    }
}

impl ExecutableResolver for ToolchainResolver {
    fn resolve(&self, spec: &LanguageSpec) -> Result<PathBuf> {
        let name = normalize_executable(spec.server_command);
        let installed = self.bin_dir.join(&name);
        if installed.is_file() {
            return Ok(installed);
        }
        if cfg!(windows) {
            let shim = self.bin_dir.join(format!("{}.bat", spec.server_command));
            if shim.is_file() {
                return Ok(shim);
            }
        }
        which::which(&name).with_context(|| {
            format!(
                "no {} executable for {} in {} or on PATH",
                spec.server_command,
                spec.language,
                self.bin_dir.display()
            )
        })
    }
}

/// Platform-specific executable name (`.exe` suffix on Windows).
fn normalize_executable(name: &str) -> String {
    if cfg!(windows) && !name.ends_with(".exe") {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}
