//! Environment bootstrap for tonpixo.
//!
//! Env files are loaded before configuration is resolved. The lookup order is
//!
//!   explicit env vars > `.env.{profile}` > `.env.local` > `.env` > `~/.tonpixo/.env`
//!
//! dotenvy never overwrites variables that are already set, so loading files
//! from most to least specific gives the priority above. The profile comes
//! from `TONPIXO_ENV` / `APP_ENV`, or else from the checked-out git branch.

use std::path::{Path, PathBuf};

/// Git branches that imply an env profile.
const BRANCH_PROFILES: [(&str, &str); 4] = [
    ("dev", "dev"),
    ("development", "dev"),
    ("main", "main"),
    ("master", "main"),
];

/// Base directory for user-level state: `~/.tonpixo`.
pub fn tonpixo_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tonpixo")
}

/// Path to the user-level `.env` file: `~/.tonpixo/.env`.
pub fn tonpixo_env_path() -> PathBuf {
    tonpixo_home().join(".env")
}

fn normalize(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Read the current branch name from `<repo_root>/.git/HEAD`.
///
/// Returns `None` for detached heads or when there is no repository.
pub fn detect_git_branch(repo_root: &Path) -> Option<String> {
    let head = std::fs::read_to_string(repo_root.join(".git").join("HEAD")).ok()?;
    let reference = head.trim().strip_prefix("ref: ")?.trim();
    reference
        .strip_prefix("refs/heads/")
        .map(|branch| branch.to_string())
}

/// Pick the env profile: an explicit value wins, otherwise a known branch.
pub fn resolve_profile(explicit: Option<&str>, branch: Option<&str>) -> Option<String> {
    if let Some(profile) = normalize(explicit) {
        return Some(profile);
    }
    let branch = normalize(branch)?;
    BRANCH_PROFILES
        .iter()
        .find(|(name, _)| *name == branch)
        .map(|(_, profile)| profile.to_string())
}

/// Env file names to try, most specific first, without duplicates.
pub fn env_file_candidates(profile: Option<&str>) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(profile) = profile {
        candidates.push(format!(".env.{profile}"));
    }
    for name in [".env.local", ".env"] {
        if !candidates.iter().any(|c| c == name) {
            candidates.push(name.to_string());
        }
    }
    candidates
}

/// Load project env files from `base_dir`. Returns the names of the files
/// that were found and loaded.
pub fn load_project_env(base_dir: &Path) -> Vec<String> {
    let explicit = std::env::var("TONPIXO_ENV")
        .ok()
        .or_else(|| std::env::var("APP_ENV").ok());
    let branch = if normalize(explicit.as_deref()).is_none() {
        detect_git_branch(base_dir)
    } else {
        None
    };
    let profile = resolve_profile(explicit.as_deref(), branch.as_deref());

    let mut loaded = Vec::new();
    for name in env_file_candidates(profile.as_deref()) {
        let path = base_dir.join(&name);
        if !path.exists() {
            continue;
        }
        match dotenvy::from_path(&path) {
            Ok(()) => loaded.push(name),
            Err(e) => tracing::warn!("Failed to load {}: {}", path.display(), e),
        }
    }

    if let Some(profile) = profile {
        tracing::debug!(profile = %profile, files = ?loaded, "Loaded project env files");
    }
    loaded
}

/// Load the current directory's env files, then `~/.tonpixo/.env`.
pub fn load_tonpixo_env() {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    load_project_env(&cwd);

    let path = tonpixo_env_path();
    if path.exists()
        && let Err(e) = dotenvy::from_path(&path)
    {
        tracing::warn!("Failed to load {}: {}", path.display(), e);
    }
}
