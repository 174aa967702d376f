// Per-repository review configuration
// Read from a file at the repository root; absence means defaults


use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path};

use crate::{Result, ReviewError};

/// File name looked up at the repository root
pub const REPO_CONFIG_FILE: &str = ".code-review.toml";

/// Directories never indexed regardless of repository settings
pub const DEFAULT_EXCLUDE_DIRS: &[&str] = &[
    ".git",
    ".github",
    "vendor",
    "node_modules",
    "target",
    "build",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RepoConfig {
    /// Extra reviewer guidance appended to prompts
    pub custom_instructions: Vec<String>,
    /// Directory names (or repo-relative prefixes when they contain `/`)
    pub exclude_dirs: Vec<String>,
    /// Extensions, leading dot optional
    pub exclude_exts: Vec<String>,
}

impl RepoConfig {
    /// Load the repository's review settings, falling back to defaults when the file is absent.
    #[inline]
    pub fn load<P: AsRef<Path>>(repo_path: P) -> Result<Self> {
        let config_path = repo_path.as_ref().join(REPO_CONFIG_FILE);
        if !config_path.exists() {
            tracing::debug!(
                "No {} in {}, using defaults",
                REPO_CONFIG_FILE,
                repo_path.as_ref().display()
            );
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        toml::from_str(&content).map_err(|e| {
            ReviewError::Config(format!("Failed to parse {}: {}", config_path.display(), e))
        })
    }

    /// Defaults unioned with the repository's own directory excludes, sorted and deduplicated.
    #[inline]
    pub fn effective_exclude_dirs(&self) -> Vec<String> {
        DEFAULT_EXCLUDE_DIRS
            .iter()
            .map(|dir| (*dir).to_string())
            .chain(self.exclude_dirs.iter().map(|dir| normalize_dir(dir)))
            .filter(|dir| !dir.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Normalized extension excludes: lowercase, no leading dot.
    #[inline]
    pub fn normalized_exts(&self) -> Vec<String> {
        self.exclude_exts
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect()
    }

    /// Whether a directory entry should be pruned while walking the tree.
    #[inline]
    pub fn is_excluded_dir(&self, relative_dir: &Path) -> bool {
        let excludes = self.effective_exclude_dirs();
        dir_matches(relative_dir, &excludes)
    }

    /// Whether a repository-relative file path falls under an excluded directory or extension.
    #[inline]
    pub fn is_excluded(&self, relative_path: &Path) -> bool {
        let excludes = self.effective_exclude_dirs();
        let exts = self.normalized_exts();
        is_path_excluded(relative_path, &excludes, &exts)
    }

    /// Drop excluded entries from a list of repository-relative paths.
    #[inline]
    pub fn filter_paths<I, S>(&self, paths: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let excludes = self.effective_exclude_dirs();
        let exts = self.normalized_exts();
        paths
            .into_iter()
            .filter(|path| !is_path_excluded(Path::new(path.as_ref()), &excludes, &exts))
            .map(|path| path.as_ref().to_string())
            .collect()
    }

    /// Custom instructions joined for prompt rendering
    #[inline]
    pub fn instructions(&self) -> String {
        self.custom_instructions.join("\n")
    }
}

fn normalize_dir(dir: &str) -> String {
    dir.trim().trim_matches('/').replace('\\', "/")
}

fn dir_matches(relative_dir: &Path, excludes: &[String]) -> bool {
    let normalized = relative_dir.to_string_lossy().replace('\\', "/");
    let normalized = normalized.trim_start_matches("./").trim_matches('/');

    let components: Vec<&str> = relative_dir
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();

    // Hidden directories are never indexed
    if components.iter().any(|part| part.starts_with('.')) {
        return true;
    }

    excludes.iter().any(|exclude| {
        if exclude.contains('/') {
            normalized == exclude.as_str() || normalized.starts_with(&format!("{exclude}/"))
        } else {
            components.iter().any(|part| *part == exclude.as_str())
        }
    })
}

fn is_path_excluded(relative_path: &Path, excludes: &[String], exts: &[String]) -> bool {
    let in_excluded_dir = relative_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .is_some_and(|parent| dir_matches(parent, excludes));
    if in_excluded_dir {
        return true;
    }

    relative_path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| exts.iter().any(|excluded| excluded.eq_ignore_ascii_case(ext)))
}
