use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the per-mirror-root configuration file.
pub const CONFIG_FILE: &str = "repomirror.json";

/// One remote repository and its local mirror directory.
///
/// Produced by discovery and treated as read-only by every operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    /// Clone URL, with credentials embedded when a token is configured.
    pub url: String,
    /// Local directory of the mirror, relative to the mirror root.
    pub dir: String,
    /// Default branch as reported by the hosting service.
    pub branch: String,
    /// Upstream clone URL; set only when the repository is a fork.
    #[serde(default)]
    pub parent: String,
}

/// The persisted mirror configuration: account identity plus repository list.
///
/// Loaded once per command invocation and treated as read-only shared state
/// by pull/push/status; only `init`/`update` mutate and re-save it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub full_name: String,
    pub username: String,
    pub base_dir: String,
    /// GitHub Enterprise API endpoint; empty for github.com.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    pub email: String,
    /// Preferred worker count; 0 means "not set".
    #[serde(default)]
    pub concurrency: usize,
    /// One subdirectory per owner under the base directory.
    #[serde(default)]
    pub subdirs: bool,
    /// Per-repository operation deadline in seconds; 0 disables.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub repos: Vec<Repo>,
}

fn default_timeout_secs() -> u64 {
    600
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            full_name: String::new(),
            username: String::new(),
            base_dir: String::new(),
            base_url: String::new(),
            token: String::new(),
            email: String::new(),
            concurrency: 0,
            subdirs: false,
            timeout_secs: default_timeout_secs(),
            repos: Vec::new(),
        }
    }
}

/// Distinct "not initialized" condition: no configuration file was found in
/// the working directory or any ancestor.
#[derive(Debug)]
pub struct NotInitialized;

impl fmt::Display for NotInitialized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "couldn't find {}. Make sure that you are inside the mirror \
             directory and that init has been run successfully.",
            CONFIG_FILE
        )
    }
}

impl std::error::Error for NotInitialized {}

impl Configuration {
    /// Load the configuration, searching the working directory and its
    /// ancestors up to the filesystem root.
    ///
    /// On success the process working directory is moved to the directory
    /// holding the file, so the relative repository dirs stored inside
    /// resolve naturally.
    pub fn load() -> Result<Self> {
        let mut dir = std::env::current_dir().context("failed to get working directory")?;

        loop {
            let candidate = dir.join(CONFIG_FILE);
            if candidate.is_file() {
                let config = Self::load_from(&candidate)?;
                std::env::set_current_dir(&dir)
                    .with_context(|| format!("failed to enter {}", dir.display()))?;
                debug!("loaded configuration from {}", candidate.display());
                return Ok(config);
            }

            if !dir.pop() {
                return Err(NotInitialized.into());
            }
        }
    }

    /// Load and parse a specific configuration file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let config: Configuration = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        Ok(config)
    }

    /// Persist the configuration to `dir`, atomically.
    ///
    /// The file is written next to its final location and renamed into
    /// place, so a crash mid-write never leaves a half-written file behind.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("failed to serialize configuration")?;

        let target = dir.join(CONFIG_FILE);
        let staging = dir.join(format!("{}.tmp", CONFIG_FILE));

        std::fs::write(&staging, content)
            .with_context(|| format!("failed to write {}", staging.display()))?;
        std::fs::rename(&staging, &target)
            .with_context(|| format!("failed to move {} into place", target.display()))?;

        debug!("saved configuration to {}", target.display());
        Ok(())
    }

    /// Resolve the worker-pool size: explicit flag, then the stored
    /// preference, then `max(4, 2 × CPU cores)`. Zero counts as unset.
    pub fn effective_concurrency(&self, flag: Option<usize>) -> usize {
        match flag {
            Some(n) if n > 0 => n,
            _ if self.concurrency > 0 => self.concurrency,
            _ => (num_cpus::get() * 2).max(4),
        }
    }

    /// Local path of the configuration file for a given mirror root.
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn sample() -> Configuration {
        Configuration {
            full_name: "Test User".to_string(),
            username: "testuser".to_string(),
            base_dir: "mirror".to_string(),
            base_url: String::new(),
            token: "tok".to_string(),
            email: "testuser@users.noreply.github.com".to_string(),
            concurrency: 8,
            subdirs: false,
            timeout_secs: 600,
            repos: vec![Repo {
                url: "https://host/u/r1".to_string(),
                dir: "mirror/r1".to_string(),
                branch: "main".to_string(),
                parent: String::new(),
            }],
        }
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let config = sample();
        config.save(temp.path()).unwrap();

        let loaded = Configuration::load_from(&Configuration::path_in(temp.path())).unwrap();
        assert_eq!(loaded.username, "testuser");
        assert_eq!(loaded.concurrency, 8);
        assert_eq!(loaded.repos, config.repos);
    }

    #[test]
    fn test_missing_optional_fields_get_defaults() {
        let json = r#"{
            "full_name": "Test User",
            "username": "testuser",
            "base_dir": "mirror",
            "email": "t@example.com"
        }"#;
        let config: Configuration = serde_json::from_str(json).unwrap();

        assert_eq!(config.concurrency, 0);
        assert!(!config.subdirs);
        assert_eq!(config.timeout_secs, 600);
        assert!(config.repos.is_empty());
        assert!(config.token.is_empty());
    }

    #[test]
    #[serial]
    fn test_load_searches_ancestor_directories() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        sample().save(&root).unwrap();

        let nested = root.join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(&nested).unwrap();
        let result = Configuration::load();
        let landed = std::env::current_dir().unwrap();
        std::env::set_current_dir(original).unwrap();

        let config = result.unwrap();
        assert_eq!(config.username, "testuser");
        // load moves the process into the mirror root
        assert_eq!(landed, root);
    }

    #[test]
    #[serial]
    fn test_load_without_config_reports_not_initialized() {
        let temp = TempDir::new().unwrap();

        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(temp.path()).unwrap();
        let result = Configuration::load();
        std::env::set_current_dir(original).unwrap();

        let err = result.unwrap_err();
        assert!(err.downcast_ref::<NotInitialized>().is_some());
    }

    #[test]
    fn test_effective_concurrency_precedence() {
        let mut config = sample();

        // explicit flag wins
        assert_eq!(config.effective_concurrency(Some(3)), 3);
        // zero flag counts as unset, stored preference applies
        assert_eq!(config.effective_concurrency(Some(0)), 8);
        assert_eq!(config.effective_concurrency(None), 8);

        // neither set: derived from CPU count, never below 4
        config.concurrency = 0;
        assert!(config.effective_concurrency(None) >= 4);
    }

    #[test]
    fn test_save_leaves_no_staging_file() {
        let temp = TempDir::new().unwrap();
        sample().save(temp.path()).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
