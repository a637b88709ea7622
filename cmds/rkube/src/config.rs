//! Configuration file support for rkube
//!
//! Supports `.rkube.yaml` files that can be placed anywhere in the directory
//! hierarchy. rkube searches from the working directory upward to the filesystem root.

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::k8s::{retry::RetryPolicy, wait::WaitStrategy};

/// The name of the config file rkube looks for
pub const CONFIG_FILE_NAME: &str = ".rkube.yaml";

/// Timeout for waits when neither the file nor the command line sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Root configuration structure for .rkube.yaml
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RkubeConfig {
	/// Field manager recorded on every write.
	#[serde(default)]
	pub field_manager: Option<String>,

	/// Namespace for namespaced objects that declare none.
	#[serde(default)]
	pub namespace: Option<String>,

	/// Kubeconfig context to use instead of the current one.
	#[serde(default)]
	pub context: Option<String>,

	#[serde(default)]
	pub wait_strategy: Option<WaitStrategy>,

	#[serde(default)]
	pub timeout_seconds: Option<u64>,

	/// Conflict retry policy. Unset fields keep their defaults.
	#[serde(default)]
	pub retry: Option<RetryPolicy>,
}

impl RkubeConfig {
	/// Load config by searching from the given directory upward
	pub fn load_from_directory(start_dir: &Path) -> Result<Option<Self>> {
		if let Some(config_path) = find_config_file(start_dir) {
			let config = Self::load_from_file(&config_path)?;
			Ok(Some(config))
		} else {
			Ok(None)
		}
	}

	/// Load config from a specific file path
	pub fn load_from_file(path: &Path) -> Result<Self> {
		let content = fs::read_to_string(path)
			.with_context(|| format!("failed to read config file: {}", path.display()))?;
		let config: RkubeConfig = serde_yaml::from_str(&content)
			.with_context(|| format!("failed to parse config file: {}", path.display()))?;
		if let Some(retry) = &config.retry {
			retry
				.validate()
				.with_context(|| format!("invalid retry policy in {}", path.display()))?;
		}
		Ok(config)
	}

	pub fn timeout(&self) -> Duration {
		self.timeout_seconds
			.map_or(DEFAULT_TIMEOUT, Duration::from_secs)
	}

	pub fn retry_policy(&self) -> RetryPolicy {
		self.retry.unwrap_or_default()
	}
}

/// Search for a config file starting from `start_dir` and walking up to the filesystem root
pub fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
	let mut current = start_dir.to_path_buf();

	// Canonicalize if possible to handle relative paths
	if let Ok(canonical) = current.canonicalize() {
		current = canonical;
	}

	loop {
		let config_path = current.join(CONFIG_FILE_NAME);
		if config_path.exists() {
			return Some(config_path);
		}

		match current.parent() {
			Some(parent) if parent != current => current = parent.to_path_buf(),
			_ => return None,
		}
	}
}

#[cfg(test)]
mod tests {
	use indoc::indoc;
	use rstest::rstest;
	use tempfile::TempDir;

	use super::*;

	#[test]
	fn test_find_config_in_parent_dir() {
		let temp = TempDir::new().unwrap();
		let config_path = temp.path().join(CONFIG_FILE_NAME);
		fs::write(&config_path, "namespace: team-a\n").unwrap();

		let subdir = temp.path().join("subdir");
		fs::create_dir(&subdir).unwrap();

		let found = find_config_file(&subdir);
		// Compare file names only to avoid canonicalization issues on macOS
		assert!(found.is_some());
		assert_eq!(found.unwrap().file_name(), config_path.file_name());
	}

	#[test]
	fn test_no_config_found() {
		let temp = TempDir::new().unwrap();
		assert!(find_config_file(temp.path()).is_none());
		assert!(RkubeConfig::load_from_directory(temp.path()).unwrap().is_none());
	}

	#[test]
	fn test_load_full_config() {
		let temp = TempDir::new().unwrap();
		let config_path = temp.path().join(CONFIG_FILE_NAME);
		fs::write(
			&config_path,
			indoc! {"
				fieldManager: deployer
				namespace: team-a
				context: staging
				waitStrategy: hookOnly
				timeoutSeconds: 60
				retry:
				  steps: 3
				  initialDelayMillis: 50
			"},
		)
		.unwrap();

		let config = RkubeConfig::load_from_file(&config_path).unwrap();
		assert_eq!(config.field_manager.as_deref(), Some("deployer"));
		assert_eq!(config.context.as_deref(), Some("staging"));
		assert_eq!(config.wait_strategy, Some(WaitStrategy::HookOnly));
		assert_eq!(config.timeout(), Duration::from_secs(60));

		let retry = config.retry_policy();
		assert_eq!(retry.steps, 3);
		assert_eq!(retry.initial_delay, Duration::from_millis(50));
		assert_eq!(retry.factor, 1.0);
	}

	#[test]
	fn test_defaults() {
		let config = RkubeConfig::default();
		assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
		assert_eq!(config.retry_policy(), RetryPolicy::default());
	}

	#[rstest]
	#[case::huge_factor("retry:\n  factor: .inf\n", "retry factor")]
	#[case::nan_jitter("retry:\n  jitter: .nan\n", "retry jitter")]
	fn test_bad_retry_policy_is_rejected(#[case] content: &str, #[case] message: &str) {
		let temp = TempDir::new().unwrap();
		let config_path = temp.path().join(CONFIG_FILE_NAME);
		fs::write(&config_path, content).unwrap();

		let err = RkubeConfig::load_from_file(&config_path).unwrap_err();
		assert!(err.to_string().contains("invalid retry policy"));
		assert!(format!("{err:#}").contains(message));
	}

	#[test]
	fn test_unknown_wait_strategy_is_rejected() {
		let temp = TempDir::new().unwrap();
		let config_path = temp.path().join(CONFIG_FILE_NAME);
		fs::write(&config_path, "waitStrategy: eventually\n").unwrap();

		let err = RkubeConfig::load_from_file(&config_path).unwrap_err();
		assert!(err.to_string().contains("failed to parse config file"));
	}
}
