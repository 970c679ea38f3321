//! Daemon configuration.
//!
//! A single JSON file with defaults for every field, so an empty or
//! absent file yields a fully working configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::error::FileIOError;

use wayfarer_ignore_rules::IgnoreRules;

/// File name of the daemon configuration inside its data directory.
pub const CONFIG_FILE_NAME: &str = "wayfarer.json";

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("malformed config file: {0}")]
	Malformed(#[from] serde_json::Error),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

/// What the local-deletion cascade removes when several roaming drives
/// carry the same relative path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
	/// Delete the first physical copy found, leave the rest alone.
	#[default]
	FirstMatch,
	/// Delete every physical copy sharing the relative path.
	AllCopies,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
	/// Directory the reconciler mounts roaming drives under, one
	/// subdirectory per block-device uuid.
	pub mount_root: PathBuf,
	/// Root whose storage area holds the system identity marker and the
	/// canonical metadata mirror.
	pub system_root: PathBuf,
	/// Real per-user namespace root holograms are projected into.
	pub users_root: PathBuf,
	/// Label minted into the system identity on first boot.
	pub system_label: String,
	/// Reconciliation polling interval, in seconds.
	pub poll_interval_secs: u64,
	/// Number of event pipeline workers.
	pub worker_count: usize,
	/// Capacity of the event pipeline queue; submission blocks when full.
	pub event_queue_size: usize,
	pub cascade_policy: CascadePolicy,
	pub ignore_rules: IgnoreRules,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self {
			mount_root: PathBuf::from("/Drives/Roaming"),
			system_root: PathBuf::from("/"),
			users_root: PathBuf::from("/home"),
			system_label: "SystemRoot".to_string(),
			poll_interval_secs: 2,
			worker_count: 4,
			event_queue_size: 128,
			cascade_policy: CascadePolicy::default(),
			ignore_rules: IgnoreRules::default(),
		}
	}
}

impl DaemonConfig {
	/// Loads the configuration from `path`, falling back to defaults when
	/// the file does not exist. Malformed files are an error rather than a
	/// silent fallback.
	pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();

		match fs::read(path).await {
			Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
			Err(e) => Err(FileIOError::from((path, e)).into()),
		}
	}

	pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
		let path = path.as_ref();

		fs::write(path, serde_json::to_vec_pretty(self)?)
			.await
			.map_err(|e| FileIOError::from((path, e)).into())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[tokio::test]
	async fn absent_file_yields_defaults() {
		let dir = tempdir().unwrap();
		let config = DaemonConfig::load(dir.path().join(CONFIG_FILE_NAME))
			.await
			.unwrap();

		assert_eq!(config.poll_interval_secs, 2);
		assert_eq!(config.cascade_policy, CascadePolicy::FirstMatch);
	}

	#[tokio::test]
	async fn partial_file_fills_missing_fields() {
		let dir = tempdir().unwrap();
		let path = dir.path().join(CONFIG_FILE_NAME);
		tokio::fs::write(&path, br#"{"poll_interval_secs": 10}"#)
			.await
			.unwrap();

		let config = DaemonConfig::load(&path).await.unwrap();

		assert_eq!(config.poll_interval_secs, 10);
		assert_eq!(config.users_root, PathBuf::from("/home"));
	}

	#[tokio::test]
	async fn round_trip() {
		let dir = tempdir().unwrap();
		let path = dir.path().join(CONFIG_FILE_NAME);

		let mut config = DaemonConfig::default();
		config.cascade_policy = CascadePolicy::AllCopies;
		config.save(&path).await.unwrap();

		let loaded = DaemonConfig::load(&path).await.unwrap();
		assert_eq!(loaded.cascade_policy, CascadePolicy::AllCopies);
	}
}
