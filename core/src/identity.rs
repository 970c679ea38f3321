//! Drive identity markers.
//!
//! Every managed drive carries a small JSON record at a fixed location
//! under its root. The record is written exactly once, either by the
//! system-root self-provisioning on first boot or by an external
//! provisioning tool for roaming drives, and is read-only afterwards. A
//! drive's identity and kind never change while it is mounted.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::error::FileIOError;

use wayfarer_ignore_rules::STORAGE_AREA;

/// File name of the identity marker inside the storage area.
pub const IDENTITY_FILE: &str = "drive.json";

/// Directory name of the metadata mirror inside the storage area.
pub const MIRROR_DIR: &str = "Mirror";

#[derive(Error, Debug)]
pub enum IdentityError {
	#[error("drive has no identity marker: <path='{}'>", .0.display())]
	NotFound(Box<Path>),
	#[error("malformed identity marker: {0}")]
	Malformed(#[from] serde_json::Error),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
	System,
	Roaming,
}

/// On-disk identity record. `uuid` here is the managed identity, not the
/// block device's filesystem uuid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveIdentity {
	pub uuid: String,
	pub kind: IdentityKind,
	pub label: String,
	pub created_at: i64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub host: Option<String>,
}

impl DriveIdentity {
	pub fn is_valid_roaming(&self) -> bool {
		self.kind == IdentityKind::Roaming && !self.uuid.is_empty()
	}
}

/// Absolute path of the identity marker for a drive rooted at `root`.
pub fn identity_path(root: impl AsRef<Path>) -> PathBuf {
	root.as_ref().join(STORAGE_AREA).join(IDENTITY_FILE)
}

/// Absolute path of the metadata mirror for a drive rooted at `root`.
pub fn mirror_root(root: impl AsRef<Path>) -> PathBuf {
	root.as_ref().join(STORAGE_AREA).join(MIRROR_DIR)
}

/// Reads and parses the identity marker of the drive rooted at `root`.
pub async fn read(root: impl AsRef<Path>) -> Result<DriveIdentity, IdentityError> {
	let path = identity_path(root);

	let bytes = match fs::read(&path).await {
		Ok(bytes) => bytes,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			return Err(IdentityError::NotFound(path.into_boxed_path()))
		}
		Err(e) => return Err(FileIOError::from((path, e)).into()),
	};

	Ok(serde_json::from_slice(&bytes)?)
}

/// Ensures the system root carries an identity marker and a mirror root,
/// minting a fresh identity on first boot.
pub async fn ensure_system_identity(
	system_root: impl AsRef<Path>,
	label: &str,
) -> Result<DriveIdentity, IdentityError> {
	let system_root = system_root.as_ref();

	let mirror = mirror_root(system_root);
	fs::create_dir_all(&mirror)
		.await
		.map_err(|e| FileIOError::from((&mirror, e)))?;

	match read(system_root).await {
		Ok(identity) => Ok(identity),
		Err(IdentityError::NotFound(_)) => {
			let identity = DriveIdentity {
				uuid: Uuid::new_v4().to_string(),
				kind: IdentityKind::System,
				label: label.to_string(),
				created_at: Utc::now().timestamp(),
				host: read_host_name().await,
			};

			let path = identity_path(system_root);
			fs::write(&path, serde_json::to_vec_pretty(&identity)?)
				.await
				.map_err(|e| FileIOError::from((&path, e)))?;

			info!(uuid = %identity.uuid, "Minted new system root identity;");

			Ok(identity)
		}
		Err(e) => Err(e),
	}
}

async fn read_host_name() -> Option<String> {
	fs::read_to_string("/etc/hostname")
		.await
		.ok()
		.map(|s| s.trim().to_string())
		.filter(|s| !s.is_empty())
}
