//! Drive discovery and reconciliation.
//!
//! The reconciler polls the block device inventory, mounts newly seen
//! devices under the managed mount root, validates their identity
//! markers and announces accepted roaming drives to the rest of the
//! daemon. Drive identity is read once at mount time and never changes
//! afterwards.

pub mod error;
pub mod inventory;
pub mod mount;
pub mod reconciler;
pub mod users;

pub use error::VolumeError;
pub use inventory::{DeviceInventory, DeviceSnapshot, LsblkInventory};
pub use mount::{Mounter, SysMounter};
pub use reconciler::Reconciler;

use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use crate::identity;

/// Drive kind, fixed at mount time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveKind {
	/// The always-present primary drive hosting the canonical mirror.
	System,
	/// Removable storage carrying a roaming identity marker.
	Roaming,
}

/// An accepted, mounted drive. Identity is immutable post-mount.
#[derive(Debug, Clone)]
pub struct Drive {
	/// Managed identity uuid from the drive's marker, not the block
	/// device's filesystem uuid.
	pub uuid: String,
	pub root: PathBuf,
	pub kind: DriveKind,
	pub label: String,
}

impl Drive {
	pub fn is_roaming(&self) -> bool {
		self.kind == DriveKind::Roaming
	}

	/// The drive-local metadata mirror root.
	pub fn mirror_root(&self) -> PathBuf {
		identity::mirror_root(&self.root)
	}

	/// The per-user directory root on this drive.
	pub fn users_root(&self) -> PathBuf {
		self.root.join(crate::hologram::USERS_PREFIX)
	}

	/// Resolves an absolute path on this drive to its drive-relative form.
	pub fn relative_path<'p>(&self, path: &'p Path) -> Option<&'p Path> {
		path.strip_prefix(&self.root).ok()
	}
}

/// Announcements from the reconciler to the daemon loop.
#[derive(Debug, Clone)]
pub enum DriveEvent {
	/// A roaming drive passed identity validation and is mounted; the
	/// daemon must register a watch and schedule an initial scan.
	Mounted(Arc<Drive>),
}
