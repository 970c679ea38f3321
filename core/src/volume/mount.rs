//! Mount and unmount primitives.
//!
//! The production implementation shells out to `mount`/`umount`, falling
//! back to a forced unmount before giving up, and answers mountpoint
//! queries from `/proc/mounts`.

use std::path::Path;

use async_trait::async_trait;
use tokio::{fs, process::Command};

use super::VolumeError;

/// Filesystems without POSIX permission bits get a permissive umask so
/// every user can reach their provisioned directory.
const PERMISSIVE_FSTYPES: [&str; 5] = ["vfat", "exfat", "ntfs", "ntfs-3g", "msdos"];

pub fn permissive_options(fstype: &str) -> Option<&'static str> {
	PERMISSIVE_FSTYPES
		.contains(&fstype)
		.then_some("umask=000")
}

/// Mount seam so the reconciler can run without root (and without real
/// hardware) in tests.
#[async_trait]
pub trait Mounter: Send + Sync {
	async fn mount(&self, node: &Path, target: &Path, fstype: &str) -> Result<(), VolumeError>;

	async fn unmount(&self, target: &Path) -> Result<(), VolumeError>;

	async fn is_mount_point(&self, path: &Path) -> bool;
}

/// Production mounter shelling out to util-linux.
#[derive(Debug, Default)]
pub struct SysMounter;

#[async_trait]
impl Mounter for SysMounter {
	async fn mount(&self, node: &Path, target: &Path, fstype: &str) -> Result<(), VolumeError> {
		let mut command = Command::new("mount");
		command.arg(node).arg(target);
		if let Some(options) = permissive_options(fstype) {
			command.args(["-o", options]);
		}

		let output = command.output().await.map_err(|e| VolumeError::MountFailure {
			device: node.display().to_string(),
			reason: e.to_string(),
		})?;

		if output.status.success() {
			Ok(())
		} else {
			Err(VolumeError::MountFailure {
				device: node.display().to_string(),
				reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			})
		}
	}

	async fn unmount(&self, target: &Path) -> Result<(), VolumeError> {
		let output = Command::new("umount")
			.arg(target)
			.output()
			.await
			.map_err(|e| VolumeError::UnmountFailure(target.display().to_string(), e.to_string()))?;

		if output.status.success() {
			return Ok(());
		}

		// A busy device may still yield to a forced unmount.
		let forced = Command::new("umount")
			.arg("-f")
			.arg(target)
			.output()
			.await
			.map_err(|e| VolumeError::UnmountFailure(target.display().to_string(), e.to_string()))?;

		if forced.status.success() {
			Ok(())
		} else {
			Err(VolumeError::UnmountFailure(
				target.display().to_string(),
				String::from_utf8_lossy(&forced.stderr).trim().to_string(),
			))
		}
	}

	async fn is_mount_point(&self, path: &Path) -> bool {
		let Ok(mounts) = fs::read_to_string("/proc/mounts").await else {
			return false;
		};

		mounts
			.lines()
			.filter_map(|line| line.split_whitespace().nth(1))
			.any(|mountpoint| unescape_mount_path(mountpoint) == path.to_string_lossy())
	}
}

/// `/proc/mounts` escapes whitespace in mountpoints as octal sequences.
fn unescape_mount_path(raw: &str) -> String {
	raw.replace("\\040", " ").replace("\\011", "\t")
}
