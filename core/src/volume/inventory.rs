//! Block device inventory.
//!
//! The reconciler only cares about devices that expose both a filesystem
//! uuid and a filesystem type; everything else cannot be mounted and is
//! invisible to it. The production implementation shells out to
//! `lsblk -J` and flattens its device tree.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::VolumeError;

/// One mountable device as seen at a single reconciliation tick. The
/// snapshot set is diffed between ticks, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceSnapshot {
	/// Filesystem uuid of the block device.
	pub uuid: String,
	/// Kernel device name, e.g. `sdb1`.
	pub name: String,
	pub fstype: String,
	/// Current mountpoint, if any.
	pub mountpoint: Option<PathBuf>,
}

impl DeviceSnapshot {
	/// Device node path for mounting.
	pub fn node(&self) -> PathBuf {
		PathBuf::from("/dev").join(&self.name)
	}
}

/// Enumeration seam so the reconciler can run against fabricated
/// hardware in tests.
#[async_trait]
pub trait DeviceInventory: Send + Sync {
	async fn enumerate(&self) -> Result<Vec<DeviceSnapshot>, VolumeError>;
}

/// Production inventory backed by `lsblk -J`.
#[derive(Debug, Default)]
pub struct LsblkInventory;

#[async_trait]
impl DeviceInventory for LsblkInventory {
	async fn enumerate(&self) -> Result<Vec<DeviceSnapshot>, VolumeError> {
		let output = Command::new("lsblk")
			.args(["-J", "-o", "NAME,UUID,FSTYPE,MOUNTPOINT"])
			.output()
			.await
			.map_err(|e| VolumeError::Inventory(format!("failed to run lsblk: {e}")))?;

		if !output.status.success() {
			return Err(VolumeError::Inventory(format!(
				"lsblk exited with {}: {}",
				output.status,
				String::from_utf8_lossy(&output.stderr)
			)));
		}

		let parsed: LsblkOutput = serde_json::from_slice(&output.stdout)?;

		let mut devices = Vec::new();
		for node in parsed.blockdevices {
			flatten(node, &mut devices);
		}

		Ok(devices)
	}
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
	#[serde(default)]
	blockdevices: Vec<LsblkNode>,
}

#[derive(Debug, Deserialize)]
struct LsblkNode {
	name: String,
	uuid: Option<String>,
	fstype: Option<String>,
	mountpoint: Option<PathBuf>,
	#[serde(default)]
	children: Vec<LsblkNode>,
}

fn flatten(node: LsblkNode, out: &mut Vec<DeviceSnapshot>) {
	if let (Some(uuid), Some(fstype)) = (node.uuid, node.fstype) {
		out.push(DeviceSnapshot {
			uuid,
			name: node.name,
			fstype,
			mountpoint: node.mountpoint,
		});
	}

	for child in node.children {
		flatten(child, out);
	}
}
