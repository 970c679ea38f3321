//! Drive reconciliation loop.
//!
//! Runs on a fixed polling interval, diffing the block device inventory
//! against the previous tick. The diff fast path makes steady states
//! free of mount and unmount calls. Newly seen unmounted devices are
//! claimed and handed to an asynchronous mount worker; at most one
//! worker per device uuid is ever in flight, enforced by a claim guard
//! released on every exit path.

use std::{
	collections::HashSet,
	os::unix::fs::PermissionsExt,
	path::{Path, PathBuf},
	sync::{Arc, Mutex, PoisonError},
};

use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::{
	identity::{self, IdentityError},
	notifier::{Notifier, Urgency},
};

use super::{
	inventory::{DeviceInventory, DeviceSnapshot},
	mount::Mounter,
	users, Drive, DriveEvent, DriveKind, VolumeError,
};

const MOUNTPOINT_MODE: u32 = 0o777;

/// Uuids with an in-flight mount worker. Claims are mutually exclusive.
#[derive(Debug, Default)]
pub struct ClaimSet(Mutex<HashSet<String>>);

impl ClaimSet {
	/// Atomically claims `uuid`, or returns `None` when a worker already
	/// holds it.
	fn try_claim(self: &Arc<Self>, uuid: &str) -> Option<ClaimGuard> {
		let mut claims = self.0.lock().unwrap_or_else(PoisonError::into_inner);

		claims
			.insert(uuid.to_string())
			.then(|| ClaimGuard {
				set: Arc::clone(self),
				uuid: uuid.to_string(),
			})
	}

	fn contains(&self, uuid: &str) -> bool {
		self.0
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.contains(uuid)
	}
}

/// Releases the claim when dropped, covering success, rejection and
/// panic alike.
pub struct ClaimGuard {
	set: Arc<ClaimSet>,
	uuid: String,
}

impl Drop for ClaimGuard {
	fn drop(&mut self) {
		self.set
			.0
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&self.uuid);
	}
}

pub struct Reconciler {
	mount_root: PathBuf,
	inventory: Arc<dyn DeviceInventory>,
	mounter: Arc<dyn Mounter>,
	notifier: Notifier,
	events_tx: async_channel::Sender<DriveEvent>,
	passwd_path: PathBuf,

	claims: Arc<ClaimSet>,
	/// Uuids already logged as foreign-mounted or already-managed, to
	/// keep steady-state logs quiet. Pruned to the current scan.
	skip_cache: Mutex<HashSet<String>>,
	last_snapshot: Mutex<HashSet<DeviceSnapshot>>,
}

impl Reconciler {
	pub fn new(
		mount_root: PathBuf,
		inventory: Arc<dyn DeviceInventory>,
		mounter: Arc<dyn Mounter>,
		notifier: Notifier,
		events_tx: async_channel::Sender<DriveEvent>,
	) -> Self {
		Self {
			mount_root,
			inventory,
			mounter,
			notifier,
			events_tx,
			passwd_path: PathBuf::from("/etc/passwd"),
			claims: Arc::default(),
			skip_cache: Mutex::default(),
			last_snapshot: Mutex::default(),
		}
	}

	/// Overrides the account database location; tests point this at a
	/// fabricated file.
	pub fn with_passwd_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.passwd_path = path.into();
		self
	}

	pub fn mount_root(&self) -> &Path {
		&self.mount_root
	}

	/// One reconciliation tick. Diffs the inventory against the last
	/// snapshot and returns without touching any device when nothing
	/// changed (unless `verbose` forces a full pass).
	pub async fn reconcile(self: &Arc<Self>, verbose: bool) -> Result<(), VolumeError> {
		let devices = self.inventory.enumerate().await?;
		let snapshot: HashSet<_> = devices.iter().cloned().collect();

		{
			let mut last = self
				.last_snapshot
				.lock()
				.unwrap_or_else(PoisonError::into_inner);

			if *last == snapshot && !verbose {
				return Ok(());
			}
			*last = snapshot;
		}

		debug!(devices = devices.len(), "Device state changed, reconciling;");

		let mut scanned_uuids = HashSet::new();

		for device in devices {
			scanned_uuids.insert(device.uuid.clone());
			let target = self.mount_root.join(&device.uuid);

			if let Some(mountpoint) = &device.mountpoint {
				self.log_skip_once(&device.uuid, mountpoint, &target);
				continue;
			}

			let Some(guard) = self.claims.try_claim(&device.uuid) else {
				continue;
			};

			self.skip_cache
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.remove(&device.uuid);

			info!(uuid = %device.uuid, node = %device.node().display(), "Starting mount worker;");
			tokio::spawn(Arc::clone(self).mount_worker(device, target, guard));
		}

		self.skip_cache
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.retain(|uuid| scanned_uuids.contains(uuid));

		self.cleanup_stale_mountpoints().await;

		Ok(())
	}

	fn log_skip_once(&self, uuid: &str, mountpoint: &Path, target: &Path) {
		let mut skip_cache = self
			.skip_cache
			.lock()
			.unwrap_or_else(PoisonError::into_inner);

		if skip_cache.insert(uuid.to_string()) {
			if mountpoint == target {
				debug!(%uuid, "Skipping device: already managed;");
			} else {
				debug!(%uuid, mountpoint = %mountpoint.display(), "Skipping device: foreign mount;");
			}
		}
	}

	/// Mounts, validates and announces one device. The claim guard is
	/// released when this future ends, whatever the exit path.
	async fn mount_worker(self: Arc<Self>, device: DeviceSnapshot, target: PathBuf, guard: ClaimGuard) {
		let _guard = guard;

		if let Err(e) = fs::create_dir_all(&target).await {
			error!(?e, target = %target.display(), "Failed to create mountpoint;");
			return;
		}

		if let Err(e) = self
			.mounter
			.mount(&device.node(), &target, &device.fstype)
			.await
		{
			// Unconditional retry on the next tick that sees a change.
			warn!(?e, uuid = %device.uuid, "Mount failed;");
			return;
		}

		let _ = fs::set_permissions(&target, std::fs::Permissions::from_mode(MOUNTPOINT_MODE))
			.await;

		match identity::read(&target).await {
			Ok(drive_identity) if drive_identity.is_valid_roaming() => {
				info!(
					uuid = %drive_identity.uuid,
					label = %drive_identity.label,
					"Valid roaming drive mounted;"
				);

				let drive = Arc::new(Drive {
					uuid: drive_identity.uuid,
					root: target,
					kind: DriveKind::Roaming,
					label: drive_identity.label,
				});

				users::provision(&drive.users_root(), &self.passwd_path).await;

				self.notifier
					.send(
						"Drive Mounted",
						&format!("{} ({})", drive.label, drive.uuid),
						Urgency::Normal,
						"drive-harddisk",
					)
					.await;

				if self.events_tx.send(DriveEvent::Mounted(drive)).await.is_err() {
					warn!("Drive event channel closed, dropping mount announcement;");
				}
			}

			outcome => {
				match outcome {
					Ok(drive_identity) => info!(
						uuid = %device.uuid,
						kind = ?drive_identity.kind,
						"Rejecting drive: not a roaming identity;"
					),
					Err(IdentityError::NotFound(_)) => {
						info!(uuid = %device.uuid, "Rejecting drive: no identity marker;")
					}
					Err(e) => warn!(?e, uuid = %device.uuid, "Rejecting drive: unreadable identity;"),
				}

				// Rejected devices come back unmounted, matching the
				// previous snapshot, so the fast path keeps them parked
				// until their mount state actually changes.
				if let Err(e) = self.mounter.unmount(&target).await {
					warn!(?e, "Failed to unmount rejected drive;");
				}
				let _ = fs::remove_dir(&target).await;
			}
		}
	}

	/// Removes stale subdirectories of the managed mount root: anything
	/// that is neither mounted nor claimed by an in-flight worker.
	async fn cleanup_stale_mountpoints(&self) {
		let Ok(mut entries) = fs::read_dir(&self.mount_root).await else {
			return;
		};

		while let Ok(Some(entry)) = entries.next_entry().await {
			let path = entry.path();

			let is_dir = entry
				.file_type()
				.await
				.map(|t| t.is_dir())
				.unwrap_or(false);
			if !is_dir || self.mounter.is_mount_point(&path).await {
				continue;
			}

			let uuid = entry.file_name().to_string_lossy().to_string();
			if self.claims.contains(&uuid) {
				continue;
			}

			if fs::remove_dir(&path).await.is_ok() {
				debug!(path = %path.display(), "Removed stale mountpoint;");
			}
		}
	}
}
