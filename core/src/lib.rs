//! Wayfarer core: drive reconciliation and namespace projection.
//!
//! One daemon instance exclusively owns all mutation of the virtual
//! namespace and both metadata mirrors. The [`Daemon`] wires together
//! the drive reconciler, the per-drive filesystem watchers and the
//! bounded event pipeline.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use async_channel as chan;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

pub mod config;
pub mod error;
pub mod event;
pub mod hologram;
pub mod identity;
pub mod mirror;
pub mod notifier;
pub mod volume;

pub use config::{CascadePolicy, DaemonConfig};
pub use event::{DriveWatcher, EventPipeline, FsEvent, PipelineContext, PipelineError};
pub use hologram::{Projection, Projector};
pub use notifier::Notifier;
pub use volume::{
	Drive, DriveEvent, DriveKind, DeviceInventory, LsblkInventory, Mounter, Reconciler,
	SysMounter, VolumeError,
};

const DRIVE_EVENT_CHANNEL_SIZE: usize = 64;

#[derive(Error, Debug)]
pub enum DaemonError {
	#[error(transparent)]
	Identity(#[from] identity::IdentityError),
	#[error(transparent)]
	Volume(#[from] VolumeError),
	#[error(transparent)]
	Pipeline(#[from] PipelineError),
	#[error(transparent)]
	FileIO(#[from] error::FileIOError),
}

pub struct Daemon {
	config: DaemonConfig,
	pipeline: EventPipeline,
	reconciler: Arc<Reconciler>,
	mounter: Arc<dyn Mounter>,
	drive_events_rx: chan::Receiver<DriveEvent>,
	system_drive: Arc<Drive>,
	/// Live watchers keyed by their watch root. The system watcher sits
	/// at the users root; roaming watchers at their mountpoints.
	watchers: HashMap<PathBuf, DriveWatcher>,
}

impl Daemon {
	/// Builds a daemon against the real block device inventory and
	/// mount primitives.
	pub async fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
		Self::with_backends(
			config,
			Arc::new(LsblkInventory),
			Arc::new(SysMounter),
			Notifier::new("Wayfarer"),
		)
		.await
	}

	/// Dependency-injected constructor; tests supply fabricated
	/// inventories and mounters.
	pub async fn with_backends(
		config: DaemonConfig,
		inventory: Arc<dyn DeviceInventory>,
		mounter: Arc<dyn Mounter>,
		notifier: Notifier,
	) -> Result<Self, DaemonError> {
		let system_identity =
			identity::ensure_system_identity(&config.system_root, &config.system_label).await?;

		tokio::fs::create_dir_all(&config.mount_root)
			.await
			.map_err(|e| error::FileIOError::from((&config.mount_root, e)))?;

		let ctx = Arc::new(PipelineContext::from_config(&config));
		let pipeline = EventPipeline::new(ctx, config.worker_count, config.event_queue_size);

		let (drive_events_tx, drive_events_rx) = chan::bounded(DRIVE_EVENT_CHANNEL_SIZE);

		let reconciler = Arc::new(Reconciler::new(
			config.mount_root.clone(),
			inventory,
			Arc::clone(&mounter),
			notifier,
			drive_events_tx,
		));

		let system_drive = Arc::new(Drive {
			uuid: system_identity.uuid,
			root: config.system_root.clone(),
			kind: DriveKind::System,
			label: system_identity.label,
		});

		Ok(Self {
			config,
			pipeline,
			reconciler,
			mounter,
			drive_events_rx,
			system_drive,
			watchers: HashMap::new(),
		})
	}

	pub fn pipeline(&self) -> &EventPipeline {
		&self.pipeline
	}

	pub fn reconciler(&self) -> &Arc<Reconciler> {
		&self.reconciler
	}

	/// Runs the daemon until the process shuts down: startup attach +
	/// scans, then the reconciliation loop interleaved with mount
	/// announcements.
	pub async fn run(mut self) -> Result<(), DaemonError> {
		info!("Wayfarer daemon starting;");

		self.attach_system_watcher().await?;
		self.attach_existing_mounts().await;

		self.reconciler.reconcile(true).await?;

		let poll_interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
		let mut tick = interval_at(Instant::now() + poll_interval, poll_interval);
		tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

		// Cloned out of self so the select arm doesn't hold a borrow
		// across the handlers.
		let drive_events_rx = self.drive_events_rx.clone();

		loop {
			tokio::select! {
				_ = tick.tick() => {
					if let Err(e) = self.reconciler.reconcile(false).await {
						error!(?e, "Reconciliation tick failed;");
					}
					self.sweep_lost_drives().await;
				}

				event = drive_events_rx.recv() => match event {
					Ok(DriveEvent::Mounted(drive)) => {
						if let Err(e) = self.attach_drive(drive).await {
							error!(?e, "Failed to attach mounted drive;");
						}
					}
					Err(_) => {
						warn!("Drive event channel closed, stopping daemon loop;");
						return Ok(());
					}
				},
			}
		}
	}

	/// Watches the local per-user namespace with the system drive
	/// context and schedules its initial scan.
	async fn attach_system_watcher(&mut self) -> Result<(), DaemonError> {
		let users_root = self.config.users_root.clone();

		let mut watcher = DriveWatcher::new(
			Arc::clone(&self.system_drive),
			users_root.clone(),
			self.pipeline.clone(),
		)?;
		watcher.watch()?;
		self.watchers.insert(users_root.clone(), watcher);

		self.pipeline
			.submit_scan(Arc::clone(&self.system_drive), users_root)
			.await;

		Ok(())
	}

	/// Picks up roaming drives that were already mounted under the
	/// managed root before the daemon started.
	async fn attach_existing_mounts(&mut self) {
		let Ok(mut entries) = tokio::fs::read_dir(&self.config.mount_root).await else {
			return;
		};

		while let Ok(Some(entry)) = entries.next_entry().await {
			let root = entry.path();

			if !self.mounter.is_mount_point(&root).await {
				continue;
			}

			match identity::read(&root).await {
				Ok(drive_identity) if drive_identity.is_valid_roaming() => {
					let drive = Arc::new(Drive {
						uuid: drive_identity.uuid,
						root,
						kind: DriveKind::Roaming,
						label: drive_identity.label,
					});

					if let Err(e) = self.attach_drive(drive).await {
						error!(?e, "Failed to attach pre-mounted drive;");
					}
				}
				_ => warn!(
					root = %root.display(),
					"Mounted directory under managed root lacks a roaming identity;"
				),
			}
		}
	}

	async fn attach_drive(&mut self, drive: Arc<Drive>) -> Result<(), DaemonError> {
		if self.watchers.contains_key(&drive.root) {
			return Ok(());
		}

		info!(uuid = %drive.uuid, root = %drive.root.display(), "Attaching roaming drive;");

		let mut watcher = DriveWatcher::new(
			Arc::clone(&drive),
			drive.root.clone(),
			self.pipeline.clone(),
		)?;
		watcher.watch()?;
		self.watchers.insert(drive.root.clone(), watcher);

		self.pipeline
			.submit_scan(Arc::clone(&drive), drive.root.clone())
			.await;

		Ok(())
	}

	/// Drops watchers whose mountpoints disappeared; their holograms go
	/// stale and get repaired or removed by later events.
	async fn sweep_lost_drives(&mut self) {
		let mut lost = Vec::new();

		for root in self.watchers.keys() {
			if *root == self.config.users_root {
				continue;
			}
			if !self.mounter.is_mount_point(root).await {
				lost.push(root.clone());
			}
		}

		for root in lost {
			info!(root = %root.display(), "Lost roaming drive, detaching watcher;");
			if let Some(mut watcher) = self.watchers.remove(&root) {
				watcher.unwatch();
			}
		}
	}
}
