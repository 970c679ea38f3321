//! Bounded worker pool dispatching mirror and projection work.
//!
//! Submission blocks when the queue is full, giving natural backpressure
//! during large initial scans instead of unbounded task spawning.

use std::{path::PathBuf, sync::Arc};

use async_channel as chan;
use tracing::{error, trace};

use wayfarer_ignore_rules::IgnoreRules;

use crate::{
	config::{CascadePolicy, DaemonConfig},
	hologram::Projector,
	identity,
	volume::Drive,
};

use super::{handlers, scan, FsEvent};

/// Everything the handlers need, shared across workers.
pub struct PipelineContext {
	pub system_mirror: PathBuf,
	pub users_root: PathBuf,
	pub mount_root: PathBuf,
	pub cascade_policy: CascadePolicy,
	pub ignore: IgnoreRules,
	pub projector: Projector,
}

impl PipelineContext {
	pub fn from_config(config: &DaemonConfig) -> Self {
		Self {
			system_mirror: identity::mirror_root(&config.system_root),
			users_root: config.users_root.clone(),
			mount_root: config.mount_root.clone(),
			cascade_policy: config.cascade_policy,
			ignore: config.ignore_rules.clone(),
			projector: Projector::new(&config.users_root),
		}
	}
}

#[derive(Debug)]
enum Job {
	Event {
		drive: Arc<Drive>,
		event: FsEvent,
	},
	Scan {
		drive: Arc<Drive>,
		root: PathBuf,
	},
}

#[derive(Clone)]
pub struct EventPipeline {
	ctx: Arc<PipelineContext>,
	jobs_tx: chan::Sender<Job>,
}

impl EventPipeline {
	/// Spawns `worker_count` workers over a queue of `queue_size` jobs.
	pub fn new(ctx: Arc<PipelineContext>, worker_count: usize, queue_size: usize) -> Self {
		let (jobs_tx, jobs_rx) = chan::bounded(queue_size.max(1));

		for worker_id in 0..worker_count.max(1) {
			let ctx = Arc::clone(&ctx);
			let jobs_rx: chan::Receiver<Job> = jobs_rx.clone();

			tokio::spawn(async move {
				while let Ok(job) = jobs_rx.recv().await {
					trace!(worker_id, ?job, "Processing pipeline job;");
					process(&ctx, job).await;
				}
			});
		}

		Self { ctx, jobs_tx }
	}

	pub fn context(&self) -> &Arc<PipelineContext> {
		&self.ctx
	}

	/// Queues a live event; awaits when the pool is saturated.
	pub async fn submit_event(&self, drive: Arc<Drive>, event: FsEvent) {
		if self
			.jobs_tx
			.send(Job::Event { drive, event })
			.await
			.is_err()
		{
			error!("Event pipeline queue closed, dropping event;");
		}
	}

	/// Queues an initial recursive scan of `root` on `drive`.
	pub async fn submit_scan(&self, drive: Arc<Drive>, root: PathBuf) {
		if self.jobs_tx.send(Job::Scan { drive, root }).await.is_err() {
			error!("Event pipeline queue closed, dropping scan;");
		}
	}

	/// Lets tests and shutdown paths wait until queued work has drained.
	pub async fn drain(&self) {
		while !self.jobs_tx.is_empty() {
			tokio::time::sleep(std::time::Duration::from_millis(10)).await;
		}
	}
}

async fn process(ctx: &PipelineContext, job: Job) {
	match job {
		Job::Scan { drive, root } => scan::initial_scan(ctx, &drive, &root).await,

		Job::Event { drive, event } => {
			if let Err(e) = process_event(ctx, &drive, event).await {
				// Per-item failure boundary: log and move on.
				error!(?e, "Failed to handle filesystem event;");
			}
		}
	}
}

async fn process_event(
	ctx: &PipelineContext,
	drive: &Arc<Drive>,
	event: FsEvent,
) -> Result<(), super::PipelineError> {
	match event {
		FsEvent::Created { path, is_dir: true } => handlers::sync_dir(ctx, drive, &path).await,

		FsEvent::Created { path, is_dir: false } | FsEvent::Modified { path } => {
			handlers::sync_file(ctx, drive, &path).await
		}

		FsEvent::Deleted { path } => handlers::handle_deleted(ctx, drive, &path).await,

		FsEvent::Moved { from, to, is_dir } => {
			if ctx.ignore.is_ignored(&drive.root, &from)
				|| ctx.ignore.is_ignored(&drive.root, &to)
			{
				return Ok(());
			}

			if !is_dir {
				if drive.is_roaming() {
					if let Some(rel) = drive.relative_path(&from) {
						ctx.projector.remove(rel, &drive.uuid).await?;
					}
				} else {
					// The old name ceased to exist locally; treat it like
					// a local deletion so the physical roaming copy goes
					// away instead of resurrecting the hologram later.
					handlers::cascade_local_deletion(ctx, &from).await;
				}
			}

			if is_dir {
				// A whole subtree moved; re-walk it at the destination.
				scan::initial_scan(ctx, drive, &to).await;
				Ok(())
			} else {
				handlers::sync_file(ctx, drive, &to).await
			}
		}
	}
}
