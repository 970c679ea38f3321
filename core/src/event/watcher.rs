//! Per-drive filesystem watcher.
//!
//! Wraps a `notify` recursive watcher, normalizes its platform events
//! into [`FsEvent`]s and forwards them to the pipeline. Delivery never
//! runs handler work inline: events cross an unbounded channel into a
//! processing task which submits jobs to the bounded pool.

use std::{path::PathBuf, pin::pin, sync::Arc};

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::stream::Merge;
use notify::{
	event::{CreateKind, EventKind, ModifyKind, RenameMode},
	Config, Event, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::{spawn, task::JoinHandle};
use tracing::{error, info, instrument, trace};

use crate::volume::Drive;

use super::{EventPipeline, FsEvent, PipelineError};

#[derive(Debug)]
pub struct DriveWatcher {
	watch_root: PathBuf,
	watcher: RecommendedWatcher,
	stop_tx: chan::Sender<()>,
	handle: Option<JoinHandle<()>>,
}

impl DriveWatcher {
	/// Creates a watcher for `watch_root`, attributing its events to
	/// `drive`. Call [`Self::watch`] to start receiving events.
	pub fn new(
		drive: Arc<Drive>,
		watch_root: PathBuf,
		pipeline: EventPipeline,
	) -> Result<Self, PipelineError> {
		let (events_tx, events_rx) = chan::unbounded();
		let (stop_tx, stop_rx) = chan::bounded(1);

		let watcher = RecommendedWatcher::new(
			move |result| {
				if !events_tx.is_closed() {
					// Unbounded channel, so this never blocks the
					// notification thread.
					if events_tx.send_blocking(result).is_err() {
						error!("Unable to forward watcher event;");
					}
				}
			},
			Config::default(),
		)?;

		let handle = spawn(handle_watch_events(drive, events_rx, stop_rx, pipeline));

		Ok(Self {
			watch_root,
			watcher,
			stop_tx,
			handle: Some(handle),
		})
	}

	pub fn watch_root(&self) -> &PathBuf {
		&self.watch_root
	}

	#[instrument(skip(self), fields(root = %self.watch_root.display()))]
	pub fn watch(&mut self) -> Result<(), PipelineError> {
		self.watcher
			.watch(&self.watch_root, RecursiveMode::Recursive)?;
		info!("Watching drive root;");
		Ok(())
	}

	pub fn unwatch(&mut self) {
		if let Err(e) = self.watcher.unwatch(&self.watch_root) {
			trace!(?e, root = %self.watch_root.display(), "Unwatch failed;");
		}
	}
}

impl Drop for DriveWatcher {
	fn drop(&mut self) {
		if let Some(handle) = self.handle.take() {
			let stop_tx = self.stop_tx.clone();
			spawn(async move {
				let _ = stop_tx.send(()).await;
				if let Err(e) = handle.await {
					error!(?e, "Failed to join watcher task;");
				}
			});
		}
	}
}

async fn handle_watch_events(
	drive: Arc<Drive>,
	events_rx: chan::Receiver<notify::Result<Event>>,
	stop_rx: chan::Receiver<()>,
	pipeline: EventPipeline,
) {
	enum StreamMessage {
		NewEvent(notify::Result<Event>),
		Stop,
	}

	let mut msg_stream = pin!((
		events_rx.map(StreamMessage::NewEvent),
		stop_rx.map(|()| StreamMessage::Stop),
	)
		.merge());

	while let Some(msg) = msg_stream.next().await {
		match msg {
			StreamMessage::NewEvent(Ok(event)) => {
				for fs_event in normalize_event(event) {
					pipeline.submit_event(Arc::clone(&drive), fs_event).await;
				}
			}

			StreamMessage::NewEvent(Err(e)) => error!(?e, "Watcher error;"),

			StreamMessage::Stop => {
				trace!("Drive watcher received stop signal;");
				break;
			}
		}
	}
}

/// Flattens a platform `notify` event into zero or more normalized
/// events. Ambiguous renames fall back to an existence probe.
fn normalize_event(event: Event) -> Vec<FsEvent> {
	let Event { kind, paths, .. } = event;

	match kind {
		EventKind::Create(create_kind) => paths
			.into_iter()
			.map(|path| {
				let is_dir = create_kind == CreateKind::Folder || path.is_dir();
				FsEvent::Created { path, is_dir }
			})
			.collect(),

		EventKind::Modify(ModifyKind::Name(rename_mode)) => match rename_mode {
			RenameMode::Both => {
				let mut paths = paths.into_iter();
				match (paths.next(), paths.next()) {
					(Some(from), Some(to)) => {
						let is_dir = to.is_dir();
						vec![FsEvent::Moved { from, to, is_dir }]
					}
					_ => Vec::new(),
				}
			}

			RenameMode::From => paths
				.into_iter()
				.map(|path| FsEvent::Deleted { path })
				.collect(),

			RenameMode::To => paths
				.into_iter()
				.map(|path| {
					let is_dir = path.is_dir();
					FsEvent::Created { path, is_dir }
				})
				.collect(),

			// Single-path rename halves and unknown modes: probe.
			_ => paths
				.into_iter()
				.map(|path| {
					if path.symlink_metadata().is_ok() {
						let is_dir = path.is_dir();
						FsEvent::Created { path, is_dir }
					} else {
						FsEvent::Deleted { path }
					}
				})
				.collect(),
		},

		EventKind::Modify(_) => paths
			.into_iter()
			.map(|path| FsEvent::Modified { path })
			.collect(),

		EventKind::Remove(_) => paths
			.into_iter()
			.map(|path| FsEvent::Deleted { path })
			.collect(),

		EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use notify::event::RemoveKind;

	fn event(kind: EventKind, paths: Vec<&str>) -> Event {
		Event {
			kind,
			paths: paths.into_iter().map(PathBuf::from).collect(),
			attrs: Default::default(),
		}
	}

	#[test]
	fn create_file_normalizes_to_created() {
		let events = normalize_event(event(
			EventKind::Create(CreateKind::File),
			vec!["/mnt/a/Users/alice/x.txt"],
		));

		assert_eq!(
			events,
			vec![FsEvent::Created {
				path: "/mnt/a/Users/alice/x.txt".into(),
				is_dir: false
			}]
		);
	}

	#[test]
	fn rename_both_normalizes_to_moved() {
		let events = normalize_event(event(
			EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
			vec!["/home/alice/a.txt", "/home/alice/b.txt"],
		));

		assert_eq!(
			events,
			vec![FsEvent::Moved {
				from: "/home/alice/a.txt".into(),
				to: "/home/alice/b.txt".into(),
				is_dir: false
			}]
		);
	}

	#[test]
	fn rename_halves_normalize_to_deleted_and_created() {
		let deleted = normalize_event(event(
			EventKind::Modify(ModifyKind::Name(RenameMode::From)),
			vec!["/home/alice/a.txt"],
		));
		assert_eq!(
			deleted,
			vec![FsEvent::Deleted {
				path: "/home/alice/a.txt".into()
			}]
		);
	}

	#[test]
	fn removes_normalize_to_deleted() {
		let events = normalize_event(event(
			EventKind::Remove(RemoveKind::File),
			vec!["/home/alice/a.txt"],
		));
		assert_eq!(
			events,
			vec![FsEvent::Deleted {
				path: "/home/alice/a.txt".into()
			}]
		);
	}

	#[test]
	fn access_events_are_dropped() {
		use notify::event::{AccessKind, AccessMode};

		assert!(normalize_event(event(
			EventKind::Access(AccessKind::Close(AccessMode::Write)),
			vec!["/home/alice/a.txt"],
		))
		.is_empty());
	}
}
