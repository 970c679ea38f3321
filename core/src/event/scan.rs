//! Initial recursive scan of a watched root.
//!
//! Applies the same ignore predicate and the same directory-then-file
//! handling as live events, so scanning a freshly mounted drive reaches
//! the end state continuous watching would have produced.

use std::path::Path;

use tokio::fs;
use tracing::{error, info};

use crate::volume::Drive;

use super::{handlers, pipeline::PipelineContext};

pub async fn initial_scan(ctx: &PipelineContext, drive: &Drive, root: &Path) {
	info!(root = %root.display(), drive = %drive.uuid, "Starting scan;");

	let mut processed = 0_usize;
	let mut pending = vec![root.to_path_buf()];

	while let Some(dir) = pending.pop() {
		let mut entries = match fs::read_dir(&dir).await {
			Ok(entries) => entries,
			Err(e) => {
				error!(?e, dir = %dir.display(), "Failed to read directory during scan;");
				continue;
			}
		};

		while let Ok(Some(entry)) = entries.next_entry().await {
			let path = entry.path();

			if ctx.ignore.is_ignored(&drive.root, &path) {
				continue;
			}

			let Ok(file_type) = entry.file_type().await else {
				continue;
			};

			if file_type.is_dir() {
				if let Err(e) = handlers::sync_dir(ctx, drive, &path).await {
					error!(?e, path = %path.display(), "Failed to sync directory;");
				}
				pending.push(path);
			} else if file_type.is_file() {
				if let Err(e) = handlers::sync_file(ctx, drive, &path).await {
					error!(?e, path = %path.display(), "Failed to sync file;");
				}
				processed += 1;
			}
			// Symlinks are someone else's hologram; never mirrored.
		}
	}

	info!(root = %root.display(), processed, "Scan finished;");
}
