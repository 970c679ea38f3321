//! Handlers shared by the initial scan and the live event pipeline.
//!
//! Every handler isolates its failures: a permission error on one file
//! is logged and skipped, self-healing on the next event or rescan
//! through idempotence. Nothing here is fatal to the pipeline.

use std::path::Path;

use tokio::fs;
use tracing::{debug, warn};

use crate::{config::CascadePolicy, hologram::Projection, mirror, volume::Drive};

use super::{pipeline::PipelineContext, PipelineError};

/// Mirrors a directory into every applicable mirror root and, for
/// roaming sources in the per-user namespace, ensures a passthrough
/// directory hologram.
pub async fn sync_dir(
	ctx: &PipelineContext,
	drive: &Drive,
	path: &Path,
) -> Result<(), PipelineError> {
	if ctx.ignore.is_ignored(&drive.root, path) {
		return Ok(());
	}

	let Some(rel) = drive.relative_path(path) else {
		return Ok(());
	};

	if drive.is_roaming() {
		log_transient(mirror::ensure_shadow_dir(drive.mirror_root(), rel, &drive.uuid).await);
	}
	log_transient(mirror::ensure_shadow_dir(&ctx.system_mirror, rel, &drive.uuid).await);

	if drive.is_roaming() {
		ctx.projector.project_dir(rel).await?;
	}

	Ok(())
}

/// Mirrors a regular file and, for roaming sources in the per-user
/// namespace, projects its hologram. Directories and symlinks are
/// no-ops.
pub async fn sync_file(
	ctx: &PipelineContext,
	drive: &Drive,
	path: &Path,
) -> Result<(), PipelineError> {
	let Ok(meta) = fs::symlink_metadata(path).await else {
		// Already gone; the deletion event will follow.
		return Ok(());
	};
	if meta.is_dir() || meta.is_symlink() {
		return Ok(());
	}

	if ctx.ignore.is_ignored(&drive.root, path) {
		return Ok(());
	}

	let Some(rel) = drive.relative_path(path) else {
		return Ok(());
	};

	if drive.is_roaming() {
		log_transient(mirror::write_file_marker(drive.mirror_root(), rel, &drive.uuid).await);
	}
	log_transient(mirror::write_file_marker(&ctx.system_mirror, rel, &drive.uuid).await);

	if drive.is_roaming() {
		match ctx.projector.project_file(path, rel, &drive.uuid).await? {
			Projection::Conflict(alternate) => {
				debug!(
					alternate = %alternate.display(),
					"Name collision, projected uuid-suffixed hologram;"
				);
			}
			Projection::Abandoned(alternate) => {
				warn!(
					alternate = %alternate.display(),
					src = %path.display(),
					"Hologram abandoned, both candidate names taken;"
				);
			}
			_ => {}
		}
	}

	Ok(())
}

/// Deletion fan-out: roaming sources lose their hologram; local
/// deletions cascade to the physical copies on roaming drives so a
/// later scan cannot resurrect the hologram.
pub async fn handle_deleted(
	ctx: &PipelineContext,
	drive: &Drive,
	path: &Path,
) -> Result<(), PipelineError> {
	if ctx.ignore.is_ignored(&drive.root, path) {
		return Ok(());
	}

	if drive.is_roaming() {
		if let Some(rel) = drive.relative_path(path) {
			ctx.projector.remove(rel, &drive.uuid).await?;
		}
		return Ok(());
	}

	cascade_local_deletion(ctx, path).await;

	Ok(())
}

/// Removes the physical counterpart of a locally deleted entry from
/// roaming drives sharing its relative path, honoring the configured
/// cascade policy.
pub async fn cascade_local_deletion(ctx: &PipelineContext, path: &Path) {
	let Ok(user_rel) = path.strip_prefix(&ctx.users_root) else {
		return;
	};
	let roaming_rel = Path::new(crate::hologram::USERS_PREFIX).join(user_rel);

	let Ok(mut entries) = fs::read_dir(&ctx.mount_root).await else {
		return;
	};

	while let Ok(Some(entry)) = entries.next_entry().await {
		let candidate = entry.path().join(&roaming_rel);

		let Ok(meta) = fs::symlink_metadata(&candidate).await else {
			continue;
		};

		let removed = if meta.is_dir() {
			fs::remove_dir(&candidate).await
		} else {
			fs::remove_file(&candidate).await
		};

		match removed {
			Ok(()) => {
				debug!(path = %candidate.display(), "Cascaded local deletion to roaming drive;");
				if ctx.cascade_policy == CascadePolicy::FirstMatch {
					break;
				}
			}
			Err(e) => warn!(?e, path = %candidate.display(), "Cascade deletion failed;"),
		}
	}
}

fn log_transient(result: Result<impl Sized, crate::error::FileIOError>) {
	if let Err(e) = result {
		warn!(%e, "Transient mirror write failure, will self-heal on rescan;");
	}
}
