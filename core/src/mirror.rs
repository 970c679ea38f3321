//! Metadata mirror writer.
//!
//! The mirror is a shadow directory tree of ownership markers: one file
//! per mirrored real file, one `.wayfarer-dirinfo` marker per mirrored
//! directory, each containing nothing but the owning drive's uuid. A
//! downstream indexer consumes the tree; this module only writes it.
//!
//! Every operation treats "already exists" as success so scan and live
//! events for the same drive may interleave freely.

use std::{
	os::unix::fs::PermissionsExt,
	path::{Path, PathBuf},
};

use tokio::fs;
use tracing::trace;

use crate::error::FileIOError;

/// Marker file name written inside every shadow directory.
pub const DIR_MARKER: &str = ".wayfarer-dirinfo";

const DIR_MODE: u32 = 0o755;
const MARKER_MODE: u32 = 0o644;

/// Creates the shadow directory for `rel_dir` under `mirror_root` along
/// with its ownership marker. Returns the shadow directory path.
pub async fn ensure_shadow_dir(
	mirror_root: impl AsRef<Path>,
	rel_dir: impl AsRef<Path>,
	owner_uuid: &str,
) -> Result<PathBuf, FileIOError> {
	let shadow_dir = mirror_root.as_ref().join(rel_dir.as_ref());

	fs::create_dir_all(&shadow_dir)
		.await
		.map_err(|e| FileIOError::from((&shadow_dir, e)))?;

	// Mode fixups are best effort; the marker content is what matters.
	let _ = fs::set_permissions(&shadow_dir, std::fs::Permissions::from_mode(DIR_MODE)).await;

	let marker = shadow_dir.join(DIR_MARKER);
	if fs::symlink_metadata(&marker).await.is_err() {
		fs::write(&marker, owner_uuid)
			.await
			.map_err(|e| FileIOError::from((&marker, e)))?;
		let _ = fs::set_permissions(&marker, std::fs::Permissions::from_mode(MARKER_MODE)).await;
	}

	Ok(shadow_dir)
}

/// Writes the ownership marker for the file at `rel_path` under
/// `mirror_root`, creating intermediate shadow directories as needed.
/// Overwrites an existing marker so ownership changes propagate.
pub async fn write_file_marker(
	mirror_root: impl AsRef<Path>,
	rel_path: impl AsRef<Path>,
	owner_uuid: &str,
) -> Result<(), FileIOError> {
	let rel_path = rel_path.as_ref();
	let rel_dir = rel_path.parent().unwrap_or_else(|| Path::new(""));

	let shadow_dir = ensure_shadow_dir(mirror_root, rel_dir, owner_uuid).await?;

	let marker = match rel_path.file_name() {
		Some(name) => shadow_dir.join(name),
		None => return Ok(()),
	};

	fs::write(&marker, owner_uuid)
		.await
		.map_err(|e| FileIOError::from((&marker, e)))?;
	let _ = fs::set_permissions(&marker, std::fs::Permissions::from_mode(MARKER_MODE)).await;

	trace!(marker = %marker.display(), owner = %owner_uuid, "Wrote mirror marker;");

	Ok(())
}
