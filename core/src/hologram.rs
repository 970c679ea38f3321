//! Hologram projector.
//!
//! A hologram is a symbolic link (for files) or a real passthrough
//! directory (for directories) inside the local per-user namespace,
//! standing in for an entry that physically lives on a roaming drive.
//! At most one canonical hologram exists per relative path, plus at most
//! one uuid-suffixed alternate when a second drive collides on the same
//! name. First writer wins; a loser whose alternate name is also taken
//! is abandoned with a log entry and no retry.

use std::{
	os::unix::fs::MetadataExt,
	path::{Component, Path, PathBuf},
};

use thiserror::Error;
use tokio::fs;
use tracing::{trace, warn};

use crate::error::FileIOError;

use wayfarer_ignore_rules::is_build_user;

/// Per-user namespace prefix on every managed drive.
pub const USERS_PREFIX: &str = "Users";

#[derive(Error, Debug)]
pub enum ProjectionError {
	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

/// Outcome of a single projection attempt, mostly for logging and tests.
#[derive(Debug, PartialEq, Eq)]
pub enum Projection {
	/// Canonical symlink created (or a stale one repaired).
	Linked(PathBuf),
	/// The canonical symlink already points at the source.
	AlreadyCurrent,
	/// Name collision with a real entry; alternate symlink created.
	Conflict(PathBuf),
	/// Both the canonical and the alternate name are taken.
	Abandoned(PathBuf),
	/// The relative path does not map into the per-user namespace.
	Skipped,
}

#[derive(Debug, Clone)]
pub struct Projector {
	users_root: PathBuf,
}

impl Projector {
	pub fn new(users_root: impl Into<PathBuf>) -> Self {
		Self {
			users_root: users_root.into(),
		}
	}

	/// Maps a drive-relative path `Users/<user>/rest...` onto the host's
	/// real per-user root. Paths outside the per-user namespace and user
	/// segments that resemble build artifacts yield `None`.
	pub fn map_to_virtual(&self, rel: impl AsRef<Path>) -> Option<PathBuf> {
		let mut components = rel.as_ref().components().filter_map(|c| match c {
			Component::Normal(segment) => segment.to_str(),
			_ => None,
		});

		if components.next() != Some(USERS_PREFIX) {
			return None;
		}

		let user = components.next()?;
		if is_build_user(user) {
			return None;
		}

		let mut target = self.users_root.join(user);
		for segment in components {
			target.push(segment);
		}

		Some(target)
	}

	/// Projects the file at absolute `src` (relative path `rel` on its
	/// drive) into the virtual namespace.
	pub async fn project_file(
		&self,
		src: &Path,
		rel: &Path,
		drive_uuid: &str,
	) -> Result<Projection, ProjectionError> {
		let Some(target) = self.map_to_virtual(rel) else {
			return Ok(Projection::Skipped);
		};

		match fs::symlink_metadata(&target).await {
			Err(_) => {
				self.create_link(src, &target).await?;
				return Ok(Projection::Linked(target));
			}

			Ok(meta) if meta.is_symlink() => {
				if fs::read_link(&target).await.ok().as_deref() == Some(src) {
					return Ok(Projection::AlreadyCurrent);
				}

				// Repair only dangling links (unmounted or deleted source).
				// A link whose destination still resolves belongs to a live
				// drive, and first writer keeps the canonical name.
				if fs::metadata(&target).await.is_err() {
					fs::remove_file(&target)
						.await
						.map_err(|e| FileIOError::from((&target, e)))?;
					self.create_link(src, &target).await?;
					return Ok(Projection::Linked(target));
				}
			}

			// Real file or directory holding the canonical name.
			Ok(_) => {}
		}

		let alternate = alternate_path(&target, drive_uuid);

		if fs::symlink_metadata(&alternate).await.is_ok() {
			warn!(
				target = %alternate.display(),
				"Hologram name conflict unresolved, abandoning;"
			);
			return Ok(Projection::Abandoned(alternate));
		}

		self.create_link(src, &alternate).await?;
		Ok(Projection::Conflict(alternate))
	}

	/// Ensures a real passthrough directory exists at the mapped virtual
	/// path. Never a symlink, so files can be created underneath through
	/// the local namespace.
	pub async fn project_dir(&self, rel: &Path) -> Result<(), ProjectionError> {
		let Some(target) = self.map_to_virtual(rel) else {
			return Ok(());
		};

		if fs::symlink_metadata(&target).await.is_ok() {
			return Ok(());
		}

		fs::create_dir_all(&target)
			.await
			.map_err(|e| FileIOError::from((&target, e)))?;
		match_parent_owner(&target).await;

		trace!(target = %target.display(), "Created directory hologram;");

		Ok(())
	}

	/// Removes the hologram for `rel`, checking both the canonical and
	/// the uuid-suffixed candidate and unlinking whichever is currently a
	/// symlink. Passthrough directories are left alone.
	pub async fn remove(&self, rel: &Path, drive_uuid: &str) -> Result<(), ProjectionError> {
		let Some(target) = self.map_to_virtual(rel) else {
			return Ok(());
		};

		for candidate in [target.clone(), alternate_path(&target, drive_uuid)] {
			if let Ok(meta) = fs::symlink_metadata(&candidate).await {
				if meta.is_symlink() {
					fs::remove_file(&candidate)
						.await
						.map_err(|e| FileIOError::from((&candidate, e)))?;
					trace!(target = %candidate.display(), "Removed hologram;");
				}
			}
		}

		Ok(())
	}

	async fn create_link(&self, src: &Path, target: &Path) -> Result<(), ProjectionError> {
		if let Some(parent) = target.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| FileIOError::from((parent, e)))?;
		}

		match fs::symlink(src, target).await {
			Ok(()) => {}
			// Another worker got there first; idempotence makes it a success.
			Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(()),
			Err(e) => return Err(FileIOError::from((target, e)).into()),
		}

		match_link_parent_owner(target).await;

		trace!(target = %target.display(), src = %src.display(), "Projected hologram;");

		Ok(())
	}
}

/// Derives the uuid-suffixed alternate for a colliding path, inserting
/// the drive uuid before the extension: `todo.txt` -> `todo-<uuid>.txt`.
pub fn alternate_path(target: &Path, drive_uuid: &str) -> PathBuf {
	let stem = target
		.file_stem()
		.and_then(|s| s.to_str())
		.unwrap_or_default();

	let name = match target.extension().and_then(|e| e.to_str()) {
		Some(ext) => format!("{stem}-{drive_uuid}.{ext}"),
		None => format!("{stem}-{drive_uuid}"),
	};

	target.with_file_name(name)
}

/// Makes the symlink itself owned like its parent directory, so per-user
/// access control holds despite the daemon running privileged. Failure
/// is tolerated; an unprivileged run simply keeps its own ownership.
async fn match_link_parent_owner(target: &Path) {
	let Some(parent) = target.parent() else { return };

	match fs::metadata(parent).await {
		Ok(meta) => {
			if let Err(e) =
				std::os::unix::fs::lchown(target, Some(meta.uid()), Some(meta.gid()))
			{
				warn!(?e, target = %target.display(), "Failed to chown hologram link;");
			}
		}
		Err(e) => warn!(?e, parent = %parent.display(), "Failed to stat hologram parent;"),
	}
}

/// Same as [`match_link_parent_owner`] but for passthrough directories.
async fn match_parent_owner(target: &Path) {
	let Some(parent) = target.parent() else { return };

	if let Ok(meta) = fs::metadata(parent).await {
		if let Err(e) = std::os::unix::fs::chown(target, Some(meta.uid()), Some(meta.gid())) {
			warn!(?e, target = %target.display(), "Failed to chown directory hologram;");
		}
	}
}
