//! Stateless ignore rules for the mirror and projection pipeline.
//!
//! Both the initial recursive scan and the live watcher classify paths
//! through [`IgnoreRules::is_ignored`], so a freshly mounted drive and a
//! continuously watched one converge to the same set of visible entries.

use std::{
	collections::HashSet,
	path::{Component, Path},
};

use serde::{Deserialize, Serialize};

/// Directory, relative to a drive root, holding the drive identity marker
/// and the metadata mirror. Never mirrored or projected.
pub const STORAGE_AREA: &str = "System/Wayfarer";

/// Top-level directory the storage area lives under.
pub const STORAGE_AREA_ROOT: &str = "System";

/// Prefix used by ephemeral build users. Files owned by them are noise
/// and their home segments must never be projected.
pub const BUILD_USER_PREFIX: &str = "nixbld";

/// Derived views are rebuilt from the mirror by an external job. Their
/// pseudo-directories under any `Music` segment must not feed back into
/// the mirror.
const DERIVED_VIEW_PARENT: &str = "Music";

fn default_derived_view_dirs() -> HashSet<String> {
	[
		"Artists",
		"Albums",
		"Years",
		"Genres",
		"OSTs",
		".building",
		".trash_Artists",
		".trash_Albums",
		".trash_Years",
		".trash_Genres",
		".trash_OSTs",
	]
	.into_iter()
	.map(String::from)
	.collect()
}

/// Pure predicate over paths. Cheap to clone, no interior state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IgnoreRules {
	#[serde(default = "default_derived_view_dirs")]
	derived_view_dirs: HashSet<String>,
}

impl Default for IgnoreRules {
	fn default() -> Self {
		Self {
			derived_view_dirs: default_derived_view_dirs(),
		}
	}
}

impl IgnoreRules {
	/// Classifies `path` against `drive_root`. Returns `true` when the
	/// pipeline must skip the entry entirely.
	pub fn is_ignored(&self, drive_root: impl AsRef<Path>, path: impl AsRef<Path>) -> bool {
		let path = path.as_ref();

		if has_hidden_or_build_segment(path) {
			return true;
		}

		if let Ok(rel) = path.strip_prefix(drive_root.as_ref()) {
			if rel == Path::new(STORAGE_AREA_ROOT) || rel.starts_with(STORAGE_AREA) {
				return true;
			}
		}

		self.is_derived_view(path)
	}

	/// Whether `path` sits directly inside a reserved derived-view
	/// pseudo-directory under a `Music` segment.
	fn is_derived_view(&self, path: &Path) -> bool {
		let mut components = path
			.components()
			.filter_map(|component| match component {
				Component::Normal(segment) => segment.to_str(),
				_ => None,
			})
			.peekable();

		while let Some(segment) = components.next() {
			if segment == DERIVED_VIEW_PARENT {
				if let Some(subdir) = components.peek() {
					if self.derived_view_dirs.contains(*subdir) {
						return true;
					}
				}
			}
		}

		false
	}
}

/// Whether any normal segment of `path` is hidden or belongs to a build
/// user.
fn has_hidden_or_build_segment(path: &Path) -> bool {
	path.components().any(|component| match component {
		Component::Normal(segment) => segment
			.to_str()
			.map(|s| s.starts_with('.') || s.starts_with(BUILD_USER_PREFIX))
			.unwrap_or(true),
		_ => false,
	})
}

/// Whether a per-user namespace segment resembles a build artifact
/// rather than a real user. Such segments are never projected.
pub fn is_build_user(segment: &str) -> bool {
	segment.starts_with(BUILD_USER_PREFIX)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rules() -> IgnoreRules {
		IgnoreRules::default()
	}

	#[test]
	fn hidden_segments_are_ignored() {
		let rules = rules();
		assert!(rules.is_ignored("/mnt/a", "/mnt/a/Users/alice/.cache/x"));
		assert!(rules.is_ignored("/mnt/a", "/mnt/a/Users/alice/.hidden"));
		assert!(!rules.is_ignored("/mnt/a", "/mnt/a/Users/alice/visible.txt"));
	}

	#[test]
	fn build_user_segments_are_ignored() {
		let rules = rules();
		assert!(rules.is_ignored("/mnt/a", "/mnt/a/Users/nixbld1/tmp.o"));
		assert!(!rules.is_ignored("/mnt/a", "/mnt/a/Users/nix-enthusiast/f.txt"));
	}

	#[test]
	fn storage_area_is_ignored_relative_to_its_own_root_only() {
		let rules = rules();
		assert!(rules.is_ignored("/mnt/a", "/mnt/a/System"));
		assert!(rules.is_ignored("/mnt/a", "/mnt/a/System/Wayfarer"));
		assert!(rules.is_ignored("/mnt/a", "/mnt/a/System/Wayfarer/Mirror/Users/alice/x"));
		// Another drive's storage area path does not match this root.
		assert!(!rules.is_ignored("/mnt/a", "/mnt/b/System/Wayfarer/x"));
		// A user directory merely named System is not the storage area.
		assert!(!rules.is_ignored("/mnt/a", "/mnt/a/Users/alice/System"));
	}

	#[test]
	fn derived_view_dirs_are_ignored_under_music() {
		let rules = rules();
		assert!(rules.is_ignored("/", "/home/alice/Music/Artists/Queen/song.flac"));
		assert!(rules.is_ignored("/", "/home/alice/Music/Albums"));
		assert!(!rules.is_ignored("/", "/home/alice/Music/collection/song.flac"));
		// The pseudo-directory names are only reserved under Music.
		assert!(!rules.is_ignored("/", "/home/alice/Artists/notes.txt"));
	}

	#[test]
	fn dotted_trash_views_are_covered_by_hidden_rule_too() {
		let rules = rules();
		assert!(rules.is_ignored("/", "/home/alice/Music/.trash_Albums/x.flac"));
	}

	#[test]
	fn build_user_detection() {
		assert!(is_build_user("nixbld7"));
		assert!(!is_build_user("alice"));
	}
}
