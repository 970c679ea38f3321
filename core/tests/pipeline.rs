//! End-to-end pipeline tests over a fabricated drive layout: a mount
//! root with one roaming drive, a per-user root and a system mirror,
//! all inside a temp directory.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tempfile::TempDir;
use tokio::fs;

use wayfarer_core::{
	identity, Drive, DriveKind, EventPipeline, FsEvent, PipelineContext,
};
use wayfarer_core::config::DaemonConfig;

struct TestEnv {
	// Held for its Drop cleanup.
	_base: TempDir,
	pipeline: EventPipeline,
	system_drive: Arc<Drive>,
	roaming_drive: Arc<Drive>,
	users_root: PathBuf,
	system_mirror: PathBuf,
}

impl TestEnv {
	async fn new() -> Self {
		// The default tempdir name starts with a dot, which the ignore
		// rules would classify as hidden.
		let base = tempfile::Builder::new()
			.prefix("wayfarer-test")
			.tempdir()
			.unwrap();

		// The system root encloses the users root, as `/` does `/home`.
		let system_root = base.path().to_path_buf();
		let mount_root = base.path().join("mounts");
		let users_root = base.path().join("home");
		let drive_root = mount_root.join("drv-1");

		for dir in [&mount_root, &users_root.join("alice"), &drive_root] {
			fs::create_dir_all(dir).await.unwrap();
		}

		let config = DaemonConfig {
			mount_root: mount_root.clone(),
			system_root: system_root.clone(),
			users_root: users_root.clone(),
			..Default::default()
		};

		let ctx = Arc::new(PipelineContext::from_config(&config));
		let system_mirror = ctx.system_mirror.clone();
		let pipeline = EventPipeline::new(ctx, 2, 16);

		let system_drive = Arc::new(Drive {
			uuid: "system".to_string(),
			root: system_root,
			kind: DriveKind::System,
			label: "SystemRoot".to_string(),
		});

		let roaming_drive = Arc::new(Drive {
			uuid: "drv-1".to_string(),
			root: drive_root,
			kind: DriveKind::Roaming,
			label: "Stick".to_string(),
		});

		Self {
			_base: base,
			pipeline,
			system_drive,
			roaming_drive,
			users_root,
			system_mirror,
		}
	}

	async fn write_roaming_file(&self, rel: &str, contents: &str) -> PathBuf {
		let path = self.roaming_drive.root.join(rel);
		fs::create_dir_all(path.parent().unwrap()).await.unwrap();
		fs::write(&path, contents).await.unwrap();
		path
	}

	async fn scan_roaming(&self) {
		self.pipeline
			.submit_scan(
				Arc::clone(&self.roaming_drive),
				self.roaming_drive.root.clone(),
			)
			.await;
		self.settle().await;
	}

	/// Waits for the queue to empty, plus a grace period for the job a
	/// worker may still be executing.
	async fn settle(&self) {
		self.pipeline.drain().await;
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
}

#[tokio::test]
async fn scan_projects_holograms_and_mirrors_metadata() {
	let env = TestEnv::new().await;
	let src = env.write_roaming_file("Users/alice/docs/notes.txt", "hello").await;

	env.scan_roaming().await;

	// Hologram: real passthrough dirs, symlink leaf.
	let docs = env.users_root.join("alice/docs");
	assert!(fs::metadata(&docs).await.unwrap().is_dir());
	assert!(!fs::symlink_metadata(&docs).await.unwrap().is_symlink());

	let hologram = docs.join("notes.txt");
	assert!(fs::symlink_metadata(&hologram).await.unwrap().is_symlink());
	assert_eq!(fs::read_link(&hologram).await.unwrap(), src);

	// System mirror carries an ownership marker for the file and a
	// marker in each shadow dir.
	let marker = env.system_mirror.join("Users/alice/docs/notes.txt");
	assert_eq!(fs::read_to_string(&marker).await.unwrap(), "drv-1");
	assert!(
		fs::metadata(env.system_mirror.join("Users/alice/.wayfarer-dirinfo"))
			.await
			.is_ok()
	);

	// The drive-local mirror matches.
	let drive_marker = identity::mirror_root(&env.roaming_drive.root)
		.join("Users/alice/docs/notes.txt");
	assert_eq!(fs::read_to_string(&drive_marker).await.unwrap(), "drv-1");
}

#[tokio::test]
async fn rescan_is_idempotent() {
	let env = TestEnv::new().await;
	let src = env.write_roaming_file("Users/alice/a.txt", "x").await;

	env.scan_roaming().await;
	env.scan_roaming().await;

	let hologram = env.users_root.join("alice/a.txt");
	assert!(fs::symlink_metadata(&hologram).await.unwrap().is_symlink());
	assert_eq!(fs::read_link(&hologram).await.unwrap(), src);

	// No uuid-suffixed duplicate appeared.
	assert!(
		fs::symlink_metadata(env.users_root.join("alice/a-drv-1.txt"))
			.await
			.is_err()
	);
}

#[tokio::test]
async fn name_collision_projects_alternate() {
	let env = TestEnv::new().await;
	let src = env.write_roaming_file("Users/alice/todo.txt", "roaming").await;

	// A real local file already owns the canonical name.
	let canonical = env.users_root.join("alice/todo.txt");
	fs::create_dir_all(canonical.parent().unwrap()).await.unwrap();
	fs::write(&canonical, "local").await.unwrap();

	env.scan_roaming().await;

	// The local file is untouched; the hologram took the suffixed name.
	assert_eq!(fs::read_to_string(&canonical).await.unwrap(), "local");

	let alternate = env.users_root.join("alice/todo-drv-1.txt");
	assert!(fs::symlink_metadata(&alternate).await.unwrap().is_symlink());
	assert_eq!(fs::read_link(&alternate).await.unwrap(), src);
}

#[tokio::test]
async fn occupied_canonical_and_alternate_names_abandon_projection() {
	let env = TestEnv::new().await;
	env.write_roaming_file("Users/alice/todo.txt", "roaming").await;

	// Real local files hold both candidate names.
	let canonical = env.users_root.join("alice/todo.txt");
	let alternate = env.users_root.join("alice/todo-drv-1.txt");
	fs::create_dir_all(canonical.parent().unwrap()).await.unwrap();
	fs::write(&canonical, "local canonical").await.unwrap();
	fs::write(&alternate, "local alternate").await.unwrap();

	env.scan_roaming().await;

	// The projection was abandoned: both local files untouched, no
	// symlink appeared under either name.
	assert!(!fs::symlink_metadata(&canonical).await.unwrap().is_symlink());
	assert!(!fs::symlink_metadata(&alternate).await.unwrap().is_symlink());
	assert_eq!(fs::read_to_string(&canonical).await.unwrap(), "local canonical");
	assert_eq!(fs::read_to_string(&alternate).await.unwrap(), "local alternate");

	// The scan itself carried on; the mirror still records the file.
	assert!(
		fs::metadata(env.system_mirror.join("Users/alice/todo.txt"))
			.await
			.is_ok()
	);
}

#[tokio::test]
async fn roaming_directory_move_projects_destination_subtree() {
	let env = TestEnv::new().await;
	env.write_roaming_file("Users/alice/docs/a.txt", "x").await;

	env.scan_roaming().await;
	assert!(
		fs::symlink_metadata(env.users_root.join("alice/docs/a.txt"))
			.await
			.unwrap()
			.is_symlink()
	);

	// The whole subtree moves on the drive.
	let from = env.roaming_drive.root.join("Users/alice/docs");
	let to = env.roaming_drive.root.join("Users/alice/archive");
	fs::rename(&from, &to).await.unwrap();

	env.pipeline
		.submit_event(
			Arc::clone(&env.roaming_drive),
			FsEvent::Moved {
				from,
				to: to.clone(),
				is_dir: true,
			},
		)
		.await;
	env.settle().await;

	// The destination was rescanned and projected.
	let archive = env.users_root.join("alice/archive");
	assert!(fs::metadata(&archive).await.unwrap().is_dir());
	assert_eq!(
		fs::read_link(archive.join("a.txt")).await.unwrap(),
		to.join("a.txt")
	);
}

#[tokio::test]
async fn roaming_deletion_removes_hologram() {
	let env = TestEnv::new().await;
	let src = env.write_roaming_file("Users/alice/gone.txt", "x").await;

	env.scan_roaming().await;

	let hologram = env.users_root.join("alice/gone.txt");
	assert!(fs::symlink_metadata(&hologram).await.unwrap().is_symlink());

	fs::remove_file(&src).await.unwrap();
	env.pipeline
		.submit_event(
			Arc::clone(&env.roaming_drive),
			FsEvent::Deleted { path: src },
		)
		.await;
	env.settle().await;

	assert!(fs::symlink_metadata(&hologram).await.is_err());
}

#[tokio::test]
async fn local_deletion_cascades_to_roaming_copy() {
	let env = TestEnv::new().await;
	let src = env.write_roaming_file("Users/alice/shared.txt", "x").await;

	env.scan_roaming().await;

	// The user deletes the hologram through the local namespace.
	let hologram = env.users_root.join("alice/shared.txt");
	fs::remove_file(&hologram).await.unwrap();

	env.pipeline
		.submit_event(
			Arc::clone(&env.system_drive),
			FsEvent::Deleted {
				path: hologram.clone(),
			},
		)
		.await;
	env.settle().await;

	// The physical copy on the drive is gone, so a rescan cannot
	// resurrect the hologram.
	assert!(fs::symlink_metadata(&src).await.is_err());
	env.scan_roaming().await;
	assert!(fs::symlink_metadata(&hologram).await.is_err());
}

#[tokio::test]
async fn local_move_deletes_old_roaming_copy() {
	let env = TestEnv::new().await;
	let src = env.write_roaming_file("Users/alice/draft.txt", "v1").await;

	env.scan_roaming().await;

	// The user "moves" the file locally: new real content under the new
	// name, old hologram gone.
	let old = env.users_root.join("alice/draft.txt");
	let new = env.users_root.join("alice/final.txt");
	fs::remove_file(&old).await.unwrap();
	fs::write(&new, "v2").await.unwrap();

	env.pipeline
		.submit_event(
			Arc::clone(&env.system_drive),
			FsEvent::Moved {
				from: old.clone(),
				to: new.clone(),
				is_dir: false,
			},
		)
		.await;
	env.settle().await;

	assert!(fs::symlink_metadata(&src).await.is_err());

	// The new name got mirrored as a local file, under the system root's
	// own relative layout.
	let marker = env.system_mirror.join("home/alice/final.txt");
	assert_eq!(fs::read_to_string(&marker).await.unwrap(), "system");
}

#[tokio::test]
async fn two_drive_conflict_keeps_first_writer_canonical() {
	let env = TestEnv::new().await;
	let first_src = env.write_roaming_file("Users/alice/todo.txt", "first").await;

	let second_drive = Arc::new(Drive {
		uuid: "drv-2".to_string(),
		root: env.roaming_drive.root.parent().unwrap().join("drv-2"),
		kind: DriveKind::Roaming,
		label: "Second".to_string(),
	});
	let second_src = second_drive.root.join("Users/alice/todo.txt");
	fs::create_dir_all(second_src.parent().unwrap()).await.unwrap();
	fs::write(&second_src, "second").await.unwrap();

	env.scan_roaming().await;
	env.pipeline
		.submit_scan(Arc::clone(&second_drive), second_drive.root.clone())
		.await;
	env.settle().await;

	// First mounted owns the canonical name; the second gets the
	// uuid-suffixed alternate.
	let canonical = env.users_root.join("alice/todo.txt");
	let alternate = env.users_root.join("alice/todo-drv-2.txt");
	assert_eq!(fs::read_link(&canonical).await.unwrap(), first_src);
	assert_eq!(fs::read_link(&alternate).await.unwrap(), second_src);

	// Deleting the first drive's physical file removes only its own
	// hologram; the other drive's hologram and markers are untouched.
	fs::remove_file(&first_src).await.unwrap();
	env.pipeline
		.submit_event(
			Arc::clone(&env.roaming_drive),
			FsEvent::Deleted {
				path: first_src.clone(),
			},
		)
		.await;
	env.settle().await;

	assert!(fs::symlink_metadata(&canonical).await.is_err());
	assert_eq!(fs::read_link(&alternate).await.unwrap(), second_src);
	assert!(
		fs::metadata(env.system_mirror.join("Users/alice/todo.txt"))
			.await
			.is_ok()
	);

	// The drive going away generates no events, so the survivor is not
	// promoted to the canonical name.
	fs::remove_dir_all(&env.roaming_drive.root).await.unwrap();
	env.settle().await;
	assert!(fs::symlink_metadata(&canonical).await.is_err());
	assert_eq!(fs::read_link(&alternate).await.unwrap(), second_src);
}

#[tokio::test]
async fn storage_area_is_never_projected() {
	let env = TestEnv::new().await;
	env.write_roaming_file("System/Wayfarer/drive.json", "{}").await;
	env.write_roaming_file("Users/alice/keep.txt", "x").await;

	env.scan_roaming().await;

	assert!(
		fs::symlink_metadata(env.users_root.join("alice/keep.txt"))
			.await
			.unwrap()
			.is_symlink()
	);

	// Nothing from the storage area leaked into the mirror.
	assert!(
		fs::metadata(env.system_mirror.join("System"))
			.await
			.is_err()
	);
}
