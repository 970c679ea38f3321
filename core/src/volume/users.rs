//! Per-user directory provisioning on accepted roaming drives.

use std::{
	os::unix::fs::PermissionsExt,
	path::Path,
};

use tokio::fs;
use tracing::{info, warn};

/// Real accounts live in this uid range; `nobody` sits at 65534.
const FIRST_USER_UID: u32 = 1000;
const LAST_USER_UID: u32 = 65534;

const USERS_DIR_MODE: u32 = 0o755;
const USER_DIR_MODE: u32 = 0o700;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemUser {
	pub name: String,
	pub uid: u32,
	pub gid: u32,
}

/// Parses the system account database, keeping only real users.
pub fn parse_passwd(contents: &str) -> Vec<SystemUser> {
	contents
		.lines()
		.filter_map(|line| {
			let mut fields = line.split(':');
			let name = fields.next()?;
			let _password = fields.next()?;
			let uid: u32 = fields.next()?.parse().ok()?;
			let gid: u32 = fields.next()?.parse().ok()?;

			(uid >= FIRST_USER_UID && uid < LAST_USER_UID).then(|| SystemUser {
				name: name.to_string(),
				uid,
				gid,
			})
		})
		.collect()
}

/// Creates a private directory per system user under `users_root` on a
/// freshly accepted drive. Ownership failures are tolerated so the
/// operation also works on permissionless filesystems and in tests.
pub async fn provision(users_root: &Path, passwd_path: &Path) {
	if let Err(e) = fs::create_dir_all(users_root).await {
		warn!(?e, path = %users_root.display(), "Failed to create drive users root;");
		return;
	}
	let _ = fs::set_permissions(
		users_root,
		std::fs::Permissions::from_mode(USERS_DIR_MODE),
	)
	.await;

	let users = match fs::read_to_string(passwd_path).await {
		Ok(contents) => parse_passwd(&contents),
		Err(e) => {
			warn!(?e, "Failed to read account database, skipping provisioning;");
			return;
		}
	};

	for user in users {
		let user_dir = users_root.join(&user.name);
		if fs::metadata(&user_dir).await.is_ok() {
			continue;
		}

		if let Err(e) = fs::create_dir(&user_dir).await {
			warn!(?e, user = %user.name, "Failed to provision user directory;");
			continue;
		}

		let _ = std::os::unix::fs::chown(&user_dir, Some(user.uid), Some(user.gid));
		let _ = fs::set_permissions(&user_dir, std::fs::Permissions::from_mode(USER_DIR_MODE))
			.await;

		info!(user = %user.name, path = %user_dir.display(), "Provisioned user directory;");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/sh\n\
alice:x:1000:100:Alice:/home/alice:/bin/sh\n\
bob:x:1001:100:Bob:/home/bob:/bin/sh\n\
nobody:x:65534:65534:nobody:/:/bin/false\n\
broken line without fields\n";

	#[test]
	fn parse_keeps_real_users_only() {
		let users = parse_passwd(PASSWD);

		assert_eq!(users.len(), 2);
		assert_eq!(users[0].name, "alice");
		assert_eq!(users[0].uid, 1000);
		assert_eq!(users[1].name, "bob");
	}

	#[tokio::test]
	async fn provision_creates_missing_directories() {
		let drive = tempdir().unwrap();
		let passwd = drive.path().join("passwd");
		tokio::fs::write(&passwd, PASSWD).await.unwrap();

		let users_root = drive.path().join("Users");
		provision(&users_root, &passwd).await;
		// Second run must be a no-op.
		provision(&users_root, &passwd).await;

		assert!(users_root.join("alice").is_dir());
		assert!(users_root.join("bob").is_dir());
		assert!(!users_root.join("root").exists());
	}
}
