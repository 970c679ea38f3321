//! Desktop notification sink.
//!
//! The daemon runs privileged outside any user session, so notifications
//! are delivered by re-entering the primary user's session bus through
//! `runuser` + `notify-send`. Strictly fire-and-forget: every failure is
//! swallowed after a trace log.

use std::process::Stdio;

use tokio::process::Command;
use tracing::trace;

/// The single-user desktop this daemon targets puts its primary user at
/// this uid.
const PRIMARY_UID: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
	Low,
	Normal,
	Critical,
}

impl Urgency {
	fn as_str(self) -> &'static str {
		match self {
			Self::Low => "low",
			Self::Normal => "normal",
			Self::Critical => "critical",
		}
	}
}

#[derive(Debug, Clone)]
pub struct Notifier {
	app_name: String,
	enabled: bool,
}

impl Notifier {
	pub fn new(app_name: impl Into<String>) -> Self {
		Self {
			app_name: app_name.into(),
			enabled: true,
		}
	}

	/// A notifier that drops everything; used by tests and headless runs.
	pub fn disabled() -> Self {
		Self {
			app_name: String::new(),
			enabled: false,
		}
	}

	/// Sends a notification to the primary user session. Never fails from
	/// the caller's point of view.
	pub async fn send(&self, title: &str, message: &str, urgency: Urgency, icon: &str) {
		if !self.enabled {
			return;
		}

		let bus_path = format!("/run/user/{PRIMARY_UID}/bus");
		if tokio::fs::metadata(&bus_path).await.is_err() {
			// User not logged in, nowhere to deliver.
			return;
		}

		let username = match user_name_for_uid(PRIMARY_UID).await {
			Some(name) => name,
			None => return,
		};

		let result = Command::new("runuser")
			.args(["-u", &username, "--", "notify-send"])
			.args(["-u", urgency.as_str(), "-i", icon, "-a", &self.app_name])
			.arg(title)
			.arg(message)
			.env(
				"DBUS_SESSION_BUS_ADDRESS",
				format!("unix:path={bus_path}"),
			)
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.status()
			.await;

		if let Err(e) = result {
			trace!(?e, "Failed to deliver desktop notification;");
		}
	}
}

async fn user_name_for_uid(uid: u32) -> Option<String> {
	let passwd = tokio::fs::read_to_string("/etc/passwd").await.ok()?;

	passwd.lines().find_map(|line| {
		let mut fields = line.split(':');
		let name = fields.next()?;
		let _password = fields.next()?;
		let entry_uid: u32 = fields.next()?.parse().ok()?;

		(entry_uid == uid).then(|| name.to_string())
	})
}
