use std::{env, path::PathBuf};

use tracing::{error, info};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use wayfarer_core::{config::CONFIG_FILE_NAME, Daemon, DaemonConfig};

const DEFAULT_DATA_DIR: &str = "/var/lib/wayfarer";

fn env_filter() -> EnvFilter {
	EnvFilter::try_from_env("WAYFARER_LOG")
		.unwrap_or_else(|_| EnvFilter::new("info,wayfarer_core=debug,wayfarerd=debug"))
}

fn init_logger(data_dir: &PathBuf) -> Option<WorkerGuard> {
	let logs_dir = data_dir.join("logs");

	if std::fs::create_dir_all(&logs_dir).is_err() {
		// Console only; the daemon still works without a log directory.
		tracing_subscriber::registry()
			.with(env_filter())
			.with(fmt::layer())
			.init();
		return None;
	}

	let (non_blocking, guard) = tracing_appender::non_blocking(rolling::daily(logs_dir, "wayfarerd.log"));

	tracing_subscriber::registry()
		.with(env_filter())
		.with(fmt::layer().with_filter(LevelFilter::INFO))
		.with(
			fmt::layer()
				.with_writer(non_blocking)
				.with_ansi(false)
				.with_filter(LevelFilter::DEBUG),
		)
		.init();

	Some(guard)
}

#[tokio::main]
async fn main() {
	let data_dir = env::var("WAYFARER_DATA_DIR")
		.map(PathBuf::from)
		.unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));

	let _log_guard = init_logger(&data_dir);

	let config_path = env::var("WAYFARER_CONFIG")
		.map(PathBuf::from)
		.unwrap_or_else(|_| data_dir.join(CONFIG_FILE_NAME));

	let config = match DaemonConfig::load(&config_path).await {
		Ok(config) => config,
		Err(e) => {
			error!(?e, path = %config_path.display(), "Failed to load configuration;");
			std::process::exit(1);
		}
	};

	let daemon = match Daemon::new(config).await {
		Ok(daemon) => daemon,
		Err(e) => {
			error!(?e, "Failed to initialize daemon;");
			std::process::exit(1);
		}
	};

	tokio::select! {
		result = daemon.run() => {
			if let Err(e) = result {
				error!(?e, "Daemon loop failed;");
				std::process::exit(1);
			}
		}
		_ = tokio::signal::ctrl_c() => {
			info!("Received interrupt, shutting down;");
		}
	}
}
