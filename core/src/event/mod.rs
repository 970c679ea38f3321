//! Event-driven mirror and projection pipeline.
//!
//! Filesystem notifications and initial recursive scans feed the same
//! handlers, so a freshly mounted drive converges to the exact state a
//! continuously watched one reaches. Handlers run on a bounded worker
//! pool, never on the notification-delivery path, and every operation
//! is idempotent so scan and live events may interleave.

pub mod handlers;
pub mod pipeline;
pub mod scan;
pub mod watcher;

pub use pipeline::{EventPipeline, PipelineContext};
pub use watcher::DriveWatcher;

use std::path::PathBuf;

use thiserror::Error;

use crate::{error::FileIOError, hologram::ProjectionError};

#[derive(Error, Debug)]
pub enum PipelineError {
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error(transparent)]
	Projection(#[from] ProjectionError),
	#[error("filesystem watcher error: {0}")]
	Watcher(#[from] notify::Error),
}

/// Normalized filesystem event with typed source and target paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
	Created { path: PathBuf, is_dir: bool },
	Modified { path: PathBuf },
	Deleted { path: PathBuf },
	Moved {
		from: PathBuf,
		to: PathBuf,
		is_dir: bool,
	},
}
