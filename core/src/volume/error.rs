use thiserror::Error;

#[derive(Error, Debug)]
pub enum VolumeError {
	#[error("device inventory failure: {0}")]
	Inventory(String),
	#[error("malformed device inventory output: {0}")]
	InventoryParse(#[from] serde_json::Error),
	#[error("failed to mount '{device}': {reason}")]
	MountFailure { device: String, reason: String },
	#[error("failed to unmount '{0}': {1}")]
	UnmountFailure(String, String),
}
