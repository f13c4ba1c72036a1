//! Error taxonomy for the agent's public API boundary.
//!
//! [`Error`] is the single error type threaded through the whole crate,
//! from shell-out failures up to the command server (an external
//! collaborator) that must serialize it back to the conductor: it tags
//! the failure with the kind the protocol expects and, for subprocess
//! failures, the full command context.
use std::fmt;

use thiserror::Error;

/// Argv, captured stderr and exit status of a failed subprocess invocation.
///
/// Carried on every error variant that can originate from a shell-out, so
/// that callers several layers up (and eventually the command server) can
/// report exactly what ran and why it failed without re-deriving it.
#[derive(Debug, Clone)]
pub struct CommandFailure {
	pub argv: Vec<String>,
	pub stdout: String,
	pub stderr: String,
	pub exit_code: Option<i32>,
}

impl fmt::Display for CommandFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"command `{}` failed (exit {}): {}",
			self.argv.join(" "),
			self.exit_code
				.map(|c| c.to_string())
				.unwrap_or_else(|| "abnormal".to_owned()),
			self.stderr.trim()
		)
	}
}

#[derive(Debug, Error)]
pub enum Error {
	#[error("invalid request parameters: {0}")]
	InvalidCommandParams(String),

	#[error("image download failed: {0}")]
	ImageDownload(String),

	#[error("image checksum mismatch: expected {expected}, got {actual}")]
	ImageChecksum { expected: String, actual: String },

	#[error("failed to write image: {0}")]
	ImageWrite(String),

	#[error("device not found: {0}")]
	DeviceNotFound(String),

	#[error("instance deploy failed: {0}")]
	InstanceDeployFailure(String),

	#[error("{context}: {failure}")]
	CommandExecution {
		context: String,
		failure: CommandFailure,
	},

	#[error("virtual media boot error: {0}")]
	VirtualMediaBoot(String),

	#[error("clock sync error: {0}")]
	ClockSync(String),

	#[error("software RAID error: {0}")]
	SoftwareRaid(String),
}

impl Error {
	pub fn command(context: impl Into<String>, failure: CommandFailure) -> Self {
		Error::CommandExecution {
			context: context.into(),
			failure,
		}
	}
}
