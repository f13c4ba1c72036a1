//! Process-wide configuration, initialized once at bootstrap from the
//! merged kernel-cmdline/vmedia parameters (see [`crate::params`]) and
//! overridden by CLI flags. Read-only for the remainder of the process,
//! per the "singleton configuration" design note: avoids threading a
//! config value through every call by hand the way `mkrawimg`'s
//! `Cmdline` is parsed once in `main()` and handed down instead.
use std::time::Duration;

use crate::params::ParamSource;

#[derive(Debug, Clone)]
pub struct BmprovdConfig {
	/// Per-connection HTTP timeout for image/checksum downloads.
	pub http_timeout: Duration,
	/// Maximum download attempts per URL before moving to the next one.
	pub download_max_attempts: u32,
	/// Per-chunk read timeout while streaming a download.
	pub chunk_timeout: Duration,
	/// Chunk size used while streaming downloads to disk.
	pub chunk_size: usize,
	/// Whether legacy MD5 checksums are accepted. The upstream source
	/// supports only MD5 for the plain `checksum` field; gated because
	/// MD5 may be unavailable on hardened hosts (spec open question).
	pub allow_md5: bool,
	/// Retries for `umount` before giving up on a mount guard.
	pub mount_unmount_retries: u32,
	pub listen_host: Option<String>,
	pub listen_port: Option<u16>,
}

impl Default for BmprovdConfig {
	fn default() -> Self {
		BmprovdConfig {
			http_timeout: Duration::from_secs(60),
			download_max_attempts: 9,
			chunk_timeout: Duration::from_secs(60),
			chunk_size: 1024 * 1024,
			allow_md5: false,
			mount_unmount_retries: 3,
			listen_host: None,
			listen_port: None,
		}
	}
}

impl BmprovdConfig {
	/// Build the config by layering bootstrap parameters under the
	/// (already-parsed) CLI overrides; CLI flags always win.
	pub fn from_params(
		params: &ParamSource,
		allow_md5_override: Option<bool>,
	) -> Result<Self, crate::error::Error> {
		let mut config = BmprovdConfig::default();
		let agent_params = params.get_agent_params()?;
		if let Some(host) = agent_params.get("ipa-listen-host") {
			config.listen_host = Some(host.clone());
		}
		if let Some(port) = agent_params.get("ipa-listen-port") {
			if let Ok(p) = port.parse() {
				config.listen_port = Some(p);
			}
		}
		if let Some(allow_md5) = allow_md5_override {
			config.allow_md5 = allow_md5;
		}
		Ok(config)
	}
}
