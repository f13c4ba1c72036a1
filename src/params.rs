//! Bootstrap parameter parsing: `key=value` tokens from `/proc/cmdline`,
//! optionally augmented by a `parameters.txt` read off a mounted virtual
//! media device.
//!
//! Grounded directly on the original agent's `_read_params_from_file` /
//! `_get_vmedia_params` / `get_agent_params`: parameters are read once,
//! cached for the life of the process, and vmedia values win over
//! cmdline values on conflict.
use std::{
	collections::HashMap,
	fs,
	path::{Path, PathBuf},
};

use log::debug;

use crate::{command::run_once, error::Error};

const RECOGNIZED_KEYS: &[&str] = &[
	"ipa-api-url",
	"ipa-listen-host",
	"ipa-listen-port",
	"ipa-advertise-host",
	"ipa-advertise-port",
	"ipa-insecure",
	"ipa-agent-token",
	"ipa-ironic-api-version",
	"ipa-inspection-callback-url",
	"ipa-inspection-collectors",
	"root_device",
	"boot_method",
];

/// Parse `key=value` whitespace-separated tokens out of a file's
/// contents. Tokens without `=` are silently skipped.
pub fn read_params_from_str(contents: &str) -> HashMap<String, String> {
	let mut params = HashMap::new();
	for token in contents.split_whitespace() {
		if let Some((k, v)) = token.split_once('=') {
			params.insert(k.to_owned(), v.to_owned());
		}
	}
	params
}

fn read_params_from_file(path: &Path) -> Result<HashMap<String, String>, Error> {
	let contents = fs::read_to_string(path)
		.map_err(|e| Error::VirtualMediaBoot(format!("failed to read {}: {e}", path.display())))?;
	Ok(read_params_from_str(&contents))
}

/// Find the virtual-media device by scanning sysfs block device models
/// for one whose model string contains "virtual media", the way the
/// original agent falls back to this sysfs scan for older deploy
/// ramdisks that don't label the device `ir-vfd-dev`.
fn find_vmedia_device_by_model() -> Option<PathBuf> {
	let glob_dir = Path::new("/sys/class/block");
	let entries = fs::read_dir(glob_dir).ok()?;
	for entry in entries.flatten() {
		let model_path = entry.path().join("device/model");
		if let Ok(model) = fs::read_to_string(&model_path) {
			if model.to_lowercase().contains("virtual media") {
				return Some(Path::new("/dev").join(entry.file_name()));
			}
		}
	}
	None
}

fn vmedia_device_path() -> Result<PathBuf, Error> {
	for candidate in [
		"/dev/disk/by-label/ir-vfd-dev",
		"/dev/disk/by-label/IR-VFD-DEV",
	] {
		if Path::new(candidate).exists() {
			return Ok(PathBuf::from(candidate));
		}
	}
	find_vmedia_device_by_model()
		.ok_or_else(|| Error::VirtualMediaBoot("unable to find virtual media device".to_owned()))
}

/// Mount the virtual media device, read `parameters.txt` off it, unmount.
fn read_vmedia_params() -> Result<HashMap<String, String>, Error> {
	let device = vmedia_device_path()?;
	let mountpoint = std::env::temp_dir().join(format!("bmprovd-vmedia-{}", std::process::id()));
	fs::create_dir_all(&mountpoint)
		.map_err(|e| Error::VirtualMediaBoot(format!("failed to create mountpoint: {e}")))?;

	let device_str = device.to_string_lossy().into_owned();
	let mountpoint_str = mountpoint.to_string_lossy().into_owned();
	run_once(&["mount", &device_str, &mountpoint_str]).map_err(|e| {
		Error::VirtualMediaBoot(format!(
			"unable to mount virtual media device {}: {e}",
			device.display()
		))
	})?;

	let params_result = read_params_from_file(&mountpoint.join("parameters.txt"));
	// Best-effort cleanup, mirroring the original's bare `except: pass`.
	let _ = run_once(&["umount", &mountpoint_str]);
	let _ = fs::remove_dir(&mountpoint);

	params_result
}

/// Read, cache and merge bootstrap parameters. The kernel cmdline is read
/// first; if `boot_method=vmedia`, the virtual-media parameters file is
/// merged on top (vmedia wins on conflicting keys).
pub struct ParamSource {
	cmdline_path: PathBuf,
	cache: std::sync::OnceLock<HashMap<String, String>>,
}

impl Default for ParamSource {
	fn default() -> Self {
		ParamSource {
			cmdline_path: PathBuf::from("/proc/cmdline"),
			cache: std::sync::OnceLock::new(),
		}
	}
}

impl ParamSource {
	pub fn with_cmdline_path(path: impl Into<PathBuf>) -> Self {
		ParamSource {
			cmdline_path: path.into(),
			cache: std::sync::OnceLock::new(),
		}
	}

	pub fn get_agent_params(&self) -> Result<&HashMap<String, String>, Error> {
		if let Some(cached) = self.cache.get() {
			return Ok(cached);
		}
		let mut params = if self.cmdline_path.exists() {
			read_params_from_file(&self.cmdline_path)?
		} else {
			HashMap::new()
		};
		if params.get("boot_method").map(String::as_str) == Some("vmedia") {
			let vmedia = read_vmedia_params()?;
			params.extend(vmedia);
		}
		for key in params.keys() {
			if !RECOGNIZED_KEYS.contains(&key.as_str()) {
				debug!("Unrecognized bootstrap parameter \"{key}\" preserved but ignored");
			}
		}
		let _ = self.cache.set(params);
		Ok(self.cache.get().expect("just set"))
	}

	pub fn root_device_hint_string(&self) -> Result<Option<String>, Error> {
		Ok(self.get_agent_params()?.get("root_device").cloned())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_key_value_tokens() {
		let parsed = read_params_from_str(
			"BOOT_IMAGE=/vmlinuz root=/dev/sda1 ipa-api-url=http://10.0.0.1:6385 quiet",
		);
		assert_eq!(
			parsed.get("ipa-api-url").map(String::as_str),
			Some("http://10.0.0.1:6385")
		);
		assert!(!parsed.contains_key("quiet"));
	}
}
