//! Config-drive resolution and the dedicated path for adding a
//! config-drive partition to a disk that already ships its own partition
//! table (an image written verbatim, e.g. a whole-disk image).
//!
//! Grounded directly on `partition_utils.py`'s `get_configdrive`,
//! `get_labelled_partition` and `create_config_drive_partition`.
use std::{
	io::Read,
	path::{Path, PathBuf},
};

use base64::Engine;
use flate2::read::GzDecoder;
use log::{debug, info, warn};

use crate::{
	command::{run_once, RunOptions},
	error::Error,
	partition::layout::{partition_path, DiskLabel},
};

pub const MAX_CONFIG_DRIVE_SIZE_MB: u64 = 64;
pub const MAX_DISK_SIZE_MB_SUPPORTED_BY_MBR: u64 = 2_097_152;
pub const CONFIGDRIVE_LABEL: &str = "config-2";

/// A resolved config-drive payload, ready to be written verbatim onto a
/// partition (the Rust analogue of `dd`-ing the decompressed file).
pub struct ConfigDriveSource {
	data: Vec<u8>,
}

impl ConfigDriveSource {
	/// Resolve `configdrive` the way `get_configdrive` does: fetch it if
	/// it's an HTTP(S) URL, then try to base64-decode + gunzip it; if
	/// decoding fails for content fetched over HTTP, fall back to
	/// treating it as already-binary content (the original's "assume
	/// binary" branch). A non-URL value that fails to decode is a hard
	/// error.
	pub fn resolve(configdrive: &str) -> Result<Self, Error> {
		let is_url = configdrive.starts_with("http://") || configdrive.starts_with("https://");
		let raw_bytes: Vec<u8> = if is_url {
			let resp = reqwest::blocking::get(configdrive).map_err(|e| {
				Error::InstanceDeployFailure(format!(
					"can't download the configdrive content from '{configdrive}': {e}"
				))
			})?;
			resp.bytes()
				.map_err(|e| {
					Error::InstanceDeployFailure(format!("failed to read configdrive response: {e}"))
				})?
				.to_vec()
		} else {
			configdrive.as_bytes().to_vec()
		};

		let decoded = base64::engine::general_purpose::STANDARD.decode(&raw_bytes);
		let data = match decoded {
			Ok(gz) => {
				let mut gunzipped = Vec::new();
				GzDecoder::new(&gz[..])
					.read_to_end(&mut gunzipped)
					.map_err(|e| {
						Error::InstanceDeployFailure(format!(
							"encountered error while decompressing config drive: {e}"
						))
					})?;
				gunzipped
			}
			Err(decode_err) => {
				if is_url {
					debug!(
						"Config drive is not base64 encoded ({decode_err}), assuming binary"
					);
					raw_bytes
				} else {
					return Err(Error::InstanceDeployFailure(format!(
						"config drive is not base64 encoded or the content is malformed: {decode_err}"
					)));
				}
			}
		};
		Ok(ConfigDriveSource { data })
	}

	/// Size rounded up to whole mebibytes, matching `math.ceil(bytes/MiB)`.
	pub fn size_mib(&self) -> u64 {
		((self.data.len() as u64) + (1024 * 1024 - 1)) / (1024 * 1024)
	}

	pub fn write_to(&self, path: &Path) -> Result<(), Error> {
		std::fs::write(path, &self.data).map_err(|e| {
			Error::InstanceDeployFailure(format!("failed to write configdrive to {}: {e}", path.display()))
		})
	}
}

/// Find an existing partition labelled `config-2` (case-insensitive), if
/// any, via `lsblk`.
pub fn get_labelled_partition(device: &Path) -> Result<Option<PathBuf>, Error> {
	let dev_str = device.to_string_lossy().into_owned();
	run_once(&["partprobe", &dev_str])?;
	let opts = RunOptions {
		check_exit_code: vec![0, 1],
		..RunOptions::default()
	};
	let out = crate::command::run(&["lsblk", "-Pno", "NAME,LABEL", &dev_str], &opts)?;
	let stdout = out.stdout_str();
	let mut found: Option<PathBuf> = None;
	for line in stdout.lines() {
		let fields = parse_lsblk_pairs(line);
		let Some(label) = fields.get("LABEL") else { continue };
		if label.eq_ignore_ascii_case(CONFIGDRIVE_LABEL) {
			let name = fields.get("NAME").cloned().unwrap_or_default();
			let candidate = PathBuf::from(format!("/dev/{}", name.trim()));
			if let Some(existing) = &found {
				return Err(Error::InstanceDeployFailure(format!(
					"more than one partition with label \"{CONFIGDRIVE_LABEL}\" exists on {}: {} and {}",
					device.display(),
					existing.display(),
					candidate.display()
				)));
			}
			found = Some(candidate);
		}
	}
	Ok(found)
}

/// Parse `lsblk -P` output (`NAME="sda1" LABEL="config-2"`) into a map.
fn parse_lsblk_pairs(line: &str) -> std::collections::HashMap<String, String> {
	let mut map = std::collections::HashMap::new();
	let mut rest = line;
	while let Some(eq) = rest.find('=') {
		let key = rest[..eq].trim().to_owned();
		rest = &rest[eq + 1..];
		if !rest.starts_with('"') {
			break;
		}
		rest = &rest[1..];
		let Some(end_quote) = rest.find('"') else { break };
		let value = rest[..end_quote].to_owned();
		map.insert(key, value);
		rest = rest[end_quote + 1..].trim_start();
	}
	map
}

fn is_disk_larger_than_max_size(device: &Path) -> Result<bool, Error> {
	let dev_str = device.to_string_lossy().into_owned();
	let out = run_once(&["blockdev", "--getsize64", &dev_str])?;
	let bytes: u64 = out
		.stdout_str()
		.trim()
		.parse()
		.map_err(|_| Error::InstanceDeployFailure(format!("unexpected blockdev output for {}", device.display())))?;
	let mb = bytes / 1024 / 1024;
	Ok(mb > MAX_DISK_SIZE_MB_SUPPORTED_BY_MBR)
}

fn count_mbr_primary_partitions(device: &Path) -> Result<u32, Error> {
	let dev_str = device.to_string_lossy().into_owned();
	let out = run_once(&["lsblk", "-Pno", "NAME", &dev_str])?;
	Ok(out
		.stdout_str()
		.lines()
		.filter(|l| !l.trim().is_empty())
		.count()
		.saturating_sub(1) as u32)
}

fn list_partition_numbers(device: &Path) -> Result<std::collections::HashSet<u32>, Error> {
	let dev_str = device.to_string_lossy().into_owned();
	let out = run_once(&["lsblk", "-Pno", "NAME", &dev_str])?;
	let name = device.file_name().unwrap_or_default().to_string_lossy().into_owned();
	let mut nums = std::collections::HashSet::new();
	for line in out.stdout_str().lines() {
		let fields = parse_lsblk_pairs(line);
		if let Some(n) = fields.get("NAME") {
			if let Some(suffix) = n.trim().strip_prefix(&name) {
				let digits: String = suffix.trim_start_matches('p').chars().filter(|c| c.is_ascii_digit()).collect();
				if let Ok(num) = digits.parse() {
					nums.insert(num);
				}
			}
		}
	}
	Ok(nums)
}

fn wait_for_device(path: &Path, attempts: u32) -> Result<(), Error> {
	for attempt in 1..=attempts {
		if path.exists() {
			return Ok(());
		}
		warn!(
			"Waiting for {} to appear (attempt {}/{})",
			path.display(),
			attempt,
			attempts
		);
		std::thread::sleep(std::time::Duration::from_millis(500));
	}
	Err(Error::InstanceDeployFailure(format!(
		"partition {} did not appear in time",
		path.display()
	)))
}

/// Add a config drive to a disk that already has a partition table,
/// reusing an existing `config-2`-labelled partition if present.
///
/// Takes an already-resolved [`ConfigDriveSource`] rather than a raw
/// URL/inline string so a caller that resolved it once (e.g. to decide
/// whether a partition-image deploy even needs this path) never pays for
/// a second download.
pub fn create_config_drive_partition(
	device: &Path,
	source: &ConfigDriveSource,
	node_uuid: &str,
) -> Result<(), Error> {
	let mb = source.size_mib();
	if mb > MAX_CONFIG_DRIVE_SIZE_MB {
		return Err(Error::InstanceDeployFailure(format!(
			"config drive size exceeds maximum limit of {MAX_CONFIG_DRIVE_SIZE_MB}MiB; got {mb}MiB for node {node_uuid}"
		)));
	}
	info!("Adding config drive partition ({mb}MiB) to {}", device.display());

	let existing = get_labelled_partition(device)?;
	let config_drive_part = if let Some(p) = existing {
		debug!("Configdrive for node {node_uuid} exists at {}", p.display());
		p
	} else {
		let before = list_partition_numbers(device)?;
		let table_type = detect_table_type(device)?;
		match table_type {
			DiskLabel::Gpt => {
				let dev_str = device.to_string_lossy().into_owned();
				run_once(&["sgdisk", "-n", &format!("0:-{MAX_CONFIG_DRIVE_SIZE_MB}MB:0"), &dev_str])?;
			}
			DiskLabel::Msdos => {
				let pp_count = count_mbr_primary_partitions(device)?;
				if pp_count > 3 {
					return Err(Error::InstanceDeployFailure(format!(
						"config drive cannot be created for node {node_uuid}: disk {} already has {pp_count} primary partitions",
						device.display()
					)));
				}
				let dev_str = device.to_string_lossy().into_owned();
				let (start, end) = if is_disk_larger_than_max_size(device)? {
					warn!(
						"Disk size is larger than 2TiB for node {node_uuid}; creating config drive at the end of {}",
						device.display()
					);
					(
						(MAX_DISK_SIZE_MB_SUPPORTED_BY_MBR - MAX_CONFIG_DRIVE_SIZE_MB - 1).to_string(),
						(MAX_DISK_SIZE_MB_SUPPORTED_BY_MBR - 1).to_string(),
					)
				} else {
					(format!("-{MAX_CONFIG_DRIVE_SIZE_MB}MiB"), "-0".to_owned())
				};
				run_once(&[
					"parted", "-a", "optimal", "-s", "--", &dev_str, "mkpart", "primary", "fat32", &start, &end,
				])?;
			}
		}
		let dev_str = device.to_string_lossy().into_owned();
		run_once(&["partprobe", &dev_str])?;
		let after = list_partition_numbers(device)?;
		let mut new_parts: Vec<&u32> = after.difference(&before).collect();
		if new_parts.len() != 1 {
			return Err(Error::InstanceDeployFailure(format!(
				"disk partitioning failed on {}: unable to retrieve config drive partition information",
				device.display()
			)));
		}
		let new_num = *new_parts.pop().unwrap();
		let part_path = partition_path(device, new_num);
		run_once(&["udevadm", "settle"])?;
		debug!("Waiting for config drive partition {} for node {node_uuid}", part_path.display());
		wait_for_device(&part_path, 15)?;
		part_path
	};

	source.write_to(&config_drive_part)?;
	info!("Configdrive for node {node_uuid} successfully copied onto partition {}", config_drive_part.display());
	Ok(())
}

fn detect_table_type(device: &Path) -> Result<DiskLabel, Error> {
	let dev_str = device.to_string_lossy().into_owned();
	let out = run_once(&["blkid", "-o", "value", "-s", "PTTYPE", &dev_str])?;
	match out.stdout_str().trim() {
		"gpt" => Ok(DiskLabel::Gpt),
		_ => Ok(DiskLabel::Msdos),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn size_mib_rounds_up() {
		let src = ConfigDriveSource { data: vec![0u8; 1024 * 1024 + 1] };
		assert_eq!(src.size_mib(), 2);
	}

	#[test]
	fn parse_lsblk_pairs_basic() {
		let map = parse_lsblk_pairs(r#"NAME="sda1" LABEL="config-2""#);
		assert_eq!(map.get("NAME").map(String::as_str), Some("sda1"));
		assert_eq!(map.get("LABEL").map(String::as_str), Some("config-2"));
	}

	#[test]
	fn scenario_d_boundaries() {
		let start = MAX_DISK_SIZE_MB_SUPPORTED_BY_MBR - MAX_CONFIG_DRIVE_SIZE_MB - 1;
		let end = MAX_DISK_SIZE_MB_SUPPORTED_BY_MBR - 1;
		assert_eq!(start, 2_097_087);
		assert_eq!(end, 2_097_151);
	}
}
