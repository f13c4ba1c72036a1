//! The image-deployment pipeline: `cache_image`/`prepare_image`, mirroring
//! the teacher's `ImageContext::execute` top-level orchestration that
//! walks partitioning, formatting, bootloader and compression sub-steps
//! in a fixed order — here the fixed order is download/verify, partition,
//! write, fix-up, validate.
pub mod checksum;
pub mod download;
pub mod write;

use std::{
	path::{Path, PathBuf},
	sync::Mutex,
};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::partition::{ConfigDriveSource, PartitionUuids};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageType {
	Partition,
	WholeDisk,
}

/// Request payload the command server hands the core for a deploy,
/// mirroring §3's `ImageInfo`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageInfo {
	pub id: String,
	pub urls: Vec<String>,
	pub checksum: Option<String>,
	pub os_hash_algo: Option<String>,
	pub os_hash_value: Option<String>,
	pub image_type: ImageType,
	pub disk_format: Option<String>,
	#[serde(default)]
	pub stream_raw_images: bool,
	pub root_mb: Option<u64>,
	pub swap_mb: Option<u64>,
	pub ephemeral_mb: Option<u64>,
	pub ephemeral_format: Option<String>,
	#[serde(default)]
	pub preserve_ephemeral: bool,
	pub deploy_boot_mode: crate::inventory::BootMode,
	pub disk_label: Option<String>,
	pub node_uuid: Option<String>,
}

impl ImageInfo {
	pub fn validate(&self) -> Result<(), Error> {
		if self.urls.is_empty() {
			return Err(Error::InvalidCommandParams("image_info.urls must not be empty".to_owned()));
		}
		if self.checksum.is_none() && (self.os_hash_algo.is_none() || self.os_hash_value.is_none()) {
			return Err(Error::InvalidCommandParams(
				"image_info must set os_hash_algo+os_hash_value or checksum".to_owned(),
			));
		}
		Ok(())
	}
}

struct CachedImage {
	id: String,
	staged_path: PathBuf,
}

/// One cached image at a time, per §3: `force=true` evicts it before
/// re-downloading, matching the original's per-process temp-file cache
/// keyed by `image_info['id']`.
#[derive(Default)]
pub struct ImageCache(Mutex<Option<CachedImage>>);

impl ImageCache {
	pub fn new() -> Self {
		ImageCache(Mutex::new(None))
	}

	fn is_cached(&self, id: &str) -> Option<PathBuf> {
		let guard = self.0.lock().expect("image cache mutex poisoned");
		guard
			.as_ref()
			.filter(|c| c.id == id)
			.map(|c| c.staged_path.clone())
	}

	fn set(&self, id: String, staged_path: PathBuf) {
		let mut guard = self.0.lock().expect("image cache mutex poisoned");
		*guard = Some(CachedImage { id, staged_path });
	}
}

/// Download `image_info` to a staging file, verifying its checksum, and
/// remember its id. A second call with the same id is a no-op unless
/// `force` is set.
pub fn cache_image(
	cache: &ImageCache,
	staging_dir: &Path,
	image_info: &ImageInfo,
	force: bool,
	config: &crate::config::BmprovdConfig,
) -> Result<PathBuf, Error> {
	image_info.validate()?;
	if !force {
		if let Some(existing) = cache.is_cached(&image_info.id) {
			info!("Image {} already cached at {}", image_info.id, existing.display());
			return Ok(existing);
		}
	}

	let algo = checksum::select_algo(
		image_info.os_hash_algo.as_deref(),
		image_info.checksum.is_some(),
		config.allow_md5,
	)?;
	let expected_raw = image_info
		.os_hash_value
		.as_deref()
		.or(image_info.checksum.as_deref())
		.expect("validate() ensures one of these is present");
	let expected = checksum::resolve_expected_digest(expected_raw, &image_info.urls[0], config.http_timeout)?;

	let staged = staging_dir.join(format!("{}.img", image_info.id));
	let actual = download::download_with_retry(
		&image_info.urls,
		&staged,
		algo,
		config.http_timeout,
		config.chunk_timeout,
		config.download_max_attempts,
	)?;
	if !actual.eq_ignore_ascii_case(&expected) {
		return Err(Error::ImageChecksum {
			expected,
			actual,
		});
	}
	cache.set(image_info.id.clone(), staged.clone());
	info!("Cached image {} at {}", image_info.id, staged.display());
	Ok(staged)
}

/// Ensure `image_info` is written to `device`, optionally laying out
/// partitions first, writing config-drive, and validating the result.
#[allow(clippy::too_many_arguments)]
pub fn prepare_image(
	staged: &Path,
	device: &Path,
	image_info: &ImageInfo,
	configdrive: Option<ConfigDriveSource>,
	node_uuid: &str,
	boot_mode: crate::inventory::BootMode,
	cpu_arch: &str,
	config: &crate::config::BmprovdConfig,
) -> Result<Option<PartitionUuids>, Error> {
	match image_info.image_type {
		ImageType::WholeDisk => {
			if image_info.stream_raw_images && image_info.disk_format.as_deref().unwrap_or("").eq_ignore_ascii_case("raw") {
				info!("stream_raw_images set on a raw whole-disk image; streaming straight to {}", device.display());
				let algo = checksum::select_algo(
					image_info.os_hash_algo.as_deref(),
					image_info.checksum.is_some(),
					config.allow_md5,
				)?;
				let expected_raw = image_info
					.os_hash_value
					.as_deref()
					.or(image_info.checksum.as_deref())
					.expect("validate() ensures one of these is present");
				let expected = checksum::resolve_expected_digest(expected_raw, &image_info.urls[0], config.http_timeout)?;
				write::stream_raw_to_device(staged, device, algo, Some(&expected))?;
			} else {
				write::convert_whole_disk_image(staged, device)?;
			}
			if let Some(cd) = &configdrive {
				crate::partition::create_config_drive_partition(device, cd, node_uuid)?;
			}
			write::fix_gpt_backup_header(device);
			write::validate_partitions_present(device)?;
			Ok(None)
		}
		ImageType::Partition => {
			let disk_label = image_info.disk_label.as_deref().map(|s| match s {
				"gpt" => crate::partition::DiskLabel::Gpt,
				_ => crate::partition::DiskLabel::Msdos,
			});
			let req = crate::partition::WorkOnDiskRequest {
				device,
				root_mb: image_info.root_mb.unwrap_or(0),
				swap_mb: image_info.swap_mb.unwrap_or(0),
				ephemeral_mb: image_info.ephemeral_mb.unwrap_or(0),
				ephemeral_format: image_info.ephemeral_format.as_deref().unwrap_or("ext4"),
				image_path: Some(staged),
				node_uuid,
				preserve_ephemeral: image_info.preserve_ephemeral,
				configdrive,
				boot_mode,
				disk_label,
				cpu_arch,
			};
			let uuids = crate::partition::work_on_disk(req)?;
			write::fix_gpt_backup_header(device);
			write::validate_partitions_present(device)?;
			Ok(Some(uuids))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn validate_requires_urls_and_checksum() {
		let info = ImageInfo {
			id: "abc".into(),
			urls: vec![],
			checksum: None,
			os_hash_algo: None,
			os_hash_value: None,
			image_type: ImageType::WholeDisk,
			disk_format: None,
			stream_raw_images: false,
			root_mb: None,
			swap_mb: None,
			ephemeral_mb: None,
			ephemeral_format: None,
			preserve_ephemeral: false,
			deploy_boot_mode: crate::inventory::BootMode::Bios,
			disk_label: None,
			node_uuid: None,
		};
		assert!(info.validate().is_err());
	}
}
