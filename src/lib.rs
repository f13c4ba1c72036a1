//! `bmprovd` — bare-metal provisioning agent core.
//!
//! [`BmprovdAgent`] is the crate's single public facade over the image
//! pipeline, the partitioner and the bootloader installer, the way the
//! teacher's `ImageContext` is the single facade over its own
//! partition/bootloader/filesystem operations.
pub mod bootloader;
pub mod command;
pub mod config;
pub mod error;
pub mod hints;
pub mod image;
pub mod inventory;
pub mod logging;
pub mod params;
pub mod partition;

use std::path::{Path, PathBuf};

use log::info;

use crate::config::BmprovdConfig;
use crate::error::Error;
use crate::image::{ImageCache, ImageInfo};
use crate::inventory::InventoryCollector;
use crate::partition::{ConfigDriveSource, PartitionUuids};

/// Mirrors the command-server boundary of §6: `cache_image`,
/// `prepare_image`, `install_bootloader`, `get_partition_uuids`, `sync`,
/// `run_image`, `power_off`.
pub trait CommandServerFacade {
	fn cache_image(&self, image_info: &ImageInfo, force: bool) -> Result<PathBuf, Error>;
	fn prepare_image(
		&self,
		image_info: &ImageInfo,
		device: &Path,
		configdrive: Option<&str>,
	) -> Result<Option<PartitionUuids>, Error>;
	fn install_bootloader(
		&self,
		device: &Path,
		root_partition: &Path,
		efi_partition: Option<&Path>,
		prep_partition: Option<&Path>,
		target_boot_mode: crate::inventory::BootMode,
	) -> Result<(), Error>;
	fn get_partition_uuids(&self) -> Option<PartitionUuids>;
	fn sync(&self) -> Result<(), Error>;
	fn run_image(&self) -> Result<(), Error>;
	fn power_off(&self) -> Result<(), Error>;
}

/// The agent's single facade type: owns the image cache, the bootstrap
/// configuration and the last-seen partition-uuid map, and delegates to
/// an [`InventoryCollector`] for hardware facts.
pub struct BmprovdAgent<C: InventoryCollector> {
	pub config: BmprovdConfig,
	pub collector: C,
	cache: ImageCache,
	staging_dir: PathBuf,
	last_uuids: std::sync::Mutex<Option<PartitionUuids>>,
}

impl<C: InventoryCollector> BmprovdAgent<C> {
	pub fn new(config: BmprovdConfig, collector: C, staging_dir: PathBuf) -> Self {
		BmprovdAgent {
			config,
			collector,
			cache: ImageCache::new(),
			staging_dir,
			last_uuids: std::sync::Mutex::new(None),
		}
	}
}

impl<C: InventoryCollector> CommandServerFacade for BmprovdAgent<C> {
	fn cache_image(&self, image_info: &ImageInfo, force: bool) -> Result<PathBuf, Error> {
		std::fs::create_dir_all(&self.staging_dir)
			.map_err(|e| Error::ImageWrite(format!("failed to create staging dir: {e}")))?;
		image::cache_image(&self.cache, &self.staging_dir, image_info, force, &self.config)
	}

	fn prepare_image(
		&self,
		image_info: &ImageInfo,
		device: &Path,
		configdrive: Option<&str>,
	) -> Result<Option<PartitionUuids>, Error> {
		let staged = self.staging_dir.join(format!("{}.img", image_info.id));
		let resolved_cd: Option<ConfigDriveSource> = configdrive.map(ConfigDriveSource::resolve).transpose()?;
		// work_on_disk/install_bootloader take the *target* boot mode the
		// conductor selected for this deploy (image_info.deploy_boot_mode),
		// not the agent ramdisk's own current boot mode.
		let boot_mode = image_info.deploy_boot_mode.clone();
		let cpu_arch = self.collector.get_cpu_arch()?;
		let node_uuid = image_info.node_uuid.as_deref().unwrap_or("unknown");
		let uuids = image::prepare_image(
			&staged,
			device,
			image_info,
			resolved_cd,
			node_uuid,
			boot_mode,
			&cpu_arch,
			&self.config,
		)?;
		if let Some(u) = &uuids {
			*self.last_uuids.lock().expect("partition uuid mutex poisoned") = Some(u.clone());
		}
		Ok(uuids)
	}

	fn install_bootloader(
		&self,
		device: &Path,
		root_partition: &Path,
		efi_partition: Option<&Path>,
		prep_partition: Option<&Path>,
		target_boot_mode: crate::inventory::BootMode,
	) -> Result<(), Error> {
		bootloader::install_bootloader(device, root_partition, efi_partition, prep_partition, target_boot_mode, &self.collector)
	}

	fn get_partition_uuids(&self) -> Option<PartitionUuids> {
		self.last_uuids.lock().expect("partition uuid mutex poisoned").clone()
	}

	fn sync(&self) -> Result<(), Error> {
		command::run_once(&["sync"])?;
		Ok(())
	}

	fn run_image(&self) -> Result<(), Error> {
		self.sync()?;
		trigger_reboot("b")
	}

	fn power_off(&self) -> Result<(), Error> {
		self.sync()?;
		trigger_reboot("o")
	}
}

/// Reboot or power off, escalating to the sysrq trigger if the userspace
/// command is ignored (§6: "`run_image`/`power_off` call `sync` then
/// trigger reboot, escalating to the sysrq-trigger if the userspace
/// command is ignored").
fn trigger_reboot(sysrq_action: &str) -> Result<(), Error> {
	let argv: &[&str] = if sysrq_action == "o" { &["poweroff"] } else { &["reboot"] };
	if command::run_once(argv).is_ok() {
		return Ok(());
	}
	info!("Userspace reboot command failed; escalating to sysrq-trigger");
	std::fs::write("/proc/sysrq-trigger", sysrq_action)
		.map_err(|e| Error::InstanceDeployFailure(format!("sysrq-trigger escalation failed: {e}")))
}
