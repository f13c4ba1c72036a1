//! Bootloader installation: GRUB2 inside a chroot plus EFI NVRAM entry
//! management, including software-RAID mirrored ESPs.
pub mod efi;
pub mod grub;
pub mod raid_esp;

use std::path::{Path, PathBuf};

use log::info;

use crate::error::Error;
use crate::inventory::{BootMode, InventoryCollector};

/// Top-level entry point matching the command-server contract:
/// `install_bootloader(root_uuid, efi_system_part_uuid?, prep_boot_part_uuid?, target_boot_mode)`.
///
/// For a software-RAID target device (`collector.is_md_device`), UEFI NVRAM
/// registration takes the mirrored-ESP path instead of the single-disk one,
/// matching `efi_utils.py::manage_uefi`'s dispatch on `hardware.is_md_device`.
pub fn install_bootloader(
	device: &Path,
	root_partition: &Path,
	efi_partition: Option<&Path>,
	prep_partition: Option<&Path>,
	target_boot_mode: BootMode,
	collector: &dyn InventoryCollector,
) -> Result<(), Error> {
	grub::install_grub(root_partition, efi_partition, device, target_boot_mode.clone(), prep_partition)?;

	if target_boot_mode == BootMode::Uefi {
		if collector.is_md_device(device)? {
			install_raid_esp(device, efi_partition, collector)?;
		} else {
			let esp = efi_partition
				.map(Path::to_path_buf)
				.or(grub::discover_esp(device)?)
				.ok_or_else(|| Error::InstanceDeployFailure("no EFI system partition found for UEFI deploy".to_owned()))?;
			install_efi_entries(device, &esp, 1)?;
		}
	}
	info!("Bootloader installation complete for {}", device.display());
	Ok(())
}

/// Create a mirrored ESP across `device`'s holder disks, populate it from
/// whatever ESP was discovered (or format fresh), and register one NVRAM
/// entry per holder leg, per §4.4's "Software-RAID ESP" subsection.
fn install_raid_esp(device: &Path, efi_partition: Option<&Path>, collector: &dyn InventoryCollector) -> Result<(), Error> {
	let holder_names = collector.get_holder_disks(device)?;
	if holder_names.is_empty() {
		return Err(Error::SoftwareRaid(format!("{} is a RAID device with no holder disks", device.display())));
	}
	let holder_disks: Vec<PathBuf> = holder_names.into_iter().map(PathBuf::from).collect();
	let source_esp = efi_partition.map(Path::to_path_buf).or(grub::discover_esp(device)?);

	let holders = raid_esp::create_holder_esps(&holder_disks)?;
	let md_device = raid_esp::next_free_md_device(collector)?;
	raid_esp::assemble_raid1_esp(&md_device, &holders)?;
	raid_esp::populate_mirrored_esp(&md_device, source_esp.as_deref())?;

	let tmp = std::env::temp_dir().join(format!("bmprovd-raid-esp-{}", uuid::Uuid::new_v4()));
	std::fs::create_dir_all(&tmp)
		.map_err(|e| Error::InstanceDeployFailure(format!("failed to create {}: {e}", tmp.display())))?;
	let mount = crate::command::MountGuard::mount(&md_device, &tmp, None, &[])?.strict();

	let result = (|| -> Result<(), Error> {
		let candidates = efi::discover_candidates(mount.path())?;
		for candidate in candidates {
			let loader_path = format!("\\{}", candidate.loader_path.trim_start_matches('\\'));
			install_raid_esp_entries(&holders, &candidate.label, &loader_path)?;
		}
		Ok(())
	})();

	mount.unmount_now()?;
	let _ = std::fs::remove_dir(&tmp);
	result
}

/// Mount the ESP, discover loader candidates, and register an NVRAM
/// entry for each, cleaning up duplicates by label first.
fn install_efi_entries(device: &Path, esp_partition: &Path, esp_partnum: u32) -> Result<(), Error> {
	let tmp = std::env::temp_dir().join(format!("bmprovd-esp-{}", uuid::Uuid::new_v4()));
	std::fs::create_dir_all(&tmp)
		.map_err(|e| Error::InstanceDeployFailure(format!("failed to create {}: {e}", tmp.display())))?;
	let mount = crate::command::MountGuard::mount(esp_partition, &tmp, None, &[])?.strict();

	let result = (|| -> Result<(), Error> {
		let candidates = efi::discover_candidates(mount.path())?;
		for candidate in candidates {
			let loader_path = format!("\\{}", candidate.loader_path.trim_start_matches('\\'));
			efi::create_entry(device, esp_partnum, &candidate.label, &loader_path)?;
		}
		Ok(())
	})();

	mount.unmount_now()?;
	let _ = std::fs::remove_dir(&tmp);
	result
}

/// Install NVRAM entries for each leg of a software-RAID mirrored ESP.
pub fn install_raid_esp_entries(holders: &[raid_esp::RaidHolder], base_label: &str, loader_path: &str) -> Result<(), Error> {
	let pairs: Vec<(PathBuf, u32)> = holders.iter().map(|h| (h.disk.clone(), h.partition_num)).collect();
	efi::create_raid_entries(&pairs, base_label, loader_path)
}
