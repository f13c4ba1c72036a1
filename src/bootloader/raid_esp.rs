//! Software-RAID mirrored ESP creation, grounded on §4.4's
//! "Software-RAID ESP" subsection.
use std::path::{Path, PathBuf};

use log::info;

use crate::command::run_once;
use crate::error::Error;
use crate::inventory::InventoryCollector;

const HOLDER_ESP_SIZE_MIB: u64 = 550;
const RAID_METADATA_VERSION: &str = "1.0";
const MAX_MD_DEVICES: u32 = 128;

/// One leg of a software-RAID mirrored ESP: the holder disk and the
/// partition number on it carrying the RAID member.
pub struct RaidHolder {
	pub disk: PathBuf,
	pub partition_num: u32,
}

/// Create a 550 MiB ESP on each holder disk, type `ef00`, labelled
/// `uefi-holder-<n>`.
pub fn create_holder_esps(holders: &[PathBuf]) -> Result<Vec<RaidHolder>, Error> {
	let mut result = Vec::new();
	for (i, disk) in holders.iter().enumerate() {
		let n = i + 1;
		let dev_str = disk.to_string_lossy().into_owned();
		let label = format!("uefi-holder-{n}");
		run_once(&["sgdisk", "-n", &format!("0:0:+{HOLDER_ESP_SIZE_MIB}MiB"), &dev_str])?;
		run_once(&["sgdisk", "-t", "0:ef00", &dev_str])?;
		run_once(&["sgdisk", "-c", &format!("0:{label}"), &dev_str])?;
		let part_out = run_once(&["blkid", "-t", &format!("PARTLABEL={label}"), "-o", "device", &dev_str])?;
		let part_path = part_out
			.stdout_str()
			.lines()
			.next()
			.map(PathBuf::from)
			.unwrap_or_else(|| disk.clone());
		let num = partition_number(&part_path, disk);
		result.push(RaidHolder {
			disk: disk.clone(),
			partition_num: num,
		});
	}
	Ok(result)
}

fn partition_number(partition: &Path, disk: &Path) -> u32 {
	let part_name = partition.to_string_lossy();
	let disk_name = disk.to_string_lossy();
	part_name
		.strip_prefix(disk_name.as_ref())
		.unwrap_or(&part_name)
		.trim_start_matches('p')
		.parse()
		.unwrap_or(1)
}

/// Assemble (or reuse) a RAID1 device across `holders`' ESP partitions.
/// `metadata=1.0` is mandatory: firmware must still see each leg as a
/// plain FAT32 partition, which superblock versions >= 1.1 (written at
/// the start of the member) would hide.
pub fn assemble_raid1_esp(md_device: &Path, holders: &[RaidHolder]) -> Result<(), Error> {
	let md_str = md_device.to_string_lossy().into_owned();
	let mut argv: Vec<String> = vec![
		"mdadm".into(),
		"--create".into(),
		md_str,
		"--metadata".into(),
		RAID_METADATA_VERSION.into(),
		"--level".into(),
		"1".into(),
		"--name".into(),
		"esp".into(),
		"--raid-devices".into(),
		holders.len().to_string(),
	];
	for h in holders {
		let part = crate::partition::layout::partition_path(&h.disk, h.partition_num);
		argv.push(part.to_string_lossy().into_owned());
	}
	let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
	run_once(&argv_refs)?;
	info!("Assembled RAID1 ESP {} over {} holder(s)", md_device.display(), holders.len());
	Ok(())
}

/// Pick the first unused `/dev/md{n}` name, diffing candidates against
/// the collector's current block-device listing, the way
/// `raid_utils.py::get_next_free_raid_device` scans `/dev`.
pub fn next_free_md_device(collector: &dyn InventoryCollector) -> Result<PathBuf, Error> {
	let existing: std::collections::HashSet<String> =
		collector.list_block_devices()?.into_iter().map(|d| d.name).collect();
	for idx in 0..MAX_MD_DEVICES {
		let candidate = format!("/dev/md{idx}");
		if !existing.contains(&candidate) {
			return Ok(PathBuf::from(candidate));
		}
	}
	Err(Error::SoftwareRaid("no free md (RAID) devices are left".to_owned()))
}

/// Populate the mirrored ESP: if an ESP was discovered on the RAID
/// device already, block-copy it to the mirror then wipe the source;
/// otherwise format the mirror fresh.
pub fn populate_mirrored_esp(md_device: &Path, discovered_esp: Option<&Path>) -> Result<(), Error> {
	let md_str = md_device.to_string_lossy().into_owned();
	if let Some(src) = discovered_esp {
		let src_str = src.to_string_lossy().into_owned();
		run_once(&["dd", &format!("if={src_str}"), &format!("of={md_str}"), "bs=1M"])?;
		run_once(&["wipefs", "-af", &src_str])?;
	} else {
		run_once(&["mkfs.vfat", "-n", "EFI-PART", &md_str])?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partition_number_plain_suffix() {
		assert_eq!(partition_number(Path::new("/dev/sda1"), Path::new("/dev/sda")), 1);
	}

	#[test]
	fn partition_number_p_infix() {
		assert_eq!(partition_number(Path::new("/dev/nvme0n1p2"), Path::new("/dev/nvme0n1")), 2);
	}
}
