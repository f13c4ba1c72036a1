//! Partition-table creation, sizing and role bookkeeping.
//!
//! `work_on_disk` is the Rust shape of the original source's function of
//! the same name: it drives `sgdisk`/`parted` (never reimplementing them,
//! per the Non-goals) to lay out root/swap/ephemeral/configdrive/ESP/PReP
//! partitions in the order mandated by boot mode and architecture, then
//! formats and populates them.
use std::{
	collections::HashMap,
	path::{Path, PathBuf},
};

use log::{debug, info};
use strum::Display;

use crate::{
	command::{run, run_once, RunOptions},
	error::Error,
	inventory::BootMode,
	partition::configdrive::ConfigDriveSource,
};

pub const PARTTYPE_EFI_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
pub const PARTTYPE_LINUX_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
pub const PARTTYPE_SWAP_GUID: &str = "0657FD6D-4C05-48B7-B489-D37A6A37391D";
pub const PARTTYPE_BIOS_BOOT_GUID: &str = "21686148-6449-6E6F-744E-656564454649";
pub const PARTTYPE_PREP_BOOT_GUID: &str = "9E1A2D38-C612-4316-AA26-8B49521E5A8B";

const BIOS_BOOT_SIZE_MIB: u64 = 8;
const PREP_BOOT_SIZE_MIB: u64 = 8;
const MIN_ESP_SIZE_MIB: u64 = 550;
const FIRST_PARTITION_START_MIB: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "title_case")]
pub enum PartitionRole {
	Root,
	Swap,
	Ephemeral,
	#[strum(serialize = "configdrive")]
	ConfigDrive,
	#[strum(serialize = "efi system partition")]
	EfiSystemPartition,
	#[strum(serialize = "PReP Boot partition")]
	PrepBootPartition,
	#[strum(serialize = "bios boot partition")]
	BiosBootPartition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskLabel {
	Msdos,
	Gpt,
}

impl DiskLabel {
	fn as_parted_str(&self) -> &'static str {
		match self {
			DiskLabel::Msdos => "msdos",
			DiskLabel::Gpt => "gpt",
		}
	}
}

/// Caller-supplied parameters for [`work_on_disk`], mirroring the
/// original function's positional/keyword arguments.
pub struct WorkOnDiskRequest<'a> {
	pub device: &'a Path,
	pub root_mb: u64,
	pub swap_mb: u64,
	pub ephemeral_mb: u64,
	pub ephemeral_format: &'a str,
	pub image_path: Option<&'a Path>,
	pub node_uuid: &'a str,
	pub preserve_ephemeral: bool,
	pub configdrive: Option<ConfigDriveSource>,
	pub boot_mode: BootMode,
	pub disk_label: Option<DiskLabel>,
	pub cpu_arch: &'a str,
}

/// Result of [`work_on_disk`]: the UUIDs the bootloader installer needs,
/// plus the full role → path map.
#[derive(Debug, Clone, Default)]
pub struct PartitionUuids {
	pub root_uuid: String,
	pub efi_system_partition_uuid: Option<String>,
	pub prep_boot_partition_uuid: Option<String>,
	pub partitions: HashMap<PartitionRole, PathBuf>,
}

struct PlannedPartition {
	role: PartitionRole,
	size_mib: Option<u64>, // None => consumes the rest of the disk (root)
	gpt_type_guid: &'static str,
	parted_fs_type: &'static str,
	label: &'static str,
}

/// Device node for partition `num` of `device`, handling the `p`-infix
/// convention used by device names ending in a digit (`nvme0n1`, loop
/// devices, `md126`) versus plain `sdX`/`vdX` names.
pub fn partition_path(device: &Path, num: u32) -> PathBuf {
	let name = device.to_string_lossy();
	if name.chars().last().map(|c| c.is_ascii_digit()).unwrap_or(false) {
		PathBuf::from(format!("{name}p{num}"))
	} else {
		PathBuf::from(format!("{name}{num}"))
	}
}

fn destroy_disk_metadata(device: &Path) -> Result<(), Error> {
	info!("Destroying existing disk metadata on {}", device.display());
	let dev = device.to_string_lossy().into_owned();
	run_once(&["wipefs", "-af", &dev])?;
	run_once(&["sgdisk", "-Z", &dev])?;
	Ok(())
}

fn plan_partitions(req: &WorkOnDiskRequest, disk_label: DiskLabel, configdrive_mb: u64) -> Vec<PlannedPartition> {
	let mut plan = Vec::new();
	if disk_label == DiskLabel::Gpt && req.boot_mode == BootMode::Bios {
		plan.push(PlannedPartition {
			role: PartitionRole::BiosBootPartition,
			size_mib: Some(BIOS_BOOT_SIZE_MIB),
			gpt_type_guid: PARTTYPE_BIOS_BOOT_GUID,
			parted_fs_type: "",
			label: "bios-boot",
		});
	}
	if req.boot_mode == BootMode::Uefi {
		plan.push(PlannedPartition {
			role: PartitionRole::EfiSystemPartition,
			size_mib: Some(MIN_ESP_SIZE_MIB),
			gpt_type_guid: PARTTYPE_EFI_GUID,
			parted_fs_type: "fat32",
			label: "efi-part",
		});
	}
	if req.ephemeral_mb > 0 {
		plan.push(PlannedPartition {
			role: PartitionRole::Ephemeral,
			size_mib: Some(req.ephemeral_mb),
			gpt_type_guid: PARTTYPE_LINUX_GUID,
			parted_fs_type: "ext4",
			label: "ephemeral0",
		});
	}
	if req.swap_mb > 0 {
		plan.push(PlannedPartition {
			role: PartitionRole::Swap,
			size_mib: Some(req.swap_mb),
			gpt_type_guid: PARTTYPE_SWAP_GUID,
			parted_fs_type: "linux-swap",
			label: "swap1",
		});
	}
	if configdrive_mb > 0 {
		plan.push(PlannedPartition {
			role: PartitionRole::ConfigDrive,
			size_mib: Some(configdrive_mb),
			gpt_type_guid: PARTTYPE_LINUX_GUID,
			parted_fs_type: "fat32",
			label: "config-2",
		});
	}
	if req.cpu_arch.starts_with("ppc") {
		plan.push(PlannedPartition {
			role: PartitionRole::PrepBootPartition,
			size_mib: Some(PREP_BOOT_SIZE_MIB),
			gpt_type_guid: PARTTYPE_PREP_BOOT_GUID,
			parted_fs_type: "",
			label: "prep-boot",
		});
	}
	plan.push(PlannedPartition {
		role: PartitionRole::Root,
		size_mib: None,
		gpt_type_guid: PARTTYPE_LINUX_GUID,
		parted_fs_type: "ext4",
		label: "root",
	});
	plan
}

fn create_gpt_partition(
	device: &Path,
	num: u32,
	start_mib: u64,
	size_mib: Option<u64>,
	type_guid: &str,
	label: &str,
) -> Result<PathBuf, Error> {
	let dev = device.to_string_lossy().into_owned();
	let create_spec = match size_mib {
		Some(size) => format!("{num}:{start_mib}MiB:+{size}MiB"),
		None => format!("{num}:{start_mib}MiB:0"),
	};
	run_once(&["sgdisk", "-n", &create_spec, &dev])?;
	run_once(&["sgdisk", "-t", &format!("{num}:{type_guid}"), &dev])?;
	run_once(&["sgdisk", "-c", &format!("{num}:{label}"), &dev])?;
	Ok(partition_path(device, num))
}

fn create_mbr_partition(
	device: &Path,
	num: u32,
	start_mib: u64,
	end_mib: Option<u64>,
	fs_type: &str,
) -> Result<PathBuf, Error> {
	let dev = device.to_string_lossy().into_owned();
	let end = end_mib
		.map(|e| format!("{e}MiB"))
		.unwrap_or_else(|| "100%".to_owned());
	let mut argv = vec!["parted", "-a", "optimal", "-s", "--", &dev[..], "mkpart", "primary"];
	let fs_type_owned = fs_type.to_owned();
	if !fs_type.is_empty() {
		argv.push(&fs_type_owned);
	}
	let start = format!("{start_mib}MiB");
	argv.push(&start);
	argv.push(&end);
	run_once(&argv)?;
	Ok(partition_path(device, num))
}

fn refresh_partition_table(device: &Path) -> Result<(), Error> {
	let dev = device.to_string_lossy().into_owned();
	run(&["partprobe", "--summary", &dev], &RunOptions::default().with_attempts(3))?;
	run_once(&["udevadm", "settle"])?;
	Ok(())
}

fn is_block_device(path: &Path) -> bool {
	std::fs::metadata(path)
		.map(|m| {
			use std::os::unix::fs::FileTypeExt;
			m.file_type().is_block_device()
		})
		.unwrap_or(false)
}

fn mkfs(fs: &str, path: &Path, label: &str) -> Result<(), Error> {
	let path_str = path.to_string_lossy().into_owned();
	match fs {
		"swap" => {
			run_once(&["mkswap", "-L", label, &path_str])?;
		}
		"vfat" | "fat32" => {
			run_once(&["mkfs.vfat", "-n", &label.to_uppercase(), &path_str])?;
		}
		other => {
			run_once(&[&format!("mkfs.{other}"), "-L", label, &path_str])?;
		}
	}
	Ok(())
}

/// Filesystem UUID via `blkid`, grounded on the low-level-probe approach
/// the teacher uses for loop-device filesystems (`blkid::prober::Prober`)
/// since a freshly partitioned disk is often not yet in the libblkid
/// cache either.
pub fn get_partition_uuid(path: &Path) -> Result<String, Error> {
	let probe = blkid::prober::Prober::new_from_filename(path).map_err(|e| {
		Error::InstanceDeployFailure(format!("failed to probe {}: {e}", path.display()))
	})?;
	match probe.do_safe_probe() {
		Ok(blkid::prober::ProbeState::Success) => {
			let values = probe.get_values_map().map_err(|e| {
				Error::InstanceDeployFailure(format!("failed to read probe values: {e}"))
			})?;
			values
				.get("UUID")
				.map(|s| s.to_owned())
				.ok_or_else(|| Error::InstanceDeployFailure(format!("no UUID found on {}", path.display())))
		}
		_ => Err(Error::InstanceDeployFailure(format!(
			"unable to identify filesystem on {}",
			path.display()
		))),
	}
}

/// Full partitioning algorithm (spec §4.3).
pub fn work_on_disk(req: WorkOnDiskRequest) -> Result<PartitionUuids, Error> {
	let commit = !req.preserve_ephemeral;
	if commit {
		destroy_disk_metadata(req.device)?;
	}

	let configdrive_mb = match &req.configdrive {
		Some(src) => {
			let mb = src.size_mib();
			if mb > crate::partition::configdrive::MAX_CONFIG_DRIVE_SIZE_MB {
				return Err(Error::InstanceDeployFailure(format!(
					"config drive size exceeds maximum limit of {}MiB (got {mb}MiB)",
					crate::partition::configdrive::MAX_CONFIG_DRIVE_SIZE_MB
				)));
			}
			mb
		}
		None => 0,
	};

	let disk_label = req.disk_label.unwrap_or(match req.boot_mode {
		BootMode::Uefi => DiskLabel::Gpt,
		BootMode::Bios => DiskLabel::Msdos,
	});
	if req.boot_mode == BootMode::Uefi && disk_label != DiskLabel::Gpt {
		return Err(Error::InstanceDeployFailure(
			"UEFI boot mode requires a GPT disk label".to_owned(),
		));
	}

	let dev_str = req.device.to_string_lossy().into_owned();
	run_once(&["parted", "-s", &dev_str, "mklabel", disk_label.as_parted_str()])?;

	let plan = plan_partitions(&req, disk_label, configdrive_mb);
	if disk_label == DiskLabel::Msdos && plan.len() > 4 {
		return Err(Error::InstanceDeployFailure(format!(
			"msdos disk label cannot hold {} primary partitions",
			plan.len()
		)));
	}

	let mut partitions = HashMap::new();
	let mut cursor_mib = FIRST_PARTITION_START_MIB;
	for (i, part) in plan.iter().enumerate() {
		let num = (i + 1) as u32;
		let path = match disk_label {
			DiskLabel::Gpt => create_gpt_partition(
				req.device,
				num,
				cursor_mib,
				part.size_mib,
				part.gpt_type_guid,
				part.label,
			)?,
			DiskLabel::Msdos => create_mbr_partition(
				req.device,
				num,
				cursor_mib,
				part.size_mib.map(|s| cursor_mib + s),
				part.parted_fs_type,
			)?,
		};
		debug!("Created {} partition at {}", part.role, path.display());
		if let Some(size) = part.size_mib {
			cursor_mib += size;
		}
		partitions.insert(part.role, path);
	}
	refresh_partition_table(req.device)?;

	let root_part = partitions
		.get(&PartitionRole::Root)
		.ok_or_else(|| Error::InstanceDeployFailure("root partition was not created".to_owned()))?
		.clone();
	if !is_block_device(&root_part) {
		return Err(Error::InstanceDeployFailure(format!(
			"root device '{}' not found",
			root_part.display()
		)));
	}
	for role in [
		PartitionRole::Swap,
		PartitionRole::Ephemeral,
		PartitionRole::ConfigDrive,
		PartitionRole::EfiSystemPartition,
		PartitionRole::PrepBootPartition,
	] {
		if let Some(p) = partitions.get(&role) {
			if !is_block_device(p) {
				return Err(Error::InstanceDeployFailure(format!(
					"'{role}' device '{}' not found",
					p.display()
				)));
			}
		}
	}

	if let Some(esp) = partitions.get(&PartitionRole::EfiSystemPartition) {
		mkfs("vfat", esp, "efi-part")?;
	}

	if let Some(cd_path) = partitions.get(&PartitionRole::ConfigDrive) {
		if let Some(src) = &req.configdrive {
			src.write_to(cd_path)?;
			info!("Configdrive copied onto partition {}", cd_path.display());
		}
	}

	if let Some(image) = req.image_path {
		crate::image::write::populate_partition_from_file(image, &root_part)?;
		info!("Image populated onto root partition {}", root_part.display());
	} else {
		debug!("Root partition {} created, but not populated", root_part.display());
	}

	if let Some(swap) = partitions.get(&PartitionRole::Swap) {
		mkfs("swap", swap, "swap1")?;
	}
	if let Some(ephemeral) = partitions.get(&PartitionRole::Ephemeral) {
		if !req.preserve_ephemeral {
			mkfs(req.ephemeral_format, ephemeral, "ephemeral0")?;
		}
	}

	let root_uuid = get_partition_uuid(&root_part)?;
	let efi_system_partition_uuid = partitions
		.get(&PartitionRole::EfiSystemPartition)
		.map(|p| get_partition_uuid(p))
		.transpose()?;
	let prep_boot_partition_uuid = if req.cpu_arch.starts_with("ppc") {
		partitions
			.get(&PartitionRole::PrepBootPartition)
			.map(|p| get_partition_uuid(p))
			.transpose()?
	} else {
		None
	};

	info!(
		"Successfully completed disk partitioning for {} on node {}",
		req.device.display(),
		req.node_uuid
	);

	Ok(PartitionUuids {
		root_uuid,
		efi_system_partition_uuid,
		prep_boot_partition_uuid,
		partitions,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partition_path_plain_suffix() {
		assert_eq!(partition_path(Path::new("/dev/sda"), 1), PathBuf::from("/dev/sda1"));
	}

	#[test]
	fn partition_path_digit_suffix_gets_p_infix() {
		assert_eq!(
			partition_path(Path::new("/dev/nvme0n1"), 2),
			PathBuf::from("/dev/nvme0n1p2")
		);
	}

	#[test]
	fn plan_bios_msdos_order() {
		let req = WorkOnDiskRequest {
			device: Path::new("/dev/sda"),
			root_mb: 10_000,
			swap_mb: 2_000,
			ephemeral_mb: 0,
			ephemeral_format: "ext4",
			image_path: None,
			node_uuid: "test",
			preserve_ephemeral: false,
			configdrive: None,
			boot_mode: BootMode::Bios,
			disk_label: Some(DiskLabel::Msdos),
			cpu_arch: "x86_64",
		};
		let plan = plan_partitions(&req, DiskLabel::Msdos, 0);
		let roles: Vec<PartitionRole> = plan.iter().map(|p| p.role).collect();
		assert_eq!(roles, vec![PartitionRole::Swap, PartitionRole::Root]);
	}

	#[test]
	fn plan_uefi_gpt_order_has_esp_first() {
		let req = WorkOnDiskRequest {
			device: Path::new("/dev/sda"),
			root_mb: 10_000,
			swap_mb: 0,
			ephemeral_mb: 0,
			ephemeral_format: "ext4",
			image_path: None,
			node_uuid: "test",
			preserve_ephemeral: false,
			configdrive: None,
			boot_mode: BootMode::Uefi,
			disk_label: Some(DiskLabel::Gpt),
			cpu_arch: "x86_64",
		};
		let plan = plan_partitions(&req, DiskLabel::Gpt, 0);
		assert_eq!(plan[0].role, PartitionRole::EfiSystemPartition);
		assert!(plan[0].size_mib.unwrap() >= MIN_ESP_SIZE_MIB);
		assert_eq!(plan.last().unwrap().role, PartitionRole::Root);
	}

	#[test]
	fn ppc_gets_prep_boot_before_root() {
		let req = WorkOnDiskRequest {
			device: Path::new("/dev/sda"),
			root_mb: 10_000,
			swap_mb: 0,
			ephemeral_mb: 0,
			ephemeral_format: "ext4",
			image_path: None,
			node_uuid: "test",
			preserve_ephemeral: false,
			configdrive: None,
			boot_mode: BootMode::Bios,
			disk_label: Some(DiskLabel::Msdos),
			cpu_arch: "ppc64le",
		};
		let plan = plan_partitions(&req, DiskLabel::Msdos, 0);
		assert_eq!(plan[plan.len() - 2].role, PartitionRole::PrepBootPartition);
		assert_eq!(plan.last().unwrap().role, PartitionRole::Root);
	}
}
