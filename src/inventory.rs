//! Block-device inventory model and the
//! [`InventoryCollector`] contract consumed by the core.
//!
//! Collecting CPU/NIC/DMI/LLDP facts is an external collaborator's job;
//! this module only defines the shapes the core reads (`BlockDevice`) and
//! the boundary trait so the partitioner, the image pipeline and the
//! root-device selector can be exercised against a
//! [`MockInventoryCollector`] in tests without a real disk.
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{command::run_once, error::Error};

/// A string-valued device attribute that may carry more than one value
/// (serial numbers, WWNs — some HBAs report several).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringAttr {
	One(String),
	Many(Vec<String>),
}

impl StringAttr {
	pub fn single(s: impl Into<String>) -> Self {
		StringAttr::One(s.into())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum BootMode {
	#[serde(rename = "bios")]
	Bios,
	#[serde(rename = "uefi")]
	Uefi,
}

/// One candidate install target, as reported by the inventory collector.
///
/// Two `BlockDevice`s are "the same" iff their kernel `name` matches;
/// nothing else about the struct is compared for identity.
#[derive(Debug, Clone)]
pub struct BlockDevice {
	pub name: String,
	pub size: u64,
	pub model: Option<StringAttr>,
	pub vendor: Option<StringAttr>,
	pub serial: Option<StringAttr>,
	pub wwn: Option<StringAttr>,
	pub wwn_with_extension: Option<StringAttr>,
	pub wwn_vendor_extension: Option<StringAttr>,
	pub rotational: Option<bool>,
	pub hctl: Option<String>,
	pub by_path: Option<String>,
	pub tran: Option<String>,
	/// Mirrors `name` but typed as a [`StringAttr`] so the hint matcher
	/// can treat the `name` hint uniformly with the other string hints.
	pub(crate) name_attr: StringAttr,
}

impl PartialEq for BlockDevice {
	fn eq(&self, other: &Self) -> bool {
		self.name == other.name
	}
}

impl BlockDevice {
	pub fn new(name: impl Into<String>, size: u64) -> Self {
		let name = name.into();
		BlockDevice {
			name_attr: StringAttr::single(name.clone()),
			name,
			size,
			model: None,
			vendor: None,
			serial: None,
			wwn: None,
			wwn_with_extension: None,
			wwn_vendor_extension: None,
			rotational: None,
			hctl: None,
			by_path: None,
			tran: None,
		}
	}

	#[cfg(test)]
	pub fn new_for_test(name: impl Into<String>, size: u64) -> Self {
		Self::new(name, size)
	}
}

/// Contract consumed by the core. A real implementation shells out to
/// `lsblk`/`dmidecode`-equivalents; tests substitute
/// [`MockInventoryCollector`].
pub trait InventoryCollector {
	fn list_block_devices(&self) -> Result<Vec<BlockDevice>, Error>;
	fn get_os_install_device(&self, permit_refresh: bool) -> Result<BlockDevice, Error>;
	fn get_boot_info(&self) -> Result<BootMode, Error>;
	fn is_md_device(&self, path: &Path) -> Result<bool, Error>;
	fn get_holder_disks(&self, path: &Path) -> Result<Vec<String>, Error>;
	fn get_component_devices(&self, md_path: &Path) -> Result<Vec<String>, Error>;
	fn get_cpu_arch(&self) -> Result<String, Error>;
}

/// `lsblk`-backed collector for real hardware.
pub struct LinuxInventoryCollector {
	pub root_device_hints: Option<crate::hints::RootDeviceHints>,
}

#[derive(Debug, Deserialize)]
struct LsblkReport {
	blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
	name: String,
	size: Option<String>,
	model: Option<String>,
	vendor: Option<String>,
	serial: Option<String>,
	wwn: Option<String>,
	rota: Option<bool>,
	#[serde(rename = "hctl")]
	hctl: Option<String>,
	tran: Option<String>,
	#[serde(rename = "type")]
	dev_type: Option<String>,
}

impl LinuxInventoryCollector {
	pub fn new(root_device_hints: Option<crate::hints::RootDeviceHints>) -> Self {
		LinuxInventoryCollector { root_device_hints }
	}

	fn run_lsblk(&self) -> Result<Vec<BlockDevice>, Error> {
		let out = run_once(&[
			"lsblk",
			"-b",
			"-n",
			"-J",
			"-o",
			"NAME,SIZE,MODEL,VENDOR,SERIAL,WWN,ROTA,HCTL,TRAN,TYPE",
		])?;
		let report: LsblkReport = serde_json::from_slice(&out.stdout).map_err(|e| {
			Error::DeviceNotFound(format!("failed to parse lsblk output: {e}"))
		})?;
		let devices = report
			.blockdevices
			.into_iter()
			.filter(|d| d.dev_type.as_deref() == Some("disk"))
			.map(|d| {
				let name = format!("/dev/{}", d.name);
				let size: u64 = d.size.as_deref().unwrap_or("0").parse().unwrap_or(0);
				let mut device = BlockDevice::new(name, size);
				device.model = d.model.map(StringAttr::single);
				device.vendor = d.vendor.map(StringAttr::single);
				device.serial = d.serial.map(StringAttr::single);
				device.wwn = d.wwn.map(StringAttr::single);
				device.rotational = d.rota;
				device.hctl = d.hctl;
				device.tran = d.tran;
				device
			})
			.collect();
		Ok(devices)
	}
}

impl InventoryCollector for LinuxInventoryCollector {
	fn list_block_devices(&self) -> Result<Vec<BlockDevice>, Error> {
		self.run_lsblk()
	}

	fn get_os_install_device(&self, _permit_refresh: bool) -> Result<BlockDevice, Error> {
		let devices = self.list_block_devices()?;
		let dev = crate::hints::select_root_device(&devices, self.root_device_hints.as_ref())?;
		Ok(dev.clone())
	}

	fn get_boot_info(&self) -> Result<BootMode, Error> {
		if Path::new("/sys/firmware/efi").is_dir() {
			Ok(BootMode::Uefi)
		} else {
			Ok(BootMode::Bios)
		}
	}

	fn is_md_device(&self, path: &Path) -> Result<bool, Error> {
		Ok(path
			.file_name()
			.map(|n| n.to_string_lossy().starts_with("md"))
			.unwrap_or(false))
	}

	fn get_holder_disks(&self, path: &Path) -> Result<Vec<String>, Error> {
		let slaves_dir = Path::new("/sys/class/block")
			.join(path.file_name().unwrap_or_default())
			.join("slaves");
		let mut holders = Vec::new();
		if slaves_dir.is_dir() {
			for entry in std::fs::read_dir(&slaves_dir).map_err(|e| {
				Error::DeviceNotFound(format!("failed to read {}: {e}", slaves_dir.display()))
			})? {
				let entry = entry.map_err(|e| Error::DeviceNotFound(e.to_string()))?;
				holders.push(format!("/dev/{}", entry.file_name().to_string_lossy()));
			}
		}
		debug!("Holder disks for {}: {:?}", path.display(), holders);
		Ok(holders)
	}

	fn get_component_devices(&self, md_path: &Path) -> Result<Vec<String>, Error> {
		self.get_holder_disks(md_path)
	}

	fn get_cpu_arch(&self) -> Result<String, Error> {
		let out = run_once(&["uname", "-m"])?;
		Ok(out.stdout_str().trim().to_owned())
	}
}

/// Test double used by the partitioner/bootloader/image-pipeline test
/// suites so they don't need a real disk.
#[cfg(any(test, feature = "test-support"))]
pub struct MockInventoryCollector {
	pub devices: Vec<BlockDevice>,
	pub boot_mode: BootMode,
}

#[cfg(any(test, feature = "test-support"))]
impl InventoryCollector for MockInventoryCollector {
	fn list_block_devices(&self) -> Result<Vec<BlockDevice>, Error> {
		Ok(self.devices.clone())
	}

	fn get_os_install_device(&self, _permit_refresh: bool) -> Result<BlockDevice, Error> {
		crate::hints::select_root_device(&self.devices, None).cloned()
	}

	fn get_boot_info(&self) -> Result<BootMode, Error> {
		Ok(self.boot_mode.clone())
	}

	fn is_md_device(&self, path: &Path) -> Result<bool, Error> {
		Ok(path.to_string_lossy().contains("md"))
	}

	fn get_holder_disks(&self, _path: &Path) -> Result<Vec<String>, Error> {
		Ok(Vec::new())
	}

	fn get_component_devices(&self, _md_path: &Path) -> Result<Vec<String>, Error> {
		Ok(Vec::new())
	}

	fn get_cpu_arch(&self) -> Result<String, Error> {
		Ok("x86_64".to_owned())
	}
}
