//! EFI NVRAM entry management: loader discovery on the ESP, `efibootmgr`
//! output parsing, and entry create/delete.
//!
//! Grounded on `efi_utils.py`'s `BOOTLOADERS_EFI` catalog and
//! `_run_efibootmgr` regex/CSV parsing.
use std::path::{Path, PathBuf};

use log::{debug, warn};
use regex::Regex;

use crate::command::run_once;
use crate::error::Error;

/// Recognized loader basenames, deliberately excluding `bootia32.csv`
/// (ported verbatim from the Python source's catalog).
pub const BOOTLOADERS_EFI: &[&str] = &[
	"bootx64.csv",
	"boot.csv",
	"bootia32.efi",
	"bootx64.efi",
	"bootia64.efi",
	"bootarm.efi",
	"bootaa64.efi",
	"bootriscv32.efi",
	"bootriscv64.efi",
	"bootriscv128.efi",
	"grubaa64.efi",
	"winload.efi",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EfiBootEntry {
	pub boot_num: String,
	pub label: String,
	pub device_path: String,
}

#[derive(Debug, Clone)]
pub struct BootloaderCandidate {
	/// Path relative to the ESP mount point, with backslash separators
	/// for the firmware call.
	pub loader_path: String,
	pub label: String,
}

/// Walk the ESP mount point for recognized loader basenames. If any
/// `.CSV` descriptor is found it is authoritative: return only it.
pub fn discover_candidates(esp_mount: &Path) -> Result<Vec<BootloaderCandidate>, Error> {
	let mut csv_found = None;
	let mut efi_found = Vec::new();
	for entry in walkdir::WalkDir::new(esp_mount).into_iter().filter_map(|e| e.ok()) {
		let Some(name) = entry.file_name().to_str() else { continue };
		let lower = name.to_ascii_lowercase();
		if !BOOTLOADERS_EFI.contains(&lower.as_str()) {
			continue;
		}
		if lower.ends_with(".csv") {
			if csv_found.is_none() {
				csv_found = Some(entry.path().to_path_buf());
			}
		} else {
			efi_found.push(entry.path().to_path_buf());
		}
	}

	if let Some(csv_path) = csv_found {
		return parse_csv_descriptor(esp_mount, &csv_path);
	}

	let mut candidates = Vec::new();
	for (i, path) in efi_found.into_iter().enumerate() {
		let rel = path
			.strip_prefix(esp_mount)
			.unwrap_or(&path)
			.to_string_lossy()
			.replace('/', "\\");
		candidates.push(BootloaderCandidate {
			loader_path: rel,
			label: format!("ironic{}", i + 1),
		});
	}
	Ok(candidates)
}

/// Parse a UTF-16 (LE), optionally BOM-prefixed CSV descriptor with
/// 4 comma-separated fields: `<file>,<label>,<options>,<notes>`. Only
/// fields 1 and 2 matter here.
fn parse_csv_descriptor(esp_mount: &Path, csv_path: &Path) -> Result<Vec<BootloaderCandidate>, Error> {
	let raw = std::fs::read(csv_path)
		.map_err(|e| Error::InstanceDeployFailure(format!("failed to read {}: {e}", csv_path.display())))?;
	let text = decode_utf16le_lossy(&raw);
	let line = text.lines().next().unwrap_or("");
	let fields: Vec<&str> = line.splitn(4, ',').collect();
	let (Some(file), Some(label)) = (fields.first(), fields.get(1)) else {
		return Err(Error::InstanceDeployFailure(format!(
			"CSV descriptor {} is malformed",
			csv_path.display()
		)));
	};
	let csv_dir = csv_path.parent().unwrap_or(esp_mount);
	let loader_abs = csv_dir.join(file.trim());
	let rel = loader_abs
		.strip_prefix(esp_mount)
		.unwrap_or(&loader_abs)
		.to_string_lossy()
		.replace('/', "\\");
	Ok(vec![BootloaderCandidate {
		loader_path: rel,
		label: label.trim().to_owned(),
	}])
}

fn decode_utf16le_lossy(raw: &[u8]) -> String {
	let bytes = if raw.len() >= 2 && raw[0] == 0xFF && raw[1] == 0xFE {
		&raw[2..]
	} else {
		raw
	};
	let units: Vec<u16> = bytes
		.chunks_exact(2)
		.map(|c| u16::from_le_bytes([c[0], c[1]]))
		.collect();
	String::from_utf16_lossy(&units)
}

fn efibootmgr_regex() -> Regex {
	Regex::new(r"Boot([0-9a-fA-F]+)\*?\s+(.*?)\s+((BBS|HD|FvFile|FvVol|PciRoot|VenMsg|VenHw|UsbClass)\(.*)$")
		.expect("static efibootmgr regex is valid")
}

/// Enumerate existing NVRAM entries via `efibootmgr -v`.
pub fn list_entries() -> Result<Vec<EfiBootEntry>, Error> {
	let out = run_once(&["efibootmgr", "-v"])?;
	let text = decode_utf16le_lossy(&out.stdout);
	let text = if text.trim().is_empty() {
		out.stdout_str()
	} else {
		text
	};
	let re = efibootmgr_regex();
	let mut entries = Vec::new();
	for line in text.lines() {
		if let Some(caps) = re.captures(line) {
			entries.push(EfiBootEntry {
				boot_num: caps[1].to_owned(),
				label: caps[2].to_owned(),
				device_path: caps[3].to_owned(),
			});
		}
	}
	Ok(entries)
}

/// Delete every existing entry whose label exactly matches `label`,
/// best-effort (a delete failure is logged, not propagated).
pub fn delete_entries_by_label(label: &str) -> Result<(), Error> {
	for entry in list_entries()? {
		if entry.label == label {
			debug!("Deleting duplicate EFI NVRAM entry Boot{} ({label})", entry.boot_num);
			if let Err(e) = run_once(&["efibootmgr", "-b", &entry.boot_num, "-B"]) {
				warn!("Failed to delete stale NVRAM entry Boot{}: {e}", entry.boot_num);
			}
		}
	}
	Ok(())
}

/// Create an NVRAM entry pointing at `loader_path` on `disk`/`partnum`.
/// Cleans up any pre-existing entry with the same label first, per
/// invariant 7.
pub fn create_entry(disk: &Path, partnum: u32, label: &str, loader_path: &str) -> Result<(), Error> {
	delete_entries_by_label(label)?;
	let disk_str = disk.to_string_lossy().into_owned();
	let partnum_str = partnum.to_string();
	run_once(&[
		"efibootmgr", "-c", "-d", &disk_str, "-p", &partnum_str, "-w", "-L", label, "-l", loader_path,
	])?;
	Ok(())
}

/// Create one entry per holder disk for a software-RAID mirrored ESP,
/// with labels suffixed `(RAID, part<n>)` to keep them distinct.
pub fn create_raid_entries(
	holders: &[(PathBuf, u32)],
	base_label: &str,
	loader_path: &str,
) -> Result<(), Error> {
	for (disk, partnum) in holders {
		let label = format!("{base_label} (RAID, part{partnum})");
		create_entry(disk, *partnum, &label, loader_path)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn scenario_f_parses_and_matches_duplicates() {
		let text = "Boot0004* ironic1\tHD(1,GPT,...)\nBoot0005 ironic1\tHD(1,GPT,...)\n";
		let re = efibootmgr_regex();
		let entries: Vec<_> = text.lines().filter_map(|l| re.captures(l)).collect();
		assert_eq!(entries.len(), 2);
		assert_eq!(&entries[0][1], "0004");
		assert_eq!(&entries[0][2], "ironic1");
		assert_eq!(&entries[1][1], "0005");
	}

	#[test]
	fn bootia32_csv_excluded_from_catalog() {
		assert!(!BOOTLOADERS_EFI.contains(&"bootia32.csv"));
		assert!(BOOTLOADERS_EFI.contains(&"bootia32.efi"));
	}

	#[test]
	fn decode_utf16le_strips_bom() {
		let with_bom: Vec<u8> = vec![0xFF, 0xFE, b'A', 0x00, b'B', 0x00];
		assert_eq!(decode_utf16le_lossy(&with_bom), "AB");
	}

	#[test]
	fn csv_descriptor_parses_fields() {
		let dir = tempfile::tempdir().unwrap();
		let csv_path = dir.path().join("boot.csv");
		let content = "bootx64.efi,My Label,,notes";
		let utf16: Vec<u8> = content
			.encode_utf16()
			.flat_map(|u| u.to_le_bytes())
			.collect();
		std::fs::write(&csv_path, utf16).unwrap();
		let candidates = parse_csv_descriptor(dir.path(), &csv_path).unwrap();
		assert_eq!(candidates.len(), 1);
		assert_eq!(candidates[0].label, "My Label");
		assert_eq!(candidates[0].loader_path, "bootx64.efi");
	}
}
