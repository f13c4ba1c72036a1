//! GRUB2 installation inside a chroot, for both BIOS and UEFI boot modes.
//!
//! Grounded on `utils.rs::run_script_with_chroot`'s bind-mount discipline,
//! adapted from `systemd-nspawn` to a plain `chroot(8)` invocation: the
//! bind mounts here (`/dev`, `/proc`, `/run`, `/sys`, and for UEFI the ESP)
//! are staged by hand as [`crate::command::MountGuard`]s, which would
//! conflict with `systemd-nspawn`'s own mount-namespace management.
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::command::{run, run_once, MountGuard, MountStack, RunOptions};
use crate::error::Error;
use crate::inventory::BootMode;

/// Which GRUB binary family is installed: RHEL/openSUSE-style
/// `grub2-install`/`grub2-mkconfig`, or Debian-style `grub-install`/
/// `grub-mkconfig`.
struct GrubBinaries {
	install: &'static str,
	mkconfig: &'static str,
}

fn resolve_grub_binaries(root: &Path) -> GrubBinaries {
	if root.join("usr/sbin/grub2-install").exists() {
		GrubBinaries {
			install: "grub2-install",
			mkconfig: "grub2-mkconfig",
		}
	} else {
		GrubBinaries {
			install: "grub-install",
			mkconfig: "grub-mkconfig",
		}
	}
}

fn run_in_chroot(root: &Path, argv: &[&str]) -> Result<(), Error> {
	let root_str = root.to_string_lossy().into_owned();
	let mut full: Vec<&str> = vec!["chroot", &root_str];
	full.extend_from_slice(argv);
	let opts = RunOptions::default().with_env("PATH", "/sbin:/bin:/usr/sbin:/usr/bin");
	run(&full, &opts)?;
	Ok(())
}

struct Mounts {
	stack: MountStack,
}

impl Mounts {
	fn stage(root: &Path, esp: Option<&Path>) -> Result<Self, Error> {
		let mut stack = MountStack::new();
		stack.push(MountGuard::mount(Path::new("/dev"), &root.join("dev"), None, &["bind"])?);
		stack.push(MountGuard::mount(Path::new("/proc"), &root.join("proc"), None, &["bind"])?);
		stack.push(MountGuard::mount(Path::new("/run"), &root.join("run"), None, &["bind"])?);
		stack.push(MountGuard::mount(Path::new("none"), &root.join("sys"), Some("sysfs"), &[])?);
		if let Some(esp) = esp {
			let esp_mount = root.join("boot/efi");
			stack.push(MountGuard::mount(esp, &esp_mount, None, &[])?.strict());
		}
		Ok(Mounts { stack })
	}

	/// Unwind in reverse order. The ESP guard is `strict`, so its unmount
	/// failure is fatal since content integrity past that point is unknown;
	/// every other bind-mount guard is best-effort and only logs, matching
	/// §4.4 step 6.
	fn unwind(mut self) -> Result<(), Error> {
		self.stack.unwind()
	}
}

/// Find the root partition's mountpoint-free temp dir, mount it and run
/// GRUB install + config generation. `esp` is `Some` only in UEFI mode.
pub fn install_grub(
	root_partition: &Path,
	esp_partition: Option<&Path>,
	target_device: &Path,
	boot_mode: BootMode,
	prep_partition: Option<&Path>,
) -> Result<(), Error> {
	let tmp = tempfile_dir("bmprovd-grub")?;
	let root_mount = MountGuard::mount(root_partition, &tmp, None, &[])?;
	let root_path = root_mount.path().to_path_buf();

	let esp_mount_src = esp_partition;
	let mounts = Mounts::stage(&root_path, esp_mount_src)?;

	let result = (|| -> Result<(), Error> {
		let grub = resolve_grub_binaries(&root_path);
		let target = prep_partition.unwrap_or(target_device);
		let target_str = target.to_string_lossy().into_owned();

		match boot_mode {
			BootMode::Bios => {
				run_in_chroot(&root_path, &[grub.install, "--target=i386-pc", &target_str])?;
			}
			BootMode::Uefi => {
				run_in_chroot(
					&root_path,
					&[grub.install, "--target=x86_64-efi", "--efi-directory=/boot/efi", "--bootloader-id=ironic"],
				)?;
				if let Err(e) = run_in_chroot(
					&root_path,
					&[
						grub.install,
						"--target=x86_64-efi",
						"--efi-directory=/boot/efi",
						"--bootloader-id=ironic",
						"--removable",
					],
				) {
					warn!("Removable-media GRUB install failed (continuing, NVRAM entry already written): {e}");
				}
			}
		}
		run_in_chroot(&root_path, &[grub.mkconfig, "-o", "/boot/grub/grub.cfg"])?;
		info!("GRUB installed under {}", root_path.display());
		Ok(())
	})();

	mounts.unwind()?;
	drop(root_mount);
	let _ = std::fs::remove_dir(&tmp);
	result
}

fn tempfile_dir(prefix: &str) -> Result<PathBuf, Error> {
	let unique = uuid::Uuid::new_v4();
	let dir = std::env::temp_dir().join(format!("{prefix}-{unique}"));
	std::fs::create_dir_all(&dir)
		.map_err(|e| Error::InstanceDeployFailure(format!("failed to create {}: {e}", dir.display())))?;
	Ok(dir)
}

/// Discover the ESP on a whole-disk image by scanning partition types,
/// used when no `efi_system_part_uuid` was supplied.
pub fn discover_esp(device: &Path) -> Result<Option<PathBuf>, Error> {
	let dev_str = device.to_string_lossy().into_owned();
	let out = run_once(&["blkid", "-t", "PARTLABEL=efi-part", "-o", "device", &dev_str])?;
	let path = out.stdout_str().lines().next().map(|l| PathBuf::from(l.trim()));
	Ok(path)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolve_grub_binaries_defaults_to_debian_style() {
		let dir = tempfile::tempdir().unwrap();
		let bins = resolve_grub_binaries(dir.path());
		assert_eq!(bins.install, "grub-install");
	}

	#[test]
	fn resolve_grub_binaries_prefers_grub2_when_present() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("usr/sbin")).unwrap();
		std::fs::write(dir.path().join("usr/sbin/grub2-install"), b"").unwrap();
		let bins = resolve_grub_binaries(dir.path());
		assert_eq!(bins.install, "grub2-install");
	}
}
